//! Values flowing between workflow tasks.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// One step into a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    Field(String),
    Index(usize),
}

/// A task result during collection.
///
/// `Symbolic` stands for the output of a task that has not run yet. Field
/// and index access on it only extends the access path, so
/// `result.field("x").index(0)` still points at the same task.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Known(serde_json::Value),
    Symbolic { task: PathBuf, path: Vec<Accessor> },
    Seq(Vec<Value>),
}

/// Outcome of comparing two values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Ordered(Ordering),
    /// Both known but of kinds that don't order (object vs number, ...).
    Incomparable,
    /// A real result of this task is needed before the workflow can branch.
    NeedsRealValue(PathBuf),
}

impl Value {
    pub fn known(value: impl Into<serde_json::Value>) -> Self {
        Value::Known(value.into())
    }

    pub fn symbolic(task: PathBuf) -> Self {
        Value::Symbolic {
            task,
            path: Vec::new(),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        match self {
            Value::Known(_) => false,
            Value::Symbolic { .. } => true,
            Value::Seq(items) => items.iter().any(Value::is_symbolic),
        }
    }

    pub fn as_known(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Known(value) => Some(value),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Known(value) => Value::Known(value.get(name).cloned().unwrap_or_default()),
            Value::Symbolic { task, path } => {
                let mut path = path.clone();
                path.push(Accessor::Field(name.to_string()));
                Value::Symbolic {
                    task: task.clone(),
                    path,
                }
            }
            Value::Seq(_) => Value::Known(serde_json::Value::Null),
        }
    }

    pub fn index(&self, i: usize) -> Value {
        match self {
            Value::Known(value) => Value::Known(value.get(i).cloned().unwrap_or_default()),
            Value::Symbolic { task, path } => {
                let mut path = path.clone();
                path.push(Accessor::Index(i));
                Value::Symbolic {
                    task: task.clone(),
                    path,
                }
            }
            Value::Seq(items) => items
                .get(i)
                .cloned()
                .unwrap_or(Value::Known(serde_json::Value::Null)),
        }
    }

    /// Compare without ever guessing at a symbolic value.
    pub fn compare(&self, other: &Value) -> Comparison {
        if let Some(task) = self.first_symbolic().or_else(|| other.first_symbolic()) {
            return Comparison::NeedsRealValue(task);
        }
        match (self.resolved(), other.resolved()) {
            (Some(a), Some(b)) => compare_json(&a, &b),
            _ => Comparison::Incomparable,
        }
    }

    /// Tasks whose results this value is built from.
    pub fn dependencies(&self) -> BTreeSet<PathBuf> {
        let mut deps = BTreeSet::new();
        self.collect_dependencies(&mut deps);
        deps
    }

    fn collect_dependencies(&self, deps: &mut BTreeSet<PathBuf>) {
        match self {
            Value::Known(_) => {}
            Value::Symbolic { task, .. } => {
                deps.insert(task.clone());
            }
            Value::Seq(items) => items.iter().for_each(|item| item.collect_dependencies(deps)),
        }
    }

    fn first_symbolic(&self) -> Option<PathBuf> {
        self.dependencies().into_iter().next()
    }

    /// The plain JSON form, if nothing in it is symbolic.
    pub fn resolved(&self) -> Option<serde_json::Value> {
        match self {
            Value::Known(value) => Some(value.clone()),
            Value::Symbolic { .. } => None,
            Value::Seq(items) => items
                .iter()
                .map(Value::resolved)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
        }
    }

    /// Command-line form of a known value. Strings go in bare.
    pub fn to_arg(&self) -> Option<String> {
        match self.resolved()? {
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }
}

fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Comparison {
    use serde_json::Value as J;
    let ordering = match (a, b) {
        (J::Number(x), J::Number(y)) => x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
        (J::String(x), J::String(y)) => Some(x.cmp(y)),
        (J::Bool(x), J::Bool(y)) => Some(x.cmp(y)),
        (J::Null, J::Null) => Some(Ordering::Equal),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    };
    ordering.map_or(Comparison::Incomparable, Comparison::Ordered)
}

impl Default for Value {
    fn default() -> Self {
        Value::Known(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Known(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Known(value) => write!(f, "{}", value),
            Value::Symbolic { task, path } => {
                write!(f, "<result of {}>", task.display())?;
                for step in path {
                    match step {
                        Accessor::Field(name) => write!(f, ".{}", name)?,
                        Accessor::Index(i) => write!(f, "[{}]", i)?,
                    }
                }
                Ok(())
            }
            Value::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
