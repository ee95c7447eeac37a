//! Workflows: ordinary code that creates tasks through a
//! [`CollectionContext`], from which the dependency graph is recovered.
//!
//! Workflows and the functions their tasks call are looked up in a
//! [`WorkflowRegistry`] by script file name. A `.toml` script that is not
//! registered is read as a [`TomlWorkflow`].

mod cache;
mod context;
mod value;

pub use cache::Cached;
pub use context::{CollectionContext, Mode, ResourceScope, RunHandle, RunSpec};
pub use value::{Accessor, Comparison, Value};

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::dag::DependencyGraph;
use crate::core::task::Task;
use crate::{mqlog, mqlog_debug, Error, Result};

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Complete,
    /// The workflow branched on the result of this task; collection
    /// stops here until it is done.
    NeedsRealValue(PathBuf),
}

impl Comparison {
    /// The step to return when this comparison can't be decided yet.
    pub fn stop(&self) -> Option<Step> {
        match self {
            Comparison::NeedsRealValue(task) => Some(Step::NeedsRealValue(task.clone())),
            _ => None,
        }
    }
}

pub trait Workflow {
    fn run(&self, ctx: &mut CollectionContext<'_>) -> Result<Step>;
}

impl<F> Workflow for F
where
    F: Fn(&mut CollectionContext<'_>) -> Result<Step>,
{
    fn run(&self, ctx: &mut CollectionContext<'_>) -> Result<Step> {
        self(ctx)
    }
}

pub type TaskFunction =
    dyn Fn(&[serde_json::Value], &BTreeMap<String, serde_json::Value>) -> Result<serde_json::Value>;

#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Box<dyn Workflow>>,
    functions: HashMap<String, Box<TaskFunction>>,
}

/// A workflow found for a script.
pub enum Resolved<'r> {
    Registered(&'r dyn Workflow),
    File(TomlWorkflow),
}

impl Resolved<'_> {
    pub fn get(&self) -> &dyn Workflow {
        match self {
            Resolved::Registered(workflow) => *workflow,
            Resolved::File(workflow) => workflow,
        }
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under a script file name such as `flow.py`.
    pub fn register_workflow(&mut self, script: &str, workflow: impl Workflow + 'static) {
        self.workflows.insert(script.to_string(), Box::new(workflow));
    }

    pub fn register_function<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[serde_json::Value], &BTreeMap<String, serde_json::Value>) -> Result<serde_json::Value>
            + 'static,
    {
        self.functions.insert(name.to_string(), Box::new(function));
    }

    pub fn call(
        &self,
        name: &str,
        args: &[serde_json::Value],
        kwargs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| Error::Workflow(format!("No function named {:?}", name)))?;
        function(args, kwargs)
    }

    pub fn workflow(&self, script: &Path) -> Result<Resolved<'_>> {
        let key = script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(workflow) = self.workflows.get(&key) {
            return Ok(Resolved::Registered(workflow.as_ref()));
        }
        if script.extension().is_some_and(|ext| ext == "toml") {
            return Ok(Resolved::File(TomlWorkflow::load(script)?));
        }
        Err(Error::Workflow(format!(
            "No workflow registered for {}",
            script.display()
        )))
    }
}

/// Run a workflow in collect mode and return the tasks it creates.
pub fn collect(
    registry: &WorkflowRegistry,
    workflow: &dyn Workflow,
    script: &str,
    folder: &Path,
) -> Result<Vec<Task>> {
    let mut ctx = CollectionContext::new(registry, script, folder, Mode::Collect);
    if let Step::NeedsRealValue(task) = workflow.run(&mut ctx)? {
        mqlog_debug!(
            "Stopped collecting in {}: waiting for {}",
            folder.display(),
            task.display()
        );
    }
    Ok(ctx.into_tasks())
}

/// Run the single task `name` of a workflow for real.
pub fn run_workflow_function(
    registry: &WorkflowRegistry,
    script: &Path,
    folder: &Path,
    name: &str,
) -> Result<Value> {
    let resolved = registry.workflow(script)?;
    let script_name = script.to_string_lossy();
    let mut ctx = CollectionContext::new(registry, &script_name, folder, Mode::Target(name.to_string()));
    let step = resolved.get().run(&mut ctx)?;
    match ctx.target_result() {
        Some(value) => Ok(value.clone()),
        None => Err(Error::Workflow(match step {
            Step::NeedsRealValue(task) => format!(
                "Can't reach {} before {} is done",
                name,
                task.display()
            ),
            Step::Complete => format!("No task named {} in {}", name, script.display()),
        })),
    }
}

/// Collect the tasks of a workflow in every folder.
///
/// With `targets`, only tasks with those names and what they depend on are
/// kept. Tasks with a `.SKIP` marker are dropped.
pub fn workflow_tasks(
    registry: &WorkflowRegistry,
    script: &Path,
    folders: &[PathBuf],
    targets: &[String],
) -> Result<Vec<Task>> {
    let resolved = registry.workflow(script)?;
    let script_name = script.to_string_lossy();
    let mut tasks = Vec::new();
    for folder in folders {
        tasks.extend(collect(registry, resolved.get(), &script_name, folder)?);
    }

    if !targets.is_empty() {
        let graph = DependencyGraph::new(&tasks)?;
        let roots: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| {
                targets
                    .iter()
                    .any(|target| *target == task.name() || *target == task.cmd.short_name())
            })
            .map(|(i, _)| i)
            .collect();
        let keep: HashSet<usize> = graph.ancestors(&roots).into_iter().collect();
        tasks = tasks
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, task)| task)
            .collect();
    }

    let before = tasks.len();
    tasks.retain(|task| !task.skip());
    if tasks.len() < before {
        mqlog!("Skipping {} tasks with SKIP markers", before - tasks.len());
    }
    Ok(tasks)
}

/// A workflow written as a list of `[[task]]` tables.
///
/// ```toml
/// [[task]]
/// cmd = "prepare.py"
///
/// [[task]]
/// cmd = "shell:analyse"
/// deps = ["prepare.py"]
/// resources = "8:1h"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlWorkflow {
    #[serde(default, rename = "task")]
    tasks: Vec<TomlTask>,
}

#[derive(Debug, Clone, Deserialize)]
struct TomlTask {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    name: Option<String>,
    resources: Option<String>,
    cores: Option<u32>,
    tmax: Option<String>,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    creates: Vec<String>,
    restart: Option<u32>,
    #[serde(default)]
    diskspace: u64,
}

impl TomlWorkflow {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}

impl Workflow for TomlWorkflow {
    fn run(&self, ctx: &mut CollectionContext<'_>) -> Result<Step> {
        for entry in &self.tasks {
            let mut spec = RunSpec::new();
            spec = if let Some(cmd) = entry.cmd.strip_prefix("shell:") {
                spec.shell(cmd)
            } else if entry.cmd.ends_with(".py") || entry.cmd.contains('/') {
                spec.script(&entry.cmd)
            } else {
                spec.module(&entry.cmd)
            };
            spec = spec.args(entry.args.iter().map(|arg| Value::known(arg.as_str())));
            if let Some(name) = &entry.name {
                spec = spec.name(name);
            }
            if let Some(resources) = &entry.resources {
                spec = spec.resources(resources);
            }
            if let Some(cores) = entry.cores {
                spec = spec.cores(cores);
            }
            if let Some(tmax) = &entry.tmax {
                spec = spec.tmax(tmax);
            }
            if let Some(restart) = entry.restart {
                spec = spec.restart(restart);
            }
            for dep in &entry.deps {
                spec = spec.dep(dep);
            }
            for pattern in &entry.creates {
                spec = spec.creates(pattern);
            }
            ctx.run(spec.diskspace(entry.diskspace))?;
        }
        Ok(Step::Complete)
    }
}
