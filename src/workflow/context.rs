//! The context a workflow runs against.
//!
//! A workflow calls [`CollectionContext::run`] once per task. In collect
//! mode nothing runs: each call records a [`Task`] and hands back a
//! symbolic result, so passing one task's result to another records the
//! dependency. In target mode the single task named by the target runs for
//! real and every later `run` call is inert.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::config::Interpreters;
use crate::core::command::{create_command, Command, CommandKind, CommandType};
use crate::core::task::{resolve_dep, ResourceArgs, Task};
use crate::scheduler::{check_output, CommandRunner, SystemRunner};
use crate::workflow::cache::Cached;
use crate::workflow::value::Value;
use crate::workflow::WorkflowRegistry;
use crate::{mqlog, mqlog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Collect,
    /// Run the task with this name for real.
    Target(String),
}

/// Defaults applied to every task created inside a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceScope {
    pub resources: ResourceArgs,
    pub restart: Option<u32>,
}

impl ResourceScope {
    pub fn tmax(mut self, tmax: &str) -> Self {
        self.resources.tmax = Some(tmax.to_string());
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.resources.cores = Some(cores);
        self
    }

    pub fn nodename(mut self, nodename: &str) -> Self {
        self.resources.nodename = Some(nodename.to_string());
        self
    }

    pub fn processes(mut self, processes: u32) -> Self {
        self.resources.processes = Some(processes);
        self
    }

    pub fn restart(mut self, restart: u32) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Wrap a workflow step so it always runs inside this scope.
    pub fn decorate<T, F>(self, f: F) -> impl Fn(&mut CollectionContext<'_>) -> Result<T>
    where
        F: Fn(&mut CollectionContext<'_>) -> Result<T>,
    {
        move |ctx| ctx.with_resources(self.clone(), &f)
    }
}

/// What a single `run` call should create.
///
/// Exactly one of function, script, module or shell must be set.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    function: Option<String>,
    script: Option<String>,
    module: Option<String>,
    shell: Option<String>,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    name: Option<String>,
    folder: Option<PathBuf>,
    creates: Vec<String>,
    restart: Option<u32>,
    diskspace: u64,
    resources: ResourceArgs,
    deps: Vec<String>,
}

impl RunSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// A function registered with the [`WorkflowRegistry`].
    pub fn function(mut self, name: &str) -> Self {
        self.function = Some(name.to_string());
        self
    }

    pub fn script(mut self, script: &str) -> Self {
        self.script = Some(script.to_string());
        self
    }

    pub fn module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }

    pub fn shell(mut self, cmd: &str) -> Self {
        self.shell = Some(cmd.to_string());
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Relative folders are taken from the workflow folder.
    pub fn folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn creates(mut self, pattern: &str) -> Self {
        self.creates.push(pattern.to_string());
        self
    }

    pub fn restart(mut self, restart: u32) -> Self {
        self.restart = Some(restart);
        self
    }

    pub fn diskspace(mut self, diskspace: u64) -> Self {
        self.diskspace = diskspace;
        self
    }

    /// Full resource string such as `8:xeon8:2h`.
    pub fn resources(mut self, resources: &str) -> Self {
        self.resources.resources = Some(resources.to_string());
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.resources.cores = Some(cores);
        self
    }

    pub fn nodename(mut self, nodename: &str) -> Self {
        self.resources.nodename = Some(nodename.to_string());
        self
    }

    pub fn processes(mut self, processes: u32) -> Self {
        self.resources.processes = Some(processes);
        self
    }

    pub fn tmax(mut self, tmax: &str) -> Self {
        self.resources.tmax = Some(tmax.to_string());
        self
    }

    /// Depend on a finished or collected task.
    pub fn after(mut self, handle: &RunHandle) -> Self {
        self.deps.push(handle.dname.to_string_lossy().into_owned());
        self
    }

    /// Depend on a task by name, relative to this task's folder.
    pub fn dep(mut self, name: &str) -> Self {
        self.deps.push(name.to_string());
        self
    }

    fn sources(&self) -> usize {
        [&self.function, &self.script, &self.module, &self.shell]
            .iter()
            .filter(|source| source.is_some())
            .count()
    }
}

/// What `run` hands back to the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    dname: PathBuf,
    name: String,
    result: Value,
    done: bool,
}

impl RunHandle {
    pub fn dname(&self) -> &Path {
        &self.dname
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Symbolic until the task has a cached or real result.
    pub fn result(&self) -> Value {
        self.result.clone()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

pub struct CollectionContext<'a> {
    registry: &'a WorkflowRegistry,
    script: String,
    folder: PathBuf,
    mode: Mode,
    tasks: Vec<Task>,
    scopes: Vec<ResourceScope>,
    dependencies: Vec<PathBuf>,
    finished: Option<Value>,
    runner: Box<dyn CommandRunner>,
    interpreters: Interpreters,
}

impl<'a> CollectionContext<'a> {
    pub fn new(registry: &'a WorkflowRegistry, script: &str, folder: &Path, mode: Mode) -> Self {
        Self {
            registry,
            script: script.to_string(),
            folder: folder.to_path_buf(),
            mode,
            tasks: Vec::new(),
            scopes: Vec::new(),
            dependencies: Vec::new(),
            finished: None,
            runner: Box::new(SystemRunner),
            interpreters: Interpreters::default(),
        }
    }

    pub fn with_runner(mut self, runner: Box<dyn CommandRunner>, interpreters: Interpreters) -> Self {
        self.runner = runner;
        self.interpreters = interpreters;
        self
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    /// The target ran; later `run` calls do nothing.
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Result of the target task, once it ran.
    pub fn target_result(&self) -> Option<&Value> {
        self.finished.as_ref()
    }

    /// Record (or in target mode maybe execute) one task.
    pub fn run(&mut self, spec: RunSpec) -> Result<RunHandle> {
        if spec.sources() != 1 {
            return Err(Error::Workflow(
                "Exactly one of function, script, module or shell must be given".to_string(),
            ));
        }
        let task = self.build_task(&spec)?;
        let dname = task.dname();
        let name = task.name();

        if self.is_finished() {
            return Ok(RunHandle {
                dname,
                name,
                result: Value::default(),
                done: false,
            });
        }

        if self.mode == Mode::Target(name.clone()) {
            let result = self.execute(&spec, &task)?;
            mqlog!("Ran {}", dname.display());
            self.finished = Some(result.clone());
            return Ok(RunHandle {
                dname,
                name,
                result,
                done: true,
            });
        }

        let cache = Cached::for_task(&task);
        let (result, done) = if spec.function.is_some() && cache.has() {
            (Value::Known(cache.read()?), true)
        } else {
            (Value::symbolic(dname.clone()), false)
        };
        mqlog_debug!("Collected {} (deps: {})", dname.display(), task.deps.len());
        if self.mode == Mode::Collect {
            self.tasks.push(task);
        }
        Ok(RunHandle {
            dname,
            name,
            result,
            done,
        })
    }

    /// Everything created inside `f` depends on `handle`.
    pub fn with_dependency<T>(
        &mut self,
        handle: &RunHandle,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.dependencies.push(handle.dname.clone());
        let result = f(self);
        self.dependencies.pop();
        result
    }

    /// Run `f` with `scope` as resource defaults. Inner scopes override
    /// outer ones key by key.
    pub fn with_resources<T>(
        &mut self,
        scope: ResourceScope,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.scopes.push(scope);
        let result = f(self);
        self.scopes.pop();
        result
    }

    fn scope_defaults(&self) -> ResourceScope {
        self.scopes
            .iter()
            .fold(ResourceScope::default(), |outer, inner| ResourceScope {
                resources: inner.resources.or(&outer.resources),
                restart: inner.restart.or(outer.restart),
            })
    }

    fn build_task(&self, spec: &RunSpec) -> Result<Task> {
        let folder = match &spec.folder {
            Some(folder) if folder.is_absolute() => folder.clone(),
            Some(folder) => resolve_dep(&self.folder, &folder.to_string_lossy()),
            None => self.folder.clone(),
        };

        let mut deps: BTreeSet<PathBuf> = spec
            .args
            .iter()
            .chain(spec.kwargs.values())
            .flat_map(Value::dependencies)
            .collect();
        deps.extend(self.dependencies.iter().cloned());
        deps.extend(spec.deps.iter().map(|dep| resolve_dep(&folder, dep)));

        let cmd = self.build_command(spec)?;
        let defaults = self.scope_defaults();
        let resources = spec.resources.or(&defaults.resources).resolve(&cmd, &folder)?;

        let mut task = Task::new(cmd, resources, folder);
        task.deps = deps;
        task.workflow = true;
        task.restart = spec.restart.or(defaults.restart).unwrap_or(0);
        task.diskspace = spec.diskspace;
        task.creates = spec.creates.clone();
        Ok(task)
    }

    fn build_command(&self, spec: &RunSpec) -> Result<Command> {
        if let Some(function) = &spec.function {
            // Arguments stay out of the name: they may only become known
            // after collection, and the name must match in target mode.
            let task = spec.name.clone().unwrap_or_else(|| function.clone());
            return Ok(Command::new(
                CommandKind::WorkflowTask {
                    script: self.script.clone(),
                    task,
                },
                Vec::new(),
            ));
        }

        let args = spec
            .args
            .iter()
            .map(|arg| {
                arg.to_arg().ok_or_else(|| {
                    Error::Workflow(format!(
                        "{} can only be passed to a function task",
                        arg
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let name = spec.name.as_deref();
        if let Some(cmd) = &spec.shell {
            let mut command = Command::new(CommandKind::Shell { cmd: cmd.clone() }, args);
            if let Some(name) = name {
                command.set_non_standard_name(name);
            }
            Ok(command)
        } else if let Some(module) = &spec.module {
            create_command(module, args, Some(CommandType::PythonModule), name)
        } else {
            let script = spec.script.as_deref().unwrap_or_default();
            create_command(script, args, None, name)
        }
    }

    fn execute(&self, spec: &RunSpec, task: &Task) -> Result<Value> {
        if let Some(function) = &spec.function {
            let args = resolve_all(spec.args.iter())?;
            let kwargs = spec
                .kwargs
                .iter()
                .map(|(key, value)| Ok((key.clone(), resolve_one(value)?)))
                .collect::<Result<BTreeMap<_, _>>>()?;
            let result = self.registry.call(function, &args, &kwargs)?;
            Cached::for_task(task).write(&result)?;
            return Ok(Value::Known(result));
        }

        let line = task.cmd.invocation(&self.interpreters, task.resources.processes());
        let script = format!("cd {} && {}", shell_quote(&task.folder), line);
        let stdout = check_output(&*self.runner, "sh", &["-c".to_string(), script], None)?;
        Ok(Value::known(stdout))
    }
}

fn resolve_one(value: &Value) -> Result<serde_json::Value> {
    value.resolved().ok_or_else(|| {
        Error::Workflow(format!("{} has not been computed yet", value))
    })
}

fn resolve_all<'v>(values: impl Iterator<Item = &'v Value>) -> Result<Vec<serde_json::Value>> {
    values.map(resolve_one).collect()
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CommandOutput;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register_function("double", |args, _| {
            Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
        });
        registry
    }

    #[test]
    fn test_symbolic_args_become_deps() {
        let registry = registry();
        let temp = TempDir::new().unwrap();
        let mut ctx = CollectionContext::new(&registry, "flow.py", temp.path(), Mode::Collect);
        let a = ctx.run(RunSpec::new().function("double").arg(Value::known(2))).unwrap();
        let b = ctx
            .run(RunSpec::new().function("double").name("again").arg(a.result().field("x")))
            .unwrap();
        assert!(!a.is_done());
        assert_eq!(a.name(), "double");
        assert_eq!(b.name(), "again");

        let tasks = ctx.into_tasks();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.workflow));
        assert_eq!(tasks[1].deps.iter().collect::<Vec<_>>(), vec![&temp.path().join("double")]);
    }

    #[test]
    fn test_function_name_ignores_argument_values() {
        let registry = registry();
        let temp = TempDir::new().unwrap();
        let mut ctx = CollectionContext::new(&registry, "flow.py", temp.path(), Mode::Collect);
        let pending = ctx
            .run(RunSpec::new().function("double").arg(Value::symbolic(temp.path().join("prep"))))
            .unwrap();
        let mut later = CollectionContext::new(&registry, "flow.py", temp.path(), Mode::Collect);
        let known = later.run(RunSpec::new().function("double").arg(Value::known(7))).unwrap();
        assert_eq!(pending.dname(), known.dname());
        assert_eq!(ctx.tasks()[0].cmd.args(), later.tasks()[0].cmd.args());
    }

    #[test]
    fn test_exactly_one_source() {
        let registry = registry();
        let mut ctx = CollectionContext::new(&registry, "flow.py", Path::new("/w"), Mode::Collect);
        assert!(matches!(ctx.run(RunSpec::new()), Err(Error::Workflow(_))));
        assert!(matches!(
            ctx.run(RunSpec::new().shell("true").module("m")),
            Err(Error::Workflow(_))
        ));
    }

    #[test]
    fn test_mixing_resources_string_and_keywords() {
        let registry = registry();
        let mut ctx = CollectionContext::new(&registry, "flow.py", Path::new("/w"), Mode::Collect);
        let err = ctx
            .run(RunSpec::new().shell("true").resources("8:1h").cores(4))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_nested_scopes_and_dependency_stack() {
        let registry = registry();
        let mut ctx = CollectionContext::new(&registry, "flow.py", Path::new("/w"), Mode::Collect);
        let first = ctx.run(RunSpec::new().shell("echo 1")).unwrap();
        ctx.with_resources(ResourceScope::default().cores(8).restart(2), |ctx| {
            ctx.with_resources(ResourceScope::default().tmax("2h"), |ctx| {
                ctx.with_dependency(&first, |ctx| ctx.run(RunSpec::new().shell("echo 2")))
            })
        })
        .unwrap();
        ctx.run(RunSpec::new().shell("echo 3")).unwrap();

        let tasks = ctx.tasks();
        assert_eq!(tasks[1].resources.cores(), 8);
        assert_eq!(tasks[1].resources.tmax(), 7200);
        assert_eq!(tasks[1].restart, 2);
        assert!(tasks[1].deps.contains(first.dname()));
        assert_eq!(tasks[2].resources.cores(), 1);
        assert!(tasks[2].deps.is_empty());
    }

    #[test]
    fn test_decorated_step_runs_in_scope() {
        let registry = registry();
        let mut ctx = CollectionContext::new(&registry, "flow.py", Path::new("/w"), Mode::Collect);
        let step = ResourceScope::default()
            .processes(4)
            .decorate(|ctx: &mut CollectionContext<'_>| ctx.run(RunSpec::new().module("gpaw.relax")));
        step(&mut ctx).unwrap();
        assert_eq!(ctx.tasks()[0].resources.processes(), 4);
    }

    #[test]
    fn test_cached_result_is_returned() {
        let registry = registry();
        let temp = TempDir::new().unwrap();
        Cached::new(temp.path(), "double").write(&json!(4)).unwrap();
        let mut ctx = CollectionContext::new(&registry, "flow.py", temp.path(), Mode::Collect);
        let a = ctx.run(RunSpec::new().function("double").arg(Value::known(2))).unwrap();
        assert!(a.is_done());
        assert_eq!(a.result(), Value::known(4));
        let b = ctx
            .run(RunSpec::new().function("double").name("twice").arg(a.result()))
            .unwrap();
        assert_eq!(b.name(), "twice");
        assert!(!b.is_done());
        assert!(ctx.tasks()[1].deps.is_empty());
    }

    #[test]
    fn test_target_runs_function_once() {
        let registry = registry();
        let temp = TempDir::new().unwrap();
        let mut ctx = CollectionContext::new(
            &registry,
            "flow.py",
            temp.path(),
            Mode::Target("three".to_string()),
        );
        ctx.run(RunSpec::new().function("double").name("one").arg(Value::known(1))).unwrap();
        let hit = ctx
            .run(RunSpec::new().function("double").name("three").arg(Value::known(3)))
            .unwrap();
        let after = ctx
            .run(RunSpec::new().function("double").name("five").arg(Value::known(5)))
            .unwrap();

        assert_eq!(hit.result(), Value::known(6));
        assert!(ctx.is_finished());
        assert!(!after.is_done());
        assert!(ctx.tasks().is_empty());
        assert_eq!(Cached::new(temp.path(), "three").read().unwrap(), json!(6));
        assert!(!temp.path().join("one.done").exists());
    }

    #[test]
    fn test_target_shell_task_goes_through_runner() {
        struct Recording(Rc<RefCell<Vec<String>>>);
        impl CommandRunner for Recording {
            fn run(&self, _: &str, args: &[String], _: Option<&str>) -> Result<CommandOutput> {
                self.0.borrow_mut().push(args.join(" "));
                Ok(CommandOutput {
                    code: 0,
                    stdout: "ok\n".to_string(),
                    stderr: String::new(),
                })
            }
        }
        let calls = Rc::new(RefCell::new(Vec::new()));
        let registry = registry();
        let mut ctx = CollectionContext::new(
            &registry,
            "flow.py",
            Path::new("/w"),
            Mode::Target("shell:echo+hi".to_string()),
        )
        .with_runner(Box::new(Recording(calls.clone())), Interpreters::default());
        let handle = ctx.run(RunSpec::new().shell("echo").arg(Value::known("hi"))).unwrap();
        assert_eq!(handle.result(), Value::known("ok\n"));
        assert_eq!(calls.borrow()[0], "-c cd '/w' && echo hi");
    }
}
