//! Task data model and state machine.
//!
//! A task is a [`Command`] plus [`Resources`], a folder and the dependency
//! keys (`dname`s) of the tasks it waits for. Completion is tracked in two
//! places: the queue state (driven by backend polling and change files) and
//! marker files in the task folder. [`reconcile`] merges the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::core::command::{create_command, Command, CommandType};
use crate::core::resources::{parse_time, Resources, DEFAULT_TMAX};
use crate::scheduler::Scheduler;
use crate::{mqlog_debug, Error, Result};

/// Lower-cased substrings that mark the interesting line of an error file.
const ERROR_MARKERS: [&str; 4] = ["error:", "memoryerror", "malloc", "out of memory"];

/// Columns of `log.csv`.
pub const CSV_HEADER: &str = "id,folder,cmd,name,resources,state,restart,workflow,diskspace,\
deps,creates,tqueued,trunning,tstop,error,memory_usage";

const CSV_COLUMNS: usize = 16;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum TaskState {
    #[default]
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "hold")]
    Hold,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "MEMORY")]
    Memory,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Queued,
        TaskState::Hold,
        TaskState::Running,
        TaskState::Done,
        TaskState::Failed,
        TaskState::Canceled,
        TaskState::Timeout,
        TaskState::Memory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Hold => "hold",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "FAILED",
            TaskState::Canceled => "CANCELED",
            TaskState::Timeout => "TIMEOUT",
            TaskState::Memory => "MEMORY",
        }
    }

    /// Single-letter code used by selection and `modify`.
    pub fn code(&self) -> char {
        match self {
            TaskState::Queued => 'q',
            TaskState::Hold => 'h',
            TaskState::Running => 'r',
            TaskState::Done => 'd',
            TaskState::Failed => 'F',
            TaskState::Canceled => 'C',
            TaskState::Timeout => 'T',
            TaskState::Memory => 'M',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == c)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Queued, on hold or running: the backend should know the job.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Hold | TaskState::Running)
    }

    /// Terminal and not `done`.
    pub fn is_unsuccessful(&self) -> bool {
        self.is_terminal() && *self != TaskState::Done
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Hold | Running | Canceled)
                | (Hold, Queued | Canceled)
                | (Running, Done | Failed | Canceled | Timeout | Memory)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = Error;

    /// Accepts the full name (`FAILED`, `done`) or the single-letter code.
    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if let Some(state) = TaskState::from_code(c) {
                return Ok(state);
            }
        }
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("Unknown state: {}", s)))
    }
}

/// Marker files found in a task folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Markers {
    pub done: bool,
    pub failed: bool,
}

/// Outcome of merging backend knowledge with marker files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    Done,
    Failed,
    Canceled,
}

/// Decide what happened to a task.
///
/// A terminal task, or an active one the backend still knows, is left
/// alone. An active task the backend has forgotten finished in one of
/// three ways, and only the markers can tell which.
pub fn reconcile(task: &Task, backend_knows: bool, markers: Markers) -> Reconciliation {
    if task.state.is_terminal() || backend_knows {
        return Reconciliation::Unchanged;
    }
    if markers.done {
        Reconciliation::Done
    } else if markers.failed {
        Reconciliation::Failed
    } else {
        Reconciliation::Canceled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub cmd: Command,
    pub resources: Resources,
    /// Dependency keys: `dname`s of other tasks.
    #[serde(default)]
    pub deps: BTreeSet<PathBuf>,
    pub folder: PathBuf,
    /// Created by a workflow script.
    #[serde(default)]
    pub workflow: bool,
    /// Remaining automatic restarts after TIMEOUT/MEMORY.
    #[serde(default)]
    pub restart: u32,
    #[serde(default)]
    pub diskspace: u64,
    /// Glob patterns that must all match for the task to count as done.
    #[serde(default)]
    pub creates: Vec<String>,
    #[serde(default)]
    state: TaskState,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub memory_usage: u64,
    #[serde(default)]
    pub tqueued: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trunning: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tstop: Option<DateTime<Utc>>,
    /// Backend ids of unfinished dependencies, filled right before submission.
    #[serde(skip)]
    pub dependency_ids: Vec<u64>,
    #[serde(skip)]
    pub activation_script: Option<PathBuf>,
}

impl Task {
    pub fn new(cmd: Command, resources: Resources, folder: PathBuf) -> Self {
        Self {
            cmd,
            resources,
            deps: BTreeSet::new(),
            folder,
            workflow: false,
            restart: 0,
            diskspace: 0,
            creates: Vec::new(),
            state: TaskState::Queued,
            id: 0,
            error: String::new(),
            memory_usage: 0,
            tqueued: None,
            trunning: None,
            tstop: None,
            dependency_ids: Vec::new(),
            activation_script: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn name(&self) -> String {
        self.cmd.name()
    }

    /// Identity key: `folder/name`.
    pub fn dname(&self) -> PathBuf {
        self.folder.join(self.cmd.name())
    }

    /// Name usable as a single file name component.
    pub fn fs_name(&self) -> String {
        self.cmd.name().replace('/', "\\")
    }

    fn marker(&self, suffix: &str) -> PathBuf {
        self.folder.join(format!("{}.{}", self.fs_name(), suffix))
    }

    pub fn done_file(&self) -> PathBuf {
        self.marker("done")
    }

    pub fn failed_file(&self) -> PathBuf {
        self.marker("FAILED")
    }

    /// True if every `creates` pattern matches, or (with no patterns) the
    /// `.done` marker exists.
    pub fn is_done(&self) -> bool {
        if self.creates.is_empty() {
            return self.done_file().is_file();
        }
        let folder = glob::Pattern::escape(&self.folder.to_string_lossy());
        self.creates.iter().all(|pattern| {
            glob::glob(&format!("{}/{}", folder, pattern))
                .map(|mut paths| paths.any(|p| p.is_ok()))
                .unwrap_or(false)
        })
    }

    pub fn has_failed(&self) -> bool {
        self.failed_file().is_file()
    }

    /// A `.SKIP` marker means: never (re)submit.
    pub fn skip(&self) -> bool {
        self.marker("SKIP").is_file()
    }

    pub fn markers(&self) -> Markers {
        Markers {
            done: self.is_done(),
            failed: self.has_failed(),
        }
    }

    /// Write an empty `.done` marker for workflow tasks without `creates`.
    /// An existing file (maybe a cached result) is left untouched.
    pub fn write_done_file(&self) -> Result<()> {
        if !self.workflow || !self.creates.is_empty() {
            return Ok(());
        }
        let path = self.done_file();
        if path.exists() || !self.folder.is_dir() {
            return Ok(());
        }
        fs::write(&path, "")?;
        Ok(())
    }

    pub fn write_failed_file(&self) -> Result<()> {
        if !self.workflow || !self.folder.is_dir() {
            return Ok(());
        }
        fs::write(self.failed_file(), "")?;
        Ok(())
    }

    pub fn remove_failed_file(&self) -> Result<()> {
        match fs::remove_file(self.failed_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_state(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Move to `next` and stamp the matching timestamp.
    ///
    /// A queued or held task that already finished passes through
    /// `running` first (its start was never observed).
    pub fn advance(&mut self, next: TaskState, at: DateTime<Utc>) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if self.state != TaskState::Running
            && TaskState::Running.can_transition_to(next)
            && next != TaskState::Canceled
        {
            if self.state == TaskState::Hold {
                self.set_state(TaskState::Queued)?;
            }
            self.set_state(TaskState::Running)?;
            self.trunning.get_or_insert(at);
        }
        self.set_state(next)?;
        match next {
            TaskState::Running => self.trunning = Some(at),
            state if state.is_terminal() => self.tstop = Some(at),
            _ => {}
        }
        Ok(())
    }

    /// Refine a FAILED task into MEMORY or TIMEOUT.
    pub fn reclassify(&mut self, kind: TaskState) -> Result<()> {
        if self.state != TaskState::Failed
            || !matches!(kind, TaskState::Memory | TaskState::Timeout)
        {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: kind.to_string(),
            });
        }
        self.state = kind;
        Ok(())
    }

    /// A fresh queued copy of this task for resubmission.
    pub fn resubmission(&self, resources: Option<Resources>) -> Task {
        let mut task = Task::new(
            self.cmd.clone(),
            resources.unwrap_or_else(|| self.resources.clone()),
            self.folder.clone(),
        );
        task.deps = self.deps.clone();
        task.workflow = self.workflow;
        task.restart = self.restart;
        task.creates = self.creates.clone();
        task
    }

    /// Classify a failure from the error file.
    ///
    /// Sets `error` to the most relevant line and returns true if the
    /// failure looks like memory exhaustion.
    pub fn read_error(&mut self, scheduler: &dyn Scheduler) -> bool {
        let path = scheduler.error_file(self);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                mqlog_debug!("read_error: {}: {}", path.display(), e);
                return false;
            }
        };

        for line in text.lines().rev() {
            let lower = line.to_lowercase();
            if ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
                self.error = line.to_string();
                return is_memory_error(line);
            }
        }

        self.error = text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .to_string();
        false
    }

    /// Queue-file form with folders relative to `root`.
    pub fn to_dict(&self, root: &Path) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "folder".to_string(),
                serde_json::Value::String(relative_to(&self.folder, root)),
            );
            map.insert(
                "deps".to_string(),
                self.deps
                    .iter()
                    .map(|dep| serde_json::Value::String(relative_to(dep, root)))
                    .collect(),
            );
        }
        Ok(value)
    }

    pub fn from_dict(value: serde_json::Value, root: &Path) -> Result<Task> {
        let mut task: Task = serde_json::from_value(value)?;
        task.folder = absolute_from(&task.folder, root);
        task.deps = task
            .deps
            .iter()
            .map(|dep| absolute_from(dep, root))
            .collect();
        Ok(task)
    }

    pub fn to_csv_row(&self) -> String {
        let fields = [
            self.id.to_string(),
            self.folder.display().to_string(),
            self.cmd.render(),
            if self.cmd.has_non_standard_name() {
                self.cmd.name()
            } else {
                String::new()
            },
            self.resources.to_string(),
            self.state.to_string(),
            self.restart.to_string(),
            self.workflow.to_string(),
            self.diskspace.to_string(),
            self.deps
                .iter()
                .map(|dep| dep.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
            self.creates.join(","),
            format_time(self.tqueued),
            format_time(self.trunning),
            format_time(self.tstop),
            self.error.clone(),
            self.memory_usage.to_string(),
        ];
        fields
            .iter()
            .map(|field| csv_quote(field))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a `log.csv` row. Rows written before `memory_usage` existed
    /// lack the last column.
    pub fn from_csv_row(row: &str) -> Result<Task> {
        let fields = csv_split(row);
        if fields.len() < CSV_COLUMNS - 1 {
            return Err(Error::Validation(format!(
                "Expected {} columns, got {}: {}",
                CSV_COLUMNS,
                fields.len(),
                row
            )));
        }
        let bad = |what: &str| Error::Validation(format!("Bad {} in row: {}", what, row));

        let name = (!fields[3].is_empty()).then_some(fields[3].as_str());
        let mut cmd = Command::parse(&fields[2])?;
        if let Some(name) = name {
            cmd.set_non_standard_name(name);
        }
        let mut task = Task::new(cmd, fields[4].parse()?, PathBuf::from(&fields[1]));
        task.id = fields[0].parse().map_err(|_| bad("id"))?;
        task.state = fields[5].parse()?;
        task.restart = fields[6].parse().map_err(|_| bad("restart"))?;
        task.workflow = fields[7].parse().map_err(|_| bad("workflow"))?;
        task.diskspace = fields[8].parse().map_err(|_| bad("diskspace"))?;
        task.deps = split_list(&fields[9]).map(PathBuf::from).collect();
        task.creates = split_list(&fields[10]).map(str::to_string).collect();
        task.tqueued = parse_time_field(&fields[11]).map_err(|_| bad("tqueued"))?;
        task.trunning = parse_time_field(&fields[12]).map_err(|_| bad("trunning"))?;
        task.tstop = parse_time_field(&fields[13]).map_err(|_| bad("tstop"))?;
        task.error = fields[14].clone();
        task.memory_usage = match fields.get(15) {
            Some(field) if !field.is_empty() => field.parse().map_err(|_| bad("memory_usage"))?,
            _ => 0,
        };
        Ok(task)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.id, self.dname().display(), self.state)
    }
}

fn is_memory_error(line: &str) -> bool {
    let line = line.trim_end();
    line.ends_with("memory limit at some point.")
        || line.contains("malloc")
        || line.starts_with("MemoryError")
        || line.contains("oom-kill")
        || line.ends_with("out of memory")
}

/// Cancel every live task that (transitively) depends on `dname`.
///
/// Returns the `dname`s of the canceled tasks.
pub fn cancel_dependents(tasks: &mut [Task], dname: &Path, at: DateTime<Utc>) -> Vec<PathBuf> {
    let mut canceled = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = vec![dname.to_path_buf()];

    while let Some(current) = pending.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for task in tasks.iter_mut() {
            if !task.deps.contains(&current) || task.state.is_terminal() {
                continue;
            }
            if task.set_state(TaskState::Canceled).is_ok() {
                task.tstop = Some(at);
                let name = task.dname();
                canceled.push(name.clone());
                pending.push(name);
            }
        }
    }
    canceled
}

/// Resolve a dependency against the folder of the depending task,
/// collapsing `.` and `..` lexically.
pub fn resolve_dep(folder: &Path, dep: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for component in folder.join(dep).components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resource request as given by a user: either a full resource string or
/// individual keywords, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceArgs {
    pub resources: Option<String>,
    pub cores: Option<u32>,
    pub nodename: Option<String>,
    pub processes: Option<u32>,
    /// Time string such as `2h`.
    pub tmax: Option<String>,
}

impl ResourceArgs {
    pub fn has_keywords(&self) -> bool {
        self.cores.is_some()
            || self.nodename.is_some()
            || self.processes.is_some()
            || self.tmax.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_none() && !self.has_keywords()
    }

    /// Fill unset keywords from `defaults`. A resource string wins outright.
    pub fn or(&self, defaults: &ResourceArgs) -> ResourceArgs {
        if self.resources.is_some() {
            return self.clone();
        }
        if !self.has_keywords() && defaults.resources.is_some() {
            return defaults.clone();
        }
        ResourceArgs {
            resources: None,
            cores: self.cores.or(defaults.cores),
            nodename: self.nodename.clone().or_else(|| defaults.nodename.clone()),
            processes: self.processes.or(defaults.processes),
            tmax: self.tmax.clone().or_else(|| defaults.tmax.clone()),
        }
    }

    /// Explicit request, else the command's self-declared resources,
    /// else 1 core for 10 minutes.
    pub fn resolve(&self, cmd: &Command, folder: &Path) -> Result<Resources> {
        if let Some(spec) = &self.resources {
            if self.has_keywords() {
                return Err(Error::Validation(
                    "Use either a resources string or cores/nodename/processes/tmax, not both"
                        .to_string(),
                ));
            }
            return spec.parse();
        }
        if self.has_keywords() {
            let tmax = match &self.tmax {
                Some(t) => parse_time(t)?,
                None => DEFAULT_TMAX,
            };
            return Resources::new(
                self.cores.unwrap_or(1),
                self.nodename.clone(),
                self.processes.unwrap_or(0),
                tmax,
            );
        }
        Ok(cmd.read_resources(folder)?.unwrap_or_default())
    }
}

/// Options for [`task`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub args: Vec<String>,
    pub resources: ResourceArgs,
    /// Relative folders are taken from the current directory.
    pub folder: PathBuf,
    pub deps: Vec<String>,
    pub workflow: bool,
    pub restart: u32,
    pub diskspace: u64,
    pub creates: Vec<String>,
    pub name: Option<String>,
    pub kind: Option<CommandType>,
}

/// Create a queued task from a command-line style command.
pub fn task(cmd: &str, options: TaskOptions) -> Result<Task> {
    let folder = if options.folder.is_absolute() {
        options.folder
    } else {
        resolve_dep(&std::env::current_dir()?, &options.folder.to_string_lossy())
    };
    let command = create_command(cmd, options.args, options.kind, options.name.as_deref())?;
    let resources = options.resources.resolve(&command, &folder)?;

    let mut task = Task::new(command, resources, folder);
    task.deps = options
        .deps
        .iter()
        .map(|dep| resolve_dep(&task.folder, dep))
        .collect();
    task.workflow = options.workflow;
    task.restart = options.restart;
    task.diskspace = options.diskspace;
    task.creates = options.creates;
    Ok(task)
}

fn relative_to(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

fn absolute_from(path: &Path, root: &Path) -> PathBuf {
    if path == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(path)
    }
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn parse_time_field(s: &str) -> std::result::Result<Option<DateTime<Utc>>, chrono::ParseError> {
    if s.is_empty() {
        return Ok(None);
    }
    Ok(Some(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)))
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').filter(|item| !item.is_empty())
}

fn csv_quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_split(row: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = row.trim_end_matches(['\n', '\r']).chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut field)),
            (c, _) => field.push(c),
        }
    }
    fields.push(field);
    fields
}
