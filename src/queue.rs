//! The persisted queue and the operations that change it.
//!
//! State lives in `<home>/.myqueue/queue.json`. Every changed task is also
//! appended to `log.csv`. Mutating operations run under the lock; opening
//! read-only skips it and sees whatever the last writer saved.
//!
//! Queue file versions: 5 changed `mod:func` to `mod@func`, 6 stores
//! folders relative to the home folder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::core::dag::DependencyGraph;
use crate::core::resources::{Resources, MAX_TMAX};
use crate::core::selection::Selection;
use crate::core::task::{cancel_dependents, reconcile, Reconciliation, Task, TaskState, CSV_HEADER};
use crate::lock::Lock;
use crate::scheduler::{find_activation_scripts, Scheduler};
use crate::{mqlog, mqlog_debug, mqlog_warn, Error, Result};

pub const QUEUE_FILE_VERSION: u32 = 6;

/// Running this long past `tmax` counts as TIMEOUT even without a marker.
const TIMEOUT_GRACE_SECS: i64 = 1800;

#[derive(Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    #[serde(default)]
    warning: String,
    #[serde(default)]
    unless: String,
    tasks: Vec<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct SubmitReport {
    /// Workflow tasks whose markers say they are done.
    pub already_done: usize,
    /// Workflow tasks with a `.FAILED` marker (use `force`).
    pub already_failed: usize,
    /// Workflow tasks already queued, held or running, by state.
    pub in_queue: BTreeMap<TaskState, usize>,
    /// Tasks not submitted, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    pub submitted: Vec<Task>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub done: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    pub canceled: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct KickReport {
    pub restarted: Vec<Task>,
    pub held: usize,
    pub released: usize,
}

#[derive(Debug)]
pub struct TaskInfo {
    pub dict: serde_json::Value,
    pub error_file: PathBuf,
    pub error_text: Option<String>,
}

pub struct Queue {
    home: PathBuf,
    config: Config,
    scheduler: Box<dyn Scheduler>,
    dry_run: bool,
    tasks: Vec<Task>,
    changed: Vec<Task>,
    lock: Option<Lock>,
}

impl Queue {
    /// Load the queue.
    ///
    /// With `need_lock`, the lock is taken (except on dry runs), pending
    /// change files are applied and running tasks are checked.
    pub fn open(
        home: &Path,
        config: Config,
        scheduler: Box<dyn Scheduler>,
        need_lock: bool,
        dry_run: bool,
    ) -> Result<Queue> {
        let folder = Config::queue_dir(home);
        let lock = if need_lock && !dry_run {
            fs::create_dir_all(&folder)?;
            Some(Lock::acquire(
                &folder.join("queue.json.lock"),
                Lock::DEFAULT_TIMEOUT,
            )?)
        } else {
            None
        };

        let mut queue = Queue {
            home: home.to_path_buf(),
            config,
            scheduler,
            dry_run,
            tasks: Vec::new(),
            changed: Vec::new(),
            lock,
        };
        queue.read()?;
        if let Some(highest) = queue.tasks.iter().map(|task| task.id).max() {
            queue.scheduler.continue_after(highest);
        }
        if queue.lock.is_some() {
            queue.read_change_files()?;
            queue.check(Utc::now())?;
        }
        Ok(queue)
    }

    fn queue_file(&self) -> PathBuf {
        Config::queue_dir(&self.home).join("queue.json")
    }

    fn log_file(&self) -> PathBuf {
        Config::queue_dir(&self.home).join("log.csv")
    }

    fn read(&mut self) -> Result<()> {
        let path = self.queue_file();
        if !path.is_file() {
            return Ok(());
        }
        let file: QueueFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if file.version != QUEUE_FILE_VERSION {
            mqlog_warn!("Queue file version {} (expected {})", file.version, QUEUE_FILE_VERSION);
        }
        self.tasks = file
            .tasks
            .into_iter()
            .map(|value| Task::from_dict(value, &self.home))
            .collect::<Result<_>>()?;
        mqlog_debug!("Read {} tasks from {}", self.tasks.len(), path.display());
        Ok(())
    }

    /// All tasks from `log.csv`. Unparsable rows are skipped.
    pub fn read_log(home: &Path) -> Result<Vec<Task>> {
        let path = Config::queue_dir(home).join("log.csv");
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)?;
        Ok(text
            .lines()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match Task::from_csv_row(line) {
                Ok(task) => Some(task),
                Err(e) => {
                    mqlog_warn!("Skipping log row: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Write `queue.json` and append changed tasks to `log.csv`.
    pub fn save(&mut self) -> Result<()> {
        if self.dry_run || self.changed.is_empty() {
            return Ok(());
        }
        let folder = Config::queue_dir(&self.home);
        fs::create_dir_all(&folder)?;

        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            warning: "Do NOT edit this file!".to_string(),
            unless: "you know what you are doing.".to_string(),
            tasks: self
                .tasks
                .iter()
                .map(|task| task.to_dict(&self.home))
                .collect::<Result<_>>()?,
        };
        fs::write(self.queue_file(), serde_json::to_string_pretty(&file)?)?;

        let log = self.log_file();
        let write_header = !log.is_file();
        let mut out = OpenOptions::new().create(true).append(true).open(&log)?;
        if write_header {
            writeln!(out, "{}", CSV_HEADER)?;
        }
        let mut seen = HashSet::new();
        let latest: Vec<&Task> = self
            .changed
            .iter()
            .rev()
            .filter(|task| seen.insert((task.id, task.dname())))
            .collect();
        for task in latest.into_iter().rev() {
            writeln!(out, "{}", task.to_csv_row())?;
        }
        mqlog_debug!("Saved {} tasks ({} changed)", self.tasks.len(), self.changed.len());
        self.changed.clear();
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.scheduler
    }

    fn mark_changed(&mut self, index: usize) {
        self.changed.push(self.tasks[index].clone());
    }

    /// Cancel everything depending on `dname` and record the changes.
    fn cascade(&mut self, dname: &Path, at: DateTime<Utc>) {
        for canceled in cancel_dependents(&mut self.tasks, dname, at) {
            mqlog_debug!("Canceled dependent {}", canceled.display());
            if let Some(task) = self.tasks.iter().find(|task| task.dname() == canceled) {
                self.changed.push(task.clone());
            }
        }
    }

    fn index_of_id(&self, id: u64) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }

    pub fn list(&self, selection: &Selection) -> Vec<&Task> {
        selection
            .select(&self.tasks)
            .into_iter()
            .map(|i| &self.tasks[i])
            .collect()
    }

    pub fn info(&self, id: u64) -> Result<TaskInfo> {
        let task = self
            .index_of_id(id)
            .map(|i| &self.tasks[i])
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let error_file = self.scheduler.error_file(task);
        Ok(TaskInfo {
            dict: task.to_dict(&self.home)?,
            error_text: fs::read_to_string(&error_file).ok(),
            error_file,
        })
    }

    /// Submit tasks in dependency order.
    ///
    /// Done, failed (unless `force`) and already queued workflow tasks are
    /// left out. Dependencies must be in the queue, in `tasks`, or done.
    pub fn submit(&mut self, tasks: Vec<Task>, force: bool, max_tasks: usize) -> Result<SubmitReport> {
        let mut report = SubmitReport::default();
        let now = Utc::now();

        let mut names = HashSet::new();
        if let Some(duplicate) = tasks.iter().map(Task::dname).find(|dname| !names.insert(dname.clone())) {
            return Err(Error::Validation(format!(
                "Task submitted twice: {}",
                duplicate.display()
            )));
        }

        let mut done = HashSet::new();
        let mut failed = HashSet::new();
        let mut pending = Vec::new();
        for task in tasks {
            if task.workflow && task.is_done() {
                done.insert(task.dname());
                report.already_done += 1;
            } else if task.workflow && task.has_failed() {
                if force {
                    if !self.dry_run {
                        task.remove_failed_file()?;
                    }
                    pending.push(task);
                } else {
                    failed.insert(task.dname());
                    report.already_failed += 1;
                }
            } else {
                pending.push(task);
            }
        }

        let current: HashMap<PathBuf, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (task.dname(), i))
            .collect();

        pending.retain(|task| {
            if !task.workflow {
                return true;
            }
            match current.get(&task.dname()).map(|&i| self.tasks[i].state()) {
                Some(state) if state.is_active() => {
                    *report.in_queue.entry(state).or_default() += 1;
                    false
                }
                _ => true,
            }
        });

        let pending_names: HashSet<PathBuf> = pending.iter().map(Task::dname).collect();
        let mut todo = Vec::new();
        'tasks: for mut task in pending {
            let mut unfinished = Vec::new();
            for dep in &task.deps {
                if failed.contains(dep) {
                    report
                        .skipped
                        .push((task.dname(), format!("Failed dependency={}", dep.display())));
                    continue 'tasks;
                }
                match current.get(dep).map(|&i| &self.tasks[i]) {
                    Some(queued) if queued.state() == TaskState::Done => {}
                    Some(queued) if queued.state().is_active() => unfinished.push(dep.clone()),
                    Some(queued) if !pending_names.contains(dep) => {
                        report.skipped.push((
                            task.dname(),
                            format!(
                                "Dependency ({}) in bad state: {}",
                                queued.name(),
                                queued.state()
                            ),
                        ));
                        continue 'tasks;
                    }
                    _ if pending_names.contains(dep) => unfinished.push(dep.clone()),
                    _ if done.contains(dep) => {}
                    _ => {
                        return Err(Error::MissingDependency {
                            task: task.dname().display().to_string(),
                            dependency: dep.display().to_string(),
                        })
                    }
                }
            }
            task.deps = unfinished.into_iter().collect();
            todo.push(task);
        }

        let order = DependencyGraph::new(&todo)?.submission_order()?;
        let mut slots: Vec<Option<Task>> = todo.into_iter().map(Some).collect();
        let mut todo: Vec<Task> = order.into_iter().filter_map(|i| slots[i].take()).collect();
        todo.truncate(max_tasks);

        // Every unfinished dependency must be live in the queue or about
        // to be submitted ahead of its dependents.
        loop {
            let names: HashSet<PathBuf> = todo.iter().map(Task::dname).collect();
            let (keep, dropped): (Vec<Task>, Vec<Task>) = todo.into_iter().partition(|task| {
                task.deps.iter().all(|dep| {
                    names.contains(dep)
                        || current
                            .get(dep)
                            .is_some_and(|&i| self.tasks[i].state().is_active())
                })
            });
            todo = keep;
            if dropped.is_empty() {
                break;
            }
            for task in dropped {
                report
                    .skipped
                    .push((task.dname(), "Dependency not submitted".to_string()));
            }
        }

        let activation = if self.dry_run {
            HashMap::new()
        } else {
            find_activation_scripts(todo.iter().map(|task| task.folder.as_path()))
        };

        let mut ids: HashMap<PathBuf, u64> = HashMap::new();
        let mut submitted = Vec::new();
        let mut failure = None;
        let total = todo.len();
        for mut task in todo {
            task.dependency_ids = task
                .deps
                .iter()
                .filter_map(|dep| {
                    if let Some(&id) = ids.get(dep) {
                        return Some(id);
                    }
                    let queued = &self.tasks[*current.get(dep)?];
                    (!queued.is_done()).then_some(queued.id)
                })
                .filter(|&id| id != 0)
                .collect();
            task.activation_script = activation.get(&task.folder).cloned();
            task.tqueued = Some(now);

            if let Err(e) = self.scheduler.submit(&mut task, self.dry_run) {
                mqlog_warn!("Could not submit {}: {}", task.dname().display(), e);
                failure = Some(e);
                break;
            }
            ids.insert(task.dname(), task.id);
            submitted.push(task);
        }

        if !self.dry_run {
            let replaced: HashSet<PathBuf> = submitted
                .iter()
                .filter(|task| task.workflow)
                .map(Task::dname)
                .collect();
            self.tasks
                .retain(|task| !(replaced.contains(&task.dname()) && task.state().is_terminal()));
            self.changed.extend(submitted.iter().cloned());
            self.tasks.extend(submitted.iter().cloned());
            mqlog!("Submitted {} of {} tasks", submitted.len(), total);
        }
        report.submitted = submitted;

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Remove the selected tasks and everything depending on them,
    /// canceling live jobs.
    pub fn remove(&mut self, selection: &Selection) -> Result<Vec<Task>> {
        let roots = selection.select(&self.tasks);
        let indices = self.find_depending(&roots)?;
        let now = Utc::now();

        if self.dry_run {
            return Ok(indices.iter().map(|&i| self.tasks[i].clone()).collect());
        }

        let mut removed = Vec::new();
        for &i in indices.iter().rev() {
            if self.tasks[i].state().is_active() {
                self.scheduler.cancel(&self.tasks[i])?;
            }
            let mut task = self.tasks.remove(i);
            task.tstop.get_or_insert(now);
            removed.push(task);
        }
        removed.reverse();

        for task in &removed {
            self.cascade(&task.dname(), now);
        }
        self.changed.extend(removed.iter().cloned());
        mqlog!("Removed {} tasks", removed.len());
        Ok(removed)
    }

    /// Indices of `roots` plus everything that depends on them, in
    /// queue order.
    pub fn find_depending(&self, roots: &[usize]) -> Result<Vec<usize>> {
        Ok(DependencyGraph::new(&self.tasks)?.dependents(roots))
    }

    /// Bring live tasks in line with the backend and the marker files;
    /// drop tasks whose folder is gone.
    pub fn sync(&mut self) -> Result<SyncReport> {
        let ids = self.scheduler.get_ids()?;
        let now = Utc::now();
        let mut report = SyncReport::default();

        for i in 0..self.tasks.len() {
            let task = &self.tasks[i];
            let outcome = reconcile(task, ids.contains(&task.id), task.markers());
            let state = match outcome {
                Reconciliation::Unchanged => continue,
                Reconciliation::Done => {
                    report.done.push(task.dname());
                    TaskState::Done
                }
                Reconciliation::Failed => {
                    report.failed.push(task.dname());
                    TaskState::Failed
                }
                Reconciliation::Canceled => {
                    report.canceled.push(task.dname());
                    TaskState::Canceled
                }
            };
            if self.dry_run {
                continue;
            }
            self.tasks[i].advance(state, now)?;
            if state.is_unsuccessful() {
                let dname = self.tasks[i].dname();
                self.cascade(&dname, now);
            }
            self.mark_changed(i);
        }

        let gone: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| !ids.contains(&task.id) && !task.folder.is_dir())
            .map(|(i, _)| i)
            .collect();
        for &i in gone.iter().rev() {
            report.removed.push(self.tasks[i].dname());
            if !self.dry_run {
                let task = self.tasks.remove(i);
                self.changed.push(task);
            }
        }
        report.removed.reverse();
        Ok(report)
    }

    /// Hold/release or reclassify selected tasks. Returns each changed task
    /// with its previous state.
    pub fn modify(&mut self, selection: &Selection, new_state: TaskState) -> Result<Vec<(Task, TaskState)>> {
        let indices = selection.select(&self.tasks);
        for &i in &indices {
            let from = self.tasks[i].state();
            let allowed = matches!(
                (from, new_state),
                (TaskState::Hold, TaskState::Queued)
                    | (TaskState::Queued, TaskState::Hold)
                    | (TaskState::Failed, TaskState::Memory | TaskState::Timeout)
            );
            if !allowed {
                return Err(Error::InvalidTransition {
                    from: from.to_string(),
                    to: new_state.to_string(),
                });
            }
        }

        let mut changes = Vec::new();
        for i in indices {
            let from = self.tasks[i].state();
            if !self.dry_run {
                let task = &mut self.tasks[i];
                match from {
                    TaskState::Hold => {
                        self.scheduler.release_hold(task)?;
                        task.set_state(TaskState::Queued)?;
                    }
                    TaskState::Queued => {
                        self.scheduler.hold(task)?;
                        task.set_state(TaskState::Hold)?;
                    }
                    _ => {
                        task.remove_failed_file()?;
                        task.reclassify(new_state)?;
                    }
                }
                self.mark_changed(i);
            }
            mqlog!("{} -> {}: {}", from, new_state, self.tasks[i]);
            changes.push((self.tasks[i].clone(), from));
        }
        Ok(changes)
    }

    /// Resubmit finished tasks as new tasks, optionally with new resources.
    pub fn resubmit(&mut self, selection: &Selection, resources: Option<Resources>) -> Result<SubmitReport> {
        let indices: Vec<usize> = selection
            .select(&self.tasks)
            .into_iter()
            .filter(|&i| self.tasks[i].state().is_terminal())
            .collect();

        let mut fresh = Vec::new();
        for &i in indices.iter().rev() {
            let old = if self.dry_run {
                self.tasks[i].clone()
            } else {
                let old = self.tasks.remove(i);
                if old.state() == TaskState::Failed {
                    old.remove_failed_file()?;
                }
                self.changed.push(old.clone());
                old
            };
            fresh.push(old.resubmission(resources.clone()));
        }
        fresh.reverse();
        self.submit(fresh, false, usize::MAX)
    }

    /// Apply a state change reported by a job.
    pub fn update(&mut self, id: u64, state: TaskState, at: DateTime<Utc>) -> Result<()> {
        let Some(i) = self.index_of_id(id) else {
            mqlog_warn!("No such task: {}, {}", id, state);
            return Ok(());
        };
        if let Err(e) = self.tasks[i].advance(state, at) {
            mqlog_warn!("Ignoring update for {}: {}", self.tasks[i], e);
            return Ok(());
        }
        let dname = self.tasks[i].dname();

        match state {
            TaskState::Done => {
                for task in self.tasks.iter_mut() {
                    task.deps.remove(&dname);
                }
                self.tasks[i].write_done_file()?;
            }
            TaskState::Failed | TaskState::Timeout | TaskState::Memory => {
                self.cascade(&dname, at);
                if state == TaskState::Failed {
                    self.tasks[i].write_failed_file()?;
                }
            }
            _ => {}
        }

        if state != TaskState::Running {
            self.tasks[i].memory_usage = self.scheduler.maxrss(id);
        }
        self.mark_changed(i);
        Ok(())
    }

    /// Consume `<scheduler>-<id>-<n>` change files written by job scripts.
    pub fn read_change_files(&mut self) -> Result<usize> {
        let folder = Config::queue_dir(&self.home);
        let pattern = format!(
            "{}/{}-*-*",
            glob::Pattern::escape(&folder.to_string_lossy()),
            self.scheduler.name()
        );
        let mut changes = Vec::new();
        for path in glob::glob(&pattern)?.filter_map(|entry| entry.ok()) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut parts = name.rsplitn(3, '-');
            let (Some(code), Some(id), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let state = match code {
                "0" => TaskState::Running,
                "1" => TaskState::Done,
                "2" => TaskState::Failed,
                "3" => TaskState::Timeout,
                _ => continue,
            };
            let Ok(id) = id.parse::<u64>() else {
                continue;
            };
            let at: DateTime<Utc> = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            changes.push((at, id, state, path));
        }
        changes.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        let count = changes.len();
        for (at, id, state, path) in changes {
            fs::remove_file(&path)?;
            self.update(id, state, at)?;
        }
        Ok(count)
    }

    /// Detect timeouts, cancel tasks waiting on failed ones and classify
    /// fresh failures.
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<()> {
        for i in 0..self.tasks.len() {
            let task = &self.tasks[i];
            if task.state() != TaskState::Running {
                continue;
            }
            let Some(trunning) = task.trunning else {
                continue;
            };
            let overdue = (now - trunning).num_seconds() - task.resources.tmax() as i64;
            if overdue > 0 && (self.scheduler.has_timed_out(task) || overdue > TIMEOUT_GRACE_SECS) {
                self.tasks[i].advance(TaskState::Timeout, now)?;
                let dname = self.tasks[i].dname();
                self.cascade(&dname, now);
                self.mark_changed(i);
            }
        }

        let bad: HashSet<PathBuf> = self
            .tasks
            .iter()
            .filter(|task| task.state().is_unsuccessful())
            .map(Task::dname)
            .collect();
        for i in 0..self.tasks.len() {
            let task = &self.tasks[i];
            if task.state() == TaskState::Queued && task.deps.iter().any(|dep| bad.contains(dep)) {
                self.tasks[i].advance(TaskState::Canceled, now)?;
                self.mark_changed(i);
            }
        }

        for i in 0..self.tasks.len() {
            if self.tasks[i].state() != TaskState::Failed || !self.tasks[i].error.is_empty() {
                continue;
            }
            let task = &mut self.tasks[i];
            if task.read_error(&*self.scheduler) {
                task.reclassify(TaskState::Memory)?;
                task.remove_failed_file()?;
            }
            self.mark_changed(i);
        }
        Ok(())
    }

    /// Restart TIMEOUT/MEMORY tasks that have restarts left, with bigger
    /// resources, together with their canceled dependents.
    pub fn kick(&mut self) -> Result<KickReport> {
        let mut report = KickReport::default();
        let nodes = self.config.nodes_or_default();
        let roots: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| {
                matches!(task.state(), TaskState::Timeout | TaskState::Memory) && task.restart > 0
            })
            .map(|(i, _)| i)
            .collect();

        if !roots.is_empty() {
            let mut bigger = HashMap::new();
            for &i in &roots {
                let task = &self.tasks[i];
                bigger.insert(i, task.resources.bigger(task.state(), &nodes, MAX_TMAX)?);
            }
            let indices = self.find_depending(&roots)?;

            let restarts: Vec<Task> = indices
                .iter()
                .map(|&i| {
                    let old = &self.tasks[i];
                    let mut task = old.resubmission(bigger.get(&i).cloned());
                    task.diskspace = old.diskspace;
                    if bigger.contains_key(&i) {
                        task.restart = old.restart - 1;
                    }
                    task
                })
                .collect();

            if self.dry_run {
                report.restarted = restarts;
            } else {
                for &i in indices.iter().rev() {
                    let old = self.tasks.remove(i);
                    self.changed.push(old);
                }
                mqlog!("Restarting {} tasks", restarts.len());
                report.restarted = self.submit(restarts, false, usize::MAX)?.submitted;
            }
        }

        let (held, released) = self.hold_or_release()?;
        report.held = held;
        report.released = released;
        Ok(report)
    }

    /// Keep the summed `diskspace` of live and failed tasks under
    /// `maximum_diskspace` by holding or releasing queued tasks.
    pub fn hold_or_release(&mut self) -> Result<(usize, usize)> {
        let Some(max) = self.config.maximum_diskspace else {
            return Ok((0, 0));
        };
        let mut used: u64 = self
            .tasks
            .iter()
            .filter(|task| {
                matches!(
                    task.state(),
                    TaskState::Queued
                        | TaskState::Running
                        | TaskState::Failed
                        | TaskState::Timeout
                        | TaskState::Memory
                )
            })
            .map(|task| task.diskspace)
            .sum();

        let (mut held, mut released) = (0, 0);
        if used > max {
            for i in 0..self.tasks.len() {
                let task = &self.tasks[i];
                if task.state() != TaskState::Queued || task.diskspace == 0 {
                    continue;
                }
                if !self.dry_run {
                    self.scheduler.hold(task)?;
                    self.tasks[i].set_state(TaskState::Hold)?;
                    self.mark_changed(i);
                }
                held += 1;
                used -= self.tasks[i].diskspace;
                if used < max {
                    break;
                }
            }
        } else if used < max {
            for i in (0..self.tasks.len()).rev() {
                let task = &self.tasks[i];
                if task.state() != TaskState::Hold || task.diskspace == 0 {
                    continue;
                }
                if !self.dry_run {
                    self.scheduler.release_hold(task)?;
                    self.tasks[i].set_state(TaskState::Queued)?;
                    self.mark_changed(i);
                }
                released += 1;
                used += self.tasks[i].diskspace;
                if used > max {
                    break;
                }
            }
        }
        Ok((held, released))
    }
}
