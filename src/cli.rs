//! `mq` command-line interface.

use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use crate::config::{self, Config};
use crate::core::resources::{seconds_to_time_string, Resources};
use crate::core::selection::{parse_states, Selection};
use crate::core::task::{resolve_dep, task, ResourceArgs, Task, TaskOptions, TaskState};
use crate::core::CommandType;
use crate::queue::{Queue, SubmitReport};
use crate::scheduler::{create_scheduler, SystemRunner};
use crate::workflow::{run_workflow_function, workflow_tasks, WorkflowRegistry};
use crate::{mqlog, Error, Result};

/// Simple front-end to batch schedulers
#[derive(Parser, Debug)]
#[command(name = "mq")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MQ_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.myqueue/mq.log)
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Which tasks to act on.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct SelectionArgs {
    /// States: q h r d F C T M (queued, hold, running, done, FAILED,
    /// CANCELED, TIMEOUT, MEMORY), `a` for all, or comma-separated names
    #[arg(short = 's', long)]
    pub states: Option<String>,

    /// Comma-separated task ids
    #[arg(short = 'i', long)]
    pub id: Option<String>,

    /// Task name pattern (glob)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Error message pattern (glob)
    #[arg(short = 'e', long)]
    pub error: Option<String>,

    /// Also act on tasks in subfolders
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Task folders
    pub folders: Vec<PathBuf>,
}

/// Resource request for new tasks.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct ResourceFlags {
    /// Resources such as `8:1h`, `48:xeon24:2d` or `16:4:xeon8:30m`
    #[arg(short = 'R', long)]
    pub resources: Option<String>,

    /// Number of cores
    #[arg(long)]
    pub cores: Option<u32>,

    /// Node class
    #[arg(long)]
    pub nodename: Option<String>,

    /// Number of MPI processes
    #[arg(long)]
    pub processes: Option<u32>,

    /// Maximum run time such as `2h`
    #[arg(long)]
    pub tmax: Option<String>,
}

impl From<ResourceFlags> for ResourceArgs {
    fn from(flags: ResourceFlags) -> Self {
        ResourceArgs {
            resources: flags.resources,
            cores: flags.cores,
            nodename: flags.nodename,
            processes: flags.processes,
            tmax: flags.tmax,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List tasks in the queue
    #[command(alias = "ls")]
    List {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Show detailed information about a task
    Info {
        id: u64,
    },

    /// Submit a task, e.g. `mq submit "script.py 1 2" folder1 folder2`
    Submit {
        /// Command and arguments
        task: String,

        #[command(flatten)]
        resources: ResourceFlags,

        /// Comma-separated dependencies (task names, relative to each folder)
        #[arg(short = 'd', long)]
        dependencies: Option<String>,

        /// Non-standard task name
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Command type instead of guessing: shell, shell-script,
        /// python-script, python-module, python-function, ...
        #[arg(short = 't', long = "type")]
        kind: Option<CommandType>,

        /// Restart this many times after TIMEOUT or MEMORY (see `kick`)
        #[arg(long, default_value_t = 0)]
        restart: u32,

        /// Disk space used by the task (see `maximum_diskspace`)
        #[arg(long, default_value_t = 0)]
        diskspace: u64,

        /// Submit at most this many tasks
        #[arg(short = 'M', long)]
        max_tasks: Option<usize>,

        /// Show what would be submitted
        #[arg(short = 'z', long)]
        dry_run: bool,

        /// Task folders (default: current folder)
        folders: Vec<PathBuf>,
    },

    /// Resubmit FAILED, TIMEOUT, MEMORY or CANCELED tasks
    Resubmit {
        #[command(flatten)]
        selection: SelectionArgs,

        /// New resources
        #[arg(short = 'R', long)]
        resources: Option<String>,

        #[arg(short = 'z', long)]
        dry_run: bool,
    },

    /// Remove tasks from the queue (and everything depending on them)
    #[command(alias = "rm")]
    Remove {
        #[command(flatten)]
        selection: SelectionArgs,

        #[arg(short = 'z', long)]
        dry_run: bool,
    },

    /// Hold/release tasks or mark FAILED tasks as MEMORY or TIMEOUT
    Modify {
        #[command(flatten)]
        selection: SelectionArgs,

        /// New state: q, h, M, T (or full names)
        #[arg(short = 'N', long)]
        new_state: TaskState,

        #[arg(short = 'z', long)]
        dry_run: bool,
    },

    /// Make the queue agree with the scheduler and the file system
    Sync {
        #[arg(short = 'z', long)]
        dry_run: bool,
    },

    /// Restart TIMEOUT and MEMORY tasks and hold/release by disk space
    Kick {
        #[arg(short = 'z', long)]
        dry_run: bool,
    },

    /// Submit the tasks of a workflow in each folder
    Workflow {
        /// Workflow script
        script: PathBuf,

        /// Only these tasks and what they depend on
        #[arg(short = 't', long = "targets", value_delimiter = ',')]
        targets: Vec<String>,

        /// Resubmit tasks with a FAILED marker
        #[arg(short = 'f', long)]
        force: bool,

        #[arg(short = 'M', long)]
        max_tasks: Option<usize>,

        #[arg(short = 'z', long)]
        dry_run: bool,

        folders: Vec<PathBuf>,
    },

    /// Run one workflow task in the current folder
    #[command(hide = true)]
    RunTask {
        script: PathBuf,
        name: String,
    },

    /// Write a configuration for this machine
    Config {
        /// Queue (partition) to describe
        #[arg(default_value = "")]
        queue: String,

        /// Scheduler to use instead of guessing
        #[arg(long)]
        scheduler: Option<String>,

        /// Write `.myqueue/config.toml` instead of printing it
        #[arg(long)]
        in_place: bool,
    },
}

impl Command {
    fn dry_run(&self) -> bool {
        match self {
            Command::Submit { dry_run, .. }
            | Command::Resubmit { dry_run, .. }
            | Command::Remove { dry_run, .. }
            | Command::Modify { dry_run, .. }
            | Command::Sync { dry_run }
            | Command::Kick { dry_run }
            | Command::Workflow { dry_run, .. } => *dry_run,
            _ => false,
        }
    }

    fn needs_lock(&self) -> bool {
        !matches!(self, Command::List { .. } | Command::Info { .. })
    }
}

impl SelectionArgs {
    /// Build the filter. `require` refuses an empty selection (for
    /// commands that change tasks).
    pub fn to_selection(&self, cwd: &Path, require: bool) -> Result<Selection> {
        let mut selection = match &self.id {
            Some(ids) => Selection::ids(
                ids.split(',')
                    .map(|id| {
                        id.trim()
                            .parse::<u64>()
                            .map_err(|_| Error::Validation(format!("Bad task id: {:?}", id)))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => Selection::default(),
        };
        if let Some(states) = &self.states {
            selection.states = parse_states(states)?;
        }
        if let Some(name) = &self.name {
            selection = selection.with_name(name)?;
        }
        if let Some(error) = &self.error {
            selection = selection.with_error(error)?;
        }
        selection.recursive = self.recursive;
        selection.folders = self
            .folders
            .iter()
            .map(|folder| resolve_dep(cwd, &folder.to_string_lossy()))
            .collect();

        if require
            && selection.ids.is_empty()
            && selection.states.is_empty()
            && selection.folders.is_empty()
            && selection.name.is_none()
        {
            return Err(Error::Validation(
                "Missing selection: give ids, states, a name pattern or folders".to_string(),
            ));
        }
        Ok(selection)
    }
}

pub fn run(cli: Cli, registry: &WorkflowRegistry) -> Result<()> {
    let cwd = env::current_dir()?;

    match cli.command {
        Command::RunTask { script, name } => {
            let script = resolve_dep(&cwd, &script.to_string_lossy());
            let value = run_workflow_function(registry, &script, &cwd, &name)?;
            mqlog!("run-task {} finished: {}", name, value);
            return Ok(());
        }
        Command::Config {
            queue,
            scheduler,
            in_place,
        } => {
            let config = config::guess_configuration(scheduler.as_deref(), &queue)?;
            if in_place {
                config.save(&cwd)?;
                println!("Wrote {}", Config::config_path(&cwd).display());
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            return Ok(());
        }
        _ => {}
    }

    let home = Config::find_home(&cwd)?;
    let config = Config::load(&home)?;
    let name = config.scheduler_name(&home)?.to_string();
    let scheduler = create_scheduler(&name, &config, &home, Box::new(SystemRunner))?;

    let command = cli.command;
    let mut queue = Queue::open(&home, config, scheduler, command.needs_lock(), command.dry_run())?;
    let result = dispatch(&mut queue, command, registry, &cwd);
    if queue.is_locked() {
        queue.save()?;
    }
    result
}

fn dispatch(queue: &mut Queue, command: Command, registry: &WorkflowRegistry, cwd: &Path) -> Result<()> {
    match command {
        Command::List { selection } => {
            let selection = selection.to_selection(cwd, false)?;
            let tasks = queue.list(&selection);
            print_tasks(&tasks, cwd);
        }
        Command::Info { id } => {
            let info = queue.info(id)?;
            println!("{}", serde_json::to_string_pretty(&info.dict)?);
            match info.error_text {
                Some(text) => println!("\n{}:\n{}", info.error_file.display(), text),
                None => println!("\nNo error file: {}", info.error_file.display()),
            }
        }
        Command::Submit {
            task: line,
            resources,
            dependencies,
            name,
            kind,
            restart,
            diskspace,
            max_tasks,
            dry_run: _,
            folders,
        } => {
            let mut words = line.split_whitespace().map(str::to_string);
            let cmd = words
                .next()
                .ok_or_else(|| Error::InvalidCommand("empty command".to_string()))?;
            let args: Vec<String> = words.collect();
            let deps: Vec<String> = dependencies
                .iter()
                .flat_map(|d| d.split(','))
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
            let folders = if folders.is_empty() {
                vec![cwd.to_path_buf()]
            } else {
                folders
            };
            let resources: ResourceArgs = resources.into();
            let tasks = folders
                .into_iter()
                .map(|folder| {
                    task(
                        &cmd,
                        TaskOptions {
                            args: args.clone(),
                            resources: resources.clone(),
                            folder: resolve_dep(cwd, &folder.to_string_lossy()),
                            deps: deps.clone(),
                            restart,
                            diskspace,
                            name: name.clone(),
                            kind,
                            ..TaskOptions::default()
                        },
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            let report = queue.submit(tasks, false, max_tasks.unwrap_or(usize::MAX))?;
            print_submit_report(&report, cwd);
        }
        Command::Resubmit {
            selection,
            resources,
            dry_run: _,
        } => {
            let selection = selection.to_selection(cwd, true)?;
            let resources = resources.map(|r| r.parse::<Resources>()).transpose()?;
            let report = queue.resubmit(&selection, resources)?;
            print_submit_report(&report, cwd);
        }
        Command::Remove {
            selection,
            dry_run,
        } => {
            let selection = selection.to_selection(cwd, true)?;
            let removed = queue.remove(&selection)?;
            print_tasks(&removed.iter().collect::<Vec<_>>(), cwd);
            println!(
                "{} {} task(s)",
                if dry_run { "Would remove" } else { "Removed" },
                removed.len()
            );
        }
        Command::Modify {
            selection,
            new_state,
            dry_run: _,
        } => {
            let selection = selection.to_selection(cwd, true)?;
            for (task, from) in queue.modify(&selection, new_state)? {
                println!("{} -> {}: {}", from, new_state, relative(&task.dname(), cwd));
            }
        }
        Command::Sync { dry_run } => {
            let report = queue.sync()?;
            let verb = if dry_run { "Would mark" } else { "Marked" };
            for (label, names) in [
                ("done", &report.done),
                ("FAILED", &report.failed),
                ("CANCELED", &report.canceled),
            ] {
                for dname in names {
                    println!("{} {} as {}", verb, relative(dname, cwd), label);
                }
            }
            for dname in &report.removed {
                println!("Removing {} (folder is gone)", relative(dname, cwd));
            }
        }
        Command::Kick { dry_run } => {
            let report = queue.kick()?;
            for task in &report.restarted {
                println!(
                    "{} {} with {}",
                    if dry_run { "Would restart" } else { "Restarted" },
                    relative(&task.dname(), cwd),
                    task.resources
                );
            }
            if report.held > 0 {
                println!("Held {} task(s)", report.held);
            }
            if report.released > 0 {
                println!("Released {} task(s)", report.released);
            }
        }
        Command::Workflow {
            script,
            targets,
            force,
            max_tasks,
            dry_run: _,
            folders,
        } => {
            let script = resolve_dep(cwd, &script.to_string_lossy());
            let folders: Vec<PathBuf> = if folders.is_empty() {
                vec![cwd.to_path_buf()]
            } else {
                folders
                    .iter()
                    .map(|folder| resolve_dep(cwd, &folder.to_string_lossy()))
                    .collect()
            };
            let tasks = workflow_tasks(registry, &script, &folders, &targets)?;
            let report = queue.submit(tasks, force, max_tasks.unwrap_or(usize::MAX))?;
            print_submit_report(&report, cwd);
        }
        Command::RunTask { .. } | Command::Config { .. } => {}
    }
    Ok(())
}

fn relative(path: &Path, cwd: &Path) -> String {
    match path.strip_prefix(cwd) {
        Ok(rel) if rel.as_os_str().is_empty() => "./".to_string(),
        Ok(rel) => format!("./{}", rel.display()),
        Err(_) => path.display().to_string(),
    }
}

fn print_tasks(tasks: &[&Task], cwd: &Path) {
    if tasks.is_empty() {
        return;
    }
    let now = Utc::now();
    println!(
        "{:>8} {:<24} {:<28} {:<14} {:>7} {:<8} {:>7} error",
        "id", "folder", "name", "res.", "age", "state", "time"
    );
    for task in tasks {
        let age = task
            .tqueued
            .map(|t| seconds_to_time_string((now - t).num_seconds().max(0) as u64))
            .unwrap_or_default();
        let time = match (task.trunning, task.tstop) {
            (Some(start), Some(stop)) => (stop - start).num_seconds(),
            (Some(start), None) => (now - start).num_seconds(),
            _ => 0,
        };
        println!(
            "{:>8} {:<24} {:<28} {:<14} {:>7} {:<8} {:>7} {}",
            task.id,
            relative(&task.folder, cwd),
            task.name(),
            task.resources.to_string(),
            age,
            task.state(),
            seconds_to_time_string(time.max(0) as u64),
            task.error.chars().take(60).collect::<String>()
        );
    }
}

fn print_submit_report(report: &SubmitReport, cwd: &Path) {
    if report.already_done > 0 {
        println!("done: {}", report.already_done);
    }
    if report.already_failed > 0 {
        println!("FAILED: {} (use --force to resubmit)", report.already_failed);
    }
    for (state, count) in &report.in_queue {
        println!("{}: {}", state, count);
    }
    for (dname, reason) in &report.skipped {
        println!("Skipping {}: {}", relative(dname, cwd), reason);
    }
    print_tasks(&report.submitted.iter().collect::<Vec<_>>(), cwd);
    println!("{} task(s) submitted", report.submitted.len());
}
