//! Batch-scheduler backends.
//!
//! Every backend implements [`Scheduler`]. Backends that shell out do so
//! through a [`CommandRunner`], so tests can replace `bsub` and friends
//! with canned output.

pub mod lsf;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::Config;
use crate::core::resources::Node;
use crate::core::task::Task;
use crate::{mqlog_debug, mqlog_trace, mqlog_warn, Error, Result};

pub use lsf::Lsf;
pub use test::TestScheduler;

/// Result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs external programs.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<CommandOutput>;
}

/// Runs programs with `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        mqlog_debug!("exec: {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        mqlog_trace!("{} exited {}: {}", program, result.code, result.stdout.trim_end());
        Ok(result)
    }
}

/// Run a program and return its stdout, failing on a non-zero exit.
pub fn check_output(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
    stdin: Option<&str>,
) -> Result<String> {
    let output = runner.run(program, args, stdin)?;
    if !output.success() {
        mqlog_warn!("{} failed ({}): {}", program, output.code, output.stderr.trim_end());
        return Err(Error::Submission {
            program: program.to_string(),
            code: output.code,
            stderr: output.stderr.trim_end().to_string(),
        });
    }
    Ok(output.stdout)
}

pub trait Scheduler {
    /// Backend name, also the prefix of change files.
    fn name(&self) -> &str;

    /// Submit a task and set `task.id`. A dry run only prints what would
    /// be submitted.
    fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()>;

    fn cancel(&self, task: &Task) -> Result<()>;

    /// Ids of all jobs the backend currently knows about.
    fn get_ids(&self) -> Result<BTreeSet<u64>>;

    fn hold(&self, task: &Task) -> Result<()>;

    fn release_hold(&self, task: &Task) -> Result<()>;

    fn error_file(&self, task: &Task) -> PathBuf {
        task.folder
            .join(format!("{}.{}.err", file_stem(task), task.id))
    }

    /// Line content that marks a job killed for exceeding its time limit.
    fn timeout_marker(&self) -> Option<&str> {
        None
    }

    fn has_timed_out(&self, task: &Task) -> bool {
        let Some(marker) = self.timeout_marker() else {
            return false;
        };
        fs::read_to_string(self.error_file(task))
            .map(|text| text.lines().any(|line| line.contains(marker)))
            .unwrap_or(false)
    }

    /// Called with the highest id already in the queue. Backends that
    /// hand out their own ids must not reuse it.
    fn continue_after(&self, _id: u64) {}

    /// Peak memory use in bytes, if the backend records it.
    fn maxrss(&self, _id: u64) -> u64 {
        0
    }

    /// Node classes and extra submission arguments for a queue.
    fn get_config(&self, queue: &str) -> Result<(Vec<Node>, Vec<String>)> {
        Err(Error::Config(format!(
            "The {} backend can't describe queue {:?}",
            self.name(),
            queue
        )))
    }
}

/// Output and error file stem: the short name, made file-system safe.
pub fn file_stem(task: &Task) -> String {
    task.cmd.short_name().replace('/', "\\")
}

/// Create a backend by name.
pub fn create_scheduler(
    name: &str,
    config: &Config,
    home: &Path,
    runner: Box<dyn CommandRunner>,
) -> Result<Box<dyn Scheduler>> {
    mqlog_debug!("create_scheduler name={}", name);
    match name {
        "lsf" => Ok(Box::new(Lsf::new(config, home, runner))),
        "test" => Ok(Box::new(TestScheduler::new())),
        other => Err(Error::Config(format!(
            "Unknown scheduler {:?} (must be 'lsf' or 'test')",
            other
        ))),
    }
}

/// Find `venv/bin/activate` in each folder or its closest ancestor.
pub fn find_activation_scripts<'a>(
    folders: impl IntoIterator<Item = &'a Path>,
) -> HashMap<PathBuf, PathBuf> {
    let mut found: HashMap<PathBuf, Option<PathBuf>> = HashMap::new();
    let mut result = HashMap::new();
    for folder in folders {
        let script = folder.ancestors().find_map(|dir| {
            found
                .entry(dir.to_path_buf())
                .or_insert_with(|| {
                    let candidate = dir.join("venv/bin/activate");
                    candidate.is_file().then_some(candidate)
                })
                .clone()
        });
        if let Some(script) = script {
            result.insert(folder.to_path_buf(), script);
        }
    }
    result
}
