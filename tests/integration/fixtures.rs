//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A temporary queue home with a `.myqueue` folder
//! - Tasks in subfolders of that home
//! - A scripted `CommandRunner` standing in for `bsub` and friends

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

use myqueue::config::Config;
use myqueue::core::{task, Task, TaskOptions};
use myqueue::queue::Queue;
use myqueue::scheduler::{CommandOutput, CommandRunner, TestScheduler};
use myqueue::Result;

/// A throwaway queue home.
pub struct TestHome {
    pub temp_dir: TempDir,
    pub path: PathBuf,
    pub scheduler: TestScheduler,
}

impl TestHome {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        fs::create_dir_all(path.join(".myqueue")).expect("Failed to create .myqueue");
        Self {
            temp_dir,
            path,
            scheduler: TestScheduler::new(),
        }
    }

    /// Create (if needed) and return a subfolder.
    pub fn folder(&self, name: &str) -> PathBuf {
        let folder = self.path.join(name);
        fs::create_dir_all(&folder).expect("Failed to create folder");
        folder
    }

    pub fn open(&self) -> Queue {
        self.open_with(Config::default())
    }

    pub fn open_with(&self, config: Config) -> Queue {
        Queue::open(&self.path, config, Box::new(self.scheduler.clone()), true, false)
            .expect("Failed to open queue")
    }

    /// Write a change file as a job script would.
    pub fn change_file(&self, id: u64, code: u8) {
        fs::write(self.path.join(format!(".myqueue/test-{}-{}", id, code)), "")
            .expect("Failed to write change file");
    }

    /// Write the error file the backend would leave behind.
    pub fn error_file(&self, queue: &Queue, id: u64, text: &str) {
        let task = queue
            .tasks()
            .iter()
            .find(|t| t.id == id)
            .expect("No such task");
        fs::write(queue.scheduler().error_file(task), text).expect("Failed to write error file");
    }
}

/// A task in `folder` with dependencies given relative to it.
pub fn make_task(folder: &Path, cmd: &str, deps: &[&str]) -> Task {
    task(
        cmd,
        TaskOptions {
            folder: folder.to_path_buf(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            ..TaskOptions::default()
        },
    )
    .expect("Failed to create task")
}

pub type Calls = Rc<RefCell<Vec<(String, Vec<String>, Option<String>)>>>;

/// Replays canned stdout per program and records every call.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    pub calls: Calls,
    replies: Rc<RefCell<VecDeque<(String, String)>>>,
}

impl ScriptedRunner {
    pub fn reply(&self, program: &str, stdout: &str) {
        self.replies
            .borrow_mut()
            .push_back((program.to_string(), stdout.to_string()));
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(p, _, _)| p.clone()).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        self.calls
            .borrow_mut()
            .push((program.to_string(), args.to_vec(), stdin.map(str::to_string)));
        let mut replies = self.replies.borrow_mut();
        let stdout = match replies.iter().position(|(p, _)| p == program) {
            Some(i) => replies.remove(i).map(|(_, out)| out).unwrap_or_default(),
            None => String::new(),
        };
        Ok(CommandOutput {
            code: 0,
            stdout,
            stderr: String::new(),
        })
    }
}
