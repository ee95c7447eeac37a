//! IBM Spectrum LSF backend.
//!
//! Jobs are submitted with `bsub`, reading a generated job script from
//! stdin. The script touches `<home>/.myqueue/lsf-<jobid>-<n>` change
//! files when the job starts (0), succeeds (1) or fails (2).

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Config, Interpreters, QUEUE_DIR};
use crate::core::resources::{parse_memory, Node};
use crate::core::task::Task;
use crate::scheduler::{check_output, file_stem, CommandRunner, Scheduler};
use crate::{mqlog, Error, Result};

const TIMEOUT_MARKER: &str = "TERM_RUNLIMIT:";

pub struct Lsf {
    home: PathBuf,
    nodes: Vec<Node>,
    extra_args: Vec<String>,
    interpreters: Interpreters,
    runner: Box<dyn CommandRunner>,
}

impl Lsf {
    pub fn new(config: &Config, home: &Path, runner: Box<dyn CommandRunner>) -> Self {
        Self {
            home: home.to_path_buf(),
            nodes: config.nodes_or_default(),
            extra_args: config.extra_args.clone(),
            interpreters: config.interpreters(),
            runner,
        }
    }

    /// Arguments for `bsub`.
    pub fn submit_args(&self, task: &Task) -> Result<Vec<String>> {
        let (count, node) = task.resources.select(&self.nodes)?;
        let name = file_stem(task);
        let folder = task.folder.display();

        let minutes = task.resources.tmax().max(60) / 60;
        let mut args = vec![
            "-J".to_string(),
            name.clone(),
            "-W".to_string(),
            format!("{}:{:02}", minutes / 60, minutes % 60),
            "-n".to_string(),
            task.resources.cores().to_string(),
            "-o".to_string(),
            format!("{}/{}.%J.out", folder, name),
            "-e".to_string(),
            format!("{}/{}.%J.err", folder, name),
        ];

        if let Some(memory) = node.memory_bytes()? {
            let per_core = memory / (1 << 20) / u64::from(node.cores.max(1));
            args.push("-R".to_string());
            args.push(format!("rusage[mem={}MB]", per_core));
        }
        args.push("-R".to_string());
        args.push(format!("span[hosts={}]", count));

        if let Some(nodename) = task.resources.nodename() {
            args.push("-q".to_string());
            args.push(nodename.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.extend(node.extra_args.iter().cloned());

        if !task.dependency_ids.is_empty() {
            let wait = task
                .dependency_ids
                .iter()
                .map(|id| format!("done({})", id))
                .collect::<Vec<_>>()
                .join(" && ");
            args.push("-w".to_string());
            args.push(wait);
        }
        Ok(args)
    }

    /// The job script fed to `bsub` on stdin.
    pub fn job_script(&self, task: &Task) -> String {
        let mut lines = vec!["#!/bin/bash -l".to_string()];
        if let Some(script) = &task.activation_script {
            lines.push(format!("source {}", script.display()));
        }
        lines.push(format!(
            "mq={}/lsf-$LSB_JOBID",
            self.home.join(QUEUE_DIR).display()
        ));
        lines.push(format!(
            "(touch $mq-0 && cd {} && {} && touch $mq-1) || (touch $mq-2; exit 1)",
            task.folder.display(),
            task.cmd
                .invocation(&self.interpreters, task.resources.processes())
        ));
        lines.join("\n") + "\n"
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        check_output(&*self.runner, program, args, None)
    }
}

impl Scheduler for Lsf {
    fn name(&self) -> &str {
        "lsf"
    }

    fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()> {
        let args = self.submit_args(task)?;
        let script = self.job_script(task);
        if dry_run {
            println!("bsub {}", args.join(" "));
            print!("{}", script);
            return Ok(());
        }
        let stdout = check_output(&*self.runner, "bsub", &args, Some(&script))?;
        task.id = parse_job_id(&stdout)?;
        mqlog!("Submitted {} as LSF job {}", task.dname().display(), task.id);
        Ok(())
    }

    fn cancel(&self, task: &Task) -> Result<()> {
        self.run("bkill", &[task.id.to_string()])?;
        Ok(())
    }

    fn get_ids(&self) -> Result<BTreeSet<u64>> {
        let stdout = self.run("bjobs", &[])?;
        Ok(stdout
            .lines()
            .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|id| id.parse().ok())
            .collect())
    }

    fn hold(&self, task: &Task) -> Result<()> {
        self.run("bstop", &[task.id.to_string()])?;
        Ok(())
    }

    fn release_hold(&self, task: &Task) -> Result<()> {
        self.run("bresume", &[task.id.to_string()])?;
        Ok(())
    }

    fn timeout_marker(&self) -> Option<&str> {
        Some(TIMEOUT_MARKER)
    }

    fn has_timed_out(&self, task: &Task) -> bool {
        fs::read_to_string(self.error_file(task))
            .map(|text| text.lines().any(|line| line.starts_with(TIMEOUT_MARKER)))
            .unwrap_or(false)
    }

    fn get_config(&self, queue: &str) -> Result<(Vec<Node>, Vec<String>)> {
        let stdout = self.run("nodestat", &["-F".to_string(), queue.to_string()])?;
        Ok((parse_nodestat(&stdout), Vec::new()))
    }
}

/// `Job <1234> is submitted to queue <normal>.` gives 1234.
pub fn parse_job_id(stdout: &str) -> Result<u64> {
    stdout
        .split_whitespace()
        .nth(1)
        .map(|token| token.trim_start_matches('<').trim_end_matches('>'))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| Error::Validation(format!("Can't find job id in bsub output: {:?}", stdout)))
}

/// Parse `nodestat -F` output into node classes.
///
/// Columns: id, state, procs (`used:total`), load, name, memory, unit.
/// Nodes that are neither idle nor busy are down and skipped. A node name
/// seen several times keeps its smallest memory.
pub fn parse_nodestat(stdout: &str) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::new();
    for line in stdout.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        let [_, state, procs, _, name, memory, unit, ..] = words.as_slice() else {
            continue;
        };
        if !matches!(*state, "Idle" | "Busy") {
            continue;
        }
        let Some(cores) = procs
            .rsplit(':')
            .next()
            .and_then(|total| total.parse::<u32>().ok())
        else {
            continue;
        };
        let memory = format!("{}{}", memory, unit);
        let Ok(bytes) = parse_memory(&memory) else {
            continue;
        };

        match nodes.iter_mut().find(|node| node.name == *name) {
            Some(node) => {
                let smaller = node
                    .memory_bytes()
                    .ok()
                    .flatten()
                    .map_or(true, |current| bytes < current);
                if smaller {
                    node.memory = Some(memory);
                }
            }
            None => {
                let mut node = Node::new(name, cores);
                node.memory = Some(memory);
                nodes.push(node);
            }
        }
    }
    nodes
}
