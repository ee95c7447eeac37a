use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::resources::Node;
use crate::scheduler::{self, SystemRunner};
use crate::{mqlog_debug, Error, Result};

/// Name of the per-queue state folder.
pub const QUEUE_DIR: &str = ".myqueue";

/// Contents of `<home>/.myqueue/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Backend name: `lsf` or `test`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    /// Extra arguments appended to every submission command.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Hold queued tasks while the summed `diskspace` exceeds this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_diskspace: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpiexec: Option<String>,
    /// Program that executes `WorkflowTask` commands in target mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_runner: Option<String>,
    /// Node classes in order of preference for `Resources::select`.
    /// Kept last: TOML tables must follow plain values.
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// Programs used when rendering a command into a job-script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreters {
    pub serial_python: String,
    pub parallel_python: String,
    pub mpiexec: String,
    pub workflow_runner: String,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            serial_python: "python3".to_string(),
            parallel_python: "python3".to_string(),
            mpiexec: "mpiexec".to_string(),
            workflow_runner: "mq".to_string(),
        }
    }
}

impl Config {
    /// Find the queue home: the closest ancestor of `start` holding a
    /// `.myqueue` folder, falling back to the user's home directory.
    pub fn find_home(start: &Path) -> Result<PathBuf> {
        for dir in start.ancestors() {
            if dir.join(QUEUE_DIR).is_dir() {
                mqlog_debug!("Config::find_home found {}", dir.display());
                return Ok(dir.to_path_buf());
            }
        }
        dirs::home_dir().ok_or(Error::NoHomeDir)
    }

    pub fn queue_dir(home: &Path) -> PathBuf {
        home.join(QUEUE_DIR)
    }

    pub fn config_path(home: &Path) -> PathBuf {
        Self::queue_dir(home).join("config.toml")
    }

    pub fn load(home: &Path) -> Result<Self> {
        let path = Self::config_path(home);
        mqlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mqlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        mqlog_debug!(
            "Config loaded: scheduler={:?}, nodes={}",
            config.scheduler,
            config.nodes.len()
        );
        Ok(config)
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        let dir = Self::queue_dir(home);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path(home);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mqlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn scheduler_name(&self, home: &Path) -> Result<&str> {
        self.scheduler.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "Please specify type of scheduler in {} (must be 'lsf' or 'test')",
                Self::config_path(home).display()
            ))
        })
    }

    /// Configured nodes, or a single anonymous 1-core node.
    pub fn nodes_or_default(&self) -> Vec<Node> {
        if self.nodes.is_empty() {
            vec![Node::new("", 1)]
        } else {
            self.nodes.clone()
        }
    }

    pub fn interpreters(&self) -> Interpreters {
        let defaults = Interpreters::default();
        let serial = self
            .serial_python
            .clone()
            .unwrap_or(defaults.serial_python);
        Interpreters {
            parallel_python: self.parallel_python.clone().unwrap_or_else(|| serial.clone()),
            serial_python: serial,
            mpiexec: self.mpiexec.clone().unwrap_or(defaults.mpiexec),
            workflow_runner: self
                .workflow_runner
                .clone()
                .unwrap_or(defaults.workflow_runner),
        }
    }
}

/// Guess a configuration for this machine.
///
/// Without an explicit scheduler name, the first submission program found
/// on `PATH` decides. Node shapes come from the backend's `get_config`.
pub fn guess_configuration(scheduler_name: Option<&str>, queue_name: &str) -> Result<Config> {
    let name = match scheduler_name {
        Some(name) => name.to_string(),
        None => guess_scheduler_name().ok_or_else(|| {
            Error::Config("Could not find bsub, sbatch or qsub on PATH".to_string())
        })?,
    };
    mqlog_debug!("guess_configuration scheduler={} queue={}", name, queue_name);

    let mut config = Config {
        scheduler: Some(name.clone()),
        ..Config::default()
    };
    let backend = scheduler::create_scheduler(&name, &config, Path::new("."), Box::new(SystemRunner))?;
    let (nodes, extra_args) = backend.get_config(queue_name)?;
    config.nodes = nodes;
    config.extra_args = extra_args;
    Ok(config)
}

fn guess_scheduler_name() -> Option<String> {
    [("bsub", "lsf"), ("sbatch", "slurm"), ("qsub", "pbs")]
        .iter()
        .find(|(program, _)| which::which(program).is_ok())
        .map(|(_, name)| name.to_string())
}
