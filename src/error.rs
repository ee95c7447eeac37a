use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad resource specification: {0}")]
    InvalidResources(String),

    #[error("Bad command: {0}")]
    InvalidCommand(String),

    #[error("No such node: {0}")]
    NoSuchNode(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Can't escalate resources for a task in state {0}")]
    InvalidEscalation(String),

    #[error("{program} failed with exit code {code}: {stderr}")]
    Submission {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Locked {age_secs} seconds ago: {}", path.display())]
    Locked { path: PathBuf, age_secs: u64 },

    #[error("Missing dependency for {task}: {dependency}")]
    MissingDependency { task: String, dependency: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
