//! Front-end for batch schedulers: tasks with resources and dependencies,
//! a persisted queue, and workflows collected from ordinary code.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod lock;
pub mod log;
pub mod queue;
pub mod scheduler;
pub mod workflow;

pub use error::{Error, Result};
