//! Core domain models.
//!
//! Resources, commands and tasks, the dependency graph built from task
//! lists, and task selection.

pub mod command;
pub mod dag;
pub mod resources;
pub mod selection;
pub mod task;

pub use command::{create_command, Command, CommandKind, CommandType};
pub use dag::DependencyGraph;
pub use resources::{Node, Resources};
pub use selection::Selection;
pub use task::{task, Reconciliation, ResourceArgs, Task, TaskOptions, TaskState};
