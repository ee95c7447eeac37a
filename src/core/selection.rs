//! Picking tasks out of the queue.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::core::task::{Task, TaskState};
use crate::{Error, Result};

/// A filter over tasks.
///
/// With explicit ids only those ids are selected. Otherwise a task must
/// pass every filter that is set: state, folder, name pattern and error
/// pattern.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub ids: BTreeSet<u64>,
    pub name: Option<glob::Pattern>,
    /// Empty means every state.
    pub states: BTreeSet<TaskState>,
    /// Empty means every folder.
    pub folders: Vec<PathBuf>,
    /// Also match tasks in subfolders of `folders`.
    pub recursive: bool,
    pub error: Option<glob::Pattern>,
}

impl Selection {
    pub fn ids(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, pattern: &str) -> Result<Self> {
        self.name = Some(glob::Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn with_error(mut self, pattern: &str) -> Result<Self> {
        self.error = Some(glob::Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.ids.is_empty() {
            return self.ids.contains(&task.id);
        }
        if !self.states.is_empty() && !self.states.contains(&task.state()) {
            return false;
        }
        if !self.folders.is_empty() {
            let inside = self.folders.iter().any(|folder| {
                if self.recursive {
                    task.folder.starts_with(folder)
                } else {
                    &task.folder == folder
                }
            });
            if !inside {
                return false;
            }
        }
        if let Some(pattern) = &self.name {
            if !pattern.matches(&task.name()) {
                return false;
            }
        }
        if let Some(pattern) = &self.error {
            if !pattern.matches(&task.error) {
                return false;
            }
        }
        true
    }

    /// Indices of the matching tasks, in queue order.
    pub fn select(&self, tasks: &[Task]) -> Vec<usize> {
        tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| self.matches(task))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Parse a state filter: single-letter codes (`qhr`, `FTM`), `a` for all,
/// or comma-separated names (`done,FAILED`).
pub fn parse_states(s: &str) -> Result<BTreeSet<TaskState>> {
    let as_names = s.contains(',') || (s.len() > 1 && s.parse::<TaskState>().is_ok());
    if as_names {
        return s
            .split(',')
            .filter(|name| !name.is_empty())
            .map(str::parse)
            .collect();
    }
    s.chars()
        .map(|c| match c {
            'a' => Ok(TaskState::ALL.to_vec()),
            c => TaskState::from_code(c)
                .map(|state| vec![state])
                .ok_or_else(|| Error::Validation(format!("Unknown state code: {}", c))),
        })
        .collect::<Result<Vec<_>>>()
        .map(|groups| groups.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::Command;
    use crate::core::resources::Resources;
    use std::path::Path;

    fn make(name: &str, folder: &str, id: u64) -> Task {
        let mut task = Task::new(
            Command::parse(name).unwrap(),
            Resources::default(),
            PathBuf::from(folder),
        );
        task.id = id;
        task
    }

    fn tasks() -> Vec<Task> {
        let mut failed = make("b.py", "/w/sub", 2);
        failed.set_state(TaskState::Running).unwrap();
        failed.set_state(TaskState::Failed).unwrap();
        failed.error = "MemoryError: boom".to_string();
        vec![make("a.py 1", "/w", 1), failed, make("shell:ls", "/w/sub/deep", 3)]
    }

    #[test]
    fn test_ids_override_other_filters() {
        let mut sel = Selection::ids([2, 3]);
        sel.states.insert(TaskState::Queued);
        assert_eq!(sel.select(&tasks()), vec![1, 2]);
    }

    #[test]
    fn test_empty_selection_matches_everything() {
        assert_eq!(Selection::default().select(&tasks()), vec![0, 1, 2]);
    }

    #[test]
    fn test_states_and_folders() {
        let mut sel = Selection::default();
        sel.folders.push(PathBuf::from("/w/sub"));
        assert_eq!(sel.select(&tasks()), vec![1]);
        sel.recursive = true;
        assert_eq!(sel.select(&tasks()), vec![1, 2]);
        sel.states = parse_states("q").unwrap();
        assert_eq!(sel.select(&tasks()), vec![2]);
        assert!(!Path::new("/w/subway").starts_with("/w/sub"));
    }

    #[test]
    fn test_name_and_error_patterns() {
        let sel = Selection::default().with_name("a.py*").unwrap();
        assert_eq!(sel.select(&tasks()), vec![0]);
        let sel = Selection::default().with_error("*Memory*").unwrap();
        assert_eq!(sel.select(&tasks()), vec![1]);
        assert!(Selection::default().with_name("[").is_err());
    }

    #[test]
    fn test_parse_states() {
        let states = parse_states("qhr").unwrap();
        assert_eq!(states.len(), 3);
        assert!(states.contains(&TaskState::Hold));
        assert_eq!(parse_states("a").unwrap().len(), 8);
        let states = parse_states("done,FAILED").unwrap();
        assert!(states.contains(&TaskState::Done) && states.contains(&TaskState::Failed));
        assert_eq!(parse_states("TIMEOUT").unwrap().len(), 1);
        assert!(parse_states("x").is_err());
    }
}
