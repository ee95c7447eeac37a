//! `<name>.done` files holding the JSON result of a function task.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::task::Task;
use crate::{mqlog_debug, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached {
    path: PathBuf,
}

impl Cached {
    pub fn new(folder: &Path, fs_name: &str) -> Self {
        Self {
            path: folder.join(format!("{}.done", fs_name)),
        }
    }

    /// The cache shares the task's done marker.
    pub fn for_task(task: &Task) -> Self {
        Self::new(&task.folder, &task.fs_name())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has(&self) -> bool {
        self.path.is_file()
    }

    /// The stored value. An empty marker (written for tasks that return
    /// nothing) reads as `null`.
    pub fn read(&self) -> Result<serde_json::Value> {
        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, value: &serde_json::Value) -> Result<()> {
        fs::write(&self.path, serde_json::to_string(value)?)?;
        mqlog_debug!("Cached result in {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let cache = Cached::new(temp.path(), "flow.py:relax+1");
        assert!(!cache.has());
        cache.write(&json!({"energy": -1.5})).unwrap();
        assert!(cache.has());
        assert_eq!(cache.read().unwrap()["energy"], json!(-1.5));
    }

    #[test]
    fn test_empty_marker_reads_as_null() {
        let temp = TempDir::new().unwrap();
        let cache = Cached::new(temp.path(), "a");
        fs::write(cache.path(), "").unwrap();
        assert_eq!(cache.read().unwrap(), serde_json::Value::Null);
    }
}
