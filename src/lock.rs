//! Advisory lock file guarding the queue state.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::{mqlog_debug, Error, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Held while the lock file exists; removed on drop.
#[derive(Debug)]
pub struct Lock {
    path: PathBuf,
}

impl Lock {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

    /// Create `path` exclusively, retrying until `timeout` has passed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Lock> {
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    mqlog_debug!("Lock acquired: {}", path.display());
                    return Ok(Lock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(Error::Locked {
                            path: path.to_path_buf(),
                            age_secs: age(path),
                        });
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            mqlog_debug!("Lock release failed for {}: {}", self.path.display(), e);
        } else {
            mqlog_debug!("Lock released: {}", self.path.display());
        }
    }
}

fn age(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.json.lock");
        {
            let lock = Lock::acquire(&path, Lock::DEFAULT_TIMEOUT).unwrap();
            assert!(lock.path().exists());
        }
        assert!(!path.exists());
        let _again = Lock::acquire(&path, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_contention_times_out_with_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue.json.lock");
        let _held = Lock::acquire(&path, Duration::ZERO).unwrap();

        let start = Instant::now();
        let err = Lock::acquire(&path, Duration::from_millis(250)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(250));
        match err {
            Error::Locked { path: locked, .. } => assert_eq!(locked, path),
            other => panic!("unexpected error: {}", other),
        }
    }
}
