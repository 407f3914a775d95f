//! Cooperative lock files
//!
//! The study may live on a network filesystem shared by hosts of different platforms, kernel
//! level locks are not reliable there. A lock is held by whoever managed to create the lock file
//! exclusively, everybody else polls until the file disappears or the timeout elapses.

use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Could not acquire {} within {timeout:?}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("Failed to create lock file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SoftLock {
    path: PathBuf,
    timeout: Duration,
}

/// Releases the lock by removing the lock file once dropped
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Released lock"),
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to release lock"),
        }
    }
}

/// `<hostname>:<pid>`, written into the lock file to tell users who holds it
fn owner() -> String {
    let hostname = nix::unistd::gethostname()
        .map(|hostname| hostname.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("unknown"));

    format!("{hostname}:{}", std::process::id())
}

impl SoftLock {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        let start = Instant::now();
        let mut announced = false;

        loop {
            // create_new maps to O_EXCL, only one contender can succeed
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let guard = LockGuard {
                        path: self.path.clone(),
                    };
                    writeln!(file, "{}", owner()).map_err(|source| LockError::Io {
                        path: self.path.clone(),
                        source,
                    })?;
                    debug!(path = ?self.path, "Acquired lock");

                    return Ok(guard);
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() >= self.timeout {
                        return Err(LockError::Timeout {
                            path: self.path.clone(),
                            timeout: self.timeout,
                        });
                    }

                    if !announced {
                        let holder = std::fs::read_to_string(&self.path).unwrap_or_default();
                        info!(
                            holder = holder.trim(),
                            "Waiting for lock {}",
                            self.path.display()
                        );
                        announced = true;
                    }

                    thread::sleep(POLL_INTERVAL.min(self.timeout));
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SoftLock::new(dir.path().join("tree.yaml.lock"), Duration::from_millis(200));

        let guard = lock.acquire().unwrap();
        assert!(lock.path().is_file());
        assert!(std::fs::read_to_string(lock.path())
            .unwrap()
            .contains(&format!(":{}", std::process::id())));

        assert!(matches!(lock.acquire(), Err(LockError::Timeout { .. })));

        drop(guard);
        assert!(!lock.path().exists());
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn waits_for_the_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SoftLock::new(dir.path().join("tree.yaml.lock"), Duration::from_secs(5));
        let guard = lock.acquire().unwrap();

        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            drop(guard);
        });

        assert!(lock.acquire().is_ok());
        release.join().unwrap();
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SoftLock::new(dir.path().join("missing/tree.yaml.lock"), Duration::from_secs(1));

        assert!(matches!(lock.acquire(), Err(LockError::Io { .. })));
    }
}
