//! Boundary to the host: scheduler CLIs, detached scripts and the process table

use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Failed to spawn {0}")]
    Spawn(String, #[source] std::io::Error),
    #[error("Failed to wait for a child process")]
    ChildError(#[from] std::io::Error),
    #[error("{0} did not finish within {1:?}")]
    ChildTimeout(String, Duration),
    #[error("{program} exited with {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// A live process as seen in the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
}

pub trait Shell {
    /// run `program` to completion and capture its output
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ShellError>;

    /// start `program` without waiting for it
    fn spawn_detached(&self, program: &str, args: &[String]) -> Result<(), ShellError>;

    fn processes(&self) -> Vec<ProcessInfo>;

    /// name of the user owning this process, used to filter scheduler queues
    fn username(&self) -> Option<String>;
}

/// [`Shell`] backed by real subprocesses
#[derive(Debug, Clone)]
pub struct SystemShell {
    timeout: Duration,
}

impl SystemShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// drain a pipe on a separate thread so a chatty child can't fill it and stall
fn read_in_background<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        pipe.read_to_end(&mut buffer)?;

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    })
}

fn collect(handle: Option<JoinHandle<std::io::Result<String>>>) -> Result<String, ShellError> {
    match handle {
        Some(handle) => handle.join().unwrap_or_else(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "pipe reader panicked",
            ))
        })
        .map_err(ShellError::from),
        None => Ok(String::new()),
    }
}

impl Shell for SystemShell {
    #[tracing::instrument(level = "debug", skip(self))]
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ShellError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| ShellError::Spawn(program.to_owned(), error))?;

        let stdout = child.stdout.take().map(read_in_background);
        let stderr = child.stderr.take().map(read_in_background);

        debug!("Waiting on {program} ({})", child.id());
        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                warn!("{program} ran into timeout, killing it");
                child.kill()?;
                child.wait()?;

                return Err(ShellError::ChildTimeout(program.to_owned(), self.timeout));
            }
        };

        let output = CommandOutput {
            status: status.code(),
            stdout: collect(stdout)?,
            stderr: collect(stderr)?,
        };
        trace!(stdout = %output.stdout, stderr = %output.stderr, "Output from {program}");

        Ok(output)
    }

    fn spawn_detached(&self, program: &str, args: &[String]) -> Result<(), ShellError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| ShellError::Spawn(program.to_owned(), error))?;

        debug!("Started {program} in the background ({})", child.id());

        Ok(())
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        let system = System::new_all();

        system
            .processes()
            .values()
            .map(|process| ProcessInfo {
                cmdline: process.cmd().to_vec(),
                cwd: process
                    .cwd()
                    .filter(|cwd| !cwd.as_os_str().is_empty())
                    .map(Path::to_path_buf),
            })
            .collect()
    }

    fn username(&self) -> Option<String> {
        match nix::unistd::User::from_uid(nix::unistd::getuid()) {
            Ok(Some(user)) => Some(user.name),
            Ok(None) | Err(_) => std::env::var("USER").ok(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn captures_output() {
        let shell = SystemShell::new(Duration::from_secs(10));
        let output = shell
            .run(
                "sh",
                &["-c".to_owned(), "echo out; echo err >&2; exit 3".to_owned()],
            )
            .unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.status, Some(3));
        assert!(!output.success());
    }

    #[test]
    fn kills_children_on_timeout() {
        let shell = SystemShell::new(Duration::from_millis(100));

        assert!(matches!(
            shell.run("sleep", &["5".to_owned()]),
            Err(ShellError::ChildTimeout(..))
        ));
    }

    #[test]
    fn missing_programs_fail_to_spawn() {
        let shell = SystemShell::new(Duration::from_secs(1));

        assert!(matches!(
            shell.run("/definitely/not/a/scheduler", &[]),
            Err(ShellError::Spawn(..))
        ));
    }
}
