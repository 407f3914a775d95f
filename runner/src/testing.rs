//! Scripted shell and throwaway studies for tests

use crate::{
    config::RunnerConfig,
    shell::{CommandOutput, ProcessInfo, Shell, ShellError},
    sync::study::Study,
};
use parking_lot::Mutex;
use std::fs;
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    output: CommandOutput,
    once: bool,
}

/// [`Shell`] replaying canned output for every command line containing a pattern
///
/// Later rules win over earlier ones, commands without a matching rule succeed silently.
#[derive(Debug)]
pub struct ScriptedShell {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
    processes: Vec<ProcessInfo>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            processes: Vec::new(),
        }
    }

    pub fn with_processes(mut self, processes: Vec<ProcessInfo>) -> Self {
        self.processes = processes;
        self
    }

    pub fn respond_with(&self, pattern: &str, output: CommandOutput, once: bool) {
        self.rules.lock().push(Rule {
            pattern: pattern.to_owned(),
            output,
            once,
        });
    }

    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.respond_with(pattern, success(stdout), false);
    }

    pub fn respond_once(&self, pattern: &str, stdout: &str) {
        self.respond_with(pattern, success(stdout), true);
    }

    /// exit with status 1 and `stderr`
    pub fn fail(&self, pattern: &str, stderr: &str) {
        self.respond_with(
            pattern,
            CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: stderr.to_owned(),
            },
            false,
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }

    pub fn detached(&self) -> Vec<String> {
        self.detached.lock().clone()
    }
}

fn success(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Shell for ScriptedShell {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ShellError> {
        let line = command_line(program, args);
        self.calls.lock().push(line.clone());

        let mut rules = self.rules.lock();
        let Some(index) = rules.iter().rposition(|rule| line.contains(&rule.pattern)) else {
            return Ok(success(""));
        };

        Ok(if rules[index].once {
            rules.remove(index).output
        } else {
            rules[index].output.clone()
        })
    }

    fn spawn_detached(&self, program: &str, args: &[String]) -> Result<(), ShellError> {
        self.detached.lock().push(command_line(program, args));

        Ok(())
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        self.processes.clone()
    }

    fn username(&self) -> Option<String> {
        Some("alice".to_owned())
    }
}

/// A study in a temporary directory with a configuration pointing at it
pub struct Fixture {
    pub dir: TempDir,
    pub config: RunnerConfig,
    pub study: Study,
}

pub fn fixture(tree: &str) -> Fixture {
    fixture_with(tree, "")
}

/// `extra` is appended to the generated configuration
pub fn fixture_with(tree: &str, extra: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    fs::write(root.join("tree.yaml"), tree).unwrap();

    let config: RunnerConfig = serde_yaml::from_str(&format!(
        "tree: {}\nlock_timeout: 1\n{extra}",
        root.join("tree.yaml").display()
    ))
    .unwrap();
    let study = Study::open(&config.tree, config.lock_timeout()).unwrap();

    Fixture { dir, config, study }
}
