//! Mapping live scheduler and process state back onto job paths

use crate::{
    config::RunnerConfig,
    executors::{htcondor, local, slurm, ExecutorError, Family, SubmissionType},
    idmap::IdentifierMap,
    shell::{CommandOutput, Shell, ShellError},
    sync::study::Study,
};
use itertools::Itertools;
use std::{collections::BTreeSet, fmt, path::PathBuf};
use tracing::{debug, info, warn};

/// Scheduler state relevant for resubmission decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Running,
    Queuing,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Queuing => "queuing",
        })
    }
}

/// Job paths currently known to the outside world
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    pub running: Vec<String>,
    pub queuing: Vec<String>,
    /// scheduler ids listed for the current user that are not in the identifier map
    pub foreign: BTreeSet<u64>,
}

impl ClusterState {
    pub fn state_of(&self, path: &str) -> Option<JobState> {
        if self.running.iter().any(|running| running == path) {
            Some(JobState::Running)
        } else if self.queuing.iter().any(|queuing| queuing == path) {
            Some(JobState::Queuing)
        } else {
            None
        }
    }

    /// every path that is either running or queuing
    pub fn live(&self) -> BTreeSet<String> {
        self.running
            .iter()
            .chain(self.queuing.iter())
            .cloned()
            .collect()
    }
}

/// Queries local processes and batch schedulers for the jobs of a single study
pub struct Reconciler<'a, S: Shell + ?Sized> {
    shell: &'a S,
    study: &'a Study,
    entrypoint: &'a str,
    query_individually: bool,
}

impl<'a, S: Shell + ?Sized> Reconciler<'a, S> {
    pub fn new(shell: &'a S, study: &'a Study, config: &'a RunnerConfig) -> Self {
        Self {
            shell,
            study,
            entrypoint: &config.entrypoint,
            query_individually: config.scheduler.query_individually,
        }
    }

    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecutorError> {
        let command = || format!("{program} {}", args.join(" "));

        let output = self
            .shell
            .run(program, args)
            .map_err(|source| ExecutorError::Command {
                command: command(),
                source,
            })?;

        if !output.success() {
            return Err(ExecutorError::Command {
                command: command(),
                source: ShellError::Failed {
                    program: program.to_owned(),
                    status: output.status,
                    stderr: output.stderr,
                },
            });
        }

        Ok(output)
    }

    /// Job paths of every backend in `submission_types` that are currently in `state`
    ///
    /// `ids` is the identifier map as found on disk, `None` if it was never written.
    #[tracing::instrument(level = "debug", skip(self, ids))]
    pub fn query(
        &self,
        submission_types: &BTreeSet<SubmissionType>,
        state: JobState,
        ids: Option<&IdentifierMap>,
    ) -> Result<Vec<String>, ExecutorError> {
        let mut foreign = BTreeSet::new();
        let paths = self.collect(submission_types, state, ids, &mut foreign)?;
        log_foreign(&foreign);

        Ok(paths)
    }

    fn collect(
        &self,
        submission_types: &BTreeSet<SubmissionType>,
        state: JobState,
        ids: Option<&IdentifierMap>,
        foreign: &mut BTreeSet<u64>,
    ) -> Result<Vec<String>, ExecutorError> {
        let families = submission_types
            .iter()
            .map(SubmissionType::family)
            .collect::<BTreeSet<_>>();

        let mut paths = Vec::new();
        for family in families {
            match family {
                Family::Local if state == JobState::Running => paths.extend(self.local_jobs()),
                Family::Local => {}
                _ => paths.extend(self.scheduler_jobs(family, state, ids, foreign)?),
            }
        }

        Ok(paths.into_iter().unique().collect())
    }

    /// run scripts of this study found in the process table
    fn local_jobs(&self) -> Vec<String> {
        self.shell
            .processes()
            .iter()
            .filter_map(|process| {
                local::job_dir_from_cmdline(&process.cmdline, process.cwd.as_deref(), self.entrypoint)
            })
            .filter_map(|dir| self.study.job_path(&dir))
            .unique()
            .collect()
    }

    fn scheduler_jobs(
        &self,
        family: Family,
        state: JobState,
        ids: Option<&IdentifierMap>,
        foreign: &mut BTreeSet<u64>,
    ) -> Result<Vec<String>, ExecutorError> {
        let entries = match family {
            Family::HtCondor => {
                let args = htcondor::QUEUE_ARGS.map(str::to_owned);
                htcondor::parse_queue(&self.run("condor_q", &args)?.stdout)
            }
            Family::Slurm => {
                let user = self.shell.username();
                if user.is_none() {
                    warn!("Could not determine the current user, listing the whole Slurm queue");
                }
                let args = slurm::queue_args(user.as_deref(), state);
                slurm::parse_queue(&self.run("squeue", &args)?.stdout)
            }
            Family::Local => return Ok(Vec::new()),
        };

        let scheduler_ids = entries
            .into_iter()
            .filter(|(_, entry_state)| *entry_state == state)
            .map(|(id, _)| id)
            .unique()
            .collect::<Vec<_>>();

        let mut paths = Vec::new();
        match ids {
            Some(map) => {
                for id in scheduler_ids {
                    match map.get(id) {
                        Some(path) => paths.push(path.to_owned()),
                        None => {
                            foreign.insert(id);
                        }
                    }
                }
            }
            None if self.query_individually && !scheduler_ids.is_empty() => {
                warn!(
                    "No identifier map found, querying {} {state} {family} jobs individually",
                    scheduler_ids.len()
                );
                paths.extend(
                    scheduler_ids
                        .into_iter()
                        .filter_map(|id| self.resolve_individually(family, id)),
                );
            }
            None if !scheduler_ids.is_empty() => {
                warn!(
                    "No identifier map found, ignoring {} {state} {family} jobs",
                    scheduler_ids.len()
                );
            }
            None => {}
        }

        Ok(paths)
    }

    /// job path of scheduler job `id` taken from its detailed description
    ///
    /// A job can leave the scheduler between the listing and its detail query. Failed or
    /// unparsable descriptions leave the job unresolved instead of aborting the pass.
    fn resolve_individually(&self, family: Family, id: u64) -> Option<String> {
        let (program, args) = match family {
            Family::HtCondor => ("condor_q", vec!["-long".to_owned(), id.to_string()]),
            Family::Slurm => (
                "scontrol",
                ["show", "jobid", "-dd"]
                    .iter()
                    .map(|argument| argument.to_string())
                    .chain([id.to_string()])
                    .collect::<Vec<_>>(),
            ),
            Family::Local => return None,
        };

        let output = match self.run(program, &args) {
            Ok(output) => output,
            Err(error) => {
                warn!(id, error = %error, "Could not describe {family} job {id}, skipping it");
                return None;
            }
        };

        let job_dir: Option<PathBuf> = match family {
            Family::HtCondor => htcondor::parse_job_dir(&output.stdout, self.entrypoint),
            Family::Slurm => slurm::parse_job_dir(&output.stdout, self.entrypoint),
            Family::Local => None,
        };
        if job_dir.is_none() {
            debug!(id, "No run script in the description of {family} job {id}");
        }

        let path = job_dir.and_then(|dir| self.study.job_path(&dir));
        debug!(id = id, path = ?path, "Resolved scheduler job");

        path
    }

    /// Query running and queuing jobs, then prune identifiers of jobs in `scope` that left
    ///
    /// The caller persists `ids` while holding the study lock.
    pub fn reconcile(
        &self,
        submission_types: &BTreeSet<SubmissionType>,
        scope: &BTreeSet<String>,
        ids: &mut Option<IdentifierMap>,
    ) -> Result<ClusterState, ExecutorError> {
        let mut foreign = BTreeSet::new();
        let running = self.collect(submission_types, JobState::Running, ids.as_ref(), &mut foreign)?;
        let queuing = self.collect(submission_types, JobState::Queuing, ids.as_ref(), &mut foreign)?;
        log_foreign(&foreign);

        let state = ClusterState {
            running,
            queuing,
            foreign,
        };

        if let Some(map) = ids.as_mut() {
            let removed = map.prune(scope, &state.live());
            if !removed.is_empty() {
                info!(ids = ?removed, "Removed {} finished jobs from the identifier map", removed.len());
            }
        }

        Ok(state)
    }
}

/// other studies share the scheduler, one line per pass is enough
fn log_foreign(foreign: &BTreeSet<u64>) {
    if !foreign.is_empty() {
        info!(
            ids = ?foreign,
            "Ignoring {} scheduler jobs that do not belong to this study",
            foreign.len()
        );
    }
}
