//! Submission orchestrator: from eligible jobs to scheduler identifiers
//!
//! A pass holds the study lock from the first read to the last write. Jobs are grouped per
//! submission type, every group is rendered into its artifacts, handed to the backend and the
//! returned identifiers are recorded before the next group starts.

use crate::{
    config::{ConfigErrors, RunnerConfig},
    dependency::DependencyGraph,
    executors::{check_families, ExecutorError, RenderContext, SubmissionType},
    idmap::IdentifierMap,
    reconcile::{ClusterState, JobState, Reconciler},
    registry::JobRegistry,
    shell::Shell,
    sync::study::{LockedStudy, Study},
    tree::{JobNode, JobStatus, JobTree},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

/// tree attribute consulted when the configuration has no container image
pub const CONTAINER_IMAGE_KEY: &str = "container_image";

/// A job selected for submission
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub path: String,
    pub submission_type: SubmissionType,
    pub node: JobNode,
}

/// Outcome of a submission pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub submitted: Vec<String>,
    pub artifacts: Vec<PathBuf>,
    pub identified: Vec<(u64, String)>,
    pub state: ClusterState,
}

/// Jobs that are configured, not completed and not waiting for an earlier generation
pub fn eligible_jobs(tree: &JobTree, registry: &JobRegistry) -> Result<Vec<Candidate>, ConfigErrors> {
    let graph = DependencyGraph::build(tree, registry);
    let mut candidates = Vec::new();

    for entry in registry.iter() {
        let Some(node) = tree.job(entry.keys.as_slice()) else {
            continue;
        };

        if node.status == JobStatus::Completed {
            debug!(job = %entry.path, "Already completed");
            continue;
        }

        let Some(submission_type) = node.submission_type()? else {
            warn!(job = %entry.path, "No submission_type configured, skipping");
            continue;
        };

        if !graph.is_eligible(&entry.path) {
            debug!(job = %entry.path, "Waiting for an earlier generation");
            continue;
        }

        candidates.push(Candidate {
            path: entry.path.clone(),
            submission_type,
            node,
        });
    }

    Ok(candidates)
}

/// Jobs whose identifiers may be pruned after querying `submission_types`
///
/// Identifiers of paths that vanished from the tree are always in scope.
fn tracked_scope(
    tree: &JobTree,
    registry: &JobRegistry,
    submission_types: &BTreeSet<SubmissionType>,
    ids: Option<&IdentifierMap>,
) -> BTreeSet<String> {
    let mut scope = registry
        .iter()
        .filter(|entry| {
            tree.job(entry.keys.as_slice())
                .and_then(|node| node.submission_type().ok().flatten())
                .map_or(false, |submission_type| submission_types.contains(&submission_type))
        })
        .map(|entry| entry.path.clone())
        .collect::<BTreeSet<_>>();

    if let Some(ids) = ids {
        scope.extend(
            ids.iter()
                .filter(|(_, path)| !registry.contains(path))
                .map(|(_, path)| path.to_owned()),
        );
    }

    scope
}

/// `<stem>_<suffix>.<extension>` next to `base`
fn derived_filename(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_stem()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("submission_file"));
    name.push("_");
    name.push(suffix);
    if let Some(extension) = base.extension() {
        name.push(".");
        name.push(extension);
    }

    base.with_file_name(name)
}

fn write_artifact(path: &Path, contents: &str) -> Result<(), ExecutorError> {
    let artifact_error = |source| ExecutorError::Artifact {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(artifact_error)?;
    }
    debug!(path = ?path, "Writing submission file");

    fs::write(path, contents).map_err(artifact_error)
}

pub struct Orchestrator<'a, S: Shell + ?Sized> {
    config: &'a RunnerConfig,
    study: &'a Study,
    shell: &'a S,
}

impl<'a, S: Shell + ?Sized> Orchestrator<'a, S> {
    pub fn new(config: &'a RunnerConfig, study: &'a Study, shell: &'a S) -> Self {
        Self {
            config,
            study,
            shell,
        }
    }

    fn reconciler(&self) -> Reconciler<'a, S> {
        Reconciler::new(self.shell, self.study, self.config)
    }

    /// base name of every artifact of this study
    pub fn submission_file(&self) -> PathBuf {
        self.config.submission_file.clone().unwrap_or_else(|| {
            self.study
                .root()
                .join("submission")
                .join("submission_file.sub")
        })
    }

    /// file batching all jobs of `submission_type`
    pub fn batch_filename(&self, submission_type: SubmissionType) -> PathBuf {
        derived_filename(&self.submission_file(), submission_type.as_str())
    }

    fn container_image<'t>(&'t self, tree: &'t JobTree) -> Option<&'t str> {
        self.config
            .container_image
            .as_deref()
            .or_else(|| tree.attribute(CONTAINER_IMAGE_KEY))
    }

    /// Render the submission artifacts for `jobs`
    ///
    /// Jobs that are completed, running or queuing are skipped. Returns the written artifacts and
    /// the paths of the jobs they submit, no artifact is left behind for an empty batch.
    #[tracing::instrument(level = "debug", skip(self, jobs, state, container_image))]
    pub fn write_artifacts(
        &self,
        submission_type: SubmissionType,
        batch_filename: &Path,
        jobs: &[Candidate],
        state: &ClusterState,
        container_image: Option<&str>,
    ) -> Result<(Vec<PathBuf>, Vec<String>), ExecutorError> {
        let mut artifacts = Vec::new();
        let mut submitted = Vec::new();
        let mut batch: Option<(String, String, String)> = None;

        for (index, job) in jobs.iter().enumerate() {
            if job.node.status == JobStatus::Completed {
                info!(job = %job.path, "Already completed, not submitting");
                continue;
            }
            match state.state_of(&job.path) {
                Some(JobState::Running) => {
                    info!(job = %job.path, "Already running, not submitting");
                    continue;
                }
                Some(JobState::Queuing) => {
                    info!(job = %job.path, "Already queuing, not submitting");
                    continue;
                }
                None => {}
            }

            let context = RenderContext {
                entrypoint: &self.config.entrypoint,
                context: job.node.context,
                container_image,
                job_flavour: self.config.job_flavour(),
                partition: self.config.slurm.partition_for(job.node.context),
            };
            let statement = submission_type.render(&self.study.job_dir(&job.path), &context)?;
            debug!(job = %job.path, "Adding to {submission_type} submission");

            if submission_type.one_file_per_job() {
                let filename = derived_filename(batch_filename, &index.to_string());
                write_artifact(
                    &filename,
                    &format!("{}{}{}", statement.head, statement.body, statement.tail),
                )?;
                artifacts.push(filename);
            } else {
                let (_, body, _) = batch.get_or_insert_with(|| {
                    (statement.head.clone(), String::new(), statement.tail.clone())
                });
                body.push_str(&statement.body);
            }

            submitted.push(job.path.clone());
        }

        if let Some((head, body, tail)) = batch {
            write_artifact(batch_filename, &format!("{head}{body}{tail}"))?;
            artifacts.push(batch_filename.to_path_buf());
        } else if !submission_type.one_file_per_job() && batch_filename.is_file() {
            debug!(path = ?batch_filename, "Removing stale submission file");
            fs::remove_file(batch_filename).map_err(|source| ExecutorError::Artifact {
                path: batch_filename.to_path_buf(),
                source,
            })?;
        }

        Ok((artifacts, submitted))
    }

    /// Hand `artifacts` to the backend and record the identifiers it announces
    ///
    /// `jobs` must be in artifact order, identifiers are assigned in that order. The map is only
    /// written once the scheduler confirmed the submission.
    pub fn submit(
        &self,
        locked: &LockedStudy,
        submission_type: SubmissionType,
        artifacts: &[PathBuf],
        jobs: &[String],
        ids: &mut Option<IdentifierMap>,
    ) -> Result<Vec<(u64, String)>, ExecutorError> {
        let arity_ok = if submission_type.one_file_per_job() {
            artifacts.len() == jobs.len()
        } else {
            artifacts.len() <= 1
        };
        if !arity_ok {
            return Err(ConfigErrors::SubmissionFileArity {
                backend: submission_type,
                files: artifacts.len(),
                jobs: jobs.len(),
            }
            .into());
        }

        if artifacts.is_empty() {
            info!("No {submission_type} job to submit");
            return Ok(Vec::new());
        }

        if submission_type == SubmissionType::Local {
            for artifact in artifacts {
                let command = submission_type.submit_command(artifact);
                info!("Starting {} local jobs in the background", jobs.len());
                self.shell
                    .spawn_detached(&command[0], &command[1..])
                    .map_err(|source| ExecutorError::Command {
                        command: command.join(" "),
                        source,
                    })?;
            }

            return Ok(Vec::new());
        }

        let mut extracted = Vec::new();
        for (index, artifact) in artifacts.iter().enumerate() {
            let command = submission_type.submit_command(artifact);
            info!("Submitting {}", artifact.display());

            let output = self
                .shell
                .run(&command[0], &command[1..])
                .map_err(|source| ExecutorError::Command {
                    command: command.join(" "),
                    source,
                })?;

            let confirmed = output
                .stdout
                .lines()
                .filter_map(|line| submission_type.parse_submitted_id(line))
                .collect::<Vec<_>>();

            if submission_type.reports_error(&output.stderr) {
                error!(stderr = %output.stderr, "{submission_type} rejected {}", artifact.display());

                // earlier single job files were accepted, keep track of them
                let recorded = submission_type.one_file_per_job() && extracted.len() == index;
                if recorded {
                    self.record(locked, &extracted, &jobs[..index], ids)?;
                }

                let unrecorded = if recorded {
                    confirmed.len()
                } else {
                    extracted.len() + confirmed.len()
                };
                extracted.extend(confirmed);
                if unrecorded > 0 {
                    error!(
                        jobs = ?jobs,
                        ids = ?extracted,
                        "{submission_type} accepted some jobs before failing, the identifier map needs manual reconciliation"
                    );
                }

                return Err(ExecutorError::Submission {
                    backend: submission_type,
                    filename: artifact.clone(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    ids: extracted,
                });
            }

            extracted.extend(confirmed);
        }

        if extracted.is_empty() {
            warn!("No identifiers found in the {submission_type} submission output, these jobs can't be tracked");
            return Ok(Vec::new());
        }

        if extracted.len() != jobs.len() {
            error!(
                jobs = ?jobs,
                ids = ?extracted,
                "Identifier count does not match the submitted jobs"
            );
            return Err(ExecutorError::InconsistentState {
                backend: submission_type,
                jobs: jobs.to_vec(),
                ids: extracted,
            });
        }

        self.record(locked, &extracted, jobs, ids)
    }

    fn record(
        &self,
        locked: &LockedStudy,
        extracted: &[u64],
        jobs: &[String],
        ids: &mut Option<IdentifierMap>,
    ) -> Result<Vec<(u64, String)>, ExecutorError> {
        let identified = extracted
            .iter()
            .copied()
            .zip(jobs.iter().cloned())
            .collect::<Vec<_>>();
        if identified.is_empty() {
            return Ok(identified);
        }

        let map = ids.get_or_insert_with(IdentifierMap::new);
        map.merge(identified.iter().cloned());
        locked.save_id_map(map)?;
        info!("Recorded {} scheduler identifiers", identified.len());

        Ok(identified)
    }

    /// Submit every eligible job that is not yet known to its backend
    pub fn run(&self) -> Result<SubmitReport, ExecutorError> {
        let locked = self.study.lock()?;
        let tree = locked.load_tree()?;
        let registry = JobRegistry::enumerate(&tree);

        let mut batches: BTreeMap<SubmissionType, Vec<Candidate>> = BTreeMap::new();
        for candidate in eligible_jobs(&tree, &registry)? {
            batches
                .entry(candidate.submission_type)
                .or_default()
                .push(candidate);
        }
        check_families(batches.keys())?;

        let container_image = self.container_image(&tree);
        if let Some(submission_type) = batches
            .keys()
            .find(|submission_type| submission_type.needs_container())
        {
            if container_image.is_none() {
                return Err(ConfigErrors::MissingContainerImage(*submission_type).into());
            }
        }

        let submission_types = batches.keys().copied().collect::<BTreeSet<_>>();
        let mut ids = locked.load_id_map()?;
        let scope = tracked_scope(&tree, &registry, &submission_types, ids.as_ref());

        let reconciler = self.reconciler();
        let state = reconciler.reconcile(&submission_types, &scope, &mut ids)?;
        if let Some(map) = ids.as_ref() {
            locked.save_id_map(map)?;
        }

        let mut report = SubmitReport::default();
        for (submission_type, jobs) in batches.iter() {
            let (artifacts, paths) = self.write_artifacts(
                *submission_type,
                &self.batch_filename(*submission_type),
                jobs,
                &state,
                container_image,
            )?;
            let identified = self.submit(&locked, *submission_type, &artifacts, &paths, &mut ids)?;

            if !paths.is_empty() {
                locked.update_tree(|tree| {
                    for entry in paths.iter().filter_map(|path| registry.get(path)) {
                        tree.set_status(entry.keys.as_slice(), JobStatus::Submitted)?;
                    }
                    Ok(())
                })?;
            }

            report.submitted.extend(paths);
            report.artifacts.extend(artifacts);
            report.identified.extend(identified);
        }

        // fresh submissions may not be listed yet, keep their identifiers
        let fresh = report.submitted.iter().cloned().collect::<BTreeSet<_>>();
        let scope = scope.difference(&fresh).cloned().collect();
        report.state = reconciler.reconcile(&submission_types, &scope, &mut ids)?;
        if let Some(map) = ids.as_ref() {
            locked.save_id_map(map)?;
        }

        info!(
            "Submitted {} jobs, {} running, {} queuing",
            report.submitted.len(),
            report.state.running.len(),
            report.state.queuing.len()
        );

        Ok(report)
    }

    /// Reconcile every configured backend of the study and persist the pruned identifier map
    pub fn status(&self) -> Result<ClusterState, ExecutorError> {
        let locked = self.study.lock()?;
        let tree = locked.load_tree()?;
        let registry = JobRegistry::enumerate(&tree);

        let mut submission_types = BTreeSet::new();
        for entry in registry.iter() {
            if let Some(submission_type) = tree
                .job(entry.keys.as_slice())
                .map(|node| node.submission_type())
                .transpose()?
                .flatten()
            {
                submission_types.insert(submission_type);
            }
        }

        let mut ids = locked.load_id_map()?;
        let scope = tracked_scope(&tree, &registry, &submission_types, ids.as_ref());
        let state = self
            .reconciler()
            .reconcile(&submission_types, &scope, &mut ids)?;
        if let Some(map) = ids.as_ref() {
            locked.save_id_map(map)?;
        }

        Ok(state)
    }
}
