use crate::{
    config::RunnerConfig,
    executors::ExecutorError,
    registry::JobRegistry,
    runscript::PYTHON_ENVIRONMENT_KEY,
    submit::CONTAINER_IMAGE_KEY,
    sync::study::Study,
    tree::{JobStatus, TreeError, CONTEXT_KEY, SUBMISSION_TYPE_KEY},
};
use tracing::{info, warn};

pub const ABSOLUTE_PATH_KEY: &str = "absolute_path";

/// Apply `defaults` to every job without a submission type and mark it `to_submit`
///
/// Completed jobs are left alone. The python environment, container image and study location are
/// recorded at the root of the tree. Returns the configured job paths.
pub fn configure(study: &Study, config: &RunnerConfig) -> Result<Vec<String>, ExecutorError> {
    let defaults = &config.defaults;
    if defaults.submission_type.is_none() {
        warn!("defaults.submission_type is not set, only the study attributes are updated");
    }

    let locked = study.lock()?;
    let mut configured = Vec::new();

    locked.update_tree(|tree| {
        let registry = JobRegistry::enumerate(tree);

        if let Some(submission_type) = defaults.submission_type {
            for entry in registry.iter() {
                let Some(node) = tree.job(entry.keys.as_slice()) else {
                    continue;
                };
                if node.submission_type.is_some() || node.status == JobStatus::Completed {
                    continue;
                }

                let keys = entry.keys.as_slice();
                tree.set_field(keys, SUBMISSION_TYPE_KEY, submission_type.as_str())?;
                tree.set_field(
                    keys,
                    CONTEXT_KEY,
                    defaults.context.unwrap_or(node.context).as_str(),
                )?;
                tree.set_status(keys, JobStatus::ToSubmit)?;

                configured.push(entry.path.clone());
            }
        }

        if let Some(environment) = config.python_environment.as_ref() {
            tree.set_attribute(
                PYTHON_ENVIRONMENT_KEY,
                Some(environment.display().to_string().as_str()),
            );
        }
        if let Some(image) = config.container_image.as_deref() {
            tree.set_attribute(CONTAINER_IMAGE_KEY, Some(image));
        }
        tree.set_attribute(
            ABSOLUTE_PATH_KEY,
            Some(study.root().display().to_string().as_str()),
        );

        Ok(())
    })?;
    info!("Configured {} jobs", configured.len());

    Ok(configured)
}

/// Overwrite the status of a single job, e.g. to mark it completed from a job epilogue
pub fn set_status(study: &Study, job: &str, status: JobStatus) -> Result<(), ExecutorError> {
    let locked = study.lock()?;

    locked.update_tree(|tree| {
        let entry = JobRegistry::enumerate(tree)
            .get(job)
            .cloned()
            .ok_or_else(|| TreeError::UnknownJob(job.to_owned()))?;

        tree.set_status(entry.keys.as_slice(), status)
    })?;
    info!("{job} is now {status}");

    Ok(())
}
