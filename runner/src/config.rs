use crate::{
    executors::{Family, SubmissionType},
    tree::Context,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Submission type '{0}' is not supported")]
    UnsupportedExecutor(String),
    #[error("Mixing {first} and {second} submissions in a single batch is not allowed")]
    MixedSchedulers { first: Family, second: Family },
    #[error("{backend} can't submit {jobs} jobs through {files} submission files")]
    SubmissionFileArity {
        backend: SubmissionType,
        files: usize,
        jobs: usize,
    },
    #[error("container_image must be defined (config or tree) for {0}")]
    MissingContainerImage(SubmissionType),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to read the configuration")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to parse the configuration")]
    InvalidConfig(#[from] serde_yaml::Error),
}

fn default_lock_timeout() -> u64 {
    5
}

fn default_entrypoint() -> String {
    String::from("run.sh")
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // location of the job tree, the study root is its parent directory
    pub tree: PathBuf,
    // base name of the submission artifacts, derived from the study root if missing
    pub submission_file: Option<PathBuf>,
    // seconds to wait for the soft lock on the tree
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    // name of the run script inside every job directory
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    pub python_environment: Option<PathBuf>,
    pub container_image: Option<String>,

    #[serde(default, alias = "htc")]
    pub htcondor: HtCondorConfig,
    #[serde(default)]
    pub slurm: SlurmConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub defaults: JobDefaults,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct HtCondorConfig {
    #[serde(alias = "job_flavor")]
    pub job_flavour: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SlurmConfig {
    pub partition: Option<String>,
    pub gpu_partition: Option<String>,
}

impl SlurmConfig {
    pub fn partition_for(&self, context: Context) -> Option<&str> {
        if context.requires_gpu() {
            self.gpu_partition.as_deref()
        } else {
            self.partition.as_deref()
        }
    }
}

fn default_query_individually() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    60
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // fall back to per-id detail queries when no identifier map exists yet
    #[serde(default = "default_query_individually")]
    pub query_individually: bool,
    // seconds any scheduler command may take
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            query_individually: default_query_individually(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// settings applied to unconfigured jobs by `configure`
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct JobDefaults {
    pub context: Option<Context>,
    pub submission_type: Option<SubmissionType>,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        let mut config: Self = serde_yaml::from_reader(File::open(path)?)?;

        // relative paths are relative to the configuration file
        if let Some(parent) = path.parent() {
            if config.tree.is_relative() {
                config.tree = parent.join(&config.tree);
            }
            if let Some(file) = config.submission_file.as_mut() {
                if file.is_relative() {
                    *file = parent.join(&file);
                }
            }
        }

        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.command_timeout)
    }

    pub fn job_flavour(&self) -> &str {
        self.htcondor.job_flavour.as_deref().unwrap_or("espresso")
    }

    /// attempt to catch all errors instead of piece-by-piece to make debugging easier for users
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if !self.tree.is_file() {
            error!(
                "tree must point to an existing job tree, nothing found at {}",
                self.tree.display()
            );
            contains_error = true;
        }

        if self.lock_timeout == 0 {
            error!("lock_timeout cannot be 0, the tree would never be locked");
            contains_error = true;
        }

        if self.scheduler.command_timeout == 0 {
            error!("scheduler.command_timeout cannot be 0");
            contains_error = true;
        }

        if self.entrypoint.is_empty() || self.entrypoint.contains('/') {
            error!(
                "entrypoint '{}' must be a plain file name such as run.sh",
                self.entrypoint
            );
            contains_error = true;
        }

        if let Some(ref environment) = self.python_environment {
            if !environment.join("bin/activate").is_file() {
                warn!(
                    "python_environment {} has no bin/activate, run scripts might fail",
                    environment.display()
                );
            }
        }

        if self.htcondor.job_flavour.is_none() {
            warn!("htcondor.job_flavour not defined, using espresso as default");
        }

        if let Some(submission_type) = self.defaults.submission_type {
            if submission_type.needs_container() && self.container_image.is_none() {
                warn!(
                    "defaults.submission_type is {submission_type} but no container_image is configured, the tree has to provide one"
                );
            }
        }

        contains_error
    }
}
