//! Catalog of submission backends
//!
//! Every backend renders a submission statement made of a head, one body per job and a tail, and
//! knows how to hand the resulting artifact to its scheduler. The scheduler specific text parsing
//! lives next to the statements in the family modules so it can be tested without spawning
//! anything.

pub mod htcondor;
pub mod local;
pub mod slurm;

use crate::{
    config::ConfigErrors,
    shell::ShellError,
    sync::locking::LockError,
    tree::{Context, TreeError},
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, path::PathBuf, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Configuration(#[from] ConfigErrors),
    #[error("Error in {backend} submission of {}, identifiers confirmed so far: {ids:?}", filename.display())]
    Submission {
        backend: SubmissionType,
        filename: PathBuf,
        stdout: String,
        stderr: String,
        /// scheduler ids already accepted in this pass, including those printed with the error
        ids: Vec<u64>,
    },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(
        "Submitted {} {backend} jobs but extracted {} identifiers ({ids:?}), the identifier map needs manual reconciliation",
        jobs.len(),
        ids.len()
    )]
    InconsistentState {
        backend: SubmissionType,
        jobs: Vec<String>,
        ids: Vec<u64>,
    },
    #[error("Failed to run `{command}`")]
    Command {
        command: String,
        #[source]
        source: ShellError,
    },
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("Failed to write submission file {}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Scheduler family, backends of different batch families must never share a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    Local,
    HtCondor,
    Slurm,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::HtCondor => "HTCondor",
            Self::Slurm => "Slurm",
        })
    }
}

/// All supported submission variants
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionType {
    #[serde(alias = "local_pc")]
    Local,
    Htc,
    HtcDocker,
    Slurm,
    SlurmDocker,
}

impl SubmissionType {
    pub const ALL: [Self; 5] = [
        Self::Local,
        Self::Htc,
        Self::HtcDocker,
        Self::Slurm,
        Self::SlurmDocker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Htc => "htc",
            Self::HtcDocker => "htc_docker",
            Self::Slurm => "slurm",
            Self::SlurmDocker => "slurm_docker",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Self::Local => Family::Local,
            Self::Htc | Self::HtcDocker => Family::HtCondor,
            Self::Slurm | Self::SlurmDocker => Family::Slurm,
        }
    }

    pub fn needs_container(&self) -> bool {
        matches!(self, Self::HtcDocker | Self::SlurmDocker)
    }

    /// whether the scheduler only accepts a single job per submission file
    pub fn one_file_per_job(&self) -> bool {
        matches!(self, Self::SlurmDocker)
    }

    /// render the statement for a single job
    pub fn render(&self, job_dir: &Path, context: &RenderContext) -> Result<Statement, ConfigErrors> {
        let image = || {
            context
                .container_image
                .ok_or(ConfigErrors::MissingContainerImage(*self))
        };

        Ok(match self {
            Self::Local => local::statement(job_dir, context),
            Self::Htc => htcondor::statement(job_dir, context, None),
            Self::HtcDocker => htcondor::statement(job_dir, context, Some(image()?)),
            Self::Slurm => slurm::statement(job_dir, context),
            Self::SlurmDocker => slurm::container_statement(job_dir, context, image()?),
        })
    }

    /// command line handing `filename` to the scheduler
    pub fn submit_command(&self, filename: &Path) -> Vec<String> {
        let filename = filename.to_string_lossy().into_owned();

        match self {
            Self::Local | Self::Slurm => vec!["bash".to_owned(), filename],
            Self::Htc | Self::HtcDocker => vec!["condor_submit".to_owned(), filename],
            Self::SlurmDocker => vec!["sbatch".to_owned(), filename],
        }
    }

    /// scheduler id announced on a single line of submit output
    pub fn parse_submitted_id(&self, line: &str) -> Option<u64> {
        match self.family() {
            Family::Local => None,
            Family::HtCondor => htcondor::parse_submitted_id(line),
            Family::Slurm => slurm::parse_submitted_id(line),
        }
    }

    /// whether the scheduler rejected a submission according to its stderr
    pub fn reports_error(&self, stderr: &str) -> bool {
        match self.family() {
            Family::Local => false,
            Family::HtCondor => htcondor::reports_error(stderr),
            Family::Slurm => slurm::reports_error(stderr),
        }
    }
}

impl fmt::Display for SubmissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionType {
    type Err = ConfigErrors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "local" | "local_pc" => Ok(Self::Local),
            "htc" => Ok(Self::Htc),
            "htc_docker" => Ok(Self::HtcDocker),
            "slurm" => Ok(Self::Slurm),
            "slurm_docker" => Ok(Self::SlurmDocker),
            unknown => Err(ConfigErrors::UnsupportedExecutor(unknown.to_owned())),
        }
    }
}

/// Ensure a batch never mixes HTCondor and Slurm jobs, local jobs may join either
pub fn check_families<'a, I>(submission_types: I) -> Result<(), ConfigErrors>
where
    I: IntoIterator<Item = &'a SubmissionType>,
{
    let mut seen: Option<Family> = None;

    for family in submission_types
        .into_iter()
        .map(SubmissionType::family)
        .filter(|family| *family != Family::Local)
    {
        match seen {
            Some(first) if first != family => {
                return Err(ConfigErrors::MixedSchedulers {
                    first,
                    second: family,
                })
            }
            _ => seen = Some(family),
        }
    }

    Ok(())
}

/// Per job parameters for rendering a statement
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub entrypoint: &'a str,
    pub context: Context,
    pub container_image: Option<&'a str>,
    pub job_flavour: &'a str,
    pub partition: Option<&'a str>,
}

impl RenderContext<'_> {
    pub fn gpus(&self) -> u8 {
        u8::from(self.context.requires_gpu())
    }
}

/// Text fragments making up a submission artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub head: String,
    pub body: String,
    pub tail: String,
}
