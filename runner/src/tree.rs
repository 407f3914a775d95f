use crate::{config::ConfigErrors, executors::SubmissionType};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::{fmt, path::PathBuf, str::FromStr};
use thiserror::Error;
use tracing::warn;

/// key of the leaf attribute that turns a node into a job
pub const FILE_KEY: &str = "file";
pub const CONTEXT_KEY: &str = "context";
pub const SUBMISSION_TYPE_KEY: &str = "submission_type";
pub const STATUS_KEY: &str = "status";

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("No job found at {0}")]
    UnknownJob(String),
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Unconfigured,
    ToSubmit,
    Submitted,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::ToSubmit => "to_submit",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_value(Value::String(value.to_owned()))
            .map_err(|_| format!("unknown job status '{value}'"))
    }
}

/// Execution environment a job was configured for
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    #[default]
    Cpu,
    Cupy,
    Opencl,
}

impl Context {
    pub fn requires_gpu(&self) -> bool {
        matches!(self, Self::Cupy | Self::Opencl)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cupy => "cupy",
            Self::Opencl => "opencl",
        }
    }
}

/// Typed view over a single job node of the tree
#[derive(Debug, Clone, PartialEq)]
pub struct JobNode {
    pub file: String,
    pub context: Context,
    pub submission_type: Option<String>,
    pub status: JobStatus,
}

impl JobNode {
    fn from_mapping(mapping: &Mapping) -> Option<Self> {
        let file = match mapping.get(FILE_KEY)? {
            Value::String(file) => file.clone(),
            other => serde_yaml::to_string(other).ok()?.trim().to_owned(),
        };

        let context = match mapping.get(CONTEXT_KEY) {
            None | Some(Value::Null) => Context::default(),
            Some(value) => serde_yaml::from_value(value.clone()).unwrap_or_else(|_| {
                warn!(file = %file, "Unknown context {value:?}, falling back to cpu");
                Context::default()
            }),
        };

        let status = match mapping.get(STATUS_KEY) {
            None | Some(Value::Null) => JobStatus::default(),
            Some(value) => serde_yaml::from_value(value.clone()).unwrap_or_else(|_| {
                warn!(file = %file, "Unknown status {value:?}, treating the job as unconfigured");
                JobStatus::default()
            }),
        };

        Some(Self {
            file,
            context,
            submission_type: mapping
                .get(SUBMISSION_TYPE_KEY)
                .and_then(Value::as_str)
                .map(str::to_owned),
            status,
        })
    }

    /// parse the configured submission type, `None` for unconfigured jobs
    pub fn submission_type(&self) -> Result<Option<SubmissionType>, ConfigErrors> {
        self.submission_type
            .as_deref()
            .map(SubmissionType::from_str)
            .transpose()
    }
}

/// Ordered, arbitrarily deep mapping describing a study
///
/// Key order is the order found in the YAML file and drives every traversal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobTree {
    root: Mapping,
}

impl JobTree {
    pub fn new(root: Mapping) -> Self {
        Self { root }
    }

    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }

        match serde_yaml::from_str::<Value>(source)? {
            Value::Mapping(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            _ => Err(serde::de::Error::custom("the job tree must be a mapping")),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.root)
    }

    pub fn root(&self) -> &Mapping {
        &self.root
    }

    /// retrieve the node at `keys`, the empty path yields the root
    pub fn get<S: AsRef<str>>(&self, keys: &[S]) -> Option<&Mapping> {
        keys.iter().try_fold(&self.root, |node, key| {
            node.get(key.as_ref()).and_then(Value::as_mapping)
        })
    }

    pub fn get_mut<S: AsRef<str>>(&mut self, keys: &[S]) -> Option<&mut Mapping> {
        keys.iter().try_fold(&mut self.root, |node, key| {
            node.get_mut(key.as_ref()).and_then(Value::as_mapping_mut)
        })
    }

    /// job stored at `keys`, if that node carries a `file` leaf
    pub fn job<S: AsRef<str>>(&self, keys: &[S]) -> Option<JobNode> {
        self.get(keys).and_then(JobNode::from_mapping)
    }

    /// set a leaf attribute of the job at `keys`
    pub fn set_field<S: AsRef<str>>(
        &mut self,
        keys: &[S],
        field: &str,
        value: &str,
    ) -> Result<(), TreeError> {
        let node = self
            .get_mut(keys)
            .filter(|node| node.contains_key(FILE_KEY))
            .ok_or_else(|| TreeError::UnknownJob(join_keys(keys)))?;
        node.insert(field.into(), value.into());

        Ok(())
    }

    pub fn set_status<S: AsRef<str>>(
        &mut self,
        keys: &[S],
        status: JobStatus,
    ) -> Result<(), TreeError> {
        self.set_field(keys, STATUS_KEY, status.as_str())
    }

    /// top level string attribute such as `container_image`
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.root.get(key).and_then(Value::as_str)
    }

    pub fn set_attribute(&mut self, key: &str, value: Option<&str>) {
        self.root.insert(
            key.into(),
            value.map(Value::from).unwrap_or(Value::Null),
        );
    }
}

/// stable job identifier derived from a key path
pub fn join_keys<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod test {
    use super::*;

    const TREE: &str = r#"
container_image: docker://image
base:
  file: base.py
  status: completed
  submission_type: slurm
  context: cupy
  child:
    file: child.py
other:
  nested: {}
"#;

    #[test]
    fn job_nodes_are_typed() {
        let tree = JobTree::from_yaml(TREE).unwrap();
        let base = tree.job(&["base"]).unwrap();

        assert_eq!(base.file, "base.py");
        assert_eq!(base.status, JobStatus::Completed);
        assert_eq!(base.context, Context::Cupy);
        assert_eq!(
            base.submission_type().unwrap(),
            Some(SubmissionType::Slurm)
        );

        let child = tree.job(&["base", "child"]).unwrap();
        assert_eq!(child.status, JobStatus::Unconfigured);
        assert_eq!(child.submission_type().unwrap(), None);

        assert!(tree.job(&["other"]).is_none());
        assert_eq!(tree.attribute("container_image"), Some("docker://image"));
    }

    #[test]
    fn unknown_submission_type_is_a_configuration_error() {
        let tree = JobTree::from_yaml("job:\n  file: a.py\n  submission_type: pbs\n").unwrap();

        assert!(matches!(
            tree.job(&["job"]).unwrap().submission_type(),
            Err(ConfigErrors::UnsupportedExecutor(name)) if name == "pbs"
        ));
    }

    #[test]
    fn set_status_only_touches_jobs() {
        let mut tree = JobTree::from_yaml(TREE).unwrap();

        tree.set_status(&["base", "child"], JobStatus::Submitted)
            .unwrap();
        assert_eq!(
            tree.job(&["base", "child"]).unwrap().status,
            JobStatus::Submitted
        );
        assert!(matches!(
            tree.set_status(&["other"], JobStatus::Completed),
            Err(TreeError::UnknownJob(path)) if path == "other"
        ));
    }

    #[test]
    fn key_order_survives_a_round_trip() {
        let tree = JobTree::from_yaml(TREE).unwrap();
        let reloaded = JobTree::from_yaml(&tree.to_yaml().unwrap()).unwrap();

        let keys = reloaded
            .root()
            .keys()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>();
        assert_eq!(keys, ["container_image", "base", "other"]);
    }
}
