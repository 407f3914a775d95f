use super::locking::{LockError, LockGuard, SoftLock};
use crate::{
    idmap::IdentifierMap,
    tree::{JobTree, TreeError},
};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

/// append `suffix` to the file name of `path`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("tree.yaml"));
    name.push(suffix);

    path.with_file_name(name)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TreeError + '_ {
    move |source| TreeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// replace `path` through a sibling temporary file, rename keeps readers from seeing partial files
fn write_replace(path: &Path, contents: &str) -> Result<(), TreeError> {
    let temporary = sidecar(path, &format!(".{}.tmp", std::process::id()));

    fs::write(&temporary, contents).map_err(io_error(&temporary))?;
    fs::rename(&temporary, path).map_err(io_error(path))
}

/// A study on disk: the job tree, its identifier map sidecar and the lock guarding both
///
/// Nothing is cached, every access reads the files again since other hosts may have changed them.
#[derive(Debug, Clone)]
pub struct Study {
    tree_path: PathBuf,
    id_map_path: PathBuf,
    root: PathBuf,
    lock: SoftLock,
}

impl Study {
    pub fn open(tree_path: &Path, lock_timeout: Duration) -> Result<Self, TreeError> {
        let tree_path = fs::canonicalize(tree_path).map_err(io_error(tree_path))?;
        let root = tree_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(Self {
            id_map_path: sidecar(&tree_path, ".id_map.yaml"),
            lock: SoftLock::new(sidecar(&tree_path, ".lock"), lock_timeout),
            tree_path,
            root,
        })
    }

    /// directory every job path is relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tree_path(&self) -> &Path {
        &self.tree_path
    }

    pub fn id_map_path(&self) -> &Path {
        &self.id_map_path
    }

    pub fn job_dir(&self, job_path: &str) -> PathBuf {
        self.root.join(job_path)
    }

    /// job path of a directory inside the study, `None` for foreign directories
    pub fn job_path(&self, job_dir: &Path) -> Option<String> {
        let relative = job_dir.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;

        (!parts.is_empty()).then(|| parts.join("/"))
    }

    /// snapshot of the tree without taking the lock, never write it back
    pub fn load_tree(&self) -> Result<JobTree, TreeError> {
        read_tree(&self.tree_path)
    }

    pub fn lock(&self) -> Result<LockedStudy<'_>, LockError> {
        Ok(LockedStudy {
            _guard: self.lock.acquire()?,
            study: self,
        })
    }
}

fn read_tree(path: &Path) -> Result<JobTree, TreeError> {
    let source = fs::read_to_string(path).map_err(io_error(path))?;

    JobTree::from_yaml(&source).map_err(|source| TreeError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Scoped access to a study while holding its lock, all writes go through here
#[derive(Debug)]
pub struct LockedStudy<'a> {
    study: &'a Study,
    _guard: LockGuard,
}

impl LockedStudy<'_> {
    pub fn study(&self) -> &Study {
        self.study
    }

    pub fn load_tree(&self) -> Result<JobTree, TreeError> {
        read_tree(&self.study.tree_path)
    }

    pub fn save_tree(&self, tree: &JobTree) -> Result<(), TreeError> {
        let contents = tree.to_yaml().map_err(|source| TreeError::Yaml {
            path: self.study.tree_path.clone(),
            source,
        })?;
        debug!(path = ?self.study.tree_path, "Writing job tree");

        write_replace(&self.study.tree_path, &contents)
    }

    /// re-read the tree, apply `change` and write the result
    pub fn update_tree<F>(&self, change: F) -> Result<JobTree, TreeError>
    where
        F: FnOnce(&mut JobTree) -> Result<(), TreeError>,
    {
        let mut tree = self.load_tree()?;
        change(&mut tree)?;
        self.save_tree(&tree)?;

        Ok(tree)
    }

    /// `None` if no job was ever submitted to a batch scheduler
    pub fn load_id_map(&self) -> Result<Option<IdentifierMap>, TreeError> {
        let path = &self.study.id_map_path;

        match fs::read_to_string(path) {
            Ok(source) if source.trim().is_empty() => Ok(Some(IdentifierMap::new())),
            Ok(source) => serde_yaml::from_str::<Option<IdentifierMap>>(&source)
                .map(|map| Some(map.unwrap_or_default()))
                .map_err(|source| TreeError::Yaml {
                    path: path.clone(),
                    source,
                }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(io_error(path)(error)),
        }
    }

    pub fn save_id_map(&self, map: &IdentifierMap) -> Result<(), TreeError> {
        let path = &self.study.id_map_path;
        let contents = serde_yaml::to_string(map).map_err(|source| TreeError::Yaml {
            path: path.clone(),
            source,
        })?;
        debug!(path = ?path, entries = map.len(), "Writing identifier map");

        write_replace(path, &contents)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::JobStatus;

    fn study() -> (tempfile::TempDir, Study) {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree.yaml");
        fs::write(&tree, "base:\n  file: base.py\n  status: to_submit\n").unwrap();
        let study = Study::open(&tree, Duration::from_millis(200)).unwrap();

        (dir, study)
    }

    #[test]
    fn sidecars_live_next_to_the_tree() {
        let (dir, study) = study();
        let root = fs::canonicalize(dir.path()).unwrap();

        assert_eq!(study.root(), root);
        assert_eq!(study.id_map_path(), root.join("tree.yaml.id_map.yaml"));
        assert_eq!(study.job_dir("base/child"), root.join("base/child"));
        assert_eq!(
            study.job_path(&root.join("base/child")),
            Some("base/child".to_owned())
        );
        assert_eq!(study.job_path(Path::new("/elsewhere/base")), None);
        assert_eq!(study.job_path(&root), None);
    }

    #[test]
    fn writes_require_the_lock() {
        let (_dir, study) = study();
        let locked = study.lock().unwrap();

        assert!(matches!(study.lock(), Err(LockError::Timeout { .. })));

        locked
            .update_tree(|tree| tree.set_status(&["base"], JobStatus::Completed))
            .unwrap();
        drop(locked);

        assert_eq!(
            study.load_tree().unwrap().job(&["base"]).unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn missing_id_map_is_not_an_error() {
        let (_dir, study) = study();
        let locked = study.lock().unwrap();

        assert_eq!(locked.load_id_map().unwrap(), None);

        let map: IdentifierMap = [(7, "base".to_owned())].into_iter().collect();
        locked.save_id_map(&map).unwrap();
        assert_eq!(locked.load_id_map().unwrap(), Some(map));

        fs::write(study.id_map_path(), "").unwrap();
        assert_eq!(locked.load_id_map().unwrap(), Some(IdentifierMap::new()));
    }
}
