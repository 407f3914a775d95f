use crate::{
    config::RunnerConfig,
    registry::JobRegistry,
    sync::study::Study,
    tree::{JobNode, TreeError},
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

pub const PYTHON_ENVIRONMENT_KEY: &str = "python_environment";

/// Script executing the python file of a job from inside its directory
pub fn render(
    job_dir: &Path,
    node: &JobNode,
    generation: usize,
    python_environment: Option<&Path>,
) -> String {
    let mut script = format!("#!/bin/bash\n# generation {generation}\n");
    if let Some(environment) = python_environment {
        script.push_str(&format!(
            "source {}\n",
            environment.join("bin").join("activate").display()
        ));
    }
    script.push_str(&format!(
        "cd {}\npython {} > output_python.txt 2> error_python.txt\n",
        job_dir.display(),
        node.file
    ));

    script
}

/// Write an executable run script into the directory of every job
///
/// Only reads the tree, so no lock is taken.
pub fn generate(study: &Study, config: &RunnerConfig) -> Result<Vec<PathBuf>, TreeError> {
    let tree = study.load_tree()?;
    let registry = JobRegistry::enumerate(&tree);

    let python_environment = config
        .python_environment
        .clone()
        .or_else(|| tree.attribute(PYTHON_ENVIRONMENT_KEY).map(PathBuf::from));
    if python_environment.is_none() {
        warn!("No python environment configured, run scripts use the system python");
    }

    let mut written = Vec::new();
    for entry in registry.iter() {
        let Some(node) = tree.job(entry.keys.as_slice()) else {
            continue;
        };

        let job_dir = study.job_dir(&entry.path);
        let path = job_dir.join(&config.entrypoint);
        let io_error = |source| TreeError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&job_dir).map_err(io_error)?;
        fs::write(
            &path,
            render(&job_dir, &node, entry.generation, python_environment.as_deref()),
        )
        .map_err(io_error)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(io_error)?;
        debug!(path = ?path, "Wrote run script");

        written.push(path);
    }
    info!("Generated {} run scripts", written.len());

    Ok(written)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::fixture_with;

    #[test]
    fn scripts_activate_and_enter_the_job_dir() {
        let node = JobNode {
            file: "compute.py".to_owned(),
            context: Default::default(),
            submission_type: None,
            status: Default::default(),
        };

        assert_eq!(
            render(Path::new("/study/base"), &node, 1, Some(Path::new("/venv"))),
            "#!/bin/bash\n# generation 1\nsource /venv/bin/activate\ncd /study/base\npython compute.py > output_python.txt 2> error_python.txt\n"
        );
        assert!(!render(Path::new("/study/base"), &node, 0, None).contains("source"));
    }

    #[test]
    fn every_job_gets_an_executable_script() {
        let fixture = fixture_with(
            "python_environment: /opt/venv\nbase:\n  file: base.py\n  child:\n    file: child.py\n",
            "entrypoint: job.sh\n",
        );

        let written = generate(&fixture.study, &fixture.config).unwrap();

        let root = fixture.study.root();
        assert_eq!(
            written,
            [root.join("base/job.sh"), root.join("base/child/job.sh")]
        );
        let script = fs::read_to_string(root.join("base/child/job.sh")).unwrap();
        assert!(script.contains("source /opt/venv/bin/activate\n"));
        assert!(script.contains("# generation 1\n"));
        assert_eq!(
            fs::metadata(root.join("base/job.sh"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777,
            0o755
        );
    }
}
