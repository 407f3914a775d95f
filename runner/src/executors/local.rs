use super::{RenderContext, Statement};
use std::path::{Path, PathBuf};

/// Every job becomes a backgrounded line of a single shell script
pub fn statement(job_dir: &Path, context: &RenderContext) -> Statement {
    Statement {
        head: "#!/bin/bash\n# Running on local pc\n".to_owned(),
        body: format!(
            "bash {} &\n",
            job_dir.join(context.entrypoint).display()
        ),
        tail: "# Local pc\n".to_owned(),
    }
}

/// Directory of the job a process is running, if its command line invokes `entrypoint`
///
/// The program itself is skipped, only its arguments can reference a run script. Relative run
/// script paths are resolved against the working directory of the process.
pub fn job_dir_from_cmdline(
    cmdline: &[String],
    cwd: Option<&Path>,
    entrypoint: &str,
) -> Option<PathBuf> {
    let script = cmdline
        .iter()
        .skip(1)
        .rev()
        .map(Path::new)
        .find(|argument| argument.file_name().map_or(false, |name| name == entrypoint))?;

    let script = if script.is_absolute() {
        script.to_path_buf()
    } else {
        cwd?.join(script)
    };

    script.parent().map(Path::to_path_buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::Context;

    fn cmdline(arguments: &[&str]) -> Vec<String> {
        arguments.iter().map(|argument| argument.to_string()).collect()
    }

    #[test]
    fn statement_backgrounds_the_run_script() {
        let context = RenderContext {
            entrypoint: "run.sh",
            context: Context::Cpu,
            container_image: None,
            job_flavour: "espresso",
            partition: None,
        };

        let statement = statement(Path::new("/study/base"), &context);

        assert_eq!(statement.body, "bash /study/base/run.sh &\n");
        assert!(statement.head.starts_with("#!/bin/bash\n"));
    }

    #[test]
    fn finds_job_dir_in_cmdline() {
        assert_eq!(
            job_dir_from_cmdline(&cmdline(&["bash", "/study/base/run.sh"]), None, "run.sh"),
            Some(PathBuf::from("/study/base"))
        );
        assert_eq!(
            job_dir_from_cmdline(
                &cmdline(&["/bin/bash", "base/child/run.sh"]),
                Some(Path::new("/study")),
                "run.sh"
            ),
            Some(PathBuf::from("/study/base/child"))
        );
    }

    #[test]
    fn ignores_unrelated_processes() {
        assert_eq!(
            job_dir_from_cmdline(&cmdline(&["/study/base/run.sh"]), None, "run.sh"),
            None
        );
        assert_eq!(
            job_dir_from_cmdline(&cmdline(&["vim", "/study/base/run.sh.bak"]), None, "run.sh"),
            None
        );
        assert_eq!(
            job_dir_from_cmdline(&cmdline(&["bash", "base/run.sh"]), None, "run.sh"),
            None
        );
    }
}
