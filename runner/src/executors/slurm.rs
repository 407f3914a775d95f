use super::{RenderContext, Statement};
use crate::reconcile::JobState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static SUBMITTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Submitted batch job (\d+)").expect("valid submit marker"));

/// `squeue` state filter for the requested state
pub fn state_filter(state: JobState) -> &'static str {
    match state {
        JobState::Running => "RUNNING",
        JobState::Queuing => "PENDING",
    }
}

/// `squeue` arguments listing `<id> <state>` per job of `user`, the whole queue without a user
pub fn queue_args(user: Option<&str>, state: JobState) -> Vec<String> {
    let mut args = vec!["--noheader".to_owned()];
    if let Some(user) = user {
        args.extend(["--user".to_owned(), user.to_owned()]);
    }
    args.extend(
        ["--states", state_filter(state), "--format", "%i %T"]
            .iter()
            .map(|argument| argument.to_string()),
    );

    args
}

/// Shell script issuing one `sbatch` per job
pub fn statement(job_dir: &Path, context: &RenderContext) -> Statement {
    let partition = context
        .partition
        .map(|partition| format!("--partition={partition} "))
        .unwrap_or_default();

    Statement {
        head: "#!/bin/bash\n# Running on SLURM\n".to_owned(),
        body: format!(
            "sbatch --ntasks=2 {partition}--output={dir}/output.txt --error={dir}/error.txt --gres=gpu:{gpus} {script}\n",
            dir = job_dir.display(),
            gpus = context.gpus(),
            script = job_dir.join(context.entrypoint).display(),
        ),
        tail: "# SLURM\n".to_owned(),
    }
}

/// Batch script running a single job inside a Singularity image
pub fn container_statement(job_dir: &Path, context: &RenderContext, image: &str) -> Statement {
    let mut head = String::from("#!/bin/bash\n# This is a SLURM submission file using Docker\n");
    if let Some(partition) = context.partition {
        head.push_str(&format!("#SBATCH --partition={partition}\n"));
    }
    head.push_str(&format!(
        "#SBATCH --output={dir}/output.txt\n#SBATCH --error={dir}/error.txt\n#SBATCH --ntasks=2\n#SBATCH --gres=gpu:{gpus}\n",
        dir = job_dir.display(),
        gpus = context.gpus(),
    ));

    Statement {
        head,
        body: format!(
            "singularity exec {image} {}\n",
            job_dir.join(context.entrypoint).display()
        ),
        tail: "# SLURM Docker\n".to_owned(),
    }
}

/// e.g. `Submitted batch job 4821`
pub fn parse_submitted_id(line: &str) -> Option<u64> {
    SUBMITTED
        .captures(line)
        .and_then(|captures| captures[1].parse().ok())
}

/// `sbatch` reports rejected jobs as `sbatch: error: ...`
pub fn reports_error(stderr: &str) -> bool {
    stderr.contains("ERROR") || stderr.contains("sbatch: error")
}

fn job_state(state: &str) -> Option<JobState> {
    match state {
        "RUNNING" | "R" | "COMPLETING" | "CG" | "CONFIGURING" | "CF" => Some(JobState::Running),
        "PENDING" | "PD" | "REQUEUED" | "RQ" | "SUSPENDED" | "S" => Some(JobState::Queuing),
        _ => None,
    }
}

/// Parse `squeue --format "%i %T"`, array tasks (`<id>_<task>`) map to their parent id
pub fn parse_queue(output: &str) -> Vec<(u64, JobState)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?;
            let id = id.split('_').next()?.parse().ok()?;
            let state = job_state(fields.next()?)?;

            Some((id, state))
        })
        .collect()
}

fn field<'a>(details: &'a str, name: &str) -> Option<&'a str> {
    details
        .split_whitespace()
        .find_map(|token| token.strip_prefix(name)?.strip_prefix('='))
        .filter(|value| !value.is_empty())
}

/// Job directory from `scontrol show jobid -dd <id>`
///
/// Jobs submitted through a wrapper script do not reference the run script in `Command`, their
/// output file still lives in the job directory.
pub fn parse_job_dir(details: &str, entrypoint: &str) -> Option<PathBuf> {
    match field(details, "Command").map(Path::new) {
        Some(command) if command.file_name().map_or(false, |name| name == entrypoint) => {
            command.parent().map(Path::to_path_buf)
        }
        _ => field(details, "StdOut")
            .map(Path::new)
            .and_then(Path::parent)
            .map(Path::to_path_buf),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::Context;

    fn context(partition: Option<&str>) -> RenderContext<'_> {
        RenderContext {
            entrypoint: "run.sh",
            context: Context::Cpu,
            container_image: None,
            job_flavour: "espresso",
            partition,
        }
    }

    #[test]
    fn sbatch_line_per_job() {
        let statement = statement(Path::new("/study/base"), &context(Some("hpc")));

        assert_eq!(
            statement.body,
            "sbatch --ntasks=2 --partition=hpc --output=/study/base/output.txt --error=/study/base/error.txt --gres=gpu:0 /study/base/run.sh\n"
        );
    }

    #[test]
    fn container_statement_is_a_complete_batch_script() {
        let statement = container_statement(Path::new("/study/base"), &context(None), "/img.sif");

        assert!(statement.head.starts_with("#!/bin/bash\n"));
        assert!(statement
            .head
            .contains("#SBATCH --output=/study/base/output.txt\n"));
        assert!(!statement.head.contains("--partition"));
        assert_eq!(statement.body, "singularity exec /img.sif /study/base/run.sh\n");
    }

    #[test]
    fn submitted_ids() {
        assert_eq!(parse_submitted_id("Submitted batch job 4821"), Some(4821));
        assert_eq!(parse_submitted_id("sbatch: error: invalid partition"), None);
    }

    #[test]
    fn queue_is_filtered_by_user_and_state() {
        assert_eq!(
            queue_args(Some("alice"), JobState::Queuing).join(" "),
            "--noheader --user alice --states PENDING --format %i %T"
        );
        assert_eq!(
            queue_args(None, JobState::Running).join(" "),
            "--noheader --states RUNNING --format %i %T"
        );
    }

    #[test]
    fn queue_listing_is_parsed_defensively() {
        let output = "4821 RUNNING\n4822_3 PENDING\nJOBID STATE\n4823 COMPLETED\n\n";

        assert_eq!(
            parse_queue(output),
            [(4821, JobState::Running), (4822, JobState::Queuing)]
        );
    }

    #[test]
    fn job_dir_from_scontrol() {
        let details = "JobId=4821 JobName=run.sh\n   Command=/study/base/run.sh\n   StdOut=/elsewhere/output.txt\n";
        assert_eq!(
            parse_job_dir(details, "run.sh"),
            Some(PathBuf::from("/study/base"))
        );

        let details = "JobId=4822\n   Command=/study/submission_0.sub\n   StdOut=/study/base/child/output.txt\n";
        assert_eq!(
            parse_job_dir(details, "run.sh"),
            Some(PathBuf::from("/study/base/child"))
        );

        assert_eq!(parse_job_dir("JobId=1 Command=", "run.sh"), None);
    }
}
