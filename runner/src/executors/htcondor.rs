use super::{RenderContext, Statement};
use crate::reconcile::JobState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static SUBMITTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"submitted to cluster (\d+)").expect("valid submit marker"));

/// `condor_q` arguments listing one `ClusterId JobStatus` pair per line
pub const QUEUE_ARGS: [&str; 3] = ["-autoformat", "ClusterId", "JobStatus"];

/// Descriptor with one `queue` entry per job, optionally running inside a Singularity image
pub fn statement(job_dir: &Path, context: &RenderContext, image: Option<&str>) -> Statement {
    let mut head = String::from(if image.is_some() {
        "# This is a HTCondor submission file using Docker\n"
    } else {
        "# This is a HTCondor submission file\n"
    });
    head.push_str("error  = error.txt\noutput = output.txt\nlog  = log.txt\n");
    if let Some(image) = image {
        head.push_str(&format!(
            "universe = vanilla\n+SingularityImage = \"{image}\"\n"
        ));
    }

    Statement {
        head,
        body: format!(
            "initialdir = {dir}\nexecutable = {executable}\nrequest_GPUs = {gpus}\n+JobFlavour = \"{flavour}\"\nqueue\n",
            dir = job_dir.display(),
            executable = job_dir.join(context.entrypoint).display(),
            gpus = context.gpus(),
            flavour = context.job_flavour,
        ),
        tail: if image.is_some() {
            "# HTC Docker\n"
        } else {
            "# HTC\n"
        }
        .to_owned(),
    }
}

/// e.g. `1 job(s) submitted to cluster 4242.`
pub fn parse_submitted_id(line: &str) -> Option<u64> {
    SUBMITTED
        .captures(line)
        .and_then(|captures| captures[1].parse().ok())
}

pub fn reports_error(stderr: &str) -> bool {
    stderr.contains("ERROR")
}

/// Map a numeric `JobStatus` to the state relevant for resubmission
///
/// Held and suspended jobs still belong to the schedd and count as queuing.
fn job_state(code: &str) -> Option<JobState> {
    match code {
        "2" | "6" => Some(JobState::Running),
        "1" | "5" | "7" => Some(JobState::Queuing),
        _ => None,
    }
}

/// Parse `condor_q -autoformat ClusterId JobStatus`, unparsable lines are skipped
pub fn parse_queue(output: &str) -> Vec<(u64, JobState)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            let state = job_state(fields.next()?)?;

            Some((id, state))
        })
        .collect()
}

fn classad_string<'a>(details: &'a str, attribute: &str) -> Option<&'a str> {
    details.lines().find_map(|line| {
        let (name, value) = line.split_once('=')?;
        (name.trim() == attribute).then(|| value.trim().trim_matches('"'))
    })
}

/// Job directory from the ClassAd printed by `condor_q -long <id>`
pub fn parse_job_dir(details: &str, entrypoint: &str) -> Option<PathBuf> {
    match classad_string(details, "Cmd").map(Path::new) {
        Some(command) if command.file_name().map_or(false, |name| name == entrypoint) => {
            command.parent().map(Path::to_path_buf)
        }
        _ => classad_string(details, "Iwd").map(PathBuf::from),
    }
}
