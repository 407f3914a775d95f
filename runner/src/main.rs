use clap::{ArgAction, Parser, Subcommand};
use std::{error::Error, path::PathBuf, process::ExitCode};
use studysub_runner::{
    config::RunnerConfig,
    configure,
    dependency::DependencyGraph,
    reconcile::ClusterState,
    registry::JobRegistry,
    runscript,
    shell::SystemShell,
    submit::Orchestrator,
    sync::study::Study,
    tree::JobStatus,
};
use tracing::{error, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Submit a tree of generation-ordered jobs to the local machine, HTCondor or Slurm
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// runner configuration
    #[arg(short, long, default_value = "studysub.yaml")]
    config: PathBuf,

    /// more output, repeat for trace logs
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every job with its generation, status, backend and blockers
    Jobs,
    /// Reconcile with the schedulers and show running and queuing jobs
    Status,
    /// Submit every eligible job that is not known to its backend yet
    Submit,
    /// Write the run script of every job
    Generate,
    /// Apply the configured defaults to unconfigured jobs
    Configure,
    /// Overwrite the status of a single job
    SetStatus {
        /// job path, e.g. base/a_1.0_b_1
        job: String,
        /// unconfigured, to_submit, submitted or completed
        status: JobStatus,
    },
}

fn print_state(state: &ClusterState) {
    for path in state.running.iter() {
        println!("running\t{path}");
    }
    for path in state.queuing.iter() {
        println!("queuing\t{path}");
    }
}

fn list_jobs(study: &Study) -> Result<(), Box<dyn Error>> {
    let tree = study.load_tree()?;
    let registry = JobRegistry::enumerate(&tree);
    let graph = DependencyGraph::build(&tree, &registry);

    for entry in registry.iter() {
        let Some(node) = tree.job(entry.keys.as_slice()) else {
            continue;
        };
        let blockers = graph
            .unfinished(&entry.path)
            .map(|blocking| blocking.iter().cloned().collect::<Vec<_>>().join(","))
            .unwrap_or_default();

        println!(
            "{}\tgen {}\t{}\t{}\t{}",
            entry.path,
            entry.generation,
            node.status,
            node.submission_type.as_deref().unwrap_or("-"),
            if blockers.is_empty() { "-" } else { blockers.as_str() }
        );
    }

    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = RunnerConfig::load(&cli.config)?;
    if config.preflight_checks() {
        return Err("the configuration contains errors, see above".into());
    }

    let study = Study::open(&config.tree, config.lock_timeout())?;
    let shell = SystemShell::new(config.command_timeout());
    let orchestrator = Orchestrator::new(&config, &study, &shell);

    match cli.command {
        Commands::Jobs => list_jobs(&study)?,
        Commands::Status => print_state(&orchestrator.status()?),
        Commands::Submit => {
            let report = orchestrator.run()?;
            for path in report.submitted.iter() {
                println!("submitted\t{path}");
            }
            print_state(&report.state);
        }
        Commands::Generate => {
            runscript::generate(&study, &config)?;
        }
        Commands::Configure => {
            configure::configure(&study, &config)?;
        }
        Commands::SetStatus { job, status } => configure::set_status(&study, &job, status)?,
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            let mut source = error.source();
            while let Some(cause) = source {
                error!("caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}
