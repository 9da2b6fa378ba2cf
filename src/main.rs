mod cli;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use batchflow::channel::LocalShell;
use batchflow::{Core, EngineConfig, JobFile, JobSnapshot, ModuleRegistry, State, StatusPoller};
use clap::Parser;
use cli::{Cli, Command};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// States a job in `run` can settle in.
const SETTLED: [State; 3] = [State::Finished, State::Error, State::Stop];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = EngineConfig::load(cli.config.as_deref()).context("loading engine config")?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    match cli.command {
        Command::Run { jobs, json } => run(config, jobs, json).await,
        Command::Check { jobs } => check(config, jobs),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "batchflow=debug" } else { "batchflow=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_jobs(paths: &[PathBuf]) -> Result<Vec<JobFile>> {
    paths
        .iter()
        .map(|path| JobFile::load(path).with_context(|| format!("reading {}", path.display())))
        .collect()
}

async fn run(config: EngineConfig, paths: Vec<PathBuf>, json: bool) -> Result<()> {
    let files = load_jobs(&paths)?;
    let core = Arc::new(Core::from_config(&config)?);

    let progress = (!json).then(|| Arc::new(ui::RunProgress::start(files.len())));
    if let Some(progress) = &progress {
        core.add_listener(progress.clone());
    }

    let mut jobs = Vec::with_capacity(files.len());
    for file in &files {
        let job = core
            .create_job_from_bindings(&file.name, file.parameters.clone(), &file.stages)
            .with_context(|| format!("creating job from {}", file.path.display()))?;
        if let Some(progress) = &progress {
            progress.track(job.id(), job.name());
        }
        jobs.push(job);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = StatusPoller::new(
        Arc::new(LocalShell::new(config.shell.clone())),
        config.status_command.clone(),
        Duration::from_millis(config.poll_interval_ms),
    );
    let poller = tokio::spawn(poller.run(core.clone(), stop_rx));

    let started = core.execute_all();
    tracing::info!(started, total = jobs.len(), "jobs started");

    let settled = async {
        while !jobs.iter().all(|job| SETTLED.contains(&job.state())) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::select! {
        _ = settled => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, stopping jobs");
            for job in &jobs {
                job.stop();
            }
        }
    }

    let _ = stop_tx.send(true);
    if let Err(e) = poller.await {
        tracing::warn!("status poller ended abnormally: {e}");
    }
    core.shutdown();

    let snapshots: Vec<JobSnapshot> = jobs.iter().map(|job| job.snapshot()).collect();
    match &progress {
        Some(progress) => progress.finish(&snapshots),
        None => println!("{}", serde_json::to_string_pretty(&snapshots)?),
    }

    let unfinished = snapshots
        .iter()
        .filter(|s| s.state != State::Finished)
        .count();
    if unfinished > 0 {
        bail!("{unfinished} of {} job(s) did not finish", snapshots.len());
    }
    Ok(())
}

fn check(config: EngineConfig, paths: Vec<PathBuf>) -> Result<()> {
    let registry = ModuleRegistry::from_defs(&config.modules);
    let mut failed = 0;
    for path in &paths {
        let result = JobFile::load(path)
            .map_err(anyhow::Error::from)
            .and_then(|file| registry.resolve(&file.stages).map_err(anyhow::Error::from));
        match result {
            Ok(modules) => println!("  ✓ {} ({} stage(s) bound)", path.display(), modules.len()),
            Err(e) => {
                failed += 1;
                println!("  ✗ {}: {e}", path.display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} job file(s) invalid");
    }
    Ok(())
}
