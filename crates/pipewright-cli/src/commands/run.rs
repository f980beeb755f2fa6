//! `pipewright run`: execute a flow on this host through the job engine.

use anyhow::{Context, Result, bail};
use pipewright_config::EngineConfig;
use pipewright_config::system::load_engine_config;
use pipewright_core::FlowId;
use pipewright_core::agent::AgentEvent;
use pipewright_core::event::BroadcastEventBus;
use pipewright_core::job::{Job, JobStatus, Trigger};
use pipewright_db::{JobRepo, MemJobRepo, MemStepRepo, MemYmlRepo};
use pipewright_executor::{GitYmlFetcher, InMemoryPluginRegistry, LocalAgentPool, LogTaskRunner};
use pipewright_scheduler::{
    Collaborators, InMemoryJobQueue, InMemoryLock, JobActionManager, TimeoutSweeper, Worker,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const STATUS_POLL: Duration = Duration::from_millis(500);

pub struct RunOptions {
    pub path: PathBuf,
    pub name: Option<String>,
    pub envs: Vec<String>,
    pub agents: usize,
    pub plugins: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

pub async fn run(options: RunOptions) -> Result<()> {
    let config = match &options.config {
        Some(path) => load_engine_config(path)
            .with_context(|| format!("unable to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let (tree, yaml) = super::load_tree(&options.path, options.name.as_deref())?;
    let flow_name = tree.root().name.clone();

    let plugins = Arc::new(InMemoryPluginRegistry::new());
    if let Some(path) = &options.plugins {
        let count = plugins.load_file(path).await?;
        info!(count, path = %path.display(), "plugins loaded");
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(LocalAgentPool::new(
        options.agents.max(1),
        config.workspace.join("jobs"),
        events_tx,
    ));
    let queue = Arc::new(InMemoryJobQueue::new());
    let jobs = Arc::new(MemJobRepo::new());
    let collab = Collaborators {
        jobs: jobs.clone(),
        steps: Arc::new(MemStepRepo::new()),
        ymls: Arc::new(MemYmlRepo::new()),
        queue: queue.clone(),
        lock: Arc::new(InMemoryLock::new()),
        agents: pool.clone(),
        events: Arc::new(BroadcastEventBus::default()),
        plugins,
        fetcher: Arc::new(GitYmlFetcher::new(config.workspace.join("repos"))),
        tasks: Arc::new(LogTaskRunner),
    };
    let manager = Arc::new(JobActionManager::new(collab, config)?);

    let mut job = Job::new(FlowId::new(), flow_name, 1, Trigger::Manual);
    for pair in &options.envs {
        let (key, value) = parse_env(pair)?;
        job.context.put(key, value);
    }

    let job = manager.create_job(job).await?;
    let job = manager.to_created(job, yaml).await?;
    if job.is_done() {
        bail!("job {} failed before it started: {}", job.id, job.message);
    }

    let queue_name = job.queue_name(&manager.config().queue_prefix);
    let worker = Arc::new(Worker::new("local-worker", queue_name, queue, manager.clone()));
    let worker_task = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });
    let sweeper = TimeoutSweeper::new(manager.clone());
    let sweeper_task = tokio::spawn(async move { sweeper.run().await });

    let job = manager.to_start(job).await?;
    info!(job_id = %job.id, "job queued");

    let job_id = job.id;
    let mut cancel_sent = false;
    let finished = loop {
        tokio::select! {
            Some(event) = events_rx.recv() => {
                handle_event(&manager, event).await;
            }
            result = tokio::signal::ctrl_c(), if !cancel_sent => {
                result?;
                cancel_sent = true;
                let current = jobs.get(job_id).await?;
                match manager.to_cancelled(current, "Cancelled from the command line").await {
                    Ok(job) => info!(job_id = %job.id, status = %job.status, "cancel requested"),
                    Err(e) => warn!(job_id = %job_id, error = %e, "unable to cancel job"),
                }
            }
            _ = tokio::time::sleep(STATUS_POLL) => {}
        }

        let current = jobs.get(job_id).await?;
        if current.is_done() {
            break current;
        }
    };

    worker_task.abort();
    sweeper_task.abort();
    report(&manager, &finished, options.json).await?;

    if finished.status != JobStatus::Success {
        bail!("job finished with {}", finished.status);
    }
    Ok(())
}

async fn handle_event(manager: &JobActionManager, event: AgentEvent) {
    if let Err(e) = manager.on_agent_event(event).await {
        warn!(error = %e, "agent event not applied");
    }
}

async fn report(manager: &JobActionManager, job: &Job, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }

    println!("Job {} #{}: {}", job.flow_name, job.build_number, job.status);
    for step in manager.steps().list(job.id).await? {
        let error = step.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default();
        println!("  {:<40} {}{}", step.node_path, step.status, error);
    }
    if !job.message.is_empty() {
        println!("{}", job.message);
    }
    Ok(())
}

fn parse_env(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => bail!("invalid variable '{pair}', expected KEY=VALUE"),
    }
}
