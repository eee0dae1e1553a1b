//! runwarden - runs a seed plan of agent tasks to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use runwarden_orchestrator::{
    Clock, Config, EchoProvider, EventBus, InMemoryStore, RuntimeService, SeedPlan, Store,
    StuckRunDetector, Supervisor, SystemClock,
};

/// runwarden - run orchestration for agent tasks
#[derive(Parser)]
#[command(name = "runwarden")]
#[command(about = "Schedules, executes and watches agent task runs", long_about = None)]
struct Args {
    /// JSON seed plan with tasks and dependencies
    #[arg(short, long)]
    plan: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    /// Stop once every task has settled
    #[arg(long)]
    exit_when_idle: bool,

    /// Retryable failures tolerated per run
    #[arg(long)]
    max_attempts: Option<u32>,

    /// First retry delay in seconds
    #[arg(long)]
    base_delay_secs: Option<u64>,

    /// Retry delay cap in seconds
    #[arg(long)]
    max_delay_secs: Option<u64>,

    /// Provider call timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Seconds without activity before a run is reported idle
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Duplicate log ratio that counts as repeating
    #[arg(long)]
    repeat_threshold: Option<f64>,

    /// Failed fraction of recent runs that counts as a high error rate
    #[arg(long)]
    error_rate_threshold: Option<f64>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        if let Some(secs) = self.base_delay_secs {
            config.retry.base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = self.max_delay_secs {
            config.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeout_secs {
            config.default_execution_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.detector.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ratio) = self.repeat_threshold {
            config.detector.repeat_threshold = ratio;
        }
        if let Some(ratio) = self.error_rate_threshold {
            config.detector.error_rate_threshold = ratio;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.config();
    if config.retry.base_delay > config.retry.max_delay {
        return Err("base delay must not exceed max delay".into());
    }

    // Create shared state
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Arc::new(EventBus::new(store.clone(), config.event_channel_capacity));
    let shutdown = CancellationToken::new();

    let runtime = Arc::new(
        RuntimeService::new(
            store.clone(),
            bus.clone(),
            Arc::new(EchoProvider),
            clock.clone(),
            config.clone(),
        )
        .with_shutdown(shutdown.clone()),
    );

    let plan = SeedPlan::load(&args.plan).map_err(|e| {
        format!("Failed to load plan from '{}': {}", args.plan.display(), e)
    })?;
    let (projects, _) = plan.apply(runtime.tasks()).await?;

    let detector = Arc::new(StuckRunDetector::new(
        store.clone(),
        bus,
        clock.clone(),
        config.detector.clone(),
    ));

    let supervisor = Arc::new(
        Supervisor::new(
            store.clone(),
            runtime,
            detector,
            clock,
            config,
            projects.clone(),
            shutdown.clone(),
        )
        .with_exit_when_idle(args.exit_when_idle),
    );

    // Stop on Ctrl-C
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            ctrl_c.cancel();
        }
    });

    info!(plan = %args.plan.display(), projects = projects.len(), "Starting runwarden");
    supervisor.run().await?;

    for project_id in &projects {
        println!("Project {}", project_id);
        println!("{:<38} {:<10} {:<4} TITLE", "TASK", "STATUS", "PRI");
        for task in store.list_tasks(project_id).await? {
            println!(
                "{:<38} {:<10} {:<4} {}",
                task.id.as_str(),
                task.status.as_str(),
                task.priority,
                task.title
            );
        }
    }

    let open_alerts = store.list_open_alerts().await?;
    if !open_alerts.is_empty() {
        warn!(count = open_alerts.len(), "Open alerts remain");
        for alert in open_alerts {
            println!("ALERT {} {}: {}", alert.kind.as_str(), alert.source_id, alert.title);
        }
    }

    Ok(())
}
