//! Supervisor - wires the services into long-running loops.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runwarden_core::{ProjectId, ProviderRequest, RunId, RunStatus, Task};

use crate::clock::Clock;
use crate::config::Config;
use crate::detector::StuckRunDetector;
use crate::error::Result;
use crate::runtime::{ExecutionOutcome, RecoveryReport, RuntimeService};
use crate::scheduler::ReadinessScheduler;
use crate::store::Store;

/// Drives dispatch, retries and detection for a fixed set of projects.
pub struct Supervisor {
    store: Arc<dyn Store>,
    runtime: Arc<RuntimeService>,
    scheduler: ReadinessScheduler,
    detector: Arc<StuckRunDetector>,
    clock: Arc<dyn Clock>,
    config: Config,
    projects: Vec<ProjectId>,
    shutdown: CancellationToken,
    exit_when_idle: bool,
}

impl Supervisor {
    /// Create a new Supervisor.
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<RuntimeService>,
        detector: Arc<StuckRunDetector>,
        clock: Arc<dyn Clock>,
        config: Config,
        projects: Vec<ProjectId>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler: ReadinessScheduler::new(store.clone()),
            store,
            runtime,
            detector,
            clock,
            config,
            projects,
            shutdown,
            exit_when_idle: false,
        }
    }

    /// Builder method to stop once nothing is left to do.
    pub fn with_exit_when_idle(mut self, exit_when_idle: bool) -> Self {
        self.exit_when_idle = exit_when_idle;
        self
    }

    /// Recover, then run every loop until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<RecoveryReport> {
        let report = self.runtime.recover_after_restart().await?;
        info!(
            interrupted = report.interrupted.len(),
            resumed = report.resumed.len(),
            projects = self.projects.len(),
            "Supervisor starting"
        );

        // Resumed runs are already `running`; execute them before new work.
        for run_id in &report.resumed {
            self.execute_existing(run_id).await;
        }

        let detector = tokio::spawn(self.detector.clone().run(self.shutdown.clone()));

        tokio::join!(self.dispatch_loop(), self.retry_loop());

        if let Err(e) = detector.await {
            error!(error = %e, "Detector task panicked");
        }
        info!("Supervisor stopped");
        Ok(report)
    }

    async fn dispatch_loop(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let dispatched = match self.dispatch_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Dispatch failed");
                    0
                }
            };
            if dispatched > 0 {
                continue;
            }

            if self.exit_when_idle && self.is_idle().await {
                info!("Nothing left to run, shutting down");
                self.shutdown.cancel();
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.dispatch_interval) => {}
            }
        }
    }

    async fn retry_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_poll_interval) => {}
            }
            if let Err(e) = self.retry_once().await {
                error!(error = %e, "Retry pass failed");
            }
        }
    }

    /// Start the next schedulable task of every project. Returns the number
    /// of runs executed.
    pub async fn dispatch_once(&self) -> Result<usize> {
        let mut executed = 0;
        for project_id in &self.projects {
            let Some(task) = self.scheduler.pick_next(project_id).await? else {
                continue;
            };

            let key = format!("{}:v{}", task.id, task.version);
            let run = self.runtime.create_run(&task.id, None, &key, None).await?;
            debug!(task_id = %task.id, run_id = %run.id, "Dispatching task");

            let outcome = self
                .runtime
                .execute_run(&run.id, request_for(&task), None)
                .await?;
            log_outcome(&outcome);
            executed += 1;
        }
        Ok(executed)
    }

    /// Resume due retries and re-execute interrupted runs. Returns the number
    /// of runs executed.
    pub async fn retry_once(&self) -> Result<usize> {
        let limit = self.config.recovery_batch_limit;
        let mut pending: Vec<RunId> = self
            .runtime
            .resume_due_retries(self.clock.now(), limit)
            .await?;
        pending.extend(
            self.store
                .list_runs_by_status(RunStatus::Interrupted, limit)
                .await?
                .into_iter()
                .map(|r| r.id),
        );

        for run_id in &pending {
            self.execute_existing(run_id).await;
        }
        Ok(pending.len())
    }

    async fn execute_existing(&self, run_id: &RunId) {
        let result = async {
            let run = self.runtime.get_run(run_id).await?;
            let task = self.runtime.tasks().get_task(&run.task_id).await?;
            self.runtime
                .execute_run(run_id, request_for(&task), None)
                .await
        }
        .await;

        match result {
            Ok(outcome) => log_outcome(&outcome),
            Err(e) => warn!(run_id = %run_id, error = %e, "Re-execution failed"),
        }
    }

    /// No schedulable task and no run that still needs the runtime.
    async fn is_idle(&self) -> bool {
        for project_id in &self.projects {
            match self.scheduler.pick_next(project_id).await {
                Ok(None) => {}
                Ok(Some(_)) => return false,
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "Idle check failed");
                    return false;
                }
            }
        }
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::RetryScheduled,
            RunStatus::Interrupted,
        ] {
            match self.store.list_runs_by_status(status, 1).await {
                Ok(runs) if runs.is_empty() => {}
                _ => return false,
            }
        }
        true
    }
}

/// Build the provider request for a task.
fn request_for(task: &Task) -> ProviderRequest {
    let prompt = if task.description.is_empty() {
        task.title.clone()
    } else {
        format!("{}\n\n{}", task.title, task.description)
    };
    ProviderRequest::new(prompt).streaming()
}

fn log_outcome(outcome: &ExecutionOutcome) {
    let run = outcome.run();
    match outcome {
        ExecutionOutcome::Succeeded(_) => {
            info!(run_id = %run.id, task_id = %run.task_id, "Run finished")
        }
        ExecutionOutcome::RetryScheduled(_) | ExecutionOutcome::Interrupted(_) => {
            info!(run_id = %run.id, status = %run.status, "Run paused")
        }
        ExecutionOutcome::Failed(_) => {
            warn!(run_id = %run.id, error_code = ?run.error_code, "Run failed for good")
        }
        ExecutionOutcome::Skipped(_) | ExecutionOutcome::Superseded(_) => {
            debug!(run_id = %run.id, status = %run.status, "Run not executed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runwarden_core::{NewTask, TaskStatus};

    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::provider::EchoProvider;
    use crate::store::InMemoryStore;

    fn supervisor(store: Arc<InMemoryStore>) -> Arc<Supervisor> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let config = Config::default();
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
        let detector = Arc::new(StuckRunDetector::new(
            store.clone(),
            bus,
            clock.clone(),
            config.detector.clone(),
        ));
        Arc::new(
            Supervisor::new(
                store,
                runtime,
                detector,
                clock,
                config,
                vec![ProjectId::new("p")],
                shutdown,
            )
            .with_exit_when_idle(true),
        )
    }

    #[tokio::test]
    async fn dispatch_runs_tasks_in_dependency_order() {
        let store = Arc::new(InMemoryStore::new());
        let sup = supervisor(store.clone());
        let tasks = sup.runtime.tasks();
        let first = tasks
            .create_task(NewTask::new(ProjectId::new("p"), "first"), None)
            .await
            .unwrap();
        let second = tasks
            .create_task(NewTask::new(ProjectId::new("p"), "second").with_priority(1), None)
            .await
            .unwrap();
        tasks.add_dependency(&second.id, &first.id, None).await.unwrap();

        assert_eq!(sup.dispatch_once().await.unwrap(), 1);
        assert_eq!(tasks.get_task(&first.id).await.unwrap().status, TaskStatus::Review);

        // Review is not done, so the dependent stays blocked.
        assert_eq!(sup.dispatch_once().await.unwrap(), 0);

        let first = tasks.get_task(&first.id).await.unwrap();
        tasks
            .transition_task(&first.id, TaskStatus::Done, first.version, "operator", None)
            .await
            .unwrap();
        assert_eq!(sup.dispatch_once().await.unwrap(), 1);
        assert_eq!(tasks.get_task(&second.id).await.unwrap().status, TaskStatus::Review);
    }

    #[tokio::test]
    async fn run_exits_when_idle() {
        let store = Arc::new(InMemoryStore::new());
        let sup = supervisor(store.clone());
        sup.runtime
            .tasks()
            .create_task(NewTask::new(ProjectId::new("p"), "only"), None)
            .await
            .unwrap();

        let report = sup.clone().run().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(store.run_count().await, 1);
        assert!(sup.shutdown.is_cancelled());
    }
}
