//! Runtime execution service.
//!
//! The runtime is the only writer of run status, timestamps and error fields.
//! Every write goes through [`plan_transition`] and lands as a conditional
//! update on the version the runtime last read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use runwarden_core::run_machine::plan_transition;
use runwarden_core::{
    AgentId, CoreError, EventRecord, EventType, ProjectId, ProviderError, ProviderRequest,
    ProviderResponse, RunChange, RunId, RunLog, RunPlan, RunStatus, RunStatusChanged, TaskId,
    TaskRun, TaskStatus,
};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::events::EventSink;
use crate::fault::{FaultInjector, FaultPoint, InjectedFault, NoopFaultInjector};
use crate::provider::Provider;
use crate::redact;
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreError};
use crate::tasks::TaskService;

const RUNTIME_ACTOR: &str = "runtime";
const RECOVERY_ACTOR: &str = "recovery";

/// Attempts made by `create_run` when an insert races another writer.
const CREATE_RUN_ATTEMPTS: usize = 3;

/// Error code for a provider call that exceeded its deadline.
pub const ERROR_CODE_TIMEOUT: &str = "timeout";
/// Error code for a run interrupted by shutdown.
pub const ERROR_CODE_INTERRUPTED: &str = "interrupted";
/// Error code for a run found in flight after a restart.
pub const ERROR_CODE_PROCESS_RESTART: &str = "process_restart";

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(TaskRun),
    RetryScheduled(TaskRun),
    Failed(TaskRun),
    Interrupted(TaskRun),
    /// The run was already terminal; nothing was executed.
    Skipped(TaskRun),
    /// Another writer moved the run while the provider call was in flight.
    Superseded(TaskRun),
}

impl ExecutionOutcome {
    /// The run as last written or read.
    pub fn run(&self) -> &TaskRun {
        match self {
            Self::Succeeded(run)
            | Self::RetryScheduled(run)
            | Self::Failed(run)
            | Self::Interrupted(run)
            | Self::Skipped(run)
            | Self::Superseded(run) => run,
        }
    }
}

/// Runs touched by [`RuntimeService::recover_after_restart`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: Vec<RunId>,
    pub resumed: Vec<RunId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty() && self.resumed.is_empty()
    }
}

enum CallOutcome {
    Completed(ProviderResponse),
    Failed(ProviderError),
    TimedOut,
    Interrupted,
}

impl From<InjectedFault> for CallOutcome {
    fn from(fault: InjectedFault) -> Self {
        match fault {
            InjectedFault::Timeout => Self::TimedOut,
            InjectedFault::Interrupt => Self::Interrupted,
            InjectedFault::ProviderError(e) => Self::Failed(e),
        }
    }
}

/// Creates runs and drives them through the provider.
pub struct RuntimeService {
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    tasks: Arc<TaskService>,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    faults: Arc<dyn FaultInjector>,
    retry: RetryPolicy,
    config: Config,
    shutdown: CancellationToken,
    booted_at: DateTime<Utc>,
}

impl RuntimeService {
    /// Create a new RuntimeService.
    ///
    /// Runs found `running` with a start time before this call are treated
    /// as stranded by [`Self::interrupt_inflight_runs`].
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        let tasks = Arc::new(TaskService::new(
            store.clone(),
            events.clone(),
            clock.clone(),
        ));
        Self {
            booted_at: clock.now(),
            retry: RetryPolicy::from_config(&config.retry),
            store,
            events,
            tasks,
            provider,
            clock,
            faults: Arc::new(NoopFaultInjector),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Builder method to set the fault injector.
    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Builder method to share a shutdown token.
    ///
    /// Cancelling it interrupts in-flight provider calls.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Task service sharing this runtime's store, sink and clock.
    pub fn tasks(&self) -> &Arc<TaskService> {
        &self.tasks
    }

    pub fn booted_at(&self) -> DateTime<Utc> {
        self.booted_at
    }

    /// Get a run by id.
    pub async fn get_run(&self, run_id: &RunId) -> Result<TaskRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))
    }

    /// Create a queued run, or return the run already holding `idempotency_key`.
    ///
    /// A key already used by another task is a contract violation.
    pub async fn create_run(
        &self,
        task_id: &TaskId,
        agent_id: Option<AgentId>,
        idempotency_key: &str,
        trace_id: Option<String>,
    ) -> Result<TaskRun> {
        if idempotency_key.trim().is_empty() {
            return Err(CoreError::contract("idempotency_key must not be empty").into());
        }

        for _ in 0..CREATE_RUN_ATTEMPTS {
            if let Some(existing) = self.store.get_run_by_key(idempotency_key).await? {
                return reuse_run(existing, task_id);
            }

            let task = self.tasks.get_task(task_id).await?;
            let attempt = self.store.max_attempt(task_id).await? + 1;
            let agent_id = agent_id.clone().or_else(|| task.assignee_agent_id.clone());
            let run = TaskRun::new(
                task_id.clone(),
                agent_id,
                attempt,
                idempotency_key,
                self.clock.now(),
            );

            match self.store.insert_run(run).await {
                Ok(run) => {
                    info!(
                        run_id = %run.id,
                        task_id = %task_id,
                        attempt = run.attempt,
                        "Run created"
                    );
                    self.events
                        .emit(EventRecord::new(
                            task.project_id,
                            EventType::RunCreated,
                            json!({
                                "run_id": run.id,
                                "task_id": run.task_id,
                                "attempt": run.attempt,
                                "idempotency_key": run.idempotency_key,
                            }),
                            trace_id,
                            run.created_at,
                        ))
                        .await;
                    return Ok(run);
                }
                Err(StoreError::DuplicateIdempotencyKey(_)) | Err(StoreError::Constraint(_)) => {
                    debug!(task_id = %task_id, "Run insert raced another writer, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.store.get_run_by_key(idempotency_key).await? {
            Some(existing) => reuse_run(existing, task_id),
            None => Err(StoreError::Constraint(format!(
                "could not allocate an attempt for task {task_id}"
            ))
            .into()),
        }
    }

    /// Execute a run against the provider.
    ///
    /// `timeout` defaults to the configured execution timeout.
    pub async fn execute_run(
        &self,
        run_id: &RunId,
        request: ProviderRequest,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "Run already finished, skipping");
            return Ok(ExecutionOutcome::Skipped(run));
        }

        let run = self
            .transition_run(&run, RunChange::start(), RUNTIME_ACTOR, None)
            .await?;
        self.tasks
            .advance(&run.task_id, TaskStatus::Running, RUNTIME_ACTOR, None)
            .await;

        let timeout = timeout.unwrap_or(self.config.default_execution_timeout);
        let outcome = self.call_provider(&run, &request, timeout).await;
        let settled = match outcome {
            CallOutcome::Completed(response) => self.complete(&run, response).await,
            CallOutcome::Failed(e) if e.retryable => {
                self.retry_or_fail(&run, e.kind.as_str(), &e.message).await
            }
            CallOutcome::Failed(e) => self.fail(&run, e.kind.as_str(), &e.message).await,
            CallOutcome::TimedOut => {
                let message = format!("provider call timed out after {}ms", timeout.as_millis());
                self.retry_or_fail(&run, ERROR_CODE_TIMEOUT, &message).await
            }
            CallOutcome::Interrupted => self
                .transition_run(
                    &run,
                    RunChange::interrupt(
                        ERROR_CODE_INTERRUPTED,
                        "execution interrupted by shutdown",
                    ),
                    RUNTIME_ACTOR,
                    None,
                )
                .await
                .map(ExecutionOutcome::Interrupted),
        };

        match settled {
            Err(e) if e.is_conflict() => {
                let current = self.get_run(run_id).await?;
                if current.status == RunStatus::Running {
                    return Err(e);
                }
                info!(
                    run_id = %run_id,
                    status = %current.status,
                    "Run moved by another writer during execution"
                );
                Ok(ExecutionOutcome::Superseded(current))
            }
            other => other,
        }
    }

    async fn call_provider(
        &self,
        run: &TaskRun,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> CallOutcome {
        if let Some(fault) = self.faults.check(&run.id, FaultPoint::BeforeProviderCall) {
            warn!(run_id = %run.id, fault = ?fault, "Injected fault before provider call");
            return fault.into();
        }

        debug!(
            run_id = %run.id,
            provider = %self.provider.name(),
            stream = request.stream,
            "Calling provider"
        );

        let call = async {
            if request.stream {
                self.generate_streaming(run, request).await
            } else {
                self.provider.generate(request).await
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => CallOutcome::Interrupted,
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(Ok(response)) => CallOutcome::Completed(response),
                Ok(Err(e)) => CallOutcome::Failed(e),
                Err(_) => CallOutcome::TimedOut,
            },
        };

        if let Some(fault) = self.faults.check(&run.id, FaultPoint::AfterProviderCall) {
            warn!(run_id = %run.id, fault = ?fault, "Injected fault after provider call");
            return fault.into();
        }
        outcome
    }

    /// Stream a response, persisting complete lines as run logs while the
    /// call is in flight.
    async fn generate_streaming(
        &self,
        run: &TaskRun,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // Sender drops with the closure when the call ends, closing the drain.
        let call = async move {
            let on_chunk = move |chunk: &str| {
                let _ = tx.send(chunk.to_string());
            };
            self.provider.generate_stream(request, &on_chunk).await
        };

        let drain = async {
            let mut pending = String::new();
            while let Some(chunk) = rx.recv().await {
                pending.push_str(&chunk);
                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    self.log_line(run, &line).await;
                }
            }
            self.log_line(run, &pending).await;
        };

        let (result, ()) = tokio::join!(call, drain);
        result
    }

    async fn log_line(&self, run: &TaskRun, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        if let Err(e) = self.write_log(run, line).await {
            warn!(run_id = %run.id, error = %e, "Failed to persist streamed output");
        }
    }

    async fn complete(
        &self,
        run: &TaskRun,
        response: ProviderResponse,
    ) -> Result<ExecutionOutcome> {
        let stored = self
            .transition_run(run, RunChange::succeed(response.usage), RUNTIME_ACTOR, None)
            .await?;

        info!(
            run_id = %stored.id,
            token_in = stored.token_in,
            token_out = stored.token_out,
            cost_usd = stored.cost_usd,
            "Run succeeded"
        );

        if let Some(project_id) = self.project_of(&stored.task_id).await {
            self.events
                .emit(EventRecord::new(
                    project_id,
                    EventType::RunResultLogged,
                    json!({
                        "run_id": stored.id,
                        "task_id": stored.task_id,
                        "attempt": stored.attempt,
                        "text": self.sanitize(&response.text),
                        "tool_calls": response.tool_calls.len(),
                        "token_in": response.usage.token_in,
                        "token_out": response.usage.token_out,
                        "cost_usd": response.usage.cost_usd,
                    }),
                    None,
                    self.clock.now(),
                ))
                .await;
        }

        self.tasks
            .advance(&stored.task_id, TaskStatus::Review, RUNTIME_ACTOR, None)
            .await;
        Ok(ExecutionOutcome::Succeeded(stored))
    }

    async fn retry_or_fail(
        &self,
        run: &TaskRun,
        code: &str,
        message: &str,
    ) -> Result<ExecutionOutcome> {
        let failure_count = self.failure_count(&run.id).await?;
        match self.retry.next_retry_at(failure_count, self.clock.now()) {
            Some(at) => {
                let stored = self
                    .transition_run(
                        run,
                        RunChange::schedule_retry(at, code, self.sanitize(message)),
                        RUNTIME_ACTOR,
                        None,
                    )
                    .await?;
                info!(
                    run_id = %run.id,
                    error_code = %code,
                    failure_count,
                    next_retry_at = %at,
                    "Retry scheduled"
                );
                Ok(ExecutionOutcome::RetryScheduled(stored))
            }
            None => {
                warn!(
                    run_id = %run.id,
                    failure_count,
                    max_attempts = self.retry.max_attempts,
                    "Retry budget exhausted"
                );
                self.fail(run, code, &format!("retry budget exhausted: {message}"))
                    .await
            }
        }
    }

    async fn fail(&self, run: &TaskRun, code: &str, message: &str) -> Result<ExecutionOutcome> {
        let stored = self
            .transition_run(
                run,
                RunChange::fail(code, self.sanitize(message)),
                RUNTIME_ACTOR,
                None,
            )
            .await?;
        warn!(run_id = %stored.id, error_code = %code, "Run failed");
        self.tasks
            .advance(&stored.task_id, TaskStatus::Failed, RUNTIME_ACTOR, None)
            .await;
        Ok(ExecutionOutcome::Failed(stored))
    }

    /// Number of the failure being handled: prior retry schedules plus one.
    async fn failure_count(&self, run_id: &RunId) -> Result<u32> {
        let history = self.store.list_run_transitions(run_id).await?;
        let scheduled = history
            .iter()
            .filter(|t| t.to == RunStatus::RetryScheduled)
            .count();
        Ok(u32::try_from(scheduled).unwrap_or(u32::MAX).saturating_add(1))
    }

    /// Force runs left `running` by a previous process to `interrupted`.
    ///
    /// Only runs started before this service was built are touched. Conflicts
    /// mean another actor already resolved the run and are ignored.
    pub async fn interrupt_inflight_runs(&self, limit: usize) -> Result<Vec<RunId>> {
        let running = self
            .store
            .list_runs_by_status(RunStatus::Running, limit)
            .await?;

        let mut interrupted = Vec::new();
        for run in running {
            if run.started_at.is_some_and(|at| at >= self.booted_at) {
                continue;
            }
            let change = RunChange::interrupt(
                ERROR_CODE_PROCESS_RESTART,
                "run was in flight when the process stopped",
            );
            match self.transition_run(&run, change, RECOVERY_ACTOR, None).await {
                Ok(stored) if stored.status == RunStatus::Interrupted => {
                    interrupted.push(stored.id)
                }
                Ok(_) => {}
                Err(e) if e.is_conflict() || e.is_transition_rejection() => {
                    debug!(run_id = %run.id, error = %e, "Stranded run already resolved");
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Failed to interrupt stranded run");
                }
            }
        }
        Ok(interrupted)
    }

    /// Move retry-scheduled runs due at or before `due_before` to `running`.
    pub async fn resume_due_retries(
        &self,
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RunId>> {
        let due = self.store.list_due_retries(due_before, limit).await?;

        let mut resumed = Vec::new();
        for run in due {
            match self
                .transition_run(&run, RunChange::start(), RUNTIME_ACTOR, None)
                .await
            {
                Ok(stored) => {
                    debug!(run_id = %stored.id, attempt = stored.attempt, "Retry resumed");
                    resumed.push(stored.id);
                }
                Err(e) if e.is_conflict() || e.is_transition_rejection() => {
                    debug!(run_id = %run.id, error = %e, "Due retry already picked up");
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Failed to resume retry");
                }
            }
        }
        Ok(resumed)
    }

    /// Interrupt stranded runs, then resume due retries.
    ///
    /// Calling this again right away returns an empty report.
    pub async fn recover_after_restart(&self) -> Result<RecoveryReport> {
        let limit = self.config.recovery_batch_limit;
        let interrupted = self.interrupt_inflight_runs(limit).await?;
        let resumed = self.resume_due_retries(self.clock.now(), limit).await?;

        let report = RecoveryReport {
            interrupted,
            resumed,
        };
        if !report.is_empty() {
            info!(
                interrupted = report.interrupted.len(),
                resumed = report.resumed.len(),
                "Recovered runs after restart"
            );
        }
        Ok(report)
    }

    /// Cancel a run that has not finished.
    ///
    /// A task left `running` by the cancelled run is cancelled with it, so it
    /// does not sit in `running` with nothing executing.
    pub async fn cancel_run(
        &self,
        run_id: &RunId,
        actor: &str,
        trace_id: Option<String>,
    ) -> Result<TaskRun> {
        let run = self.get_run(run_id).await?;
        let cancelled = self
            .transition_run(&run, RunChange::cancel(), actor, trace_id.clone())
            .await?;

        if run.status == RunStatus::Cancelled {
            return Ok(cancelled);
        }
        let task = self.tasks.get_task(&cancelled.task_id).await?;
        if task.status == TaskStatus::Running {
            self.tasks
                .advance(&task.id, TaskStatus::Cancelled, actor, trace_id)
                .await;
        }
        Ok(cancelled)
    }

    /// Append a redacted log line to a run.
    pub async fn append_run_log(&self, run_id: &RunId, message: &str) -> Result<RunLog> {
        let run = self.get_run(run_id).await?;
        self.write_log(&run, message).await
    }

    async fn write_log(&self, run: &TaskRun, message: &str) -> Result<RunLog> {
        let message = self.sanitize(message);
        let log = RunLog {
            run_id: run.id.clone(),
            task_id: run.task_id.clone(),
            content_hash: hex::encode(Sha256::digest(message.as_bytes())),
            message,
            created_at: self.clock.now(),
        };
        self.store.append_run_log(log.clone()).await?;
        Ok(log)
    }

    /// Plan, write and announce one run transition.
    async fn transition_run(
        &self,
        run: &TaskRun,
        change: RunChange,
        actor: &str,
        trace_id: Option<String>,
    ) -> Result<TaskRun> {
        let now = self.clock.now();
        let next = match plan_transition(run, change, now)? {
            RunPlan::Noop => return Ok(run.clone()),
            RunPlan::Apply(next) => next,
        };

        let stored = self.store.update_run(next, run.version, actor).await?;

        info!(
            run_id = %stored.id,
            task_id = %stored.task_id,
            from = %run.status,
            to = %stored.status,
            actor = %actor,
            version = stored.version,
            "Run status changed"
        );

        if let Some(project_id) = self.project_of(&stored.task_id).await {
            let change = RunStatusChanged {
                run_id: stored.id.clone(),
                task_id: stored.task_id.clone(),
                previous_status: run.status,
                new_status: stored.status,
                actor: actor.to_string(),
                attempt: stored.attempt,
                version: stored.version,
                error_code: stored.error_code.clone(),
            };
            self.events
                .emit(EventRecord::run_status_changed(
                    project_id, &change, trace_id, now,
                ))
                .await;
        }

        Ok(stored)
    }

    async fn project_of(&self, task_id: &TaskId) -> Option<ProjectId> {
        match self.store.get_task(task_id).await {
            Ok(Some(task)) => Some(task.project_id),
            Ok(None) => {
                warn!(task_id = %task_id, "Task missing, event not emitted");
                None
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Task lookup failed, event not emitted");
                None
            }
        }
    }

    fn sanitize(&self, text: &str) -> String {
        redact::sanitize(text, self.config.error_message_max_len)
    }
}

fn reuse_run(existing: TaskRun, task_id: &TaskId) -> Result<TaskRun> {
    if &existing.task_id != task_id {
        return Err(CoreError::contract(format!(
            "idempotency key {} belongs to task {}, not {}",
            existing.idempotency_key, existing.task_id, task_id
        ))
        .into());
    }
    debug!(
        run_id = %existing.id,
        key = %existing.idempotency_key,
        "Reusing run for idempotency key"
    );
    Ok(existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use runwarden_core::{NewTask, ProjectId, Usage};

    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::fault::ScriptedFaultInjector;
    use crate::provider::ChunkCallback;
    use crate::store::InMemoryStore;

    /// Provider that replays scripted results and counts calls.
    #[derive(Default)]
    struct ScriptedProvider {
        script: Mutex<Vec<std::result::Result<ProviderResponse, ProviderError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn then(self, result: std::result::Result<ProviderResponse, ProviderError>) -> Self {
            self.script.lock().unwrap().insert(0, result);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn ok(text: &str) -> std::result::Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            text: text.to_string(),
            tool_calls: Vec::new(),
            usage: Usage::new(10, 5, 0.01),
        })
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _request: &ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| ok("done"))
        }

        async fn generate_stream(
            &self,
            request: &ProviderRequest,
            on_chunk: ChunkCallback<'_>,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            on_chunk("first line\nsecond ");
            on_chunk("line\n");
            on_chunk("tail");
            self.generate(request).await
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        clock: ManualClock,
        provider: Arc<ScriptedProvider>,
        faults: Arc<ScriptedFaultInjector>,
        runtime: RuntimeService,
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let provider = Arc::new(provider);
        let faults = Arc::new(ScriptedFaultInjector::new());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let runtime = RuntimeService::new(
            store.clone(),
            bus,
            provider.clone(),
            Arc::new(clock.clone()),
            Config::default(),
        )
        .with_fault_injector(faults.clone());
        Harness {
            store,
            clock,
            provider,
            faults,
            runtime,
        }
    }

    async fn new_task(h: &Harness) -> TaskId {
        h.runtime
            .tasks()
            .create_task(NewTask::new(ProjectId::new("p"), "write tests"), None)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn create_run_dedups_by_key() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;

        let first = h.runtime.create_run(&task, None, "k1", None).await.unwrap();
        let second = h.runtime.create_run(&task, None, "k1", None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.store.run_count().await, 1);

        let next = h.runtime.create_run(&task, None, "k2", None).await.unwrap();
        assert_eq!(next.attempt, 2);
    }

    #[tokio::test]
    async fn create_run_rejects_key_of_other_task() {
        let h = harness(ScriptedProvider::default());
        let a = new_task(&h).await;
        let b = new_task(&h).await;
        h.runtime.create_run(&a, None, "shared", None).await.unwrap();

        let err = h.runtime.create_run(&b, None, "shared", None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Core(CoreError::ContractViolation(_))
        ));
    }

    #[tokio::test]
    async fn create_run_rejects_empty_key() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        assert!(h.runtime.create_run(&task, None, "  ", None).await.is_err());
    }

    #[tokio::test]
    async fn success_moves_task_to_review() {
        let h = harness(ScriptedProvider::default().then(ok("all good")));
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        let outcome = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        let run = outcome.run().clone();
        assert!(matches!(outcome, ExecutionOutcome::Succeeded(_)));
        assert_eq!(run.token_in, 10);
        assert!(run.ended_at.is_some());

        let task = h.runtime.tasks().get_task(&task).await.unwrap();
        assert_eq!(task.status, TaskStatus::Review);

        let events = h.store.list_events(&ProjectId::new("p")).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::RunResultLogged));
    }

    #[tokio::test]
    async fn non_retryable_error_fails_run_and_task() {
        let h = harness(
            ScriptedProvider::default().then(Err(ProviderError::invalid_request("bad prompt"))),
        );
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        let outcome = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        let run = outcome.run();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some("invalid_request"));
        assert_eq!(
            h.runtime.tasks().get_task(&task).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn provider_error_text_is_redacted_and_capped() {
        let body = format!(
            r#"request rejected: {{"api_key": "live_51Habc123xyz"}} {}"#,
            "x".repeat(6000)
        );
        let h = harness(
            ScriptedProvider::default().then(Err(ProviderError::invalid_request(body))),
        );
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        h.runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();

        let stored = h.store.get_run(&run.id).await.unwrap().unwrap();
        let message = stored.error_message.unwrap();
        assert!(!message.contains("live_51Habc123xyz"));
        assert!(message.contains("[REDACTED]"));
        assert_eq!(message.chars().count(), Config::default().error_message_max_len);
        assert!(message.ends_with("...[truncated]"));
    }

    #[tokio::test]
    async fn retryable_errors_back_off_then_exhaust() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();
        let base = Config::default().retry.base_delay;

        for n in 1..=3u32 {
            h.faults.push(
                FaultPoint::BeforeProviderCall,
                InjectedFault::ProviderError(ProviderError::unavailable("503")),
            );
            let outcome = h
                .runtime
                .execute_run(&run.id, ProviderRequest::new("go"), None)
                .await
                .unwrap();
            let scheduled = outcome.run();
            assert_eq!(scheduled.status, RunStatus::RetryScheduled);
            let expected = h.clock.now()
                + crate::config::chrono_duration(base * 2u32.pow(n - 1));
            assert_eq!(scheduled.next_retry_at, Some(expected));
        }

        h.faults.push(
            FaultPoint::BeforeProviderCall,
            InjectedFault::ProviderError(ProviderError::unavailable("503")),
        );
        let outcome = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn interrupt_does_not_consume_retry_budget() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        h.faults
            .push(FaultPoint::AfterProviderCall, InjectedFault::Interrupt);
        let outcome = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        assert_eq!(outcome.run().status, RunStatus::Interrupted);
        assert_eq!(outcome.run().error_code.as_deref(), Some(ERROR_CODE_INTERRUPTED));

        h.faults.push(FaultPoint::BeforeProviderCall, InjectedFault::Timeout);
        let outcome = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        // First retry still uses the base delay.
        assert_eq!(
            outcome.run().next_retry_at,
            Some(h.clock.now() + crate::config::chrono_duration(Config::default().retry.base_delay))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_retryable_failure() {
        let provider = ScriptedProvider {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let h = harness(provider);
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        let outcome = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let run = outcome.run();
        assert_eq!(run.status, RunStatus::RetryScheduled);
        assert_eq!(run.error_code.as_deref(), Some(ERROR_CODE_TIMEOUT));
    }

    #[tokio::test]
    async fn shutdown_interrupts_in_flight_call() {
        let token = CancellationToken::new();
        let mut h = harness(ScriptedProvider::default());
        h.runtime = h.runtime.with_shutdown(token.clone());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        token.cancel();
        let outcome = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Interrupted(_)));
    }

    #[tokio::test]
    async fn streamed_lines_become_run_logs() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        h.runtime
            .execute_run(&run.id, ProviderRequest::new("go").streaming(), None)
            .await
            .unwrap();

        let logs = h.store.recent_run_logs(&run.id, 10).await.unwrap();
        let lines: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(lines, vec!["first line", "second line", "tail"]);
    }

    #[tokio::test]
    async fn run_logs_are_redacted_and_hashed() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        let a = h
            .runtime
            .append_run_log(&run.id, "using key sk-abcdefghijklmnopqrst")
            .await
            .unwrap();
        let b = h
            .runtime
            .append_run_log(&run.id, "using key sk-zyxwvutsrqponmlkjihg")
            .await
            .unwrap();
        assert!(!a.message.contains("sk-"));
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn terminal_runs_are_not_executed_again() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();
        h.runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();

        let again = h
            .runtime
            .execute_run(&run.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        assert!(matches!(again, ExecutionOutcome::Skipped(_)));
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_runs() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        let cancelled = h.runtime.cancel_run(&run.id, "operator", None).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        // Idempotent no-op
        h.runtime.cancel_run(&run.id, "operator", None).await.unwrap();

        let other = h.runtime.create_run(&task, None, "k2", None).await.unwrap();
        h.runtime
            .execute_run(&other.id, ProviderRequest::new("go"), None)
            .await
            .unwrap();
        let err = h.runtime.cancel_run(&other.id, "operator", None).await.unwrap_err();
        assert!(err.is_transition_rejection());
    }

    #[tokio::test]
    async fn cancelling_in_flight_run_cancels_its_task() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        // Mid-execution: run and task both running.
        let mut running = run.clone();
        running.status = RunStatus::Running;
        running.started_at = Some(h.clock.now());
        h.store.update_run(running, 1, RUNTIME_ACTOR).await.unwrap();
        h.runtime
            .tasks()
            .advance(&task, TaskStatus::Running, RUNTIME_ACTOR, None)
            .await
            .unwrap();

        h.runtime.cancel_run(&run.id, "operator", None).await.unwrap();
        assert_eq!(
            h.runtime.tasks().get_task(&task).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancelling_queued_run_leaves_todo_task() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let run = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        h.runtime.cancel_run(&run.id, "operator", None).await.unwrap();
        assert_eq!(
            h.runtime.tasks().get_task(&task).await.unwrap().status,
            TaskStatus::Todo
        );
    }

    #[tokio::test]
    async fn recovery_interrupts_only_runs_from_before_boot() {
        let h = harness(ScriptedProvider::default());
        let task = new_task(&h).await;
        let stale = h.runtime.create_run(&task, None, "k1", None).await.unwrap();

        // Left running by a previous process.
        let mut running = stale.clone();
        running.status = RunStatus::Running;
        running.started_at = Some(h.clock.now() - chrono::Duration::minutes(5));
        h.store.update_run(running, 1, "old-process").await.unwrap();

        let report = h.runtime.recover_after_restart().await.unwrap();
        assert_eq!(report.interrupted, vec![stale.id.clone()]);
        assert!(report.resumed.is_empty());

        let second = h.runtime.recover_after_restart().await.unwrap();
        assert!(second.is_empty());
    }
}
