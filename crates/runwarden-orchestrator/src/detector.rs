//! Stuck-run detector.
//!
//! A periodic sweep over persisted runs that raises operator alerts for idle
//! runs, runs repeating themselves, and tasks failing too often. Every alert
//! is keyed by a source id rebuilt from the condition, so a condition that
//! persists across sweeps keeps a single open alert.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runwarden_core::{
    Alert, AlertId, AlertKind, AlertSourceId, EventRecord, EventType, ProjectId, RunStatus,
    TaskId, TaskRun,
};

use crate::clock::Clock;
use crate::config::{chrono_duration, DetectorConfig};
use crate::error::Result;
use crate::events::EventSink;
use crate::store::{Store, StoreError};

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Idle alerts closed because their run left `running`.
    pub resolved: Vec<AlertId>,
    /// Alerts opened by this sweep.
    pub raised: Vec<Alert>,
}

/// Scans runs and raises alerts.
pub struct StuckRunDetector {
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: DetectorConfig,
}

impl StuckRunDetector {
    /// Create a new StuckRunDetector.
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
        }
    }

    /// Sweep until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval_timer = tokio::time::interval(self.config.interval);
        info!(interval_ms = self.config.interval.as_millis() as u64, "Stuck-run detector started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval_timer.tick() => {}
            }

            match self.sweep().await {
                Ok(report) => {
                    if !report.raised.is_empty() || !report.resolved.is_empty() {
                        info!(
                            raised = report.raised.len(),
                            resolved = report.resolved.len(),
                            "Detector sweep finished"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Detector sweep failed"),
            }
        }

        info!("Stuck-run detector stopped");
    }

    /// Run every check once.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            resolved: self.resolve_stale_idle_alerts().await?,
            ..Default::default()
        };

        let running = self
            .store
            .list_runs_by_status(RunStatus::Running, self.config.scan_limit)
            .await?;
        debug!(running = running.len(), "Detector sweep");

        for run in &running {
            let Some(project_id) = self.project_of(&run.task_id).await? else {
                continue;
            };
            if let Some(alert) = self.check_idle(&project_id, run).await? {
                report.raised.push(alert);
            }
            if let Some(alert) = self.check_repeated(&project_id, run).await? {
                report.raised.push(alert);
            }
        }

        for (task_id, runs) in self
            .store
            .recent_terminal_runs(self.config.error_rate_window)
            .await?
        {
            if let Some(alert) = self.check_error_rate(&task_id, &runs).await? {
                report.raised.push(alert);
            }
        }

        Ok(report)
    }

    /// Close idle alerts whose run is gone or no longer running.
    async fn resolve_stale_idle_alerts(&self) -> Result<Vec<AlertId>> {
        let mut resolved = Vec::new();
        for alert in self.store.list_open_alerts().await? {
            if alert.kind != AlertKind::RunIdleTimeout {
                continue;
            }
            let still_running = match &alert.run_id {
                Some(run_id) => self
                    .store
                    .get_run(run_id)
                    .await?
                    .is_some_and(|r| r.status == RunStatus::Running),
                None => false,
            };
            if still_running {
                continue;
            }

            let now = self.clock.now();
            if let Some(closed) = self.store.resolve_alert(&alert.id, now).await? {
                info!(alert_id = %closed.id, source_id = %closed.source_id, "Idle alert resolved");
                self.events
                    .emit(EventRecord::new(
                        closed.project_id.clone(),
                        EventType::AlertResolved,
                        json!({
                            "alert_id": closed.id,
                            "kind": closed.kind,
                            "source_id": closed.source_id,
                            "run_id": closed.run_id,
                        }),
                        None,
                        now,
                    ))
                    .await;
                resolved.push(closed.id);
            }
        }
        Ok(resolved)
    }

    async fn check_idle(&self, project_id: &ProjectId, run: &TaskRun) -> Result<Option<Alert>> {
        let newest_log = self
            .store
            .recent_run_logs(&run.id, 1)
            .await?
            .into_iter()
            .map(|l| l.created_at)
            .max();
        let last_activity = newest_log.map_or(run.last_activity_at(), |at| {
            at.max(run.last_activity_at())
        });

        let idle_for = self.clock.now() - last_activity;
        if idle_for < chrono_duration(self.config.idle_timeout) {
            return Ok(None);
        }

        let alert = Alert::open(
            project_id.clone(),
            AlertKind::RunIdleTimeout,
            AlertSourceId::idle_timeout(&run.id),
            format!("Run {} is idle", run.id),
            format!(
                "No activity for {}s (threshold {}s), last activity at {}",
                idle_for.num_seconds(),
                self.config.idle_timeout.as_secs(),
                last_activity.to_rfc3339()
            ),
            self.clock.now(),
        )
        .with_run(run.id.clone())
        .with_task(run.task_id.clone());
        self.raise(alert).await
    }

    async fn check_repeated(
        &self,
        project_id: &ProjectId,
        run: &TaskRun,
    ) -> Result<Option<Alert>> {
        let window = self.config.repeat_window;
        let logs = self.store.recent_run_logs(&run.id, window).await?;
        if window == 0 || logs.len() < window {
            return Ok(None);
        }

        let distinct: HashSet<&str> = logs.iter().map(|l| l.content_hash.as_str()).collect();
        let ratio = (logs.len() - distinct.len()) as f64 / logs.len() as f64;
        if ratio < self.config.repeat_threshold {
            return Ok(None);
        }

        let alert = Alert::open(
            project_id.clone(),
            AlertKind::RunRepeatedAction,
            AlertSourceId::repeated_action(&run.id),
            format!("Run {} is repeating itself", run.id),
            format!(
                "{} of the last {} log lines are repeats (ratio {:.2}, threshold {:.2})",
                logs.len() - distinct.len(),
                logs.len(),
                ratio,
                self.config.repeat_threshold
            ),
            self.clock.now(),
        )
        .with_run(run.id.clone())
        .with_task(run.task_id.clone());
        self.raise(alert).await
    }

    async fn check_error_rate(&self, task_id: &TaskId, runs: &[TaskRun]) -> Result<Option<Alert>> {
        if runs.is_empty() || runs.len() < self.config.error_rate_min_samples {
            return Ok(None);
        }
        let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
        let rate = failed as f64 / runs.len() as f64;
        if rate < self.config.error_rate_threshold {
            return Ok(None);
        }

        let Some(project_id) = self.project_of(task_id).await? else {
            return Ok(None);
        };
        let alert = Alert::open(
            project_id,
            AlertKind::TaskHighErrorRate,
            AlertSourceId::high_error_rate(task_id),
            format!("Task {task_id} is failing often"),
            format!(
                "{failed} of the last {} runs failed (rate {:.2}, threshold {:.2})",
                runs.len(),
                rate,
                self.config.error_rate_threshold
            ),
            self.clock.now(),
        )
        .with_task(task_id.clone());
        self.raise(alert).await
    }

    /// Open `alert` unless one with the same source is already open.
    async fn raise(&self, alert: Alert) -> Result<Option<Alert>> {
        if self.store.find_open_alert(&alert.source_id).await?.is_some() {
            return Ok(None);
        }

        let alert = match self.store.insert_alert(alert).await {
            Ok(alert) => alert,
            Err(StoreError::DuplicateAlert(source)) => {
                debug!(source_id = %source, "Alert raised concurrently");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        warn!(
            alert_id = %alert.id,
            kind = %alert.kind.as_str(),
            source_id = %alert.source_id,
            "Alert raised"
        );

        self.events
            .emit(EventRecord::new(
                alert.project_id.clone(),
                EventType::AlertRaised,
                json!({
                    "alert_id": alert.id,
                    "kind": alert.kind,
                    "source_id": alert.source_id,
                    "run_id": alert.run_id,
                    "task_id": alert.task_id,
                    "title": alert.title,
                }),
                None,
                alert.created_at,
            ))
            .await;

        Ok(Some(alert))
    }

    async fn project_of(&self, task_id: &TaskId) -> Result<Option<ProjectId>> {
        let task = self.store.get_task(task_id).await?;
        if task.is_none() {
            warn!(task_id = %task_id, "Run references a missing task");
        }
        Ok(task.map(|t| t.project_id))
    }
}
