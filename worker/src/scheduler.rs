//! Bounded-concurrency claim loop and per-task fibers.
//!
//! The scheduler owns the worker's main loop: acquire a permit, long-poll
//! the control plane for a lease, and launch a task fiber with its own
//! heartbeat loop, event pipeline, and executor. Permits guarantee the
//! scheduler never issues two overlapping claim calls for one slot and
//! bound the number of concurrent tasks. `job` mode stops claiming when an
//! exit trigger fires but still drains in-flight work; shutdown cancels
//! claiming immediately, stops heartbeats, and awaits fibers up to a drain
//! grace.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::{RunCounts, RunStatus, RunSummary, TaskLease};

use crate::abort::{AbortReason, TaskAbort};
use crate::classify::{classify, ExecutorError, WorkerError};
use crate::client::{ClaimRequest, ControlPlane};
use crate::executor::{ExecutionOutcome, TaskExecutor};
use crate::heartbeat::HeartbeatLoop;
use crate::pipeline::{EventPipeline, PipelineConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMode {
    /// Run until externally cancelled.
    #[default]
    Daemon,
    /// Exit on idle grace, lifetime, or task-count triggers.
    Job,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    pub tags: Vec<String>,
    pub max_concurrent_tasks: usize,
    /// 0 disables server-side long polling; the loop then sleeps
    /// `claim_interval` between idle claims.
    pub long_poll_ms: u64,
    pub claim_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lifecycle: LifecycleMode,
    /// Job mode: exit after this much idle time with no active tasks.
    /// Zero disables the trigger.
    pub idle_grace: Duration,
    /// Job mode: exit once the worker has been up this long. Zero disables.
    pub max_lifetime: Duration,
    /// Job mode: exit after this many finished tasks. Zero disables.
    pub max_tasks: u64,
    pub drain_grace: Duration,
    pub pipeline: PipelineConfig,
}

pub struct TaskScheduler {
    client: Arc<dyn ControlPlane>,
    executor: Arc<dyn TaskExecutor>,
    cfg: SchedulerConfig,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        executor: Arc<dyn TaskExecutor>,
        cfg: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            executor,
            cfg,
            shutdown,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrent_tasks));
        let mut fibers: JoinSet<()> = JoinSet::new();
        let started = Instant::now();
        let mut finished: u64 = 0;
        let mut last_activity = Instant::now();

        tracing::info!(
            event = "tether.scheduler.started",
            worker_id = %self.cfg.worker_id,
            max_concurrent_tasks = self.cfg.max_concurrent_tasks,
            lifecycle = ?self.cfg.lifecycle,
            "scheduler started"
        );

        loop {
            while fibers.try_join_next().is_some() {
                finished += 1;
                last_activity = Instant::now();
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            if self.cfg.lifecycle == LifecycleMode::Job {
                if self.cfg.max_tasks > 0 && finished >= self.cfg.max_tasks {
                    tracing::info!(
                        event = "tether.scheduler.job_exit",
                        finished = finished,
                        "task budget reached, exiting"
                    );
                    break;
                }
                if !self.cfg.max_lifetime.is_zero() && started.elapsed() >= self.cfg.max_lifetime {
                    tracing::info!(
                        event = "tether.scheduler.job_exit",
                        uptime_secs = started.elapsed().as_secs(),
                        "lifetime reached, exiting"
                    );
                    break;
                }
                if !self.cfg.idle_grace.is_zero()
                    && fibers.is_empty()
                    && last_activity.elapsed() >= self.cfg.idle_grace
                {
                    tracing::info!(
                        event = "tether.scheduler.job_exit",
                        idle_secs = last_activity.elapsed().as_secs(),
                        "idle grace expired, exiting"
                    );
                    break;
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            let claim_req = ClaimRequest {
                worker_id: self.cfg.worker_id.clone(),
                tags: self.cfg.tags.clone(),
                long_poll_ms: self.cfg.long_poll_ms,
            };
            let claimed = tokio::select! {
                res = self.client.claim(&claim_req) => res,
                _ = self.shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
            };

            match claimed {
                Ok(Some(lease)) => {
                    last_activity = Instant::now();
                    let client = Arc::clone(&self.client);
                    let executor = Arc::clone(&self.executor);
                    let heartbeat_interval = self.cfg.heartbeat_interval;
                    let pipeline_cfg = self.cfg.pipeline.clone();
                    let shutdown = self.shutdown.clone();
                    fibers.spawn(async move {
                        run_task_fiber(
                            client,
                            executor,
                            lease,
                            heartbeat_interval,
                            pipeline_cfg,
                            shutdown,
                        )
                        .await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.cfg.long_poll_ms == 0 {
                        self.idle_sleep().await;
                    }
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(
                        event = "tether.scheduler.claim_failed",
                        error = %err,
                        "claim failed, backing off"
                    );
                    self.idle_sleep().await;
                }
            }
        }

        self.drain(fibers).await;
        tracing::info!(
            event = "tether.scheduler.stopped",
            finished = finished,
            "scheduler stopped"
        );
        Ok(())
    }

    async fn idle_sleep(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.cfg.claim_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Await in-flight fibers up to the drain grace. After the grace a
    /// forced exit is acceptable; runner children die with the process.
    async fn drain(&self, mut fibers: JoinSet<()>) {
        if fibers.is_empty() {
            return;
        }
        tracing::info!(
            event = "tether.scheduler.draining",
            in_flight = fibers.len(),
            "draining in-flight tasks"
        );
        let deadline = Instant::now() + self.cfg.drain_grace;
        loop {
            match tokio::time::timeout_at(deadline, fibers.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        event = "tether.scheduler.drain_timeout",
                        remaining = fibers.len(),
                        "drain grace expired with tasks still in flight"
                    );
                    fibers.abort_all();
                    break;
                }
            }
        }
    }
}

fn complete_idempotency_key(lease: &TaskLease) -> String {
    format!("{}-{}", lease.task_id, lease.attempt)
}

fn fail_idempotency_key(lease: &TaskLease) -> String {
    format!("{}-{}-fail", lease.task_id, lease.attempt)
}

async fn run_task_fiber(
    client: Arc<dyn ControlPlane>,
    executor: Arc<dyn TaskExecutor>,
    lease: TaskLease,
    heartbeat_interval: Duration,
    pipeline_cfg: PipelineConfig,
    shutdown: CancellationToken,
) {
    let task_id = lease.task_id.clone();
    tracing::info!(
        event = "tether.task.claimed",
        task_id = %task_id,
        lease_id = %lease.lease_id,
        attempt = lease.attempt,
        max_attempts = lease.max_attempts,
        "task claimed"
    );

    let abort = TaskAbort::new();
    let started_at = Utc::now();

    let ctx = match client.get_context(&task_id, &lease.lease_token).await {
        Ok(ctx) => ctx,
        Err(err) if err.is_lease_expired() => {
            tracing::warn!(
                event = "tether.task.lease_expired",
                task_id = %task_id,
                "lease expired fetching context; abandoning task"
            );
            return;
        }
        Err(err) => {
            let err = WorkerError::ControlPlane(err);
            send_fail(client.as_ref(), &lease, &err).await;
            return;
        }
    };

    let pipeline = EventPipeline::new(
        Arc::clone(&client),
        pipeline_cfg,
        task_id.clone(),
        lease.lease_token.clone(),
        abort.clone(),
    );
    let flusher = tokio::spawn(Arc::clone(&pipeline).run_flusher());
    let heartbeat = HeartbeatLoop::new(
        Arc::clone(&client),
        task_id.clone(),
        lease.lease_token.clone(),
        heartbeat_interval,
        abort.clone(),
    );
    let heartbeat_handle = tokio::spawn(heartbeat.run(shutdown));

    let outcome = executor
        .execute(&lease, &ctx, Arc::clone(&pipeline), abort.clone())
        .await;
    let finished_at = Utc::now();

    report_terminal(
        client.as_ref(),
        &lease,
        &outcome,
        &pipeline,
        &abort,
        started_at,
        finished_at,
    )
    .await;

    // Stop the helper fibers; the reason is irrelevant past this point.
    abort.abort(AbortReason::Shutdown);
    let _ = heartbeat_handle.await;
    let _ = flusher.await;

    tracing::info!(
        event = "tether.task.finished",
        task_id = %task_id,
        attempt = lease.attempt,
        success = outcome.success,
        aborted = outcome.aborted,
        timed_out = outcome.timed_out,
        "task fiber finished"
    );
}

async fn report_terminal(
    client: &dyn ControlPlane,
    lease: &TaskLease,
    outcome: &ExecutionOutcome,
    pipeline: &EventPipeline,
    abort: &TaskAbort,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) {
    let task_id = &lease.task_id;
    if matches!(abort.reason(), Some(AbortReason::LeaseExpired)) {
        tracing::warn!(
            event = "tether.task.lease_expired",
            task_id = %task_id,
            "lease expired; skipping terminal report"
        );
        return;
    }

    if let Some(err) = &outcome.error {
        send_fail(client, lease, err).await;
        return;
    }
    if outcome.timed_out {
        let err = WorkerError::Executor(ExecutorError::OverallTimeout);
        send_fail(client, lease, &err).await;
        return;
    }
    if outcome.aborted {
        let reason = abort.reason().unwrap_or(AbortReason::Shutdown);
        match reason {
            AbortReason::ServerCancelled | AbortReason::Shutdown => {
                // The run was cancelled, not broken: drain what we can and
                // report a cancelled summary.
                let _ = pipeline.drain().await;
                let summary = build_summary(
                    RunStatus::Cancelled,
                    outcome,
                    pipeline.streamed_count().await,
                    started_at,
                    finished_at,
                );
                send_complete(client, lease, &summary).await;
            }
            reason => {
                let err = WorkerError::Aborted(reason);
                send_fail(client, lease, &err).await;
            }
        }
        return;
    }

    match pipeline.drain().await {
        Ok(()) => {
            let status = if outcome.success {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            };
            let summary = build_summary(
                status,
                outcome,
                pipeline.streamed_count().await,
                started_at,
                finished_at,
            );
            send_complete(client, lease, &summary).await;
        }
        Err(err) => {
            if matches!(abort.reason(), Some(AbortReason::LeaseExpired)) {
                return;
            }
            let err = WorkerError::EventFlush(err.message);
            send_fail(client, lease, &err).await;
        }
    }
}

fn build_summary(
    status: RunStatus,
    outcome: &ExecutionOutcome,
    streamed_events: u64,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> RunSummary {
    RunSummary {
        status,
        started_at,
        finished_at,
        duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        counts: RunCounts {
            total: outcome.counts.total,
            passed: outcome.counts.passed,
            failed: outcome.counts.failed,
            skipped: outcome.counts.skipped,
            events: streamed_events,
        },
        artifacts: Vec::new(),
    }
}

async fn send_complete(client: &dyn ControlPlane, lease: &TaskLease, summary: &RunSummary) {
    let key = complete_idempotency_key(lease);
    if let Err(err) = client
        .complete(&lease.task_id, &lease.lease_token, summary, &key)
        .await
    {
        tracing::error!(
            event = "tether.task.complete_failed",
            task_id = %lease.task_id,
            error = %err,
            "failed to report completion; server will expire the lease"
        );
    }
}

async fn send_fail(client: &dyn ControlPlane, lease: &TaskLease, err: &WorkerError) {
    let class = classify(err);
    let message = err.to_string();
    let key = fail_idempotency_key(lease);
    tracing::warn!(
        event = "tether.task.failed",
        task_id = %lease.task_id,
        attempt = lease.attempt,
        failure_class = class.as_str(),
        error = %message,
        "reporting task failure"
    );
    if let Err(fail_err) = client
        .fail(
            &lease.task_id,
            &lease.lease_token,
            class,
            Some(&message),
            &key,
        )
        .await
    {
        tracing::error!(
            event = "tether.task.fail_failed",
            task_id = %lease.task_id,
            error = %fail_err,
            "failed to report failure; server will expire the lease"
        );
    }
}
