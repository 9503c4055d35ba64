//! Shared test doubles: an in-memory control plane and a scripted executor.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::event::{
    AssertPayload, EventBody, LogPayload, ResultPayload, RunEvent, TestStatus,
};
use tether_core::{
    BundleDownload, BundleRef, FailureClass, RunSummary, RuntimeContext, SystemInfo, TaskLease,
    TaskLimits,
};
use tether_worker::abort::TaskAbort;
use tether_worker::client::{
    ClaimRequest, ControlPlane, ControlPlaneError, ControlPlaneErrorKind, HeartbeatResponse,
};
use tether_worker::executor::{ExecutionOutcome, TaskExecutor, TestCounts};
use tether_worker::pipeline::EventPipeline;

pub fn lease(task_id: &str, attempt: u32) -> TaskLease {
    TaskLease {
        task_id: task_id.to_string(),
        lease_id: format!("{task_id}-lease-{attempt}"),
        lease_token: format!("{task_id}-token"),
        lease_expires_at: Utc::now() + chrono::Duration::seconds(30),
        attempt,
        max_attempts: 3,
    }
}

pub fn context(task_id: &str) -> RuntimeContext {
    RuntimeContext {
        task_id: task_id.to_string(),
        run_id: format!("run-{task_id}"),
        project_id: "p-1".to_string(),
        bundle: BundleRef {
            id: "b-1".to_string(),
            download: BundleDownload {
                url: "https://bundles.example.com/b-1.tar".to_string(),
                checksum: None,
                expires_at: None,
            },
        },
        selection: None,
        vars: BTreeMap::new(),
        secrets: None,
        secrets_path: None,
        limits: TaskLimits {
            timeout_ms: 30_000,
            memory_mb: 0,
            requested_concurrency: 1,
            max_concurrency: 1,
        },
    }
}

#[derive(Default)]
pub struct FakeControlPlane {
    pub leases: Mutex<VecDeque<TaskLease>>,
    pub claim_count: AtomicU64,
    pub heartbeat_count: AtomicU64,
    pub heartbeat_always_fail: AtomicBool,
    pub context_lease_expired: AtomicBool,
    /// Fail the first N submit calls with a network error.
    pub submit_fail_first: AtomicU32,
    /// Artificial latency per submit call.
    pub submit_delay_ms: AtomicU64,
    pub batches: Mutex<Vec<Vec<RunEvent>>>,
    pub completes: Mutex<Vec<(String, RunSummary, String)>>,
    pub fails: Mutex<Vec<(String, FailureClass, Option<String>, String)>>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue_task(&self, task_id: &str, attempt: u32) {
        self.leases.lock().unwrap().push_back(lease(task_id, attempt));
    }

    pub fn streamed_seqs(&self) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|event| event.seq)
            .collect()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn claim(&self, _req: &ClaimRequest) -> Result<Option<TaskLease>, ControlPlaneError> {
        self.claim_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.leases.lock().unwrap().pop_front())
    }

    async fn heartbeat(
        &self,
        _task_id: &str,
        _lease_token: &str,
        _system_info: Option<SystemInfo>,
    ) -> Result<HeartbeatResponse, ControlPlaneError> {
        self.heartbeat_count.fetch_add(1, Ordering::SeqCst);
        if self.heartbeat_always_fail.load(Ordering::SeqCst) {
            return Err(ControlPlaneError {
                kind: ControlPlaneErrorKind::Network("connection refused".to_string()),
                op: "heartbeat",
            });
        }
        Ok(HeartbeatResponse {
            lease_expires_at: Utc::now() + chrono::Duration::seconds(30),
            should_cancel: false,
        })
    }

    async fn get_context(
        &self,
        task_id: &str,
        _lease_token: &str,
    ) -> Result<RuntimeContext, ControlPlaneError> {
        if self.context_lease_expired.load(Ordering::SeqCst) {
            return Err(ControlPlaneError {
                kind: ControlPlaneErrorKind::LeaseExpired,
                op: "get_context",
            });
        }
        Ok(context(task_id))
    }

    async fn submit_events(
        &self,
        _task_id: &str,
        _lease_token: &str,
        events: &[RunEvent],
    ) -> Result<(), ControlPlaneError> {
        let delay = self.submit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self
            .submit_fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ControlPlaneError {
                kind: ControlPlaneErrorKind::Network("connection reset".to_string()),
                op: "submit_events",
            });
        }
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(())
    }

    async fn complete(
        &self,
        task_id: &str,
        _lease_token: &str,
        summary: &RunSummary,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError> {
        self.completes.lock().unwrap().push((
            task_id.to_string(),
            summary.clone(),
            idempotency_key.to_string(),
        ));
        Ok(())
    }

    async fn fail(
        &self,
        task_id: &str,
        _lease_token: &str,
        failure_class: FailureClass,
        message: Option<&str>,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError> {
        self.fails.lock().unwrap().push((
            task_id.to_string(),
            failure_class,
            message.map(str::to_string),
            idempotency_key.to_string(),
        ));
        Ok(())
    }
}

/// Executor double that emits a scripted event stream instead of spawning
/// children.
pub enum StubBehavior {
    /// One test: a log, a passing assert, and a completed result.
    HappyPath,
    /// Block until the task abort fires, then report the aborted run.
    WaitForAbort,
}

pub struct StubExecutor {
    pub behavior: StubBehavior,
}

#[async_trait]
impl TaskExecutor for StubExecutor {
    async fn execute(
        &self,
        _lease: &TaskLease,
        ctx: &RuntimeContext,
        pipeline: Arc<EventPipeline>,
        abort: TaskAbort,
    ) -> ExecutionOutcome {
        match self.behavior {
            StubBehavior::HappyPath => {
                let mk = |seq: u64, body: EventBody| RunEvent {
                    run_id: ctx.run_id.clone(),
                    task_id: ctx.task_id.clone(),
                    seq,
                    ts: Utc::now(),
                    body,
                };
                let events = [
                    mk(
                        1,
                        EventBody::Log(LogPayload {
                            level: Some("info".to_string()),
                            message: "starting".to_string(),
                            test_id: Some("a".to_string()),
                        }),
                    ),
                    mk(
                        2,
                        EventBody::Assert(AssertPayload {
                            test_id: "a".to_string(),
                            name: Some("status".to_string()),
                            passed: true,
                            expected: None,
                            actual: None,
                            message: None,
                        }),
                    ),
                    mk(
                        3,
                        EventBody::Result(ResultPayload {
                            test_id: "a".to_string(),
                            status: TestStatus::Completed,
                            error: None,
                            duration_ms: Some(50),
                        }),
                    ),
                ];
                for event in events {
                    if pipeline.push(event).await.is_err() {
                        break;
                    }
                }
                ExecutionOutcome {
                    success: true,
                    aborted: false,
                    timed_out: false,
                    counts: TestCounts {
                        total: 1,
                        passed: 1,
                        failed: 0,
                        skipped: 0,
                    },
                    error: None,
                }
            }
            StubBehavior::WaitForAbort => {
                tokio::select! {
                    _ = abort.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
                ExecutionOutcome {
                    success: false,
                    aborted: abort.is_aborted(),
                    timed_out: false,
                    counts: TestCounts::default(),
                    error: None,
                }
            }
        }
    }
}
