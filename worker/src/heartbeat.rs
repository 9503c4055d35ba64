//! Per-task lease renewal.
//!
//! One heartbeat fiber per active task. Renewal failures are tolerated up
//! to [`MAX_HEARTBEAT_FAILURES`] consecutive misses; lease expiry and a
//! server-initiated cancel abort immediately. The loop exits when the task
//! abort fires or the worker shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::abort::{AbortReason, TaskAbort};
use crate::client::ControlPlane;
use crate::sysinfo;

pub const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Attach a host-health snapshot every N-th beat.
const SYSINFO_EVERY_N: u64 = 6;

pub struct HeartbeatLoop {
    client: Arc<dyn ControlPlane>,
    task_id: String,
    lease_token: String,
    interval: Duration,
    abort: TaskAbort,
}

impl HeartbeatLoop {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        task_id: String,
        lease_token: String,
        interval: Duration,
        abort: TaskAbort,
    ) -> Self {
        Self {
            client,
            task_id,
            lease_token,
            interval,
            abort,
        }
    }

    /// Run until the task aborts, the worker shuts down, or the lease is
    /// lost. Shutdown stops renewals without aborting the task; in-flight
    /// work is drained by the scheduler.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut failures: u32 = 0;
        let mut beats: u64 = 0;
        loop {
            tokio::select! {
                _ = self.abort.cancelled() => return,
                _ = shutdown.cancelled() => {
                    tracing::debug!(
                        event = "tether.heartbeat.stopped",
                        task_id = %self.task_id,
                        "heartbeat stopped by shutdown"
                    );
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            beats += 1;

            let system_info = if beats % SYSINFO_EVERY_N == 0 {
                sysinfo::snapshot()
            } else {
                None
            };

            match self
                .client
                .heartbeat(&self.task_id, &self.lease_token, system_info)
                .await
            {
                Ok(resp) => {
                    failures = 0;
                    if resp.should_cancel {
                        tracing::info!(
                            event = "tether.heartbeat.server_cancel",
                            task_id = %self.task_id,
                            "server requested cancellation"
                        );
                        self.abort.abort(AbortReason::ServerCancelled);
                        return;
                    }
                    tracing::trace!(
                        event = "tether.heartbeat.renewed",
                        task_id = %self.task_id,
                        lease_expires_at = %resp.lease_expires_at,
                        "lease renewed"
                    );
                }
                Err(err) if err.is_lease_expired() => {
                    tracing::warn!(
                        event = "tether.heartbeat.lease_expired",
                        task_id = %self.task_id,
                        "lease expired; aborting task"
                    );
                    self.abort.abort(AbortReason::LeaseExpired);
                    return;
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        event = "tether.heartbeat.failed",
                        task_id = %self.task_id,
                        failures = failures,
                        error = %err,
                        "heartbeat failed"
                    );
                    if failures >= MAX_HEARTBEAT_FAILURES {
                        tracing::error!(
                            event = "tether.heartbeat.exhausted",
                            task_id = %self.task_id,
                            "heartbeat failures exhausted; aborting task"
                        );
                        self.abort.abort(AbortReason::HeartbeatExhausted);
                        return;
                    }
                }
            }
        }
    }
}
