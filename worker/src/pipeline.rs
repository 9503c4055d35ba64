//! Ordered, bounded event buffer with backpressure.
//!
//! Producers push [`RunEvent`]s; a single-flight flush submits the buffered
//! prefix to the control plane in order. The buffer never exceeds
//! `max_buffer` at the moment a push is admitted: at capacity the producer
//! either waits out an in-flight flush in `backpressure_wait` slices or
//! drives a flush inline. After `max_consecutive_failures` failed submits
//! the pipeline aborts the task; the unsent batch is returned to the front
//! of the buffer so the events it owned are never reordered or duplicated
//! from the worker side.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use tether_core::event::RunEvent;

use crate::abort::{AbortReason, TaskAbort};
use crate::client::{retry_delay, ControlPlane};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Periodic flush tick.
    pub flush_every: Duration,
    /// Buffer length that triggers an opportunistic non-blocking flush.
    pub flush_max_buffer: usize,
    /// Hard ceiling; backpressure activates here.
    pub max_buffer: usize,
    /// Consecutive failed submits before the task is aborted.
    pub max_consecutive_failures: u32,
    /// Pause between backpressure re-checks.
    pub backpressure_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_every: Duration::from_millis(1000),
            flush_max_buffer: 50,
            max_buffer: 10_000,
            max_consecutive_failures: 5,
            backpressure_wait: Duration::from_millis(100),
        }
    }
}

impl PipelineConfig {
    fn high_water(&self) -> usize {
        self.max_buffer * 9 / 10
    }
}

#[derive(Debug)]
pub struct EventFlushError {
    pub message: String,
}

impl fmt::Display for EventFlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EventFlushError {}

struct PipelineState {
    buffer: VecDeque<RunEvent>,
    streamed_count: u64,
    consecutive_failures: u32,
    flushing: bool,
    aborted: Option<String>,
}

pub struct EventPipeline {
    client: Arc<dyn ControlPlane>,
    cfg: PipelineConfig,
    task_id: String,
    lease_token: String,
    abort: TaskAbort,
    state: Mutex<PipelineState>,
}

impl EventPipeline {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        cfg: PipelineConfig,
        task_id: String,
        lease_token: String,
        abort: TaskAbort,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            cfg,
            task_id,
            lease_token,
            abort,
            state: Mutex::new(PipelineState {
                buffer: VecDeque::new(),
                streamed_count: 0,
                consecutive_failures: 0,
                flushing: false,
                aborted: None,
            }),
        })
    }

    /// Append an event, applying backpressure at the buffer ceiling.
    pub async fn push(self: &Arc<Self>, event: RunEvent) -> Result<(), EventFlushError> {
        loop {
            let flush_in_flight = {
                let mut st = self.state.lock().await;
                if let Some(message) = &st.aborted {
                    return Err(EventFlushError {
                        message: message.clone(),
                    });
                }
                if st.buffer.len() < self.cfg.max_buffer {
                    st.buffer.push_back(event);
                    let trigger = st.buffer.len() >= self.cfg.flush_max_buffer && !st.flushing;
                    drop(st);
                    if trigger {
                        self.spawn_flush();
                    }
                    return Ok(());
                }
                st.flushing
            };

            if flush_in_flight {
                // A submission is already draining the buffer; yield briefly
                // and re-check.
                tokio::time::sleep(self.cfg.backpressure_wait).await;
                continue;
            }

            // No flush in flight at capacity: drive one inline.
            self.flush().await?;

            let len = self.state.lock().await.buffer.len();
            if len >= self.cfg.max_buffer {
                let message = format!(
                    "event buffer saturated at {} events after flush attempt",
                    len
                );
                {
                    let mut st = self.state.lock().await;
                    st.aborted = Some(message.clone());
                }
                self.abort.abort(AbortReason::EventFlush(message.clone()));
                return Err(EventFlushError { message });
            }
            if len >= self.cfg.high_water() {
                tokio::time::sleep(self.cfg.backpressure_wait).await;
            }
        }
    }

    fn spawn_flush(self: &Arc<Self>) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            // Errors are recorded in state and on the task abort.
            let _ = pipeline.flush().await;
        });
    }

    /// Submit the buffered prefix. Single-flight: a concurrent call returns
    /// immediately. Retries the same batch with exponential backoff; after
    /// `max_consecutive_failures` the batch is restored to the front of the
    /// buffer and the task is aborted.
    pub async fn flush(&self) -> Result<(), EventFlushError> {
        let batch: Vec<RunEvent> = {
            let mut st = self.state.lock().await;
            if let Some(message) = &st.aborted {
                return Err(EventFlushError {
                    message: message.clone(),
                });
            }
            if st.flushing || st.buffer.is_empty() {
                return Ok(());
            }
            st.flushing = true;
            st.buffer.drain(..).collect()
        };

        loop {
            match self
                .client
                .submit_events(&self.task_id, &self.lease_token, &batch)
                .await
            {
                Ok(()) => {
                    let mut st = self.state.lock().await;
                    st.streamed_count += batch.len() as u64;
                    st.consecutive_failures = 0;
                    st.flushing = false;
                    return Ok(());
                }
                Err(err) if err.is_lease_expired() => {
                    let message = "lease expired while submitting events".to_string();
                    tracing::warn!(
                        event = "tether.pipeline.lease_expired",
                        task_id = %self.task_id,
                        "lease expired during event submit; aborting task"
                    );
                    {
                        let mut st = self.state.lock().await;
                        for ev in batch.into_iter().rev() {
                            st.buffer.push_front(ev);
                        }
                        st.flushing = false;
                        st.aborted = Some(message.clone());
                    }
                    self.abort.abort(AbortReason::LeaseExpired);
                    return Err(EventFlushError { message });
                }
                Err(err) => {
                    let failures = {
                        let mut st = self.state.lock().await;
                        st.consecutive_failures += 1;
                        st.consecutive_failures
                    };
                    if failures >= self.cfg.max_consecutive_failures {
                        let message = format!(
                            "event submit failed {failures} consecutive times: {err}"
                        );
                        tracing::error!(
                            event = "tether.pipeline.exhausted",
                            task_id = %self.task_id,
                            failures = failures,
                            error = %err,
                            "event submission exhausted; aborting task"
                        );
                        {
                            let mut st = self.state.lock().await;
                            for ev in batch.into_iter().rev() {
                                st.buffer.push_front(ev);
                            }
                            st.flushing = false;
                            st.aborted = Some(message.clone());
                        }
                        self.abort.abort(AbortReason::EventFlush(message.clone()));
                        return Err(EventFlushError { message });
                    }
                    let delay = retry_delay(failures);
                    tracing::warn!(
                        event = "tether.pipeline.submit_failed",
                        task_id = %self.task_id,
                        failures = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "event submit failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Flush until the buffer is empty and no submission is in flight.
    /// Called once before `complete`.
    pub async fn drain(&self) -> Result<(), EventFlushError> {
        loop {
            let in_flight = {
                let st = self.state.lock().await;
                if let Some(message) = &st.aborted {
                    return Err(EventFlushError {
                        message: message.clone(),
                    });
                }
                if st.buffer.is_empty() && !st.flushing {
                    return Ok(());
                }
                st.flushing
            };
            if in_flight {
                tokio::time::sleep(Duration::from_millis(10)).await;
            } else {
                self.flush().await?;
            }
        }
    }

    /// Periodic flusher fiber; exits on task abort or flush exhaustion.
    pub async fn run_flusher(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.abort.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.flush_every) => {
                    if self.flush().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub async fn streamed_count(&self) -> u64 {
        self.state.lock().await.streamed_count
    }

    pub async fn buffered_len(&self) -> usize {
        self.state.lock().await.buffer.len()
    }
}
