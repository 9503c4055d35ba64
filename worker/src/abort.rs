//! Per-task abort signal with a recorded reason.
//!
//! Three sources can end a task early: the heartbeat loop (lease trouble or
//! server-initiated cancel), the event pipeline (flush exhaustion), and the
//! deadline/shutdown path. They all converge on one [`TaskAbort`]; the
//! executor checks the single composed signal at every suspension point and
//! the reporter reads the first recorded reason to pick the terminal call.

use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    HeartbeatExhausted,
    LeaseExpired,
    ServerCancelled,
    EventFlush(String),
    MemoryExceeded,
    OverallTimeout,
    Shutdown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::HeartbeatExhausted => write!(f, "heartbeat_exhausted"),
            AbortReason::LeaseExpired => write!(f, "lease_expired"),
            AbortReason::ServerCancelled => write!(f, "server_cancelled"),
            AbortReason::EventFlush(message) => write!(f, "event_flush: {message}"),
            AbortReason::MemoryExceeded => write!(f, "memory_limit_exceeded"),
            AbortReason::OverallTimeout => write!(f, "overall_timeout"),
            AbortReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Cancellation token plus the first abort reason. Clones share state.
#[derive(Clone)]
pub struct TaskAbort {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl TaskAbort {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Record `reason` (first writer wins) and fire the token.
    pub fn abort(&self, reason: AbortReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded reason; `None` when the task was never aborted or the
    /// token was cancelled externally without a reason.
    pub fn reason(&self) -> Option<AbortReason> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for TaskAbort {
    fn default() -> Self {
        Self::new()
    }
}
