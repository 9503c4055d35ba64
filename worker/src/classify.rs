//! Worker error taxonomy and the failure classifier.
//!
//! The classifier is a pure function from a caught [`WorkerError`] to the
//! wire-level [`FailureClass`] that drives server-side retry. Assertion
//! failures never appear here: they are data in the event stream, and the
//! run outcome is derived from them.

use std::fmt;

use tether_core::FailureClass;

use crate::abort::AbortReason;
use crate::client::{ControlPlaneError, ControlPlaneErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleErrorKind {
    Download,
    Checksum,
    Extract,
    Metadata,
}

#[derive(Debug)]
pub struct BundleError {
    pub kind: BundleErrorKind,
    message: String,
}

impl BundleError {
    pub fn download(message: impl Into<String>) -> Self {
        Self {
            kind: BundleErrorKind::Download,
            message: message.into(),
        }
    }

    pub fn checksum(message: impl Into<String>) -> Self {
        Self {
            kind: BundleErrorKind::Checksum,
            message: message.into(),
        }
    }

    pub fn extract(message: impl Into<String>) -> Self {
        Self {
            kind: BundleErrorKind::Extract,
            message: message.into(),
        }
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self {
            kind: BundleErrorKind::Metadata,
            message: message.into(),
        }
    }
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BundleError {}

#[derive(Debug)]
pub enum ExecutorError {
    /// The runner child could not be spawned at all.
    ChildSpawn(String),
    /// The overall task deadline expired.
    OverallTimeout,
    Internal(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::ChildSpawn(message) => write!(f, "failed to spawn runner: {message}"),
            ExecutorError::OverallTimeout => write!(f, "overall task deadline exceeded"),
            ExecutorError::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Everything a task fiber can fail with.
#[derive(Debug)]
pub enum WorkerError {
    ControlPlane(ControlPlaneError),
    EventFlush(String),
    Bundle(BundleError),
    Executor(ExecutorError),
    MemoryLimit { limit_bytes: u64, rss_bytes: u64 },
    NetworkPolicy(String),
    Aborted(AbortReason),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::ControlPlane(err) => write!(f, "{err}"),
            WorkerError::EventFlush(message) => write!(f, "event flush aborted: {message}"),
            WorkerError::Bundle(err) => write!(f, "bundle error: {err}"),
            WorkerError::Executor(err) => write!(f, "{err}"),
            WorkerError::MemoryLimit {
                limit_bytes,
                rss_bytes,
            } => write!(
                f,
                "memory limit exceeded: rss {rss_bytes} > limit {limit_bytes}"
            ),
            WorkerError::NetworkPolicy(message) => {
                write!(f, "network policy violation: {message}")
            }
            WorkerError::Aborted(reason) => write!(f, "task aborted: {reason}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<ControlPlaneError> for WorkerError {
    fn from(err: ControlPlaneError) -> Self {
        WorkerError::ControlPlane(err)
    }
}

impl From<BundleError> for WorkerError {
    fn from(err: BundleError) -> Self {
        WorkerError::Bundle(err)
    }
}

/// Map a worker error to the wire failure class.
pub fn classify(err: &WorkerError) -> FailureClass {
    match err {
        WorkerError::EventFlush(_) => FailureClass::InfraError,
        WorkerError::ControlPlane(err) => match &err.kind {
            ControlPlaneErrorKind::LeaseExpired => FailureClass::InfraError,
            ControlPlaneErrorKind::Timeout | ControlPlaneErrorKind::Network(_) => {
                FailureClass::InfraError
            }
            ControlPlaneErrorKind::Http { status, .. } => {
                if *status >= 500 || *status == 408 || *status == 429 {
                    FailureClass::InfraError
                } else {
                    FailureClass::UserError
                }
            }
        },
        WorkerError::Bundle(_) => FailureClass::InfraError,
        WorkerError::Executor(ExecutorError::OverallTimeout) => FailureClass::Timeout,
        WorkerError::Executor(_) => FailureClass::Crash,
        WorkerError::MemoryLimit { .. } => FailureClass::Crash,
        WorkerError::NetworkPolicy(_) => FailureClass::UserError,
        WorkerError::Aborted(reason) => match reason {
            AbortReason::OverallTimeout => FailureClass::Timeout,
            AbortReason::MemoryExceeded => FailureClass::Crash,
            AbortReason::HeartbeatExhausted
            | AbortReason::LeaseExpired
            | AbortReason::EventFlush(_)
            | AbortReason::ServerCancelled
            | AbortReason::Shutdown => FailureClass::InfraError,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ControlPlaneErrorKind;

    fn cp_error(kind: ControlPlaneErrorKind) -> WorkerError {
        WorkerError::ControlPlane(ControlPlaneError { kind, op: "op" })
    }

    #[test]
    fn event_flush_is_infra() {
        let err = WorkerError::EventFlush("buffer saturated".to_string());
        assert_eq!(classify(&err), FailureClass::InfraError);
    }

    #[test]
    fn lease_expired_and_5xx_are_infra() {
        assert_eq!(
            classify(&cp_error(ControlPlaneErrorKind::LeaseExpired)),
            FailureClass::InfraError
        );
        assert_eq!(
            classify(&cp_error(ControlPlaneErrorKind::Http {
                status: 502,
                body: String::new()
            })),
            FailureClass::InfraError
        );
    }

    #[test]
    fn connection_refused_is_infra() {
        assert_eq!(
            classify(&cp_error(ControlPlaneErrorKind::Network(
                "connection refused".to_string()
            ))),
            FailureClass::InfraError
        );
    }

    #[test]
    fn non_auth_non_throttle_4xx_is_user_error() {
        assert_eq!(
            classify(&cp_error(ControlPlaneErrorKind::Http {
                status: 422,
                body: String::new()
            })),
            FailureClass::UserError
        );
        assert_eq!(
            classify(&cp_error(ControlPlaneErrorKind::Http {
                status: 429,
                body: String::new()
            })),
            FailureClass::InfraError
        );
    }

    #[test]
    fn timeouts_classify_as_timeout() {
        assert_eq!(
            classify(&WorkerError::Executor(ExecutorError::OverallTimeout)),
            FailureClass::Timeout
        );
        assert_eq!(
            classify(&WorkerError::Aborted(AbortReason::OverallTimeout)),
            FailureClass::Timeout
        );
    }

    #[test]
    fn memory_kill_is_crash() {
        let err = WorkerError::MemoryLimit {
            limit_bytes: 1024,
            rss_bytes: 2048,
        };
        assert_eq!(classify(&err), FailureClass::Crash);
        assert_eq!(
            classify(&WorkerError::Aborted(AbortReason::MemoryExceeded)),
            FailureClass::Crash
        );
    }

    #[test]
    fn heartbeat_exhaustion_is_infra() {
        assert_eq!(
            classify(&WorkerError::Aborted(AbortReason::HeartbeatExhausted)),
            FailureClass::InfraError
        );
    }

    #[test]
    fn checksum_mismatch_is_infra_with_expected_message() {
        let err = WorkerError::Bundle(BundleError::checksum(
            "checksum mismatch: expected aa got bb",
        ));
        assert_eq!(classify(&err), FailureClass::InfraError);
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn unknown_executor_errors_are_crash() {
        let err = WorkerError::Executor(ExecutorError::Internal("runner exploded".to_string()));
        assert_eq!(classify(&err), FailureClass::Crash);
    }
}
