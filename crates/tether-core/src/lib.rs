//! Shared contracts for the tether worker.
//!
//! This crate defines the cross-crate data model used between the worker and
//! the control plane: task leases, runtime contexts, run events, bundle
//! metadata, test selection, and log redaction.
//!
//! # API notes
//! `tether-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`chrono::DateTime<Utc>`,
//! `serde_json::Value`) as part of the worker contract. Wire DTOs serialize
//! with camelCase keys to match the control-plane JSON contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod bundle;
pub mod event;
pub mod redact;
pub mod selection;

/// Server-granted permission to execute and report on one task attempt.
///
/// The worker must include `lease_token` on every operation that mutates
/// this task. A 401 on such a call means the lease is dead and no further
/// mutation may be attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLease {
    pub task_id: String,
    /// Fresh per attempt.
    pub lease_id: String,
    /// Opaque authorization secret. Never logged.
    pub lease_token: String,
    pub lease_expires_at: DateTime<Utc>,
    /// 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// The payload needed to execute one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    pub task_id: String,
    pub run_id: String,
    pub project_id: String,
    pub bundle: BundleRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<selection::TestSelection>,
    /// Non-secret environment values handed to the runner.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Present only for cloud-managed workers. Self-hosted workers must not
    /// receive secrets on the wire; they load them from a local path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_path: Option<String>,
    pub limits: TaskLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRef {
    pub id: String,
    pub download: BundleDownload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDownload {
    pub url: String,
    /// Lowercase-hex SHA-256 of the archive bytes, when the server knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLimits {
    /// Overall wall-clock budget for the task. 0 means "use the worker
    /// default".
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub requested_concurrency: u32,
    #[serde(default)]
    pub max_concurrency: u32,
}

/// Terminal run status, as reported in a [`RunSummary`].
///
/// `exhausted` is a server-side terminal state (attempt >= maxAttempts); the
/// worker never reports it but may observe it in server responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
    Cancelled,
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Events successfully streamed to the control plane.
    pub events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Terminal report sent with `complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counts: RunCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
}

/// Closed failure taxonomy reported with `fail`. Drives server-side retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Timeout,
    Crash,
    UserError,
    InfraError,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Timeout => "timeout",
            FailureClass::Crash => "crash",
            FailureClass::UserError => "user_error",
            FailureClass::InfraError => "infra_error",
        }
    }
}

/// Opportunistic worker-health snapshot attached to some heartbeats.
///
/// All fields are best-effort; hosts that do not expose a source simply
/// omit the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_available_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_class_wire_names_are_snake_case() {
        let json = serde_json::to_string(&FailureClass::UserError).unwrap();
        assert_eq!(json, "\"user_error\"");
        let back: FailureClass = serde_json::from_str("\"infra_error\"").unwrap();
        assert_eq!(back, FailureClass::InfraError);
    }

    #[test]
    fn task_lease_uses_camel_case_keys() {
        let lease = TaskLease {
            task_id: "t-1".to_string(),
            lease_id: "l-1".to_string(),
            lease_token: "tok".to_string(),
            lease_expires_at: Utc::now(),
            attempt: 1,
            max_attempts: 3,
        };
        let value = serde_json::to_value(&lease).unwrap();
        assert!(value.get("taskId").is_some());
        assert!(value.get("leaseToken").is_some());
        assert!(value.get("maxAttempts").is_some());
    }

    #[test]
    fn runtime_context_tolerates_missing_optionals() {
        let ctx: RuntimeContext = serde_json::from_value(serde_json::json!({
            "taskId": "t-1",
            "runId": "r-1",
            "projectId": "p-1",
            "bundle": {"id": "b-1", "download": {"url": "https://bundles/b-1.tar"}},
            "limits": {"timeoutMs": 300000}
        }))
        .unwrap();
        assert!(ctx.selection.is_none());
        assert!(ctx.secrets.is_none());
        assert!(ctx.vars.is_empty());
        assert_eq!(ctx.limits.timeout_ms, 300_000);
        assert_eq!(ctx.limits.requested_concurrency, 0);
    }

    #[test]
    fn run_summary_omits_empty_artifacts() {
        let now = Utc::now();
        let summary = RunSummary {
            status: RunStatus::Passed,
            started_at: now,
            finished_at: now,
            duration_ms: 12,
            counts: RunCounts::default(),
            artifacts: Vec::new(),
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert!(value.get("artifacts").is_none());
        assert_eq!(value["status"], "passed");
    }
}
