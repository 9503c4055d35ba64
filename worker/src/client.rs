//! Typed HTTP client for the control-plane wire contract.
//!
//! Every request carries `Authorization: Bearer <workerToken>`; per-task
//! operations additionally carry the lease token in `X-Lease-Token`. A 401
//! on a lease-bearing call surfaces as [`ControlPlaneErrorKind::LeaseExpired`],
//! never as a generic HTTP error: it means the lease is dead and no further
//! mutation may be attempted for that task.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use tether_core::{
    event::RunEvent, FailureClass, RunSummary, RuntimeContext, SystemInfo, TaskLease,
};

pub const LEASE_TOKEN_HEADER: &str = "X-Lease-Token";

/// Extra slack on top of the server-side long poll before the claim call
/// itself times out.
const CLAIM_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

const MAX_ERROR_BODY_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub worker_token: String,
    pub request_timeout: Duration,
    pub max_retry_attempts: u32,
}

#[derive(Debug)]
pub struct ControlPlaneError {
    pub kind: ControlPlaneErrorKind,
    pub op: &'static str,
}

#[derive(Debug)]
pub enum ControlPlaneErrorKind {
    Timeout,
    LeaseExpired,
    Http { status: u16, body: String },
    Network(String),
}

impl ControlPlaneError {
    fn new(op: &'static str, kind: ControlPlaneErrorKind) -> Self {
        Self { kind, op }
    }

    pub fn is_lease_expired(&self) -> bool {
        matches!(self.kind, ControlPlaneErrorKind::LeaseExpired)
    }

    /// Retryable per the endpoint policy: timeouts, network failures, and
    /// HTTP 5xx/408/429. Other 4xx and lease expiry are terminal.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ControlPlaneErrorKind::Timeout | ControlPlaneErrorKind::Network(_) => true,
            ControlPlaneErrorKind::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ControlPlaneErrorKind::LeaseExpired => false,
        }
    }
}

impl fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ControlPlaneErrorKind::Timeout => write!(f, "{} timed out", self.op),
            ControlPlaneErrorKind::LeaseExpired => write!(f, "{}: lease expired", self.op),
            ControlPlaneErrorKind::Http { status, body } => {
                write!(f, "{} failed with status {status}: {body}", self.op)
            }
            ControlPlaneErrorKind::Network(message) => {
                write!(f, "{} network error: {message}", self.op)
            }
        }
    }
}

impl std::error::Error for ControlPlaneError {}

/// Backoff base for attempt `n` (1-based): `min(2^(n-1) * 1000ms, 10s)`.
pub fn retry_backoff_base(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis(((1u64 << exp) * 1000).min(10_000))
}

/// Full-jitter delay: base plus a uniform draw from `[0, base/2]`.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = retry_backoff_base(attempt);
    let half = base.as_millis() as u64 / 2;
    let jitter = rand::rng().random_range(0..=half);
    base + Duration::from_millis(jitter)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub long_poll_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    task: Option<TaskLease>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_info: Option<SystemInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub lease_expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub should_cancel: bool,
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    context: RuntimeContext,
}

#[derive(Debug, Serialize)]
struct SubmitEventsRequest<'a> {
    events: &'a [RunEvent],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest<'a> {
    summary: &'a RunSummary,
    idempotency_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailRequest<'a> {
    failure_class: FailureClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    idempotency_key: &'a str,
}

/// The five wire operations, as a seam so the scheduler, pipeline, and
/// heartbeat loop can be exercised against an in-memory fake.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn claim(&self, req: &ClaimRequest) -> Result<Option<TaskLease>, ControlPlaneError>;

    async fn heartbeat(
        &self,
        task_id: &str,
        lease_token: &str,
        system_info: Option<SystemInfo>,
    ) -> Result<HeartbeatResponse, ControlPlaneError>;

    async fn get_context(
        &self,
        task_id: &str,
        lease_token: &str,
    ) -> Result<RuntimeContext, ControlPlaneError>;

    async fn submit_events(
        &self,
        task_id: &str,
        lease_token: &str,
        events: &[RunEvent],
    ) -> Result<(), ControlPlaneError>;

    async fn complete(
        &self,
        task_id: &str,
        lease_token: &str,
        summary: &RunSummary,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError>;

    async fn fail(
        &self,
        task_id: &str,
        lease_token: &str,
        failure_class: FailureClass,
        message: Option<&str>,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError>;
}

#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    cfg: ClientConfig,
}

impl ControlPlaneClient {
    pub fn new(mut cfg: ClientConfig) -> anyhow::Result<Self> {
        while cfg.base_url.ends_with('/') {
            cfg.base_url.pop();
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, cfg })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url)
    }

    fn request_error(op: &'static str, err: reqwest::Error) -> ControlPlaneError {
        let kind = if err.is_timeout() {
            ControlPlaneErrorKind::Timeout
        } else {
            ControlPlaneErrorKind::Network(err.to_string())
        };
        ControlPlaneError::new(op, kind)
    }

    /// Map a non-success status, honoring the lease-expiry contract for
    /// lease-bearing operations.
    async fn check_status(
        op: &'static str,
        lease_scoped: bool,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ControlPlaneError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if lease_scoped && status.as_u16() == 401 {
            return Err(ControlPlaneError::new(op, ControlPlaneErrorKind::LeaseExpired));
        }
        let mut body = resp.text().await.unwrap_or_default();
        body.truncate(MAX_ERROR_BODY_BYTES);
        Err(ControlPlaneError::new(
            op,
            ControlPlaneErrorKind::Http {
                status: status.as_u16(),
                body,
            },
        ))
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        mut call: F,
    ) -> Result<T, ControlPlaneError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ControlPlaneError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.cfg.max_retry_attempts => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        event = "tether.client.retry",
                        op = op,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "control plane call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn heartbeat_once(
        &self,
        task_id: &str,
        lease_token: &str,
        system_info: Option<SystemInfo>,
    ) -> Result<HeartbeatResponse, ControlPlaneError> {
        const OP: &str = "heartbeat";
        let resp = self
            .http
            .post(self.url(&format!("/tasks/{task_id}/heartbeat")))
            .bearer_auth(&self.cfg.worker_token)
            .header(LEASE_TOKEN_HEADER, lease_token)
            .timeout(self.cfg.request_timeout)
            .json(&HeartbeatRequest { system_info })
            .send()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        let resp = Self::check_status(OP, true, resp).await?;
        resp.json::<HeartbeatResponse>()
            .await
            .map_err(|e| Self::request_error(OP, e))
    }

    async fn get_context_once(
        &self,
        task_id: &str,
        lease_token: &str,
    ) -> Result<RuntimeContext, ControlPlaneError> {
        const OP: &str = "get_context";
        let resp = self
            .http
            .get(self.url(&format!("/tasks/{task_id}/context")))
            .bearer_auth(&self.cfg.worker_token)
            .header(LEASE_TOKEN_HEADER, lease_token)
            .timeout(self.cfg.request_timeout)
            .send()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        let resp = Self::check_status(OP, true, resp).await?;
        let body = resp
            .json::<ContextResponse>()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        Ok(body.context)
    }

    async fn submit_events_once(
        &self,
        task_id: &str,
        lease_token: &str,
        events: &[RunEvent],
    ) -> Result<(), ControlPlaneError> {
        const OP: &str = "submit_events";
        let resp = self
            .http
            .post(self.url(&format!("/tasks/{task_id}/events")))
            .bearer_auth(&self.cfg.worker_token)
            .header(LEASE_TOKEN_HEADER, lease_token)
            .timeout(self.cfg.request_timeout)
            .json(&SubmitEventsRequest { events })
            .send()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        Self::check_status(OP, true, resp).await.map(|_| ())
    }

    async fn complete_once(
        &self,
        task_id: &str,
        lease_token: &str,
        summary: &RunSummary,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError> {
        const OP: &str = "complete";
        let resp = self
            .http
            .post(self.url(&format!("/tasks/{task_id}/complete")))
            .bearer_auth(&self.cfg.worker_token)
            .header(LEASE_TOKEN_HEADER, lease_token)
            .timeout(self.cfg.request_timeout)
            .json(&CompleteRequest {
                summary,
                idempotency_key,
            })
            .send()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        Self::check_status(OP, true, resp).await.map(|_| ())
    }

    async fn fail_once(
        &self,
        task_id: &str,
        lease_token: &str,
        failure_class: FailureClass,
        message: Option<&str>,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError> {
        const OP: &str = "fail";
        let resp = self
            .http
            .post(self.url(&format!("/tasks/{task_id}/fail")))
            .bearer_auth(&self.cfg.worker_token)
            .header(LEASE_TOKEN_HEADER, lease_token)
            .timeout(self.cfg.request_timeout)
            .json(&FailRequest {
                failure_class,
                message,
                idempotency_key,
            })
            .send()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        Self::check_status(OP, true, resp).await.map(|_| ())
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    /// Claim never retries: the scheduler loop is itself the retry.
    async fn claim(&self, req: &ClaimRequest) -> Result<Option<TaskLease>, ControlPlaneError> {
        const OP: &str = "claim";
        let timeout = Duration::from_millis(req.long_poll_ms) + CLAIM_TIMEOUT_SLACK;
        let resp = self
            .http
            .post(self.url("/tasks/claim"))
            .bearer_auth(&self.cfg.worker_token)
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        let resp = Self::check_status(OP, false, resp).await?;
        let body = resp
            .json::<ClaimResponse>()
            .await
            .map_err(|e| Self::request_error(OP, e))?;
        Ok(body.task)
    }

    async fn heartbeat(
        &self,
        task_id: &str,
        lease_token: &str,
        system_info: Option<SystemInfo>,
    ) -> Result<HeartbeatResponse, ControlPlaneError> {
        self.with_retry("heartbeat", || {
            self.heartbeat_once(task_id, lease_token, system_info.clone())
        })
        .await
    }

    async fn get_context(
        &self,
        task_id: &str,
        lease_token: &str,
    ) -> Result<RuntimeContext, ControlPlaneError> {
        self.with_retry("get_context", || self.get_context_once(task_id, lease_token))
            .await
    }

    async fn submit_events(
        &self,
        task_id: &str,
        lease_token: &str,
        events: &[RunEvent],
    ) -> Result<(), ControlPlaneError> {
        self.with_retry("submit_events", || {
            self.submit_events_once(task_id, lease_token, events)
        })
        .await
    }

    async fn complete(
        &self,
        task_id: &str,
        lease_token: &str,
        summary: &RunSummary,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError> {
        self.with_retry("complete", || {
            self.complete_once(task_id, lease_token, summary, idempotency_key)
        })
        .await
    }

    async fn fail(
        &self,
        task_id: &str,
        lease_token: &str,
        failure_class: FailureClass,
        message: Option<&str>,
        idempotency_key: &str,
    ) -> Result<(), ControlPlaneError> {
        self.with_retry("fail", || {
            self.fail_once(task_id, lease_token, failure_class, message, idempotency_key)
        })
        .await
    }
}
