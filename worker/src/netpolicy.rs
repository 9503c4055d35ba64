//! Egress policy for sandboxed test runs.
//!
//! The policy itself travels to the runner child inside the invocation
//! payload; the [`EgressGate`] implements the checks the worker side can
//! enforce: destination allow-listing, sensitive-hostname rejection, a DNS
//! rebinding defense (resolve and reject loopback targets, fail closed on
//! resolver errors), port allow-listing, and per-test request budgets.
//!
//! `trusted` mode skips the budget and DNS rules; `shared_serverless`
//! enforces everything.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicyMode {
    #[default]
    Trusted,
    SharedServerless,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    pub mode: NetworkPolicyMode,
    /// Total outbound requests per test; 0 disables the cap.
    pub max_requests: u32,
    /// Concurrent outbound requests per test; 0 disables the cap.
    pub max_concurrent_requests: u32,
    pub request_timeout_ms: u64,
    pub max_response_bytes: u64,
    /// Destination ports; empty means {80, 443}.
    pub allowed_ports: Vec<u16>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            mode: NetworkPolicyMode::Trusted,
            max_requests: 0,
            max_concurrent_requests: 0,
            request_timeout_ms: 30_000,
            max_response_bytes: 10 * 1024 * 1024,
            allowed_ports: Vec::new(),
        }
    }
}

const DEFAULT_ALLOWED_PORTS: &[u16] = &[80, 443];

#[derive(Debug)]
pub struct NetworkPolicyViolation {
    pub message: String,
}

impl NetworkPolicyViolation {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for NetworkPolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NetworkPolicyViolation {}

/// Per-test egress gate. One instance per test execution; counters reset
/// with the gate.
#[derive(Debug)]
pub struct EgressGate {
    policy: NetworkPolicy,
    /// Allowed destination hostnames; empty means any non-sensitive host.
    allow_net: Vec<String>,
    requests_started: AtomicU32,
    in_flight: AtomicU32,
}

impl EgressGate {
    pub fn new(policy: NetworkPolicy, allow_net: Vec<String>) -> Self {
        Self {
            policy,
            allow_net,
            requests_started: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
        }
    }

    fn enforce_budgets(&self) -> bool {
        self.policy.mode == NetworkPolicyMode::SharedServerless
    }

    /// Admit one outbound request against the budgets. The returned permit
    /// releases the concurrency slot on drop.
    pub fn begin_request(&self) -> Result<RequestPermit<'_>, NetworkPolicyViolation> {
        if self.enforce_budgets() {
            if self.policy.max_requests > 0 {
                let started = self.requests_started.fetch_add(1, Ordering::SeqCst);
                if started >= self.policy.max_requests {
                    return Err(NetworkPolicyViolation::new(format!(
                        "request budget exhausted ({} max)",
                        self.policy.max_requests
                    )));
                }
            }
            if self.policy.max_concurrent_requests > 0 {
                let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst);
                if in_flight >= self.policy.max_concurrent_requests {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Err(NetworkPolicyViolation::new(format!(
                        "too many concurrent requests ({} max)",
                        self.policy.max_concurrent_requests
                    )));
                }
                return Ok(RequestPermit {
                    gate: Some(self),
                });
            }
        }
        Ok(RequestPermit { gate: None })
    }

    /// Static checks: allow-list, sensitive hostnames, literal loopback
    /// addresses, and the port allow-list.
    pub fn check_host_port(&self, host: &str, port: u16) -> Result<(), NetworkPolicyViolation> {
        if !self.allow_net.is_empty()
            && !self
                .allow_net
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(host))
        {
            return Err(NetworkPolicyViolation::new(format!(
                "destination '{host}' is not in the allow list"
            )));
        }

        if self.enforce_budgets() {
            if is_sensitive_hostname(host) {
                return Err(NetworkPolicyViolation::new(format!(
                    "destination '{host}' is a sensitive hostname"
                )));
            }
            if let Ok(ip) = host.parse::<IpAddr>() {
                if is_blocked_addr(ip) {
                    return Err(NetworkPolicyViolation::new(format!(
                        "destination address '{ip}' is blocked"
                    )));
                }
            }
            let allowed_ports = if self.policy.allowed_ports.is_empty() {
                DEFAULT_ALLOWED_PORTS
            } else {
                self.policy.allowed_ports.as_slice()
            };
            if !allowed_ports.contains(&port) {
                return Err(NetworkPolicyViolation::new(format!(
                    "destination port {port} is not allowed"
                )));
            }
        }
        Ok(())
    }

    /// Full destination check including DNS resolution. Hostnames resolving
    /// to a loopback or otherwise blocked address are rejected (DNS
    /// rebinding defense); resolver failures fail closed.
    pub async fn check_destination(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(), NetworkPolicyViolation> {
        self.check_host_port(host, port)?;
        if !self.enforce_budgets() {
            return Ok(());
        }
        // Literal addresses were already screened; resolve names.
        if host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| {
                NetworkPolicyViolation::new(format!("DNS resolution failed for '{host}': {err}"))
            })?
            .collect();
        if addrs.is_empty() {
            return Err(NetworkPolicyViolation::new(format!(
                "DNS resolution returned no addresses for '{host}'"
            )));
        }
        for addr in addrs {
            if is_blocked_addr(addr.ip()) {
                return Err(NetworkPolicyViolation::new(format!(
                    "'{host}' resolves to blocked address {}",
                    addr.ip()
                )));
            }
        }
        Ok(())
    }
}

/// Permit for one in-flight request; releases the concurrency slot on drop.
#[derive(Debug)]
pub struct RequestPermit<'a> {
    gate: Option<&'a EgressGate>,
}

impl Drop for RequestPermit<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate {
            gate.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn is_sensitive_hostname(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "metadata.google.internal"
        || host.ends_with(".internal")
}

fn is_blocked_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
