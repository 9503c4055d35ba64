//! Worker configuration.
//!
//! Every field has a snake_case key in the optional TOML config file and a
//! `TETHER_*` environment variable; the environment wins. Loaders take an
//! environment *lookup* and never mutate the process environment. Legacy
//! keys are rejected with an error naming their replacement instead of
//! being silently accepted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::client::ClientConfig;
use crate::executor::ExecutorConfig;
use crate::netpolicy::{NetworkPolicy, NetworkPolicyMode};
use crate::pipeline::PipelineConfig;
use crate::scheduler::{LifecycleMode, SchedulerConfig};

pub const DEFAULT_CONFIG_FILE: &str = "tether.toml";

/// Removed keys and their replacements, rejected in both spellings the old
/// config format accepted.
const LEGACY_FILE_KEYS: &[(&str, &str)] = &[
    ("execution_timeout_ms", "task_timeout_ms"),
    ("executionTimeoutMs", "task_timeout_ms"),
    ("stop_on_failure", "fail_fast"),
    ("stopOnFailure", "fail_fast"),
];

const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("TETHER_EXECUTION_TIMEOUT_MS", "TETHER_TASK_TIMEOUT_MS"),
    ("TETHER_STOP_ON_FAILURE", "TETHER_FAIL_FAST"),
];

#[derive(Debug)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub control_plane_url: String,
    pub worker_token: String,
    /// Auto-generated `worker-<8hex>` when absent.
    pub worker_id: String,
    pub tags: Vec<String>,
    /// 0 disables server-side long polling.
    pub long_poll_ms: u64,
    pub claim_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub task_timeout_ms: u64,
    pub max_concurrent_tasks: usize,
    /// 0 disables the memory monitor.
    pub task_memory_limit_bytes: u64,
    pub memory_check_interval_ms: u64,
    pub download_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub work_dir: PathBuf,
    pub runner_bin: String,
    pub lifecycle: LifecycleMode,
    pub idle_grace_ms: u64,
    pub max_lifetime_ms: u64,
    pub max_tasks_per_worker: u64,
    pub fail_fast: bool,
    pub mask_env_prefixes: Vec<String>,
    pub allow_net: Vec<String>,
    pub cloud_managed: bool,
    pub secrets_file: Option<PathBuf>,
    pub max_stderr_bytes: usize,
    pub drain_grace_ms: u64,
    pub flush_every_ms: u64,
    pub flush_max_buffer: usize,
    pub max_buffer: usize,
    pub max_consecutive_failures: u32,
    pub backpressure_wait_ms: u64,
    pub network_policy: NetworkPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            control_plane_url: String::new(),
            worker_token: String::new(),
            worker_id: String::new(),
            tags: Vec::new(),
            long_poll_ms: 30_000,
            claim_interval_ms: 1_000,
            heartbeat_interval_ms: 10_000,
            task_timeout_ms: 300_000,
            max_concurrent_tasks: 1,
            task_memory_limit_bytes: 0,
            memory_check_interval_ms: 1_000,
            download_timeout_ms: 60_000,
            request_timeout_ms: 30_000,
            max_retry_attempts: 5,
            work_dir: std::env::temp_dir().join("tether"),
            runner_bin: "tether-runner".to_string(),
            lifecycle: LifecycleMode::Daemon,
            idle_grace_ms: 60_000,
            max_lifetime_ms: 0,
            max_tasks_per_worker: 0,
            fail_fast: false,
            mask_env_prefixes: vec!["TETHER_".to_string()],
            allow_net: Vec::new(),
            cloud_managed: false,
            secrets_file: None,
            max_stderr_bytes: 1024 * 1024,
            drain_grace_ms: 10_000,
            flush_every_ms: 1_000,
            flush_max_buffer: 50,
            max_buffer: 10_000,
            max_consecutive_failures: 5,
            backpressure_wait_ms: 100,
            network_policy: NetworkPolicy::default(),
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("control_plane_url", &self.control_plane_url)
            .field("worker_token", &tether_core::redact::REDACTED)
            .field("worker_id", &self.worker_id)
            .field("tags", &self.tags)
            .field("long_poll_ms", &self.long_poll_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("task_timeout_ms", &self.task_timeout_ms)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("task_memory_limit_bytes", &self.task_memory_limit_bytes)
            .field("work_dir", &self.work_dir)
            .field("runner_bin", &self.runner_bin)
            .field("lifecycle", &self.lifecycle)
            .field("network_policy", &self.network_policy)
            .finish_non_exhaustive()
    }
}

impl WorkerConfig {
    /// Load from the given (or default) config file with process
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, &|key| std::env::var(key).ok())
    }

    /// Load with an injected environment lookup. The process environment is
    /// never written.
    pub fn load_with(
        path: Option<&Path>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|err| {
                    ConfigError::new(format!("read config file {}: {err}", path.display()))
                })?;
                Self::from_toml(&contents)?
            }
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(contents) => Self::from_toml(&contents)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
                Err(err) => {
                    return Err(ConfigError::new(format!(
                        "read config file {DEFAULT_CONFIG_FILE}: {err}"
                    )));
                }
            },
        };
        cfg.apply_env(env)?;
        cfg.finalize()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let value: toml::Value = toml::from_str(contents)
            .map_err(|err| ConfigError::new(format!("parse config file: {err}")))?;
        if let Some(table) = value.as_table() {
            for key in table.keys() {
                if let Some((_, replacement)) = LEGACY_FILE_KEYS
                    .iter()
                    .find(|(legacy, _)| legacy == key)
                {
                    return Err(ConfigError::new(format!(
                        "legacy config key '{key}' is no longer supported; use '{replacement}'"
                    )));
                }
            }
        }
        value
            .try_into()
            .map_err(|err| ConfigError::new(format!("invalid config: {err}")))
    }

    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        for (legacy, replacement) in LEGACY_ENV_KEYS {
            if env(legacy).is_some() {
                return Err(ConfigError::new(format!(
                    "legacy environment variable '{legacy}' is no longer supported; use '{replacement}'"
                )));
            }
        }

        if let Some(v) = env("TETHER_CONTROL_PLANE_URL") {
            self.control_plane_url = v;
        }
        if let Some(v) = env("TETHER_WORKER_TOKEN") {
            self.worker_token = v;
        }
        if let Some(v) = env("TETHER_WORKER_ID") {
            self.worker_id = v;
        }
        if let Some(v) = env("TETHER_TAGS") {
            self.tags = parse_list(&v);
        }
        if let Some(v) = env("TETHER_LONG_POLL_MS") {
            self.long_poll_ms = parse_u64("TETHER_LONG_POLL_MS", &v)?;
        }
        if let Some(v) = env("TETHER_CLAIM_INTERVAL_MS") {
            self.claim_interval_ms = parse_u64("TETHER_CLAIM_INTERVAL_MS", &v)?;
        }
        if let Some(v) = env("TETHER_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse_u64("TETHER_HEARTBEAT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = env("TETHER_TASK_TIMEOUT_MS") {
            self.task_timeout_ms = parse_u64("TETHER_TASK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = env("TETHER_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks =
                parse_u64("TETHER_MAX_CONCURRENT_TASKS", &v)? as usize;
        }
        if let Some(v) = env("TETHER_TASK_MEMORY_LIMIT_BYTES") {
            self.task_memory_limit_bytes = parse_u64("TETHER_TASK_MEMORY_LIMIT_BYTES", &v)?;
        }
        if let Some(v) = env("TETHER_MEMORY_CHECK_INTERVAL_MS") {
            self.memory_check_interval_ms = parse_u64("TETHER_MEMORY_CHECK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = env("TETHER_DOWNLOAD_TIMEOUT_MS") {
            self.download_timeout_ms = parse_u64("TETHER_DOWNLOAD_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = env("TETHER_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_u64("TETHER_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = env("TETHER_MAX_RETRY_ATTEMPTS") {
            self.max_retry_attempts = parse_u64("TETHER_MAX_RETRY_ATTEMPTS", &v)? as u32;
        }
        if let Some(v) = env("TETHER_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = env("TETHER_RUNNER_BIN") {
            self.runner_bin = v;
        }
        if let Some(v) = env("TETHER_LIFECYCLE") {
            self.lifecycle = parse_lifecycle(&v)?;
        }
        if let Some(v) = env("TETHER_IDLE_GRACE_MS") {
            self.idle_grace_ms = parse_u64("TETHER_IDLE_GRACE_MS", &v)?;
        }
        if let Some(v) = env("TETHER_MAX_LIFETIME_MS") {
            self.max_lifetime_ms = parse_u64("TETHER_MAX_LIFETIME_MS", &v)?;
        }
        if let Some(v) = env("TETHER_MAX_TASKS_PER_WORKER") {
            self.max_tasks_per_worker = parse_u64("TETHER_MAX_TASKS_PER_WORKER", &v)?;
        }
        if let Some(v) = env("TETHER_FAIL_FAST") {
            self.fail_fast = parse_bool("TETHER_FAIL_FAST", &v)?;
        }
        if let Some(v) = env("TETHER_MASK_ENV_PREFIXES") {
            self.mask_env_prefixes = parse_list(&v);
        }
        if let Some(v) = env("TETHER_ALLOW_NET") {
            self.allow_net = parse_list(&v);
        }
        if let Some(v) = env("TETHER_CLOUD_MANAGED") {
            self.cloud_managed = parse_bool("TETHER_CLOUD_MANAGED", &v)?;
        }
        if let Some(v) = env("TETHER_SECRETS_FILE_DEFAULT") {
            self.secrets_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TETHER_MAX_STDERR_BYTES") {
            self.max_stderr_bytes = parse_u64("TETHER_MAX_STDERR_BYTES", &v)? as usize;
        }
        if let Some(v) = env("TETHER_DRAIN_GRACE_MS") {
            self.drain_grace_ms = parse_u64("TETHER_DRAIN_GRACE_MS", &v)?;
        }
        if let Some(v) = env("TETHER_FLUSH_EVERY_MS") {
            self.flush_every_ms = parse_u64("TETHER_FLUSH_EVERY_MS", &v)?;
        }
        if let Some(v) = env("TETHER_FLUSH_MAX_BUFFER") {
            self.flush_max_buffer = parse_u64("TETHER_FLUSH_MAX_BUFFER", &v)? as usize;
        }
        if let Some(v) = env("TETHER_MAX_BUFFER") {
            self.max_buffer = parse_u64("TETHER_MAX_BUFFER", &v)? as usize;
        }
        if let Some(v) = env("TETHER_MAX_CONSECUTIVE_FAILURES") {
            self.max_consecutive_failures =
                parse_u64("TETHER_MAX_CONSECUTIVE_FAILURES", &v)? as u32;
        }
        if let Some(v) = env("TETHER_BACKPRESSURE_WAIT_MS") {
            self.backpressure_wait_ms = parse_u64("TETHER_BACKPRESSURE_WAIT_MS", &v)?;
        }

        if let Some(v) = env("TETHER_NETWORK_POLICY_MODE") {
            self.network_policy.mode = parse_network_mode(&v)?;
        }
        if let Some(v) = env("TETHER_NETWORK_POLICY_MAX_REQUESTS") {
            self.network_policy.max_requests =
                parse_u64("TETHER_NETWORK_POLICY_MAX_REQUESTS", &v)? as u32;
        }
        if let Some(v) = env("TETHER_NETWORK_POLICY_MAX_CONCURRENT_REQUESTS") {
            self.network_policy.max_concurrent_requests =
                parse_u64("TETHER_NETWORK_POLICY_MAX_CONCURRENT_REQUESTS", &v)? as u32;
        }
        if let Some(v) = env("TETHER_NETWORK_POLICY_REQUEST_TIMEOUT_MS") {
            self.network_policy.request_timeout_ms =
                parse_u64("TETHER_NETWORK_POLICY_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = env("TETHER_NETWORK_POLICY_MAX_RESPONSE_BYTES") {
            self.network_policy.max_response_bytes =
                parse_u64("TETHER_NETWORK_POLICY_MAX_RESPONSE_BYTES", &v)?;
        }
        if let Some(v) = env("TETHER_NETWORK_POLICY_ALLOWED_PORTS") {
            let mut ports = Vec::new();
            for item in parse_list(&v) {
                let port: u16 = item.parse().map_err(|_| {
                    ConfigError::new(format!(
                        "TETHER_NETWORK_POLICY_ALLOWED_PORTS: '{item}' is not a port"
                    ))
                })?;
                ports.push(port);
            }
            self.network_policy.allowed_ports = ports;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.control_plane_url.is_empty() {
            return Err(ConfigError::new(
                "control_plane_url is required; set the control_plane_url key or TETHER_CONTROL_PLANE_URL",
            ));
        }
        if self.worker_token.is_empty() {
            return Err(ConfigError::new(
                "worker_token is required; set the worker_token key or TETHER_WORKER_TOKEN",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::new("max_concurrent_tasks must be at least 1"));
        }
        if self.worker_id.is_empty() {
            self.worker_id = generated_worker_id();
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.control_plane_url.clone(),
            worker_token: self.worker_token.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_retry_attempts: self.max_retry_attempts,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            flush_every: Duration::from_millis(self.flush_every_ms),
            flush_max_buffer: self.flush_max_buffer,
            max_buffer: self.max_buffer,
            max_consecutive_failures: self.max_consecutive_failures,
            backpressure_wait: Duration::from_millis(self.backpressure_wait_ms),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            work_dir: self.work_dir.clone(),
            runner_bin: self.runner_bin.clone(),
            download_timeout: Duration::from_millis(self.download_timeout_ms),
            default_task_timeout: Duration::from_millis(self.task_timeout_ms),
            memory_check_interval: Duration::from_millis(self.memory_check_interval_ms),
            task_memory_limit_bytes: self.task_memory_limit_bytes,
            fail_fast: self.fail_fast,
            mask_env_prefixes: self.mask_env_prefixes.clone(),
            allow_net: self.allow_net.clone(),
            network_policy: self.network_policy.clone(),
            cloud_managed: self.cloud_managed,
            secrets_file: self.secrets_file.clone(),
            max_stderr_bytes: self.max_stderr_bytes,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_id: self.worker_id.clone(),
            tags: self.tags.clone(),
            max_concurrent_tasks: self.max_concurrent_tasks,
            long_poll_ms: self.long_poll_ms,
            claim_interval: Duration::from_millis(self.claim_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            lifecycle: self.lifecycle,
            idle_grace: Duration::from_millis(self.idle_grace_ms),
            max_lifetime: Duration::from_millis(self.max_lifetime_ms),
            max_tasks: self.max_tasks_per_worker,
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            pipeline: self.pipeline_config(),
        }
    }
}

pub fn generated_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::new(format!("{key}: '{value}' is not a non-negative integer")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::new(format!(
            "{key}: '{value}' is not a boolean"
        ))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_lifecycle(value: &str) -> Result<LifecycleMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "daemon" => Ok(LifecycleMode::Daemon),
        "job" => Ok(LifecycleMode::Job),
        _ => Err(ConfigError::new(format!(
            "TETHER_LIFECYCLE: '{value}' is not one of 'daemon', 'job'"
        ))),
    }
}

fn parse_network_mode(value: &str) -> Result<NetworkPolicyMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "trusted" => Ok(NetworkPolicyMode::Trusted),
        "shared_serverless" => Ok(NetworkPolicyMode::SharedServerless),
        _ => Err(ConfigError::new(format!(
            "TETHER_NETWORK_POLICY_MODE: '{value}' is not one of 'trusted', 'shared_serverless'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([
            (
                "TETHER_CONTROL_PLANE_URL".to_string(),
                "https://cp.example.com/api/worker".to_string(),
            ),
            ("TETHER_WORKER_TOKEN".to_string(), "wtok-abc".to_string()),
        ])
    }

    fn lookup(map: &HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.long_poll_ms, 30_000);
        assert_eq!(cfg.task_timeout_ms, 300_000);
        assert_eq!(cfg.max_concurrent_tasks, 1);
        assert_eq!(cfg.task_memory_limit_bytes, 0);
        assert_eq!(cfg.flush_every_ms, 1_000);
        assert_eq!(cfg.flush_max_buffer, 50);
        assert_eq!(cfg.max_buffer, 10_000);
        assert_eq!(cfg.max_consecutive_failures, 5);
        assert_eq!(cfg.backpressure_wait_ms, 100);
        assert_eq!(cfg.lifecycle, LifecycleMode::Daemon);
    }

    #[test]
    fn toml_file_keys_parse() {
        let cfg = WorkerConfig::from_toml(
            r#"
            control_plane_url = "https://cp.example.com/api/worker"
            worker_token = "tok"
            max_concurrent_tasks = 4
            lifecycle = "job"
            max_tasks_per_worker = 10
            tags = ["linux", "gpu"]

            [network_policy]
            mode = "shared_serverless"
            max_requests = 25
            allowed_ports = [443]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_concurrent_tasks, 4);
        assert_eq!(cfg.lifecycle, LifecycleMode::Job);
        assert_eq!(cfg.tags, vec!["linux".to_string(), "gpu".to_string()]);
        assert_eq!(cfg.network_policy.max_requests, 25);
        assert_eq!(cfg.network_policy.allowed_ports, vec![443]);
    }

    #[test]
    fn legacy_file_key_is_rejected_with_replacement_hint() {
        let err = WorkerConfig::from_toml("execution_timeout_ms = 1000\n").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("execution_timeout_ms"));
        assert!(message.contains("task_timeout_ms"));

        let err = WorkerConfig::from_toml("stop_on_failure = true\n").unwrap_err();
        assert!(err.to_string().contains("fail_fast"));
    }

    #[test]
    fn unknown_file_keys_are_errors() {
        assert!(WorkerConfig::from_toml("not_a_real_key = 1\n").is_err());
    }

    #[test]
    fn legacy_env_key_is_rejected_with_replacement_hint() {
        let mut env = base_env();
        env.insert("TETHER_STOP_ON_FAILURE".to_string(), "true".to_string());
        let err = WorkerConfig::load_with(None, &lookup(&env)).unwrap_err();
        assert!(err.to_string().contains("TETHER_FAIL_FAST"));
    }

    #[test]
    fn env_overrides_apply_and_parse() {
        let mut env = base_env();
        env.insert("TETHER_LONG_POLL_MS".to_string(), "0".to_string());
        env.insert("TETHER_MAX_CONCURRENT_TASKS".to_string(), "3".to_string());
        env.insert("TETHER_FAIL_FAST".to_string(), "true".to_string());
        env.insert("TETHER_TAGS".to_string(), "smoke, slow".to_string());
        env.insert(
            "TETHER_NETWORK_POLICY_MODE".to_string(),
            "shared_serverless".to_string(),
        );
        let cfg = WorkerConfig::load_with(None, &lookup(&env)).unwrap();
        assert_eq!(cfg.long_poll_ms, 0);
        assert_eq!(cfg.max_concurrent_tasks, 3);
        assert!(cfg.fail_fast);
        assert_eq!(cfg.tags, vec!["smoke".to_string(), "slow".to_string()]);
        assert_eq!(cfg.network_policy.mode, NetworkPolicyMode::SharedServerless);
    }

    #[test]
    fn invalid_env_numbers_are_clear_errors() {
        let mut env = base_env();
        env.insert("TETHER_LONG_POLL_MS".to_string(), "soon".to_string());
        let err = WorkerConfig::load_with(None, &lookup(&env)).unwrap_err();
        assert!(err.to_string().contains("TETHER_LONG_POLL_MS"));
    }

    #[test]
    fn missing_required_fields_name_their_sources() {
        let err = WorkerConfig::load_with(None, &|_| None).unwrap_err();
        assert!(err.to_string().contains("TETHER_CONTROL_PLANE_URL"));

        let env = HashMap::from([(
            "TETHER_CONTROL_PLANE_URL".to_string(),
            "https://cp".to_string(),
        )]);
        let err = WorkerConfig::load_with(None, &lookup(&env)).unwrap_err();
        assert!(err.to_string().contains("TETHER_WORKER_TOKEN"));
    }

    #[test]
    fn worker_id_is_generated_when_absent() {
        let env = base_env();
        let cfg = WorkerConfig::load_with(None, &lookup(&env)).unwrap();
        assert!(cfg.worker_id.starts_with("worker-"));
        let suffix = &cfg.worker_id["worker-".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn loading_never_mutates_the_process_environment() {
        let before: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
        let env = base_env();
        let _ = WorkerConfig::load_with(None, &lookup(&env)).unwrap();
        assert!(std::env::var("TETHER_CONTROL_PLANE_URL").is_err());
        let after: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn debug_output_redacts_the_worker_token() {
        let mut cfg = WorkerConfig::default();
        cfg.worker_token = "super-secret".to_string();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
