//! Sandboxed bundle executor.
//!
//! Given a claimed task's runtime context, the executor downloads the test
//! bundle with a bounded, streaming fetch, verifies its checksum, extracts
//! it while refusing path-traversal entries, selects tests, and runs one
//! runner child process per test under a restricted environment. Child
//! stdout is a newline-delimited JSON timeline; a dispatcher fiber stamps
//! sequence numbers and feeds the event pipeline, which applies
//! backpressure all the way back to the child readers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::bundle::{
    hex_lower, validate_relpath, BundleMetadata, BUNDLE_METADATA_FILE, RUNTIME_CONFIG_FILE,
};
use tether_core::event::{EventBody, ResultPayload, RunEvent, TestStatus, TimelineEvent};
use tether_core::selection::{select_tests, SelectedTest};
use tether_core::{BundleDownload, RuntimeContext, TaskLease, TaskLimits};

use crate::abort::TaskAbort;
use crate::classify::{BundleError, ExecutorError, WorkerError};
use crate::monitor::ProcessMonitor;
use crate::netpolicy::NetworkPolicy;
use crate::pipeline::EventPipeline;
use crate::secrets::{resolve_secrets, SecretsOptions};

/// The worker's own token variable; always masked out of child
/// environments regardless of the configured prefixes.
pub const WORKER_TOKEN_ENV: &str = "TETHER_WORKER_TOKEN";

const BUNDLE_TAR_FILE: &str = "bundle.tar";
const BUNDLE_DIR: &str = "bundle";

/// Fraction of the overall budget reserved for orchestration overhead.
const OVERHEAD_NUMERATOR: u64 = 9;
const OVERHEAD_DENOMINATOR: u64 = 10;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub work_dir: PathBuf,
    pub runner_bin: String,
    pub download_timeout: Duration,
    /// Used when the context carries no overall timeout.
    pub default_task_timeout: Duration,
    pub memory_check_interval: Duration,
    pub task_memory_limit_bytes: u64,
    pub fail_fast: bool,
    pub mask_env_prefixes: Vec<String>,
    pub allow_net: Vec<String>,
    pub network_policy: NetworkPolicy,
    pub cloud_managed: bool,
    pub secrets_file: Option<PathBuf>,
    pub max_stderr_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Every selected test completed with no failed assertion.
    pub success: bool,
    pub aborted: bool,
    pub timed_out: bool,
    pub counts: TestCounts,
    pub error: Option<WorkerError>,
}

impl ExecutionOutcome {
    fn from_error(error: WorkerError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Seam between the scheduler and the sandbox so scheduler behavior can be
/// exercised with a stub.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        lease: &TaskLease,
        ctx: &RuntimeContext,
        pipeline: Arc<EventPipeline>,
        abort: TaskAbort,
    ) -> ExecutionOutcome;
}

pub struct SandboxExecutor {
    cfg: Arc<ExecutorConfig>,
    http: reqwest::Client,
}

impl SandboxExecutor {
    pub fn new(cfg: ExecutorConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TaskExecutor for SandboxExecutor {
    async fn execute(
        &self,
        lease: &TaskLease,
        ctx: &RuntimeContext,
        pipeline: Arc<EventPipeline>,
        abort: TaskAbort,
    ) -> ExecutionOutcome {
        let task_dir = self.cfg.work_dir.join(&ctx.task_id);
        let result = self
            .execute_inner(lease, ctx, &task_dir, pipeline, &abort)
            .await;
        cleanup_task_dir(&task_dir).await;
        match result {
            Ok(outcome) => outcome,
            Err(err) => ExecutionOutcome::from_error(err),
        }
    }
}

impl SandboxExecutor {
    async fn execute_inner(
        &self,
        _lease: &TaskLease,
        ctx: &RuntimeContext,
        task_dir: &Path,
        pipeline: Arc<EventPipeline>,
        abort: &TaskAbort,
    ) -> Result<ExecutionOutcome, WorkerError> {
        tokio::fs::create_dir_all(task_dir).await.map_err(|err| {
            WorkerError::Executor(ExecutorError::Internal(format!(
                "create task dir {}: {err}",
                task_dir.display()
            )))
        })?;

        let tar_path = task_dir.join(BUNDLE_TAR_FILE);
        self.download_bundle(&ctx.bundle.download, &tar_path)
            .await?;

        let bundle_dir = task_dir.join(BUNDLE_DIR);
        {
            let tar_path = tar_path.clone();
            let bundle_dir = bundle_dir.clone();
            tokio::task::spawn_blocking(move || extract_tar(&tar_path, &bundle_dir))
                .await
                .map_err(|err| {
                    WorkerError::Executor(ExecutorError::Internal(format!(
                        "join extract task: {err}"
                    )))
                })??;
        }

        let metadata = read_metadata(&bundle_dir).await?;
        let runtime_config = bundle_dir
            .join(RUNTIME_CONFIG_FILE)
            .exists()
            .then(|| RUNTIME_CONFIG_FILE.to_string());

        let selected = select_tests(&metadata, ctx.selection.as_ref());
        tracing::info!(
            event = "tether.executor.selected",
            task_id = %ctx.task_id,
            selected = selected.len(),
            discovered = metadata
                .files
                .values()
                .map(|f| f.exports.len())
                .sum::<usize>(),
            "test selection resolved"
        );

        if selected.is_empty() {
            return Ok(ExecutionOutcome {
                success: true,
                ..ExecutionOutcome::default()
            });
        }

        let secrets_options = SecretsOptions {
            cloud_managed: self.cfg.cloud_managed,
            default_file: self.cfg.secrets_file.clone(),
        };
        let secrets = resolve_secrets(ctx, &bundle_dir, &secrets_options, &|key| {
            std::env::var(key).ok()
        })
        .await
        .map_err(|err| WorkerError::Executor(ExecutorError::Internal(format!("{err:#}"))))?;

        let overall_ms = if ctx.limits.timeout_ms > 0 {
            ctx.limits.timeout_ms
        } else {
            self.cfg.default_task_timeout.as_millis() as u64
        };
        let deadline = Instant::now() + Duration::from_millis(overall_ms);
        let budget = per_test_budget(overall_ms, selected.len());
        let concurrency = effective_concurrency(&ctx.limits, selected.len());
        let memory_limit_bytes = if ctx.limits.memory_mb > 0 {
            ctx.limits.memory_mb * 1024 * 1024
        } else {
            self.cfg.task_memory_limit_bytes
        };

        let child_env = masked_env(&ctx.vars, &secrets, &self.cfg.mask_env_prefixes);

        let (tx, rx) = mpsc::channel::<ExecMsg>(256);
        let dispatcher = tokio::spawn(dispatch_events(
            rx,
            Arc::clone(&pipeline),
            ctx.run_id.clone(),
            ctx.task_id.clone(),
        ));

        let exec_cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join = JoinSet::new();

        for test in selected.iter().cloned() {
            let job = TestJob {
                cfg: Arc::clone(&self.cfg),
                bundle_dir: bundle_dir.clone(),
                task_id: ctx.task_id.clone(),
                run_id: ctx.run_id.clone(),
                project_id: ctx.project_id.clone(),
                runtime_config: runtime_config.clone(),
                env: child_env.clone(),
                timeout: effective_test_timeout(budget, test.timeout),
                memory_limit_bytes,
                test,
            };
            join.spawn(run_one_test(
                job,
                Arc::clone(&semaphore),
                tx.clone(),
                exec_cancel.clone(),
                abort.clone(),
            ));
        }
        drop(tx);

        let mut counts = TestCounts {
            total: selected.len() as u64,
            ..TestCounts::default()
        };
        let mut aborted = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                res = join.join_next() => {
                    let Some(res) = res else { break };
                    match res {
                        Ok(outcome) => {
                            match outcome {
                                TestOutcome::Passed => counts.passed += 1,
                                TestOutcome::Failed | TestOutcome::TimedOut => {
                                    counts.failed += 1;
                                    if self.cfg.fail_fast && !exec_cancel.is_cancelled() {
                                        tracing::info!(
                                            event = "tether.executor.fail_fast",
                                            task_id = %ctx.task_id,
                                            "test failed, cancelling remaining tests"
                                        );
                                        exec_cancel.cancel();
                                    }
                                }
                                TestOutcome::Skipped => counts.skipped += 1,
                            }
                        }
                        Err(err) => {
                            tracing::error!(
                                event = "tether.executor.fiber_panic",
                                task_id = %ctx.task_id,
                                error = %err,
                                "test fiber failed"
                            );
                            counts.failed += 1;
                        }
                    }
                }
                _ = abort.cancelled(), if !aborted => {
                    aborted = true;
                    exec_cancel.cancel();
                }
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    tracing::warn!(
                        event = "tether.executor.overall_timeout",
                        task_id = %ctx.task_id,
                        timeout_ms = overall_ms,
                        "overall task deadline expired"
                    );
                    timed_out = true;
                    exec_cancel.cancel();
                }
            }
        }

        // All senders are gone; let the dispatcher finish stamping.
        let _ = dispatcher.await;

        Ok(ExecutionOutcome {
            success: !aborted && !timed_out && counts.failed == 0,
            aborted,
            timed_out,
            counts,
            error: None,
        })
    }

    async fn download_bundle(
        &self,
        download: &BundleDownload,
        dest: &Path,
    ) -> Result<(), BundleError> {
        if let Some(expires_at) = download.expires_at {
            if expires_at <= Utc::now() {
                return Err(BundleError::download("bundle download link expired"));
            }
        }

        let digest = match tokio::time::timeout(
            self.cfg.download_timeout,
            self.download_streaming(&download.url, dest),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => {
                return Err(BundleError::download(format!(
                    "bundle download timed out after {}ms",
                    self.cfg.download_timeout.as_millis()
                )));
            }
        };

        if let Some(expected) = &download.checksum {
            let expected = expected.to_ascii_lowercase();
            if digest != expected {
                return Err(BundleError::checksum(format!(
                    "checksum mismatch: expected {expected} got {digest}"
                )));
            }
        }
        Ok(())
    }

    /// Stream the archive to disk, hashing as it goes. Returns the
    /// lowercase-hex SHA-256 of the written bytes. `file://` URLs are
    /// served from the local filesystem.
    async fn download_streaming(&self, url: &str, dest: &Path) -> Result<String, BundleError> {
        if let Some(path) = url.strip_prefix("file://") {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|err| BundleError::download(format!("read bundle file {path}: {err}")))?;
            tokio::fs::write(dest, &bytes)
                .await
                .map_err(|err| BundleError::download(format!("write bundle: {err}")))?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            return Ok(hex_lower(&hasher.finalize()));
        }

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| BundleError::download(format!("GET {url}: {err}")))?;
        let mut resp = resp
            .error_for_status()
            .map_err(|err| BundleError::download(format!("GET {url}: {err}")))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| BundleError::download(format!("create {}: {err}", dest.display())))?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|err| BundleError::download(format!("read bundle chunk: {err}")))?
        {
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|err| BundleError::download(format!("write bundle chunk: {err}")))?;
        }
        file.flush()
            .await
            .map_err(|err| BundleError::download(format!("flush bundle: {err}")))?;
        Ok(hex_lower(&hasher.finalize()))
    }
}

struct TestJob {
    cfg: Arc<ExecutorConfig>,
    bundle_dir: PathBuf,
    task_id: String,
    run_id: String,
    project_id: String,
    runtime_config: Option<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    memory_limit_bytes: u64,
    test: SelectedTest,
}

enum ExecMsg {
    Timeline {
        test_id: String,
        frame: TimelineEvent,
    },
    Result {
        test_id: String,
        status: TestStatus,
        error: Option<String>,
        duration_ms: u64,
    },
}

enum TestOutcome {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RunnerInvocation<'a> {
    task_id: &'a str,
    run_id: &'a str,
    project_id: &'a str,
    test_id: &'a str,
    file_path: &'a str,
    export_name: &'a str,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_heap_size_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_config: Option<&'a str>,
    network_policy: &'a NetworkPolicy,
    allow_net: &'a [String],
}

async fn run_one_test(
    job: TestJob,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<ExecMsg>,
    exec_cancel: CancellationToken,
    abort: TaskAbort,
) -> TestOutcome {
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return TestOutcome::Skipped,
        },
        _ = exec_cancel.cancelled() => return TestOutcome::Skipped,
    };
    if exec_cancel.is_cancelled() {
        return TestOutcome::Skipped;
    }

    let started = Instant::now();
    let test_id = job.test.id.clone();

    let invocation = RunnerInvocation {
        task_id: &job.task_id,
        run_id: &job.run_id,
        project_id: &job.project_id,
        test_id: &test_id,
        file_path: &job.test.file_path,
        export_name: &job.test.export_name,
        timeout_ms: job.timeout.as_millis() as u64,
        max_heap_size_mb: derive_max_heap_mb(job.memory_limit_bytes),
        runtime_config: job.runtime_config.as_deref(),
        network_policy: &job.cfg.network_policy,
        allow_net: &job.cfg.allow_net,
    };
    let invocation_bytes = match serde_json::to_vec(&invocation) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = send_result(
                &tx,
                &test_id,
                TestStatus::Failed,
                Some(format!("encode invocation: {err}")),
                started,
            )
            .await;
            return TestOutcome::Failed;
        }
    };

    let mut cmd = Command::new(&job.cfg.runner_bin);
    cmd.current_dir(&job.bundle_dir)
        .arg(&job.test.file_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env_clear();
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    for (key, value) in &job.env {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(
                event = "tether.executor.spawn_failed",
                task_id = %job.task_id,
                test_id = %test_id,
                runner = %job.cfg.runner_bin,
                error = %err,
                "failed to spawn runner"
            );
            let _ = send_result(
                &tx,
                &test_id,
                TestStatus::Failed,
                Some(format!("failed to spawn runner: {err}")),
                started,
            )
            .await;
            return TestOutcome::Failed;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(&invocation_bytes).await {
            tracing::warn!(
                event = "tether.executor.stdin_failed",
                test_id = %test_id,
                error = %err,
                "failed to write invocation to runner stdin"
            );
        }
        let _ = stdin.shutdown().await;
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let reader = stdout.map(|out| {
        tokio::spawn(read_timeline(out, tx.clone(), test_id.clone()))
    });
    let stderr_task = stderr.map(|err| {
        let cap = job.cfg.max_stderr_bytes;
        tokio::spawn(read_stream_limited(err, cap))
    });

    let memory_killed = Arc::new(AtomicBool::new(false));
    let monitor_handle = child.id().map(|pid| {
        let monitor = ProcessMonitor::new(
            pid,
            job.memory_limit_bytes,
            job.cfg.memory_check_interval,
            abort.clone(),
        );
        let killed = Arc::clone(&memory_killed);
        tokio::spawn(monitor.run(move |_cause| {
            killed.store(true, Ordering::SeqCst);
        }))
    });

    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let deadline = started + job.timeout;
    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
        _ = exec_cancel.cancelled() => Waited::Cancelled,
    };

    let status = match waited {
        Waited::Exited(status) => status,
        Waited::Cancelled => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            if let Some(handle) = monitor_handle {
                handle.abort();
            }
            if let Some(handle) = reader {
                let _ = handle.await;
            }
            if let Some(handle) = stderr_task {
                let _ = handle.await;
            }
            return TestOutcome::Skipped;
        }
        Waited::TimedOut => {
            // Per-test budget exceeded: kill and report a timeout-class
            // failure, but let the remaining tests run.
            let _ = child.kill().await;
            let _ = child.wait().await;
            if let Some(handle) = monitor_handle {
                handle.abort();
            }
            if let Some(handle) = reader {
                let _ = handle.await;
            }
            if let Some(handle) = stderr_task {
                let _ = handle.await;
            }
            let _ = send_result(
                &tx,
                &test_id,
                TestStatus::Failed,
                Some(format!(
                    "test timed out after {}ms",
                    job.timeout.as_millis()
                )),
                started,
            )
            .await;
            return TestOutcome::TimedOut;
        }
    };

    if let Some(handle) = monitor_handle {
        handle.abort();
    }
    let any_failed_assert = match reader {
        Some(handle) => handle.await.unwrap_or(false),
        None => false,
    };
    let stderr_bytes = match stderr_task {
        Some(handle) => handle.await.ok().and_then(|r| r.ok()).unwrap_or_default(),
        None => Vec::new(),
    };

    match status {
        Ok(status) if status.success() && !any_failed_assert => {
            let _ = send_result(&tx, &test_id, TestStatus::Completed, None, started).await;
            TestOutcome::Passed
        }
        Ok(status) => {
            let error = if memory_killed.load(Ordering::SeqCst) {
                "memory limit exceeded".to_string()
            } else if any_failed_assert {
                "assertion failed".to_string()
            } else {
                let tail = String::from_utf8_lossy(&stderr_bytes);
                let tail = tail.trim();
                if tail.is_empty() {
                    format!("runner exited with {status}")
                } else {
                    format!("runner exited with {status}: {tail}")
                }
            };
            let _ = send_result(&tx, &test_id, TestStatus::Failed, Some(error), started).await;
            TestOutcome::Failed
        }
        Err(err) => {
            let _ = send_result(
                &tx,
                &test_id,
                TestStatus::Failed,
                Some(format!("wait on runner: {err}")),
                started,
            )
            .await;
            TestOutcome::Failed
        }
    }
}

async fn send_result(
    tx: &mpsc::Sender<ExecMsg>,
    test_id: &str,
    status: TestStatus,
    error: Option<String>,
    started: Instant,
) -> Result<(), mpsc::error::SendError<ExecMsg>> {
    tx.send(ExecMsg::Result {
        test_id: test_id.to_string(),
        status,
        error,
        duration_ms: started.elapsed().as_millis() as u64,
    })
    .await
}

/// Decode NDJSON timeline frames from a child's stdout. Non-JSON lines
/// become log frames. Returns whether any failed assertion was observed.
async fn read_timeline<R: AsyncRead + Unpin>(
    stdout: R,
    tx: mpsc::Sender<ExecMsg>,
    test_id: String,
) -> bool {
    let mut lines = BufReader::new(stdout).lines();
    let mut any_failed = false;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let frame = match serde_json::from_str::<TimelineEvent>(line) {
            Ok(frame) => frame,
            Err(_) => TimelineEvent::Log {
                level: None,
                message: line.to_string(),
            },
        };
        if matches!(frame, TimelineEvent::Assert { passed: false, .. }) {
            any_failed = true;
        }
        if tx
            .send(ExecMsg::Timeline {
                test_id: test_id.clone(),
                frame,
            })
            .await
            .is_err()
        {
            break;
        }
    }
    any_failed
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        // Keep only the head; a runaway child must not balloon memory.
        let room = max_bytes.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(buf)
}

/// Stamp sequence numbers and timestamps in arrival order and feed the
/// pipeline. Exits when all senders hang up or the pipeline aborts.
async fn dispatch_events(
    mut rx: mpsc::Receiver<ExecMsg>,
    pipeline: Arc<EventPipeline>,
    run_id: String,
    task_id: String,
) {
    let mut seq: u64 = 0;
    while let Some(msg) = rx.recv().await {
        let body = match msg {
            ExecMsg::Timeline { test_id, frame } => frame.into_body(&test_id),
            ExecMsg::Result {
                test_id,
                status,
                error,
                duration_ms,
            } => EventBody::Result(ResultPayload {
                test_id,
                status,
                error,
                duration_ms: Some(duration_ms),
            }),
        };
        seq += 1;
        let event = RunEvent {
            run_id: run_id.clone(),
            task_id: task_id.clone(),
            seq,
            ts: Utc::now(),
            body,
        };
        if pipeline.push(event).await.is_err() {
            // The pipeline recorded the abort; stop translating.
            return;
        }
    }
}

/// Per-test wall-clock budget: 90% of the overall budget split evenly,
/// reserving the rest for orchestration overhead.
pub fn per_test_budget(overall_ms: u64, selected: usize) -> Duration {
    let n = selected.max(1) as u64;
    let ms = overall_ms * OVERHEAD_NUMERATOR / OVERHEAD_DENOMINATOR / n;
    Duration::from_millis(ms.max(1))
}

/// An export-level timeout may shrink the derived budget, never exceed it.
pub fn effective_test_timeout(budget: Duration, export_timeout: Option<u64>) -> Duration {
    match export_timeout {
        Some(ms) if ms > 0 => budget.min(Duration::from_millis(ms)),
        _ => budget,
    }
}

pub fn effective_concurrency(limits: &TaskLimits, selected: usize) -> usize {
    let requested = limits.requested_concurrency.max(1) as usize;
    let cap = limits.max_concurrency.max(1) as usize;
    requested.min(cap).min(selected.max(1))
}

/// Heap cap handed to the runner, derived from the memory limit with
/// headroom for the runtime itself.
pub fn derive_max_heap_mb(memory_limit_bytes: u64) -> Option<u64> {
    if memory_limit_bytes == 0 {
        return None;
    }
    let mb = memory_limit_bytes / (1024 * 1024);
    Some((mb * 3 / 4).max(16))
}

/// Build the child environment from vars and secrets, dropping any key
/// matching a masked prefix. The worker's own token variable is always
/// masked.
pub fn masked_env(
    vars: &BTreeMap<String, String>,
    secrets: &BTreeMap<String, String>,
    mask_prefixes: &[String],
) -> BTreeMap<String, String> {
    let is_masked = |key: &str| {
        key == WORKER_TOKEN_ENV || mask_prefixes.iter().any(|prefix| key.starts_with(prefix))
    };
    let mut env = BTreeMap::new();
    for (key, value) in vars.iter().chain(secrets.iter()) {
        if is_masked(key) {
            tracing::warn!(
                event = "tether.executor.env_masked",
                key = %key,
                "dropping masked environment variable from runner env"
            );
            continue;
        }
        env.insert(key.clone(), value.clone());
    }
    env
}

fn read_metadata_error(err: impl std::fmt::Display) -> WorkerError {
    WorkerError::Bundle(BundleError::metadata(format!(
        "{BUNDLE_METADATA_FILE}: {err}"
    )))
}

async fn read_metadata(bundle_dir: &Path) -> Result<BundleMetadata, WorkerError> {
    let path = bundle_dir.join(BUNDLE_METADATA_FILE);
    let bytes = tokio::fs::read(&path).await.map_err(read_metadata_error)?;
    let metadata: BundleMetadata =
        serde_json::from_slice(&bytes).map_err(read_metadata_error)?;
    metadata.validate().map_err(read_metadata_error)?;
    Ok(metadata)
}

/// Extract a bundle tar, refusing entries that would escape the root.
/// Only regular files and directories are unpacked.
fn extract_tar(tar_path: &Path, dest: &Path) -> Result<(), WorkerError> {
    let extract_err =
        |err: String| WorkerError::Bundle(BundleError::extract(err));

    std::fs::create_dir_all(dest)
        .map_err(|err| extract_err(format!("create {}: {err}", dest.display())))?;
    let file = std::fs::File::open(tar_path)
        .map_err(|err| extract_err(format!("open {}: {err}", tar_path.display())))?;
    let mut archive = tar::Archive::new(file);

    for entry in archive
        .entries()
        .map_err(|err| extract_err(format!("read archive: {err}")))?
    {
        let mut entry = entry.map_err(|err| extract_err(format!("read entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| extract_err(format!("entry path: {err}")))?
            .into_owned();
        let path_str = path.to_string_lossy().into_owned();
        validate_relpath(&path_str)
            .map_err(|err| extract_err(format!("entry '{path_str}' rejected: {err}")))?;

        match entry.header().entry_type() {
            tar::EntryType::Regular => {
                let out_path = dest.join(&path);
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|err| extract_err(format!("create {}: {err}", parent.display())))?;
                }
                entry
                    .unpack(&out_path)
                    .map_err(|err| extract_err(format!("unpack '{path_str}': {err}")))?;
            }
            tar::EntryType::Directory => {
                std::fs::create_dir_all(dest.join(&path))
                    .map_err(|err| extract_err(format!("create dir '{path_str}': {err}")))?;
            }
            other => {
                return Err(extract_err(format!(
                    "entry '{path_str}' has unsupported type {other:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Remove the task's work directory on every exit path. Failures are
/// logged, never swallowed silently; as a fallback the largest artifact
/// (the bundle tar) is deleted best-effort.
async fn cleanup_task_dir(task_dir: &Path) {
    match tokio::fs::remove_dir_all(task_dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::error!(
                event = "tether.executor.cleanup_failed",
                task_dir = %task_dir.display(),
                error = %err,
                "failed to remove task work dir"
            );
            let tar_path = task_dir.join(BUNDLE_TAR_FILE);
            if let Err(err) = tokio::fs::remove_file(&tar_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(
                        event = "tether.executor.cleanup_failed",
                        path = %tar_path.display(),
                        error = %err,
                        "failed to remove bundle archive"
                    );
                }
            }
        }
    }
}
