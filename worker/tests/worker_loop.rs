//! Scheduler behavior against the in-memory control plane: the happy path,
//! heartbeat partitions, idle claiming, lease expiry, and job-mode exits.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{FakeControlPlane, StubBehavior, StubExecutor};
use tether_core::{FailureClass, RunStatus};
use tether_worker::pipeline::PipelineConfig;
use tether_worker::scheduler::{LifecycleMode, SchedulerConfig, TaskScheduler};

fn scheduler_config(lifecycle: LifecycleMode, max_tasks: u64) -> SchedulerConfig {
    SchedulerConfig {
        worker_id: "worker-0badc0de".to_string(),
        tags: Vec::new(),
        max_concurrent_tasks: 1,
        long_poll_ms: 0,
        claim_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(10),
        lifecycle,
        idle_grace: Duration::ZERO,
        max_lifetime: Duration::ZERO,
        max_tasks,
        drain_grace: Duration::from_secs(5),
        pipeline: PipelineConfig {
            flush_every: Duration::from_millis(20),
            ..PipelineConfig::default()
        },
    }
}

#[tokio::test]
async fn happy_path_streams_events_then_completes() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    plane.enqueue_task("t-1", 1);
    let executor = Arc::new(StubExecutor {
        behavior: StubBehavior::HappyPath,
    });

    let scheduler = TaskScheduler::new(
        plane.clone(),
        executor,
        scheduler_config(LifecycleMode::Job, 1),
        CancellationToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(10), scheduler.run()).await??;

    let completes = plane.completes.lock().unwrap().clone();
    anyhow::ensure!(completes.len() == 1, "expected one complete call");
    let (task_id, summary, idempotency_key) = &completes[0];
    anyhow::ensure!(task_id == "t-1");
    anyhow::ensure!(idempotency_key == "t-1-1");
    anyhow::ensure!(summary.status == RunStatus::Passed);
    anyhow::ensure!(summary.counts.events == 3, "events: {}", summary.counts.events);
    anyhow::ensure!(summary.counts.passed == 1);

    anyhow::ensure!(plane.fails.lock().unwrap().is_empty());
    anyhow::ensure!(plane.streamed_seqs() == vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn heartbeat_partition_aborts_and_reports_infra_error() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    plane.heartbeat_always_fail.store(true, Ordering::SeqCst);
    plane.enqueue_task("t-1", 1);
    let executor = Arc::new(StubExecutor {
        behavior: StubBehavior::WaitForAbort,
    });

    let scheduler = TaskScheduler::new(
        plane.clone(),
        executor,
        scheduler_config(LifecycleMode::Job, 1),
        CancellationToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(10), scheduler.run()).await??;

    // Three consecutive heartbeat failures abort the task.
    anyhow::ensure!(plane.heartbeat_count.load(Ordering::SeqCst) >= 3);
    let fails = plane.fails.lock().unwrap().clone();
    anyhow::ensure!(fails.len() == 1, "expected one fail call, got {fails:?}");
    let (task_id, class, message, idempotency_key) = &fails[0];
    anyhow::ensure!(task_id == "t-1");
    anyhow::ensure!(*class == FailureClass::InfraError);
    anyhow::ensure!(idempotency_key == "t-1-1-fail");
    anyhow::ensure!(
        message.as_deref().unwrap_or_default().contains("heartbeat"),
        "message should name the heartbeat: {message:?}"
    );
    anyhow::ensure!(plane.completes.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn idle_worker_keeps_claiming_without_leaking_permits() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    let executor = Arc::new(StubExecutor {
        behavior: StubBehavior::HappyPath,
    });
    let shutdown = CancellationToken::new();

    let scheduler = TaskScheduler::new(
        plane.clone(),
        executor,
        scheduler_config(LifecycleMode::Daemon, 0),
        shutdown.clone(),
    );
    let handle = tokio::spawn(async move { scheduler.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await???;

    // Idle claims keep flowing: a leaked permit would stall the loop after
    // the first claim.
    anyhow::ensure!(plane.claim_count.load(Ordering::SeqCst) >= 5);
    anyhow::ensure!(plane.completes.lock().unwrap().is_empty());
    anyhow::ensure!(plane.fails.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn lease_expired_context_abandons_without_wire_calls() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    plane.context_lease_expired.store(true, Ordering::SeqCst);
    plane.enqueue_task("t-1", 1);
    let executor = Arc::new(StubExecutor {
        behavior: StubBehavior::HappyPath,
    });

    let scheduler = TaskScheduler::new(
        plane.clone(),
        executor,
        scheduler_config(LifecycleMode::Job, 1),
        CancellationToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(10), scheduler.run()).await??;

    anyhow::ensure!(plane.completes.lock().unwrap().is_empty());
    anyhow::ensure!(plane.fails.lock().unwrap().is_empty());
    anyhow::ensure!(plane.batches.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn job_mode_exits_on_idle_grace() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    let executor = Arc::new(StubExecutor {
        behavior: StubBehavior::HappyPath,
    });
    let mut cfg = scheduler_config(LifecycleMode::Job, 0);
    cfg.idle_grace = Duration::from_millis(100);

    let scheduler = TaskScheduler::new(
        plane.clone(),
        executor,
        cfg,
        CancellationToken::new(),
    );
    // Exits on its own once the idle grace expires with no active tasks.
    tokio::time::timeout(Duration::from_secs(5), scheduler.run()).await??;
    Ok(())
}
