//! Streaming invariants of the event pipeline against an in-memory control
//! plane: ordered contiguous batches, bounded memory under a slow sink,
//! failure recovery without reorder, and abort on exhaustion.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use common::FakeControlPlane;
use tether_core::event::{EventBody, LogPayload, RunEvent};
use tether_worker::abort::{AbortReason, TaskAbort};
use tether_worker::pipeline::{EventPipeline, PipelineConfig};

fn event(seq: u64) -> RunEvent {
    RunEvent {
        run_id: "r-1".to_string(),
        task_id: "t-1".to_string(),
        seq,
        ts: Utc::now(),
        body: EventBody::Log(LogPayload {
            level: None,
            message: format!("event {seq}"),
            test_id: None,
        }),
    }
}

fn pipeline(
    plane: Arc<FakeControlPlane>,
    cfg: PipelineConfig,
) -> (Arc<EventPipeline>, TaskAbort) {
    let abort = TaskAbort::new();
    let p = EventPipeline::new(
        plane,
        cfg,
        "t-1".to_string(),
        "t-1-token".to_string(),
        abort.clone(),
    );
    (p, abort)
}

#[tokio::test]
async fn batches_form_a_contiguous_ordered_prefix() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    let (p, _abort) = pipeline(plane.clone(), PipelineConfig::default());

    for seq in 1..=250 {
        p.push(event(seq)).await?;
    }
    p.drain().await?;

    anyhow::ensure!(p.buffered_len().await == 0);
    let seqs = plane.streamed_seqs();
    anyhow::ensure!(
        seqs == (1..=250).collect::<Vec<_>>(),
        "stream not contiguous: {seqs:?}"
    );
    // Every batch is itself an ascending contiguous chunk.
    for batch in plane.batches.lock().unwrap().iter() {
        for pair in batch.windows(2) {
            anyhow::ensure!(pair[1].seq == pair[0].seq + 1, "batch not contiguous");
        }
    }
    Ok(())
}

#[tokio::test]
async fn slow_sink_applies_backpressure_without_losing_events() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    plane.submit_delay_ms.store(150, Ordering::SeqCst);
    let cfg = PipelineConfig {
        max_buffer: 100,
        flush_max_buffer: 100,
        flush_every: Duration::from_secs(3600),
        backpressure_wait: Duration::from_millis(20),
        ..PipelineConfig::default()
    };
    let (p, abort) = pipeline(plane.clone(), cfg);

    let mut slow_pushes = 0usize;
    for seq in 1..=200 {
        let started = Instant::now();
        p.push(event(seq)).await?;
        if started.elapsed() >= Duration::from_millis(20) {
            slow_pushes += 1;
        }
        anyhow::ensure!(
            p.buffered_len().await <= 100,
            "buffer exceeded the ceiling"
        );
    }
    p.drain().await?;

    anyhow::ensure!(!abort.is_aborted());
    anyhow::ensure!(slow_pushes > 0, "no push observed backpressure latency");
    anyhow::ensure!(
        plane.streamed_seqs() == (1..=200).collect::<Vec<_>>(),
        "events lost or reordered under backpressure"
    );
    Ok(())
}

#[tokio::test]
async fn failed_submit_recovers_in_order_without_duplicates() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    plane.submit_fail_first.store(1, Ordering::SeqCst);
    let (p, abort) = pipeline(plane.clone(), PipelineConfig::default());

    for seq in 1..=40 {
        p.push(event(seq)).await?;
    }
    p.drain().await?;

    anyhow::ensure!(!abort.is_aborted());
    anyhow::ensure!(plane.streamed_seqs() == (1..=40).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn exhausted_submits_abort_the_task_and_keep_the_batch() -> anyhow::Result<()> {
    let plane = FakeControlPlane::new();
    plane.submit_fail_first.store(u32::MAX, Ordering::SeqCst);
    let cfg = PipelineConfig {
        max_consecutive_failures: 1,
        ..PipelineConfig::default()
    };
    let (p, abort) = pipeline(plane.clone(), cfg);

    for seq in 1..=7 {
        p.push(event(seq)).await?;
    }
    let err = p.flush().await.unwrap_err();
    anyhow::ensure!(err.message.contains("consecutive"));
    anyhow::ensure!(matches!(
        abort.reason(),
        Some(AbortReason::EventFlush(_))
    ));
    anyhow::ensure!(p.buffered_len().await == 7, "batch not restored");
    anyhow::ensure!(plane.streamed_seqs().is_empty());
    anyhow::ensure!(p.drain().await.is_err(), "drain must refuse after abort");
    Ok(())
}
