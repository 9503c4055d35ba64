//! Child-process memory monitor.
//!
//! Samples the child's RSS from `/proc/{pid}/statm` every tick. On overrun
//! the child is SIGKILLed, the task abort is fired with
//! [`AbortReason::MemoryExceeded`], and the kill callback is invoked with
//! `"memory"`. A zero byte limit disables monitoring entirely; a vanished
//! `/proc` entry stops the monitor cleanly.

use std::time::Duration;

use crate::abort::{AbortReason, TaskAbort};

pub struct ProcessMonitor {
    pid: u32,
    limit_bytes: u64,
    interval: Duration,
    abort: TaskAbort,
}

impl ProcessMonitor {
    pub fn new(pid: u32, limit_bytes: u64, interval: Duration, abort: TaskAbort) -> Self {
        Self {
            pid,
            limit_bytes,
            interval,
            abort,
        }
    }

    pub async fn run<F>(self, on_killed: F)
    where
        F: FnOnce(&'static str) + Send,
    {
        if self.limit_bytes == 0 {
            return;
        }
        loop {
            tokio::select! {
                _ = self.abort.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match rss_bytes(self.pid) {
                None => return,
                Some(rss) if rss > self.limit_bytes => {
                    tracing::warn!(
                        event = "tether.monitor.memory_kill",
                        pid = self.pid,
                        rss_bytes = rss,
                        limit_bytes = self.limit_bytes,
                        "child exceeded memory limit, killing"
                    );
                    kill_process(self.pid);
                    self.abort.abort(AbortReason::MemoryExceeded);
                    on_killed("memory");
                    return;
                }
                Some(_) => {}
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn rss_bytes(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages = parse_statm_rss_pages(&contents)?;
    Some(pages * page_size_bytes())
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes(_pid: u32) -> Option<u64> {
    None
}

/// Second field of `/proc/{pid}/statm` is the resident set in pages.
fn parse_statm_rss_pages(contents: &str) -> Option<u64> {
    contents.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(target_os = "linux")]
fn page_size_bytes() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

fn kill_process(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statm_rss_is_the_second_field() {
        assert_eq!(parse_statm_rss_pages("12345 678 90 1 0 2 0\n"), Some(678));
        assert_eq!(parse_statm_rss_pages(""), None);
        assert_eq!(parse_statm_rss_pages("only-one"), None);
    }

    #[tokio::test]
    async fn zero_limit_disables_monitoring() {
        let abort = TaskAbort::new();
        let monitor = ProcessMonitor::new(1, 0, Duration::from_millis(1), abort.clone());
        // Returns immediately without sampling pid 1.
        monitor.run(|_| panic!("should not kill")).await;
        assert!(!abort.is_aborted());
    }

    #[tokio::test]
    async fn monitor_exits_when_task_aborts() {
        let abort = TaskAbort::new();
        let monitor = ProcessMonitor::new(
            u32::MAX,
            1024,
            Duration::from_secs(3600),
            abort.clone(),
        );
        let handle = tokio::spawn(monitor.run(|_| {}));
        abort.abort(AbortReason::Shutdown);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not observe abort")
            .unwrap();
    }
}
