//! Best-effort host health snapshot for heartbeats.
//!
//! Reads `/proc/loadavg`, `/proc/meminfo`, and `/proc/uptime` on Linux.
//! Hosts without these sources produce `None` and the heartbeat simply
//! omits the snapshot.

use tether_core::SystemInfo;

pub fn snapshot() -> Option<SystemInfo> {
    #[cfg(target_os = "linux")]
    {
        let load_avg = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .as_deref()
            .and_then(parse_loadavg);
        let mem = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .as_deref()
            .and_then(parse_meminfo);
        let uptime_secs = std::fs::read_to_string("/proc/uptime")
            .ok()
            .as_deref()
            .and_then(parse_uptime);

        if load_avg.is_none() && mem.is_none() && uptime_secs.is_none() {
            return None;
        }
        let (mem_total_bytes, mem_available_bytes) = match mem {
            Some((total, available)) => (Some(total), Some(available)),
            None => (None, None),
        };
        Some(SystemInfo {
            load_avg,
            mem_total_bytes,
            mem_available_bytes,
            uptime_secs,
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn parse_loadavg(contents: &str) -> Option<[f64; 3]> {
    let mut fields = contents.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    let fifteen = fields.next()?.parse().ok()?;
    Some([one, five, fifteen])
}

/// Returns (total, available) in bytes. `/proc/meminfo` reports kB.
fn parse_meminfo(contents: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        let (key, rest) = line.split_once(':')?;
        let kb: u64 = rest
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse()
            .ok()?;
        match key {
            "MemTotal" => total = Some(kb * 1024),
            "MemAvailable" => available = Some(kb * 1024),
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    Some((total?, available?))
}

fn parse_uptime(contents: &str) -> Option<u64> {
    let first = contents.split_whitespace().next()?;
    let secs: f64 = first.parse().ok()?;
    Some(secs as u64)
}
