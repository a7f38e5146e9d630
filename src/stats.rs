//! Process-wide runtime counters.
//!
//! All fields are plain atomics; updates happen inline on the data path
//! (never through channels) so the periodic logger sees real-time values.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Runtime metrics for the tunnel. Safe for concurrent access.
#[derive(Debug)]
pub struct Stats {
    /// Currently active relay connections.
    pub active_conns: AtomicI64,
    /// Total connections handled.
    pub total_conns: AtomicU64,
    /// Total bytes sent through relays.
    pub bytes_sent: AtomicU64,
    /// Total bytes received through relays.
    pub bytes_recv: AtomicU64,
    /// Total reconnect attempts by pool workers.
    pub reconnects: AtomicU64,
    /// Failed dial attempts.
    pub failed_dials: AtomicU64,
    /// Currently active mux sessions (client pool or server registry).
    pub active_sessions: AtomicI64,
}

/// The singleton stats instance.
pub static GLOBAL_STATS: Stats = Stats::new();

static STARTED_AT: OnceLock<Instant> = OnceLock::new();

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub active_conns: i64,
    pub total_conns: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub reconnects: u64,
    pub failed_dials: u64,
    pub active_sessions: i64,
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            active_conns: AtomicI64::new(0),
            total_conns: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            failed_dials: AtomicU64::new(0),
            active_sessions: AtomicI64::new(0),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_conns: self.active_conns.load(Ordering::Relaxed),
            total_conns: self.total_conns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            failed_dials: self.failed_dials.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let snap = self.snapshot();
        let uptime = STARTED_AT
            .get()
            .map(|s| s.elapsed())
            .unwrap_or_default()
            .as_secs();
        log::info!(
            "[STATS] uptime={}s conns={}/{} sessions={} sent={}MB recv={}MB reconnects={} fails={}",
            uptime,
            snap.active_conns,
            snap.total_conns,
            snap.active_sessions,
            snap.bytes_sent / (1024 * 1024),
            snap.bytes_recv / (1024 * 1024),
            snap.reconnects,
            snap.failed_dials,
        );
    }
}

/// Records process start time; call once before the data plane comes up.
pub fn mark_started() {
    let _ = STARTED_AT.set(Instant::now());
}

/// Spawns a background task that logs a counter summary on an interval.
pub fn start_stats_logger(interval: Duration, cancel: CancellationToken) {
    let interval = if interval.is_zero() {
        Duration::from_secs(60)
    } else {
        interval
    };
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await; // immediate first tick carries no information
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => GLOBAL_STATS.log_stats(),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_monotonic() {
        let stats = Stats::new();
        for i in 1..=100u64 {
            stats.bytes_sent.fetch_add(i, Ordering::Relaxed);
            stats.total_conns.fetch_add(1, Ordering::Relaxed);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, (1..=100).sum::<u64>());
        assert_eq!(snap.total_conns, 100);
    }

    #[test]
    fn test_active_counts_can_decrement() {
        let stats = Stats::new();
        stats.active_sessions.fetch_add(3, Ordering::Relaxed);
        stats.active_sessions.fetch_add(-1, Ordering::Relaxed);
        assert_eq!(stats.snapshot().active_sessions, 2);
    }
}
