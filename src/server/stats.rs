//! Server-Wide Statistics
//!
//! Counters are shared by every worker thread. All of them are atomics with
//! relaxed ordering: they are telemetry, never used to synchronise anything.
//! Per-command counters live in a `DashMap` keyed by the canonical command name.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of latency histogram buckets. Bucket `i` holds durations below
/// `2^i` microseconds; the last bucket holds everything slower.
pub const LATENCY_BUCKETS: usize = 24;

/// Call count and latency distribution for one command.
#[derive(Debug, Default)]
pub struct CommandStats {
    calls: AtomicU64,
    usec: AtomicU64,
    histogram: [AtomicU64; LATENCY_BUCKETS],
}

/// Point-in-time copy of [`CommandStats`] for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatsSnapshot {
    pub name: &'static str,
    pub calls: u64,
    pub usec: u64,
    pub histogram: Vec<u64>,
}

impl CommandStatsSnapshot {
    pub fn usec_per_call(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.usec as f64 / self.calls as f64
        }
    }
}

/// Statistics for the whole server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently open sessions
    pub active_connections: AtomicU64,
    /// Total commands executed
    pub commands_processed: AtomicU64,
    /// Protocol bytes consumed from clients
    pub bytes_in: AtomicU64,
    /// Bytes queued for clients
    pub bytes_out: AtomicU64,
    commands: DashMap<&'static str, CommandStats>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn incr_inbound_bytes(&self, count: usize) {
        self.bytes_in.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn incr_outbound_bytes(&self, count: usize) {
        self.bytes_out.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Counts one call of `command`.
    pub fn incr_calls(&self, command: &'static str) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        self.with_command(command, |stats| {
            stats.calls.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Records one execution of `command` that took `usec` microseconds.
    pub fn record_latency(&self, command: &'static str, usec: u64) {
        self.with_command(command, |stats| {
            stats.usec.fetch_add(usec, Ordering::Relaxed);
            stats.histogram[latency_bucket(usec)].fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn calls(&self, command: &str) -> u64 {
        self.commands
            .get(command)
            .map(|s| s.calls.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of every command seen so far, sorted by name.
    pub fn command_stats(&self) -> Vec<CommandStatsSnapshot> {
        let mut out: Vec<_> = self
            .commands
            .iter()
            .map(|entry| CommandStatsSnapshot {
                name: *entry.key(),
                calls: entry.calls.load(Ordering::Relaxed),
                usec: entry.usec.load(Ordering::Relaxed),
                histogram: entry
                    .histogram
                    .iter()
                    .map(|b| b.load(Ordering::Relaxed))
                    .collect(),
            })
            .collect();
        out.sort_by_key(|s| s.name);
        out
    }

    fn with_command(&self, command: &'static str, f: impl FnOnce(&CommandStats)) {
        // Read path first so steady-state traffic never takes a shard write lock.
        if let Some(stats) = self.commands.get(command) {
            f(&stats);
            return;
        }
        f(&self.commands.entry(command).or_default());
    }
}

#[inline]
fn latency_bucket(usec: u64) -> usize {
    ((u64::BITS - usec.leading_zeros()) as usize).min(LATENCY_BUCKETS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_bucket() {
        assert_eq!(latency_bucket(0), 0);
        assert_eq!(latency_bucket(1), 1);
        assert_eq!(latency_bucket(3), 2);
        assert_eq!(latency_bucket(1024), 11);
        assert_eq!(latency_bucket(u64::MAX), LATENCY_BUCKETS - 1);
    }

    #[test]
    fn test_calls_and_latency() {
        let stats = ServerStats::new();
        stats.incr_calls("get");
        stats.incr_calls("get");
        stats.incr_calls("set");
        stats.record_latency("get", 10);
        stats.record_latency("get", 30);

        assert_eq!(stats.calls("get"), 2);
        assert_eq!(stats.calls("set"), 1);
        assert_eq!(stats.calls("del"), 0);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 3);

        let snapshot = stats.command_stats();
        assert_eq!(snapshot[0].name, "get");
        assert_eq!(snapshot[0].usec, 40);
        assert_eq!(snapshot[0].usec_per_call(), 20.0);
        assert_eq!(snapshot[0].histogram.iter().sum::<u64>(), 2);
        assert_eq!(snapshot[1].name, "set");
    }

    #[test]
    fn test_connection_counters() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 2);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
    }
}
