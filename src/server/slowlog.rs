//! Slow Log
//!
//! Keeps the most recent commands whose execution took at least the configured
//! threshold. The log is a bounded ring: once full, recording a new entry evicts
//! the oldest one.

use crate::protocol::RespValue;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Arguments beyond this count are folded into a single summary argument.
const SLOWLOG_MAX_ARGC: usize = 32;

/// Arguments longer than this are truncated.
const SLOWLOG_MAX_ARG_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowLogEntry {
    pub id: u64,
    /// Unix time in seconds when the entry was recorded
    pub timestamp: u64,
    pub duration_us: u64,
    pub args: Vec<Bytes>,
}

impl SlowLogEntry {
    fn to_resp(&self) -> RespValue {
        RespValue::array(vec![
            RespValue::integer(self.id as i64),
            RespValue::integer(self.timestamp as i64),
            RespValue::integer(self.duration_us as i64),
            RespValue::bulk_array(self.args.iter().cloned()),
        ])
    }
}

#[derive(Debug)]
pub struct SlowLog {
    entries: Mutex<VecDeque<SlowLogEntry>>,
    next_id: AtomicU64,
    /// Microseconds; negative disables recording
    threshold_us: AtomicI64,
    max_len: AtomicUsize,
}

impl SlowLog {
    pub fn new(threshold_us: i64, max_len: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_len.min(1024))),
            next_id: AtomicU64::new(0),
            threshold_us: AtomicI64::new(threshold_us),
            max_len: AtomicUsize::new(max_len),
        }
    }

    /// Records `args` when `duration_us` reaches the threshold.
    ///
    /// Returns true when an entry was recorded.
    pub fn push_if_needed(&self, args: &[Bytes], duration_us: u64) -> bool {
        let threshold = self.threshold_us.load(Ordering::Relaxed);
        if threshold < 0 || duration_us < threshold as u64 {
            return false;
        }
        let max_len = self.max_len.load(Ordering::Relaxed);
        if max_len == 0 {
            return false;
        }

        let entry = SlowLogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: unix_now(),
            duration_us,
            args: truncate_args(args),
        };

        let mut entries = self.entries.lock();
        entries.push_front(entry);
        entries.truncate(max_len);
        true
    }

    /// The `count` most recent entries, newest first.
    pub fn latest(&self, count: usize) -> Vec<SlowLogEntry> {
        self.entries.lock().iter().take(count).cloned().collect()
    }

    /// Encodes the `count` most recent entries as a `SLOWLOG GET` reply.
    pub fn latest_resp(&self, count: usize) -> RespValue {
        RespValue::array(self.latest(count).iter().map(SlowLogEntry::to_resp).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    pub fn set_threshold(&self, threshold_us: i64) {
        self.threshold_us.store(threshold_us, Ordering::Relaxed);
    }
}

fn truncate_args(args: &[Bytes]) -> Vec<Bytes> {
    let keep = if args.len() > SLOWLOG_MAX_ARGC {
        SLOWLOG_MAX_ARGC - 1
    } else {
        args.len()
    };

    let mut out: Vec<Bytes> = args[..keep]
        .iter()
        .map(|arg| {
            if arg.len() > SLOWLOG_MAX_ARG_LEN {
                let more = arg.len() - SLOWLOG_MAX_ARG_LEN;
                let mut truncated = arg.slice(..SLOWLOG_MAX_ARG_LEN).to_vec();
                truncated.extend_from_slice(format!("... ({} more bytes)", more).as_bytes());
                Bytes::from(truncated)
            } else {
                arg.clone()
            }
        })
        .collect();

    if keep < args.len() {
        out.push(Bytes::from(format!(
            "... ({} more arguments)",
            args.len() - keep
        )));
    }
    out
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
