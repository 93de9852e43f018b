//! Shared Server Context
//!
//! Everything a session or the dispatcher needs beyond its own state lives
//! here, behind one `Arc<ServerContext>` handed to every worker.
//!
//! ## Concurrency contract
//!
//! Each collaborator is safe to use from any worker thread without external
//! locking:
//!
//! | Field      | Synchronisation                     |
//! |------------|-------------------------------------|
//! | `config`   | immutable after startup             |
//! | `storage`  | sharded `parking_lot::RwLock`s      |
//! | `stats`    | atomics + `DashMap`                 |
//! | `status`   | atomics + `parking_lot::RwLock`     |
//! | `slowlog`  | `parking_lot::Mutex` around a ring  |
//! | `pubsub`   | `DashMap`                           |
//! | `commands` | immutable after startup             |

use crate::commands::CommandRegistry;
use crate::config::Config;
use crate::connection::SessionId;
use crate::server::{PubSubRegistry, ServerStats, SlowLog};
use crate::storage::StorageEngine;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Replication and loading state of the whole server.
#[derive(Debug, Default)]
pub struct ServerStatus {
    loading: AtomicBool,
    replica: AtomicBool,
    master: RwLock<Option<(String, u16)>>,
}

impl ServerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a bulk load or restore is in progress.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }

    /// True while this server follows a master.
    pub fn is_replica(&self) -> bool {
        self.replica.load(Ordering::Acquire)
    }

    /// Starts following `host:port`.
    pub fn replicate_from(&self, host: String, port: u16) {
        *self.master.write() = Some((host, port));
        self.replica.store(true, Ordering::Release);
    }

    /// Stops following any master.
    pub fn promote(&self) {
        *self.master.write() = None;
        self.replica.store(false, Ordering::Release);
    }

    pub fn master(&self) -> Option<(String, u16)> {
        self.master.read().clone()
    }
}

/// Handles shared by every worker and session.
#[derive(Debug)]
pub struct ServerContext {
    pub config: Config,
    pub storage: Arc<StorageEngine>,
    pub stats: ServerStats,
    pub status: ServerStatus,
    pub slowlog: SlowLog,
    pub pubsub: PubSubRegistry,
    pub commands: CommandRegistry,
    started_at: Instant,
    next_session_id: AtomicU64,
}

impl ServerContext {
    pub fn new(config: Config, storage: Arc<StorageEngine>) -> Self {
        let slowlog = SlowLog::new(config.slowlog_log_slower_than, config.slowlog_max_len);
        Self {
            config,
            storage,
            stats: ServerStats::new(),
            status: ServerStatus::new(),
            slowlog,
            pubsub: PubSubRegistry::new(),
            commands: CommandRegistry::with_builtin_commands(),
            started_at: Instant::now(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Allocates a process-unique session id.
    pub fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let status = ServerStatus::new();
        assert!(!status.is_loading());
        assert!(!status.is_replica());

        status.set_loading(true);
        assert!(status.is_loading());

        status.replicate_from("10.0.0.1".into(), 6379);
        assert!(status.is_replica());
        assert_eq!(status.master(), Some(("10.0.0.1".to_string(), 6379)));

        status.promote();
        assert!(!status.is_replica());
        assert_eq!(status.master(), None);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let ctx = ServerContext::new(Config::default(), Arc::new(StorageEngine::new()));
        let a = ctx.next_session_id();
        let b = ctx.next_session_id();
        assert_ne!(a, b);
    }
}
