//! Storage Engine Module
//!
//! The storage engine is the collaborator commands execute against. The
//! connection core only decides whether and when a command runs; how it
//! mutates data is up to this module.
//!
//! - **Sharded Storage**: 64 independent shards reduce lock contention
//! - **TTL Support**: lazy expiry on access plus a background sweeper
//!
//! ## Example
//!
//! ```
//! use sparkkv::storage::{SetCondition, StorageEngine};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//! engine.set(
//!     Bytes::from("session"),
//!     Bytes::from("token123"),
//!     Some(Duration::from_secs(3600)),
//!     SetCondition::Always,
//! );
//! assert_eq!(engine.incr_by(b"visits", 1), Ok(1));
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{glob_match, SetCondition, StorageEngine, StorageError, StorageStats};
pub use expiry::{ExpirySweeper, DEFAULT_SWEEP_INTERVAL};
