//! # SparkKV - Connection and Command-Dispatch Core for a Redis-Compatible Server
//!
//! SparkKV accepts client connections speaking the Redis multi-bulk request
//! protocol, frames requests incrementally as bytes arrive, and runs each
//! framed command through a validation and execution pipeline before
//! replying in RESP.
//!
//! ## Features
//!
//! - **Resumable decoding**: partial frames suspend without consuming input
//!   and resume on the next read, whatever the chunk boundaries
//! - **Pipelining**: every command framed by one read executes in order
//! - **Gates**: authentication, arity, read-only replicas and bulk loading
//! - **Worker threads**: each session belongs to one worker thread and never
//!   runs concurrently with the other sessions of that worker
//! - **Telemetry**: byte counters, per-command calls and latency histograms,
//!   and a slow-log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              SparkKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐  round   ┌──────────────────────────────────────────┐  │
//! │  │ TCP Server  │  robin   │ Worker thread (xN)                       │  │
//! │  │ (acceptor)  │────────> │  Session ─> RequestDecoder ─> Dispatcher │  │
//! │  └─────────────┘          └───────────────────────────┬──────────────┘  │
//! │                                                       │                 │
//! │                                                       ▼                 │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │ ServerContext                                                    │   │
//! │  │  Config · CommandRegistry · StorageEngine · ServerStats          │   │
//! │  │  ServerStatus · SlowLog · PubSubRegistry                         │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use sparkkv::config::Config;
//! use sparkkv::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::new(Config::default());
//!     let listener = server.bind().await?;
//!     server
//!         .run(listener, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: resumable request decoder and RESP reply encoding
//! - [`connection`]: sessions, the batch dispatcher, workers and the socket loop
//! - [`commands`]: command table and the supported command set
//! - [`server`]: shared server context, statistics, slow-log, pub/sub, bootstrap
//! - [`storage`]: sharded key-value store with TTL support
//! - [`config`]: TOML configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::Config;
pub use connection::{Dispatcher, Session, Worker};
pub use protocol::{DecodeError, RequestDecoder, RespValue};
pub use server::{Server, ServerContext};
pub use storage::StorageEngine;

/// The default port SparkKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host SparkKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Namespace granted by the admin password
pub const ADMIN_NAMESPACE: &str = "__namespace";

/// Version of SparkKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
