//! Connection Module
//!
//! Everything between an accepted socket and command execution.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── worker thread ─────────────────────────┐
//! │                                                                │
//! │   serve_connection (one task per socket, LocalSet)             │
//! │        │ on_read / on_event / deliver / on_write_complete      │
//! │        ▼                                                       │
//! │   ┌──────────────────────────────────────────────┐             │
//! │   │ Worker (owns sessions)                       │             │
//! │   │                                              │             │
//! │   │   Session ── RequestDecoder ── batch         │             │
//! │   │      │                           │           │             │
//! │   │      │                           ▼           │             │
//! │   │      │◄──────── replies ─── Dispatcher ──────┼──> commands │
//! │   └──────┼───────────────────────────────────────┘             │
//! │          ▼                                                     │
//! │     outbound queue ──> socket                                  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sessions of one worker never run concurrently with each other: their
//! tasks share the worker thread, and command execution is synchronous
//! inside a read event.

pub mod dispatcher;
pub mod handler;
pub mod session;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use handler::{serve_connection, write_outbound, ConnectionError};
pub use session::{Outbound, ReplicationRole, Session, SessionFlags, SessionId};
pub use worker::{TransportEvent, Worker};
