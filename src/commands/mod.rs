//! Command Module
//!
//! Commands form a closed set ([`Command`]). Each one is described by a
//! [`CommandSpec`] in the [`CommandRegistry`]: arity, write classification and
//! an argument parser. The dispatcher resolves the spec, validates the token
//! count, parses the arguments into a `Command` and executes it against the
//! [`ServerContext`](crate::server::ServerContext).
//!
//! ```text
//! tokens ──> registry.lookup ──> arity ──> spec.parse ──> Command::execute
//!                                                              │
//!                                                              ▼
//!                                                    Option<RespValue>
//! ```
//!
//! ## Supported Commands
//!
//! ### Connection
//! - `AUTH token`, `PING [message]`, `ECHO message`, `QUIT`
//!
//! ### Strings and Keys
//! - `GET`, `SET key value [EX s|PX ms] [NX|XX]`, `DEL`, `EXISTS`
//! - `INCR`, `INCRBY`, `DECR`, `DECRBY`, `APPEND`, `STRLEN`
//! - `MGET`, `MSET`, `EXPIRE`, `TTL`, `KEYS`, `DBSIZE`, `FLUSHDB`
//!
//! ### Pub/Sub
//! - `SUBSCRIBE`, `UNSUBSCRIBE`, `PUBLISH`
//!
//! ### Server and Replication
//! - `SLOWLOG GET|LEN|RESET`, `INFO [section]`, `SLAVEOF host port|NO ONE`
//! - `REPLCONF`, `_FETCH_FILE name` (replication links only)

pub mod handler;
pub mod registry;

pub use handler::{Command, SlowLogAction};
pub use registry::{CommandFlags, CommandRegistry, CommandSpec, ParseFn};

use crate::storage::StorageError;
use thiserror::Error;

/// Per-command failures visible to the client.
///
/// `Display` renders the exact text written after the error sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("NOAUTH Authentication required.")]
    AuthenticationRequired,

    #[error("ERR unknown command")]
    UnknownCommand,

    #[error("ERR wrong number of arguments")]
    WrongArity,

    /// Argument parsing failed; carries the full reply line.
    #[error("{0}")]
    Parse(String),

    #[error("READONLY You can't write against a read only slave.")]
    ReadOnly,

    #[error("replication in progress")]
    Loading,

    /// The command ran and failed.
    #[error("ERR {0}")]
    Execution(String),
}

impl CommandError {
    /// Builds a parse error with the conventional `ERR` prefix.
    pub fn parse(msg: impl std::fmt::Display) -> Self {
        CommandError::Parse(format!("ERR {}", msg))
    }

    pub fn syntax() -> Self {
        Self::parse("syntax error")
    }

    pub fn not_integer() -> Self {
        Self::parse("value is not an integer or out of range")
    }
}

impl From<StorageError> for CommandError {
    fn from(err: StorageError) -> Self {
        CommandError::Execution(err.to_string())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::Execution(err.to_string())
    }
}
