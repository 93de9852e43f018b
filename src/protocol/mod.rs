//! RESP Protocol Implementation
//!
//! ## Modules
//!
//! - `decoder`: resumable state machine turning inbound bytes into command token lists
//! - `types`: the `RespValue` reply type and its wire encoding
//!
//! ## Example
//!
//! ```
//! use sparkkv::protocol::{RequestDecoder, RespValue};
//! use sparkkv::server::ServerStats;
//! use bytes::BytesMut;
//!
//! let stats = ServerStats::new();
//! let mut decoder = RequestDecoder::default();
//! let mut inbound = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n"[..]);
//! decoder.decode(&mut inbound, &stats).unwrap();
//! assert_eq!(decoder.take_batch().len(), 1);
//!
//! let reply = RespValue::error("ERR unknown command").encode();
//! assert_eq!(reply, &b"-ERR unknown command\r\n"[..]);
//! ```

pub mod decoder;
pub mod types;

// Re-export commonly used types for convenience
pub use decoder::{CommandTokens, DecodeError, DecodeState, DecoderLimits, RequestDecoder};
pub use types::RespValue;
