//! Resumable Multi-Bulk Request Decoder
//!
//! Requests arrive as multi-bulk arrays:
//!
//! ```text
//! *<count>\r\n
//! $<len>\r\n<len bytes>\r\n      (repeated <count> times)
//! ```
//!
//! TCP delivers these bytes in arbitrary pieces. A read may end in the middle
//! of a header line, in the middle of a bulk payload, or between the payload
//! and its terminator. The decoder is therefore an explicit state machine that
//! remembers where it stopped and picks up at exactly that point on the next
//! call:
//!
//! ```text
//!          ┌────────────────────┐ count <= 0 (empty command)
//!          │ ExpectArrayHeader  │◄─────────────┐
//!          └─────────┬──────────┘──────────────┘
//!                    │ *<count>
//!                    ▼
//!          ┌────────────────────┐
//!     ┌───►│ ExpectBulkHeader   │
//!     │    └─────────┬──────────┘
//!     │              │ $<len>
//!     │              ▼
//!     │    ┌────────────────────┐  last element
//!     └────│ ExpectBulkBody     │──────────────► ExpectArrayHeader
//!  more    └────────────────────┘                (command completed)
//! ```
//!
//! Running out of input is not an error: [`RequestDecoder::decode`] returns
//! `Ok(())` and leaves every byte it could not use in the buffer. Nothing of a
//! partially available bulk body is consumed.
//!
//! Completed commands accumulate in a batch that the dispatcher drains with
//! [`RequestDecoder::take_batch`].

use crate::config::Config;
use crate::protocol::types::{prefix, CRLF};
use crate::server::ServerStats;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Default upper bound on the element count of one command.
pub const DEFAULT_MAX_MULTIBULK_LEN: u64 = 1024 * 1024;

/// Default upper bound on a single bulk payload (512 MB, same as Redis).
pub const DEFAULT_MAX_BULK_LEN: u64 = 512 * 1024 * 1024;

/// Default upper bound on a header line, terminator excluded.
pub const DEFAULT_MAX_HEADER_LINE: usize = 64 * 1024;

/// Token vectors are pre-sized up to this many elements, whatever the peer declares.
const MAX_PREALLOCATED_TOKENS: usize = 1024;

/// One fully framed command: the command name followed by its arguments.
pub type CommandTokens = Vec<Bytes>;

/// Framing violations. Each is fatal for the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected '{expected}', got '{found}'")]
    UnexpectedPrefix { expected: char, found: char },

    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("header line exceeds {max} bytes")]
    HeaderTooLong { max: usize },

    #[error("bulk payload not followed by CRLF")]
    MissingTerminator,
}

/// Bounds applied to peer-declared sizes before anything is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
    pub max_multibulk_len: u64,
    pub max_bulk_len: u64,
    pub max_header_line: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_multibulk_len: DEFAULT_MAX_MULTIBULK_LEN,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_header_line: DEFAULT_MAX_HEADER_LINE,
        }
    }
}

impl From<&Config> for DecoderLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_multibulk_len: config.max_multibulk_len,
            max_bulk_len: config.max_bulk_len,
            max_header_line: config.max_header_line,
        }
    }
}

/// Where the decoder resumes on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    ExpectArrayHeader,
    ExpectBulkHeader,
    ExpectBulkBody,
}

/// Incremental decoder for multi-bulk requests.
///
/// # Example
///
/// ```
/// use sparkkv::protocol::RequestDecoder;
/// use sparkkv::server::ServerStats;
/// use bytes::BytesMut;
///
/// let stats = ServerStats::new();
/// let mut decoder = RequestDecoder::default();
/// let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nf"[..]);
///
/// decoder.decode(&mut buf, &stats).unwrap();
/// assert_eq!(decoder.pending_commands(), 0);
///
/// buf.extend_from_slice(b"oo\r\n");
/// decoder.decode(&mut buf, &stats).unwrap();
/// let batch = decoder.take_batch();
/// assert_eq!(batch, vec![vec!["GET", "foo"]]);
/// ```
#[derive(Debug)]
pub struct RequestDecoder {
    state: DecodeState,

    /// Elements of the in-progress command not yet read.
    pending_elements: i64,

    /// Element count declared by the in-progress command's array header.
    declared_elements: i64,

    /// Payload length of the bulk currently being read.
    pending_bulk_len: usize,

    /// Tokens of the in-progress command.
    current: CommandTokens,

    /// Commands framed but not yet dispatched, oldest first.
    completed: Vec<CommandTokens>,

    limits: DecoderLimits,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new(DecoderLimits::default())
    }
}

impl RequestDecoder {
    pub fn new(limits: DecoderLimits) -> Self {
        Self {
            state: DecodeState::ExpectArrayHeader,
            pending_elements: 0,
            declared_elements: 0,
            pending_bulk_len: 0,
            current: Vec::new(),
            completed: Vec::new(),
            limits,
        }
    }

    /// Consumes as much of `buf` as forms complete protocol elements.
    ///
    /// Returns once the current state needs more bytes than `buf` holds. Every
    /// consumed byte is accounted as inbound traffic in `stats`.
    pub fn decode(&mut self, buf: &mut BytesMut, stats: &ServerStats) -> Result<(), DecodeError> {
        loop {
            debug_assert_eq!(
                self.current.len() as i64 + self.pending_elements,
                self.declared_elements,
            );

            match self.state {
                DecodeState::ExpectArrayHeader => {
                    let Some(line) = self.read_line(buf)? else {
                        return Ok(());
                    };
                    stats.incr_inbound_bytes(line.len());

                    let count = parse_header(
                        header_body(&line),
                        prefix::ARRAY,
                        DecodeError::InvalidMultibulkLength,
                    )?;
                    if count > 0 && count as u64 > self.limits.max_multibulk_len {
                        return Err(DecodeError::InvalidMultibulkLength);
                    }

                    if count <= 0 {
                        self.completed.push(Vec::new());
                        continue;
                    }

                    self.declared_elements = count;
                    self.pending_elements = count;
                    self.current = Vec::with_capacity((count as usize).min(MAX_PREALLOCATED_TOKENS));
                    self.state = DecodeState::ExpectBulkHeader;
                }
                DecodeState::ExpectBulkHeader => {
                    let Some(line) = self.read_line(buf)? else {
                        return Ok(());
                    };
                    stats.incr_inbound_bytes(line.len());

                    let len = parse_header(
                        header_body(&line),
                        prefix::BULK_STRING,
                        DecodeError::InvalidBulkLength,
                    )?;
                    if len < 0 || len as u64 > self.limits.max_bulk_len {
                        return Err(DecodeError::InvalidBulkLength);
                    }

                    self.pending_bulk_len = len as usize;
                    self.state = DecodeState::ExpectBulkBody;
                }
                DecodeState::ExpectBulkBody => {
                    let needed = self.pending_bulk_len + CRLF.len();
                    if buf.len() < needed {
                        return Ok(());
                    }

                    let token = buf.split_to(self.pending_bulk_len).freeze();
                    let terminator = buf.split_to(CRLF.len());
                    if &terminator[..] != CRLF {
                        return Err(DecodeError::MissingTerminator);
                    }
                    stats.incr_inbound_bytes(needed);

                    self.current.push(token);
                    self.pending_elements -= 1;

                    if self.pending_elements <= 0 {
                        self.completed.push(std::mem::take(&mut self.current));
                        self.declared_elements = 0;
                        self.pending_elements = 0;
                        self.state = DecodeState::ExpectArrayHeader;
                    } else {
                        self.state = DecodeState::ExpectBulkHeader;
                    }
                }
            }
        }
    }

    /// Removes and returns every completed command, oldest first.
    ///
    /// The internal batch is empty afterwards, so a command is handed out
    /// exactly once.
    pub fn take_batch(&mut self) -> Vec<CommandTokens> {
        std::mem::take(&mut self.completed)
    }

    /// Number of completed commands awaiting dispatch.
    pub fn pending_commands(&self) -> usize {
        self.completed.len()
    }

    /// True while a command has been started but not fully received.
    pub fn is_mid_command(&self) -> bool {
        self.state != DecodeState::ExpectArrayHeader
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Splits one CRLF-terminated line off the front of `buf`, terminator included.
    fn read_line(&self, buf: &mut BytesMut) -> Result<Option<BytesMut>, DecodeError> {
        let max = self.limits.max_header_line;
        match find_crlf(buf) {
            Some(pos) if pos > max => Err(DecodeError::HeaderTooLong { max }),
            Some(pos) => Ok(Some(buf.split_to(pos + CRLF.len()))),
            None if buf.len() > max + 1 => Err(DecodeError::HeaderTooLong { max }),
            None => Ok(None),
        }
    }
}

/// Strips the terminator from a line returned by `read_line`.
#[inline]
fn header_body(line: &[u8]) -> &[u8] {
    &line[..line.len() - CRLF.len()]
}

/// Parses `<prefix><digits>`. An empty line or empty digit run counts as zero.
fn parse_header(body: &[u8], expected: u8, invalid: DecodeError) -> Result<i64, DecodeError> {
    let Some((&found, digits)) = body.split_first() else {
        return Ok(0);
    };
    if found != expected {
        return Err(DecodeError::UnexpectedPrefix {
            expected: expected as char,
            found: found as char,
        });
    }
    if digits.is_empty() {
        return Ok(0);
    }

    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(invalid)
}

/// Finds the position of a strict CRLF pair.
///
/// Returns the position of `\r`. A lone `\n` is not a terminator.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    const GET_FOO: &[u8] = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";

    fn decode_all(input: &[u8]) -> Vec<CommandTokens> {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(input);
        decoder.decode(&mut buf, &stats).unwrap();
        decoder.take_batch()
    }

    fn decode_in_chunks(input: &[u8], chunks: &[usize]) -> Vec<CommandTokens> {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::new();
        let mut batch = Vec::new();
        let mut offset = 0;
        for &len in chunks {
            buf.extend_from_slice(&input[offset..offset + len]);
            offset += len;
            decoder.decode(&mut buf, &stats).unwrap();
            batch.extend(decoder.take_batch());
        }
        assert_eq!(offset, input.len());
        batch
    }

    #[test]
    fn test_decode_get_foo() {
        let batch = decode_all(GET_FOO);
        assert_eq!(batch, vec![vec![Bytes::from("GET"), Bytes::from("foo")]]);
    }

    #[test]
    fn test_every_split_point_yields_same_tokens() {
        let input = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$4\r\nAriz\r\n";
        let expected = decode_all(input);
        for split in 0..=input.len() {
            let batch = decode_in_chunks(input, &[split, input.len() - split]);
            assert_eq!(batch, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut input = GET_FOO.to_vec();
        input.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        let chunks = vec![1; input.len()];
        let batch = decode_in_chunks(&input, &chunks);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], vec![Bytes::from("GET"), Bytes::from("foo")]);
        assert_eq!(batch[1], vec![Bytes::from("PING")]);
    }

    #[test]
    fn test_truncated_frame_resumes_once() {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(&GET_FOO[..15]);

        decoder.decode(&mut buf, &stats).unwrap();
        assert_eq!(decoder.pending_commands(), 0);
        assert!(decoder.is_mid_command());

        buf.extend_from_slice(&GET_FOO[15..]);
        decoder.decode(&mut buf, &stats).unwrap();
        assert_eq!(decoder.take_batch().len(), 1);

        // Nothing left to hand out twice.
        decoder.decode(&mut buf, &stats).unwrap();
        assert!(decoder.take_batch().is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_body_is_not_consumed() {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(&b"*1\r\n$5\r\nhel"[..]);

        decoder.decode(&mut buf, &stats).unwrap();
        assert_eq!(decoder.state(), DecodeState::ExpectBulkBody);
        assert_eq!(&buf[..], b"hel");

        // Payload present but terminator still missing.
        buf.extend_from_slice(b"lo\r");
        decoder.decode(&mut buf, &stats).unwrap();
        assert_eq!(&buf[..], b"hello\r");

        buf.extend_from_slice(b"\n");
        decoder.decode(&mut buf, &stats).unwrap();
        assert_eq!(decoder.take_batch(), vec![vec![Bytes::from("hello")]]);
    }

    #[test]
    fn test_pipelined_commands_keep_order() {
        let input = b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n*1\r\n$6\r\nDBSIZE\r\n";
        let batch = decode_all(input);
        let names: Vec<_> = batch.iter().map(|c| c[0].clone()).collect();
        assert_eq!(names, vec!["PING", "ECHO", "DBSIZE"]);
    }

    #[test]
    fn test_zero_and_empty_counts_complete_immediately() {
        let batch = decode_all(b"*0\r\n*\r\n\r\n*-1\r\n");
        assert_eq!(batch, vec![Vec::<Bytes>::new(); 4]);
    }

    #[test]
    fn test_empty_and_binary_bulk() {
        let batch = decode_all(b"*2\r\n$0\r\n\r\n$5\r\nhel\x00o\r\n");
        assert_eq!(batch, vec![vec![Bytes::new(), Bytes::from(&b"hel\x00o"[..])]]);
    }

    #[test]
    fn test_payload_may_contain_crlf() {
        let batch = decode_all(b"*1\r\n$4\r\n\r\n\r\n\r\n");
        assert_eq!(batch, vec![vec![Bytes::from("\r\n\r\n")]]);
    }

    #[test]
    fn test_inbound_bytes_match_consumed() {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(GET_FOO);
        buf.extend_from_slice(b"*1\r\n$4\r\nPI");
        decoder.decode(&mut buf, &stats).unwrap();

        let consumed = GET_FOO.len() + 8;
        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), consumed as u64);
        assert_eq!(&buf[..], b"PI");
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(&b"PING\r\n"[..]);
        let err = decoder.decode(&mut buf, &stats).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedPrefix { expected: '*', found: 'P' });

        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(&b"*1\r\n:4\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf, &stats),
            Err(DecodeError::UnexpectedPrefix { expected: '$', .. })
        ));
    }

    #[test]
    fn test_non_numeric_lengths_rejected() {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(&b"*two\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf, &stats),
            Err(DecodeError::InvalidMultibulkLength)
        );

        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(&b"*1\r\n$-1\r\n"[..]);
        assert_eq!(decoder.decode(&mut buf, &stats), Err(DecodeError::InvalidBulkLength));
    }

    #[test]
    fn test_declared_sizes_are_bounded() {
        let stats = ServerStats::new();
        let limits = DecoderLimits {
            max_multibulk_len: 4,
            max_bulk_len: 8,
            max_header_line: 16,
        };

        let mut decoder = RequestDecoder::new(limits);
        let mut buf = BytesMut::from(&b"*5\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf, &stats),
            Err(DecodeError::InvalidMultibulkLength)
        );

        let mut decoder = RequestDecoder::new(limits);
        let mut buf = BytesMut::from(&b"*1\r\n$9\r\n"[..]);
        assert_eq!(decoder.decode(&mut buf, &stats), Err(DecodeError::InvalidBulkLength));

        let mut decoder = RequestDecoder::new(limits);
        let mut buf = BytesMut::from(&b"*11111111111111111111"[..]);
        assert_eq!(
            decoder.decode(&mut buf, &stats),
            Err(DecodeError::HeaderTooLong { max: 16 })
        );
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let stats = ServerStats::new();
        let mut decoder = RequestDecoder::default();
        let mut buf = BytesMut::from(&b"*1\r\n$3\r\nGETxx"[..]);
        assert_eq!(decoder.decode(&mut buf, &stats), Err(DecodeError::MissingTerminator));
    }
}
