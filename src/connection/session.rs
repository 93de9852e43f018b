//! Client Session
//!
//! A `Session` is the per-connection state: the request decoder and its input
//! buffer, the outbound queue, flags, authentication namespace and channel
//! subscriptions. It performs no I/O. The transport driver feeds it bytes and
//! drains its outbound queue.
//!
//! ## Outbound queue
//!
//! Encoded replies are appended to a pending buffer. A raw file transfer
//! seals the pending bytes into their own segment and queues the file after
//! them, so bytes leave in exactly the order they were emitted:
//!
//! ```text
//! [ Buffer("$7\r\n") ][ File(len = 7) ][ Buffer("\r\n+OK\r\n") ]
//! ```

use crate::protocol::{CommandTokens, DecodeError, RequestDecoder, RespValue};
use crate::server::{Mailbox, ServerContext};
use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;

/// Process-unique session identifier.
pub type SessionId = u64;

/// Initial capacity of the inbound buffer.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Session state flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// Close the connection once every queued byte has been written
    pub close_after_reply: bool,
}

/// Whether the peer is an ordinary client or a replication link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicationRole {
    #[default]
    Client,
    Replica,
}

/// One segment of pending output.
#[derive(Debug)]
pub enum Outbound {
    /// Encoded protocol bytes
    Buffer(BytesMut),
    /// The first `len` bytes of a file, sent verbatim
    File { file: std::fs::File, len: u64 },
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    created_at: Instant,
    last_interaction: Instant,
    flags: SessionFlags,
    /// Empty while unauthenticated
    namespace: String,
    subscriptions: HashSet<Bytes>,
    last_command: Option<&'static str>,
    role: ReplicationRole,
    decoder: RequestDecoder,
    inbound: BytesMut,
    /// Encoded bytes not yet sealed into `outbound`
    pending: BytesMut,
    outbound: VecDeque<Outbound>,
    mailbox: Mailbox,
    ctx: Arc<ServerContext>,
}

impl Session {
    /// Creates a session together with the receiving end of its mailbox.
    ///
    /// Published messages for this session's channels arrive on the returned
    /// receiver, already encoded.
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        ctx: Arc<ServerContext>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (mailbox, rx) = Mailbox::channel(ctx.config.pubsub_mailbox_capacity);
        let now = Instant::now();
        let namespace = if ctx.config.auth_required() {
            String::new()
        } else {
            crate::ADMIN_NAMESPACE.to_string()
        };

        let session = Self {
            id,
            peer,
            created_at: now,
            last_interaction: now,
            flags: SessionFlags::default(),
            namespace,
            subscriptions: HashSet::new(),
            last_command: None,
            role: ReplicationRole::Client,
            decoder: RequestDecoder::new((&ctx.config).into()),
            inbound: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            pending: BytesMut::new(),
            outbound: VecDeque::new(),
            mailbox,
            ctx,
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last inbound read.
    pub fn idle_time(&self) -> Duration {
        self.last_interaction.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_interaction = Instant::now();
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Requests a close once the outbound queue has drained.
    pub fn set_close_after_reply(&mut self) {
        self.flags.close_after_reply = true;
    }

    pub fn is_authenticated(&self) -> bool {
        !self.namespace.is_empty()
    }

    pub fn namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }

    pub fn authenticate(&mut self, namespace: &str) {
        self.namespace = namespace.to_string();
    }

    pub fn role(&self) -> ReplicationRole {
        self.role
    }

    pub fn set_role(&mut self, role: ReplicationRole) {
        self.role = role;
    }

    pub fn last_command(&self) -> Option<&'static str> {
        self.last_command
    }

    pub fn set_last_command(&mut self, name: &'static str) {
        self.last_command = Some(name);
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Appends freshly read bytes and frames as many commands as possible.
    ///
    /// Commands framed before a protocol error stay in the batch.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        self.inbound.extend_from_slice(data);
        self.decoder.decode(&mut self.inbound, &self.ctx.stats)
    }

    /// Takes every command framed so far, leaving the batch empty.
    pub fn take_batch(&mut self) -> Vec<CommandTokens> {
        self.decoder.take_batch()
    }

    pub fn decoder(&self) -> &RequestDecoder {
        &self.decoder
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribes to `channel`. Returns false if already subscribed.
    pub fn subscribe(&mut self, channel: Bytes) -> bool {
        if !self.subscriptions.insert(channel.clone()) {
            return false;
        }
        self.ctx
            .pubsub
            .subscribe(&channel, self.id, self.mailbox.clone());
        true
    }

    /// Unsubscribes from `channel`. Returns false if not subscribed.
    pub fn unsubscribe(&mut self, channel: &Bytes) -> bool {
        if !self.subscriptions.remove(channel) {
            return false;
        }
        self.ctx.pubsub.unsubscribe(channel, self.id);
        true
    }

    /// Revokes every subscription. Returns how many were removed.
    pub fn unsubscribe_all(&mut self) -> usize {
        let count = self.subscriptions.len();
        for channel in self.subscriptions.drain() {
            self.ctx.pubsub.unsubscribe(&channel, self.id);
        }
        count
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Current subscriptions in a stable order.
    pub fn subscriptions(&self) -> Vec<Bytes> {
        let mut channels: Vec<Bytes> = self.subscriptions.iter().cloned().collect();
        channels.sort();
        channels
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Encodes `value` onto the outbound queue.
    pub fn reply(&mut self, value: &RespValue) {
        let before = self.pending.len();
        value.encode_into(&mut self.pending);
        self.ctx
            .stats
            .incr_outbound_bytes(self.pending.len() - before);
    }

    /// Queues `data` verbatim, bypassing protocol encoding.
    pub fn send_raw(&mut self, data: Bytes) {
        self.ctx.stats.incr_outbound_bytes(data.len());
        self.pending.extend_from_slice(&data);
    }

    /// Queues the first `len` bytes of `file` for verbatim transfer.
    pub fn send_file(&mut self, file: std::fs::File, len: u64) {
        self.ctx.stats.incr_outbound_bytes(len as usize);
        self.seal_pending();
        self.outbound.push_back(Outbound::File { file, len });
    }

    /// Queues a message delivered through the session's mailbox.
    pub fn deliver(&mut self, frame: Bytes) {
        trace!(session = self.id, len = frame.len(), "Delivering message");
        self.send_raw(frame);
    }

    /// True once a publish was dropped because this session fell behind.
    pub fn mailbox_overflowed(&self) -> bool {
        self.mailbox.is_overflowed()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.pending.is_empty() || !self.outbound.is_empty()
    }

    /// Takes the outbound queue for writing.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.seal_pending();
        self.outbound.drain(..).collect()
    }

    /// Moves the bytes encoded so far into their own queue segment.
    fn seal_pending(&mut self) {
        if !self.pending.is_empty() {
            self.outbound.push_back(Outbound::Buffer(self.pending.split()));
        }
    }

    /// Concatenates the queued reply bytes, skipping file segments.
    #[cfg(test)]
    pub(crate) fn take_output_bytes(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        for chunk in self.take_outbound() {
            if let Outbound::Buffer(buf) = chunk {
                out.extend_from_slice(&buf);
            }
        }
        out
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
