//! Session Owner
//!
//! A `Worker` owns the sessions of one worker thread and reacts to transport
//! events on their behalf. It is synchronous: the transport driver
//! ([`serve_connection`](crate::connection::serve_connection)) performs the
//! actual socket I/O and reports what happened through the `on_*` methods.
//!
//! Only the worker creates and destroys sessions. Destroying one revokes its
//! channel subscriptions and updates the connection counters.

use crate::connection::{ConnectionError, Dispatcher, Outbound, Session, SessionId};
use crate::protocol::RespValue;
use crate::server::ServerContext;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Non-data transport events.
#[derive(Debug)]
pub enum TransportEvent {
    /// The peer closed its side
    Eof,
    /// The socket failed
    Error(ConnectionError),
    /// No input arrived within the idle timeout
    Timeout,
}

#[derive(Debug)]
pub struct Worker {
    id: usize,
    ctx: Arc<ServerContext>,
    sessions: HashMap<SessionId, Session>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<ServerContext>) -> Self {
        Self {
            id,
            ctx,
            sessions: HashMap::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Registers a new connection and returns its id and mailbox.
    pub fn accept(&mut self, peer: SocketAddr) -> (SessionId, mpsc::Receiver<Bytes>) {
        let id = self.ctx.next_session_id();
        let (session, mailbox) = Session::new(id, peer, Arc::clone(&self.ctx));
        self.sessions.insert(id, session);
        self.ctx.stats.connection_opened();
        info!(worker = self.id, session = id, client = %peer, "Client connected");
        (id, mailbox)
    }

    /// Handles bytes read from the session's socket.
    ///
    /// Frames what it can, executes the framed commands, then answers a
    /// protocol error (if any) and marks the session for closing.
    pub fn on_read(&mut self, id: SessionId, data: &[u8]) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.touch();

        let decoded = session.feed(data);
        Dispatcher::new(&self.ctx).run_batch(session);

        if let Err(err) = decoded {
            warn!(session = id, client = %session.peer(), error = %err, "Protocol error");
            if !session.flags().close_after_reply {
                session.reply(&RespValue::error(format!("ERR Protocol error: {}", err)));
            }
            session.set_close_after_reply();
        }
    }

    /// Queues a pub/sub message for the session.
    ///
    /// A session whose mailbox overflowed is marked for closing; what it
    /// already received is still written first.
    pub fn deliver(&mut self, id: SessionId, frame: Bytes) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.deliver(frame);
        if session.mailbox_overflowed() && !session.flags().close_after_reply {
            warn!(
                session = id,
                client = %session.peer(),
                "Subscriber fell behind, closing connection"
            );
            session.set_close_after_reply();
        }
    }

    /// Takes the session's pending output for the transport to write.
    pub fn take_outbound(&mut self, id: SessionId) -> Vec<Outbound> {
        self.sessions
            .get_mut(&id)
            .map(Session::take_outbound)
            .unwrap_or_default()
    }

    /// Called once the transport has written everything it was handed.
    ///
    /// Returns false when the session was closed because it asked to be.
    pub fn on_write_complete(&mut self, id: SessionId) -> bool {
        let close = match self.sessions.get(&id) {
            Some(session) => {
                session.flags().close_after_reply && !session.has_pending_output()
            }
            None => return false,
        };
        if close {
            debug!(session = id, "Closing after reply");
            self.remove_session(id);
        }
        !close
    }

    /// Handles a non-data event. Returns false if the session was torn down.
    pub fn on_event(&mut self, id: SessionId, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Timeout => {
                if let Some(session) = self.sessions.get(&id) {
                    info!(
                        session = id,
                        idle_secs = session.idle_time().as_secs(),
                        "Idle timeout, keeping connection"
                    );
                }
                self.sessions.contains_key(&id)
            }
            TransportEvent::Eof => {
                debug!(session = id, "Client disconnected");
                self.remove_session(id);
                false
            }
            TransportEvent::Error(err) => {
                match &err {
                    ConnectionError::Io(io)
                        if io.kind() == std::io::ErrorKind::ConnectionReset =>
                    {
                        debug!(session = id, "Connection reset by client")
                    }
                    _ => warn!(session = id, error = %err, "Connection error"),
                }
                self.remove_session(id);
                false
            }
        }
    }

    /// Destroys a session. Returns false if it did not exist.
    pub fn remove_session(&mut self, id: SessionId) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        let revoked = session.unsubscribe_all();
        self.ctx.stats.connection_closed();
        info!(
            worker = self.id,
            session = id,
            client = %session.peer(),
            age_secs = session.age().as_secs(),
            revoked,
            "Session closed"
        );
        true
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
