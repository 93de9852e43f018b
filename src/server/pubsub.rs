//! Channel Subscription Registry
//!
//! Maps each channel to the sessions subscribed to it. A session is identified
//! by its [`SessionId`] and reached through its mailbox: a bounded channel
//! drained by the session's connection task, which appends the already encoded
//! message to the session's outbound queue.
//!
//! Membership is a set: a session appears at most once per channel.
//!
//! Publishing never waits. A subscriber whose mailbox is full has stopped
//! keeping up; the mailbox is marked overflowed, drops every later message,
//! and the session owning it is closed once its queued output is written.

use crate::connection::SessionId;
use crate::protocol::RespValue;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

/// Default number of undelivered messages a mailbox holds.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Sending half of a session's message mailbox.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<Bytes>,
    overflowed: Arc<AtomicBool>,
}

impl Mailbox {
    /// Creates a mailbox holding up to `capacity` messages, with its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mailbox = Self {
            tx,
            overflowed: Arc::new(AtomicBool::new(false)),
        };
        (mailbox, rx)
    }

    /// Hands `frame` to the mailbox without waiting.
    ///
    /// Returns false if the frame was not accepted: the receiver is gone, the
    /// mailbox is full, or it overflowed earlier.
    pub fn offer(&self, frame: Bytes) -> bool {
        if self.is_overflowed() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// True once a message was dropped because the mailbox was full.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct PubSubRegistry {
    channels: DashMap<Bytes, HashMap<SessionId, Mailbox>>,
}

impl PubSubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `session` to `channel`. Returns false if it was already subscribed.
    pub fn subscribe(&self, channel: &Bytes, session: SessionId, mailbox: Mailbox) -> bool {
        let mut subscribers = self.channels.entry(channel.clone()).or_default();
        if subscribers.contains_key(&session) {
            return false;
        }
        subscribers.insert(session, mailbox);
        true
    }

    /// Removes `session` from `channel`, dropping the channel once empty.
    ///
    /// Returns false if the session was not subscribed.
    pub fn unsubscribe(&self, channel: &Bytes, session: SessionId) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut subscribers) => subscribers.remove(&session).is_some(),
            None => return false,
        };
        self.channels
            .remove_if(channel, |_, subscribers| subscribers.is_empty());
        removed
    }

    /// Delivers `message` to every subscriber of `channel`.
    ///
    /// Returns the number of sessions the message was handed to. Subscribers
    /// whose mailbox is closed or full are skipped; their session is being
    /// torn down and will unsubscribe itself.
    pub fn publish(&self, channel: &Bytes, message: Bytes) -> usize {
        let Some(subscribers) = self.channels.get(channel) else {
            return 0;
        };

        let frame = RespValue::array(vec![
            RespValue::bulk_string("message"),
            RespValue::BulkString(channel.clone()),
            RespValue::BulkString(message),
        ])
        .encode();

        let mut delivered = 0;
        for (session, mailbox) in subscribers.iter() {
            let was_overflowed = mailbox.is_overflowed();
            if mailbox.offer(frame.clone()) {
                delivered += 1;
            } else if !was_overflowed && mailbox.is_overflowed() {
                warn!(session = *session, channel = ?channel, "Subscriber mailbox full, dropping messages");
            }
        }
        trace!(channel = ?channel, delivered, "published message");
        delivered
    }

    pub fn subscriber_count(&self, channel: &Bytes) -> usize {
        self.channels.get(channel).map_or(0, |s| s.len())
    }

    pub fn is_subscribed(&self, channel: &Bytes, session: SessionId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|s| s.contains_key(&session))
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
