//! Channel abstraction: one uniform contract over transport adapters.
//!
//! Each adapter normalizes inbound payloads into [`ChannelEvent`]s and
//! pushes them into the router's intake queue; outbound goes through the
//! hub, which routes to the first registered channel claiming the chat-id
//! prefix.

mod signal;
mod slack;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

pub use signal::SignalChannel;
pub use slack::SlackChannel;

use crate::types::ChatId;

/// A chat transport. Adapters run their own connect/receive loops; the
/// core only calls `owns` and `send`.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique name, e.g. "signal", "slack", "slack:cit".
    fn name(&self) -> String;

    /// Whether this channel claims the chat-id prefix. Claims across
    /// registered channels must be disjoint.
    fn owns(&self, chat_id: &ChatId) -> bool;

    fn is_connected(&self) -> bool;

    /// Deliver text to a chat. Never fails outward: while disconnected or
    /// on transport error the send is queued and retried on reconnect.
    /// `sender_label` is surfaced by transports with per-bot identity.
    async fn send(&self, chat_id: &ChatId, text: &str, sender_label: Option<&str>);
}

/// One queued outbound send.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSend {
    pub chat_id: ChatId,
    pub text: String,
    pub sender_label: Option<String>,
}

/// In-memory FIFO of sends made while the transport was down. Drained in
/// order on reconnect. Deliberately not persisted: restarts start fresh.
#[derive(Default)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<QueuedSend>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, send: QueuedSend) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(send);
    }

    /// Take everything currently queued, preserving order.
    pub fn drain(&self) -> Vec<QueuedSend> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Put undelivered sends back at the head, preserving their order
    /// ahead of anything queued meanwhile.
    pub fn requeue_front(&self, sends: Vec<QueuedSend>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for send in sends.into_iter().rev() {
            inner.push_front(send);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration-ordered set of channels. Outbound sends route through the
/// first claimant of the chat-id; unclaimed ids are dropped with a log so
/// the dispatch path never blocks on a bad address.
pub struct ChannelHub {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelHub {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { channels }
    }

    pub fn channel_for(&self, chat_id: &ChatId) -> Option<Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.owns(chat_id)).cloned()
    }

    pub async fn send(&self, chat_id: &ChatId, text: &str, sender_label: Option<&str>) {
        match self.channel_for(chat_id) {
            Some(channel) => channel.send(chat_id, text, sender_label).await,
            None => {
                warn!(chat_id = %chat_id, "No channel claims chat id, dropping outbound message");
            }
        }
    }
}
