//! Async message bus and the outbound messaging seam.
//!
//! The agent consumes one inbound queue. Channel adapters subscribe to the
//! outbound broadcast. Everything that needs to reach a user goes through a
//! [`Messenger`].

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InboundMessage {
    /// A system-authored message, used for results fed back to the agent.
    pub fn system(
        chat_id: impl Into<String>,
        content: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            channel: SYSTEM_CHANNEL.to_string(),
            sender_id: SYSTEM_CHANNEL.to_string(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata,
        }
    }

    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Channel name used for internally generated inbound messages.
pub const SYSTEM_CHANNEL: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Split `channel:chat_id`. The chat id may itself contain colons.
pub fn split_session_key(key: &str) -> Option<(&str, &str)> {
    let (channel, chat) = key.split_once(':')?;
    if channel.is_empty() || chat.is_empty() {
        return None;
    }
    Some((channel, chat))
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// Capacity of the internal channels.
const BUS_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Option<mpsc::Receiver<InboundMessage>>,
    outbound_tx: broadcast::Sender<OutboundMessage>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            outbound_tx,
        }
    }

    /// Sender handle for anything that feeds the agent's inbound queue.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Take the inbound receiver (only once; the agent owns it).
    pub fn take_inbound_receiver(&mut self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.take()
    }

    /// Publish an outbound message. Dropped silently when nobody subscribes.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        let _ = self.outbound_tx.send(msg);
    }

    pub fn subscribe_outbound(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound_tx.subscribe()
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Outbound messaging for one channel.
#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    /// Channel name, e.g. `telegram`.
    fn channel(&self) -> &str;

    /// Capability probe: false when required credentials or endpoints are
    /// missing. Unavailable messengers are never registered.
    fn is_available(&self) -> bool {
        true
    }

    fn build_session_key(&self, chat_id: &str) -> String {
        format!("{}:{}", self.channel(), chat_id)
    }

    async fn send(&self, session_key: &str, text: &str) -> Result<()>;
}

/// A [`Messenger`] that hands messages to whatever adapter subscribes to the
/// bus's outbound side.
pub struct BusMessenger {
    channel: String,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl BusMessenger {
    pub fn new(channel: impl Into<String>, bus: &MessageBus) -> Self {
        Self {
            channel: channel.into(),
            outbound: bus.outbound_sender(),
        }
    }

    pub fn shared(channel: impl Into<String>, bus: &MessageBus) -> Arc<dyn Messenger> {
        Arc::new(Self::new(channel, bus))
    }
}

#[async_trait::async_trait]
impl Messenger for BusMessenger {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, session_key: &str, text: &str) -> Result<()> {
        let chat_id = split_session_key(session_key)
            .map(|(_, chat)| chat)
            .unwrap_or(session_key);
        let receivers = self.outbound.receiver_count();
        let _ = self.outbound.send(OutboundMessage {
            channel: self.channel.clone(),
            chat_id: chat_id.to_string(),
            content: text.to_string(),
            reply_to: None,
        });
        debug!(channel = %self.channel, chat_id = %chat_id, receivers, "Outbound message published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_split_keeps_colons_in_chat_id() {
        assert_eq!(split_session_key("telegram:42"), Some(("telegram", "42")));
        assert_eq!(
            split_session_key("matrix:!room:example.org"),
            Some(("matrix", "!room:example.org"))
        );
        assert_eq!(split_session_key("nochannel"), None);
        assert_eq!(split_session_key(":42"), None);
    }

    #[test]
    fn system_message_uses_system_channel() {
        let msg = InboundMessage::system("42", "done", serde_json::json!({"source": "cron"}));
        assert_eq!(msg.session_key(), "system:42");
        assert_eq!(msg.metadata["source"], "cron");
    }

    #[tokio::test]
    async fn inbound_receiver_can_only_be_taken_once() {
        let mut bus = MessageBus::new();
        let mut rx = bus.take_inbound_receiver().unwrap();
        assert!(bus.take_inbound_receiver().is_none());

        bus.inbound_sender()
            .send(InboundMessage::system("1", "hello", serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn bus_messenger_publishes_to_subscribers() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe_outbound();
        let messenger = BusMessenger::new("discord", &bus);

        let key = messenger.build_session_key("chan-7");
        assert_eq!(key, "discord:chan-7");
        messenger.send(&key, "report ready").await.unwrap();

        let out = sub.recv().await.unwrap();
        assert_eq!(out.channel, "discord");
        assert_eq!(out.chat_id, "chan-7");
        assert_eq!(out.content, "report ready");
    }

    #[tokio::test]
    async fn bus_messenger_without_subscribers_does_not_fail() {
        let bus = MessageBus::new();
        let messenger = BusMessenger::new("web", &bus);
        assert!(messenger.send("web:1", "nobody listening").await.is_ok());
    }
}
