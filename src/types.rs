//! Core domain types: chat addressing, normalized inbound messages,
//! capability flags.
//!
//! Every transport projects into these shapes at its boundary; nothing
//! downstream of the channel adapters knows transport payload formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport-qualified opaque address of a conversation.
///
/// Grammar:
/// - `sig:<e164>` / `sig:group:<opaque>`
/// - `slack:<user>` / `slack:<ns>:<user>`
/// - `slack:channel:<id>` / `slack:<ns>:channel:<id>`
/// - `voice:session`
///
/// The prefix is the only routing key used inside the core: the hub asks
/// each channel `owns(chat_id)` in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Transport family tag: everything up to the first `:`.
    pub fn transport(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn is_signal_group(&self) -> bool {
        self.0.starts_with("sig:group:")
    }

    /// The synthetic address used by the voice HTTP path.
    pub fn voice_session() -> Self {
        Self("voice:session".to_string())
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Normalized inbound message. All transports project into this shape
/// before anything else sees the payload.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport-scoped message id, used for short-window dedup.
    pub id: String,
    pub chat_id: ChatId,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Authored by the bot identity itself (sync echo). Dropped by the router.
    pub is_self: bool,
    /// Authored by some other bot.
    pub is_bot: bool,
}

/// Chat-level metadata raised by channels alongside messages (names,
/// group-ness). Consumed by the router for auto-registration defaults.
#[derive(Debug, Clone)]
pub struct ChatMetadata {
    pub chat_id: ChatId,
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
    pub transport: String,
    pub is_group: bool,
}

/// Event stream from a channel adapter into the router.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(InboundMessage),
    Metadata(ChatMetadata),
}

/// Capability flags attached to a conversation. Each flag gates one tool
/// family on the IPC surface and one env whitelist entry at worker spawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub reminders: bool,
    #[serde(default)]
    pub bookmarks: bool,
    #[serde(default)]
    pub outbound_email: bool,
}

/// Persistent record keyed by ChatId. Multiple ChatIds may share one
/// folder (linked accounts); a folder is never shared by two
/// independently registered conversations.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub chat_id: ChatId,
    pub display_name: String,
    pub folder: String,
    /// Trigger token without the leading `@`. Empty = every message routes.
    pub trigger: String,
    pub requires_trigger: bool,
    pub caps: Capabilities,
    /// Optional container override (mounts, env) as raw JSON.
    pub container_config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Filesystem-safe slug for a conversation folder: lowercase, `[a-z0-9-]`,
/// runs of anything else collapsed to a single dash.
pub fn folder_slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("chat");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_transport_prefixes() {
        assert_eq!(ChatId::new("sig:+15551234567").transport(), "sig");
        assert_eq!(ChatId::new("slack:U123").transport(), "slack");
        assert_eq!(ChatId::new("slack:cit:channel:C9").transport(), "slack");
        assert_eq!(ChatId::voice_session().transport(), "voice");
    }

    #[test]
    fn chat_id_group_detection() {
        assert!(ChatId::new("sig:group:abc==").is_signal_group());
        assert!(!ChatId::new("sig:+15551234567").is_signal_group());
        assert!(!ChatId::new("slack:channel:C1").is_signal_group());
    }

    #[test]
    fn folder_slug_sanitizes() {
        assert_eq!(folder_slug("Family Chat!"), "family-chat");
        assert_eq!(folder_slug("sig:+15551234567"), "sig-15551234567");
        assert_eq!(folder_slug("---"), "chat");
        assert_eq!(folder_slug("A__B"), "a-b");
    }
}
