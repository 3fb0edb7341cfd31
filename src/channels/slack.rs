//! Slack adapter using Socket Mode (WebSocket) for receiving events and
//! the Web API (HTTP) for sending messages.
//!
//! Multiple workspaces run as separate instances disambiguated by a
//! namespace: the default instance claims `slack:<user>` and
//! `slack:channel:<id>`, a namespaced one claims `slack:<ns>:…`. The
//! claims are disjoint as long as no namespace is called `channel`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::StreamExt;
use futures::SinkExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::{Channel, OutboundQueue, QueuedSend};
use crate::config::SlackConfig;
use crate::types::{ChannelEvent, ChatId, ChatMetadata, InboundMessage};

const API_TIMEOUT: Duration = Duration::from_secs(15);

pub struct SlackChannel {
    cfg: SlackConfig,
    http: reqwest::Client,
    connected: AtomicBool,
    queue: OutboundQueue,
    events: mpsc::Sender<ChannelEvent>,
    /// Our own bot user ID, resolved via `auth.test` on connect.
    bot_user_id: std::sync::RwLock<Option<String>>,
    /// Cache of Slack user IDs to display names (process lifetime).
    user_cache: RwLock<HashMap<String, String>>,
    /// Cache of user ID → opened DM channel ID.
    dm_cache: RwLock<HashMap<String, String>>,
}

/// A message event projected out of a Socket Mode envelope, before any
/// name resolution happens.
#[derive(Debug, PartialEq)]
struct ProjectedMessage {
    chat_id: ChatId,
    user: String,
    text: String,
    ts: String,
    channel: String,
    is_group: bool,
    is_bot: bool,
}

impl SlackChannel {
    pub fn new(cfg: SlackConfig, events: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            connected: AtomicBool::new(false),
            queue: OutboundQueue::new(),
            events,
            bot_user_id: std::sync::RwLock::new(None),
            user_cache: RwLock::new(HashMap::new()),
            dm_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Chat-id prefix claimed by this instance.
    fn prefix(&self) -> String {
        match &self.cfg.namespace {
            Some(ns) => format!("slack:{}:", ns),
            None => "slack:".to_string(),
        }
    }

    /// Start the Socket Mode client with automatic retry on crash.
    pub async fn start_with_retry(self: Arc<Self>) {
        let initial_backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);
        let stable_threshold = Duration::from_secs(60);
        let mut backoff = initial_backoff;

        loop {
            info!(channel = %Channel::name(self.as_ref()), "Starting Slack Socket Mode client");
            let started = tokio::time::Instant::now();
            if let Err(e) = self.clone().start().await {
                warn!("Slack client error: {}", e);
            }
            self.connected.store(false, Ordering::SeqCst);
            let ran_for = started.elapsed();

            if ran_for >= stable_threshold {
                backoff = initial_backoff;
            }

            warn!(
                backoff_secs = backoff.as_secs(),
                ran_for_secs = ran_for.as_secs(),
                "Slack client stopped, restarting"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    /// Open a Socket Mode connection and process events until it drops.
    async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        self.resolve_bot_info().await;

        let wss_url = self.open_connection().await?;
        debug!(url = %wss_url, "Slack Socket Mode connection URL obtained");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&wss_url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        info!(channel = %Channel::name(self.as_ref()), "Slack WebSocket connected");
        self.connected.store(true, Ordering::SeqCst);
        self.flush_queue().await;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!("WebSocket read error: {}", e);
                    break;
                }
            };

            match msg {
                tokio_tungstenite::tungstenite::Message::Text(text) => {
                    let envelope: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("Failed to parse Slack envelope: {}", e);
                            continue;
                        }
                    };

                    // Acknowledge immediately so Slack doesn't redeliver.
                    if let Some(envelope_id) = envelope.get("envelope_id").and_then(|v| v.as_str())
                    {
                        let ack = json!({ "envelope_id": envelope_id });
                        let ack_msg =
                            tokio_tungstenite::tungstenite::Message::Text(ack.to_string());
                        if let Err(e) = ws_tx.send(ack_msg).await {
                            warn!("Failed to ack envelope: {}", e);
                        }
                    }

                    if envelope.get("type").and_then(|v| v.as_str()) == Some("disconnect") {
                        let reason = envelope
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown");
                        info!(reason, "Slack requested disconnect");
                        break;
                    }

                    // Processed inline, not spawned: inbound order within
                    // a channel must be preserved for the per-folder FIFO.
                    self.handle_envelope(&envelope).await;
                }
                tokio_tungstenite::tungstenite::Message::Ping(data) => {
                    let pong = tokio_tungstenite::tungstenite::Message::Pong(data);
                    let _ = ws_tx.send(pong).await;
                }
                tokio_tungstenite::tungstenite::Message::Close(_) => {
                    info!("Slack WebSocket closed by server");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Call `apps.connections.open` to get a WebSocket URL.
    async fn open_connection(&self) -> anyhow::Result<String> {
        let resp = self
            .http
            .post("https://slack.com/api/apps.connections.open")
            .timeout(API_TIMEOUT)
            .header("Authorization", format!("Bearer {}", self.cfg.app_token))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .send()
            .await?;

        let body: Value = resp.json().await?;
        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let error = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            anyhow::bail!("apps.connections.open failed: {}", error);
        }

        body.get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("No URL in apps.connections.open response"))
    }

    /// Resolve our own user ID via `auth.test` (self-echo suppression).
    async fn resolve_bot_info(&self) {
        match self.api_post("auth.test", json!({})).await {
            Ok(resp) => {
                if let Some(user_id) = resp.get("user_id").and_then(|v| v.as_str()) {
                    if let Ok(mut guard) = self.bot_user_id.write() {
                        *guard = Some(user_id.to_string());
                    }
                    info!(channel = %Channel::name(self), "Resolved Slack bot identity");
                }
            }
            Err(e) => {
                warn!("auth.test failed: {}", e);
            }
        }
    }

    async fn api_post(&self, method: &str, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(format!("https://slack.com/api/{}", method))
            .timeout(API_TIMEOUT)
            .header("Authorization", format!("Bearer {}", self.cfg.bot_token))
            .json(&body)
            .send()
            .await?;

        let payload: Value = resp.json().await?;
        if payload.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let error = payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            anyhow::bail!("{} failed: {}", method, error);
        }
        Ok(payload)
    }

    /// Resolve a user ID to a display name via `users.info`, cached.
    async fn resolve_user_name(&self, user_id: &str) -> Option<String> {
        if let Some(name) = self.user_cache.read().await.get(user_id) {
            return Some(name.clone());
        }

        let resp = self
            .api_post("users.info", json!({ "user": user_id }))
            .await
            .ok()?;
        let user = resp.get("user")?;
        let name = user
            .pointer("/profile/display_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                user.pointer("/profile/real_name")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
            })
            .or_else(|| user.get("name").and_then(|v| v.as_str()))?
            .to_string();

        self.user_cache
            .write()
            .await
            .insert(user_id.to_string(), name.clone());
        Some(name)
    }

    async fn handle_envelope(&self, envelope: &Value) {
        if envelope.get("type").and_then(|v| v.as_str()) != Some("events_api") {
            return;
        }
        let Some(event) = envelope.pointer("/payload/event") else {
            return;
        };

        let bot_user_id = self
            .bot_user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(projected) = project_message_event(event, bot_user_id.as_deref(), &self.prefix())
        else {
            return;
        };

        let ts_secs = projected.ts.parse::<f64>().unwrap_or(0.0);
        let timestamp = Utc
            .timestamp_millis_opt((ts_secs * 1000.0) as i64)
            .single()
            .unwrap_or_else(Utc::now);

        let sender_name = self
            .resolve_user_name(&projected.user)
            .await
            .unwrap_or_else(|| projected.user.clone());

        let metadata = ChatMetadata {
            chat_id: projected.chat_id.clone(),
            timestamp,
            name: if projected.is_group {
                None
            } else {
                Some(sender_name.clone())
            },
            transport: Channel::name(self),
            is_group: projected.is_group,
        };
        if self.events.send(ChannelEvent::Metadata(metadata)).await.is_err() {
            return;
        }

        let message = InboundMessage {
            id: format!("{}:{}", projected.channel, projected.ts),
            chat_id: projected.chat_id,
            sender_id: projected.user,
            sender_name,
            text: projected.text,
            timestamp,
            is_self: false,
            is_bot: projected.is_bot,
        };
        if self.events.send(ChannelEvent::Message(message)).await.is_err() {
            warn!("Router intake closed, dropping Slack message");
        }
    }

    async fn flush_queue(&self) {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "Draining Slack offline queue");
        for (idx, send) in pending.iter().enumerate() {
            if let Err(e) = self
                .deliver(&send.chat_id, &send.text, send.sender_label.as_deref())
                .await
            {
                warn!("Slack queue drain stopped: {}", e);
                self.queue.requeue_front(pending[idx..].to_vec());
                self.connected.store(false, Ordering::SeqCst);
                return;
            }
        }
    }

    /// Resolve the Web API channel argument for a chat id: channels post
    /// directly, user DMs go through `conversations.open` (cached).
    async fn resolve_target(&self, chat_id: &ChatId) -> anyhow::Result<String> {
        let prefix = self.prefix();
        let rest = chat_id
            .as_str()
            .strip_prefix(&prefix)
            .ok_or_else(|| anyhow::anyhow!("not owned by {}: {}", Channel::name(self), chat_id))?;

        if let Some(channel_id) = rest.strip_prefix("channel:") {
            return Ok(channel_id.to_string());
        }

        if let Some(dm) = self.dm_cache.read().await.get(rest) {
            return Ok(dm.clone());
        }
        let resp = self
            .api_post("conversations.open", json!({ "users": rest }))
            .await?;
        let dm = resp
            .pointer("/channel/id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("conversations.open returned no channel id"))?
            .to_string();
        self.dm_cache
            .write()
            .await
            .insert(rest.to_string(), dm.clone());
        Ok(dm)
    }

    async fn deliver(
        &self,
        chat_id: &ChatId,
        text: &str,
        sender_label: Option<&str>,
    ) -> anyhow::Result<()> {
        let target = self.resolve_target(chat_id).await?;
        let mut body = json!({ "channel": target, "text": text });
        if let Some(label) = sender_label {
            // Per-bot identity: shown as the posting username.
            body["username"] = json!(label);
        }
        self.api_post("chat.postMessage", body).await?;
        Ok(())
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> String {
        match &self.cfg.namespace {
            Some(ns) => format!("slack:{}", ns),
            None => "slack".to_string(),
        }
    }

    fn owns(&self, chat_id: &ChatId) -> bool {
        let Some(rest) = chat_id.as_str().strip_prefix("slack:") else {
            return false;
        };
        match &self.cfg.namespace {
            Some(ns) => rest.starts_with(&format!("{}:", ns)),
            // Default instance: `slack:<user>` or `slack:channel:<id>`,
            // never a namespaced id.
            None => rest.starts_with("channel:") || !rest.contains(':'),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, chat_id: &ChatId, text: &str, sender_label: Option<&str>) {
        let item = QueuedSend {
            chat_id: chat_id.clone(),
            text: text.to_string(),
            sender_label: sender_label.map(|s| s.to_string()),
        };
        if !self.is_connected() {
            self.queue.push(item);
            return;
        }
        if let Err(e) = self.deliver(chat_id, text, sender_label).await {
            warn!(chat_id = %chat_id, "Slack send failed, queueing: {}", e);
            self.queue.push(item);
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

/// Project a Slack `message` event into a transport-neutral shape.
///
/// Drops self-echoes and subtype events unless they carry new text, and
/// strips a leading mention of the bot identity.
fn project_message_event(
    event: &Value,
    bot_user_id: Option<&str>,
    prefix: &str,
) -> Option<ProjectedMessage> {
    if event.get("type").and_then(|v| v.as_str()) != Some("message") {
        return None;
    }

    let subtype = event.get("subtype").and_then(|v| v.as_str());
    let (text, user) = match subtype {
        None => (
            event.get("text").and_then(|v| v.as_str())?,
            event.get("user").and_then(|v| v.as_str())?,
        ),
        // Edits carry the new text under `message`.
        Some("message_changed") => (
            event.pointer("/message/text").and_then(|v| v.as_str())?,
            event.pointer("/message/user").and_then(|v| v.as_str())?,
        ),
        Some(_) => return None,
    };

    if Some(user) == bot_user_id {
        return None;
    }

    let channel = event.get("channel").and_then(|v| v.as_str())?;
    let is_dm = event.get("channel_type").and_then(|v| v.as_str()) == Some("im")
        || channel.starts_with('D');

    let chat_id = if is_dm {
        ChatId::new(format!("{}{}", prefix, user))
    } else {
        ChatId::new(format!("{}channel:{}", prefix, channel))
    };

    let mut text = text.trim().to_string();
    if let Some(bot_id) = bot_user_id {
        let mention = format!("<@{}>", bot_id);
        if let Some(stripped) = text.strip_prefix(&mention) {
            text = stripped
                .trim_start_matches([':', ','])
                .trim_start()
                .to_string();
        }
    }
    if text.is_empty() {
        return None;
    }

    Some(ProjectedMessage {
        chat_id,
        user: user.to_string(),
        text,
        ts: event.get("ts").and_then(|v| v.as_str())?.to_string(),
        channel: channel.to_string(),
        is_group: !is_dm,
        is_bot: event.get("bot_id").is_some(),
    })
}
