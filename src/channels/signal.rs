//! Signal adapter: talks JSON-RPC to a local signal daemon.
//!
//! A poll transport: one `receive` call roughly every two seconds with a
//! short server-side timeout. The poll loop is the only caller of
//! `receive`, so at most one poll is ever in flight; outbound sends go
//! through the shared offline queue when the daemon is unreachable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Channel, OutboundQueue, QueuedSend};
use crate::config::SignalConfig;
use crate::types::{ChannelEvent, ChatId, ChatMetadata, InboundMessage};

/// Deadline for one JSON-RPC round trip (the receive long-poll is shorter).
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

pub struct SignalChannel {
    cfg: SignalConfig,
    http: reqwest::Client,
    connected: AtomicBool,
    queue: OutboundQueue,
    events: mpsc::Sender<ChannelEvent>,
    next_rpc_id: AtomicU64,
}

impl SignalChannel {
    pub fn new(cfg: SignalConfig, events: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            connected: AtomicBool::new(false),
            queue: OutboundQueue::new(),
            events,
            next_rpc_id: AtomicU64::new(1),
        }
    }

    /// Run the poll loop with automatic retry on failure.
    /// Backoff 5s → 60s cap, reset after a stable run.
    pub async fn start_with_retry(self: Arc<Self>) {
        let initial_backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);
        let stable_threshold = Duration::from_secs(60);
        let mut backoff = initial_backoff;

        loop {
            info!(url = %self.cfg.rpc_url, "Starting Signal JSON-RPC poller");
            let started = tokio::time::Instant::now();
            if let Err(e) = self.run().await {
                warn!("Signal poller error: {}", e);
            }
            self.connected.store(false, Ordering::SeqCst);
            let ran_for = started.elapsed();

            if ran_for >= stable_threshold {
                backoff = initial_backoff;
            }

            warn!(
                backoff_secs = backoff.as_secs(),
                ran_for_secs = ran_for.as_secs(),
                "Signal poller stopped, restarting"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    async fn run(&self) -> anyhow::Result<()> {
        // `version` doubles as the liveness probe.
        let version = self.rpc("version", json!({})).await?;
        info!(version = %version, "Signal daemon reachable");
        self.connected.store(true, Ordering::SeqCst);
        self.flush_queue().await;

        let poll_interval = Duration::from_millis(self.cfg.poll_interval_ms);
        loop {
            let batch = self
                .rpc("receive", json!({ "timeout": self.cfg.receive_timeout_secs }))
                .await?;

            if let Some(envelopes) = batch.as_array() {
                for item in envelopes {
                    self.handle_envelope(item).await;
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.cfg.rpc_url)
            .timeout(RPC_TIMEOUT + Duration::from_secs(self.cfg.receive_timeout_secs))
            .json(&body)
            .send()
            .await?;

        let payload: Value = resp.json().await?;
        if let Some(err) = payload.get("error") {
            anyhow::bail!("signal rpc '{}' failed: {}", method, err);
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Project one daemon envelope into the normalized message shape.
    async fn handle_envelope(&self, item: &Value) {
        let Some(envelope) = item.get("envelope") else {
            return;
        };

        // Sync messages are our own account echoing from another device.
        if envelope.get("syncMessage").is_some() {
            return;
        }

        let source_number = envelope
            .get("sourceNumber")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if source_number == self.cfg.account {
            return;
        }

        // Receipts, typing indicators and reactions carry no dataMessage
        // text and are dropped here.
        let Some(text) = envelope
            .pointer("/dataMessage/message")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
        else {
            return;
        };

        let group_id = envelope
            .pointer("/dataMessage/groupInfo/groupId")
            .and_then(|v| v.as_str());
        let chat_id = match group_id {
            Some(gid) => ChatId::new(format!("sig:group:{}", gid)),
            None => ChatId::new(format!("sig:{}", source_number)),
        };

        let ts_millis = envelope
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let timestamp = Utc
            .timestamp_millis_opt(ts_millis)
            .single()
            .unwrap_or_else(Utc::now);

        let sender_name = envelope
            .get("sourceName")
            .and_then(|v| v.as_str())
            .unwrap_or(source_number)
            .to_string();

        let metadata = ChatMetadata {
            chat_id: chat_id.clone(),
            timestamp,
            name: if group_id.is_some() {
                None
            } else {
                Some(sender_name.clone())
            },
            transport: "sig".to_string(),
            is_group: group_id.is_some(),
        };
        if self.events.send(ChannelEvent::Metadata(metadata)).await.is_err() {
            return;
        }

        let message = InboundMessage {
            id: format!("{}:{}", source_number, ts_millis),
            chat_id,
            sender_id: source_number.to_string(),
            sender_name,
            text: text.to_string(),
            timestamp,
            is_self: false,
            is_bot: false,
        };
        if self.events.send(ChannelEvent::Message(message)).await.is_err() {
            warn!("Router intake closed, dropping Signal message");
        }
    }

    async fn flush_queue(&self) {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "Draining Signal offline queue");
        for (idx, send) in pending.iter().enumerate() {
            if let Err(e) = self.deliver(&send.chat_id, &send.text).await {
                warn!("Signal queue drain stopped: {}", e);
                self.queue.requeue_front(pending[idx..].to_vec());
                self.connected.store(false, Ordering::SeqCst);
                return;
            }
        }
    }

    async fn deliver(&self, chat_id: &ChatId, text: &str) -> anyhow::Result<()> {
        let params = if let Some(gid) = chat_id.as_str().strip_prefix("sig:group:") {
            json!({ "groupId": gid, "message": text })
        } else if let Some(number) = chat_id.as_str().strip_prefix("sig:") {
            json!({ "recipient": [number], "message": text })
        } else {
            anyhow::bail!("not a signal chat id: {}", chat_id);
        };
        self.rpc("send", params).await?;
        Ok(())
    }
}

#[async_trait]
impl Channel for SignalChannel {
    fn name(&self) -> String {
        "signal".to_string()
    }

    fn owns(&self, chat_id: &ChatId) -> bool {
        chat_id.as_str().starts_with("sig:")
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, chat_id: &ChatId, text: &str, _sender_label: Option<&str>) {
        // Signal has no per-bot identity; the label is dropped.
        if !self.is_connected() {
            self.queue.push(QueuedSend {
                chat_id: chat_id.clone(),
                text: text.to_string(),
                sender_label: None,
            });
            return;
        }
        if let Err(e) = self.deliver(chat_id, text).await {
            warn!(chat_id = %chat_id, "Signal send failed, queueing: {}", e);
            self.queue.push(QueuedSend {
                chat_id: chat_id.clone(),
                text: text.to_string(),
                sender_label: None,
            });
            self.connected.store(false, Ordering::SeqCst);
        } else {
            debug!(chat_id = %chat_id, "Signal message sent");
        }
    }
}
