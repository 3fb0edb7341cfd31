//! Inbound routing: a pure decision over the normalized message plus
//! address-book state, ending in a turn enqueued on the worker pool.
//!
//! Drops, in order: self-echoes, duplicate ids, unknown conversations
//! (unless the transport's auto-registration policy admits them), and
//! trigger-gated messages without the trigger prefix.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::pool::{TurnRequest, WorkerPool};
use crate::store::Store;
use crate::types::{
    folder_slug, Capabilities, ChannelEvent, ChatId, ChatMetadata, Conversation, InboundMessage,
};

/// How many recently seen message ids are remembered for dedup.
const DEDUP_WINDOW: usize = 512;

/// Per-transport auto-registration policy, keyed by channel name.
#[derive(Debug, Clone, Default)]
pub struct AutoRegisterPolicy {
    pub enabled: bool,
    /// Auto-registered group chats require the trigger token.
    pub group_requires_trigger: bool,
}

/// Where a message ended up; returned for observability and tests.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteDecision {
    DroppedSelf,
    DroppedDuplicate,
    DroppedUnknown,
    DroppedNoTrigger,
    Enqueued { folder: String, payload: String },
}

pub struct Router {
    store: Arc<Store>,
    workers: Arc<WorkerPool>,
    main_folder: String,
    /// Channel name → policy; missing key = no auto-registration.
    policies: HashMap<String, AutoRegisterPolicy>,
    default_trigger: String,
    /// Trigger token → compiled `^@<trigger>\b` regex, compiled once.
    triggers: StdMutex<HashMap<String, Regex>>,
    recent_ids: StdMutex<VecDeque<String>>,
    /// Latest chat metadata per chat id; feeds auto-registration names.
    metadata: StdMutex<HashMap<ChatId, ChatMetadata>>,
}

impl Router {
    pub fn new(
        store: Arc<Store>,
        workers: Arc<WorkerPool>,
        main_folder: String,
        policies: HashMap<String, AutoRegisterPolicy>,
        default_trigger: String,
    ) -> Self {
        Self {
            store,
            workers,
            main_folder,
            policies,
            default_trigger,
            triggers: StdMutex::new(HashMap::new()),
            recent_ids: StdMutex::new(VecDeque::new()),
            metadata: StdMutex::new(HashMap::new()),
        }
    }

    /// Drain loop over the channel event intake. Runs until every channel
    /// sender is gone.
    pub async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ChannelEvent::Metadata(meta) => self.handle_metadata(meta).await,
                ChannelEvent::Message(msg) => {
                    if let Err(e) = self.handle_message(msg).await {
                        warn!("Router error: {}", e);
                    }
                }
            }
        }
        info!("Channel intake closed, router exiting");
    }

    async fn handle_metadata(&self, meta: ChatMetadata) {
        if let Ok(Some(_)) = self.store.get(&meta.chat_id).await {
            if let Err(e) = self.store.update_last_seen(&meta.chat_id, meta.timestamp).await {
                warn!("Failed to update last-seen: {}", e);
            }
        }
        self.metadata
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(meta.chat_id.clone(), meta);
    }

    pub async fn handle_message(&self, msg: InboundMessage) -> anyhow::Result<RouteDecision> {
        if msg.is_self {
            return Ok(RouteDecision::DroppedSelf);
        }

        if self.is_duplicate(&msg) {
            debug!(chat_id = %msg.chat_id, "Duplicate message id, dropping");
            return Ok(RouteDecision::DroppedDuplicate);
        }

        let conversation = match self.store.get(&msg.chat_id).await? {
            Some(c) => c,
            None => match self.try_auto_register(&msg).await? {
                Some(c) => c,
                None => {
                    debug!(chat_id = %msg.chat_id, "Unknown conversation, dropping");
                    return Ok(RouteDecision::DroppedUnknown);
                }
            },
        };

        let payload = if conversation.requires_trigger && !conversation.trigger.is_empty() {
            match self.match_trigger(&conversation.trigger, &msg.text) {
                Some(stripped) => stripped,
                None => return Ok(RouteDecision::DroppedNoTrigger),
            }
        } else {
            msg.text.clone()
        };

        self.store.update_last_seen(&msg.chat_id, Utc::now()).await?;

        let folder = conversation.folder.clone();
        self.workers
            .enqueue(TurnRequest {
                folder: folder.clone(),
                chat_id: msg.chat_id.clone(),
                prompt: payload.clone(),
                purpose: "chat".to_string(),
                is_main: folder == self.main_folder,
                caps: conversation.caps,
                container_config: conversation.container_config.clone(),
            })
            .await;

        Ok(RouteDecision::Enqueued { folder, payload })
    }

    fn is_duplicate(&self, msg: &InboundMessage) -> bool {
        let key = format!("{}:{}", msg.chat_id, msg.id);
        let mut recent = self.recent_ids.lock().unwrap_or_else(|p| p.into_inner());
        if recent.contains(&key) {
            return true;
        }
        recent.push_back(key);
        while recent.len() > DEDUP_WINDOW {
            recent.pop_front();
        }
        false
    }

    /// Case-insensitive `^@<trigger>\b`; on match, returns the text with
    /// the prefix stripped.
    fn match_trigger(&self, trigger: &str, text: &str) -> Option<String> {
        let mut cache = self.triggers.lock().unwrap_or_else(|p| p.into_inner());
        let re = cache.entry(trigger.to_string()).or_insert_with(|| {
            Regex::new(&format!(r"(?i)^@{}\b", regex::escape(trigger)))
                .expect("escaped trigger token always compiles")
        });
        re.find(text)
            .map(|m| text[m.end()..].trim_start().to_string())
    }

    /// Insert a default conversation for an unknown inbound when the
    /// owning transport's policy allows it.
    async fn try_auto_register(
        &self,
        msg: &InboundMessage,
    ) -> anyhow::Result<Option<Conversation>> {
        let meta = self
            .metadata
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&msg.chat_id)
            .cloned();

        let transport = meta
            .as_ref()
            .map(|m| m.transport.clone())
            .unwrap_or_else(|| msg.chat_id.transport().to_string());

        let Some(policy) = self.policies.get(&transport).filter(|p| p.enabled) else {
            return Ok(None);
        };

        let is_group = meta.as_ref().map(|m| m.is_group).unwrap_or(false);
        let display_name = meta
            .and_then(|m| m.name)
            .unwrap_or_else(|| msg.chat_id.to_string());

        let now = Utc::now();
        let conversation = Conversation {
            chat_id: msg.chat_id.clone(),
            display_name,
            folder: folder_slug(msg.chat_id.as_str()),
            trigger: if is_group {
                self.default_trigger.clone()
            } else {
                String::new()
            },
            requires_trigger: is_group && policy.group_requires_trigger,
            caps: Capabilities::default(),
            container_config: None,
            created_at: now,
            last_active: now,
        };

        match self.store.put(&conversation).await {
            Ok(()) => {
                info!(chat_id = %msg.chat_id, folder = %conversation.folder, "Auto-registered conversation");
                Ok(Some(conversation))
            }
            Err(e) => {
                warn!(chat_id = %msg.chat_id, "Auto-registration failed: {}", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::PrefixTestChannel;
    use crate::channels::ChannelHub;
    use crate::pool::PoolSettings;
    use std::time::Duration;

    const NOOP_WORKER: &str = r#"
        while read -r line; do
            echo '{"type":"done"}'
        done
    "#;

    async fn test_router(
        policies: HashMap<String, AutoRegisterPolicy>,
    ) -> (
        Router,
        Arc<WorkerPool>,
        Arc<Store>,
        tempfile::TempDir,
        tempfile::NamedTempFile,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(Store::open(db_file.path().to_str().unwrap()).await.unwrap());
        let hub = Arc::new(ChannelHub::new(vec![
            Arc::new(PrefixTestChannel::new("sig:", true)) as Arc<dyn crate::channels::Channel>,
        ]));
        let workers = Arc::new(WorkerPool::new(
            PoolSettings {
                max_workers: 5,
                idle: Duration::from_secs(300),
                turn_timeout: Duration::from_secs(120),
                apology: String::new(),
                command: "sh".to_string(),
                args: vec!["-c".to_string(), NOOP_WORKER.to_string()],
                data_dir: dir.path().join("data"),
                ipc_root: dir.path().join("ipc"),
                main_folder: "main".to_string(),
            },
            store.clone(),
            hub,
        ));
        let router = Router::new(
            store.clone(),
            workers.clone(),
            "main".to_string(),
            policies,
            "Andy".to_string(),
        );
        (router, workers, store, dir, db_file)
    }

    async fn register_with_trigger(store: &Store, chat_id: &str, folder: &str, trigger: &str) {
        let now = Utc::now();
        store
            .put(&Conversation {
                chat_id: ChatId::new(chat_id),
                display_name: folder.to_string(),
                folder: folder.to_string(),
                trigger: trigger.to_string(),
                requires_trigger: !trigger.is_empty(),
                caps: Capabilities::default(),
                container_config: None,
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();
    }

    fn inbound(chat_id: &str, id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            chat_id: ChatId::new(chat_id),
            sender_id: "+15551230001".to_string(),
            sender_name: "Alice".to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
            is_self: false,
            is_bot: false,
        }
    }

    #[tokio::test]
    async fn trigger_gate_drops_and_strips() {
        let (router, workers, store, _dir, _db) = test_router(HashMap::new()).await;
        register_with_trigger(&store, "sig:group:g1", "family", "Andy").await;

        // No trigger prefix: dropped, no worker spawned.
        let decision = router
            .handle_message(inbound("sig:group:g1", "m1", "hi there"))
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::DroppedNoTrigger);
        assert_eq!(workers.live_workers().await, 0);

        // Trigger prefix: enqueued with the prefix stripped.
        let decision = router
            .handle_message(inbound("sig:group:g1", "m2", "@Andy ping"))
            .await
            .unwrap();
        assert_eq!(
            decision,
            RouteDecision::Enqueued {
                folder: "family".to_string(),
                payload: "ping".to_string(),
            }
        );

        // Case-insensitive, word boundary respected.
        let decision = router
            .handle_message(inbound("sig:group:g1", "m3", "@andy pong"))
            .await
            .unwrap();
        assert!(matches!(decision, RouteDecision::Enqueued { payload, .. } if payload == "pong"));

        let decision = router
            .handle_message(inbound("sig:group:g1", "m4", "@Andyish nope"))
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::DroppedNoTrigger);
    }

    #[tokio::test]
    async fn self_messages_dropped() {
        let (router, _workers, store, _dir, _db) = test_router(HashMap::new()).await;
        register_with_trigger(&store, "sig:+15551230001", "alice", "").await;

        let mut msg = inbound("sig:+15551230001", "m1", "echo");
        msg.is_self = true;
        assert_eq!(
            router.handle_message(msg).await.unwrap(),
            RouteDecision::DroppedSelf
        );
    }

    #[tokio::test]
    async fn duplicate_ids_are_noops() {
        let (router, _workers, store, _dir, _db) = test_router(HashMap::new()).await;
        register_with_trigger(&store, "sig:+15551230001", "alice", "").await;

        let first = router
            .handle_message(inbound("sig:+15551230001", "m1", "hello"))
            .await
            .unwrap();
        assert!(matches!(first, RouteDecision::Enqueued { .. }));

        let second = router
            .handle_message(inbound("sig:+15551230001", "m1", "hello"))
            .await
            .unwrap();
        assert_eq!(second, RouteDecision::DroppedDuplicate);
    }

    #[tokio::test]
    async fn unknown_without_policy_dropped() {
        let (router, workers, _store, _dir, _db) = test_router(HashMap::new()).await;

        let decision = router
            .handle_message(inbound("sig:+15559998888", "m1", "hello"))
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::DroppedUnknown);
        assert_eq!(workers.live_workers().await, 0);
    }

    #[tokio::test]
    async fn auto_register_inserts_default_conversation() {
        let mut policies = HashMap::new();
        policies.insert(
            "sig".to_string(),
            AutoRegisterPolicy {
                enabled: true,
                group_requires_trigger: true,
            },
        );
        let (router, _workers, store, _dir, _db) = test_router(policies).await;

        let decision = router
            .handle_message(inbound("sig:+15559998888", "m1", "hello"))
            .await
            .unwrap();
        assert!(matches!(decision, RouteDecision::Enqueued { .. }));

        let registered = store
            .get(&ChatId::new("sig:+15559998888"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registered.folder, "sig-15559998888");
        assert!(!registered.requires_trigger);
    }

    #[tokio::test]
    async fn auto_registered_group_gets_trigger_gate() {
        let mut policies = HashMap::new();
        policies.insert(
            "sig".to_string(),
            AutoRegisterPolicy {
                enabled: true,
                group_requires_trigger: true,
            },
        );
        let (router, _workers, store, _dir, _db) = test_router(policies).await;

        router
            .handle_metadata(ChatMetadata {
                chat_id: ChatId::new("sig:group:abc"),
                timestamp: Utc::now(),
                name: None,
                transport: "sig".to_string(),
                is_group: true,
            })
            .await;

        // First group message without the trigger registers, then drops.
        let decision = router
            .handle_message(inbound("sig:group:abc", "m1", "hello all"))
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::DroppedNoTrigger);

        let registered = store.get(&ChatId::new("sig:group:abc")).await.unwrap().unwrap();
        assert!(registered.requires_trigger);
        assert_eq!(registered.trigger, "Andy");

        let decision = router
            .handle_message(inbound("sig:group:abc", "m2", "@Andy status"))
            .await
            .unwrap();
        assert!(matches!(decision, RouteDecision::Enqueued { payload, .. } if payload == "status"));
    }
}
