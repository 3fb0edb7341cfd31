//! Filesystem tool IPC: the request/response fabric between live workers
//! and host services.
//!
//! Workers drop `<unix-ms>-<random>.json` files (written as `.tmp`, then
//! renamed) into `<root>/<folder>/{messages,tasks,reminders,bookmarks}/`.
//! The host sweeps each directory on a short interval, dispatches every
//! completed file in lexicographic order, and unlinks it. Synchronous
//! tools name a `response_file`; the handler writes the result envelope
//! into the same directory with the same rename dance.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::bookmarks::BookmarkRelay;
use crate::channels::ChannelHub;
use crate::reminders::RemindersBridge;
use crate::scheduler::{NewTask, Scheduler};
use crate::snapshots::{write_json_atomic, Snapshots};
use crate::store::Store;
use crate::types::{Capabilities, ChatId, Conversation};

/// Tool families, one subdirectory each per conversation.
pub const FAMILIES: [&str; 4] = ["messages", "tasks", "reminders", "bookmarks"];

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ToolOp {
    /// Out-of-band message delivery through the owning channel.
    Message {
        chat_id: String,
        text: String,
        #[serde(default)]
        sender_label: Option<String>,
    },
    ScheduleTask {
        prompt: String,
        kind: String,
        value: String,
        #[serde(default)]
        folder: Option<String>,
        #[serde(default)]
        context: Option<String>,
    },
    PauseTask {
        id: String,
    },
    ResumeTask {
        id: String,
    },
    CancelTask {
        id: String,
    },
    RegisterGroup {
        chat_id: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: Option<String>,
        #[serde(default)]
        requires_trigger: Option<bool>,
        #[serde(default)]
        capabilities: Option<Capabilities>,
    },
    LinkAccount {
        chat_id: String,
        folder: String,
        #[serde(default)]
        name: Option<String>,
    },
    Reminders {
        action: String,
        #[serde(default)]
        params: Value,
    },
    Bookmark {
        action: String,
        #[serde(default)]
        url: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    #[serde(flatten)]
    pub op: ToolOp,
    #[serde(default)]
    pub response_file: Option<String>,
}

/// Outcome of one tool dispatch, rendered into the response envelope.
enum ToolOutcome {
    Ok(Value),
    Err(String),
}

impl ToolOutcome {
    fn envelope(&self) -> Value {
        match self {
            ToolOutcome::Ok(result) => json!({ "isError": false, "result": result }),
            ToolOutcome::Err(message) => json!({ "isError": true, "message": message }),
        }
    }
}

pub struct IpcServer {
    root: PathBuf,
    sweep_interval: Duration,
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    hub: Arc<ChannelHub>,
    snapshots: Arc<Snapshots>,
    reminders: Option<Arc<RemindersBridge>>,
    bookmarks: Option<Arc<BookmarkRelay>>,
    main_folder: String,
    /// Files that failed to parse: skipped, logged once, never deleted.
    poisoned: StdMutex<HashSet<PathBuf>>,
}

impl IpcServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        sweep_ms: u64,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        hub: Arc<ChannelHub>,
        snapshots: Arc<Snapshots>,
        reminders: Option<Arc<RemindersBridge>>,
        bookmarks: Option<Arc<BookmarkRelay>>,
        main_folder: String,
    ) -> Self {
        Self {
            root,
            sweep_interval: Duration::from_millis(sweep_ms),
            store,
            scheduler,
            hub,
            snapshots,
            reminders,
            bookmarks,
            main_folder,
            poisoned: StdMutex::new(HashSet::new()),
        }
    }

    pub fn spawn(self: Arc<Self>) {
        info!(root = %self.root.display(), "Tool IPC server spawned");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.sweep().await {
                    error!("IPC sweep failed: {}", e);
                }
                tokio::time::sleep(this.sweep_interval).await;
            }
        });
    }

    /// One pass over every conversation directory and tool family.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(_) => return Ok(()), // root not created yet
        };

        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let folder = entry.file_name().to_string_lossy().to_string();
            for family in FAMILIES {
                let dir = entry.path().join(family);
                self.sweep_dir(&folder, &dir).await;
            }
        }
        Ok(())
    }

    async fn sweep_dir(&self, folder: &str, dir: &Path) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(_) => return,
        };

        let mut files: Vec<PathBuf> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            // Writers rename into place; anything still suffixed .tmp is
            // an incomplete write.
            if name.ends_with(".tmp") || !name.ends_with(".json") {
                continue;
            }
            files.push(path);
        }
        // Filenames start with a millisecond timestamp, so lexicographic
        // order approximates arrival order.
        files.sort();

        for path in files {
            if self
                .poisoned
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .contains(&path)
            {
                continue;
            }
            self.process_file(folder, &path).await;
        }
    }

    async fn process_file(&self, folder: &str, path: &Path) {
        let body = match tokio::fs::read_to_string(path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), "Failed to read tool request: {}", e);
                return;
            }
        };

        let value: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), "Malformed tool request, leaving for inspection: {}", e);
                self.poison(path);
                return;
            }
        };

        // Response envelopes awaiting worker pickup live in the same
        // directory; they are not requests.
        if value.get("isError").is_some() {
            return;
        }

        let request: ToolRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), "Unrecognized tool request, leaving for inspection: {}", e);
                self.poison(path);
                return;
            }
        };

        let outcome = self.dispatch(folder, &request.op).await;
        if let ToolOutcome::Err(message) = &outcome {
            warn!(folder = %folder, message = %message, "Tool request rejected");
        }

        if let Some(response_file) = &request.response_file {
            let response_path = path.with_file_name(response_file);
            if let Err(e) = write_json_atomic(&response_path, &outcome.envelope()).await {
                error!(path = %response_path.display(), "Failed to write tool response: {}", e);
            }
        }

        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), "Failed to unlink tool request: {}", e);
        }
    }

    fn poison(&self, path: &Path) {
        self.poisoned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.to_path_buf());
    }

    async fn dispatch(&self, folder: &str, op: &ToolOp) -> ToolOutcome {
        let is_main = folder == self.main_folder;
        match op {
            ToolOp::Message {
                chat_id,
                text,
                sender_label,
            } => {
                self.hub
                    .send(&ChatId::new(chat_id.clone()), text, sender_label.as_deref())
                    .await;
                ToolOutcome::Ok(json!({ "sent": true }))
            }

            ToolOp::ScheduleTask {
                prompt,
                kind,
                value,
                folder: target,
                context,
            } => {
                let target_folder = match target {
                    Some(t) if !is_main && t != folder => {
                        return ToolOutcome::Err(format!(
                            "Only the main group can schedule tasks for other folders (requested '{}')",
                            t
                        ));
                    }
                    Some(t) => Some(t.clone()),
                    None if is_main => None,
                    None => Some(folder.to_string()),
                };

                match self
                    .scheduler
                    .schedule(NewTask {
                        folder: target_folder,
                        prompt: prompt.clone(),
                        kind: kind.clone(),
                        value: value.clone(),
                        context: context.clone(),
                        group_folder: Some(folder.to_string()),
                    })
                    .await
                {
                    Ok(task) => {
                        self.refresh_task_snapshots().await;
                        ToolOutcome::Ok(json!({ "task_id": task.id, "status": task.status }))
                    }
                    Err(e) => ToolOutcome::Err(e.to_string()),
                }
            }

            ToolOp::PauseTask { id } => self.mutate_task(folder, id, "pause").await,
            ToolOp::ResumeTask { id } => self.mutate_task(folder, id, "resume").await,
            ToolOp::CancelTask { id } => self.mutate_task(folder, id, "cancel").await,

            ToolOp::RegisterGroup {
                chat_id,
                name,
                folder: new_folder,
                trigger,
                requires_trigger,
                capabilities,
            } => {
                if !is_main {
                    return ToolOutcome::Err(
                        "Only the main group can register new groups".to_string(),
                    );
                }
                let now = chrono::Utc::now();
                let conversation = Conversation {
                    chat_id: ChatId::new(chat_id.clone()),
                    display_name: name.clone(),
                    folder: new_folder.clone(),
                    trigger: trigger.clone().unwrap_or_default(),
                    requires_trigger: requires_trigger.unwrap_or(false),
                    caps: capabilities.unwrap_or_default(),
                    container_config: None,
                    created_at: now,
                    last_active: now,
                };
                match self.store.put(&conversation).await {
                    Ok(()) => {
                        if let Err(e) = self.snapshots.refresh_groups().await {
                            warn!("Group snapshot refresh failed: {}", e);
                        }
                        ToolOutcome::Ok(json!({ "registered": conversation.folder }))
                    }
                    Err(e) => ToolOutcome::Err(e.to_string()),
                }
            }

            ToolOp::LinkAccount {
                chat_id,
                folder: target_folder,
                name,
            } => {
                if !is_main {
                    return ToolOutcome::Err(
                        "Only the main group can link accounts".to_string(),
                    );
                }
                match self
                    .store
                    .link(&ChatId::new(chat_id.clone()), target_folder, name.as_deref())
                    .await
                {
                    Ok(linked) => {
                        if let Err(e) = self.snapshots.refresh_groups().await {
                            warn!("Group snapshot refresh failed: {}", e);
                        }
                        ToolOutcome::Ok(json!({ "linked": linked.folder }))
                    }
                    Err(e) => ToolOutcome::Err(e.to_string()),
                }
            }

            ToolOp::Reminders { action, params } => {
                self.reminders_op(folder, action, params).await
            }

            ToolOp::Bookmark { action, url } => self.bookmark_op(folder, action, url.as_deref()).await,
        }
    }

    /// Non-main conversations may only mutate tasks their own folder owns.
    async fn mutate_task(&self, folder: &str, id: &str, action: &str) -> ToolOutcome {
        let is_main = folder == self.main_folder;

        let task = match self.scheduler.get(id).await {
            Ok(Some(t)) => t,
            Ok(None) => return ToolOutcome::Err(format!("no task with id '{}'", id)),
            Err(e) => return ToolOutcome::Err(e.to_string()),
        };

        if !is_main && task.folder.as_deref() != Some(folder) {
            return ToolOutcome::Err(
                "Only the main group can manage tasks owned by other folders".to_string(),
            );
        }

        let result = match action {
            "pause" => self.scheduler.pause(id).await,
            "resume" => self.scheduler.resume(id).await,
            "cancel" => self.scheduler.cancel(id).await,
            _ => unreachable!("task actions are fixed"),
        };

        match result {
            Ok(()) => {
                self.refresh_task_snapshots().await;
                ToolOutcome::Ok(json!({ "task_id": id, "action": action }))
            }
            Err(e) => ToolOutcome::Err(e.to_string()),
        }
    }

    async fn reminders_op(&self, folder: &str, action: &str, params: &Value) -> ToolOutcome {
        let Some(bridge) = &self.reminders else {
            return ToolOutcome::Err("reminders bridge is not configured".to_string());
        };
        if !self.has_capability(folder, |c| c.reminders).await {
            return ToolOutcome::Err(format!(
                "reminders capability is not enabled for '{}'",
                folder
            ));
        }

        let operation = match action {
            "create" => "create_reminder",
            "complete" => "complete_reminder",
            "update" => "update_reminder",
            "snapshot" => "snapshot",
            other => return ToolOutcome::Err(format!("unknown reminders action '{}'", other)),
        };

        let result = match bridge.call(operation, params.clone()).await {
            Ok(v) => v,
            Err(e) => return ToolOutcome::Err(format!("reminders bridge failed: {}", e)),
        };

        // Mutations re-materialize the snapshot the worker reads.
        let refresh = match action {
            "snapshot" => Some(result.clone()),
            "create" | "complete" | "update" => bridge.snapshot().await.ok(),
            _ => None,
        };
        if let Some(snapshot) = refresh {
            if let Err(e) = self.snapshots.write_reminders(folder, &snapshot).await {
                warn!(folder = %folder, "Reminder snapshot write failed: {}", e);
            }
        }

        ToolOutcome::Ok(result)
    }

    async fn bookmark_op(&self, folder: &str, action: &str, url: Option<&str>) -> ToolOutcome {
        let Some(relay) = &self.bookmarks else {
            return ToolOutcome::Err("bookmark relay is not configured".to_string());
        };
        if !self.has_capability(folder, |c| c.bookmarks).await {
            return ToolOutcome::Err(format!(
                "bookmarks capability is not enabled for '{}'",
                folder
            ));
        }

        let result = match action {
            "url" => match url {
                Some(u) => relay.intake(u).await,
                None => return ToolOutcome::Err("bookmark url is required".to_string()),
            },
            "health" => relay.health().await,
            "recent" => relay.recent().await,
            other => return ToolOutcome::Err(format!("unknown bookmark action '{}'", other)),
        };

        match result {
            Ok(v) => ToolOutcome::Ok(v),
            Err(e) => ToolOutcome::Err(e.to_string()),
        }
    }

    async fn has_capability(&self, folder: &str, select: impl Fn(&Capabilities) -> bool) -> bool {
        match self.store.representative(folder).await {
            Ok(Some(rep)) => select(&rep.caps),
            _ => false,
        }
    }

    async fn refresh_task_snapshots(&self) {
        if let Err(e) = self.snapshots.refresh_tasks().await {
            warn!("Task snapshot refresh failed: {}", e);
        }
    }
}

/// Request filename per the atomicity contract: a monotonic millisecond
/// timestamp plus a random suffix.
pub fn request_filename() -> String {
    let ms = chrono::Utc::now().timestamp_millis();
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}-{}.json", ms, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::PrefixTestChannel;
    use crate::pool::{PoolSettings, WorkerPool};
    use chrono::Utc;

    struct Harness {
        server: Arc<IpcServer>,
        channel: Arc<PrefixTestChannel>,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        dir: tempfile::TempDir,
        _db: tempfile::NamedTempFile,
    }

    async fn harness(reminders: Option<Arc<RemindersBridge>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(Store::open(db_file.path().to_str().unwrap()).await.unwrap());
        let channel = Arc::new(PrefixTestChannel::new("sig:", true));
        let hub = Arc::new(ChannelHub::new(vec![
            channel.clone() as Arc<dyn crate::channels::Channel>
        ]));
        let ipc_root = dir.path().join("ipc");
        let workers = Arc::new(WorkerPool::new(
            PoolSettings {
                max_workers: 5,
                idle: Duration::from_secs(300),
                turn_timeout: Duration::from_secs(120),
                apology: String::new(),
                command: "true".to_string(),
                args: vec![],
                data_dir: dir.path().join("data"),
                ipc_root: ipc_root.clone(),
                main_folder: "main".to_string(),
            },
            store.clone(),
            hub.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.pool(),
            workers,
            store.clone(),
            60,
            "main".to_string(),
        ));
        let snapshots = Arc::new(Snapshots::new(
            ipc_root.clone(),
            store.clone(),
            scheduler.clone(),
            "main".to_string(),
        ));
        let server = Arc::new(IpcServer::new(
            ipc_root,
            1000,
            store.clone(),
            scheduler.clone(),
            hub,
            snapshots,
            reminders,
            None,
            "main".to_string(),
        ));
        Harness {
            server,
            channel,
            store,
            scheduler,
            dir,
            _db: db_file,
        }
    }

    async fn register(store: &Store, chat_id: &str, folder: &str, caps: Capabilities) {
        let now = Utc::now();
        store
            .put(&Conversation {
                chat_id: ChatId::new(chat_id),
                display_name: folder.to_string(),
                folder: folder.to_string(),
                trigger: String::new(),
                requires_trigger: false,
                caps,
                container_config: None,
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();
    }

    /// Drop a request the way workers do: tmp write, then rename.
    async fn drop_request(h: &Harness, folder: &str, family: &str, body: Value) -> PathBuf {
        let dir = h.dir.path().join("ipc").join(folder).join(family);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let name = request_filename();
        let tmp = dir.join(format!("{}.tmp", name));
        tokio::fs::write(&tmp, serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
        let path = dir.join(&name);
        tokio::fs::rename(&tmp, &path).await.unwrap();
        path
    }

    async fn read_response(dir: &Path, name: &str) -> Value {
        let body = tokio::fs::read_to_string(dir.join(name)).await.unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn message_op_routes_through_hub_and_unlinks() {
        let h = harness(None).await;
        register(&h.store, "sig:+15550001111", "alice", Capabilities::default()).await;

        let path = drop_request(
            &h,
            "alice",
            "messages",
            json!({
                "op": "message",
                "chat_id": "sig:+15550002222",
                "text": "heads up",
                "sender_label": "andy"
            }),
        )
        .await;

        h.server.sweep().await.unwrap();

        let delivered = h.channel.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "heads up");
        assert_eq!(delivered[0].sender_label.as_deref(), Some("andy"));
        assert!(!path.exists(), "request file must be consumed");
    }

    #[tokio::test]
    async fn tmp_files_are_ignored() {
        let h = harness(None).await;
        let dir = h.dir.path().join("ipc/alice/messages");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("123-abc.json.tmp"),
            br#"{"op":"message","chat_id":"sig:+1","text":"partial"#,
        )
        .await
        .unwrap();

        h.server.sweep().await.unwrap();
        assert!(h.channel.delivered.lock().await.is_empty());
        assert!(dir.join("123-abc.json.tmp").exists());
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_and_kept() {
        let h = harness(None).await;
        let dir = h.dir.path().join("ipc/alice/messages");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("123-bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        h.server.sweep().await.unwrap();
        h.server.sweep().await.unwrap();
        assert!(path.exists(), "corrupt requests stay for inspection");
    }

    #[tokio::test]
    async fn schedule_validation_surfaces_in_response_file() {
        let h = harness(None).await;
        register(&h.store, "sig:+15550001111", "alice", Capabilities::default()).await;

        drop_request(
            &h,
            "alice",
            "tasks",
            json!({
                "op": "schedule_task",
                "prompt": "ping",
                "kind": "once",
                "value": "2026-02-01T15:30:00Z",
                "response_file": "resp-1.json"
            }),
        )
        .await;
        h.server.sweep().await.unwrap();

        let resp = read_response(&h.dir.path().join("ipc/alice/tasks"), "resp-1.json").await;
        assert_eq!(resp["isError"], json!(true));
        assert!(resp["message"]
            .as_str()
            .unwrap()
            .contains("without timezone suffix"));

        // Valid local timestamp is accepted and lands as an active row.
        drop_request(
            &h,
            "alice",
            "tasks",
            json!({
                "op": "schedule_task",
                "prompt": "ping",
                "kind": "once",
                "value": "2099-02-01T15:30:00",
                "response_file": "resp-2.json"
            }),
        )
        .await;
        h.server.sweep().await.unwrap();

        let resp = read_response(&h.dir.path().join("ipc/alice/tasks"), "resp-2.json").await;
        assert_eq!(resp["isError"], json!(false));
        let tasks = h.scheduler.list(Some("alice")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, "active");
    }

    #[tokio::test]
    async fn register_group_requires_main_privilege() {
        let h = harness(None).await;
        register(&h.store, "sig:+15550001111", "main", Capabilities::default()).await;
        register(&h.store, "sig:+15550002222", "alice", Capabilities::default()).await;

        drop_request(
            &h,
            "alice",
            "messages",
            json!({
                "op": "register_group",
                "chat_id": "sig:group:g9",
                "name": "Family",
                "folder": "family",
                "response_file": "resp.json"
            }),
        )
        .await;
        h.server.sweep().await.unwrap();

        let resp = read_response(&h.dir.path().join("ipc/alice/messages"), "resp.json").await;
        assert_eq!(resp["isError"], json!(true));
        assert!(resp["message"].as_str().unwrap().contains("Only the main group"));
        assert!(h.store.get(&ChatId::new("sig:group:g9")).await.unwrap().is_none());

        // Same call from main succeeds and shows up in the address book.
        drop_request(
            &h,
            "main",
            "messages",
            json!({
                "op": "register_group",
                "chat_id": "sig:group:g9",
                "name": "Family",
                "folder": "family",
                "trigger": "Andy",
                "requires_trigger": true,
                "response_file": "resp.json"
            }),
        )
        .await;
        h.server.sweep().await.unwrap();

        let resp = read_response(&h.dir.path().join("ipc/main/messages"), "resp.json").await;
        assert_eq!(resp["isError"], json!(false));
        let registered = h.store.get(&ChatId::new("sig:group:g9")).await.unwrap().unwrap();
        assert_eq!(registered.folder, "family");
        assert!(registered.requires_trigger);

        // groups.json reflects the mutation.
        let groups = tokio::fs::read_to_string(h.dir.path().join("ipc/main/groups.json"))
            .await
            .unwrap();
        assert!(groups.contains("family"));
    }

    #[tokio::test]
    async fn non_main_cannot_mutate_foreign_tasks() {
        let h = harness(None).await;
        register(&h.store, "sig:+15550001111", "main", Capabilities::default()).await;
        register(&h.store, "sig:+15550002222", "alice", Capabilities::default()).await;
        register(&h.store, "sig:+15550003333", "bob", Capabilities::default()).await;

        let task = h
            .scheduler
            .schedule(NewTask {
                folder: Some("bob".to_string()),
                prompt: "p".to_string(),
                kind: "cron".to_string(),
                value: "0 9 * * *".to_string(),
                context: None,
                group_folder: Some("bob".to_string()),
            })
            .await
            .unwrap();

        drop_request(
            &h,
            "alice",
            "tasks",
            json!({
                "op": "cancel_task",
                "id": task.id,
                "response_file": "resp.json"
            }),
        )
        .await;
        h.server.sweep().await.unwrap();

        let resp = read_response(&h.dir.path().join("ipc/alice/tasks"), "resp.json").await;
        assert_eq!(resp["isError"], json!(true));
        assert!(resp["message"].as_str().unwrap().contains("Only the main group"));
        assert!(h.scheduler.get(&task.id).await.unwrap().is_some());

        // Main can cancel anything.
        drop_request(
            &h,
            "main",
            "tasks",
            json!({ "op": "cancel_task", "id": task.id }),
        )
        .await;
        h.server.sweep().await.unwrap();
        assert!(h.scheduler.get(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn link_account_round_trip_via_ipc() {
        let h = harness(None).await;
        register(&h.store, "sig:+15550001111", "main", Capabilities::default()).await;
        register(&h.store, "sig:+15550002222", "alice", Capabilities::default()).await;

        drop_request(
            &h,
            "main",
            "messages",
            json!({
                "op": "link_account",
                "chat_id": "slack:U42",
                "folder": "alice",
                "response_file": "resp.json"
            }),
        )
        .await;
        h.server.sweep().await.unwrap();

        let resp = read_response(&h.dir.path().join("ipc/main/messages"), "resp.json").await;
        assert_eq!(resp["isError"], json!(false));

        let linked = h.store.get(&ChatId::new("slack:U42")).await.unwrap().unwrap();
        assert_eq!(linked.folder, "alice");
    }

    #[tokio::test]
    async fn reminders_require_capability_and_bridge() {
        let bridge = Arc::new(RemindersBridge::new(
            "sh",
            &[
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"reminders":[],"total":0}'"#.to_string(),
            ],
        ));
        let h = harness(Some(bridge)).await;
        register(&h.store, "sig:+15550001111", "alice", Capabilities::default()).await;
        register(
            &h.store,
            "sig:+15550002222",
            "bob",
            Capabilities {
                reminders: true,
                ..Default::default()
            },
        )
        .await;

        // No capability: rejected.
        drop_request(
            &h,
            "alice",
            "reminders",
            json!({ "op": "reminders", "action": "snapshot", "response_file": "resp.json" }),
        )
        .await;
        h.server.sweep().await.unwrap();
        let resp = read_response(&h.dir.path().join("ipc/alice/reminders"), "resp.json").await;
        assert_eq!(resp["isError"], json!(true));

        // Capability present: bridge result passes through and the
        // snapshot file materializes.
        drop_request(
            &h,
            "bob",
            "reminders",
            json!({ "op": "reminders", "action": "snapshot", "response_file": "resp.json" }),
        )
        .await;
        h.server.sweep().await.unwrap();
        let resp = read_response(&h.dir.path().join("ipc/bob/reminders"), "resp.json").await;
        assert_eq!(resp["isError"], json!(false));
        assert_eq!(resp["result"]["total"], json!(0));
        assert!(h.dir.path().join("ipc/bob/reminders_snapshot.json").exists());
    }

    #[test]
    fn request_filenames_follow_contract() {
        let a = request_filename();
        let b = request_filename();
        assert!(a.ends_with(".json"));
        assert_ne!(a, b);
        let ms_part = a.split('-').next().unwrap();
        assert!(ms_part.parse::<i64>().unwrap() > 0);
    }
}
