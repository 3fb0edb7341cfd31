//! Read-only JSON materialization into each conversation's IPC directory.
//!
//! Workers never query the host; they read `groups.json`,
//! `current_tasks.json`, `available_groups.json` and
//! `reminders_snapshot.json` for a point-in-time view. Files are written
//! with the same tmp+rename dance the tool IPC uses, so a worker never
//! observes a partial body.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, warn};

use crate::scheduler::Scheduler;
use crate::store::Store;

pub struct Snapshots {
    ipc_root: PathBuf,
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    main_folder: String,
}

impl Snapshots {
    pub fn new(
        ipc_root: PathBuf,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        main_folder: String,
    ) -> Self {
        Self {
            ipc_root,
            store,
            scheduler,
            main_folder,
        }
    }

    /// Periodic refresh loop; mutations also refresh eagerly through the
    /// tool-IPC handlers.
    pub fn spawn_periodic(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let interval = Duration::from_secs(interval_secs);
            loop {
                if let Err(e) = self.refresh_all().await {
                    error!("Snapshot refresh failed: {}", e);
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    pub async fn refresh_all(&self) -> anyhow::Result<()> {
        self.refresh_groups().await?;
        self.refresh_tasks().await?;
        Ok(())
    }

    /// `groups.json`: the main conversation sees every record, others only
    /// the records sharing their folder. `available_groups.json` is the
    /// folder/name list workers use to target out-of-band sends.
    pub async fn refresh_groups(&self) -> anyhow::Result<()> {
        let all = self.store.list().await?;

        let mut available: Vec<Value> = Vec::new();
        let mut seen_folders: Vec<String> = Vec::new();
        for conv in &all {
            if !seen_folders.contains(&conv.folder) {
                seen_folders.push(conv.folder.clone());
                available.push(json!({
                    "folder": conv.folder,
                    "name": conv.display_name,
                }));
            }
        }
        let available = Value::Array(available);

        for folder in &seen_folders {
            let dir = self.ipc_root.join(folder);
            let visible: Vec<_> = if *folder == self.main_folder {
                all.iter().collect()
            } else {
                all.iter().filter(|c| c.folder == *folder).collect()
            };

            write_json_atomic(&dir.join("groups.json"), &serde_json::to_value(&visible)?).await?;
            write_json_atomic(&dir.join("available_groups.json"), &available).await?;
        }
        Ok(())
    }

    /// `current_tasks.json`: a non-main conversation sees only its own
    /// tasks; the main one sees all.
    pub async fn refresh_tasks(&self) -> anyhow::Result<()> {
        for folder in self.store.folders().await? {
            let tasks = if folder == self.main_folder {
                self.scheduler.list(None).await?
            } else {
                self.scheduler.list(Some(&folder)).await?
            };
            let dir = self.ipc_root.join(&folder);
            write_json_atomic(&dir.join("current_tasks.json"), &serde_json::to_value(&tasks)?)
                .await?;
        }
        Ok(())
    }

    /// Drop the verbatim bridge snapshot into one conversation's dir.
    pub async fn write_reminders(&self, folder: &str, snapshot: &Value) -> anyhow::Result<()> {
        let dir = self.ipc_root.join(folder);
        write_json_atomic(&dir.join("reminders_snapshot.json"), snapshot).await
    }
}

/// Write JSON via temp-file + rename so readers only ever see complete
/// bodies.
pub async fn write_json_atomic(path: &Path, value: &Value) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("snapshot path has no parent: {}", path.display()))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!(path = %path.display(), "Snapshot rename failed: {}", e);
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::PrefixTestChannel;
    use crate::channels::ChannelHub;
    use crate::pool::{PoolSettings, WorkerPool};
    use crate::scheduler::NewTask;
    use crate::types::{Capabilities, ChatId, Conversation};
    use chrono::Utc;

    async fn test_snapshots() -> (
        Arc<Snapshots>,
        Arc<Scheduler>,
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
                command: "true".to_string(),
                args: vec![],
                data_dir: dir.path().join("data"),
                ipc_root: dir.path().join("ipc"),
                main_folder: "main".to_string(),
            },
            store.clone(),
            hub,
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.pool(),
            workers,
            store.clone(),
            60,
            "main".to_string(),
        ));
        let snapshots = Arc::new(Snapshots::new(
            dir.path().join("ipc"),
            store.clone(),
            scheduler.clone(),
            "main".to_string(),
        ));
        (snapshots, scheduler, store, dir, db_file)
    }

    async fn register(store: &Store, chat_id: &str, folder: &str) {
        let now = Utc::now();
        store
            .put(&Conversation {
                chat_id: ChatId::new(chat_id),
                display_name: folder.to_string(),
                folder: folder.to_string(),
                trigger: String::new(),
                requires_trigger: false,
                caps: Capabilities::default(),
                container_config: None,
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();
    }

    async fn read_json(path: &Path) -> Value {
        let body = tokio::fs::read_to_string(path).await.unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn groups_snapshot_filters_by_folder() {
        let (snapshots, _scheduler, store, dir, _db) = test_snapshots().await;
        register(&store, "sig:+15550001111", "main").await;
        register(&store, "sig:+15550002222", "alice").await;

        snapshots.refresh_groups().await.unwrap();

        let main_groups = read_json(&dir.path().join("ipc/main/groups.json")).await;
        assert_eq!(main_groups.as_array().unwrap().len(), 2);

        let alice_groups = read_json(&dir.path().join("ipc/alice/groups.json")).await;
        assert_eq!(alice_groups.as_array().unwrap().len(), 1);
        assert_eq!(alice_groups[0]["folder"], json!("alice"));

        let available = read_json(&dir.path().join("ipc/alice/available_groups.json")).await;
        assert_eq!(available.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tasks_snapshot_scopes_to_owner() {
        let (snapshots, scheduler, store, dir, _db) = test_snapshots().await;
        register(&store, "sig:+15550001111", "main").await;
        register(&store, "sig:+15550002222", "alice").await;

        scheduler
            .schedule(NewTask {
                folder: Some("alice".to_string()),
                prompt: "p".to_string(),
                kind: "cron".to_string(),
                value: "0 9 * * *".to_string(),
                context: None,
                group_folder: Some("alice".to_string()),
            })
            .await
            .unwrap();

        snapshots.refresh_tasks().await.unwrap();

        let main_tasks = read_json(&dir.path().join("ipc/main/current_tasks.json")).await;
        assert_eq!(main_tasks.as_array().unwrap().len(), 1);

        let alice_tasks = read_json(&dir.path().join("ipc/alice/current_tasks.json")).await;
        assert_eq!(alice_tasks.as_array().unwrap().len(), 1);
        assert_eq!(alice_tasks[0]["folder"], json!("alice"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let (snapshots, _scheduler, store, dir, _db) = test_snapshots().await;
        register(&store, "sig:+15550001111", "main").await;

        snapshots.refresh_all().await.unwrap();
        snapshots
            .write_reminders("main", &json!({"reminders": [], "total": 0}))
            .await
            .unwrap();

        let mut entries = tokio::fs::read_dir(dir.path().join("ipc/main")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(!name.ends_with(".tmp"), "leftover temp file: {}", name);
        }

        let reminders = read_json(&dir.path().join("ipc/main/reminders_snapshot.json")).await;
        assert_eq!(reminders["total"], json!(0));
    }
}
