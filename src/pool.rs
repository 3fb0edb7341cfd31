//! Bounded pool of per-conversation worker processes.
//!
//! One worker per conversation folder, at most one turn in flight per
//! folder, per-folder FIFO while busy. Turns stream results which are
//! dispatched through the owning channel; results for turn k are fully
//! drained before turn k+1 begins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::ChannelHub;
use crate::store::Store;
use crate::types::{Capabilities, ChatId};
use crate::worker::{result_text, strip_internal, WorkerEvent, WorkerProcess, WorkerSpawn};

/// One queued unit of work for a conversation folder.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub folder: String,
    /// Reply target for streamed results.
    pub chat_id: ChatId,
    pub prompt: String,
    /// Session purpose key: `chat`, `voice`, or `task:<id>`.
    pub purpose: String,
    pub is_main: bool,
    pub caps: Capabilities,
    pub container_config: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub idle: Duration,
    pub turn_timeout: Duration,
    /// Sent once to the conversation when a turn fails. Empty = silent.
    pub apology: String,
    pub command: String,
    pub args: Vec<String>,
    pub data_dir: PathBuf,
    pub ipc_root: PathBuf,
    pub main_folder: String,
}

struct WorkerEntry {
    turn_tx: mpsc::UnboundedSender<TurnRequest>,
    /// Queued plus in-flight turns. Zero = idle, eligible for eviction.
    pending: Arc<AtomicUsize>,
    last_activity: Arc<StdMutex<Instant>>,
    cancel: CancellationToken,
    epoch: u64,
}

pub struct WorkerPool {
    settings: PoolSettings,
    store: Arc<Store>,
    hub: Arc<ChannelHub>,
    inner: Mutex<HashMap<String, WorkerEntry>>,
    next_epoch: AtomicUsize,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, store: Arc<Store>, hub: Arc<ChannelHub>) -> Self {
        Self {
            settings,
            store,
            hub,
            inner: Mutex::new(HashMap::new()),
            next_epoch: AtomicUsize::new(1),
        }
    }

    /// Enqueue a turn on the folder's serialized queue, spawning or
    /// reusing the folder's worker.
    pub async fn enqueue(self: &Arc<Self>, turn: TurnRequest) {
        let mut inner = self.inner.lock().await;

        let mut turn = turn;
        if let Some(entry) = inner.get(&turn.folder) {
            if !entry.cancel.is_cancelled() {
                entry.pending.fetch_add(1, Ordering::SeqCst);
                match entry.turn_tx.send(turn) {
                    Ok(()) => return,
                    // Worker task is gone; replace the stale entry below.
                    Err(rejected) => turn = rejected.0,
                }
            }
        }

        if inner.len() >= self.settings.max_workers {
            self.evict_lru_idle(&mut inner);
        }

        let folder = turn.folder.clone();
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(1));
        let last_activity = Arc::new(StdMutex::new(Instant::now()));
        let cancel = CancellationToken::new();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) as u64;

        let entry = WorkerEntry {
            turn_tx: turn_tx.clone(),
            pending: pending.clone(),
            last_activity: last_activity.clone(),
            cancel: cancel.clone(),
            epoch,
        };
        inner.insert(folder.clone(), entry);
        drop(inner);

        let _ = turn_tx.send(turn);

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.worker_task(folder, turn_rx, pending, last_activity, cancel, epoch)
                .await;
        });
    }

    /// Evict the least-recently-active worker with nothing queued and
    /// nothing in flight. With every worker busy the pool overshoots its
    /// bound for the new spawn rather than dropping a turn.
    fn evict_lru_idle(&self, inner: &mut HashMap<String, WorkerEntry>) {
        let victim = inner
            .iter()
            .filter(|(_, e)| e.pending.load(Ordering::SeqCst) == 0)
            .min_by_key(|(_, e)| *e.last_activity.lock().unwrap_or_else(|p| p.into_inner()))
            .map(|(folder, _)| folder.clone());

        match victim {
            Some(folder) => {
                if let Some(entry) = inner.remove(&folder) {
                    entry.cancel.cancel();
                    info!(folder = %folder, "Evicted idle worker to make room");
                }
            }
            None => {
                warn!(
                    live = inner.len(),
                    max = self.settings.max_workers,
                    "All workers busy; exceeding pool bound for new conversation"
                );
            }
        }
    }

    pub async fn live_workers(&self) -> usize {
        self.inner.lock().await.len()
    }

    async fn worker_task(
        self: Arc<Self>,
        folder: String,
        mut turn_rx: mpsc::UnboundedReceiver<TurnRequest>,
        pending: Arc<AtomicUsize>,
        last_activity: Arc<StdMutex<Instant>>,
        cancel: CancellationToken,
        epoch: u64,
    ) {
        let mut proc: Option<WorkerProcess> = None;

        loop {
            let idle_deadline = {
                let last = *last_activity.lock().unwrap_or_else(|p| p.into_inner());
                tokio::time::Instant::from_std(last + self.settings.idle)
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                maybe_turn = turn_rx.recv() => {
                    match maybe_turn {
                        None => break,
                        Some(turn) => {
                            self.run_turn(&mut proc, &turn).await;
                            pending.fetch_sub(1, Ordering::SeqCst);
                            *last_activity.lock().unwrap_or_else(|p| p.into_inner()) =
                                Instant::now();
                        }
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    if pending.load(Ordering::SeqCst) == 0 {
                        debug!(folder = %folder, "Idle window expired, reaping worker");
                        break;
                    }
                }
            }
        }

        if let Some(mut p) = proc.take() {
            p.kill().await;
        }

        // Remove our own entry unless a newer worker already took the slot.
        let mut inner = self.inner.lock().await;
        if inner.get(&folder).map(|e| e.epoch) == Some(epoch) {
            inner.remove(&folder);
        }
        debug!(folder = %folder, "Worker task exited");
    }

    fn spawn_spec(&self, turn: &TurnRequest) -> WorkerSpawn {
        WorkerSpawn {
            command: self.settings.command.clone(),
            args: self.settings.args.clone(),
            workdir: self
                .settings
                .data_dir
                .join("conversations")
                .join(&turn.folder),
            folder: turn.folder.clone(),
            chat_id: turn.chat_id.clone(),
            is_main: turn.is_main,
            caps: turn.caps,
            ipc_dir: self.settings.ipc_root.join(&turn.folder),
            container_config: turn.container_config.clone(),
        }
    }

    /// Run one turn to completion against the folder's worker process.
    ///
    /// A worker that exits by itself mid-turn is respawned once and the
    /// turn retried; the queue stays intact either way.
    async fn run_turn(&self, proc: &mut Option<WorkerProcess>, turn: &TurnRequest) {
        let spec = self.spawn_spec(turn);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let reusable = match proc.take() {
                Some(mut existing) => {
                    if existing.has_exited() {
                        None
                    } else {
                        Some(existing)
                    }
                }
                None => None,
            };
            let mut p = match reusable {
                Some(existing) => existing,
                None => match WorkerProcess::spawn(&spec) {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        self.fail_turn(turn, &format!("spawn failed: {}", e)).await;
                        return;
                    }
                },
            };

            let session = match self.store.session(&turn.folder, &turn.purpose).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(folder = %turn.folder, "Session lookup failed: {}", e);
                    None
                }
            };

            if let Err(e) = p.send_turn(&turn.prompt, session.as_deref()).await {
                p.kill().await;
                if attempts < 2 {
                    continue;
                }
                self.fail_turn(turn, &format!("worker unavailable: {}", e))
                    .await;
                return;
            }

            let deadline = tokio::time::Instant::now() + self.settings.turn_timeout;
            loop {
                match tokio::time::timeout_at(deadline, p.next_event()).await {
                    Err(_) => {
                        p.kill().await;
                        self.fail_turn(turn, "turn deadline exceeded").await;
                        return;
                    }
                    Ok(Err(e)) => {
                        p.kill().await;
                        self.fail_turn(turn, &format!("worker stream error: {}", e))
                            .await;
                        return;
                    }
                    Ok(Ok(None)) => {
                        // Worker exited on its own.
                        drop(p);
                        if attempts < 2 {
                            break;
                        }
                        self.fail_turn(turn, "worker exited mid-turn").await;
                        return;
                    }
                    Ok(Ok(Some(WorkerEvent::Session { session_id }))) => {
                        if let Err(e) = self
                            .store
                            .set_session(&turn.folder, &turn.purpose, &session_id)
                            .await
                        {
                            warn!(folder = %turn.folder, "Failed to persist session: {}", e);
                        }
                    }
                    Ok(Ok(Some(WorkerEvent::Result { content }))) => {
                        let text = strip_internal(&result_text(&content));
                        if !text.is_empty() {
                            self.hub.send(&turn.chat_id, &text, None).await;
                        }
                    }
                    Ok(Ok(Some(WorkerEvent::Done))) => {
                        *proc = Some(p);
                        return;
                    }
                    Ok(Ok(Some(WorkerEvent::Error { message }))) => {
                        // Turn fails; the session is retained for the next turn.
                        *proc = Some(p);
                        self.fail_turn(turn, &message).await;
                        return;
                    }
                }
            }
        }
    }

    async fn fail_turn(&self, turn: &TurnRequest, reason: &str) {
        warn!(folder = %turn.folder, reason = %reason, "Turn failed");
        if !self.settings.apology.is_empty() {
            self.hub
                .send(&turn.chat_id, &self.settings.apology, None)
                .await;
        }
    }

    /// Single-shot voice path: a dedicated worker outside the queue,
    /// resolved on the first streamed result.
    pub async fn run_detached(&self, prompt: &str, timeout: Duration) -> anyhow::Result<String> {
        let folder = self.settings.main_folder.clone();
        let spec = WorkerSpawn {
            command: self.settings.command.clone(),
            args: self.settings.args.clone(),
            workdir: self.settings.data_dir.join("conversations").join(&folder),
            folder: folder.clone(),
            chat_id: ChatId::voice_session(),
            is_main: true,
            caps: Capabilities::default(),
            ipc_dir: self.settings.ipc_root.join(&folder),
            container_config: None,
        };

        let mut p = WorkerProcess::spawn(&spec)?;
        let session = self.store.session(&folder, "voice").await?;
        p.send_turn(prompt, session.as_deref()).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let outcome = loop {
            match tokio::time::timeout_at(deadline, p.next_event()).await {
                Err(_) => break Err(anyhow::anyhow!("voice turn deadline exceeded")),
                Ok(Err(e)) => break Err(e),
                Ok(Ok(None)) => break Err(anyhow::anyhow!("worker exited without a result")),
                Ok(Ok(Some(WorkerEvent::Session { session_id }))) => {
                    self.store.set_session(&folder, "voice", &session_id).await?;
                }
                Ok(Ok(Some(WorkerEvent::Result { content }))) => {
                    break Ok(strip_internal(&result_text(&content)));
                }
                Ok(Ok(Some(WorkerEvent::Done))) => {
                    break Err(anyhow::anyhow!("worker produced no result"));
                }
                Ok(Ok(Some(WorkerEvent::Error { message }))) => {
                    break Err(anyhow::anyhow!(message));
                }
            }
        };

        p.kill().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::PrefixTestChannel;
    use crate::types::ChatId;

    /// A scripted worker: reads turn lines, emits a session, one result,
    /// and a done marker per turn.
    const ECHO_WORKER: &str = r#"
        first=1
        while read -r line; do
            if [ "$first" = "1" ]; then
                echo '{"type":"session","session_id":"sess-test"}'
                first=0
            fi
            echo '{"type":"result","content":"pong<internal>trace=1</internal>"}'
            echo '{"type":"done"}'
        done
    "#;

    async fn test_pool(
        script: &str,
        max_workers: usize,
    ) -> (
        Arc<WorkerPool>,
        Arc<PrefixTestChannel>,
        Arc<Store>,
        tempfile::TempDir,
        tempfile::NamedTempFile,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(Store::open(db_file.path().to_str().unwrap()).await.unwrap());
        let channel = Arc::new(PrefixTestChannel::new("sig:", true));
        let hub = Arc::new(ChannelHub::new(vec![
            channel.clone() as Arc<dyn crate::channels::Channel>
        ]));
        let settings = PoolSettings {
            max_workers,
            idle: Duration::from_secs(300),
            turn_timeout: Duration::from_secs(120),
            apology: "sorry".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            data_dir: dir.path().join("data"),
            ipc_root: dir.path().join("ipc"),
            main_folder: "main".to_string(),
        };
        let pool = Arc::new(WorkerPool::new(settings, store.clone(), hub));
        (pool, channel, store, dir, db_file)
    }

    fn turn(folder: &str, prompt: &str) -> TurnRequest {
        TurnRequest {
            folder: folder.to_string(),
            chat_id: ChatId::new("sig:+15550001111"),
            prompt: prompt.to_string(),
            purpose: "chat".to_string(),
            is_main: false,
            caps: Capabilities::default(),
            container_config: None,
        }
    }

    async fn wait_for_sends(channel: &PrefixTestChannel, count: usize) -> Vec<String> {
        for _ in 0..200 {
            {
                let delivered = channel.delivered.lock().await;
                if delivered.len() >= count {
                    return delivered.iter().map(|s| s.text.clone()).collect();
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let delivered = channel.delivered.lock().await;
        delivered.iter().map(|s| s.text.clone()).collect()
    }

    #[tokio::test]
    async fn turn_streams_result_with_internal_stripped() {
        let (pool, channel, store, _dir, _db) = test_pool(ECHO_WORKER, 5).await;

        pool.enqueue(turn("alice", "ping")).await;

        let texts = wait_for_sends(&channel, 1).await;
        assert_eq!(texts, vec!["pong"]);

        // Session event persisted under the turn's purpose.
        for _ in 0..100 {
            if store.session("alice", "chat").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            store.session("alice", "chat").await.unwrap().as_deref(),
            Some("sess-test")
        );
    }

    #[tokio::test]
    async fn turns_for_one_folder_are_serialized_fifo() {
        let (pool, channel, _store, _dir, _db) = test_pool(ECHO_WORKER, 5).await;

        pool.enqueue(turn("alice", "one")).await;
        pool.enqueue(turn("alice", "two")).await;
        pool.enqueue(turn("alice", "three")).await;

        let texts = wait_for_sends(&channel, 3).await;
        assert_eq!(texts.len(), 3);
        assert_eq!(pool.live_workers().await, 1);
    }

    #[tokio::test]
    async fn worker_exit_fails_turn_with_apology() {
        // Exits immediately without producing a turn boundary.
        let (pool, channel, _store, _dir, _db) = test_pool("exit 0", 5).await;

        pool.enqueue(turn("alice", "ping")).await;

        let texts = wait_for_sends(&channel, 1).await;
        assert_eq!(texts, vec!["sorry"]);
    }

    #[tokio::test]
    async fn error_event_fails_turn_and_keeps_worker() {
        let script = r#"
            while read -r line; do
                echo '{"type":"error","message":"bad prompt"}'
            done
        "#;
        let (pool, channel, _store, _dir, _db) = test_pool(script, 5).await;

        pool.enqueue(turn("alice", "ping")).await;
        let texts = wait_for_sends(&channel, 1).await;
        assert_eq!(texts, vec!["sorry"]);
        assert_eq!(pool.live_workers().await, 1);
    }

    #[tokio::test]
    async fn multiple_folders_spawn_distinct_workers() {
        let (pool, channel, _store, _dir, _db) = test_pool(ECHO_WORKER, 5).await;

        pool.enqueue(turn("alice", "a")).await;
        pool.enqueue(turn("bob", "b")).await;

        let texts = wait_for_sends(&channel, 2).await;
        assert_eq!(texts.len(), 2);
        assert_eq!(pool.live_workers().await, 2);
    }

    #[tokio::test]
    async fn run_detached_resolves_on_first_result() {
        let (pool, _channel, _store, _dir, _db) = test_pool(ECHO_WORKER, 5).await;

        let out = pool
            .run_detached("say pong", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(out, "pong");
        assert_eq!(pool.live_workers().await, 0);
    }
}
