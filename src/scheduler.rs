//! Durable scheduler: cron, interval and one-shot tasks that enqueue
//! synthetic turns on the worker pool.
//!
//! All user-supplied cron and once values are interpreted in the host's
//! local zone; stored next-fire timestamps are absolute UTC instants.
//! Status transitions are persisted before a turn is enqueued, so a crash
//! between persist and enqueue reprocesses the task on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use croner::Cron;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{error, info, warn};

use crate::pool::{TurnRequest, WorkerPool};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            other => anyhow::bail!("unknown schedule kind '{}' (cron, interval, once)", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Inherit,
    Isolated,
}

impl ContextMode {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "inherit" => Ok(Self::Inherit),
            "isolated" => Ok(Self::Isolated),
            other => anyhow::bail!("unknown context mode '{}' (inherit, isolated)", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Isolated => "isolated",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Owning conversation folder; null = main-scope, retargetable by id.
    pub folder: Option<String>,
    pub prompt: String,
    pub kind: ScheduleKind,
    pub value: String,
    pub context: ContextMode,
    pub status: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub group_folder: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewTask {
    pub folder: Option<String>,
    pub prompt: String,
    pub kind: String,
    pub value: String,
    pub context: Option<String>,
    pub group_folder: Option<String>,
}

pub struct Scheduler {
    pool: SqlitePool,
    workers: Arc<WorkerPool>,
    store: Arc<Store>,
    tick_interval: Duration,
    main_folder: String,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        workers: Arc<WorkerPool>,
        store: Arc<Store>,
        tick_interval_secs: u64,
        main_folder: String,
    ) -> Self {
        Self {
            pool,
            workers,
            store,
            tick_interval: Duration::from_secs(tick_interval_secs),
            main_folder,
        }
    }

    /// Spawn the tick loop as a background task.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.tick().await {
                    error!("Scheduler tick error: {}", e);
                }
                tokio::time::sleep(self.tick_interval).await;
            }
        });
        info!("Scheduler spawned");
    }

    /// Validate and persist a new task. A `once` already in the past is
    /// stored completed and never fires.
    pub async fn schedule(&self, new: NewTask) -> anyhow::Result<ScheduledTask> {
        let kind = ScheduleKind::parse(&new.kind)?;
        let context = match new.context.as_deref() {
            Some(c) => ContextMode::parse(c)?,
            None => ContextMode::Inherit,
        };
        let first_fire = compute_first_fire(kind, &new.value)?;

        let now = Utc::now();
        let status = if kind == ScheduleKind::Once && first_fire <= now {
            "completed"
        } else {
            "active"
        };

        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            folder: new.folder,
            prompt: new.prompt,
            kind,
            value: new.value,
            context,
            status: status.to_string(),
            next_fire_at: Some(first_fire),
            last_fire_at: None,
            group_folder: new.group_folder,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO scheduled_tasks
               (id, folder, prompt, kind, value, context_mode, status,
                next_fire_at, last_fire_at, group_folder, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.folder)
        .bind(&task.prompt)
        .bind(task.kind.as_str())
        .bind(&task.value)
        .bind(task.context.as_str())
        .bind(&task.status)
        .bind(first_fire.to_rfc3339())
        .bind(&task.group_folder)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!(task_id = %task.id, kind = task.kind.as_str(), status = %task.status, "Task scheduled");
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_task).transpose()
    }

    /// Tasks visible to a folder: its own, plus main-scope rows for the
    /// main conversation. `None` = everything.
    pub async fn list(&self, folder: Option<&str>) -> anyhow::Result<Vec<ScheduledTask>> {
        let rows = match folder {
            None => {
                sqlx::query("SELECT * FROM scheduled_tasks ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(f) if f == self.main_folder => {
                sqlx::query(
                    "SELECT * FROM scheduled_tasks WHERE folder = ? OR folder IS NULL
                     ORDER BY created_at",
                )
                .bind(f)
                .fetch_all(&self.pool)
                .await?
            }
            Some(f) => {
                sqlx::query("SELECT * FROM scheduled_tasks WHERE folder = ? ORDER BY created_at")
                    .bind(f)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_task).collect()
    }

    pub async fn pause(&self, id: &str) -> anyhow::Result<()> {
        self.set_status(id, "paused").await
    }

    pub async fn resume(&self, id: &str) -> anyhow::Result<()> {
        self.set_status(id, "active").await
    }

    async fn set_status(&self, id: &str, status: &str) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no task with id '{}'", id);
        }
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> anyhow::Result<()> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no task with id '{}'", id);
        }
        Ok(())
    }

    /// Fire everything due. A missed window (downtime) fires exactly once
    /// here and then skips ahead; there is no catch-up storm because the
    /// next fire is derived from now, not from the missed slot.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        // 'running' rows are ours: a crash after persist, before enqueue.
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks
             WHERE status IN ('active', 'running') AND next_fire_at <= ?",
        )
        .bind(&now_str)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let task = row_to_task(row)?;
            self.fire(task, now).await?;
        }
        Ok(())
    }

    async fn fire(&self, task: ScheduledTask, now: DateTime<Utc>) -> anyhow::Result<()> {
        let now_str = now.to_rfc3339();

        sqlx::query(
            "UPDATE scheduled_tasks SET status = 'running', last_fire_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&now_str)
        .bind(&now_str)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        self.enqueue_turn(&task).await;

        match task.kind {
            ScheduleKind::Once => {
                sqlx::query(
                    "UPDATE scheduled_tasks SET status = 'completed', updated_at = ? WHERE id = ?",
                )
                .bind(&now_str)
                .bind(&task.id)
                .execute(&self.pool)
                .await?;
            }
            ScheduleKind::Cron | ScheduleKind::Interval => {
                match compute_first_fire(task.kind, &task.value) {
                    Ok(next) => {
                        sqlx::query(
                            "UPDATE scheduled_tasks
                             SET status = 'active', next_fire_at = ?, updated_at = ?
                             WHERE id = ?",
                        )
                        .bind(next.to_rfc3339())
                        .bind(&now_str)
                        .bind(&task.id)
                        .execute(&self.pool)
                        .await?;
                    }
                    Err(e) => {
                        error!(task_id = %task.id, "Failed to re-derive next fire, failing task: {}", e);
                        sqlx::query(
                            "UPDATE scheduled_tasks SET status = 'failed', updated_at = ? WHERE id = ?",
                        )
                        .bind(&now_str)
                        .bind(&task.id)
                        .execute(&self.pool)
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Synthesize the conversation turn for a fired task. Scheduling
    /// couples to workers only through the pool's per-folder queue, which
    /// keeps the path correct across worker restarts.
    async fn enqueue_turn(&self, task: &ScheduledTask) {
        let folder = task
            .folder
            .clone()
            .unwrap_or_else(|| self.main_folder.clone());

        let rep = match self.store.representative(&folder).await {
            Ok(Some(rep)) => rep,
            Ok(None) => {
                warn!(task_id = %task.id, folder = %folder, "No conversation for task folder, skipping fire");
                return;
            }
            Err(e) => {
                error!(task_id = %task.id, "Address book lookup failed: {}", e);
                return;
            }
        };

        let purpose = match task.context {
            ContextMode::Inherit => "chat".to_string(),
            ContextMode::Isolated => format!("task:{}", task.id),
        };

        self.workers
            .enqueue(TurnRequest {
                folder: folder.clone(),
                chat_id: rep.chat_id,
                prompt: task.prompt.clone(),
                purpose,
                is_main: folder == self.main_folder,
                caps: rep.caps,
                container_config: rep.container_config,
            })
            .await;
        info!(task_id = %task.id, folder = %folder, "Fired scheduled task");
    }
}

/// Derive the first absolute fire instant for a schedule value,
/// validating it in the process.
pub fn compute_first_fire(kind: ScheduleKind, value: &str) -> anyhow::Result<DateTime<Utc>> {
    match kind {
        ScheduleKind::Cron => next_cron_occurrence(value),
        ScheduleKind::Interval => {
            let ms: i64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("interval must be an integer of milliseconds"))?;
            if ms <= 0 {
                anyhow::bail!("interval must be a positive integer of milliseconds");
            }
            Ok(Utc::now() + chrono::Duration::milliseconds(ms))
        }
        ScheduleKind::Once => parse_once_local(value),
    }
}

/// Next occurrence of a 5-field cron expression in the host's local zone.
pub fn next_cron_occurrence(expr: &str) -> anyhow::Result<DateTime<Utc>> {
    let cron: Cron = expr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{}': {}", expr, e))?;
    let next = cron
        .find_next_occurrence(&Local::now(), false)
        .map_err(|e| anyhow::anyhow!("no next occurrence for '{}': {}", expr, e))?;
    Ok(next.with_timezone(&Utc))
}

/// Parse a `once` value: an ISO-8601 local datetime without any zone
/// suffix. Values carrying `Z` or `±hh:mm` are rejected.
pub fn parse_once_local(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let v = value.trim();

    let time_part = v.split('T').nth(1).unwrap_or("");
    if time_part.ends_with('Z') || time_part.contains('+') || time_part.contains('-') {
        anyhow::bail!(
            "once timestamp must be a local datetime without timezone suffix, got '{}'",
            v
        );
    }

    let naive = NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M"))
        .map_err(|_| {
            anyhow::anyhow!("invalid once timestamp '{}' (expected YYYY-MM-DDTHH:MM[:SS])", v)
        })?;

    let local = match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt,
        // DST fold: take the earlier instant.
        chrono::LocalResult::Ambiguous(early, _) => early,
        chrono::LocalResult::None => {
            anyhow::bail!("once timestamp '{}' does not exist in the local zone", v)
        }
    };
    Ok(local.with_timezone(&Utc))
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<ScheduledTask> {
    let parse_ts = |raw: Option<String>| -> anyhow::Result<Option<DateTime<Utc>>> {
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(anyhow::Error::from)
        })
        .transpose()
    };

    let created_at: String = row.get("created_at");
    Ok(ScheduledTask {
        id: row.get("id"),
        folder: row.get("folder"),
        prompt: row.get("prompt"),
        kind: ScheduleKind::parse(&row.get::<String, _>("kind"))?,
        value: row.get("value"),
        context: ContextMode::parse(&row.get::<String, _>("context_mode"))?,
        status: row.get("status"),
        next_fire_at: parse_ts(row.get("next_fire_at"))?,
        last_fire_at: parse_ts(row.get("last_fire_at"))?,
        group_folder: row.get("group_folder"),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}
