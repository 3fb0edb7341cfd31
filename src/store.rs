//! SQLite-backed durable state: the address book (chat-id → conversation),
//! worker sessions, and the scheduled-task table (queried by the
//! scheduler through the shared pool).
//!
//! Single-writer discipline: the pool is capped at one connection, so all
//! writes serialize. SQLite commits in WAL mode sync on every change.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::types::{Capabilities, ChatId, Conversation};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    // --- Address book -----------------------------------------------------

    pub async fn get(&self, chat_id: &ChatId) -> anyhow::Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_conversation).transpose()
    }

    /// Insert or update a conversation record.
    ///
    /// Errors with a conflict when the folder is already owned by a
    /// different conversation (linking is the only sanctioned way to share
    /// a folder).
    pub async fn put(&self, conv: &Conversation) -> anyhow::Result<()> {
        if let Some(existing) = self.get(&conv.chat_id).await? {
            if existing.folder != conv.folder {
                self.ensure_folder_free(&conv.folder).await?;
            }
        } else {
            self.ensure_folder_free(&conv.folder).await?;
        }

        sqlx::query(
            "INSERT INTO conversations
               (chat_id, display_name, folder, trigger_token, requires_trigger,
                cap_reminders, cap_bookmarks, cap_email, container_config,
                created_at, last_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
               display_name = excluded.display_name,
               folder = excluded.folder,
               trigger_token = excluded.trigger_token,
               requires_trigger = excluded.requires_trigger,
               cap_reminders = excluded.cap_reminders,
               cap_bookmarks = excluded.cap_bookmarks,
               cap_email = excluded.cap_email,
               container_config = excluded.container_config,
               last_active = excluded.last_active",
        )
        .bind(conv.chat_id.as_str())
        .bind(&conv.display_name)
        .bind(&conv.folder)
        .bind(&conv.trigger)
        .bind(conv.requires_trigger as i32)
        .bind(conv.caps.reminders as i32)
        .bind(conv.caps.bookmarks as i32)
        .bind(conv.caps.outbound_email as i32)
        .bind(&conv.container_config)
        .bind(conv.created_at.to_rfc3339())
        .bind(conv.last_active.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_folder_free(&self, folder: &str) -> anyhow::Result<()> {
        let taken = sqlx::query("SELECT chat_id FROM conversations WHERE folder = ? LIMIT 1")
            .bind(folder)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            anyhow::bail!(
                "folder '{}' is already registered to another conversation",
                folder
            );
        }
        Ok(())
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Conversation>> {
        let rows = sqlx::query("SELECT * FROM conversations ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_conversation).collect()
    }

    /// Distinct conversation folders, registration order.
    pub async fn folders(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT folder FROM conversations GROUP BY folder ORDER BY MIN(created_at)",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("folder")).collect())
    }

    /// The earliest-registered record for a folder. Capability and trigger
    /// inheritance on link copies from this record.
    pub async fn representative(&self, folder: &str) -> anyhow::Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT * FROM conversations WHERE folder = ? ORDER BY created_at LIMIT 1",
        )
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_conversation).transpose()
    }

    /// Link an additional chat-id to an existing folder, inheriting the
    /// representative record's trigger and capability settings.
    ///
    /// When the alias already exists under a different folder, the target
    /// wins and the overwrite is logged.
    pub async fn link(
        &self,
        alias: &ChatId,
        target_folder: &str,
        display_name: Option<&str>,
    ) -> anyhow::Result<Conversation> {
        let rep = self
            .representative(target_folder)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no conversation registered for folder '{}'", target_folder))?;

        if let Some(existing) = self.get(alias).await? {
            if existing.folder != target_folder {
                warn!(
                    chat_id = %alias,
                    old_folder = %existing.folder,
                    new_folder = %target_folder,
                    "Relinking chat id; target folder settings win"
                );
            }
        }

        let now = Utc::now();
        let linked = Conversation {
            chat_id: alias.clone(),
            display_name: display_name.unwrap_or(&rep.display_name).to_string(),
            folder: target_folder.to_string(),
            trigger: rep.trigger.clone(),
            requires_trigger: rep.requires_trigger,
            caps: rep.caps,
            container_config: rep.container_config.clone(),
            created_at: now,
            last_active: now,
        };

        sqlx::query(
            "INSERT INTO conversations
               (chat_id, display_name, folder, trigger_token, requires_trigger,
                cap_reminders, cap_bookmarks, cap_email, container_config,
                created_at, last_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
               display_name = excluded.display_name,
               folder = excluded.folder,
               trigger_token = excluded.trigger_token,
               requires_trigger = excluded.requires_trigger,
               cap_reminders = excluded.cap_reminders,
               cap_bookmarks = excluded.cap_bookmarks,
               cap_email = excluded.cap_email,
               container_config = excluded.container_config,
               last_active = excluded.last_active",
        )
        .bind(linked.chat_id.as_str())
        .bind(&linked.display_name)
        .bind(&linked.folder)
        .bind(&linked.trigger)
        .bind(linked.requires_trigger as i32)
        .bind(linked.caps.reminders as i32)
        .bind(linked.caps.bookmarks as i32)
        .bind(linked.caps.outbound_email as i32)
        .bind(&linked.container_config)
        .bind(linked.created_at.to_rfc3339())
        .bind(linked.last_active.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(linked)
    }

    pub async fn update_last_seen(&self, chat_id: &ChatId, ts: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE conversations SET last_active = ? WHERE chat_id = ?")
            .bind(ts.to_rfc3339())
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Sessions ---------------------------------------------------------
    //
    // Session ids bridge worker turns within one (folder, purpose). They are
    // persisted for continuity but never logged and never sent outbound.

    pub async fn session(&self, folder: &str, purpose: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT session_id FROM sessions WHERE folder = ? AND purpose = ?")
            .bind(folder)
            .bind(purpose)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("session_id")))
    }

    pub async fn set_session(
        &self,
        folder: &str,
        purpose: &str,
        session_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sessions (folder, purpose, session_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(folder, purpose) DO UPDATE SET
               session_id = excluded.session_id,
               updated_at = excluded.updated_at",
        )
        .bind(folder)
        .bind(purpose)
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_session(&self, folder: &str, purpose: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE folder = ? AND purpose = ?")
            .bind(folder)
            .bind(purpose)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS conversations (
            chat_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            folder TEXT NOT NULL,
            trigger_token TEXT NOT NULL DEFAULT '',
            requires_trigger INTEGER NOT NULL DEFAULT 0,
            cap_reminders INTEGER NOT NULL DEFAULT 0,
            cap_bookmarks INTEGER NOT NULL DEFAULT 0,
            cap_email INTEGER NOT NULL DEFAULT 0,
            container_config TEXT,
            created_at TEXT NOT NULL,
            last_active TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_folder ON conversations(folder)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sessions (
            folder TEXT NOT NULL,
            purpose TEXT NOT NULL,
            session_id TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (folder, purpose)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id TEXT PRIMARY KEY,
            folder TEXT,
            prompt TEXT NOT NULL,
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            context_mode TEXT NOT NULL DEFAULT 'inherit',
            status TEXT NOT NULL DEFAULT 'active',
            next_fire_at TEXT,
            last_fire_at TEXT,
            group_folder TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks(status, next_fire_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn row_to_conversation(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<Conversation> {
    let created_at: String = row.get("created_at");
    let last_active: String = row.get("last_active");
    Ok(Conversation {
        chat_id: ChatId::new(row.get::<String, _>("chat_id")),
        display_name: row.get("display_name"),
        folder: row.get("folder"),
        trigger: row.get("trigger_token"),
        requires_trigger: row.get::<i32, _>("requires_trigger") != 0,
        caps: Capabilities {
            reminders: row.get::<i32, _>("cap_reminders") != 0,
            bookmarks: row.get::<i32, _>("cap_bookmarks") != 0,
            outbound_email: row.get::<i32, _>("cap_email") != 0,
        },
        container_config: row.get("container_config"),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        last_active: DateTime::parse_from_rfc3339(&last_active)?.with_timezone(&Utc),
    })
}
