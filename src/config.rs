use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub state: StateConfig,
    pub main: MainConfig,
    pub signal: Option<SignalConfig>,
    #[serde(default)]
    pub slack: Vec<SlackConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
    pub voice: Option<VoiceConfig>,
    pub mail: Option<MailConfig>,
    pub bookmarks: Option<BookmarksConfig>,
    pub reminders: Option<RemindersConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Assistant name; also the default trigger token for auto-registered
    /// group conversations.
    #[serde(default = "default_identity_name")]
    pub name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
        }
    }
}

fn default_identity_name() -> String {
    "Courier".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Per-conversation working directories live under here.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_db_path() -> String {
    "courierd.db".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}

/// The privileged conversation: allowed to register/link others and
/// schedule across folders.
#[derive(Debug, Deserialize, Clone)]
pub struct MainConfig {
    pub folder: String,
    /// Bootstrapped into the address book at startup when absent.
    pub chat_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalConfig {
    /// JSON-RPC endpoint of the local signal daemon.
    #[serde(default = "default_signal_rpc_url")]
    pub rpc_url: String,
    /// Own E.164 number; used for self-echo suppression.
    pub account: String,
    #[serde(default = "default_signal_poll_ms")]
    pub poll_interval_ms: u64,
    /// Server-side receive timeout, seconds.
    #[serde(default = "default_signal_receive_timeout")]
    pub receive_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_register: bool,
    /// Auto-registered group conversations require the trigger token.
    #[serde(default = "default_true")]
    pub group_requires_trigger: bool,
}

fn default_signal_rpc_url() -> String {
    "http://127.0.0.1:8090/api/v1/rpc".to_string()
}
fn default_signal_poll_ms() -> u64 {
    2000
}
fn default_signal_receive_timeout() -> u64 {
    1
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    /// Namespace for multi-workspace setups; yields `slack:<ns>:` chat ids.
    pub namespace: Option<String>,
    pub app_token: String,
    pub bot_token: String,
    #[serde(default)]
    pub auto_register: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Sent once to the conversation when a turn fails. Empty = silent.
    #[serde(default = "default_apology")]
    pub apology: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            idle_secs: default_idle_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
            apology: default_apology(),
        }
    }
}

fn default_max_workers() -> usize {
    5
}
fn default_idle_secs() -> u64 {
    300
}
fn default_turn_timeout_secs() -> u64 {
    300
}
/// Turn deadline floor; cold container starts routinely take over a minute.
pub const MIN_TURN_TIMEOUT_SECS: u64 = 120;

fn default_apology() -> String {
    "Sorry, something went wrong handling that. Please try again.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Sandboxed agent binary launched per conversation.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpcConfig {
    #[serde(default = "default_ipc_root")]
    pub root: String,
    #[serde(default = "default_sweep_ms")]
    pub sweep_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            root: default_ipc_root(),
            sweep_ms: default_sweep_ms(),
        }
    }
}

fn default_ipc_root() -> String {
    "data/ipc".to_string()
}
fn default_sweep_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

fn default_tick_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotsConfig {
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh_secs(),
        }
    }
}

fn default_refresh_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_voice_port")]
    pub port: u16,
    pub token: String,
}

fn default_voice_port() -> u16 {
    8787
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mail_folder")]
    pub folder: String,
    /// Only messages from this sender are considered.
    pub from_filter: String,
    #[serde(default = "default_processed_flag")]
    pub processed_flag: String,
    /// Processed messages are moved here; unset = delete + expunge.
    pub archive_mailbox: Option<String>,
    #[serde(default = "default_mail_interval")]
    pub interval_secs: u64,
}

fn default_imap_port() -> u16 {
    993
}
fn default_mail_folder() -> String {
    "INBOX".to_string()
}
fn default_processed_flag() -> String {
    "courierd-processed".to_string()
}
fn default_mail_interval() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct BookmarksConfig {
    #[serde(default = "default_bookmark_url")]
    pub base_url: String,
}

fn default_bookmark_url() -> String {
    "http://127.0.0.1:9999".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemindersConfig {
    /// Line-oriented bridge: one JSON request in, one JSON response out.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_reminder_refresh")]
    pub refresh_secs: u64,
}

fn default_reminder_refresh() -> u64 {
    900
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Effective per-turn deadline, clamped to the cold-start floor.
    pub fn turn_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pool.turn_timeout_secs.max(MIN_TURN_TIMEOUT_SECS))
    }
}
