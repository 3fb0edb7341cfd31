//! One sandboxed worker child process.
//!
//! The worker reads turn requests as JSON lines on stdin and streams
//! line-delimited JSON events on stdout. The pool owns the turn protocol;
//! this module owns spawning, the stream codec, and teardown.

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::types::{Capabilities, ChatId};

/// Events a worker may stream. Anything unrecognized is a stream parse
/// error and fails the turn.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Continuation token for this (conversation, purpose); persisted
    /// immediately, reused on every subsequent turn.
    Session { session_id: String },
    /// Emitted zero or more times per turn; each is dispatched outbound.
    Result { content: serde_json::Value },
    /// Turn boundary: all results for the turn have been streamed.
    Done,
    Error { message: String },
}

/// One turn request written to the worker's stdin.
#[derive(Debug, Serialize)]
struct TurnInput<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Everything needed to launch a worker for one conversation folder.
#[derive(Debug, Clone)]
pub struct WorkerSpawn {
    pub command: String,
    pub args: Vec<String>,
    /// Conversation working directory (created if missing).
    pub workdir: PathBuf,
    pub folder: String,
    pub chat_id: ChatId,
    pub is_main: bool,
    pub caps: Capabilities,
    /// Mounted writable into the worker's view; advertised via env.
    pub ipc_dir: PathBuf,
    /// Raw JSON container override (mounts, env) honored by the sandbox
    /// wrapper, not by the host.
    pub container_config: Option<String>,
}

pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    events: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    /// Launch the sandboxed worker. Credentials never propagate: the env
    /// carries only identity, paths, and capability flags.
    pub fn spawn(spawn: &WorkerSpawn) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&spawn.workdir)?;
        std::fs::create_dir_all(&spawn.ipc_dir)?;

        let mut command = Command::new(&spawn.command);
        if let Some(container) = &spawn.container_config {
            command.env("COURIERD_CONTAINER_CONFIG", container);
        }
        let mut child = command
            .args(&spawn.args)
            .current_dir(&spawn.workdir)
            .env("COURIERD_FOLDER", &spawn.folder)
            .env("COURIERD_CHAT_ID", spawn.chat_id.as_str())
            .env("COURIERD_IS_MAIN", if spawn.is_main { "1" } else { "0" })
            .env("COURIERD_IPC_DIR", &spawn.ipc_dir)
            .env(
                "COURIERD_CAP_REMINDERS",
                if spawn.caps.reminders { "1" } else { "0" },
            )
            .env(
                "COURIERD_CAP_BOOKMARKS",
                if spawn.caps.bookmarks { "1" } else { "0" },
            )
            .env(
                "COURIERD_CAP_EMAIL",
                if spawn.caps.outbound_email { "1" } else { "0" },
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdout unavailable"))?;

        debug!(folder = %spawn.folder, "Worker process spawned");
        Ok(Self {
            child,
            stdin,
            events: BufReader::new(stdout).lines(),
        })
    }

    /// Write one turn request on the turn channel.
    pub async fn send_turn(&mut self, prompt: &str, session_id: Option<&str>) -> anyhow::Result<()> {
        let input = TurnInput { prompt, session_id };
        let mut line = serde_json::to_string(&input)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next streamed event. `Ok(None)` means the worker exited (stdout
    /// closed); a malformed line is a stream parse error.
    pub async fn next_event(&mut self) -> anyhow::Result<Option<WorkerEvent>> {
        loop {
            match self.events.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let event: WorkerEvent = serde_json::from_str(&line)
                        .map_err(|e| anyhow::anyhow!("bad worker event: {} ({})", e, line))?;
                    return Ok(Some(event));
                }
            }
        }
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to signal worker: {}", e);
        }
        let _ = self.child.wait().await;
    }

    /// Whether the child has already exited on its own.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

/// Render a result event's content as outbound text. Non-text structured
/// results are JSON-stringified.
pub fn result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Remove `<internal>…</internal>` spans from worker output before it
/// reaches any channel. An unterminated open marker strips to the end.
pub fn strip_internal(text: &str) -> String {
    const OPEN: &str = "<internal>";
    const CLOSE: &str = "</internal>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        match after_open.find(CLOSE) {
            Some(end) => rest = &after_open[end + CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_removes_span() {
        assert_eq!(
            strip_internal("Here is the answer.<internal>debug=42</internal>"),
            "Here is the answer."
        );
    }

    #[test]
    fn strip_internal_multiple_and_interleaved() {
        assert_eq!(
            strip_internal("a<internal>x</internal>b<internal>y</internal>c"),
            "abc"
        );
    }

    #[test]
    fn strip_internal_unterminated_drops_tail() {
        assert_eq!(strip_internal("visible <internal>secret"), "visible");
    }

    #[test]
    fn strip_internal_only_internal_yields_empty() {
        assert_eq!(strip_internal("<internal>all hidden</internal>"), "");
        assert_eq!(strip_internal("  <internal>x</internal>  "), "");
    }

    #[test]
    fn strip_internal_passthrough() {
        assert_eq!(strip_internal("plain text"), "plain text");
    }

    #[test]
    fn result_text_stringifies_structured_content() {
        assert_eq!(result_text(&serde_json::json!("hi")), "hi");
        assert_eq!(
            result_text(&serde_json::json!({"k": 1})),
            "{\"k\":1}"
        );
        assert_eq!(result_text(&serde_json::json!([1, 2])), "[1,2]");
    }

    #[test]
    fn worker_events_deserialize() {
        let e: WorkerEvent =
            serde_json::from_str(r#"{"type":"session","session_id":"abc"}"#).unwrap();
        assert!(matches!(e, WorkerEvent::Session { session_id } if session_id == "abc"));

        let e: WorkerEvent =
            serde_json::from_str(r#"{"type":"result","content":"text"}"#).unwrap();
        assert!(matches!(e, WorkerEvent::Result { .. }));

        let e: WorkerEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(matches!(e, WorkerEvent::Done));

        assert!(serde_json::from_str::<WorkerEvent>(r#"{"type":"wat"}"#).is_err());
    }
}
