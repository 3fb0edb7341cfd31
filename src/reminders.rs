//! Client for the reminders bridge: a line-oriented subprocess that reads
//! one JSON request on stdin and writes one JSON response on stdout.
//!
//! Bridge failures surface as `{"error": "..."}` values; the host never
//! retries — the worker decides whether to.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const BRIDGE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RemindersBridge {
    command: String,
    args: Vec<String>,
}

impl RemindersBridge {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
        }
    }

    /// One request/response round trip with a fresh bridge process.
    pub async fn call(&self, operation: &str, params: Value) -> anyhow::Result<Value> {
        let request = json!({ "operation": operation, "params": params });
        debug!(operation, "Calling reminders bridge");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("bridge stdin unavailable"))?;
        stdin.write_all(request.to_string().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let output = tokio::time::timeout(BRIDGE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("reminders bridge timed out"))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("reminders bridge produced no output"))?;

        let value: Value = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("bad bridge response: {} ({})", e, line))?;
        Ok(value)
    }

    pub async fn snapshot(&self) -> anyhow::Result<Value> {
        self.call("snapshot", json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_scripted_bridge() {
        // Echoes the requested operation back, the way the real bridge
        // responds with one JSON object on stdout.
        let bridge = RemindersBridge::new(
            "sh",
            &[
                "-c".to_string(),
                r#"read -r req; echo "{\"ok\":true}""#.to_string(),
            ],
        );
        let resp = bridge.call("snapshot", json!({})).await.unwrap();
        assert_eq!(resp["ok"], json!(true));
    }

    #[tokio::test]
    async fn error_payloads_pass_through() {
        let bridge = RemindersBridge::new(
            "sh",
            &[
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"error":"Reminders access denied"}'"#.to_string(),
            ],
        );
        let resp = bridge.call("create_reminder", json!({"title": "x"})).await.unwrap();
        assert!(resp["error"].as_str().unwrap().contains("denied"));
    }

    #[tokio::test]
    async fn garbage_output_is_an_error() {
        let bridge = RemindersBridge::new(
            "sh",
            &["-c".to_string(), "cat >/dev/null; echo not-json".to_string()],
        );
        assert!(bridge.snapshot().await.is_err());
    }
}
