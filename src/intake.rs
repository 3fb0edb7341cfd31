//! Intake pollers: background loops that synthesize work from non-chat
//! sources.
//!
//! Mail→bookmark: every few minutes, find unprocessed messages from a
//! trusted sender, extract URLs, forward each to the bookmark relay, and
//! only after the whole batch succeeds mark the message processed and
//! take it out of the inbox. Atomicity is per-message — a relay outage
//! mid-batch leaves the message unlabeled for retry.

use std::sync::Arc;
use std::time::Duration;

use async_native_tls::TlsConnector;
use async_std::net::TcpStream;
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, warn};

use crate::bookmarks::BookmarkRelay;
use crate::config::MailConfig;
use crate::reminders::RemindersBridge;
use crate::snapshots::Snapshots;
use crate::store::Store;

/// URLs shorter than this are noise (bare hosts, signature fragments).
pub const MIN_URL_LEN: usize = 15;

/// Tracker and meeting-link hosts that are never worth bookmarking.
pub const URL_BLACKLIST: &[&str] = &[
    "teams.microsoft.com",
    "zoom.us",
    "meet.google.com",
    "calendly.com",
    "safelinks.protection.outlook.com",
    "mailtrack",
    "list-manage.com",
    "unsubscribe",
];

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("static url regex compiles"));

/// Pull plain HTTP(S) URLs out of free text, dropping blacklisted hosts,
/// short fragments, and duplicates (order preserved).
pub fn extract_urls(text: &str, min_len: usize, blacklist: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in URL_RE.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if url.len() < min_len {
            continue;
        }
        if blacklist.iter().any(|b| url.contains(b)) {
            continue;
        }
        if !out.iter().any(|seen| seen == url) {
            out.push(url.to_string());
        }
    }
    out
}

pub struct MailPoller {
    cfg: MailConfig,
    relay: Arc<BookmarkRelay>,
}

impl MailPoller {
    pub fn new(cfg: MailConfig, relay: Arc<BookmarkRelay>) -> Self {
        Self { cfg, relay }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let interval = Duration::from_secs(self.cfg.interval_secs);
            loop {
                match self.poll_once().await {
                    Ok(0) => {}
                    Ok(n) => info!(processed = n, "Mail intake processed messages"),
                    Err(e) => warn!("Mail intake poll failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        });
        info!("Mail intake poller spawned");
    }

    /// One inbox pass. Returns the number of messages fully processed.
    async fn poll_once(&self) -> anyhow::Result<usize> {
        let tcp = TcpStream::connect((self.cfg.host.as_str(), self.cfg.port)).await?;
        let tls = TlsConnector::new();
        let tls_stream = tls.connect(self.cfg.host.as_str(), tcp).await?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&self.cfg.username, &self.cfg.password)
            .await
            .map_err(|e| e.0)?;
        session.select(&self.cfg.folder).await?;

        let query = format!(
            "FROM \"{}\" NOT KEYWORD {}",
            self.cfg.from_filter, self.cfg.processed_flag
        );
        let uids = session.uid_search(&query).await?;
        let mut ordered: Vec<u32> = uids.into_iter().collect();
        ordered.sort_unstable();

        let mut processed = 0usize;
        for uid in ordered {
            let fetches: Vec<_> = session
                .uid_fetch(uid.to_string(), "RFC822.TEXT")
                .await?
                .try_collect()
                .await?;
            let Some(body) = fetches.first().and_then(|f| f.text()) else {
                continue;
            };
            let text = String::from_utf8_lossy(body);
            let urls = extract_urls(&text, MIN_URL_LEN, URL_BLACKLIST);

            let mut all_ok = true;
            for url in &urls {
                match self.relay.intake(url).await {
                    Ok(_) => info!(url = %url, "Forwarded URL to bookmark relay"),
                    Err(e) => {
                        warn!(url = %url, "Bookmark relay call failed: {}", e);
                        all_ok = false;
                        break;
                    }
                }
            }

            // Only a fully forwarded message is labeled and archived;
            // anything less is retried on the next pass.
            if !all_ok {
                continue;
            }

            let _: Vec<_> = session
                .uid_store(
                    uid.to_string(),
                    format!("+FLAGS ({})", self.cfg.processed_flag),
                )
                .await?
                .try_collect()
                .await?;

            match &self.cfg.archive_mailbox {
                Some(mailbox) => {
                    session.uid_mv(uid.to_string(), mailbox).await?;
                }
                None => {
                    let _: Vec<_> = session
                        .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
                        .await?
                        .try_collect()
                        .await?;
                    let _: Vec<_> = session.expunge().await?.try_collect().await?;
                }
            }
            processed += 1;
        }

        session.logout().await.ok();
        Ok(processed)
    }
}

/// Periodic reminder-snapshot refresh for every conversation carrying the
/// reminders capability.
pub fn spawn_reminder_refresh(
    bridge: Arc<RemindersBridge>,
    snapshots: Arc<Snapshots>,
    store: Arc<Store>,
    interval_secs: u64,
) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_secs);
        loop {
            match refresh_reminder_snapshots(&bridge, &snapshots, &store).await {
                Ok(0) => {}
                Ok(n) => info!(folders = n, "Reminder snapshots refreshed"),
                Err(e) => error!("Reminder snapshot refresh failed: {}", e),
            }
            tokio::time::sleep(interval).await;
        }
    });
    info!("Reminder refresh poller spawned");
}

async fn refresh_reminder_snapshots(
    bridge: &RemindersBridge,
    snapshots: &Snapshots,
    store: &Store,
) -> anyhow::Result<usize> {
    let mut eligible: Vec<String> = Vec::new();
    for folder in store.folders().await? {
        if let Some(rep) = store.representative(&folder).await? {
            if rep.caps.reminders {
                eligible.push(folder);
            }
        }
    }
    if eligible.is_empty() {
        return Ok(0);
    }

    let snapshot = bridge.snapshot().await?;
    let mut written = 0usize;
    for folder in eligible {
        if let Err(e) = snapshots.write_reminders(&folder, &snapshot).await {
            warn!(folder = %folder, "Reminder snapshot write failed: {}", e);
        } else {
            written += 1;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_urls_with_blacklist_and_floor() {
        let body = "See https://example.com/a, and \
                    https://teams.microsoft.com/meeting/xyz. Also http://x";
        let urls = extract_urls(body, MIN_URL_LEN, URL_BLACKLIST);
        assert_eq!(urls, vec!["https://example.com/a".to_string()]);
    }

    #[test]
    fn trims_trailing_punctuation() {
        let urls = extract_urls(
            "Read https://example.com/article! or https://example.com/other?",
            MIN_URL_LEN,
            URL_BLACKLIST,
        );
        assert_eq!(
            urls,
            vec![
                "https://example.com/article".to_string(),
                "https://example.com/other".to_string(),
            ]
        );
    }

    #[test]
    fn stops_at_closing_delimiters() {
        let urls = extract_urls(
            "(https://example.com/wrapped) and <https://example.com/angled>",
            MIN_URL_LEN,
            URL_BLACKLIST,
        );
        assert_eq!(
            urls,
            vec![
                "https://example.com/wrapped".to_string(),
                "https://example.com/angled".to_string(),
            ]
        );
    }

    #[test]
    fn dedups_preserving_order() {
        let urls = extract_urls(
            "https://example.com/a then https://example.com/b then https://example.com/a",
            MIN_URL_LEN,
            URL_BLACKLIST,
        );
        assert_eq!(
            urls,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn blacklist_covers_meeting_and_tracker_links() {
        let body = "https://zoom.us/j/1234567890 https://meet.google.com/abc-defg-hij \
                    https://calendly.com/someone/30min \
                    https://example.us1.list-manage.com/track?u=1";
        assert!(extract_urls(body, MIN_URL_LEN, URL_BLACKLIST).is_empty());
    }
}
