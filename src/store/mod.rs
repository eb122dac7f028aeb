//! Per-channel persistence: append-only `log.jsonl`, lazy directory layout,
//! inbound dedup window, attachment download queue.

pub mod attachments;

pub use attachments::{DownloadQueue, PendingDownload};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding dedup window for `(channelId, ts)` pairs.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Attachment metadata on a log entry. `local` is relative to the workspace
/// root; the file itself is promised, but may still be downloading or missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub original: String,
    pub local: String,
}

/// One JSONL line of a channel's `log.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
    pub ts: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub is_bot: bool,
}

/// Shared, process-wide channel store. Log appends are serialized per
/// channel; the dedup map is guarded by its own short-lived lock.
pub struct ChannelStore {
    workspace_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dedup: Mutex<HashMap<(String, String), Instant>>,
}

impl ChannelStore {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self {
            workspace_dir,
            locks: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// The channel's directory, created lazily with its standard subdirs.
    pub fn channel_dir(&self, channel_id: &str) -> Result<PathBuf> {
        let dir = self.workspace_dir.join(channel_id);
        for sub in ["attachments", "scratch", "skills", "daily"] {
            std::fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("creating channel directory {}", dir.display()))?;
        }
        Ok(dir)
    }

    pub fn log_path(&self, channel_id: &str) -> PathBuf {
        self.workspace_dir.join(channel_id).join("log.jsonl")
    }

    /// Append one entry. Returns `false` without writing when the same
    /// `(channel, ts)` was appended within the last 60 seconds.
    pub fn append(&self, channel_id: &str, entry: &LogEntry) -> Result<bool> {
        if self.is_duplicate(channel_id, &entry.ts) {
            return Ok(false);
        }

        let dir = self.channel_dir(channel_id)?;
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let line = serde_json::to_string(entry).context("serializing log entry")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("log.jsonl"))
            .with_context(|| format!("opening log for channel {channel_id}"))?;
        writeln!(file, "{line}").context("appending log entry")?;
        Ok(true)
    }

    /// Every parseable entry, in file order. Unparseable lines are skipped
    /// with a warning; the log is append-only and never rewritten.
    pub fn read_log(&self, channel_id: &str) -> Result<Vec<LogEntry>> {
        let path = self.log_path(channel_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut entries = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(channel = %channel_id, line = idx + 1, "skipping bad log line: {e}");
                }
            }
        }
        Ok(entries)
    }

    /// Last-known `ts` in the channel log.
    pub fn last_ts(&self, channel_id: &str) -> Result<Option<String>> {
        Ok(self.read_log(channel_id)?.last().map(|e| e.ts.clone()))
    }

    fn channel_lock(&self, channel_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Check-and-record against the sliding window, pruning expired keys
    /// opportunistically so the map never grows unbounded.
    fn is_duplicate(&self, channel_id: &str, ts: &str) -> bool {
        let now = Instant::now();
        let mut dedup = self.dedup.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        dedup.retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);

        let key = (channel_id.to_string(), ts.to_string());
        if dedup.contains_key(&key) {
            return true;
        }
        dedup.insert(key, now);
        false
    }
}
