//! Bridges the human-readable channel log and the model transcript.
//!
//! `context.jsonl` mirrors the transcript next to `log.jsonl`. On each
//! run-start the transcript is synced forward from the log, trimmed by
//! logical turns, and snapshotted to `last_prompt.jsonl` for diagnostics.

use crate::llm::types::{StopReason, TranscriptMessage};
use crate::store::LogEntry;
use anyhow::{Context, Result};
use chrono::SecondsFormat;
use std::io::Write as _;
use std::path::PathBuf;

/// Maximum logical turns kept in the transcript.
pub const MAX_TURNS: usize = 10;

pub struct SessionContext {
    channel_dir: PathBuf,
    channel_id: String,
}

impl SessionContext {
    pub fn new(workspace_dir: &std::path::Path, channel_id: &str) -> Self {
        Self {
            channel_dir: workspace_dir.join(channel_id),
            channel_id: channel_id.to_string(),
        }
    }

    fn context_path(&self) -> PathBuf {
        self.channel_dir.join("context.jsonl")
    }

    /// Load the persisted transcript, skipping unparseable lines.
    pub fn load(&self) -> Result<Vec<TranscriptMessage>> {
        let path = self.context_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut messages = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptMessage>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(
                        channel = %self.channel_id,
                        line = idx + 1,
                        "skipping bad transcript line: {e}"
                    );
                }
            }
        }
        Ok(messages)
    }

    /// Rewrite the mirror with the current transcript.
    pub fn save(&self, transcript: &[TranscriptMessage]) -> Result<()> {
        std::fs::create_dir_all(&self.channel_dir)
            .with_context(|| format!("creating {}", self.channel_dir.display()))?;
        let mut out = String::new();
        for msg in transcript {
            out.push_str(&serde_json::to_string(msg)?);
            out.push('\n');
        }
        std::fs::write(self.context_path(), out).context("writing context.jsonl")
    }

    /// Append one message to the mirror.
    pub fn append(&self, message: &TranscriptMessage) -> Result<()> {
        std::fs::create_dir_all(&self.channel_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.context_path())?;
        writeln!(file, "{}", serde_json::to_string(message)?)?;
        Ok(())
    }

    /// Overwrite the diagnostic snapshot of what is about to be prompted.
    pub fn snapshot_last_prompt(
        &self,
        system_prompt: &str,
        transcript: &[TranscriptMessage],
        user_message: &str,
        attached_images: usize,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.channel_dir)?;
        let mut out = serde_json::to_string(&serde_json::json!({
            "systemPrompt": system_prompt,
            "userMessage": user_message,
            "attachedImages": attached_images,
        }))?;
        out.push('\n');
        for msg in transcript {
            out.push_str(&serde_json::to_string(msg)?);
            out.push('\n');
        }
        std::fs::write(self.channel_dir.join("last_prompt.jsonl"), out)
            .context("writing last_prompt.jsonl")
    }
}

/// Append to `transcript` every log entry newer than its high-water `ts`,
/// up to and including `up_to_ts`. Human lines become prefixed user
/// messages; bot lines become plain assistant messages.
pub fn sync_from_log(
    transcript: &mut Vec<TranscriptMessage>,
    entries: &[LogEntry],
    up_to_ts: &str,
) -> usize {
    let high_water = transcript
        .iter()
        .rev()
        .find_map(|m| m.ts().map(str::to_string));

    let mut added = 0;
    for entry in entries {
        if let Some(hw) = &high_water {
            if !ts_newer(&entry.ts, hw) {
                continue;
            }
        }
        if ts_newer(&entry.ts, up_to_ts) {
            continue;
        }

        if entry.is_bot {
            transcript.push(TranscriptMessage::assistant_text(
                entry.text.clone(),
                StopReason::EndTurn,
                Some(entry.ts.clone()),
            ));
        } else {
            transcript.push(TranscriptMessage::user_text(
                format!("{}{}", entry_header(entry), entry.text),
                Some(entry.ts.clone()),
            ));
        }
        added += 1;
    }
    added
}

/// `"[<RFC3339> @<local-offset>] [<userName>]: "`
pub fn entry_header(entry: &LogEntry) -> String {
    let local = entry.date.with_timezone(&chrono::Local);
    let name = entry
        .user_name
        .as_deref()
        .unwrap_or(entry.user.as_str());
    format!(
        "[{} @{}] [{}]: ",
        entry.date.to_rfc3339_opts(SecondsFormat::Secs, true),
        local.offset(),
        name
    )
}

/// Remove the timestamp-and-username header from a synced user line.
pub fn strip_header(text: &str) -> &str {
    if !text.starts_with('[') {
        return text;
    }
    let Some(bracket) = text.find("] [") else {
        return text;
    };
    match text[bracket..].find("]: ") {
        Some(rel) => &text[bracket + rel + 3..],
        None => text,
    }
}

/// Keep the last [`MAX_TURNS`] turns, prefixing a synthetic trim notice when
/// anything was dropped.
pub fn trim_turns(transcript: Vec<TranscriptMessage>) -> (Vec<TranscriptMessage>, bool) {
    let mut starts: Vec<usize> = transcript
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_user())
        .map(|(i, _)| i)
        .collect();
    // Leading non-user messages count toward the first turn.
    if !transcript.is_empty() && starts.first() != Some(&0) {
        starts.insert(0, 0);
    }

    if starts.len() <= MAX_TURNS {
        return (transcript, false);
    }

    let keep_from = starts[starts.len() - MAX_TURNS];
    let dropped = &transcript[..keep_from];
    let last_topic: String = dropped
        .iter()
        .rev()
        .find(|m| m.is_user())
        .map(|m| strip_header(&m.text_content()).to_string())
        .unwrap_or_default()
        .chars()
        .take(100)
        .collect();

    let mut trimmed = Vec::with_capacity(transcript.len() - keep_from + 1);
    trimmed.push(TranscriptMessage::user_text(
        format!("[Prior context trimmed. Last topic before trim: {last_topic}]"),
        None,
    ));
    trimmed.extend_from_slice(&transcript[keep_from..]);
    (trimmed, true)
}

/// Compare two `ts` values: numerically when both parse, lexically otherwise.
fn ts_newer(a: &str, b: &str) -> bool {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => a > b,
    }
}
