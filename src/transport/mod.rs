//! Chat transport capability: the bot's only dependency on the chat system.
//!
//! The transport, not the core, is responsible for rate-limiting edits.

pub mod cli;
pub mod discord;

pub use cli::CliTransport;
pub use discord::DiscordTransport;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Opaque handle to a posted message, sufficient to edit or delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub channel_id: String,
    pub message_id: String,
}

/// One inbound chat message, already normalized by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    /// Unique per `(channel, message)`; monotonic or snowflake.
    pub ts: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub display_name: Option<String>,
    pub text: String,
    pub files: Vec<InboundFile>,
    pub sent_at: DateTime<Utc>,
    pub is_bot: bool,
}

#[derive(Debug, Clone)]
pub struct InboundFile {
    pub name: String,
    pub url: String,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle>;

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()>;

    async fn delete_message(&self, handle: &MessageHandle) -> Result<()>;

    /// Post into the thread rooted at `parent`, creating it if needed.
    async fn post_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle>;

    async fn upload_file(
        &self,
        channel_id: &str,
        file_path: &Path,
        title: Option<&str>,
    ) -> Result<()>;

    async fn set_typing(&self, channel_id: &str, on: bool) -> Result<()>;

    /// Known `(id, handle)` pairs for the channel/user table in the system
    /// prompt. Default: nothing known.
    fn roster(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Synthesize a `ts` for locally-originated log entries (bot replies,
    /// scheduler firings). Must sort consistently with the `ts` values this
    /// transport puts on inbound messages.
    fn now_ts(&self) -> String {
        Utc::now().timestamp_millis().to_string()
    }
}
