//! LLM backend capability: a streamed tool-use completion.

pub mod compatible;
pub mod types;

pub use compatible::CompatibleBackend;
pub use types::{Part, StopReason, TranscriptMessage, Usage};

use crate::tools::ToolSpec;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted by a backend over the course of one completion call.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    MessageStart {
        role: String,
    },
    MessageEnd {
        role: String,
        content: Vec<Part>,
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
        error_message: Option<String>,
    },
    /// The backend hit a retryable condition and is about to retry.
    AutoRetry {
        attempt: u32,
        max: u32,
    },
    CompactionStart,
    CompactionEnd,
}

/// One completion request: the rebuilt system prompt plus the synced,
/// trimmed transcript (the current user message is its last entry).
pub struct PromptRequest<'a> {
    pub system_prompt: &'a str,
    pub transcript: &'a [TranscriptMessage],
    pub tools: &'a [ToolSpec],
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn model_id(&self) -> &str;

    /// Context window of the active model, in tokens.
    fn context_window(&self) -> u32;

    /// Local providers post usage summaries even at zero cost.
    fn is_local(&self) -> bool {
        false
    }

    /// Run one completion, streaming events into `events`. Cancellation must
    /// surrender with a `MessageEnd` carrying `StopReason::Aborted`.
    async fn prompt(
        &self,
        request: PromptRequest<'_>,
        events: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
