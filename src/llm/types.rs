//! Transcript data model: messages, content parts, stop reasons, usage.

use serde::{Deserialize, Serialize};

/// One piece of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    ToolUse {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        args: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Aborted,
    Error,
}

/// Token counts and dollar cost accumulated across assistant messages.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(rename = "cacheRead", default)]
    pub cache_read: u64,
    #[serde(rename = "cacheWrite", default)]
    pub cache_write: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.cost += other.cost;
    }
}

/// One line of `context.jsonl`. A *turn* is a maximal contiguous run that
/// begins with a `user` message and ends before the next one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum TranscriptMessage {
    User {
        #[serde(with = "content_compat")]
        content: Vec<Part>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<String>,
    },
    Assistant {
        content: Vec<Part>,
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(rename = "errorMessage", default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<String>,
    },
    Tool {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        result: String,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
}

impl TranscriptMessage {
    pub fn user_text(text: impl Into<String>, ts: Option<String>) -> Self {
        Self::User {
            content: vec![Part::text(text)],
            ts,
        }
    }

    pub fn assistant_text(text: impl Into<String>, stop_reason: StopReason, ts: Option<String>) -> Self {
        Self::Assistant {
            content: vec![Part::text(text)],
            stop_reason,
            usage: None,
            error_message: None,
            ts,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, result: impl Into<String>, is_error: bool) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            result: result.into(),
            is_error,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    pub fn ts(&self) -> Option<&str> {
        match self {
            Self::User { ts, .. } | Self::Assistant { ts, .. } => ts.as_deref(),
            Self::Tool { .. } => None,
        }
    }

    /// Concatenated text parts of this message.
    pub fn text_content(&self) -> String {
        let parts = match self {
            Self::User { content, .. } | Self::Assistant { content, .. } => content,
            Self::Tool { result, .. } => return result.clone(),
        };
        parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Accept `content` as either a bare string or a part array; always emit
/// the array form.
mod content_compat {
    use super::Part;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(parts: &Vec<Part>, serializer: S) -> Result<S::Ok, S::Error> {
        parts.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Part>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Parts(Vec<Part>),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => vec![Part::text(text)],
            Raw::Parts(parts) => parts,
        })
    }
}
