use crate::llm::types::Part;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Description of a tool for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Result of a tool execution. Failures are values, never panics or
/// propagated errors; a failed tool does not end the run.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: Vec<Part>,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Part::text(text)],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Part::text(message)],
            is_error: true,
        }
    }

    /// Concatenated text parts, for logging and thread summaries.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Core tool trait. Every parameter schema carries an optional human
/// `label` that is surfaced as the working-indicator caption.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in LLM function calling).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        call_id: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolOutcome;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Pull the optional `label` argument every tool accepts.
pub fn arg_label(args: &serde_json::Value) -> Option<String> {
    args.get("label")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// The standard `label` property fragment for parameter schemas.
pub fn label_property() -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": "Short human-readable caption shown in chat while this tool runs"
    })
}

/// Pull a required string argument, or produce the standard error outcome.
pub fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolOutcome> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutcome::error(format!("Missing '{key}' parameter")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct DummyTool;

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            "dummy"
        }

        fn description(&self) -> &str {
            "A deterministic test tool"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "value": { "type": "string" }, "label": label_property() }
            })
        }

        async fn execute(
            &self,
            _call_id: &str,
            args: serde_json::Value,
            _cancel: &CancellationToken,
        ) -> ToolOutcome {
            match require_str(&args, "value") {
                Ok(v) => ToolOutcome::text(v),
                Err(e) => e,
            }
        }
    }

    #[test]
    fn spec_uses_tool_metadata_and_schema() {
        let spec = DummyTool.spec();
        assert_eq!(spec.name, "dummy");
        assert_eq!(spec.parameters["properties"]["value"]["type"], "string");
        assert!(spec.parameters["properties"]["label"].is_object());
    }

    #[tokio::test]
    async fn execute_returns_text_outcome() {
        let outcome = DummyTool
            .execute("c1", json!({"value": "hello"}), &CancellationToken::new())
            .await;
        assert!(!outcome.is_error);
        assert_eq!(outcome.text_content(), "hello");
    }

    #[tokio::test]
    async fn missing_param_is_an_error_outcome_not_a_panic() {
        let outcome = DummyTool
            .execute("c1", json!({}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("value"));
    }

    #[test]
    fn arg_label_extraction() {
        assert_eq!(
            arg_label(&json!({"label": "reading notes"})).as_deref(),
            Some("reading notes")
        );
        assert_eq!(arg_label(&json!({})), None);
    }
}
