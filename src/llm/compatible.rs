//! Generic OpenAI-compatible chat-completions backend. Most hosted and
//! local LLM servers speak this wire format, so one implementation covers
//! OpenRouter, Ollama, vLLM, and friends.

use super::types::{Part, StopReason, TranscriptMessage, Usage};
use super::{BackendEvent, LlmBackend, PromptRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_RETRIES: u32 = 3;

pub struct CompatibleBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    context_window: u32,
    /// Dollars per million input/output tokens; zero for local providers.
    input_cost_per_mtok: f64,
    output_cost_per_mtok: f64,
    local: bool,
    client: reqwest::Client,
}

impl CompatibleBackend {
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        context_window: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
            model: model.to_string(),
            context_window,
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
            local: false,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    #[must_use]
    pub fn with_pricing(mut self, input_per_mtok: f64, output_per_mtok: f64) -> Self {
        self.input_cost_per_mtok = input_per_mtok;
        self.output_cost_per_mtok = output_per_mtok;
        self
    }

    #[must_use]
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    fn request_body(&self, request: &PromptRequest<'_>) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
        messages.extend(request.transcript.iter().map(wire_message));

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|spec| {
                json!({
                    "type": "function",
                    "function": {
                        "name": spec.name,
                        "description": spec.description,
                        "parameters": spec.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    async fn send_once(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req.send().await.with_context(|| format!("POST {url}"))
    }

    fn usage_from(&self, raw: &Value) -> Option<Usage> {
        let usage = raw.get("usage")?;
        let input = usage.get("prompt_tokens")?.as_u64()?;
        let output = usage.get("completion_tokens")?.as_u64()?;
        let cache_read = usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let cost = (input as f64 * self.input_cost_per_mtok
            + output as f64 * self.output_cost_per_mtok)
            / 1_000_000.0;
        Some(Usage {
            input,
            output,
            cache_read,
            cache_write: 0,
            cost,
        })
    }
}

#[async_trait]
impl LlmBackend for CompatibleBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn prompt(
        &self,
        request: PromptRequest<'_>,
        events: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let body = self.request_body(&request);
        events
            .send(BackendEvent::MessageStart {
                role: "assistant".into(),
            })
            .await
            .ok();

        let mut backoff = Duration::from_millis(500);
        let mut attempt = 0;
        let raw: Value = loop {
            let response = tokio::select! {
                r = self.send_once(&body) => r,
                () = cancel.cancelled() => {
                    events.send(aborted_end()).await.ok();
                    return Ok(());
                }
            };

            match response {
                Ok(response) if response.status().is_success() => {
                    break response.json().await.context("decoding completion")?;
                }
                Ok(response) => {
                    let status = response.status();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let detail = response.text().await.unwrap_or_default();
                    if retryable && attempt < MAX_RETRIES {
                        attempt += 1;
                        events
                            .send(BackendEvent::AutoRetry {
                                attempt,
                                max: MAX_RETRIES,
                            })
                            .await
                            .ok();
                        tokio::select! {
                            () = tokio::time::sleep(backoff) => {}
                            () = cancel.cancelled() => {
                                events.send(aborted_end()).await.ok();
                                return Ok(());
                            }
                        }
                        backoff *= 2;
                        continue;
                    }
                    anyhow::bail!("{} API error ({status}): {detail}", self.name);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        attempt += 1;
                        events
                            .send(BackendEvent::AutoRetry {
                                attempt,
                                max: MAX_RETRIES,
                            })
                            .await
                            .ok();
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    return Err(e);
                }
            }
        };

        let choice = raw
            .pointer("/choices/0")
            .with_context(|| format!("no choices from {}", self.name))?;
        let (content, stop_reason) = parse_choice(choice);

        events
            .send(BackendEvent::MessageEnd {
                role: "assistant".into(),
                content,
                stop_reason,
                usage: self.usage_from(&raw),
                error_message: None,
            })
            .await
            .ok();
        Ok(())
    }
}

fn aborted_end() -> BackendEvent {
    BackendEvent::MessageEnd {
        role: "assistant".into(),
        content: Vec::new(),
        stop_reason: Some(StopReason::Aborted),
        usage: None,
        error_message: None,
    }
}

/// Map one transcript message onto the wire format.
fn wire_message(message: &TranscriptMessage) -> Value {
    match message {
        TranscriptMessage::User { content, .. } => {
            let has_images = content.iter().any(|p| matches!(p, Part::Image { .. }));
            if !has_images {
                return json!({"role": "user", "content": text_of(content)});
            }
            let parts: Vec<Value> = content
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text } => Some(json!({"type": "text", "text": text})),
                    Part::Image { mime_type, data } => Some(json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{mime_type};base64,{data}")}
                    })),
                    _ => None,
                })
                .collect();
            json!({"role": "user", "content": parts})
        }
        TranscriptMessage::Assistant { content, .. } => {
            let tool_calls: Vec<Value> = content
                .iter()
                .filter_map(|part| match part {
                    Part::ToolUse {
                        tool_call_id,
                        tool_name,
                        args,
                    } => Some(json!({
                        "id": tool_call_id,
                        "type": "function",
                        "function": {"name": tool_name, "arguments": args.to_string()}
                    })),
                    _ => None,
                })
                .collect();
            let mut msg = json!({"role": "assistant", "content": text_of(content)});
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
            }
            msg
        }
        TranscriptMessage::Tool {
            tool_call_id,
            result,
            ..
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": result,
        }),
    }
}

fn text_of(content: &[Part]) -> String {
    content
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract parts and stop reason from `choices[0]`.
fn parse_choice(choice: &Value) -> (Vec<Part>, Option<StopReason>) {
    let mut content = Vec::new();
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(Part::text(text));
        }
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            // Some compatible servers omit call ids; mint one so tool
            // results can still refer back to their call.
            let tool_call_id = match call.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => format!("call_{}", uuid::Uuid::new_v4()),
            };
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let args = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            if !name.is_empty() {
                content.push(Part::ToolUse {
                    tool_call_id,
                    tool_name: name.to_string(),
                    args,
                });
            }
        }
    }

    let stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("tool_calls") => Some(StopReason::ToolUse),
        Some("length") => Some(StopReason::MaxTokens),
        Some("stop") => Some(StopReason::EndTurn),
        _ => None,
    };
    (content, stop_reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolSpec;

    fn backend() -> CompatibleBackend {
        CompatibleBackend::new("test", "http://localhost:11434/", None, "test-model", 8192)
            .with_pricing(3.0, 15.0)
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        assert_eq!(backend().base_url, "http://localhost:11434");
    }

    #[test]
    fn request_body_includes_system_and_tools() {
        let transcript = vec![TranscriptMessage::user_text("hello", None)];
        let tools = vec![ToolSpec {
            name: "bash".into(),
            description: "run".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = backend().request_body(&PromptRequest {
            system_prompt: "be helpful",
            transcript: &transcript,
            tools: &tools,
        });

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be helpful");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["tools"][0]["function"]["name"], "bash");
    }

    #[test]
    fn wire_assistant_carries_tool_calls() {
        let msg = TranscriptMessage::Assistant {
            content: vec![
                Part::text("checking"),
                Part::ToolUse {
                    tool_call_id: "c1".into(),
                    tool_name: "read".into(),
                    args: json!({"path": "f.txt"}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            usage: None,
            error_message: None,
            ts: None,
        };
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "read");
        // Arguments are a JSON-encoded string on the wire.
        assert!(wire["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap()
            .contains("f.txt"));
    }

    #[test]
    fn wire_tool_result_message() {
        let wire = wire_message(&TranscriptMessage::tool_result("c9", "output", false));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c9");
        assert_eq!(wire["content"], "output");
    }

    #[test]
    fn wire_user_with_image_uses_part_array() {
        let msg = TranscriptMessage::User {
            content: vec![
                Part::text("what is this"),
                Part::Image {
                    mime_type: "image/png".into(),
                    data: "QUJD".into(),
                },
            ],
            ts: None,
        };
        let wire = wire_message(&msg);
        let parts = wire["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn parse_choice_text_final() {
        let (content, stop) = parse_choice(&json!({
            "message": {"content": "done"},
            "finish_reason": "stop"
        }));
        assert_eq!(content, vec![Part::text("done")]);
        assert_eq!(stop, Some(StopReason::EndTurn));
    }

    #[test]
    fn parse_choice_tool_calls() {
        let (content, stop) = parse_choice(&json!({
            "message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "bash", "arguments": "{\"command\": \"ls\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }));
        assert_eq!(stop, Some(StopReason::ToolUse));
        match &content[0] {
            Part::ToolUse { tool_name, args, .. } => {
                assert_eq!(tool_name, "bash");
                assert_eq!(args["command"], "ls");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn parse_choice_mints_id_when_server_omits_one() {
        let (content, _) = parse_choice(&json!({
            "message": {
                "tool_calls": [{
                    "function": {"name": "bash", "arguments": "{}"}
                }]
            },
            "finish_reason": "tool_calls"
        }));
        match &content[0] {
            Part::ToolUse { tool_call_id, .. } => {
                assert!(tool_call_id.starts_with("call_"));
                assert!(tool_call_id.len() > "call_".len());
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn parse_choice_malformed_arguments_degrade_to_empty_object() {
        let (content, _) = parse_choice(&json!({
            "message": {
                "tool_calls": [{
                    "id": "c",
                    "function": {"name": "bash", "arguments": "{broken"}
                }]
            }
        }));
        match &content[0] {
            Part::ToolUse { args, .. } => assert_eq!(*args, json!({})),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn usage_includes_cost_from_pricing() {
        let usage = backend()
            .usage_from(&json!({
                "usage": {"prompt_tokens": 1_000_000, "completion_tokens": 200_000}
            }))
            .unwrap();
        assert_eq!(usage.input, 1_000_000);
        assert_eq!(usage.output, 200_000);
        assert!((usage.cost - (3.0 + 3.0)).abs() < 1e-9);
    }
}
