use super::traits::{label_property, require_str, Tool, ToolOutcome};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default timeout for a delegated agent run.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Escalation tool: spawn an out-of-process coding agent as a subprocess.
/// Its JSON stdout carries `{result, session_id}`; the session id is echoed
/// back as `[session_id: …]` so the model can resume the same session later.
pub struct DelegateTool {
    workspace_dir: PathBuf,
    /// Program plus leading arguments, e.g. `["claude"]`.
    agent_cmd: Vec<String>,
}

impl DelegateTool {
    pub fn new(workspace_dir: PathBuf, agent_cmd: Vec<String>) -> Self {
        Self {
            workspace_dir,
            agent_cmd,
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Hand a complex coding task to a full coding agent running in the workspace. \
         Pass sessionId to resume a previous delegation."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "The task for the coding agent" },
                "sessionId": { "type": "string", "description": "Session id from a previous delegation to resume" },
                "maxTurns": { "type": "integer", "description": "Cap on the agent's tool-use turns" },
                "timeoutSec": { "type": "integer", "description": format!("Timeout in seconds (default {DEFAULT_TIMEOUT_SECS})") },
                "label": label_property()
            },
            "required": ["prompt"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let prompt = match require_str(&args, "prompt") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let Some(program) = self.agent_cmd.first() else {
            return ToolOutcome::error("No delegate agent command configured");
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&self.agent_cmd[1..])
            .arg("-p")
            .arg(prompt)
            .args(["--output-format", "json"])
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(session_id) = args.get("sessionId").and_then(|v| v.as_str()) {
            cmd.args(["--resume", session_id]);
        }
        if let Some(max_turns) = args.get("maxTurns").and_then(|v| v.as_u64()) {
            cmd.args(["--max-turns", &max_turns.to_string()]);
        }

        let timeout = Duration::from_secs(
            args.get("timeoutSec")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        );

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutcome::error(format!("Failed to spawn '{program}': {e}")),
        };

        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return ToolOutcome::error(format!("Delegate agent failed: {e}")),
                    Err(_) => {
                        return ToolOutcome::error(format!(
                            "Delegate agent timed out after {}s",
                            timeout.as_secs()
                        ))
                    }
                }
            }
            () = cancel.cancelled() => return ToolOutcome::error("Delegate agent aborted"),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ToolOutcome::error(format!(
                "Delegate agent exited with {}: {}",
                output.status,
                crate::util::truncate_with_ellipsis(stderr.trim(), 400)
            ));
        }

        match parse_agent_output(&stdout) {
            Some((result, session_id)) => {
                ToolOutcome::text(format!("{result}\n\n[session_id: {session_id}]"))
            }
            None => ToolOutcome::error(format!(
                "Delegate agent produced unparseable output: {}",
                crate::util::truncate_with_ellipsis(stdout.trim(), 400)
            )),
        }
    }
}

/// Extract `{result, session_id}` from the agent's JSON stdout.
fn parse_agent_output(stdout: &str) -> Option<(String, String)> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    let result = value.get("result")?.as_str()?.to_string();
    let session_id = value.get("session_id")?.as_str()?.to_string();
    Some((result, session_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_agent_json() {
        let parsed = parse_agent_output(r#"{"result": "done", "session_id": "s-123"}"#);
        assert_eq!(parsed, Some(("done".to_string(), "s-123".to_string())));
    }

    #[test]
    fn rejects_malformed_json() {
        assert_eq!(parse_agent_output("not json"), None);
        assert_eq!(parse_agent_output(r#"{"result": "x"}"#), None);
    }

    #[tokio::test]
    async fn surfaces_session_id_in_output() {
        let tmp = TempDir::new().unwrap();
        // A stand-in "agent" that echoes well-formed JSON, ignoring flags.
        let tool = DelegateTool::new(
            tmp.path().to_path_buf(),
            vec![
                "sh".into(),
                "-c".into(),
                r#"echo '{"result": "task complete", "session_id": "sess-9"}' #"#.into(),
            ],
        );
        let outcome = tool
            .execute("c", json!({"prompt": "do the thing"}), &CancellationToken::new())
            .await;
        assert!(!outcome.is_error, "{}", outcome.text_content());
        assert!(outcome.text_content().contains("task complete"));
        assert!(outcome.text_content().contains("[session_id: sess-9]"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_error() {
        let tmp = TempDir::new().unwrap();
        let tool = DelegateTool::new(
            tmp.path().to_path_buf(),
            vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3 #".into()],
        );
        let outcome = tool
            .execute("c", json!({"prompt": "x"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("boom"));
    }

    #[tokio::test]
    async fn missing_binary_is_error_outcome() {
        let tmp = TempDir::new().unwrap();
        let tool = DelegateTool::new(
            tmp.path().to_path_buf(),
            vec!["definitely-not-a-real-binary-xyz".into()],
        );
        let outcome = tool
            .execute("c", json!({"prompt": "x"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn missing_prompt_param() {
        let tmp = TempDir::new().unwrap();
        let tool = DelegateTool::new(tmp.path().to_path_buf(), vec!["claude".into()]);
        let outcome = tool.execute("c", json!({}), &CancellationToken::new()).await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("prompt"));
    }
}
