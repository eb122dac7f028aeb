use super::traits::{label_property, require_str, Tool, ToolOutcome};
use crate::sandbox::Sandbox;
use crate::security::SecurityPolicy;
use async_trait::async_trait;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default shell timeout when the model does not pass one.
const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Upper bound on what the model may request.
const MAX_TIMEOUT_SECS: u64 = 1800;

/// Execute a shell command through the sandbox. The whole command line is
/// vetted by the command guard before anything runs.
pub struct BashTool {
    policy: Arc<SecurityPolicy>,
    sandbox: Arc<dyn Sandbox>,
}

impl BashTool {
    pub fn new(policy: Arc<SecurityPolicy>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { policy, sandbox }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace. Output is tail-truncated; long commands accept timeoutSec."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute" },
                "timeoutSec": {
                    "type": "integer",
                    "description": format!("Timeout in seconds (default {DEFAULT_TIMEOUT_SECS}, max {MAX_TIMEOUT_SECS})")
                },
                "label": label_property()
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let command = match require_str(&args, "command") {
            Ok(c) => c,
            Err(e) => return e,
        };

        let verdict = self.policy.check_command(command);
        if !verdict.allowed {
            return ToolOutcome::error(verdict.reason());
        }

        let timeout_secs = args
            .get("timeoutSec")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        let output = match self
            .sandbox
            .run_shell(command, Duration::from_secs(timeout_secs), cancel)
            .await
        {
            Ok(o) => o,
            Err(e) => return ToolOutcome::error(e.to_string()),
        };

        let mut rendered = String::new();
        if !output.stdout.is_empty() {
            rendered.push_str(&output.stdout);
        }
        if !output.stderr.is_empty() {
            if !rendered.is_empty() {
                rendered.push('\n');
            }
            let _ = write!(rendered, "[stderr]\n{}", output.stderr);
        }
        if output.exit_code != 0 {
            if !rendered.is_empty() {
                rendered.push('\n');
            }
            let _ = write!(rendered, "[exit code: {}]", output.exit_code);
        }
        if rendered.is_empty() {
            rendered.push_str("(no output)");
        }

        if output.exit_code == 0 {
            ToolOutcome::text(rendered)
        } else {
            ToolOutcome {
                content: vec![crate::llm::types::Part::text(rendered)],
                is_error: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostSandbox;
    use crate::security::CommandListPatch;
    use tempfile::TempDir;

    fn tool(tmp: &TempDir) -> BashTool {
        let policy = Arc::new(SecurityPolicy::new(tmp.path(), &[], &CommandListPatch::default()));
        let sandbox = Arc::new(HostSandbox::new(tmp.path().to_path_buf()));
        BashTool::new(policy, sandbox)
    }

    #[tokio::test]
    async fn runs_allowed_command() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({"command": "echo shell-ok"}), &CancellationToken::new())
            .await;
        assert!(!outcome.is_error);
        assert!(outcome.text_content().contains("shell-ok"));
    }

    #[tokio::test]
    async fn guard_blocks_whole_command_line() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute(
                "c",
                json!({"command": "cat f | sudo tee /etc/passwd"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("sudo"));
    }

    #[tokio::test]
    async fn guard_blocks_fork_bomb() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({"command": ":(){ :|:& };:"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("fork bomb"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_with_output() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute(
                "c",
                json!({"command": "ls missing_for_bash_tool_test"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("[exit code:"));
    }

    #[tokio::test]
    async fn timeout_surfaces_as_tool_error() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute(
                "c",
                json!({"command": "sleep 5", "timeoutSec": 0}),
                &CancellationToken::new(),
            )
            .await;
        // timeoutSec 0 is clamped to 0s, which times out immediately.
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_command_param() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("command"));
    }
}
