use super::traits::{label_property, require_str, Tool, ToolOutcome};
use crate::sandbox::Sandbox;
use crate::security::SecurityPolicy;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Write file contents, creating parent directories and overwriting any
/// existing file.
pub struct FileWriteTool {
    policy: Arc<SecurityPolicy>,
    sandbox: Arc<dyn Sandbox>,
}

impl FileWriteTool {
    pub fn new(policy: Arc<SecurityPolicy>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { policy, sandbox }
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories and overwriting if it exists"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path (absolute or relative to the workspace)" },
                "content": { "type": "string", "description": "Full file content to write" },
                "label": label_property()
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        args: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> ToolOutcome {
        let path = match require_str(&args, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let content = match require_str(&args, "content") {
            Ok(c) => c,
            Err(e) => return e,
        };

        let cwd = self.sandbox.workspace_path();
        let verdict = self.policy.check_path(path, &cwd);
        if !verdict.allowed {
            return ToolOutcome::error(verdict.reason());
        }

        let resolved = if Path::new(path).is_absolute() {
            Path::new(path).to_path_buf()
        } else {
            cwd.join(path)
        };

        match self.sandbox.write_file(&resolved, content.as_bytes()).await {
            Ok(()) => ToolOutcome::text(format!("Wrote {} bytes to {path}", content.len())),
            Err(e) => ToolOutcome::error(format!("Failed to write {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostSandbox;
    use crate::security::CommandListPatch;
    use tempfile::TempDir;

    fn tool(tmp: &TempDir) -> FileWriteTool {
        let policy = Arc::new(SecurityPolicy::new(tmp.path(), &[], &CommandListPatch::default()));
        let sandbox = Arc::new(HostSandbox::new(tmp.path().to_path_buf()));
        FileWriteTool::new(policy, sandbox)
    }

    #[tokio::test]
    async fn writes_and_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute(
                "c",
                json!({"path": "deep/nested/file.txt", "content": "payload"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(!outcome.is_error, "{}", outcome.text_content());
        assert!(outcome.text_content().contains("7 bytes"));
        let written = std::fs::read_to_string(tmp.path().join("deep/nested/file.txt")).unwrap();
        assert_eq!(written, "payload");
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "old").unwrap();
        tool(&tmp)
            .execute(
                "c",
                json!({"path": "f.txt", "content": "new"}),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(std::fs::read_to_string(tmp.path().join("f.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn blocks_traversal() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute(
                "c",
                json!({"path": "../../etc/shadow", "content": "x"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("outside allowed"));
    }

    #[tokio::test]
    async fn missing_content_param() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({"path": "f.txt"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("content"));
    }
}
