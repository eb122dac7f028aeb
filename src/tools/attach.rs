use super::traits::{label_property, require_str, Tool, ToolOutcome};
use crate::sandbox::Sandbox;
use crate::security::SecurityPolicy;
use crate::transport::ChatTransport;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upload a workspace file to the chat. The path is guarded like every other
/// file tool; the upload itself reads from the host side of the namespace.
pub struct AttachTool {
    policy: Arc<SecurityPolicy>,
    sandbox: Arc<dyn Sandbox>,
    transport: Arc<dyn ChatTransport>,
    channel_id: String,
}

impl AttachTool {
    pub fn new(
        policy: Arc<SecurityPolicy>,
        sandbox: Arc<dyn Sandbox>,
        transport: Arc<dyn ChatTransport>,
        channel_id: String,
    ) -> Self {
        Self {
            policy,
            sandbox,
            transport,
            channel_id,
        }
    }
}

#[async_trait]
impl Tool for AttachTool {
    fn name(&self) -> &str {
        "attach"
    }

    fn description(&self) -> &str {
        "Upload a file from the workspace to the chat"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path (absolute or relative to the workspace)" },
                "title": { "type": "string", "description": "Optional title shown with the upload" },
                "label": label_property()
            },
            "required": ["path"]
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
        let title = args.get("title").and_then(|v| v.as_str());

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
        let host_path = self.sandbox.to_host(&resolved);

        if !tokio::fs::try_exists(&host_path).await.unwrap_or(false) {
            return ToolOutcome::error(format!("File not found: {path}"));
        }

        match self
            .transport
            .upload_file(&self.channel_id, &host_path, title)
            .await
        {
            Ok(()) => ToolOutcome::text(format!("Uploaded {path}")),
            Err(e) => ToolOutcome::error(format!("Upload failed for {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostSandbox;
    use crate::security::CommandListPatch;
    use crate::transport::MessageHandle;
    use anyhow::Result;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingTransport {
        uploads: Mutex<Vec<(String, String, Option<String>)>>,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn post_message(&self, channel_id: &str, _text: &str) -> Result<MessageHandle> {
            Ok(MessageHandle {
                channel_id: channel_id.into(),
                message_id: "1".into(),
            })
        }
        async fn update_message(&self, _handle: &MessageHandle, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_message(&self, _handle: &MessageHandle) -> Result<()> {
            Ok(())
        }
        async fn post_in_thread(&self, parent: &MessageHandle, _text: &str) -> Result<MessageHandle> {
            Ok(parent.clone())
        }
        async fn upload_file(
            &self,
            channel_id: &str,
            file_path: &Path,
            title: Option<&str>,
        ) -> Result<()> {
            self.uploads.lock().unwrap().push((
                channel_id.to_string(),
                file_path.display().to_string(),
                title.map(str::to_string),
            ));
            Ok(())
        }
        async fn set_typing(&self, _channel_id: &str, _on: bool) -> Result<()> {
            Ok(())
        }
    }

    fn tool(tmp: &TempDir, transport: Arc<RecordingTransport>) -> AttachTool {
        let policy = Arc::new(SecurityPolicy::new(tmp.path(), &[], &CommandListPatch::default()));
        let sandbox = Arc::new(HostSandbox::new(tmp.path().to_path_buf()));
        AttachTool::new(policy, sandbox, transport, "chan-1".into())
    }

    #[tokio::test]
    async fn uploads_existing_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("report.txt"), "data").unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let outcome = tool(&tmp, transport.clone())
            .execute(
                "c",
                json!({"path": "report.txt", "title": "the report"}),
                &CancellationToken::new(),
            )
            .await;
        assert!(!outcome.is_error, "{}", outcome.text_content());

        let uploads = transport.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "chan-1");
        assert!(uploads[0].1.ends_with("report.txt"));
        assert_eq!(uploads[0].2.as_deref(), Some("the report"));
    }

    #[tokio::test]
    async fn guards_path() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let outcome = tool(&tmp, transport.clone())
            .execute("c", json!({"path": "/etc/passwd"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(transport.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let outcome = tool(&tmp, transport)
            .execute("c", json!({"path": "absent.bin"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("not found"));
    }
}
