use super::traits::{require_str, label_property, Tool, ToolOutcome};
use crate::llm::types::Part;
use crate::sandbox::Sandbox;
use crate::security::SecurityPolicy;
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Read a file from the workspace. Recognized image extensions come back as
/// base64 image parts with the matching MIME type; everything else is UTF-8
/// text with optional line offset/limit.
pub struct FileReadTool {
    policy: Arc<SecurityPolicy>,
    sandbox: Arc<dyn Sandbox>,
}

impl FileReadTool {
    pub fn new(policy: Arc<SecurityPolicy>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { policy, sandbox }
    }
}

/// Extension-based MIME inference. Content sniffing is deliberately not done.
pub(crate) fn image_mime(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("png") => Some("image/png"),
        Some("gif") => Some("image/gif"),
        Some("webp") => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file. Images (jpg/jpeg/png/gif/webp) are returned as images; text files as UTF-8 text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path (absolute or relative to the workspace)" },
                "offset": { "type": "integer", "description": "1-based line number to start from (text files only)" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return" },
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

        let bytes = match self.sandbox.read_file(&resolved).await {
            Ok(b) => b,
            Err(e) => return ToolOutcome::error(format!("Failed to read {path}: {e}")),
        };

        if let Some(mime) = image_mime(&resolved) {
            return ToolOutcome {
                content: vec![Part::Image {
                    mime_type: mime.to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(&bytes),
                }],
                is_error: false,
            };
        }

        let text = String::from_utf8_lossy(&bytes);
        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let selected: Vec<&str> = match limit {
            Some(limit) => text.lines().skip(offset - 1).take(limit).collect(),
            None if offset > 1 => text.lines().skip(offset - 1).collect(),
            None => return ToolOutcome::text(text.into_owned()),
        };
        ToolOutcome::text(selected.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostSandbox;
    use crate::security::CommandListPatch;
    use tempfile::TempDir;

    fn tool(tmp: &TempDir) -> FileReadTool {
        let policy = Arc::new(SecurityPolicy::new(tmp.path(), &[], &CommandListPatch::default()));
        let sandbox = Arc::new(HostSandbox::new(tmp.path().to_path_buf()));
        FileReadTool::new(policy, sandbox)
    }

    #[tokio::test]
    async fn reads_text_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.md"), "alpha\nbeta\ngamma").unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({"path": "notes.md"}), &CancellationToken::new())
            .await;
        assert!(!outcome.is_error);
        assert_eq!(outcome.text_content(), "alpha\nbeta\ngamma");
    }

    #[tokio::test]
    async fn offset_and_limit_select_lines() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "l1\nl2\nl3\nl4\nl5").unwrap();
        let outcome = tool(&tmp)
            .execute(
                "c",
                json!({"path": "f.txt", "offset": 2, "limit": 2}),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.text_content(), "l2\nl3");
    }

    #[tokio::test]
    async fn png_returns_image_part() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("pic.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({"path": "pic.png"}), &CancellationToken::new())
            .await;
        assert!(!outcome.is_error);
        match &outcome.content[0] {
            Part::Image { mime_type, data } => {
                assert_eq!(mime_type, "image/png");
                assert!(!data.is_empty());
            }
            other => panic!("expected image part, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mime_follows_extension() {
        assert_eq!(image_mime(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(image_mime(Path::new("a.webp")), Some("image/webp"));
        assert_eq!(image_mime(Path::new("a.txt")), None);
        assert_eq!(image_mime(Path::new("noext")), None);
    }

    #[tokio::test]
    async fn blocks_path_outside_workspace() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({"path": "/etc/passwd"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("outside allowed"));
    }

    #[tokio::test]
    async fn missing_file_is_error_outcome() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({"path": "nope.txt"}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text_content().contains("Failed to read"));
    }

    #[tokio::test]
    async fn missing_path_param() {
        let tmp = TempDir::new().unwrap();
        let outcome = tool(&tmp)
            .execute("c", json!({}), &CancellationToken::new())
            .await;
        assert!(outcome.is_error);
    }
}
