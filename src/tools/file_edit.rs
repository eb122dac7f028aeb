use super::traits::{label_property, require_str, Tool, ToolOutcome};
use crate::sandbox::Sandbox;
use crate::security::SecurityPolicy;
use async_trait::async_trait;
use serde_json::json;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Maximum changed lines shown per side of the diff summary.
const DIFF_CONTEXT_CAP: usize = 20;

/// Edit a file by exact string replacement. `find` must occur exactly once
/// unless `replaceAll` is set; zero occurrences is always an error. Returns
/// a unified-diff-style summary of the change.
pub struct FileEditTool {
    policy: Arc<SecurityPolicy>,
    sandbox: Arc<dyn Sandbox>,
}

impl FileEditTool {
    pub fn new(policy: Arc<SecurityPolicy>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { policy, sandbox }
    }
}

#[async_trait]
impl Tool for FileEditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact text match in a file. Set replaceAll to replace every occurrence."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path (absolute or relative to the workspace)" },
                "find": { "type": "string", "description": "Exact text to find" },
                "replace": { "type": "string", "description": "Replacement text (may be empty)" },
                "replaceAll": { "type": "boolean", "description": "Replace every occurrence instead of requiring exactly one" },
                "label": label_property()
            },
            "required": ["path", "find", "replace"]
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
        let find = match require_str(&args, "find") {
            Ok(f) => f,
            Err(e) => return e,
        };
        let replace = match require_str(&args, "replace") {
            Ok(r) => r,
            Err(e) => return e,
        };
        let replace_all = args
            .get("replaceAll")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if find.is_empty() {
            return ToolOutcome::error("'find' must not be empty");
        }

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
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let count = content.matches(find).count();
        if count == 0 {
            return ToolOutcome::error(format!("'find' text not found in {path}"));
        }
        if count > 1 && !replace_all {
            return ToolOutcome::error(format!(
                "'find' matches {count} times in {path}; pass replaceAll to replace every occurrence"
            ));
        }

        let updated = if replace_all {
            content.replace(find, replace)
        } else {
            content.replacen(find, replace, 1)
        };

        if let Err(e) = self.sandbox.write_file(&resolved, updated.as_bytes()).await {
            return ToolOutcome::error(format!("Failed to write {path}: {e}"));
        }

        let replaced = if replace_all { count } else { 1 };
        ToolOutcome::text(format!(
            "Edited {path} ({replaced} replacement{}):\n{}",
            if replaced == 1 { "" } else { "s" },
            diff_summary(&content, &updated)
        ))
    }
}

/// A minimal unified-diff-style hunk: the changed middle of the file after
/// stripping the common line prefix and suffix.
fn diff_summary(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let removed = &old_lines[prefix..old_lines.len() - suffix];
    let added = &new_lines[prefix..new_lines.len() - suffix];

    let mut out = format!("@@ line {} @@\n", prefix + 1);
    for line in removed.iter().take(DIFF_CONTEXT_CAP) {
        let _ = writeln!(out, "- {line}");
    }
    if removed.len() > DIFF_CONTEXT_CAP {
        let _ = writeln!(out, "- … {} more lines", removed.len() - DIFF_CONTEXT_CAP);
    }
    for line in added.iter().take(DIFF_CONTEXT_CAP) {
        let _ = writeln!(out, "+ {line}");
    }
    if added.len() > DIFF_CONTEXT_CAP {
        let _ = writeln!(out, "+ … {} more lines", added.len() - DIFF_CONTEXT_CAP);
    }
    out.trim_end().to_string()
}
