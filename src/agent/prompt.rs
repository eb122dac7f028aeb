//! System prompt construction. Rebuilt from scratch on every run so edits
//! to the workspace markdown files take effect immediately.

use crate::skills::Skill;
use crate::util::human_size;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Character caps for injected workspace files.
const MOTHER_MAX_CHARS: usize = 3000;
const GLOBAL_MEMORY_MAX_CHARS: usize = 1500;
const CHANNEL_MEMORY_MAX_CHARS: usize = 1000;

/// Tree listing bounds.
const TREE_MAX_DEPTH: usize = 4;
const TREE_MAX_ENTRIES: usize = 150;

/// Names never shown in the tree listing.
const TREE_EXCLUDED: &[&str] = &[
    "node_modules",
    "attachments",
    "log.jsonl",
    "context.jsonl",
    "last_prompt.jsonl",
];

const IDENTITY: &str = "You are Mother, a long-lived assistant embedded in a chat workspace. \
You act through tools inside a sandboxed workspace and reply in chat. \
Be direct and concise. Use the workspace for anything that should persist. \
If a message needs no visible reply, respond with exactly [SILENT].";

pub struct SystemPromptBuilder {
    workspace_dir: PathBuf,
    sandbox_workspace: PathBuf,
    channel_id: String,
    model_name: String,
    roster: Vec<(String, String)>,
    skills: Vec<Skill>,
}

impl SystemPromptBuilder {
    pub fn new(workspace_dir: &Path, sandbox_workspace: &Path, channel_id: &str) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
            sandbox_workspace: sandbox_workspace.to_path_buf(),
            channel_id: channel_id.to_string(),
            model_name: String::new(),
            roster: Vec::new(),
            skills: Vec::new(),
        }
    }

    pub fn model(mut self, model_name: &str) -> Self {
        self.model_name = model_name.to_string();
        self
    }

    /// Known `(id, handle)` pairs for the channel/user table.
    pub fn roster(mut self, roster: Vec<(String, String)>) -> Self {
        self.roster = roster;
        self
    }

    pub fn skills(mut self, skills: Vec<Skill>) -> Self {
        self.skills = skills;
        self
    }

    pub fn build(&self) -> String {
        let mut prompt = String::with_capacity(8192);

        prompt.push_str(IDENTITY);
        prompt.push_str("\n\n");

        self.build_environment_section(&mut prompt);
        self.build_file_section(&mut prompt, "MOTHER.md", &self.workspace_dir.join("MOTHER.md"), MOTHER_MAX_CHARS);
        self.build_file_section(&mut prompt, "MEMORY.md (global)", &self.workspace_dir.join("MEMORY.md"), GLOBAL_MEMORY_MAX_CHARS);
        self.build_file_section(
            &mut prompt,
            "MEMORY.md (channel)",
            &self.workspace_dir.join(&self.channel_id).join("MEMORY.md"),
            CHANNEL_MEMORY_MAX_CHARS,
        );
        self.build_roster_section(&mut prompt);
        self.build_tree_section(&mut prompt);
        self.build_skills_section(&mut prompt);

        prompt
    }

    fn build_environment_section(&self, prompt: &mut String) {
        let _ = writeln!(prompt, "## Environment\n");
        let _ = writeln!(prompt, "- Channel: {}", self.channel_id);
        let _ = writeln!(prompt, "- Workspace root: {}", self.sandbox_workspace.display());
        let _ = writeln!(
            prompt,
            "- Channel directory: {}",
            self.sandbox_workspace.join(&self.channel_id).display()
        );
        if !self.model_name.is_empty() {
            let _ = writeln!(prompt, "- Model: {}", self.model_name);
        }
        prompt.push('\n');
    }

    fn build_file_section(&self, prompt: &mut String, title: &str, path: &Path, max_chars: usize) {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        let _ = writeln!(prompt, "## {title}\n");
        match trimmed.char_indices().nth(max_chars) {
            Some((idx, _)) => {
                prompt.push_str(&trimmed[..idx]);
                prompt.push_str("\n[truncated]\n\n");
            }
            None => {
                prompt.push_str(trimmed);
                prompt.push_str("\n\n");
            }
        }
    }

    fn build_roster_section(&self, prompt: &mut String) {
        if self.roster.is_empty() {
            return;
        }
        let _ = writeln!(prompt, "## Known IDs\n");
        let _ = writeln!(prompt, "| id | handle |");
        let _ = writeln!(prompt, "|---|---|");
        for (id, handle) in &self.roster {
            let _ = writeln!(prompt, "| {id} | {handle} |");
        }
        prompt.push('\n');
    }

    fn build_tree_section(&self, prompt: &mut String) {
        let listing = tree_listing(&self.workspace_dir);
        if listing.is_empty() {
            return;
        }
        let _ = writeln!(prompt, "## Workspace files\n");
        prompt.push_str(&listing);
        prompt.push('\n');
    }

    fn build_skills_section(&self, prompt: &mut String) {
        if self.skills.is_empty() {
            return;
        }
        let _ = writeln!(prompt, "## Skills\n");
        for skill in &self.skills {
            let _ = writeln!(prompt, "- **{}**: {}", skill.name, skill.description);
        }
        prompt.push('\n');
    }
}

/// Indented listing of the workspace: depth-limited, entry-capped, sizes in
/// human units, excluded names and dot-files skipped.
pub fn tree_listing(root: &Path) -> String {
    let mut out = String::new();
    let mut entries = 0;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(TREE_MAX_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !TREE_EXCLUDED.contains(&name.as_ref())
        });

    for dir_entry in walker.flatten() {
        if entries >= TREE_MAX_ENTRIES {
            out.push_str("… (listing capped)\n");
            break;
        }
        entries += 1;

        let depth = dir_entry.depth();
        let indent = "  ".repeat(depth.saturating_sub(1));
        let name = dir_entry.file_name().to_string_lossy();
        if dir_entry.file_type().is_dir() {
            let _ = writeln!(out, "{indent}{name}/");
        } else {
            let size = dir_entry.metadata().map(|m| m.len()).unwrap_or(0);
            let _ = writeln!(out, "{indent}{name} ({})", human_size(size));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn builder(tmp: &TempDir) -> SystemPromptBuilder {
        SystemPromptBuilder::new(tmp.path(), tmp.path(), "chan-1")
    }

    #[test]
    fn includes_identity_and_environment() {
        let tmp = TempDir::new().unwrap();
        let prompt = builder(&tmp).model("test-model").build();
        assert!(prompt.contains("You are Mother"));
        assert!(prompt.contains("- Channel: chan-1"));
        assert!(prompt.contains("- Model: test-model"));
    }

    #[test]
    fn injects_workspace_files_with_caps() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("MOTHER.md"), "core directives").unwrap();
        std::fs::write(tmp.path().join("MEMORY.md"), "g".repeat(2000)).unwrap();
        std::fs::create_dir_all(tmp.path().join("chan-1")).unwrap();
        std::fs::write(tmp.path().join("chan-1/MEMORY.md"), "channel memory").unwrap();

        let prompt = builder(&tmp).build();
        assert!(prompt.contains("core directives"));
        assert!(prompt.contains("channel memory"));
        // Global memory exceeds its 1500-char cap and gets tagged.
        assert!(prompt.contains("[truncated]"));
    }

    #[test]
    fn missing_files_are_simply_absent() {
        let tmp = TempDir::new().unwrap();
        let prompt = builder(&tmp).build();
        assert!(!prompt.contains("MOTHER.md"));
        assert!(!prompt.contains("[truncated]"));
    }

    #[test]
    fn roster_renders_as_table() {
        let tmp = TempDir::new().unwrap();
        let prompt = builder(&tmp)
            .roster(vec![("U123".into(), "alice".into())])
            .build();
        assert!(prompt.contains("| U123 | alice |"));
    }

    #[test]
    fn skills_catalog_listed() {
        let tmp = TempDir::new().unwrap();
        let prompt = builder(&tmp)
            .skills(vec![Skill {
                name: "deploy".into(),
                description: "ship it".into(),
                dir: tmp.path().join("skills/deploy"),
            }])
            .build();
        assert!(prompt.contains("- **deploy**: ship it"));
    }

    #[test]
    fn tree_excludes_noise() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("chan/attachments")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/junk")).unwrap();
        std::fs::write(tmp.path().join("chan/log.jsonl"), "x").unwrap();
        std::fs::write(tmp.path().join("chan/notes.md"), "hello").unwrap();
        std::fs::write(tmp.path().join(".hidden"), "x").unwrap();

        let listing = tree_listing(tmp.path());
        assert!(listing.contains("notes.md (5B)"));
        assert!(!listing.contains("attachments"));
        assert!(!listing.contains("node_modules"));
        assert!(!listing.contains("log.jsonl"));
        assert!(!listing.contains(".hidden"));
    }

    #[test]
    fn tree_caps_entries() {
        let tmp = TempDir::new().unwrap();
        for i in 0..200 {
            std::fs::write(tmp.path().join(format!("f{i:03}.txt")), "x").unwrap();
        }
        let listing = tree_listing(tmp.path());
        assert!(listing.contains("(listing capped)"));
        assert!(listing.lines().count() <= TREE_MAX_ENTRIES + 1);
    }

    #[test]
    fn tree_respects_depth_limit() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b/c/d/e")).unwrap();
        std::fs::write(tmp.path().join("a/b/c/d/e/deep.txt"), "x").unwrap();
        let listing = tree_listing(tmp.path());
        assert!(listing.contains("d/"));
        assert!(!listing.contains("deep.txt"));
    }
}
