//! Skill discovery: directories under `skills/` containing a `SKILL.md`
//! with YAML frontmatter `{name, description}`. Channel-local skills
//! shadow global ones of the same name.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub dir: PathBuf,
}

/// Discover skills under `<root>/skills/*/SKILL.md`.
fn scan(root: &Path) -> Vec<Skill> {
    let skills_dir = root.join("skills");
    let Ok(entries) = std::fs::read_dir(&skills_dir) else {
        return Vec::new();
    };

    let mut skills = Vec::new();
    for dir_entry in entries.flatten() {
        let dir = dir_entry.path();
        if !dir.is_dir() {
            continue;
        }
        let manifest = dir.join("SKILL.md");
        let Ok(raw) = std::fs::read_to_string(&manifest) else {
            continue;
        };
        match parse_frontmatter(&raw) {
            Some((name, description)) => skills.push(Skill {
                name,
                description,
                dir,
            }),
            None => {
                tracing::warn!(path = %manifest.display(), "SKILL.md missing name/description frontmatter");
            }
        }
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Global skills plus channel-local overrides.
pub fn discover(workspace_dir: &Path, channel_dir: Option<&Path>) -> Vec<Skill> {
    let mut skills = scan(workspace_dir);
    if let Some(channel_dir) = channel_dir {
        for local in scan(channel_dir) {
            skills.retain(|s| s.name != local.name);
            skills.push(local);
        }
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Pull `name:` and `description:` out of a `---`-fenced YAML frontmatter
/// block. Only flat scalar fields are supported.
fn parse_frontmatter(raw: &str) -> Option<(String, String)> {
    let rest = raw.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let block = &rest[..end];

    let mut name = None;
    let mut description = None;
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("name:") {
            name = Some(value.trim().trim_matches('"').to_string());
        } else if let Some(value) = line.strip_prefix("description:") {
            description = Some(value.trim().trim_matches('"').to_string());
        }
    }
    match (name, description) {
        (Some(n), Some(d)) if !n.is_empty() => Some((n, d)),
        _ => None,
    }
}
