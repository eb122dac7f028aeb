//! Path-prefix policy: every tool path must resolve inside an allowed prefix.

use super::GuardVerdict;
use std::path::{Component, Path, PathBuf};

/// Checks candidate paths against a fixed set of allowed prefixes.
///
/// Resolution is purely lexical: the input is joined onto the caller's
/// working directory, then `.` and `..` components are collapsed without
/// touching the filesystem. A path is allowed iff the resolved form equals
/// an allowed prefix or sits strictly below one. Prefix comparison is
/// component-wise, so `/ws-evil` is never mistaken for a child of `/ws`.
pub struct PathGuard {
    prefixes: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new(workspace_dir: &Path, extra_prefixes: &[PathBuf]) -> Self {
        let mut prefixes = vec![normalize(workspace_dir), PathBuf::from("/tmp")];
        for extra in extra_prefixes {
            let normalized = normalize(extra);
            if !prefixes.contains(&normalized) {
                prefixes.push(normalized);
            }
        }
        Self { prefixes }
    }

    pub fn check(&self, input: &str, cwd: &Path) -> GuardVerdict {
        if input.contains('\0') {
            return GuardVerdict::deny(format!("Path denied: '{input}' contains a NUL byte"));
        }

        let candidate = Path::new(input);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            cwd.join(candidate)
        };
        let resolved = normalize(&joined);

        for prefix in &self.prefixes {
            if resolved == *prefix || resolved.starts_with(prefix) {
                return GuardVerdict::allow();
            }
        }

        GuardVerdict::deny(format!(
            "Path denied: '{input}' resolves to '{}' which is outside allowed directories",
            resolved.display()
        ))
    }

    pub fn prefixes(&self) -> &[PathBuf] {
        &self.prefixes
    }
}

/// Collapse `.` and `..` components lexically. `..` at the root is dropped.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
