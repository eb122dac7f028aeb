pub mod command_guard;
pub mod path_guard;

pub use command_guard::{parse_allowed_commands_env, CommandGuard, CommandListPatch};
pub use path_guard::PathGuard;

use std::path::{Path, PathBuf};

/// Outcome of a guard check. Denials always carry a reason suitable for
/// surfacing to the model as a tool error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GuardVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

/// Combined path + command policy, initialized once at startup and treated
/// as read-only thereafter.
pub struct SecurityPolicy {
    pub workspace_dir: PathBuf,
    path: PathGuard,
    command: CommandGuard,
}

impl SecurityPolicy {
    pub fn new(workspace_dir: &Path, extra_paths: &[PathBuf], patch: &CommandListPatch) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
            path: PathGuard::new(workspace_dir, extra_paths),
            command: CommandGuard::with_overrides(&patch.add, &patch.remove),
        }
    }

    pub fn check_path(&self, input: &str, cwd: &Path) -> GuardVerdict {
        self.path.check(input, cwd)
    }

    pub fn check_command(&self, command: &str) -> GuardVerdict {
        self.command.check(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_combines_both_guards() {
        let policy = SecurityPolicy::new(
            Path::new("/home/mother/workspace"),
            &[],
            &CommandListPatch::default(),
        );

        assert!(
            policy
                .check_path("notes.md", Path::new("/home/mother/workspace"))
                .allowed
        );
        assert!(!policy.check_path("/etc/passwd", Path::new("/home/mother/workspace")).allowed);
        assert!(policy.check_command("ls -la").allowed);
        assert!(!policy.check_command("sudo ls").allowed);
    }
}
