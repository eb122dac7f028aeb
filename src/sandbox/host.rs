//! Host sandbox: commands run directly on the machine.

use super::{shape_output, Sandbox, ShellOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Environment variables passed through to shell commands. Everything else
/// is cleared so provider credentials never leak into tool output.
const SAFE_ENV_VARS: &[&str] = &["PATH", "HOME", "TERM", "LANG", "LC_ALL", "USER", "SHELL", "TMPDIR"];

pub struct HostSandbox {
    workspace_dir: PathBuf,
}

impl HostSandbox {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir }
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    fn name(&self) -> &str {
        "host"
    }

    fn workspace_path(&self) -> PathBuf {
        self.workspace_dir.clone()
    }

    fn to_sandbox(&self, host_path: &Path) -> PathBuf {
        host_path.to_path_buf()
    }

    fn to_host(&self, sandbox_path: &Path) -> PathBuf {
        sandbox_path.to_path_buf()
    }

    async fn run_shell(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();
        for var in SAFE_ENV_VARS {
            if let Ok(val) = std::env::var(var) {
                cmd.env(var, val);
            }
        }

        let child = cmd.spawn().context("failed to spawn shell")?;

        tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => {
                match result {
                    Ok(output) => {
                        let output = output.context("failed to collect shell output")?;
                        Ok(shape_output(
                            output.stdout,
                            output.stderr,
                            output.status.code().unwrap_or(-1),
                        ))
                    }
                    Err(_) => anyhow::bail!("command timed out after {}s", timeout.as_secs()),
                }
            }
            () = cancel.cancelled() => anyhow::bail!("command aborted"),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}
