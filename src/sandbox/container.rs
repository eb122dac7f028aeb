//! Container sandbox: every invocation is an `exec` into a named,
//! already-running container with the workspace mounted at `/workspace`.

use super::{remap, shape_output, Sandbox, ShellOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Workspace mount point inside the container.
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Hard ceiling for a single container exec, regardless of requested timeout.
const EXEC_CEILING: Duration = Duration::from_secs(1800);

pub struct ContainerSandbox {
    container: String,
    host_workspace: PathBuf,
}

impl ContainerSandbox {
    pub fn new(container: String, host_workspace: PathBuf) -> Self {
        Self {
            container,
            host_workspace,
        }
    }

    /// Verify the named container exists and is running.
    pub async fn validate(&self) -> Result<()> {
        let output = tokio::process::Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", &self.container])
            .output()
            .await
            .context("failed to run docker inspect")?;

        let state = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || state.trim() != "true" {
            anyhow::bail!(
                "container '{}' is not running: {}",
                self.container,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn exec(
        &self,
        shell_cmd: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<std::process::Output> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.args(["-w", CONTAINER_WORKSPACE, &self.container, "sh", "-c", shell_cmd])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("failed to spawn docker exec")?;

        if let Some(bytes) = stdin {
            let mut handle = child
                .stdin
                .take()
                .context("container exec stdin unavailable")?;
            handle.write_all(bytes).await.context("failed to stream stdin")?;
            drop(handle);
        }

        let capped = timeout.min(EXEC_CEILING);
        tokio::select! {
            result = tokio::time::timeout(capped, child.wait_with_output()) => {
                match result {
                    Ok(output) => output.context("failed to collect container output"),
                    Err(_) => anyhow::bail!("command timed out after {}s", capped.as_secs()),
                }
            }
            () = cancel.cancelled() => anyhow::bail!("command aborted"),
        }
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn name(&self) -> &str {
        "container"
    }

    fn workspace_path(&self) -> PathBuf {
        PathBuf::from(CONTAINER_WORKSPACE)
    }

    fn to_sandbox(&self, host_path: &Path) -> PathBuf {
        remap(host_path, &self.host_workspace, Path::new(CONTAINER_WORKSPACE))
    }

    fn to_host(&self, sandbox_path: &Path) -> PathBuf {
        remap(sandbox_path, Path::new(CONTAINER_WORKSPACE), &self.host_workspace)
    }

    async fn run_shell(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput> {
        let output = self.exec(command, None, timeout, cancel).await?;
        Ok(shape_output(
            output.stdout,
            output.stderr,
            output.status.code().unwrap_or(-1),
        ))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let cmd = format!("cat {}", shell_quote(path));
        let output = self
            .exec(&cmd, None, Duration::from_secs(60), &CancellationToken::new())
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to read {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(CONTAINER_WORKSPACE));
        let cmd = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&parent),
            shell_quote(path)
        );
        let output = self
            .exec(&cmd, Some(bytes), Duration::from_secs(60), &CancellationToken::new())
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to write {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        let cmd = format!("test -e {}", shell_quote(path));
        match self
            .exec(&cmd, None, Duration::from_secs(30), &CancellationToken::new())
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

/// Single-quote a path for `sh -c`, escaping embedded quotes.
fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', "'\\''"))
}
