//! Sandbox backends for tool execution.
//!
//! A sandbox abstracts *where* shell commands and file I/O happen: directly
//! on the host, or inside a named, already-running container with the
//! workspace mounted at `/workspace`. Tools only ever see sandbox-namespace
//! paths; the container variant translates between the two namespaces.

pub mod container;
pub mod host;

pub use container::ContainerSandbox;
pub use host::HostSandbox;

use crate::util::truncate_tail;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tail-truncation limits for shell output.
pub const MAX_OUTPUT_LINES: usize = 2000;
pub const MAX_OUTPUT_BYTES: usize = 50 * 1024;

/// Captured output of a sandboxed shell invocation. `stdout`/`stderr` are
/// already tail-truncated with a marker line when `truncated` is set.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &str;

    /// The workspace root as seen by tools inside this sandbox.
    fn workspace_path(&self) -> PathBuf;

    /// Translate a host path into the sandbox namespace.
    fn to_sandbox(&self, host_path: &Path) -> PathBuf;

    /// Translate a sandbox-namespace path back to the host.
    fn to_host(&self, sandbox_path: &Path) -> PathBuf;

    async fn run_shell(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write bytes, creating parent directories as needed.
    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    async fn exists(&self, path: &Path) -> bool;
}

/// Apply tail-first truncation to both streams of a raw capture.
pub(crate) fn shape_output(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32) -> ShellOutput {
    let out = truncate_tail(
        &String::from_utf8_lossy(&stdout),
        MAX_OUTPUT_LINES,
        MAX_OUTPUT_BYTES,
    );
    let err = truncate_tail(
        &String::from_utf8_lossy(&stderr),
        MAX_OUTPUT_LINES,
        MAX_OUTPUT_BYTES,
    );
    let truncated = out.truncated || err.truncated;
    ShellOutput {
        stdout: out.with_marker(),
        stderr: err.with_marker(),
        exit_code,
        truncated,
    }
}

/// Translate `host_path` under `host_root` into the same relative location
/// under `mounted_root`. Paths outside `host_root` are returned unchanged.
pub(crate) fn remap(host_path: &Path, host_root: &Path, mounted_root: &Path) -> PathBuf {
    match host_path.strip_prefix(host_root) {
        Ok(rest) => mounted_root.join(rest),
        Err(_) => host_path.to_path_buf(),
    }
}
