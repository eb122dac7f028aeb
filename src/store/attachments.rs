//! Attachment download queue: at most one HTTP fetch in flight, failures
//! logged but never fatal to the run that queued them.

use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct PendingDownload {
    pub channel_id: String,
    /// Destination relative to the workspace root.
    pub local: String,
    pub url: String,
}

pub struct DownloadQueue {
    tx: mpsc::UnboundedSender<PendingDownload>,
}

impl DownloadQueue {
    /// Spawn the single worker task draining the queue.
    pub fn spawn(workspace_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingDownload>();
        let client = reqwest::Client::new();

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if let Err(e) = download_one(&client, &workspace_dir, &item).await {
                    tracing::warn!(
                        channel = %item.channel_id,
                        url = %item.url,
                        "attachment download failed: {e}"
                    );
                }
            }
        });

        Self { tx }
    }

    pub fn enqueue(&self, items: Vec<PendingDownload>) {
        for item in items {
            if self.tx.send(item).is_err() {
                tracing::warn!("attachment download queue is closed");
                return;
            }
        }
    }
}

async fn download_one(
    client: &reqwest::Client,
    workspace_dir: &std::path::Path,
    item: &PendingDownload,
) -> anyhow::Result<()> {
    let response = client.get(&item.url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;

    let dest = workspace_dir.join(&item.local);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&dest, &bytes).await?;
    tracing::debug!(channel = %item.channel_id, local = %item.local, bytes = bytes.len(), "attachment saved");
    Ok(())
}

/// Build the workspace-relative attachment path for an inbound file.
pub fn attachment_local_path(channel_id: &str, ts: &str, original_name: &str) -> String {
    format!(
        "{channel_id}/attachments/{ts}_{}",
        crate::util::sanitize_filename(original_name)
    )
}
