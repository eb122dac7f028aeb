//! Serial per-channel work queue: strict FIFO, one job at a time, bounded
//! depth. Work errors are logged and never stop the queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maximum queued-or-running jobs before new work is dropped.
pub const MAX_PENDING: usize = 5;

type Job = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub struct ChannelQueue {
    channel_id: String,
    tx: mpsc::UnboundedSender<(String, Job)>,
    pending: Arc<AtomicUsize>,
}

impl ChannelQueue {
    pub fn new(channel_id: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Job)>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_channel = channel_id.to_string();
        tokio::spawn(async move {
            while let Some((label, job)) = rx.recv().await {
                if let Err(e) = job.await {
                    tracing::warn!(channel = %worker_channel, job = %label, "job failed: {e:#}");
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self {
            channel_id: channel_id.to_string(),
            tx,
            pending,
        }
    }

    /// Queued-or-running job count.
    pub fn size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Append a job. Returns `false` (dropping the job with a warning) when
    /// the queue is already at [`MAX_PENDING`].
    pub fn enqueue<F>(&self, label: &str, job: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.size() >= MAX_PENDING {
            tracing::warn!(
                channel = %self.channel_id,
                job = %label,
                pending = self.size(),
                "channel queue full, dropping work item"
            );
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send((label.to_string(), Box::pin(job))).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(channel = %self.channel_id, "channel queue worker is gone");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn processes_jobs_in_fifo_order() {
        let queue = ChannelQueue::new("c");
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for n in 0..3 {
            let order = order.clone();
            queue.enqueue("step", async move {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }
        let order_done = order.clone();
        queue.enqueue("finish", async move {
            order_done.lock().unwrap().push(99);
            let _ = done_tx.send(());
            Ok(())
        });

        done_rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 99]);
    }

    #[tokio::test]
    async fn one_job_at_a_time() {
        let queue = ChannelQueue::new("c");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();

        for _ in 0..4 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            queue.enqueue("probe", async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        queue.enqueue("finish", async move {
            let _ = done_tx.send(());
            Ok(())
        });

        done_rx.await.unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drops_work_beyond_cap() {
        let queue = ChannelQueue::new("c");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Block the worker so everything else stays queued.
        queue.enqueue("blocker", async move {
            let _ = release_rx.await;
            Ok(())
        });
        for _ in 0..(MAX_PENDING - 1) {
            assert!(queue.enqueue("fill", async { Ok(()) }));
        }
        assert_eq!(queue.size(), MAX_PENDING);
        assert!(!queue.enqueue("overflow", async { Ok(()) }));

        let _ = release_tx.send(());
    }

    #[tokio::test]
    async fn job_error_does_not_stop_the_queue() {
        let queue = ChannelQueue::new("c");
        let (done_tx, done_rx) = oneshot::channel();

        queue.enqueue("boom", async { anyhow::bail!("deliberate failure") });
        queue.enqueue("after", async move {
            let _ = done_tx.send(());
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(2), done_rx)
            .await
            .expect("queue should keep running after a failed job")
            .unwrap();
    }

    #[tokio::test]
    async fn size_drains_back_to_zero() {
        let queue = ChannelQueue::new("c");
        let (done_tx, done_rx) = oneshot::channel();
        queue.enqueue("only", async move {
            let _ = done_tx.send(());
            Ok(())
        });
        done_rx.await.unwrap();
        // Give the worker a beat to decrement.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.size(), 0);
    }
}
