//! The per-run side-effect chain: an ordered, single-consumer queue of
//! fallible async UI actions. Backend events may arrive concurrently, but
//! every post/edit/delete flows through this one worker, so ordering is
//! preserved. Effect errors become thread posts, never run aborts.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type ErrorHook = Box<dyn Fn(String) -> BoxFuture + Send + Sync>;

enum Effect {
    Run(BoxFuture),
    Flush(oneshot::Sender<()>),
}

pub struct EffectChain {
    tx: mpsc::UnboundedSender<Effect>,
}

impl EffectChain {
    /// `on_error` is invoked (in order, on the same worker) for every effect
    /// that fails; it usually posts `*Error: …*` to the run's thread.
    pub fn new(on_error: ErrorHook) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Effect>();
        tokio::spawn(async move {
            while let Some(effect) = rx.recv().await {
                match effect {
                    Effect::Run(fut) => {
                        if let Err(e) = fut.await {
                            tracing::warn!("side effect failed: {e:#}");
                            if let Err(hook_err) = on_error(e.to_string()).await {
                                tracing::warn!("error hook itself failed: {hook_err:#}");
                            }
                        }
                    }
                    Effect::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn push<F>(&self, effect: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.tx.send(Effect::Run(Box::pin(effect))).is_err() {
            tracing::warn!("effect chain worker is gone, dropping side effect");
        }
    }

    /// Wait until every effect pushed so far has completed.
    pub async fn drain(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Effect::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn no_error_hook() -> ErrorHook {
        Box::new(|_| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn effects_run_in_push_order() {
        let chain = EffectChain::new(no_error_hook());
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..5 {
            let order = order.clone();
            chain.push(async move {
                // Later effects finish faster, but order must still hold.
                tokio::time::sleep(std::time::Duration::from_millis(5 * (5 - n))).await;
                order.lock().unwrap().push(n);
                Ok(())
            });
        }
        chain.drain().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failed_effect_invokes_error_hook_and_continues() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let hook_errors = errors.clone();
        let chain = EffectChain::new(Box::new(move |msg| {
            let errors = hook_errors.clone();
            Box::pin(async move {
                errors.lock().unwrap().push(msg);
                Ok(())
            })
        }));

        let ran_after = Arc::new(Mutex::new(false));
        chain.push(async { anyhow::bail!("send failed: 500") });
        let flag = ran_after.clone();
        chain.push(async move {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        chain.drain().await;

        assert_eq!(errors.lock().unwrap().as_slice(), ["send failed: 500"]);
        assert!(*ran_after.lock().unwrap());
    }

    #[tokio::test]
    async fn drain_waits_for_pending_effects() {
        let chain = EffectChain::new(no_error_hook());
        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        chain.push(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            *flag.lock().unwrap() = true;
            Ok(())
        });
        chain.drain().await;
        assert!(*done.lock().unwrap());
    }
}
