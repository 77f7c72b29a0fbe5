//! Timer loop driving a reconciler until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::ReconcileErrors;

/// A stateless reconciliation pass that can be repeated at any time.
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &str;

    /// Run one pass. Failures are already logged by the reconciler.
    fn reconcile(&self) -> Result<(), ReconcileErrors>;
}

/// Run `reconciler` immediately and then every `interval` until `shutdown`
/// changes. A slow pass delays the next one instead of bursting.
pub async fn run_periodic(
    reconciler: Arc<dyn Reconciler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        reconciler = reconciler.name(),
        interval_secs = interval.as_secs(),
        "reconciler started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let failed = reconciler.reconcile().err().map_or(0, |e| e.errors.len());
                debug!(reconciler = reconciler.name(), failed, "reconciliation pass done");
            }
            _ = shutdown.changed() => {
                info!(reconciler = reconciler.name(), "reconciler shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::RolloutError;

    #[derive(Default)]
    struct Counting {
        passes: AtomicUsize,
        fail: bool,
    }

    impl Reconciler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn reconcile(&self) -> Result<(), ReconcileErrors> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return ReconcileErrors::check(vec![RolloutError::BatchOutOfBounds(-2)]);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_every_tick_until_shutdown() {
        let counting = Arc::new(Counting::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodic(counting.clone(), Duration::from_secs(120), rx));

        tokio::time::sleep(Duration::from_secs(250)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Ticks at 0s, 120s and 240s.
        assert_eq!(counting.passes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_passes_keep_the_loop_alive() {
        let counting = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodic(counting.clone(), Duration::from_secs(10), rx));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(counting.passes.load(Ordering::SeqCst), 3);
    }
}
