//! Atomic publication of transformer generations.
//!
//! Storage readers fetch the current generation on every operation, so the
//! read path must never lock; publication swaps an `Arc` pointer. A replaced
//! generation stays usable by readers that already hold it and has its
//! resources released only after the grace period, or promptly when the
//! whole process shuts down.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use encryptconfig::health::HealthChecker;
use encryptconfig::factory::TransformerMap;

/// Floor applied to every close grace period.
pub const MIN_CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(10);

type CloseFn = Box<dyn FnOnce() + Send>;

/// One published snapshot: the transformer map, the aggregate health check
/// gating it, and the release hook for its background resources.
pub struct TransformerGeneration {
    transformers: TransformerMap,
    health_check: Arc<dyn HealthChecker>,
    grace_period: Duration,
    close: Mutex<Option<CloseFn>>,
}

impl TransformerGeneration {
    pub fn new(
        transformers: TransformerMap,
        health_check: Arc<dyn HealthChecker>,
        close: CloseFn,
        grace_period: Duration,
    ) -> Self {
        Self {
            transformers,
            health_check,
            grace_period,
            close: Mutex::new(Some(close)),
        }
    }

    pub fn transformers(&self) -> &TransformerMap {
        &self.transformers
    }

    pub fn health_check(&self) -> &Arc<dyn HealthChecker> {
        &self.health_check
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Runs the release hook; at most once per generation no matter how many
    /// paths race to it.
    fn close_once(&self) {
        if let Some(close) = self.close.lock().take() {
            close();
        }
    }
}

/// Holder of the current generation. `current()` is wait-free; `set()` is
/// called only by the reload worker.
pub struct DynamicTransformers {
    current: ArcSwap<TransformerGeneration>,
    shutdown: CancellationToken,
}

impl DynamicTransformers {
    /// Publishes the initial generation. The shutdown token is the server
    /// lifecycle: when it fires, whichever generation is current at that
    /// moment is closed, and pending grace timers release early.
    pub fn new(initial: TransformerGeneration, shutdown: CancellationToken) -> Arc<Self> {
        let holder = Arc::new(Self {
            current: ArcSwap::from_pointee(initial),
            shutdown: shutdown.clone(),
        });

        let on_shutdown = holder.clone();
        tokio::spawn(async move {
            on_shutdown.shutdown.cancelled().await;
            on_shutdown.current.load().close_once();
        });

        holder
    }

    pub fn current(&self) -> Arc<TransformerGeneration> {
        self.current.load_full()
    }

    /// Swaps in `next` and schedules release of the replaced generation
    /// after its grace period. Readers that fetched the previous generation
    /// before the swap keep using it untouched until then.
    pub fn set(&self, next: TransformerGeneration) {
        let prev = self.current.swap(Arc::new(next));
        let grace = prev.grace_period().max(MIN_CLOSE_GRACE_PERIOD);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(grace) => {
                    debug!(grace_secs = grace.as_secs(), "releasing replaced transformer generation");
                }
                () = shutdown.cancelled() => {
                    debug!("releasing replaced transformer generation on shutdown");
                }
            }
            prev.close_once();
        });
    }
}
