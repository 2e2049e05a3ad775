//! Hot-reload controller for the encryption configuration file.
//!
//! A single worker drains a sentinel queue of capacity one, so duplicate
//! wake-ups coalesce and no two reloads are ever in flight. The ticker
//! enqueues on every poll period; failures re-enqueue after a capped
//! exponential backoff. A new configuration is only published after its
//! aggregate health check passes, so a working generation is never replaced
//! by a broken one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use encryptconfig::factory::build_configuration;
use encryptconfig::health::HealthChecker;
use encryptconfig::load::{ConfigError, load_document};
use envelope::service::EnvelopeServiceFactory;

use crate::holder::{DynamicTransformers, MIN_CLOSE_GRACE_PERIOD, TransformerGeneration};
use crate::metrics::{record_reload_failure, record_reload_success};

/// Default interval between file polls.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(60);

const HEALTH_GATE_POLL: Duration = Duration::from_millis(100);
const BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("expected exactly one aggregate health check, found {count}")]
    HealthCheckCount { count: usize },

    #[error("new transformers failed the pre-commit health check: {reason}")]
    HealthGate { reason: String },

    #[error("reload cancelled by shutdown")]
    Cancelled,
}

/// Watches one configuration file and keeps a [`DynamicTransformers`] holder
/// synchronized with it.
pub struct ReloadController {
    name: String,
    file_path: PathBuf,
    holder: Arc<DynamicTransformers>,
    last_applied_hash: String,
    server_id: String,
    service_factory: Arc<dyn EnvelopeServiceFactory>,
    poll_period: Duration,
}

impl ReloadController {
    pub fn new(
        name: impl Into<String>,
        file_path: impl Into<PathBuf>,
        holder: Arc<DynamicTransformers>,
        initial_hash: impl Into<String>,
        server_id: impl Into<String>,
        service_factory: Arc<dyn EnvelopeServiceFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            holder,
            last_applied_hash: initial_hash.into(),
            server_id: server_id.into(),
            service_factory,
            poll_period: DEFAULT_POLL_PERIOD,
        }
    }

    /// Overrides the poll period; tests drive reloads at millisecond scale.
    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    /// Runs until `shutdown` fires. Enqueues one work item immediately so a
    /// file that changed between process start and the first tick is not
    /// missed for a whole poll period.
    #[tracing::instrument(skip_all, fields(controller = %self.name))]
    pub async fn run(mut self, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let _ = tx.try_send(());

        let ticker = {
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            let poll_period = self.poll_period;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(poll_period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The immediate first tick duplicates the construction-time
                // sentinel; skip it.
                interval.tick().await;
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            let _ = tx.try_send(());
                        }
                    }
                }
            })
        };

        let mut backoff = ExponentialBackoff {
            max_interval: BACKOFF_MAX_INTERVAL,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        info!(file = %self.file_path.display(), "encryption configuration controller running");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                item = rx.recv() => {
                    if item.is_none() {
                        break;
                    }
                    match self.process_work_item(&shutdown).await {
                        Ok(applied) => {
                            backoff.reset();
                            if applied {
                                info!("encryption configuration automatically reloaded");
                            }
                        }
                        Err(ReloadError::Cancelled) => break,
                        Err(err) => {
                            record_reload_failure(&self.server_id);
                            error!(error = %err, "failed to reload encryption configuration");

                            let delay = backoff.next_backoff().unwrap_or(BACKOFF_MAX_INTERVAL);
                            let tx = tx.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    () = tokio::time::sleep(delay) => {
                                        let _ = tx.try_send(());
                                    }
                                    () = shutdown.cancelled() => {}
                                }
                            });
                        }
                    }
                }
            }
        }

        ticker.abort();
        info!("encryption configuration controller stopped");
    }

    /// One pass: parse, short-circuit on an unchanged hash, build, gate,
    /// publish. Returns whether a new generation was published. On failure
    /// the child lifecycle token is cancelled so any KMS connections dialed
    /// for the doomed configuration are released.
    async fn process_work_item(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<bool, ReloadError> {
        let lifecycle = shutdown.child_token();
        let result = self.attempt_reload(&lifecycle).await;
        if result.is_err() {
            lifecycle.cancel();
        }
        result
    }

    async fn attempt_reload(&mut self, lifecycle: &CancellationToken) -> Result<bool, ReloadError> {
        let (doc, hash) = load_document(&self.file_path)?;
        if hash == self.last_applied_hash {
            debug!("encryption configuration unchanged");
            return Ok(false);
        }

        let config = build_configuration(
            &doc,
            hash.clone(),
            self.service_factory.as_ref(),
            lifecycle,
        )
        .await?;

        if config.health_checks.len() != 1 {
            // A compiled configuration always carries exactly one aggregate
            // check; anything else is a programming error reported to the
            // error sink while the controller keeps running.
            return Err(ReloadError::HealthCheckCount {
                count: config.health_checks.len(),
            });
        }
        let health_check = config.health_checks[0].clone();

        let gate_deadline = config.kms_close_grace_period.max(MIN_CLOSE_GRACE_PERIOD);
        self.health_gate(&health_check, gate_deadline, lifecycle)
            .await?;

        let close_token = lifecycle.clone();
        self.holder.set(TransformerGeneration::new(
            config.transformers,
            health_check,
            Box::new(move || close_token.cancel()),
            config.kms_close_grace_period,
        ));

        record_reload_success(&self.server_id);
        self.last_applied_hash = hash;
        Ok(true)
    }

    /// Polls the aggregate check until it passes or the deadline elapses.
    /// This is the point of no return: before it, a failure leaves consumers
    /// on the previous generation untouched.
    async fn health_gate(
        &self,
        health_check: &Arc<dyn HealthChecker>,
        deadline: Duration,
        lifecycle: &CancellationToken,
    ) -> Result<(), ReloadError> {
        let started = Instant::now();
        loop {
            let err = match health_check.check().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if started.elapsed() >= deadline {
                return Err(ReloadError::HealthGate {
                    reason: err.to_string(),
                });
            }
            tokio::select! {
                () = tokio::time::sleep(HEALTH_GATE_POLL) => {}
                () = lifecycle.cancelled() => return Err(ReloadError::Cancelled),
            }
        }
    }
}
