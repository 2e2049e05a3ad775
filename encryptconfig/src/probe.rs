//! TTL-cached liveness probes for configured KMS providers.
//!
//! A probe answers on behalf of the server's health endpoint, which may ask
//! from many threads at once; the async mutex collapses those callers onto a
//! single in-flight RPC, and the cached answer keeps a healthy system at no
//! more than one real call per provider per positive TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use envelope::kms_v2::{KeyIdTracker, validate_key_id};
use envelope::service::{KMS_V2_API_VERSION, KmsService, KmsServiceV2, STATUS_HEALTHY};

use crate::health::{HealthCheckError, HealthChecker};

/// How long a healthy answer is reused.
pub const PROBE_HEALTHY_TTL: Duration = Duration::from_secs(20);
/// How soon a failed answer is retried.
pub const PROBE_UNHEALTHY_TTL: Duration = Duration::from_millis(100);

pub(crate) const INVALID_KEY_ID_METRIC: &str =
    "apiserver_envelope_encryption_invalid_key_id_from_status_total";

fn record_invalid_key_id(provider_name: &str, kind: &'static str) {
    counter!(
        INVALID_KEY_ID_METRIC,
        "error" => kind,
        "provider_name" => provider_name.to_string()
    )
    .increment(1);
}

struct CachedResult {
    err: Option<String>,
    expires_at: Instant,
}

impl CachedResult {
    fn from_outcome(outcome: &Result<(), HealthCheckError>) -> Self {
        match outcome {
            Ok(()) => Self {
                err: None,
                expires_at: Instant::now() + PROBE_HEALTHY_TTL,
            },
            Err(err) => Self {
                err: Some(err.reason.clone()),
                expires_at: Instant::now() + PROBE_UNHEALTHY_TTL,
            },
        }
    }

    fn to_outcome(&self) -> Result<(), HealthCheckError> {
        match &self.err {
            None => Ok(()),
            Some(reason) => Err(HealthCheckError::new(reason.clone())),
        }
    }
}

/// Probe over the envelope v1 health endpoint.
pub struct KmsV1Probe {
    name: String,
    service: Arc<dyn KmsService>,
    last: Mutex<Option<CachedResult>>,
}

impl KmsV1Probe {
    pub fn new(name: impl Into<String>, service: Arc<dyn KmsService>) -> Self {
        Self {
            name: name.into(),
            service,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HealthChecker for KmsV1Probe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<(), HealthCheckError> {
        let mut last = self.last.lock().await;
        if let Some(cached) = &*last {
            if Instant::now() < cached.expires_at {
                return cached.to_outcome();
            }
        }

        debug!(provider = %self.name, "probing kms v1 provider");
        let outcome = self
            .service
            .health()
            .await
            .map_err(|err| HealthCheckError::new(err.to_string()));
        *last = Some(CachedResult::from_outcome(&outcome));
        outcome
    }
}

/// Probe over the envelope v2 `status` RPC. Beyond liveness it requires the
/// provider to speak the expected protocol version and to report a usable
/// key id, which it publishes through the shared tracker.
pub struct KmsV2Probe {
    name: String,
    service: Arc<dyn KmsServiceV2>,
    tracker: Arc<KeyIdTracker>,
    last: Mutex<Option<CachedResult>>,
}

impl KmsV2Probe {
    pub fn new(
        name: impl Into<String>,
        service: Arc<dyn KmsServiceV2>,
        tracker: Arc<KeyIdTracker>,
    ) -> Self {
        Self {
            name: name.into(),
            service,
            tracker,
            last: Mutex::new(None),
        }
    }

    async fn probe_status(&self) -> Result<(), HealthCheckError> {
        let status = self
            .service
            .status()
            .await
            .map_err(|err| HealthCheckError::new(err.to_string()))?;

        match validate_key_id(&status.key_id) {
            Ok(()) => self.tracker.store(&status.key_id),
            Err(err) => {
                record_invalid_key_id(&self.name, err.metric_label());
                return Err(HealthCheckError::new(format!(
                    "got invalid key id from status: {err}"
                )));
            }
        }

        if status.healthz != STATUS_HEALTHY {
            return Err(HealthCheckError::new(format!(
                "got unexpected healthz status: {}",
                status.healthz
            )));
        }
        if status.version != KMS_V2_API_VERSION {
            return Err(HealthCheckError::new(format!(
                "expected KMS provider api version {KMS_V2_API_VERSION}, got {}",
                status.version
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthChecker for KmsV2Probe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<(), HealthCheckError> {
        let mut last = self.last.lock().await;
        if let Some(cached) = &*last {
            if Instant::now() < cached.expires_at {
                return cached.to_outcome();
            }
        }

        debug!(provider = %self.name, "probing kms v2 provider");
        let outcome = self.probe_status().await;
        *last = Some(CachedResult::from_outcome(&outcome));
        outcome
    }
}
