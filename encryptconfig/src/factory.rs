//! Compiles a validated document into live transformers, probes and the
//! aggregate health check.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio_util::sync::CancellationToken;
use tracing::info;

use envelope::kms_v2::KeyIdTracker;
use envelope::prefix::{PrefixEntry, PrefixTransformer};
use envelope::service::{
    EnvelopeServiceFactory, TimedKmsService, TimedKmsServiceV2,
};
use envelope::{
    AesCbcTransformer, AesGcmTransformer, IdentityTransformer, KmsV1Transformer, KmsV2Transformer,
    SecretboxTransformer, TransformError, ValueTransformer,
};

use crate::health::{AGGREGATE_HEALTH_CHECK_NAME, HealthChecker, UnionHealthCheck};
use crate::load::{ConfigError, load_document};
use crate::probe::{KmsV1Probe, KmsV2Probe};
use crate::schema::{EncryptionDocument, GroupResource, KmsSpec, SymmetricSpec};
use crate::validation::ValidationError;

const AESGCM_PREFIX: &str = "k8s:enc:aesgcm:v1:";
const AESCBC_PREFIX: &str = "k8s:enc:aescbc:v1:";
const SECRETBOX_PREFIX: &str = "k8s:enc:secretbox:v1:";
const KMS_V1_PREFIX: &str = "k8s:enc:kms:v1:";
const KMS_V2_PREFIX: &str = "k8s:enc:kms:v2:";

/// Floor for the close grace period; also the floor of the reload health
/// gate deadline.
pub const MIN_KMS_CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Per-resource lookup table over the compiled transformers. Wildcard
/// selectors install defaults consulted when no more specific entry exists.
#[derive(Default)]
pub struct TransformerMap {
    inner: HashMap<GroupResource, Arc<dyn ValueTransformer>>,
}

impl TransformerMap {
    /// Resolution order: exact match, then the resource's group wildcard,
    /// then the universal wildcard.
    pub fn get(&self, resource: &GroupResource) -> Option<Arc<dyn ValueTransformer>> {
        if let Some(t) = self.inner.get(resource) {
            return Some(t.clone());
        }
        if let Some(t) = self
            .inner
            .get(&GroupResource::new(resource.group.clone(), "*"))
        {
            return Some(t.clone());
        }
        self.inner.get(&GroupResource::new("*", "*")).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn insert(&mut self, key: GroupResource, transformer: Arc<dyn ValueTransformer>) {
        // First rule wins; validation already rejected true masking.
        self.inner.entry(key).or_insert(transformer);
    }
}

/// A fully compiled configuration, ready to be published.
pub struct EncryptionConfiguration {
    pub transformers: TransformerMap,
    pub health_checks: Vec<Arc<dyn HealthChecker>>,
    pub content_hash: String,
    pub kms_close_grace_period: Duration,
}

/// Reads the document at `path` and compiles it; the one-call entry point
/// used both at server startup and by the reload controller.
pub async fn load_encryption_configuration(
    path: &Path,
    service_factory: &dyn EnvelopeServiceFactory,
    lifecycle: &CancellationToken,
) -> Result<EncryptionConfiguration, ConfigError> {
    let (doc, hash) = load_document(path)?;
    build_configuration(&doc, hash, service_factory, lifecycle).await
}

/// Builds transformers, probes and the aggregate health check from a
/// validated document. KMS services are dialed through `service_factory`
/// under `lifecycle`, so a configuration that never commits can be torn down
/// by cancelling the token.
pub async fn build_configuration(
    doc: &EncryptionDocument,
    content_hash: String,
    service_factory: &dyn EnvelopeServiceFactory,
    lifecycle: &CancellationToken,
) -> Result<EncryptionConfiguration, ConfigError> {
    let mut transformers = TransformerMap::default();
    let mut probes: Vec<Arc<dyn HealthChecker>> = Vec::new();
    let mut grace_period = Duration::ZERO;

    for rule in &doc.resources {
        let mut entries: Vec<PrefixEntry> = Vec::new();

        for provider in &rule.providers {
            if provider.identity.is_some() {
                entries.push(PrefixEntry::new(
                    Vec::<u8>::new(),
                    Arc::new(IdentityTransformer::new()),
                ));
            } else if let Some(spec) = &provider.aesgcm {
                push_symmetric_entries(&mut entries, spec, AESGCM_PREFIX, |key| {
                    AesGcmTransformer::new(key).map(|t| Arc::new(t) as Arc<dyn ValueTransformer>)
                })?;
            } else if let Some(spec) = &provider.aescbc {
                push_symmetric_entries(&mut entries, spec, AESCBC_PREFIX, |key| {
                    AesCbcTransformer::new(key).map(|t| Arc::new(t) as Arc<dyn ValueTransformer>)
                })?;
            } else if let Some(spec) = &provider.secretbox {
                push_symmetric_entries(&mut entries, spec, SECRETBOX_PREFIX, |key| {
                    SecretboxTransformer::new(key).map(|t| Arc::new(t) as Arc<dyn ValueTransformer>)
                })?;
            } else if let Some(kms) = &provider.kms {
                grace_period += build_kms_provider(
                    &mut entries,
                    &mut probes,
                    kms,
                    service_factory,
                    lifecycle,
                )
                .await?;
            }
        }

        let rule_transformer: Arc<dyn ValueTransformer> =
            Arc::new(PrefixTransformer::new(entries));
        for selector in &rule.resources {
            transformers.insert(GroupResource::parse(selector), rule_transformer.clone());
        }
    }

    let aggregate: Arc<dyn HealthChecker> = Arc::new(UnionHealthCheck::new(
        AGGREGATE_HEALTH_CHECK_NAME,
        probes,
    ));

    info!(
        resources = transformers.len(),
        grace_period_secs = grace_period.max(MIN_KMS_CLOSE_GRACE_PERIOD).as_secs(),
        "compiled encryption configuration"
    );

    Ok(EncryptionConfiguration {
        transformers,
        health_checks: vec![aggregate],
        content_hash,
        kms_close_grace_period: grace_period.max(MIN_KMS_CLOSE_GRACE_PERIOD),
    })
}

fn push_symmetric_entries(
    entries: &mut Vec<PrefixEntry>,
    spec: &SymmetricSpec,
    provider_prefix: &str,
    build: impl Fn(&[u8]) -> Result<Arc<dyn ValueTransformer>, TransformError>,
) -> Result<(), ConfigError> {
    for key in &spec.keys {
        // Validation already proved the secret decodes and has a legal
        // length; a failure here is a programming error surfaced as config
        // corruption rather than a panic.
        let material = STANDARD
            .decode(&key.secret)
            .map_err(|_| ValidationError::Invalid {
                path: provider_prefix.to_string(),
                value: "REDACTED".to_string(),
                detail: "secrets must be base64 encoded".to_string(),
            })?;
        let transformer = build(&material).map_err(|err| ValidationError::Invalid {
            path: provider_prefix.to_string(),
            value: "REDACTED".to_string(),
            detail: err.to_string(),
        })?;
        entries.push(PrefixEntry::new(
            format!("{provider_prefix}{}:", key.name).into_bytes(),
            transformer,
        ));
    }
    Ok(())
}

/// Builds the transformer and probe of one KMS provider; returns its
/// contribution to the close grace period: two timeouts for v1 (unwrap plus
/// retry headroom), one for v2.
async fn build_kms_provider(
    entries: &mut Vec<PrefixEntry>,
    probes: &mut Vec<Arc<dyn HealthChecker>>,
    kms: &KmsSpec,
    service_factory: &dyn EnvelopeServiceFactory,
    lifecycle: &CancellationToken,
) -> Result<Duration, ConfigError> {
    let timeout = kms.timeout();
    let api_version = kms.api_version.as_deref().unwrap_or("v1");

    match api_version {
        "v2" => {
            let service = service_factory
                .create_v2(&kms.endpoint, lifecycle)
                .await
                .map_err(|source| ConfigError::KmsProvider {
                    name: kms.name.clone(),
                    source,
                })?;
            let service = Arc::new(TimedKmsServiceV2::new(service, timeout));
            let tracker = Arc::new(KeyIdTracker::new());

            entries.push(PrefixEntry::new(
                format!("{KMS_V2_PREFIX}{}:", kms.name).into_bytes(),
                Arc::new(KmsV2Transformer::new(
                    service.clone(),
                    tracker.clone(),
                    kms.name.clone(),
                )),
            ));
            probes.push(Arc::new(KmsV2Probe::new(
                kms.name.clone(),
                service,
                tracker,
            )));
            Ok(timeout)
        }
        _ => {
            let service = service_factory
                .create_v1(&kms.endpoint, lifecycle)
                .await
                .map_err(|source| ConfigError::KmsProvider {
                    name: kms.name.clone(),
                    source,
                })?;
            let service = Arc::new(TimedKmsService::new(service, timeout));

            entries.push(PrefixEntry::new(
                format!("{KMS_V1_PREFIX}{}:", kms.name).into_bytes(),
                Arc::new(KmsV1Transformer::new(service.clone(), kms.cache_size())),
            ));
            probes.push(Arc::new(KmsV1Probe::new(kms.name.clone(), service)));
            Ok(timeout * 2)
        }
    }
}
