//! # Encryptconfig
//!
//! Compilation of the encryption-at-rest configuration document.
//!
//! This crate provides:
//! - The declarative configuration schema (current and legacy headers)
//! - Structural validation, including selector-masking rejection
//! - The SHA-256 content hash reloads use for change detection
//! - The factory turning provider specs into per-resource transformers
//! - TTL-cached liveness probes for KMS providers and the aggregate health
//!   check published alongside the transformers

pub mod factory;
pub mod health;
pub mod load;
pub mod probe;
pub mod schema;
pub mod validation;

pub use factory::{
    EncryptionConfiguration, MIN_KMS_CLOSE_GRACE_PERIOD, TransformerMap, build_configuration,
    load_encryption_configuration,
};
pub use health::{AGGREGATE_HEALTH_CHECK_NAME, HealthCheckError, HealthChecker, UnionHealthCheck};
pub use load::{ConfigError, content_hash, load_document};
pub use probe::{KmsV1Probe, KmsV2Probe, PROBE_HEALTHY_TTL, PROBE_UNHEALTHY_TTL};
pub use schema::{EncryptionDocument, GroupResource};
pub use validation::{ValidationError, validate};
