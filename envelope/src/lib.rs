//! # Envelope
//!
//! Value transformers for the encryption-at-rest pipeline.
//!
//! This crate provides:
//! - The [`ValueTransformer`] trait consumed by the storage layer
//! - Prefix-dispatching compound transformers for provider chains
//! - Symmetric transformers (AES-GCM, AES-CBC, Secretbox) and the identity
//!   pass-through
//! - Envelope KMS transformers (v1 and v2) and the service traits remote
//!   KMS plugins are dialed through
//!
//! Every transformer tags its output with a short human-readable prefix so
//! that reads can be routed back to the provider that produced the bytes.

pub mod aescbc;
pub mod aesgcm;
pub mod kms_v1;
pub mod kms_v2;
pub mod prefix;
pub mod secretbox;
pub mod service;
pub mod transformer;

pub use aescbc::AesCbcTransformer;
pub use aesgcm::AesGcmTransformer;
pub use kms_v1::KmsV1Transformer;
pub use kms_v2::{
    KeyIdError, KeyIdTracker, KmsV2Transformer, MAX_KEY_ID_LEN, validate_key_id,
};
pub use prefix::{PrefixEntry, PrefixTransformer};
pub use secretbox::SecretboxTransformer;
pub use service::{
    DecryptRequest, EncryptResponse, EnvelopeServiceFactory, KmsError, KmsService, KmsServiceV2,
    LocalEnvelopeService, LocalEnvelopeServiceFactory, StatusResponse, TimedKmsService,
    TimedKmsServiceV2,
};
pub use transformer::{IdentityTransformer, TransformError, ValueTransformer};
