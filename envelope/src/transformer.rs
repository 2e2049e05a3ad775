//! The value-transformer contract between the storage layer and the
//! encryption providers.

use async_trait::async_trait;
use thiserror::Error;

use crate::service::KmsError;

/// Tag embedded at the start of every ciphertext produced by an encrypting
/// provider. The identity transformer refuses to read data carrying it.
pub const ENCRYPTED_DATA_PREFIX: &[u8] = b"k8s:enc:";

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("no matching provider to read the stored data")]
    NoMatchingPrefix,

    #[error("identity transformer tried to read encrypted data")]
    EncryptedDataRefused,

    #[error("invalid stored data format: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Kms(#[from] KmsError),
}

/// Converts plaintext values to their on-storage form and back.
///
/// `data_ctx` is authenticated-but-unencrypted context (the storage key of
/// the value); providers that support additional authenticated data bind the
/// ciphertext to it. On reads, the second tuple element is the *stale*
/// signal: the value decrypted correctly but was written by a non-primary
/// provider (or under a rotated KMS key) and should be rewritten.
#[async_trait]
pub trait ValueTransformer: Send + Sync {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError>;

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError>;
}

/// Pass-through transformer for resources stored unencrypted.
///
/// Reads refuse data bearing the encrypted-data tag so that an identity
/// provider listed ahead of an encrypting one cannot hand ciphertext back to
/// the storage layer; the prefix scanner treats that refusal as "keep
/// scanning".
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl IdentityTransformer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ValueTransformer for IdentityTransformer {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        _data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        Ok(plaintext.to_vec())
    }

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        _data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError> {
        if stored.starts_with(ENCRYPTED_DATA_PREFIX) {
            return Err(TransformError::EncryptedDataRefused);
        }
        Ok((stored.to_vec(), false))
    }
}
