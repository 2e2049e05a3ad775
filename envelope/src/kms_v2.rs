//! Envelope v2 transformer.
//!
//! Like v1, every value is sealed with a fresh DEK and only the DEK is sent
//! to the provider. V2 additionally records which remote key wrapped the DEK
//! and compares it on reads against the key id the status probe most
//! recently observed, so a rotation at the plugin marks older values stale
//! without any configuration change.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::aesgcm::{open_with_dek, seal_with_dek};
use crate::service::{DecryptRequest, KmsServiceV2};
use crate::transformer::{TransformError, ValueTransformer};

/// Upper bound on the byte length of a remote key identifier.
pub const MAX_KEY_ID_LEN: usize = 128;

const DEK_LEN: usize = 32;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyIdError {
    #[error("key id is empty")]
    Empty,

    #[error("key id exceeds {MAX_KEY_ID_LEN} bytes")]
    TooLong,
}

impl KeyIdError {
    /// Label value for the invalid-key-id counter.
    pub fn metric_label(self) -> &'static str {
        match self {
            KeyIdError::Empty => "empty",
            KeyIdError::TooLong => "too_long",
        }
    }
}

pub fn validate_key_id(key_id: &str) -> Result<(), KeyIdError> {
    if key_id.is_empty() {
        return Err(KeyIdError::Empty);
    }
    if key_id.len() > MAX_KEY_ID_LEN {
        return Err(KeyIdError::TooLong);
    }
    Ok(())
}

/// Write-once-per-success, multi-reader slot for the provider's current key
/// id. The status probe stores into it; the transformer and logging read it
/// without locking.
#[derive(Default)]
pub struct KeyIdTracker {
    current: ArcSwapOption<String>,
}

impl KeyIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, key_id: &str) {
        self.current.store(Some(Arc::new(key_id.to_string())));
    }

    pub fn current(&self) -> Option<Arc<String>> {
        self.current.load_full()
    }
}

/// On-storage object following the provider prefix.
#[derive(Serialize, Deserialize)]
struct EncryptedObject {
    #[serde(rename = "encryptedData")]
    encrypted_data: String,
    #[serde(rename = "keyID")]
    key_id: String,
    #[serde(rename = "encryptedDEK")]
    encrypted_dek: String,
}

pub struct KmsV2Transformer {
    service: Arc<dyn KmsServiceV2>,
    tracker: Arc<KeyIdTracker>,
    provider_name: String,
}

impl KmsV2Transformer {
    pub fn new(
        service: Arc<dyn KmsServiceV2>,
        tracker: Arc<KeyIdTracker>,
        provider_name: impl Into<String>,
    ) -> Self {
        Self {
            service,
            tracker,
            provider_name: provider_name.into(),
        }
    }
}

#[async_trait]
impl ValueTransformer for KmsV2Transformer {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let mut dek = [0u8; DEK_LEN];
        OsRng.fill_bytes(&mut dek);

        let sealed = seal_with_dek(&dek, plaintext, data_ctx)?;

        let uid = Uuid::new_v4().to_string();
        let response = self.service.encrypt(&uid, &dek).await?;
        if let Err(err) = validate_key_id(&response.key_id) {
            return Err(TransformError::EncryptionFailed(format!(
                "provider {} returned an invalid key id: {err}",
                self.provider_name
            )));
        }

        let object = EncryptedObject {
            encrypted_data: STANDARD.encode(&sealed),
            key_id: response.key_id,
            encrypted_dek: STANDARD.encode(&response.ciphertext),
        };
        serde_json::to_vec(&object)
            .map_err(|e| TransformError::EncryptionFailed(e.to_string()))
    }

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError> {
        let object: EncryptedObject = serde_json::from_slice(stored)
            .map_err(|e| TransformError::InvalidFormat(e.to_string()))?;

        let sealed = STANDARD
            .decode(&object.encrypted_data)
            .map_err(|e| TransformError::InvalidFormat(e.to_string()))?;
        let wrapped = STANDARD
            .decode(&object.encrypted_dek)
            .map_err(|e| TransformError::InvalidFormat(e.to_string()))?;

        let uid = Uuid::new_v4().to_string();
        let unwrapped = self
            .service
            .decrypt(
                &uid,
                DecryptRequest {
                    ciphertext: &wrapped,
                    key_id: &object.key_id,
                },
            )
            .await?;
        let dek: [u8; DEK_LEN] = unwrapped.as_slice().try_into().map_err(|_| {
            TransformError::InvalidFormat(format!(
                "provider {} returned a {}-byte DEK, expected {DEK_LEN}",
                self.provider_name,
                unwrapped.len()
            ))
        })?;

        let plaintext = open_with_dek(&dek, &sealed, data_ctx)?;

        // Values written under a key the probe no longer reports are stale.
        let stale = self
            .tracker
            .current()
            .map(|current| *current != object.key_id)
            .unwrap_or(false);

        Ok((plaintext, stale))
    }
}
