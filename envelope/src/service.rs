//! Service traits for remote envelope KMS providers.
//!
//! A KMS provider is an external process owning the key-encryption key; this
//! subsystem only ever sends it data-encryption keys to wrap and unwrap. The
//! dialing of real plugin endpoints lives behind [`EnvelopeServiceFactory`]
//! so the configuration factory stays transport-agnostic;
//! [`LocalEnvelopeService`] is the in-process implementation used by
//! development configurations and tests.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Status string a healthy v2 provider reports.
pub const STATUS_HEALTHY: &str = "ok";
/// Envelope protocol version a v2 provider must speak.
pub const KMS_V2_API_VERSION: &str = "v2alpha1";

#[derive(Error, Debug)]
pub enum KmsError {
    #[error("KMS operation failed: {0}")]
    OperationFailed(String),

    #[error("KMS provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid KMS response: {0}")]
    InvalidResponse(String),

    #[error("KMS call timed out after {0:?}")]
    Timeout(Duration),
}

/// Envelope v1 service: wrap/unwrap raw bytes plus a health endpoint.
#[async_trait]
pub trait KmsService: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;
    async fn health(&self) -> Result<(), KmsError>;
}

/// Response of a v2 `encrypt` call: the wrapped bytes and the identifier of
/// the remote key that wrapped them.
#[derive(Debug, Clone)]
pub struct EncryptResponse {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
}

/// Inputs of a v2 `decrypt` call; the key id routes the request to the right
/// remote key even after rotation.
#[derive(Debug)]
pub struct DecryptRequest<'a> {
    pub ciphertext: &'a [u8],
    pub key_id: &'a str,
}

/// Answer of the v2 `status` RPC.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    pub healthz: String,
    pub version: String,
    pub key_id: String,
}

/// Envelope v2 service. The `uid` correlates a request across the plugin's
/// logs and is unique per call.
#[async_trait]
pub trait KmsServiceV2: Send + Sync {
    async fn encrypt(&self, uid: &str, plaintext: &[u8]) -> Result<EncryptResponse, KmsError>;
    async fn decrypt(&self, uid: &str, request: DecryptRequest<'_>) -> Result<Vec<u8>, KmsError>;
    async fn status(&self) -> Result<StatusResponse, KmsError>;
}

/// Creates envelope services for configured endpoints. A reload passes its
/// lifecycle token so that connections dialed for a configuration that never
/// commits are torn down when the attempt is cancelled.
#[async_trait]
pub trait EnvelopeServiceFactory: Send + Sync {
    async fn create_v1(
        &self,
        endpoint: &str,
        lifecycle: &CancellationToken,
    ) -> Result<Arc<dyn KmsService>, KmsError>;

    async fn create_v2(
        &self,
        endpoint: &str,
        lifecycle: &CancellationToken,
    ) -> Result<Arc<dyn KmsServiceV2>, KmsError>;
}

/// Bounds every v1 call by the provider's configured timeout.
pub struct TimedKmsService {
    inner: Arc<dyn KmsService>,
    timeout: Duration,
}

impl TimedKmsService {
    pub fn new(inner: Arc<dyn KmsService>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl KmsService for TimedKmsService {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        tokio::time::timeout(self.timeout, self.inner.encrypt(plaintext))
            .await
            .map_err(|_| KmsError::Timeout(self.timeout))?
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        tokio::time::timeout(self.timeout, self.inner.decrypt(ciphertext))
            .await
            .map_err(|_| KmsError::Timeout(self.timeout))?
    }

    async fn health(&self) -> Result<(), KmsError> {
        tokio::time::timeout(self.timeout, self.inner.health())
            .await
            .map_err(|_| KmsError::Timeout(self.timeout))?
    }
}

/// Bounds every v2 call by the provider's configured timeout.
pub struct TimedKmsServiceV2 {
    inner: Arc<dyn KmsServiceV2>,
    timeout: Duration,
}

impl TimedKmsServiceV2 {
    pub fn new(inner: Arc<dyn KmsServiceV2>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl KmsServiceV2 for TimedKmsServiceV2 {
    async fn encrypt(&self, uid: &str, plaintext: &[u8]) -> Result<EncryptResponse, KmsError> {
        tokio::time::timeout(self.timeout, self.inner.encrypt(uid, plaintext))
            .await
            .map_err(|_| KmsError::Timeout(self.timeout))?
    }

    async fn decrypt(&self, uid: &str, request: DecryptRequest<'_>) -> Result<Vec<u8>, KmsError> {
        tokio::time::timeout(self.timeout, self.inner.decrypt(uid, request))
            .await
            .map_err(|_| KmsError::Timeout(self.timeout))?
    }

    async fn status(&self) -> Result<StatusResponse, KmsError> {
        tokio::time::timeout(self.timeout, self.inner.status())
            .await
            .map_err(|_| KmsError::Timeout(self.timeout))?
    }
}

const LOCAL_NONCE_LEN: usize = 12;

/// In-process AES-256-GCM envelope service implementing both protocol
/// versions. Not a substitute for a real external KMS: the key-encryption
/// key lives in this process. Development and tests only.
pub struct LocalEnvelopeService {
    cipher: Aes256Gcm,
    key_id: String,
}

impl LocalEnvelopeService {
    pub fn new(key: &[u8; 32], key_id: impl Into<String>) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
            key_id: key_id.into(),
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let mut nonce = [0u8; LOCAL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext,
                    aad: b"",
                },
            )
            .map_err(|e| KmsError::OperationFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(LOCAL_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, stored: &[u8]) -> Result<Vec<u8>, KmsError> {
        if stored.len() < LOCAL_NONCE_LEN {
            return Err(KmsError::InvalidResponse(
                "wrapped key shorter than the nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = stored.split_at(LOCAL_NONCE_LEN);
        let mut nonce_arr = [0u8; LOCAL_NONCE_LEN];
        nonce_arr.copy_from_slice(nonce);

        self.cipher
            .decrypt(
                (&nonce_arr).into(),
                Payload {
                    msg: ciphertext,
                    aad: b"",
                },
            )
            .map_err(|e| KmsError::OperationFailed(e.to_string()))
    }
}

#[async_trait]
impl KmsService for LocalEnvelopeService {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.seal(plaintext)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.open(ciphertext)
    }

    async fn health(&self) -> Result<(), KmsError> {
        Ok(())
    }
}

#[async_trait]
impl KmsServiceV2 for LocalEnvelopeService {
    async fn encrypt(&self, _uid: &str, plaintext: &[u8]) -> Result<EncryptResponse, KmsError> {
        Ok(EncryptResponse {
            ciphertext: self.seal(plaintext)?,
            key_id: self.key_id.clone(),
        })
    }

    async fn decrypt(&self, _uid: &str, request: DecryptRequest<'_>) -> Result<Vec<u8>, KmsError> {
        if request.key_id != self.key_id {
            return Err(KmsError::OperationFailed(format!(
                "unknown key id {}",
                request.key_id
            )));
        }
        self.open(request.ciphertext)
    }

    async fn status(&self) -> Result<StatusResponse, KmsError> {
        Ok(StatusResponse {
            healthz: STATUS_HEALTHY.to_string(),
            version: KMS_V2_API_VERSION.to_string(),
            key_id: self.key_id.clone(),
        })
    }
}

/// Hands out one shared [`LocalEnvelopeService`] regardless of endpoint.
pub struct LocalEnvelopeServiceFactory {
    service: Arc<LocalEnvelopeService>,
}

impl LocalEnvelopeServiceFactory {
    pub fn new(key: &[u8; 32], key_id: impl Into<String>) -> Self {
        Self {
            service: Arc::new(LocalEnvelopeService::new(key, key_id)),
        }
    }
}

#[async_trait]
impl EnvelopeServiceFactory for LocalEnvelopeServiceFactory {
    async fn create_v1(
        &self,
        _endpoint: &str,
        _lifecycle: &CancellationToken,
    ) -> Result<Arc<dyn KmsService>, KmsError> {
        Ok(self.service.clone())
    }

    async fn create_v2(
        &self,
        _endpoint: &str,
        _lifecycle: &CancellationToken,
    ) -> Result<Arc<dyn KmsServiceV2>, KmsError> {
        Ok(self.service.clone())
    }
}
