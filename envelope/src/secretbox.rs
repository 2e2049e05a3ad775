//! Secretbox (XSalsa20-Poly1305) value transformer.

use async_trait::async_trait;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::transformer::{TransformError, ValueTransformer};

const NONCE_LEN: usize = 24;

/// NaCl-style secretbox storing `nonce || sealed`. The primitive has no
/// additional-authenticated-data slot, so the storage key is not bound in.
pub struct SecretboxTransformer {
    cipher: XSalsa20Poly1305,
}

impl SecretboxTransformer {
    pub fn new(key: &[u8]) -> Result<Self, TransformError> {
        let cipher = XSalsa20Poly1305::new_from_slice(key).map_err(|_| {
            TransformError::EncryptionFailed(format!(
                "secretbox key must be 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { cipher })
    }
}

#[async_trait]
impl ValueTransformer for SecretboxTransformer {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        _data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| TransformError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        _data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError> {
        if stored.len() < NONCE_LEN {
            return Err(TransformError::InvalidFormat(
                "stored data shorter than the nonce".to_string(),
            ));
        }
        let (nonce, sealed) = stored.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| TransformError::DecryptionFailed(e.to_string()))?;

        Ok((plaintext, false))
    }
}
