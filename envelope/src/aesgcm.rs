//! AES-GCM value transformer.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::transformer::{TransformError, ValueTransformer};

type Aes192Gcm = AesGcm<aes::Aes192, U12>;

pub(crate) const NONCE_LEN: usize = 12;

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl Cipher {
    fn encrypt(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Cipher::Aes128(c) => c.encrypt(nonce, payload),
            Cipher::Aes192(c) => c.encrypt(nonce, payload),
            Cipher::Aes256(c) => c.encrypt(nonce, payload),
        }
    }

    fn decrypt(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Cipher::Aes128(c) => c.decrypt(nonce, payload),
            Cipher::Aes192(c) => c.decrypt(nonce, payload),
            Cipher::Aes256(c) => c.decrypt(nonce, payload),
        }
    }
}

/// AEAD transformer storing `nonce || ciphertext`, with the storage key of
/// the value bound in as additional authenticated data.
pub struct AesGcmTransformer {
    cipher: Cipher,
}

impl AesGcmTransformer {
    /// Accepts 16-, 24- or 32-byte keys.
    pub fn new(key: &[u8]) -> Result<Self, TransformError> {
        let cipher = match key.len() {
            16 => Cipher::Aes128(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|e| TransformError::EncryptionFailed(e.to_string()))?,
            ),
            24 => Cipher::Aes192(
                Aes192Gcm::new_from_slice(key)
                    .map_err(|e| TransformError::EncryptionFailed(e.to_string()))?,
            ),
            32 => Cipher::Aes256(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| TransformError::EncryptionFailed(e.to_string()))?,
            ),
            n => {
                return Err(TransformError::EncryptionFailed(format!(
                    "AES-GCM key must be 16, 24 or 32 bytes, got {n}"
                )));
            }
        };
        Ok(Self { cipher })
    }
}

#[async_trait]
impl ValueTransformer for AesGcmTransformer {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: data_ctx,
                },
            )
            .map_err(|e| TransformError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError> {
        if stored.len() < NONCE_LEN {
            return Err(TransformError::InvalidFormat(
                "stored data shorter than the nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = stored.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: data_ctx,
                },
            )
            .map_err(|e| TransformError::DecryptionFailed(e.to_string()))?;

        Ok((plaintext, false))
    }
}

/// Seals `plaintext` under a 32-byte key as `nonce || ciphertext`. Shared by
/// the envelope KMS transformers, which encrypt each value with a fresh DEK.
pub(crate) fn seal_with_dek(
    dek: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, TransformError> {
    let cipher = Aes256Gcm::new_from_slice(dek)
        .map_err(|e| TransformError::EncryptionFailed(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| TransformError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub(crate) fn open_with_dek(
    dek: &[u8; 32],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, TransformError> {
    if sealed.len() < NONCE_LEN {
        return Err(TransformError::InvalidFormat(
            "sealed payload shorter than the nonce".to_string(),
        ));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(dek)
        .map_err(|e| TransformError::DecryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|e| TransformError::DecryptionFailed(e.to_string()))
}
