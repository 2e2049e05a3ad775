//! AES-CBC value transformer.
//!
//! CBC carries no authentication tag and no authenticated data; it exists to
//! read configurations migrated from older deployments. New writes should
//! prefer AES-GCM.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::transformer::{TransformError, ValueTransformer};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// AES-256-CBC with PKCS#7 padding, storing `iv || ciphertext`.
pub struct AesCbcTransformer {
    key: [u8; 32],
}

impl AesCbcTransformer {
    pub fn new(key: &[u8]) -> Result<Self, TransformError> {
        let key: [u8; 32] = key.try_into().map_err(|_| {
            TransformError::EncryptionFailed(format!(
                "AES-CBC key must be 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { key })
    }
}

#[async_trait]
impl ValueTransformer for AesCbcTransformer {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        _data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        _data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError> {
        if stored.len() < IV_LEN {
            return Err(TransformError::InvalidFormat(
                "stored data shorter than the IV".to_string(),
            ));
        }
        let (iv, ciphertext) = stored.split_at(IV_LEN);
        let mut iv_arr = [0u8; IV_LEN];
        iv_arr.copy_from_slice(iv);

        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv_arr.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| TransformError::DecryptionFailed(e.to_string()))?;

        Ok((plaintext, false))
    }
}
