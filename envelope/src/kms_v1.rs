//! Envelope v1 transformer.
//!
//! Each value is sealed with a fresh data-encryption key; only the DEK
//! crosses the KMS boundary. On-storage layout after the provider prefix:
//! `[u16 BE wrapped-DEK length][wrapped DEK][sealed payload]`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::aesgcm::{open_with_dek, seal_with_dek};
use crate::service::KmsService;
use crate::transformer::{TransformError, ValueTransformer};

const DEK_LEN: usize = 32;

/// Bounded map of wrapped-DEK bytes to unwrapped DEKs, so repeated reads of
/// values sealed under the same DEK skip the remote unwrap call.
struct DekCache {
    inner: Mutex<DekCacheInner>,
    capacity: usize,
}

struct DekCacheInner {
    map: HashMap<Vec<u8>, [u8; DEK_LEN]>,
    order: VecDeque<Vec<u8>>,
}

impl DekCache {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(DekCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    fn get(&self, wrapped: &[u8]) -> Option<[u8; DEK_LEN]> {
        self.inner.lock().map.get(wrapped).copied()
    }

    fn insert(&self, wrapped: Vec<u8>, dek: [u8; DEK_LEN]) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&wrapped) {
            return;
        }
        while inner.map.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(wrapped.clone());
        inner.map.insert(wrapped, dek);
    }
}

pub struct KmsV1Transformer {
    service: Arc<dyn KmsService>,
    cache: DekCache,
}

impl KmsV1Transformer {
    pub fn new(service: Arc<dyn KmsService>, cache_size: usize) -> Self {
        Self {
            service,
            cache: DekCache::new(cache_size),
        }
    }
}

#[async_trait]
impl ValueTransformer for KmsV1Transformer {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let mut dek = [0u8; DEK_LEN];
        OsRng.fill_bytes(&mut dek);

        let sealed = seal_with_dek(&dek, plaintext, data_ctx)?;
        let wrapped = self.service.encrypt(&dek).await?;

        let wrapped_len = u16::try_from(wrapped.len()).map_err(|_| {
            TransformError::EncryptionFailed(format!(
                "wrapped DEK too large: {} bytes",
                wrapped.len()
            ))
        })?;

        self.cache.insert(wrapped.clone(), dek);

        let mut out = Vec::with_capacity(2 + wrapped.len() + sealed.len());
        out.extend_from_slice(&wrapped_len.to_be_bytes());
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError> {
        if stored.len() < 2 {
            return Err(TransformError::InvalidFormat(
                "stored data shorter than the DEK length header".to_string(),
            ));
        }
        let wrapped_len = usize::from(u16::from_be_bytes([stored[0], stored[1]]));
        let rest = &stored[2..];
        if rest.len() < wrapped_len {
            return Err(TransformError::InvalidFormat(
                "stored data shorter than the declared wrapped DEK".to_string(),
            ));
        }
        let (wrapped, sealed) = rest.split_at(wrapped_len);

        let dek = match self.cache.get(wrapped) {
            Some(dek) => dek,
            None => {
                let unwrapped = self.service.decrypt(wrapped).await?;
                let dek: [u8; DEK_LEN] = unwrapped.as_slice().try_into().map_err(|_| {
                    TransformError::InvalidFormat(format!(
                        "KMS returned a {}-byte DEK, expected {DEK_LEN}",
                        unwrapped.len()
                    ))
                })?;
                self.cache.insert(wrapped.to_vec(), dek);
                dek
            }
        };

        let plaintext = open_with_dek(&dek, sealed, data_ctx)?;
        Ok((plaintext, false))
    }
}
