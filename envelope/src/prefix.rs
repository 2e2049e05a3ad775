//! Compound transformer that routes stored data to providers by prefix.

use std::sync::Arc;

use async_trait::async_trait;

use crate::transformer::{TransformError, ValueTransformer};

/// One `(prefix, provider)` pair of a compound transformer.
pub struct PrefixEntry {
    pub prefix: Vec<u8>,
    pub transformer: Arc<dyn ValueTransformer>,
}

impl PrefixEntry {
    pub fn new(prefix: impl Into<Vec<u8>>, transformer: Arc<dyn ValueTransformer>) -> Self {
        Self {
            prefix: prefix.into(),
            transformer,
        }
    }
}

/// Ordered provider chain for one resource rule.
///
/// Writes always go through the first entry. Reads are dispatched to the
/// first entry whose prefix matches the stored bytes; data that matched a
/// non-first entry decrypts fine but is reported stale so the storage layer
/// rewrites it with the primary provider.
pub struct PrefixTransformer {
    entries: Vec<PrefixEntry>,
}

impl PrefixTransformer {
    pub fn new(entries: Vec<PrefixEntry>) -> Self {
        debug_assert!(!entries.is_empty(), "provider chain must not be empty");
        Self { entries }
    }
}

#[async_trait]
impl ValueTransformer for PrefixTransformer {
    async fn transform_to_storage(
        &self,
        plaintext: &[u8],
        data_ctx: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        let primary = &self.entries[0];
        let sealed = primary
            .transformer
            .transform_to_storage(plaintext, data_ctx)
            .await?;

        let mut out = Vec::with_capacity(primary.prefix.len() + sealed.len());
        out.extend_from_slice(&primary.prefix);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn transform_from_storage(
        &self,
        stored: &[u8],
        data_ctx: &[u8],
    ) -> Result<(Vec<u8>, bool), TransformError> {
        for (index, entry) in self.entries.iter().enumerate() {
            if !stored.starts_with(&entry.prefix) {
                continue;
            }

            let result = entry
                .transformer
                .transform_from_storage(&stored[entry.prefix.len()..], data_ctx)
                .await;

            // An empty-prefix (identity) entry matches everything; when it
            // refuses the data the scan continues so a provider listed after
            // it still gets a chance to decode.
            if entry.prefix.is_empty() && result.is_err() {
                continue;
            }

            let (plaintext, stale) = result?;
            return Ok((plaintext, stale || index != 0));
        }

        Err(TransformError::NoMatchingPrefix)
    }
}
