//! Reading and hashing the on-disk configuration document.

use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use envelope::KmsError;

use crate::schema::EncryptionDocument;
use crate::validation::{ValidationError, validate};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read encryption configuration {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse encryption configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to construct KMS provider {name}: {source}")]
    KmsProvider { name: String, source: KmsError },
}

/// Hex SHA-256 of the raw file bytes, the change-detection key for reloads.
/// Hashed before parsing, so formatting-only edits count as changes.
pub fn content_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// Reads, hashes, parses and validates the document at `path`.
pub fn load_document(path: &Path) -> Result<(EncryptionDocument, String), ConfigError> {
    let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let hash = content_hash(&raw);

    let doc: EncryptionDocument = serde_yaml::from_slice(&raw)?;
    validate(&doc)?;
    Ok((doc, hash))
}
