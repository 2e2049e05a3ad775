//! Declarative schema of the encryption configuration document.
//!
//! Two document headers are accepted and produce identical internal
//! representations: the current `apiserver.config.k8s.io/v1` /
//! `EncryptionConfiguration` pair and the legacy `v1` / `EncryptionConfig`
//! one. Keys are base64-encoded; durations are integer seconds with an `s`
//! suffix (`timeout: 3s`).

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const CURRENT_API_VERSION: &str = "apiserver.config.k8s.io/v1";
pub const LEGACY_API_VERSION: &str = "v1";
pub const CURRENT_KIND: &str = "EncryptionConfiguration";
pub const LEGACY_KIND: &str = "EncryptionConfig";

/// Default timeout for KMS provider calls.
pub const DEFAULT_KMS_TIMEOUT: Duration = Duration::from_secs(3);
/// Default size of the v1 DEK cache.
pub const DEFAULT_KMS_CACHE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionDocument {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub resources: Vec<ResourceRule>,
}

/// One rule: a set of resource selectors sharing an ordered provider chain.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRule {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

/// One provider slot. Exactly one variant must be set; validation rejects
/// anything else, so the options never reach the factory half-filled.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSpec {
    #[serde(default)]
    pub identity: Option<IdentitySpec>,
    #[serde(default)]
    pub aesgcm: Option<SymmetricSpec>,
    #[serde(default)]
    pub aescbc: Option<SymmetricSpec>,
    #[serde(default)]
    pub secretbox: Option<SymmetricSpec>,
    #[serde(default)]
    pub kms: Option<KmsSpec>,
}

impl ProviderSpec {
    /// Number of variants set; anything other than 1 is a validation error.
    pub fn variant_count(&self) -> usize {
        usize::from(self.identity.is_some())
            + usize::from(self.aesgcm.is_some())
            + usize::from(self.aescbc.is_some())
            + usize::from(self.secretbox.is_some())
            + usize::from(self.kms.is_some())
    }
}

#[derive(Debug, Deserialize)]
pub struct IdentitySpec {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymmetricSpec {
    #[serde(default)]
    pub keys: Vec<KeySpec>,
}

#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(deny_unknown_fields)]
pub struct KeySpec {
    #[zeroize(skip)]
    pub name: String,
    /// Base64-encoded key material; wiped from memory on drop.
    pub secret: String,
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySpec")
            .field("name", &self.name)
            .field("secret", &"REDACTED")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KmsSpec {
    #[serde(rename = "apiVersion", default)]
    pub api_version: Option<String>,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub cachesize: Option<usize>,
    #[serde(default)]
    pub timeout: Option<DurationSeconds>,
}

impl KmsSpec {
    pub fn timeout(&self) -> Duration {
        self.timeout.map(|t| t.0).unwrap_or(DEFAULT_KMS_TIMEOUT)
    }

    pub fn cache_size(&self) -> usize {
        self.cachesize.unwrap_or(DEFAULT_KMS_CACHE_SIZE)
    }
}

/// A duration written as integer seconds with an `s` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationSeconds(pub Duration);

impl<'de> Deserialize<'de> for DurationSeconds {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let seconds = raw
            .strip_suffix('s')
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| {
                de::Error::custom(format!(
                    "invalid duration {raw:?}: expected integer seconds such as \"3s\""
                ))
            })?;
        Ok(DurationSeconds(Duration::from_secs(seconds)))
    }
}

/// A resource selector resolved into its `{group, resource}` pair. The
/// wildcard spellings `*.*` (everything), `*.<group>` (one group) and `*.`
/// (the core group) keep `*` in the respective position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    /// Splits `resource.group` on the first dot; a bare name belongs to the
    /// core (empty) group.
    pub fn parse(selector: &str) -> Self {
        match selector.split_once('.') {
            Some((resource, group)) => Self {
                group: group.to_string(),
                resource: resource.to_string(),
            },
            None => Self {
                group: String::new(),
                resource: selector.to_string(),
            },
        }
    }

    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    pub fn is_universal(&self) -> bool {
        self.group == "*" && self.resource == "*"
    }

    pub fn is_group_wildcard(&self) -> bool {
        self.resource == "*" && self.group != "*"
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            if self.resource == "*" {
                // Core-group wildcard is spelled with a trailing dot.
                write!(f, "*.")
            } else {
                write!(f, "{}", self.resource)
            }
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}
