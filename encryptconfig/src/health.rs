//! Health-check plumbing for KMS providers.
//!
//! Each KMS provider contributes one probe; a configuration always compiles
//! to exactly one aggregate check wrapping all of them. With zero KMS
//! providers the aggregate has nothing to ask and always passes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Name of the aggregate check, stable across configurations.
pub const AGGREGATE_HEALTH_CHECK_NAME: &str = "kms-providers";

#[derive(Debug, Clone)]
pub struct HealthCheckError {
    pub reason: String,
}

impl HealthCheckError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HealthCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for HealthCheckError {}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<(), HealthCheckError>;
}

/// Passes iff every wrapped probe passes under its own TTL semantics.
pub struct UnionHealthCheck {
    name: String,
    checks: Vec<Arc<dyn HealthChecker>>,
}

impl UnionHealthCheck {
    pub fn new(name: impl Into<String>, checks: Vec<Arc<dyn HealthChecker>>) -> Self {
        Self {
            name: name.into(),
            checks,
        }
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }
}

#[async_trait]
impl HealthChecker for UnionHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<(), HealthCheckError> {
        for check in &self.checks {
            check
                .check()
                .await
                .map_err(|err| HealthCheckError::new(format!("{}: {err}", check.name())))?;
        }
        Ok(())
    }
}
