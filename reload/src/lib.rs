//! # Reload
//!
//! Runtime half of encryption at rest: atomic publication of transformer
//! generations and the controller that keeps them synchronized with the
//! on-disk configuration file.
//!
//! This crate provides:
//! - [`DynamicTransformers`]: wait-free access to the current generation,
//!   with graceful release of replaced generations
//! - [`ReloadController`]: the single-worker, rate-limited reload loop
//!   gated on the new configuration's health check

pub mod controller;
pub mod holder;
mod metrics;

pub use controller::{DEFAULT_POLL_PERIOD, ReloadController, ReloadError};
pub use holder::{DynamicTransformers, MIN_CLOSE_GRACE_PERIOD, TransformerGeneration};
