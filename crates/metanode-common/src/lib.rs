//! Metanode Common - Shared types and utilities
//!
//! This crate provides the extent-deletion data model, error definitions,
//! configuration and the concurrency limiter used across all metanode
//! components.

pub mod config;
pub mod error;
pub mod limiter;
pub mod types;

pub use config::{DeletionConfig, LimiterConfig, NodeConfig, NodeSection, RotatorConfig};
pub use error::{Error, Result};
pub use limiter::{ConcurrencyLimiter, LimiterPermit, OwnedLimiterPermit};
pub use types::{DeletionRecord, ExtentKey, SourceType};
