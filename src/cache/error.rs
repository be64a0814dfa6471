use std::time::Duration;

use thiserror::Error;

/// Failures inside the caching layer.
///
/// None of these reach the client: the gate and the compression stage turn
/// each one into "behave as if caching/compression were absent" plus a log
/// line. Downstream handler errors are not represented here; they are
/// ordinary responses that the gate refuses to store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable during {operation}: {reason}")]
    StoreUnavailable {
        operation: &'static str,
        reason: String,
    },

    #[error("lock `{key}` not acquired within {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    #[error("response body is not cacheable JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

impl CacheError {
    pub fn unavailable(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation,
            reason: reason.into(),
        }
    }
}
