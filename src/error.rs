use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced at component seams. Only `DeviceUnavailable` during
/// startup is allowed to take the process down; everything else is handled
/// at the loop that observed it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("frame is stale: captured {age_ms}ms ago (limit {limit_ms}ms)")]
    StaleFrame { age_ms: i64, limit_ms: i64 },

    #[error("detector failed: {0}")]
    DetectorFailure(anyhow::Error),

    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("viewer limit reached ({limit} active connections)")]
    ConnectionRejected { limit: usize },

    #[error("previous retention sweep still in progress")]
    SweepConflict,

    #[error("camera arbiter is not running")]
    Stopped,

    #[error("invalid confidence threshold {0} (expected 0.0..=1.0)")]
    InvalidThreshold(f32),
}
