use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One capture-pipeline lifetime. `ended_at` is NULL while the pipeline runs;
/// a row still open at the next startup was left by a crash and is closed
/// during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub model_name: Option<String>,
    pub confidence_threshold: f32,
    pub photo_count: u64,
    pub detection_count: u64,
}

impl CaptureSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}
