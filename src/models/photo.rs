use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted photo. The row is created only after the JPEG hit disk; the
/// file may later be removed by retention while the row remains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: Option<i64>,
    pub filename: String,
    pub filepath: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub has_detections: bool,
    pub detection_count: u32,
    pub created_at: DateTime<Utc>,
}

/// One detection attached to a photo. Box coordinates are normalized center
/// plus extent, matching the detector output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: Option<i64>,
    pub photo_id: i64,
    pub class_name: String,
    pub confidence: f32,
    pub bbox_x: f32,
    pub bbox_y: f32,
    pub bbox_width: f32,
    pub bbox_height: f32,
    pub model_name: Option<String>,
    pub created_at: DateTime<Utc>,
}
