//! Wire protocol for live viewers. Tagged JSON in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detector::Detection;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Frame(FramePayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct FramePayload {
    /// Base64-encoded JPEG with the overlay already drawn.
    pub image: String,
    pub detections: Vec<Detection>,
    pub stats: StreamStats,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StreamStats {
    pub fps: f32,
    pub processing_time_ms: f32,
    pub detection_count: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Config(ConfigUpdate),
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConfigUpdate {
    pub confidence_threshold: f32,
}

impl ConfigUpdate {
    /// Threshold as sent by the client, in [0, 1]. Out-of-range or
    /// non-finite values are rejected, not clamped.
    pub fn validated_threshold(&self) -> Result<f32> {
        let threshold = self.confidence_threshold;
        if threshold.is_finite() && (0.0..=1.0).contains(&threshold) {
            Ok(threshold)
        } else {
            Err(Error::InvalidThreshold(threshold))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::BoundingBox;

    #[test]
    fn frame_message_is_tagged() {
        let message = ServerMessage::Frame(FramePayload {
            image: "aGVsbG8=".to_string(),
            detections: vec![Detection {
                class_name: "dog".to_string(),
                confidence: 0.9,
                bbox: BoundingBox::from_pixel_corners(0.0, 0.0, 32.0, 24.0, 64, 48),
            }],
            stats: StreamStats {
                fps: 9.5,
                processing_time_ms: 12.0,
                detection_count: 3,
            },
            timestamp: Utc::now(),
        });

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(value["type"], "frame");
        assert_eq!(value["detections"][0]["class_name"], "dog");
        assert_eq!(value["detections"][0]["bbox"]["x_max"], 0.5);
        assert_eq!(value["stats"]["detection_count"], 3);
    }

    #[test]
    fn config_message_parses() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"config","confidence_threshold":0.6}"#).unwrap();
        let ClientMessage::Config(update) = message;
        assert_eq!(update.validated_threshold().unwrap(), 0.6);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"zoom","level":3}"#).is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        for bad in [-0.1_f32, 1.5, f32::NAN] {
            let update = ConfigUpdate {
                confidence_threshold: bad,
            };
            assert!(matches!(
                update.validated_threshold(),
                Err(Error::InvalidThreshold(_))
            ));
        }
    }
}
