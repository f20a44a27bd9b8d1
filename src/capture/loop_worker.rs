use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use log::{error, info, warn};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::camera::CameraArbiter;
use crate::db::Database;
use crate::detector::Detector;
use crate::error::Error;
use crate::models::{DetectionRecord, PhotoRecord};

use super::CaptureConfig;

const CAPTURE_JPEG_QUALITY: u8 = 95;
const SUMMARY_EVERY_CAPTURES: u64 = 10;

pub(crate) async fn capture_loop(
    arbiter: Arc<CameraArbiter>,
    detector: Arc<dyn Detector>,
    db: Database,
    config: CaptureConfig,
    session_id: Option<i64>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut photo_count: u64 = 0;
    let mut detection_count: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match perform_capture(&arbiter, &detector, &db, &config).await {
                    Ok(Some(stored_detections)) => {
                        photo_count += 1;
                        detection_count += stored_detections;

                        if let Some(session_id) = session_id {
                            if let Err(err) = db
                                .update_session_counters(session_id, photo_count, detection_count)
                                .await
                            {
                                warn!("failed to persist session {session_id} counters: {err:?}");
                            }
                        }

                        if photo_count % SUMMARY_EVERY_CAPTURES == 0 {
                            info!(
                                "capture progress: {photo_count} photos, {detection_count} detections"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!("capture tick abandoned: {err:?}"),
                }
            }
            _ = cancel_token.cancelled() => {
                info!("capture loop shutting down");
                break;
            }
        }
    }

    if let Some(session_id) = session_id {
        match db
            .end_session(session_id, Utc::now(), photo_count, detection_count)
            .await
        {
            Ok(()) => info!(
                "capture session {session_id} closed: {photo_count} photos, {detection_count} detections"
            ),
            Err(err) => warn!("failed to close session {session_id}: {err:?}"),
        }
    }
}

/// One capture tick. `Ok(Some(n))` persisted a photo with `n` stored
/// detections, `Ok(None)` skipped the tick, `Err` abandoned it.
async fn perform_capture(
    arbiter: &CameraArbiter,
    detector: &Arc<dyn Detector>,
    db: &Database,
    config: &CaptureConfig,
) -> Result<Option<u64>> {
    let capture_start = Instant::now();

    let frame = match arbiter.latest_high_res_frame() {
        Ok(frame) => frame,
        Err(Error::Stopped) => {
            warn!("no frame available; skipping capture tick");
            return Ok(None);
        }
        Err(err) => return Err(err).context("failed to read high-res frame"),
    };

    let age_ms = frame.age(Utc::now()).num_milliseconds();
    let limit_ms = staleness_limit(config.interval).as_millis() as i64;
    if age_ms > limit_ms {
        warn!("{}", Error::StaleFrame { age_ms, limit_ms });
        return Ok(None);
    }

    let detect_start = Instant::now();
    let detections = {
        let detector = Arc::clone(detector);
        let frame = Arc::clone(&frame);
        let threshold = config.confidence_threshold;
        match tokio::task::spawn_blocking(move || detector.detect(&frame, threshold))
            .await
            .context("detector worker join failed")?
        {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    "{}; capturing photo without detections",
                    Error::DetectorFailure(err)
                );
                Vec::new()
            }
        }
    };
    let detect_duration_ms = detect_start.elapsed().as_millis();

    let filename = photo_filename(frame.captured_at);
    let filepath = config.photo_dir.join(&filename);

    let write_start = Instant::now();
    {
        let frame = Arc::clone(&frame);
        let path = filepath.clone();
        tokio::task::spawn_blocking(move || write_jpeg(&frame.pixels, &path, CAPTURE_JPEG_QUALITY))
            .await
            .context("photo write worker join failed")??;
    }
    let write_duration_ms = write_start.elapsed().as_millis();

    let db_start = Instant::now();
    let record = PhotoRecord {
        id: None,
        filename: filename.clone(),
        filepath: filepath.to_string_lossy().into_owned(),
        width: frame.width(),
        height: frame.height(),
        captured_at: frame.captured_at,
        has_detections: false,
        detection_count: 0,
        created_at: Utc::now(),
    };

    // The JPEG is already on disk; a failed insert abandons the tick and
    // leaves the file for retention to collect. Session counters only ever
    // count photos that have a row.
    let photo_id = db
        .insert_photo(&record)
        .await
        .with_context(|| format!("photo row insert failed for {filename}"))?;

    let mut stored: u32 = 0;
    for detection in &detections {
        let detection_record = DetectionRecord {
            id: None,
            photo_id,
            class_name: detection.class_name.clone(),
            confidence: detection.confidence,
            bbox_x: detection.bbox.x_center,
            bbox_y: detection.bbox.y_center,
            bbox_width: detection.bbox.width,
            bbox_height: detection.bbox.height,
            model_name: config.model_name.clone(),
            created_at: Utc::now(),
        };
        match db.insert_detection(&detection_record).await {
            Ok(_) => stored += 1,
            Err(err) => {
                // Photo row stands with its zero count.
                warn!("detection insert failed for photo {photo_id}: {err:?}");
                stored = 0;
                break;
            }
        }
    }

    if stored > 0 {
        if let Err(err) = db.update_photo_detections(photo_id, stored).await {
            warn!("failed to update detection count for photo {photo_id}: {err:?}");
        }
    }
    let db_duration_ms = db_start.elapsed().as_millis();

    let capture_duration_ms = capture_start.elapsed().as_millis();
    info!(
        "captured {filename} with {stored} detections in {capture_duration_ms}ms (detect: {detect_duration_ms}ms, write: {write_duration_ms}ms, db: {db_duration_ms}ms)"
    );

    Ok(Some(u64::from(stored)))
}

/// A frame older than two capture intervals means the camera has stalled.
fn staleness_limit(interval: Duration) -> Duration {
    interval * 2
}

fn photo_filename(captured_at: DateTime<Utc>) -> String {
    format!("photo_{}.jpg", captured_at.format("%Y%m%d_%H%M%S_%3f"))
}

fn write_jpeg(pixels: &RgbImage, path: &Path, quality: u8) -> crate::error::Result<()> {
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality)
        .encode_image(pixels)
        .map_err(|err| Error::WriteFailure {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, err),
        })?;

    std::fs::write(path, &encoded).map_err(|err| Error::WriteFailure {
        path: path.to_path_buf(),
        source: err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraArbiter, Frame, SyntheticSource};
    use crate::capture::CaptureController;
    use crate::detector::{BoundingBox, Detection};
    use tempfile::TempDir;

    struct ScriptedDetector {
        detections: Vec<Detection>,
    }

    impl Detector for ScriptedDetector {
        fn detect(&self, _frame: &Frame, threshold: f32) -> anyhow::Result<Vec<Detection>> {
            Ok(self
                .detections
                .iter()
                .filter(|d| d.confidence >= threshold)
                .cloned()
                .collect())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&self, _frame: &Frame, _threshold: f32) -> anyhow::Result<Vec<Detection>> {
            Err(anyhow::anyhow!("model backend crashed"))
        }
    }

    fn dog_at(confidence: f32) -> Detection {
        Detection {
            class_name: "dog".to_string(),
            confidence,
            bbox: BoundingBox::from_pixel_corners(4.0, 3.0, 12.0, 9.0, 16, 12),
        }
    }

    async fn started_arbiter() -> Arc<CameraArbiter> {
        let mut arbiter = CameraArbiter::with_intervals(
            Box::new(SyntheticSource::with_dimensions((16, 12), (8, 6))),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        arbiter.start().await.unwrap();
        Arc::new(arbiter)
    }

    async fn run_capture_briefly(
        detector: Arc<dyn Detector>,
        threshold: f32,
    ) -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("test.sqlite3")).unwrap();
        let arbiter = started_arbiter().await;

        let mut controller = CaptureController::new();
        controller
            .start(
                Arc::clone(&arbiter),
                detector,
                db.clone(),
                CaptureConfig {
                    interval: Duration::from_millis(50),
                    photo_dir: dir.path().join("photos"),
                    model_name: Some("test-model".to_string()),
                    confidence_threshold: threshold,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.stop().await.unwrap();
        arbiter.stop().await;

        (dir, db)
    }

    #[tokio::test]
    async fn detection_above_threshold_is_persisted_with_its_photo() {
        let detector = Arc::new(ScriptedDetector {
            detections: vec![dog_at(0.9)],
        });
        let (dir, db) = run_capture_briefly(detector, 0.5).await;

        let photo = db.get_photo(1).await.unwrap().expect("photo row missing");
        assert!(photo.has_detections);
        assert_eq!(photo.detection_count, 1);
        assert!(dir.path().join("photos").join(&photo.filename).exists());

        let detections = db.get_detections_for_photo(1).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "dog");
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(detections[0].model_name.as_deref(), Some("test-model"));

        let session = db.get_session(1).await.unwrap().expect("session missing");
        assert!(session.ended_at.is_some());
        assert!(session.photo_count >= 1);
        assert!(session.detection_count >= 1);
    }

    #[tokio::test]
    async fn failing_detector_still_records_photos_with_zero_detections() {
        let (_dir, db) = run_capture_briefly(Arc::new(FailingDetector), 0.5).await;

        assert!(db.count_photos().await.unwrap() >= 1);
        let photo = db.get_photo(1).await.unwrap().unwrap();
        assert!(!photo.has_detections);
        assert_eq!(photo.detection_count, 0);
    }

    #[tokio::test]
    async fn detection_below_threshold_is_filtered_out() {
        let detector = Arc::new(ScriptedDetector {
            detections: vec![dog_at(0.3)],
        });
        let (_dir, db) = run_capture_briefly(detector, 0.5).await;

        let photo = db.get_photo(1).await.unwrap().unwrap();
        assert_eq!(photo.detection_count, 0);
        assert!(db.get_detections_for_photo(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstarted_arbiter_means_skipped_ticks_and_no_rows() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("test.sqlite3")).unwrap();
        let arbiter = Arc::new(CameraArbiter::new(Box::new(SyntheticSource::new())));

        let mut controller = CaptureController::new();
        controller
            .start(
                arbiter,
                Arc::new(crate::detector::NoopDetector),
                db.clone(),
                CaptureConfig {
                    interval: Duration::from_millis(20),
                    photo_dir: dir.path().join("photos"),
                    model_name: None,
                    confidence_threshold: 0.25,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.stop().await.unwrap();

        assert_eq!(db.count_photos().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_frames_are_skipped_without_rows() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("test.sqlite3")).unwrap();
        let arbiter = started_arbiter().await;

        // Wait for a frame, then stop the arbiter: the last frame stays
        // readable and only ages from here on.
        for _ in 0..200 {
            if arbiter.latest_high_res_frame().is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let frozen = arbiter.latest_high_res_frame().unwrap();
        arbiter.stop().await;

        // Age the frozen frame past twice the capture interval.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(frozen.age(Utc::now()).num_milliseconds() > 40);

        let mut controller = CaptureController::new();
        controller
            .start(
                Arc::clone(&arbiter),
                Arc::new(crate::detector::NoopDetector),
                db.clone(),
                CaptureConfig {
                    interval: Duration::from_millis(20),
                    photo_dir: dir.path().join("photos"),
                    model_name: None,
                    confidence_threshold: 0.25,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.stop().await.unwrap();

        assert_eq!(db.count_photos().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_photo_insert_abandons_the_tick_and_counters_reconcile() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("test.sqlite3")).unwrap();

        // One high-res frame for the whole test: every tick derives the same
        // filename, so the second insert hits the UNIQUE constraint.
        let mut arbiter = CameraArbiter::with_intervals(
            Box::new(SyntheticSource::with_dimensions((16, 12), (8, 6))),
            Duration::from_secs(3600),
            Duration::from_millis(10),
        );
        arbiter.start().await.unwrap();
        let arbiter = Arc::new(arbiter);
        for _ in 0..200 {
            if arbiter.latest_high_res_frame().is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut controller = CaptureController::new();
        controller
            .start(
                Arc::clone(&arbiter),
                Arc::new(crate::detector::NoopDetector),
                db.clone(),
                CaptureConfig {
                    interval: Duration::from_millis(50),
                    photo_dir: dir.path().join("photos"),
                    model_name: None,
                    confidence_threshold: 0.25,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(180)).await;
        controller.stop().await.unwrap();
        arbiter.stop().await;

        // Only the first tick produced a row; the abandoned duplicates must
        // not inflate the session counter past the photos table.
        assert_eq!(db.count_photos().await.unwrap(), 1);
        let session = db.get_session(1).await.unwrap().unwrap();
        assert_eq!(session.photo_count, 1);
    }

    #[test]
    fn staleness_limit_is_twice_the_interval() {
        assert_eq!(
            staleness_limit(Duration::from_secs(10)),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn photo_filename_uses_millisecond_timestamp() {
        let captured_at = DateTime::parse_from_rfc3339("2025-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(photo_filename(captured_at), "photo_20250102_030405_678.jpg");
    }
}
