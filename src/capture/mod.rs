//! Periodic high-res capture pipeline: grab the latest frame, detect,
//! persist the JPEG and its rows, advance session counters.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::camera::CameraArbiter;
use crate::db::Database;
use crate::detector::Detector;

mod loop_worker;

use loop_worker::capture_loop;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interval: Duration,
    pub photo_dir: PathBuf,
    pub model_name: Option<String>,
    pub confidence_threshold: f32,
}

pub struct CaptureController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub async fn start(
        &mut self,
        arbiter: Arc<CameraArbiter>,
        detector: Arc<dyn Detector>,
        db: Database,
        config: CaptureConfig,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("capture already active");
        }

        std::fs::create_dir_all(&config.photo_dir).with_context(|| {
            format!("failed to create photo directory {}", config.photo_dir.display())
        })?;

        // A missing session row degrades bookkeeping, not capture itself.
        let session_id = match db
            .create_session(
                Utc::now(),
                config.model_name.clone(),
                config.confidence_threshold,
            )
            .await
        {
            Ok(id) => {
                info!("capture session {id} started");
                Some(id)
            }
            Err(err) => {
                warn!("failed to create session row, capturing without one: {err:?}");
                None
            }
        };

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            arbiter,
            detector,
            db,
            config,
            session_id,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancel the loop and wait for it to close the session.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("capture loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new()
    }
}
