pub mod camera;
pub mod capture;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod live;
pub mod models;
pub mod retention;

pub use config::Config;
pub use error::{Error, Result};

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use camera::{CameraArbiter, FrameSource, SyntheticSource};
use capture::{CaptureConfig, CaptureController};
use db::Database;
use detector::{Detector, NoopDetector};
use live::{broadcast_loop, LiveConfig, LiveHub};
use retention::{RetentionPolicy, RetentionSweeper};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("yard tracker starting up...");
    config.validate()?;

    std::fs::create_dir_all(&config.photo_dir).with_context(|| {
        format!("failed to create photo directory {}", config.photo_dir.display())
    })?;

    let database = Database::new(config.db_path.clone())?;

    // Close sessions that were still open when the last run died.
    let recovered = database.close_dangling_sessions(Utc::now()).await?;
    if recovered > 0 {
        warn!("closed {recovered} dangling sessions from a previous run");
    }

    // Hardware cameras plug in behind FrameSource; the synthetic source
    // keeps the service runnable without a device.
    let source: Box<dyn FrameSource> = Box::new(SyntheticSource::new());
    let mut arbiter = CameraArbiter::new(source);
    arbiter
        .start()
        .await
        .context("camera startup failed; refusing to run without a device")?;
    let arbiter = Arc::new(arbiter);

    // Model inference is provided externally; the no-op detector stands in
    // until a backend is wired to the seam.
    let detector: Arc<dyn Detector> = Arc::new(NoopDetector);

    let shutdown = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let mut capture_controller = CaptureController::new();
    if config.no_capture {
        info!("capture pipeline disabled (--no-capture)");
    } else {
        capture_controller
            .start(
                Arc::clone(&arbiter),
                Arc::clone(&detector),
                database.clone(),
                CaptureConfig {
                    interval: config.capture_interval(),
                    photo_dir: config.photo_dir.clone(),
                    model_name: config.model.clone(),
                    confidence_threshold: config.confidence,
                },
            )
            .await?;
    }

    if config.capture_only {
        info!("live stream disabled (--capture-only)");
    } else {
        let hub = Arc::new(LiveHub::new(LiveConfig {
            default_confidence: config.confidence,
            max_viewers: config.max_viewers,
            frame_interval: live::DEFAULT_FRAME_INTERVAL,
        }));

        background.push(tokio::spawn(broadcast_loop(
            Arc::clone(&hub),
            Arc::clone(&arbiter),
            Arc::clone(&detector),
            shutdown.child_token(),
        )));

        let listen = config.listen;
        let server_token = shutdown.child_token();
        background.push(tokio::spawn(async move {
            if let Err(err) = live::serve(listen, hub, server_token).await {
                error!("live stream server exited: {err:?}");
            }
        }));
    }

    let sweeper = Arc::new(RetentionSweeper::new(
        config.photo_dir.clone(),
        RetentionPolicy {
            max_age: config.retention_max_age(),
            sweep_interval: config.sweep_interval(),
        },
    ));
    background.push(tokio::spawn(sweeper.run(shutdown.child_token())));

    info!("yard tracker running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Consumers stop first; the arbiter goes last so in-flight ticks can
    // still read their frame.
    shutdown.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, capture_controller.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("capture shutdown failed: {err:?}"),
        Err(_) => warn!("capture loop did not stop within the grace period"),
    }

    for handle in background {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("background task join failed: {err}"),
            Err(_) => warn!("background task did not stop within the grace period"),
        }
    }

    arbiter.stop().await;
    info!("shutdown complete");
    Ok(())
}
