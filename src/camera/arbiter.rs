use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::{Frame, FrameSource, ResolutionTier};

/// High-res cadence, sized for the periodic capture pipeline.
pub const HIGH_RES_INTERVAL: Duration = Duration::from_millis(1000);
/// Low-res cadence, sized for the live stream.
pub const LOW_RES_INTERVAL: Duration = Duration::from_millis(100);

type FrameSlot = watch::Sender<Option<Arc<Frame>>>;

/// Sole owner of the camera device. Two acquisition loops (one per tier)
/// share the `FrameSource` under a short-lived mutex and publish frames into
/// watch slots; readers only ever touch the slots.
pub struct CameraArbiter {
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    high_tx: FrameSlot,
    high_rx: watch::Receiver<Option<Arc<Frame>>>,
    low_tx: FrameSlot,
    low_rx: watch::Receiver<Option<Arc<Frame>>>,
    high_interval: Duration,
    low_interval: Duration,
    cancel_token: CancellationToken,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started: bool,
}

impl CameraArbiter {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self::with_intervals(source, HIGH_RES_INTERVAL, LOW_RES_INTERVAL)
    }

    pub fn with_intervals(
        source: Box<dyn FrameSource>,
        high_interval: Duration,
        low_interval: Duration,
    ) -> Self {
        let (high_tx, high_rx) = watch::channel(None);
        let (low_tx, low_rx) = watch::channel(None);
        Self {
            source: Arc::new(Mutex::new(source)),
            high_tx,
            high_rx,
            low_tx,
            low_rx,
            high_interval,
            low_interval,
            cancel_token: CancellationToken::new(),
            handles: tokio::sync::Mutex::new(Vec::new()),
            started: false,
        }
    }

    /// Open the device and spawn the acquisition loops. A failure to open is
    /// fatal to the caller; no loops are spawned in that case.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::DeviceUnavailable(
                "device already opened by this arbiter".into(),
            ));
        }

        let open_source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || lock_source(&open_source).open())
            .await
            .map_err(|err| Error::DeviceUnavailable(format!("device open worker failed: {err}")))??;
        self.started = true;

        let mut handles = self.handles.lock().await;
        for (tier, interval, tx) in [
            (ResolutionTier::High, self.high_interval, self.high_tx.clone()),
            (ResolutionTier::Low, self.low_interval, self.low_tx.clone()),
        ] {
            handles.push(tokio::spawn(acquisition_loop(
                Arc::clone(&self.source),
                tier,
                interval,
                tx,
                self.cancel_token.clone(),
            )));
        }

        info!(
            "camera arbiter started (high {}ms, low {}ms)",
            self.high_interval.as_millis(),
            self.low_interval.as_millis()
        );
        Ok(())
    }

    /// Most recent high-res frame, without blocking. `Stopped` until the
    /// first frame lands; after `stop()` the last frame remains readable.
    pub fn latest_high_res_frame(&self) -> Result<Arc<Frame>> {
        self.high_rx.borrow().clone().ok_or(Error::Stopped)
    }

    pub fn latest_low_res_frame(&self) -> Result<Arc<Frame>> {
        self.low_rx.borrow().clone().ok_or(Error::Stopped)
    }

    /// Cancel the acquisition loops, join them, and release the device.
    /// Idempotent; concurrent readers are unaffected.
    pub async fn stop(&self) {
        self.cancel_token.cancel();

        let mut handles = self.handles.lock().await;
        let was_running = !handles.is_empty();
        for handle in handles.drain(..) {
            if let Err(err) = handle.await {
                warn!("acquisition loop join failed: {err}");
            }
        }
        drop(handles);

        if was_running {
            let close_source = Arc::clone(&self.source);
            let closed = tokio::task::spawn_blocking(move || lock_source(&close_source).close());
            if let Err(err) = closed.await {
                warn!("device close worker failed: {err}");
            }
            info!("camera arbiter stopped");
        }
    }
}

fn lock_source(
    source: &Arc<Mutex<Box<dyn FrameSource>>>,
) -> std::sync::MutexGuard<'_, Box<dyn FrameSource>> {
    match source.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn acquisition_loop(
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    tier: ResolutionTier,
    interval: Duration,
    tx: FrameSlot,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let grab_source = Arc::clone(&source);
                match tokio::task::spawn_blocking(move || lock_source(&grab_source).grab(tier)).await {
                    Ok(Ok(pixels)) => {
                        let frame = Arc::new(Frame {
                            pixels,
                            tier,
                            captured_at: Utc::now(),
                        });
                        // Swaps the slot; the previous frame stays alive only
                        // for readers still holding their Arc.
                        let _ = tx.send(Some(frame));
                    }
                    Ok(Err(err)) => {
                        warn!("{}-res frame grab failed: {err}", tier.as_str());
                    }
                    Err(err) => {
                        warn!("{}-res grab worker join failed: {err}", tier.as_str());
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!("{}-res acquisition loop shutting down", tier.as_str());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticSource;

    fn test_arbiter() -> CameraArbiter {
        CameraArbiter::with_intervals(
            Box::new(SyntheticSource::with_dimensions((16, 12), (8, 6))),
            Duration::from_millis(10),
            Duration::from_millis(5),
        )
    }

    async fn wait_for_frames(arbiter: &CameraArbiter) {
        for _ in 0..200 {
            if arbiter.latest_high_res_frame().is_ok() && arbiter.latest_low_res_frame().is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no frames produced within the deadline");
    }

    #[tokio::test]
    async fn busy_device_fails_start_and_spawns_nothing() {
        let mut arbiter = CameraArbiter::new(Box::new(SyntheticSource::busy()));
        assert!(matches!(
            arbiter.start().await,
            Err(Error::DeviceUnavailable(_))
        ));

        assert!(matches!(arbiter.latest_high_res_frame(), Err(Error::Stopped)));
        assert!(matches!(arbiter.latest_low_res_frame(), Err(Error::Stopped)));

        // Stop on a never-started arbiter is a no-op.
        arbiter.stop().await;
    }

    #[tokio::test]
    async fn frames_flow_on_both_tiers() {
        let mut arbiter = test_arbiter();
        arbiter.start().await.unwrap();
        wait_for_frames(&arbiter).await;

        let high = arbiter.latest_high_res_frame().unwrap();
        assert_eq!(high.tier, ResolutionTier::High);
        assert_eq!((high.width(), high.height()), (16, 12));

        let low = arbiter.latest_low_res_frame().unwrap();
        assert_eq!(low.tier, ResolutionTier::Low);
        assert_eq!((low.width(), low.height()), (8, 6));

        arbiter.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_keeps_last_frame_readable() {
        let mut arbiter = test_arbiter();
        arbiter.start().await.unwrap();
        wait_for_frames(&arbiter).await;

        arbiter.stop().await;
        let after_first = arbiter.latest_low_res_frame().unwrap();

        arbiter.stop().await;
        let after_second = arbiter.latest_low_res_frame().unwrap();
        assert_eq!(after_first.captured_at, after_second.captured_at);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mut arbiter = test_arbiter();
        arbiter.start().await.unwrap();
        assert!(matches!(
            arbiter.start().await,
            Err(Error::DeviceUnavailable(_))
        ));
        arbiter.stop().await;
    }
}
