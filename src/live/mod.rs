//! Live streaming pipeline: a hub of WebSocket viewers fed by one broadcast
//! loop. The detector runs once per frame at a low floor; each distinct
//! viewer threshold gets its own filtered overlay, and each viewer has a
//! single-slot outgoing channel so slow clients drop frames instead of
//! backing up anyone else.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::sync::{watch, RwLock};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::camera::CameraArbiter;
use crate::detector::{Detection, Detector};
use crate::error::Error;

mod encoder;
pub mod protocol;

use encoder::{encode_jpeg, render_overlay};
use protocol::{ClientMessage, FramePayload, ServerMessage, StreamStats};

const LIVE_JPEG_QUALITY: u8 = 85;
/// The broadcast loop detects at this floor and filters per viewer. Viewer
/// thresholds are clamped to the floor, so the filter each viewer sees is
/// exact: nothing below their effective threshold ever existed to filter.
const DETECTION_FLOOR: f32 = 0.05;
const STATS_WINDOW: Duration = Duration::from_secs(1);

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub default_confidence: f32,
    pub max_viewers: usize,
    pub frame_interval: Duration,
}

type PayloadSlot = watch::Receiver<Option<Arc<String>>>;

struct Viewer {
    threshold: f32,
    slot: watch::Sender<Option<Arc<String>>>,
}

/// Registry of connected viewers. Shared by the WebSocket handlers and the
/// broadcast loop.
pub struct LiveHub {
    config: LiveConfig,
    viewers: RwLock<HashMap<Uuid, Viewer>>,
}

impl LiveHub {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            config,
            viewers: RwLock::new(HashMap::new()),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        self.config.frame_interval
    }

    /// Admit a viewer, or refuse with `ConnectionRejected` at capacity.
    pub async fn register(&self) -> crate::error::Result<(Uuid, PayloadSlot)> {
        let mut viewers = self.viewers.write().await;
        if viewers.len() >= self.config.max_viewers {
            return Err(Error::ConnectionRejected {
                limit: self.config.max_viewers,
            });
        }

        let viewer_id = Uuid::new_v4();
        let (slot_tx, slot_rx) = watch::channel(None);
        viewers.insert(
            viewer_id,
            Viewer {
                threshold: self.config.default_confidence.max(DETECTION_FLOOR),
                slot: slot_tx,
            },
        );
        info!("viewer {viewer_id} connected ({} active)", viewers.len());
        Ok((viewer_id, slot_rx))
    }

    pub async fn unregister(&self, viewer_id: Uuid) {
        let mut viewers = self.viewers.write().await;
        if viewers.remove(&viewer_id).is_some() {
            info!("viewer {viewer_id} disconnected ({} active)", viewers.len());
        }
    }

    /// Update one viewer's filter. Delivery is never interrupted. Values
    /// below the detection floor are raised to it.
    pub async fn set_threshold(&self, viewer_id: Uuid, threshold: f32) {
        let threshold = threshold.max(DETECTION_FLOOR);
        let mut viewers = self.viewers.write().await;
        match viewers.get_mut(&viewer_id) {
            Some(viewer) => {
                viewer.threshold = threshold;
                info!("viewer {viewer_id} set confidence threshold to {threshold}");
            }
            None => warn!("threshold update for unknown viewer {viewer_id}"),
        }
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    async fn viewer_thresholds(&self) -> Vec<(Uuid, f32)> {
        self.viewers
            .read()
            .await
            .iter()
            .map(|(id, viewer)| (*id, viewer.threshold))
            .collect()
    }

    async fn deliver(&self, viewer_id: Uuid, payload: Arc<String>) {
        let viewers = self.viewers.read().await;
        if let Some(viewer) = viewers.get(&viewer_id) {
            // Replaces any undelivered frame; latest wins.
            let _ = viewer.slot.send(Some(payload));
        }
    }
}

/// One per process. Reads low-res frames, detects once, fans the result out
/// per distinct viewer threshold.
pub async fn broadcast_loop(
    hub: Arc<LiveHub>,
    arbiter: Arc<CameraArbiter>,
    detector: Arc<dyn Detector>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(hub.frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_frame_at: Option<DateTime<Utc>> = None;
    let mut window_start = Instant::now();
    let mut window_frames: u32 = 0;
    let mut fps: f32 = 0.0;
    let mut detection_total: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if hub.viewer_count().await == 0 {
                    continue;
                }

                let frame = match arbiter.latest_low_res_frame() {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if last_frame_at == Some(frame.captured_at) {
                    continue;
                }
                last_frame_at = Some(frame.captured_at);

                let tick_start = Instant::now();
                let detections = {
                    let detector = Arc::clone(&detector);
                    let frame = Arc::clone(&frame);
                    match tokio::task::spawn_blocking(move || detector.detect(&frame, DETECTION_FLOOR)).await {
                        Ok(Ok(found)) => found,
                        Ok(Err(err)) => {
                            warn!("{}; streaming frame without detections", Error::DetectorFailure(err));
                            Vec::new()
                        }
                        Err(err) => {
                            warn!("detector worker join failed: {err}");
                            Vec::new()
                        }
                    }
                };
                detection_total += detections.len() as u64;

                window_frames += 1;
                if window_start.elapsed() >= STATS_WINDOW {
                    fps = window_frames as f32 / window_start.elapsed().as_secs_f32();
                    window_start = Instant::now();
                    window_frames = 0;
                }

                // Group viewers sharing a threshold so each distinct value is
                // rendered and encoded exactly once.
                let mut groups: HashMap<u32, Vec<Uuid>> = HashMap::new();
                for (viewer_id, threshold) in hub.viewer_thresholds().await {
                    groups.entry(threshold.to_bits()).or_default().push(viewer_id);
                }

                for (threshold_bits, viewer_ids) in groups {
                    let threshold = f32::from_bits(threshold_bits);
                    let filtered: Vec<Detection> = detections
                        .iter()
                        .filter(|d| d.confidence >= threshold)
                        .cloned()
                        .collect();

                    let image = {
                        let frame = Arc::clone(&frame);
                        let filtered = filtered.clone();
                        let encoded = tokio::task::spawn_blocking(move || {
                            let canvas = render_overlay(&frame.pixels, &filtered);
                            encode_jpeg(&canvas, LIVE_JPEG_QUALITY)
                        })
                        .await;
                        match encoded {
                            Ok(Ok(jpeg)) => BASE64.encode(jpeg),
                            Ok(Err(err)) => {
                                warn!("frame encoding failed: {err:?}");
                                continue;
                            }
                            Err(err) => {
                                warn!("frame encoding worker join failed: {err}");
                                continue;
                            }
                        }
                    };

                    let message = ServerMessage::Frame(FramePayload {
                        image,
                        detections: filtered,
                        stats: StreamStats {
                            fps,
                            processing_time_ms: tick_start.elapsed().as_secs_f32() * 1000.0,
                            detection_count: detection_total,
                        },
                        timestamp: frame.captured_at,
                    });

                    let json = match serde_json::to_string(&message) {
                        Ok(json) => Arc::new(json),
                        Err(err) => {
                            warn!("frame payload serialization failed: {err}");
                            continue;
                        }
                    };

                    for viewer_id in viewer_ids {
                        hub.deliver(viewer_id, Arc::clone(&json)).await;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!("live broadcast loop shutting down");
                break;
            }
        }
    }
}

#[derive(Clone)]
struct LiveState {
    hub: Arc<LiveHub>,
}

pub fn router(hub: Arc<LiveHub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(LiveState { hub })
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    listen: std::net::SocketAddr,
    hub: Arc<LiveHub>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind live stream listener on {listen}"))?;
    info!("live stream listening on {listen}");

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await
        .context("live stream server failed")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<LiveState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<LiveHub>) {
    let (viewer_id, mut slot) = match hub.register().await {
        Ok(registered) => registered,
        Err(err) => {
            warn!("viewer rejected: {err}");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while slot.changed().await.is_ok() {
            let payload = slot.borrow_and_update().clone();
            if let Some(json) = payload {
                if sender.send(Message::Text((*json).clone())).await.is_err() {
                    break;
                }
            }
        }
    });

    let recv_hub = Arc::clone(&hub);
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Config(update)) => match update.validated_threshold() {
                        Ok(threshold) => recv_hub.set_threshold(viewer_id, threshold).await,
                        Err(err) => warn!("viewer {viewer_id} sent invalid config: {err}"),
                    },
                    Err(err) => warn!("viewer {viewer_id} sent unparseable message: {err}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(viewer_id).await;
}
