use std::{
    convert::TryFrom,
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;

mod migrations;

use crate::models::{CaptureSession, DetectionRecord, PhotoRecord};
use migrations::run_migrations;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("value {value} is negative"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

/// SQLite access behind a dedicated worker thread that owns the connection.
/// Callers submit closures over a channel and await the reply, so no async
/// task ever blocks on database I/O.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("yard-tracker-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(
                            Err(anyhow::Error::new(err).context("failed to open SQLite database")),
                        );
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    pub async fn insert_photo(&self, photo: &PhotoRecord) -> Result<i64> {
        let record = photo.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO photos (filename, filepath, width, height, captured_at, has_detections, detection_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.filename,
                    record.filepath,
                    record.width,
                    record.height,
                    record.captured_at.to_rfc3339(),
                    record.has_detections,
                    record.detection_count,
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert photo {}", record.filename))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn insert_detection(&self, detection: &DetectionRecord) -> Result<i64> {
        let record = detection.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO detections (photo_id, class_name, confidence, bbox_x, bbox_y, bbox_width, bbox_height, model_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.photo_id,
                    record.class_name,
                    record.confidence,
                    record.bbox_x,
                    record.bbox_y,
                    record.bbox_width,
                    record.bbox_height,
                    record.model_name,
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert detection for photo {}", record.photo_id))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn update_photo_detections(
        &self,
        photo_id: i64,
        detection_count: u32,
    ) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE photos
                 SET has_detections = ?1,
                     detection_count = ?2
                 WHERE id = ?3",
                params![detection_count > 0, detection_count, photo_id],
            )
            .with_context(|| format!("failed to update detections for photo {photo_id}"))?;
            Ok(())
        })
        .await
    }

    pub async fn get_photo(&self, photo_id: i64) -> Result<Option<PhotoRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, filename, filepath, width, height, captured_at, has_detections, detection_count, created_at
                 FROM photos
                 WHERE id = ?1",
            )?;

            let mut rows = stmt.query(params![photo_id])?;
            if let Some(row) = rows.next()? {
                Ok(Some(photo_from_row(row)?))
            } else {
                Ok(None)
            }
        })
        .await
    }

    pub async fn get_detections_for_photo(&self, photo_id: i64) -> Result<Vec<DetectionRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, photo_id, class_name, confidence, bbox_x, bbox_y, bbox_width, bbox_height, model_name, created_at
                 FROM detections
                 WHERE photo_id = ?1
                 ORDER BY confidence DESC",
            )?;

            let mut rows = stmt.query(params![photo_id])?;
            let mut detections = Vec::new();
            while let Some(row) = rows.next()? {
                detections.push(DetectionRecord {
                    id: Some(row.get(0)?),
                    photo_id: row.get(1)?,
                    class_name: row.get(2)?,
                    confidence: row.get(3)?,
                    bbox_x: row.get(4)?,
                    bbox_y: row.get(5)?,
                    bbox_width: row.get(6)?,
                    bbox_height: row.get(7)?,
                    model_name: row.get(8)?,
                    created_at: parse_datetime(&row.get::<_, String>(9)?)?,
                });
            }

            Ok(detections)
        })
        .await
    }

    pub async fn create_session(
        &self,
        started_at: DateTime<Utc>,
        model_name: Option<String>,
        confidence_threshold: f32,
    ) -> Result<i64> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (started_at, model_name, confidence_threshold, photo_count, detection_count)
                 VALUES (?1, ?2, ?3, 0, 0)",
                params![started_at.to_rfc3339(), model_name, confidence_threshold],
            )
            .with_context(|| "failed to insert session")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn update_session_counters(
        &self,
        session_id: i64,
        photo_count: u64,
        detection_count: u64,
    ) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET photo_count = ?1,
                     detection_count = ?2
                 WHERE id = ?3",
                params![to_i64(photo_count)?, to_i64(detection_count)?, session_id],
            )
            .with_context(|| format!("failed to update counters for session {session_id}"))?;
            Ok(())
        })
        .await
    }

    pub async fn end_session(
        &self,
        session_id: i64,
        ended_at: DateTime<Utc>,
        photo_count: u64,
        detection_count: u64,
    ) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET ended_at = ?1,
                     photo_count = ?2,
                     detection_count = ?3
                 WHERE id = ?4",
                params![
                    ended_at.to_rfc3339(),
                    to_i64(photo_count)?,
                    to_i64(detection_count)?,
                    session_id,
                ],
            )
            .with_context(|| format!("failed to end session {session_id}"))?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<CaptureSession>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, ended_at, model_name, confidence_threshold, photo_count, detection_count
                 FROM sessions
                 WHERE id = ?1",
            )?;

            let mut rows = stmt.query(params![session_id])?;
            if let Some(row) = rows.next()? {
                Ok(Some(CaptureSession {
                    id: row.get(0)?,
                    started_at: parse_datetime(&row.get::<_, String>(1)?)?,
                    ended_at: row
                        .get::<_, Option<String>>(2)?
                        .map(|s| parse_datetime(&s))
                        .transpose()?,
                    model_name: row.get(3)?,
                    confidence_threshold: row.get(4)?,
                    photo_count: to_u64(row.get::<_, i64>(5)?)?,
                    detection_count: to_u64(row.get::<_, i64>(6)?)?,
                }))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Close sessions a crashed run left open. Counters already persisted on
    /// the row are kept as the final values.
    pub async fn close_dangling_sessions(&self, ended_at: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE sessions SET ended_at = ?1 WHERE ended_at IS NULL",
                    params![ended_at.to_rfc3339()],
                )
                .with_context(|| "failed to close dangling sessions")?;
            Ok(updated)
        })
        .await
    }

    pub async fn count_photos(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?;
            to_u64(count)
        })
        .await
    }
}

fn photo_from_row(row: &rusqlite::Row<'_>) -> Result<PhotoRecord> {
    Ok(PhotoRecord {
        id: Some(row.get(0)?),
        filename: row.get(1)?,
        filepath: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        captured_at: parse_datetime(&row.get::<_, String>(5)?)?,
        has_detections: row.get(6)?,
        detection_count: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?)?,
    })
}
