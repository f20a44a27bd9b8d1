//! Time-based photo retention. Deletes aged-out JPEG files from the photo
//! directory; database rows are out of its jurisdiction.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

impl RetentionPolicy {
    /// Deletion cutoff. Files must out-age the policy by one extra sweep
    /// interval, so a freshly written file can never be swept through clock
    /// skew or a slow sweep.
    pub fn cutoff_age(&self) -> Duration {
        self.max_age + self.sweep_interval
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub deleted: usize,
    pub freed_bytes: u64,
    /// Files that vanished mid-sweep (deleted by someone else).
    pub skipped: usize,
}

pub struct RetentionSweeper {
    photo_dir: PathBuf,
    policy: RetentionPolicy,
    sweeping: AtomicBool,
}

impl RetentionSweeper {
    pub fn new(photo_dir: PathBuf, policy: RetentionPolicy) -> Self {
        Self {
            photo_dir,
            policy,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Sweep on every interval tick. An overlapping tick is skipped, never
    /// queued; shutdown lets the in-flight sweep finish.
    pub async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut inflight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.sweeping.swap(true, Ordering::SeqCst) {
                        warn!("{}", Error::SweepConflict);
                        continue;
                    }

                    let sweeper = Arc::clone(&self);
                    inflight = Some(tokio::task::spawn_blocking(move || {
                        match sweeper.sweep() {
                            Ok(outcome) if outcome.deleted > 0 => info!(
                                "retention sweep deleted {} files ({:.2} MB freed)",
                                outcome.deleted,
                                outcome.freed_bytes as f64 / (1024.0 * 1024.0)
                            ),
                            Ok(_) => debug!("retention sweep found nothing to delete"),
                            Err(err) => warn!("retention sweep failed: {err}"),
                        }
                        sweeper.sweeping.store(false, Ordering::SeqCst);
                    }));
                }
                _ = cancel_token.cancelled() => {
                    info!("retention sweeper shutting down");
                    break;
                }
            }
        }

        if let Some(handle) = inflight {
            if let Err(err) = handle.await {
                warn!("sweep worker join failed: {err}");
            }
        }
    }

    /// One pass over `*.jpg` files directly in the photo directory. Age is
    /// measured from the file's mtime.
    pub fn sweep(&self) -> std::io::Result<SweepOutcome> {
        let cutoff = self.policy.cutoff_age();
        let now = SystemTime::now();
        let mut outcome = SweepOutcome::default();

        for entry in std::fs::read_dir(&self.photo_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("unreadable directory entry: {err}");
                    continue;
                }
            };

            let path = entry.path();
            if path.extension() != Some(std::ffi::OsStr::new("jpg")) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(_) => {
                    outcome.skipped += 1;
                    continue;
                }
            };

            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(err) => {
                    warn!("no mtime for {}: {err}", path.display());
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= cutoff {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    outcome.deleted += 1;
                    outcome.freed_bytes += metadata.len();
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    outcome.skipped += 1;
                }
                Err(err) => warn!("failed to delete {}: {err}", path.display()),
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::PhotoRecord;
    use chrono::Utc;
    use tempfile::TempDir;

    fn write_photo(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"jpeg bytes").unwrap();
        path
    }

    fn sweeper(dir: &TempDir, max_age: Duration, sweep_interval: Duration) -> RetentionSweeper {
        RetentionSweeper::new(
            dir.path().to_path_buf(),
            RetentionPolicy {
                max_age,
                sweep_interval,
            },
        )
    }

    #[test]
    fn fresh_files_survive() {
        let dir = TempDir::new().unwrap();
        let path = write_photo(&dir, "photo_fresh.jpg");

        let outcome = sweeper(&dir, Duration::from_secs(3600), Duration::from_secs(300))
            .sweep()
            .unwrap();
        assert_eq!(outcome.deleted, 0);
        assert!(path.exists());
    }

    #[test]
    fn aged_out_files_are_deleted() {
        let dir = TempDir::new().unwrap();
        let path = write_photo(&dir, "photo_old.jpg");
        std::thread::sleep(Duration::from_millis(50));

        let outcome = sweeper(&dir, Duration::from_millis(10), Duration::ZERO)
            .sweep()
            .unwrap();
        assert_eq!(outcome.deleted, 1);
        assert!(outcome.freed_bytes > 0);
        assert!(!path.exists());
    }

    #[test]
    fn grace_margin_protects_files_past_max_age() {
        let dir = TempDir::new().unwrap();
        let path = write_photo(&dir, "photo_in_grace.jpg");
        std::thread::sleep(Duration::from_millis(50));

        // Older than max_age, but inside max_age + sweep_interval.
        let outcome = sweeper(&dir, Duration::from_millis(10), Duration::from_secs(60))
            .sweep()
            .unwrap();
        assert_eq!(outcome.deleted, 0);
        assert!(path.exists());
    }

    #[test]
    fn non_jpg_files_and_subdirectories_are_untouched() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, b"keep me").unwrap();
        let subdir = dir.path().join("archive");
        std::fs::create_dir(&subdir).unwrap();
        let nested = subdir.join("photo_nested.jpg");
        std::fs::write(&nested, b"nested").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let outcome = sweeper(&dir, Duration::ZERO, Duration::ZERO).sweep().unwrap();
        assert_eq!(outcome.deleted, 0);
        assert!(notes.exists());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn deleted_photo_rows_remain_queryable() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("test.sqlite3")).unwrap();

        let path = write_photo(&dir, "photo_old.jpg");
        let photo_id = db
            .insert_photo(&PhotoRecord {
                id: None,
                filename: "photo_old.jpg".to_string(),
                filepath: path.to_string_lossy().into_owned(),
                width: 1920,
                height: 1080,
                captured_at: Utc::now(),
                has_detections: false,
                detection_count: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let outcome = sweeper(&dir, Duration::from_millis(10), Duration::ZERO)
            .sweep()
            .unwrap();
        assert_eq!(outcome.deleted, 1);
        assert!(!path.exists());

        let photo = db.get_photo(photo_id).await.unwrap();
        assert!(photo.is_some(), "row must outlive the file");
    }
}
