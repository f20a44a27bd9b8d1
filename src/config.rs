use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::time::Duration;

/// Command-line configuration. Validated once at startup; nothing here is
/// hot-reloadable except the per-viewer confidence override.
#[derive(Debug, Clone, Parser)]
#[command(name = "yard-tracker", about = "Shared-camera yard tracker")]
pub struct Config {
    /// Directory for captured photos.
    #[arg(long, default_value = "data/photos")]
    pub photo_dir: PathBuf,

    /// SQLite database path.
    #[arg(long, default_value = "data/yard_tracker.sqlite3")]
    pub db_path: PathBuf,

    /// Seconds between photo captures.
    #[arg(long, default_value_t = 10)]
    pub capture_interval_secs: u64,

    /// Photos older than this are deleted by the retention sweeper.
    #[arg(long, default_value_t = 3600)]
    pub retention_max_age_secs: u64,

    /// Seconds between retention sweeps.
    #[arg(long, default_value_t = 300)]
    pub sweep_interval_secs: u64,

    /// Default detection confidence threshold, in [0, 1].
    #[arg(long, default_value_t = 0.25, allow_negative_numbers = true)]
    pub confidence: f32,

    /// Detection model label recorded with sessions and detections.
    #[arg(long)]
    pub model: Option<String>,

    /// Address for the live stream server.
    #[arg(long, default_value = "0.0.0.0:8001")]
    pub listen: SocketAddr,

    /// Maximum simultaneous live viewers.
    #[arg(long, default_value_t = 8)]
    pub max_viewers: usize,

    /// Run without the capture pipeline (live stream only).
    #[arg(long)]
    pub no_capture: bool,

    /// Run without the live stream (capture only).
    #[arg(long, conflicts_with = "no_capture")]
    pub capture_only: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            bail!(
                "--confidence must be in [0.0, 1.0], got {}",
                self.confidence
            );
        }
        if self.capture_interval_secs == 0 {
            bail!("--capture-interval-secs must be at least 1");
        }
        if self.retention_max_age_secs == 0 {
            bail!("--retention-max-age-secs must be at least 1");
        }
        if self.sweep_interval_secs == 0 {
            bail!("--sweep-interval-secs must be at least 1");
        }
        if self.max_viewers == 0 {
            bail!("--max-viewers must be at least 1");
        }
        Ok(())
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs(self.capture_interval_secs)
    }

    pub fn retention_max_age(&self) -> Duration {
        Duration::from_secs(self.retention_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("yard-tracker").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert_eq!(config.capture_interval(), Duration::from_secs(10));
        assert_eq!(config.retention_max_age(), Duration::from_secs(3600));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.max_viewers, 8);
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        assert!(parse(&["--confidence", "1.5"]).validate().is_err());
        assert!(parse(&["--confidence", "-0.1"]).validate().is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(parse(&["--capture-interval-secs", "0"]).validate().is_err());
        assert!(parse(&["--sweep-interval-secs", "0"]).validate().is_err());
    }

    #[test]
    fn capture_only_and_no_capture_conflict() {
        let result = Config::try_parse_from(["yard-tracker", "--no-capture", "--capture-only"]);
        assert!(result.is_err());
    }
}
