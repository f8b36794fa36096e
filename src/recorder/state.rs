//! Recording state management
//!
//! Defines the session state machine, recorder configuration and the
//! summary written when a session closes.

use super::video::VideoFormat;
use crate::capture::{DeviceInfo, SourceConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a recording session
///
/// `Idle -> Starting -> Active -> Stopping -> Closed`, with
/// `Aborting -> Closed` reachable from any state on a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session has been started
    Idle,
    /// Sinks opening, waiting for the first scene frame
    Starting,
    /// Consuming samples
    Active,
    /// Stop requested, draining and closing sinks
    Stopping,
    /// Fatal error, closing sinks best-effort
    Aborting,
    /// Sinks finalized
    Closed,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SessionState {
    /// Whether the session still holds open sinks
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Starting
                | SessionState::Active
                | SessionState::Stopping
                | SessionState::Aborting
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Aborting => "aborting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Longest accepted `stopTimeoutSecs`
pub const MAX_STOP_TIMEOUT_SECS: f64 = 3600.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    /// Directory that receives one subdirectory per session
    pub output_dir: PathBuf,

    /// File name of the data table
    pub table_file: String,

    /// File name of the scene video, without extension
    pub video_stem: String,

    /// Scene video container and codec
    pub video_format: VideoFormat,

    /// Nominal frame rate of the scene video
    pub fps: f64,

    /// Leave out IMU readings further than this from the frame (seconds).
    /// Disabled when unset.
    pub max_imu_staleness_secs: Option<f64>,

    /// Consecutive failed appends tolerated; one more aborts the session
    pub failure_threshold: u32,

    /// Emit a progress event every this many records
    pub progress_interval: u64,

    /// How long `stop` waits for the consumer to finish before giving up
    pub stop_timeout_secs: f64,

    /// Event sent to the device when the session starts
    pub start_event: Option<String>,

    /// Mark the gaze point on recorded scene frames
    pub gaze_overlay: bool,

    /// Device to record from
    pub source: SourceConfig,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            table_file: "eye_data.csv".to_string(),
            video_stem: "scene_output".to_string(),
            video_format: VideoFormat::default(),
            fps: 25.0,
            max_imu_staleness_secs: None,
            failure_threshold: 3,
            progress_interval: 250,
            stop_timeout_secs: 5.0,
            start_event: Some("Experiment Start".to_string()),
            gaze_overlay: true,
            source: SourceConfig::default(),
        }
    }
}

impl RecordingConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fps > 0.0 && self.fps.is_finite()) {
            return Err(ConfigError::Invalid(format!("fps must be positive, got {}", self.fps)));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failureThreshold must be at least 1".to_string()));
        }
        if let Some(limit) = self.max_imu_staleness_secs {
            if !(limit >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "maxImuStalenessSecs must be non-negative, got {limit}"
                )));
            }
        }
        self.stop_timeout()?;
        if self.table_file.is_empty() || self.video_stem.is_empty() {
            return Err(ConfigError::Invalid("output file names must not be empty".to_string()));
        }
        Ok(())
    }

    /// `stopTimeoutSecs` as a duration
    pub fn stop_timeout(&self) -> Result<Duration, ConfigError> {
        let secs = self.stop_timeout_secs;
        if !(secs > 0.0 && secs <= MAX_STOP_TIMEOUT_SECS) {
            return Err(ConfigError::Invalid(format!(
                "stopTimeoutSecs must be in (0, {MAX_STOP_TIMEOUT_SECS}], got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|e| ConfigError::Invalid(format!("stopTimeoutSecs {secs}: {e}")))
    }
}

/// Counters for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Records appended with every modality intact
    pub records_written: u64,

    /// Records where one modality failed
    pub records_degraded: u64,

    /// Samples discarded by the demultiplexer
    pub samples_dropped: u64,

    /// Scene frames rejected for not advancing in time
    pub frames_out_of_order: u64,

    pub imu_received: u64,
    pub imu_rejected_stale: u64,
}

/// Result of a completed recording, also written as `session.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub session_id: Uuid,

    /// Directory holding the session's files
    pub session_dir: PathBuf,

    /// Identifier of the device-side recording, if the device made one
    pub remote_recording_id: Option<String>,

    pub device: DeviceInfo,

    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,

    /// Wall-clock duration in seconds
    pub duration_secs: f64,

    /// Set when the session aborted
    pub abort_reason: Option<String>,

    pub stats: SessionStats,

    /// Files created by the session
    pub output_files: Vec<PathBuf>,
}

impl RecordingSummary {
    pub fn aborted(&self) -> bool {
        self.abort_reason.is_some()
    }
}
