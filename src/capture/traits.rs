//! Sample and source definitions
//!
//! Typed samples delivered by an eye-tracking headset and the trait the
//! recording pipeline pulls them through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capture instant of a sample
///
/// `hardware` is in the device clock domain and is the only value used for
/// ordering. `host` is the wall-clock instant the sample reached this
/// process and is kept for auditing.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    /// Seconds in the capturing device's clock
    pub hardware: f64,

    /// Host wall-clock receive time
    pub host: DateTime<Utc>,
}

impl Timestamp {
    /// Stamp a hardware time with the current host clock
    pub fn now(hardware: f64) -> Self {
        Self {
            hardware,
            host: Utc::now(),
        }
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte length of one BGR24 frame at this resolution
    pub fn bgr_frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One scene camera frame with packed BGR24 pixels
#[derive(Debug)]
pub struct VideoSample {
    pub timestamp: Timestamp,
    pub pixels: Vec<u8>,
    pub resolution: Resolution,
}

impl VideoSample {
    pub fn new(timestamp: Timestamp, pixels: Vec<u8>, resolution: Resolution) -> Self {
        Self {
            timestamp,
            pixels,
            resolution,
        }
    }

    /// Whether the pixel buffer length agrees with the declared resolution
    pub fn is_well_formed(&self) -> bool {
        self.pixels.len() == self.resolution.bgr_frame_len()
    }
}

/// Gaze point in scene camera pixel coordinates
#[derive(Debug, Clone, Copy)]
pub struct GazeSample {
    pub timestamp: Timestamp,

    /// Horizontal position in scene pixels
    pub x: f64,

    /// Vertical position in scene pixels
    pub y: f64,

    /// Left pupil diameter in millimetres
    pub pupil_diameter_left: f64,

    /// Right pupil diameter in millimetres
    pub pupil_diameter_right: f64,
}

/// Orientation quaternion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Inertial measurement unit reading
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub timestamp: Timestamp,

    /// Head orientation
    pub quaternion: Quaternion,

    /// Linear acceleration
    pub accel: Vector3,

    /// Angular rate
    pub gyro: Vector3,
}

/// Scene frame delivered together with its matched gaze point
///
/// The gaze is absent when the tracker had no valid estimate for the frame.
#[derive(Debug)]
pub struct PrimaryPair {
    pub video: VideoSample,
    pub gaze: Option<GazeSample>,
}

/// Anything a source can hand out; the kind is not known until received
#[derive(Debug)]
pub enum Sample {
    /// Scene frame plus matched gaze
    Primary(PrimaryPair),
    /// Inertial reading
    Imu(ImuSample),
    /// Packet the pipeline has no use for (firmware extras, new message types)
    Unrecognized { kind: String },
}

impl Sample {
    /// Short name of the sample kind for logs
    pub fn kind(&self) -> &str {
        match self {
            Sample::Primary(_) => "scene+gaze",
            Sample::Imu(_) => "imu",
            Sample::Unrecognized { kind } => kind,
        }
    }
}

/// Descriptive information about the connected device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device name
    pub name: String,

    /// Network address the device was reached at (if any)
    pub address: Option<String>,

    /// Glasses serial number
    pub serial: Option<String>,

    /// Battery charge in percent
    pub battery_percent: Option<u8>,

    /// Free storage on the companion device in bytes
    pub free_storage_bytes: Option<u64>,
}

/// Transport-level failures while receiving samples
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source disconnected: {0}")]
    Disconnected(String),

    #[error("Source stream ended")]
    Exhausted,
}

impl SourceError {
    /// Whether the error ends the stream without signalling a fault
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, SourceError::Exhausted)
    }
}

/// Failures producing a ready source handle
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No device found: {0}")]
    NotFound(String),

    #[error("Invalid source configuration: {0}")]
    InvalidConfig(String),
}

/// A connected device streaming scene frames, gaze and IMU data
///
/// `next_sample` blocks until the next sample of any kind arrives and
/// returns samples in arrival order. `try_next_imu` never blocks; sources
/// that deliver IMU data on a separate channel hand it out here, others
/// keep the default.
pub trait SampleSource: Send {
    /// Block until the next sample arrives
    fn next_sample(&mut self) -> Result<Sample, SourceError>;

    /// Return an already-received IMU sample, if any, without blocking
    fn try_next_imu(&mut self) -> Result<Option<Sample>, SourceError> {
        Ok(None)
    }

    /// Describe the connected device
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::default()
    }

    /// Start device-side recording, returning its identifier if it has one
    fn begin_capture(&mut self) -> Result<Option<String>, SourceError> {
        Ok(None)
    }

    /// Annotate the device-side recording with a named event
    fn send_event(&mut self, _name: &str) -> Result<(), SourceError> {
        Ok(())
    }

    /// Stop and save device-side recording
    fn end_capture(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
