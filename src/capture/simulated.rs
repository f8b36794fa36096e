//! Simulated headset
//!
//! Produces a deterministic scene camera, gaze and IMU feed so the recorder
//! can run without hardware. Scene frames and IMU readings run on separate
//! clocks and are merged into a single arrival-ordered stream.

use super::traits::{
    ConnectError, DeviceInfo, GazeSample, ImuSample, PrimaryPair, Quaternion, Resolution, Sample,
    SampleSource, SourceError, Timestamp, Vector3, VideoSample,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Configuration for the simulated headset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatedConfig {
    /// Scene camera rate in Hz
    pub scene_rate_hz: f64,

    /// IMU rate in Hz
    pub imu_rate_hz: f64,

    /// Scene frame width in pixels
    pub width: u32,

    /// Scene frame height in pixels
    pub height: u32,

    /// Drop the gaze estimate on every Nth frame
    pub gaze_dropout_every: Option<u32>,

    /// End the stream after this many scene frames
    pub max_frames: Option<u64>,

    /// Pace samples against the wall clock
    pub realtime: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            scene_rate_hz: 30.0,
            imu_rate_hz: 110.0,
            width: 320,
            height: 240,
            gaze_dropout_every: Some(10),
            max_frames: None,
            realtime: true,
        }
    }
}

/// Simulated headset streaming synthetic samples
pub struct SimulatedDevice {
    config: SimulatedConfig,
    resolution: Resolution,
    /// Hardware clock value at connect time
    epoch: f64,
    started: Instant,
    frames_emitted: u64,
    imu_emitted: u64,
    recording_id: Option<String>,
}

impl SimulatedDevice {
    /// Validate the configuration and return a ready device
    pub fn connect(config: SimulatedConfig) -> Result<Self, ConnectError> {
        if !(config.scene_rate_hz > 0.0) || !(config.imu_rate_hz > 0.0) {
            return Err(ConnectError::InvalidConfig(format!(
                "sample rates must be positive (scene {} Hz, imu {} Hz)",
                config.scene_rate_hz, config.imu_rate_hz
            )));
        }
        if config.width == 0 || config.height == 0 {
            return Err(ConnectError::InvalidConfig(format!(
                "invalid scene resolution {}x{}",
                config.width, config.height
            )));
        }

        let resolution = Resolution::new(config.width, config.height);
        let epoch = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;

        tracing::info!(
            "Simulated headset ready: scene {} @ {}Hz, imu @ {}Hz",
            resolution,
            config.scene_rate_hz,
            config.imu_rate_hz
        );

        Ok(Self {
            config,
            resolution,
            epoch,
            started: Instant::now(),
            frames_emitted: 0,
            imu_emitted: 0,
            recording_id: None,
        })
    }

    fn next_frame_offset(&self) -> f64 {
        self.frames_emitted as f64 / self.config.scene_rate_hz
    }

    fn next_imu_offset(&self) -> f64 {
        self.imu_emitted as f64 / self.config.imu_rate_hz
    }

    fn frames_exhausted(&self) -> bool {
        self.config
            .max_frames
            .is_some_and(|max| self.frames_emitted >= max)
    }

    fn wait_until(&self, offset: f64) {
        if !self.config.realtime {
            return;
        }
        let due = self.started + Duration::from_secs_f64(offset);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }

    fn make_primary(&mut self, offset: f64) -> PrimaryPair {
        let index = self.frames_emitted;
        self.frames_emitted += 1;

        let timestamp = Timestamp::now(self.epoch + offset);
        let pixels = gradient_frame(self.resolution, index);
        let video = VideoSample::new(timestamp, pixels, self.resolution);

        let dropped = self
            .config
            .gaze_dropout_every
            .is_some_and(|n| n > 0 && index % n as u64 == n as u64 - 1);
        let gaze = (!dropped).then(|| {
            let w = self.resolution.width as f64;
            let h = self.resolution.height as f64;
            GazeSample {
                timestamp,
                x: w / 2.0 + w / 4.0 * offset.cos(),
                y: h / 2.0 + h / 4.0 * offset.sin(),
                pupil_diameter_left: 3.5 + 0.2 * (offset * 0.5).sin(),
                pupil_diameter_right: 3.6 + 0.2 * (offset * 0.5).sin(),
            }
        });

        PrimaryPair { video, gaze }
    }

    fn make_imu(&mut self, offset: f64) -> ImuSample {
        self.imu_emitted += 1;

        // Slow yaw about the vertical axis
        let yaw_rate = 0.5;
        let half = yaw_rate * offset / 2.0;
        ImuSample {
            timestamp: Timestamp::now(self.epoch + offset),
            quaternion: Quaternion {
                x: 0.0,
                y: 0.0,
                z: half.sin(),
                w: half.cos(),
            },
            accel: Vector3 {
                x: 0.0,
                y: 0.0,
                z: 1.0,
            },
            gyro: Vector3 {
                x: 0.0,
                y: 0.0,
                z: yaw_rate.to_degrees(),
            },
        }
    }
}

impl SampleSource for SimulatedDevice {
    fn next_sample(&mut self) -> Result<Sample, SourceError> {
        let frame_at = self.next_frame_offset();
        let imu_at = self.next_imu_offset();

        if self.frames_exhausted() {
            return Err(SourceError::Exhausted);
        }

        if imu_at < frame_at {
            self.wait_until(imu_at);
            Ok(Sample::Imu(self.make_imu(imu_at)))
        } else {
            self.wait_until(frame_at);
            Ok(Sample::Primary(self.make_primary(frame_at)))
        }
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "Simulated headset".to_string(),
            address: None,
            serial: Some("SIM-0000".to_string()),
            battery_percent: Some(100),
            free_storage_bytes: None,
        }
    }

    fn begin_capture(&mut self) -> Result<Option<String>, SourceError> {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!("Simulated headset recording started: {}", id);
        self.recording_id = Some(id.clone());
        Ok(Some(id))
    }

    fn send_event(&mut self, name: &str) -> Result<(), SourceError> {
        tracing::debug!("Simulated headset event: {}", name);
        Ok(())
    }

    fn end_capture(&mut self) -> Result<(), SourceError> {
        if let Some(id) = self.recording_id.take() {
            tracing::info!("Simulated headset recording saved: {}", id);
        }
        Ok(())
    }
}

/// Diagonal BGR gradient that scrolls with the frame index
fn gradient_frame(resolution: Resolution, index: u64) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(resolution.bgr_frame_len());
    let shift = (index % 256) as u32;
    for y in 0..resolution.height {
        for x in 0..resolution.width {
            pixels.push(((x + shift) % 256) as u8);
            pixels.push(((y + shift) % 256) as u8);
            pixels.push(((x + y) % 256) as u8);
        }
    }
    pixels
}
