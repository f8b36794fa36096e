//! Scripted sample source
//!
//! Replays a fixed, arrival-ordered list of samples. Used to drive the
//! pipeline deterministically and to reproduce captured sequences.

use super::traits::{
    DeviceInfo, GazeSample, ImuSample, PrimaryPair, Quaternion, Resolution, Sample, SampleSource,
    SourceError, Timestamp, Vector3, VideoSample,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Resolution of frames generated by [`ScriptedSource::primary`]
const SCRIPTED_RESOLUTION: Resolution = Resolution {
    width: 4,
    height: 2,
};

/// How the script ends once every sample has been handed out
#[derive(Debug, Clone)]
pub enum ScriptEnd {
    /// Report a graceful end of stream
    Exhausted,
    /// Report a transport failure
    Disconnect(String),
}

/// Source that hands out a prepared sequence of samples
pub struct ScriptedSource {
    stream: VecDeque<Sample>,
    imu_channel: VecDeque<Sample>,
    end: ScriptEnd,
    hooks: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            stream: VecDeque::new(),
            imu_channel: VecDeque::new(),
            end: ScriptEnd::Exhausted,
            hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append a scene frame at `t`, with a gaze point when `with_gaze` is set
    pub fn primary(mut self, t: f64, with_gaze: bool) -> Self {
        let pair = PrimaryPair {
            video: scripted_frame(t, SCRIPTED_RESOLUTION),
            gaze: with_gaze.then(|| scripted_gaze(t)),
        };
        self.stream.push_back(Sample::Primary(pair));
        self
    }

    /// Append an IMU reading at `t` to the main stream
    pub fn imu(mut self, t: f64) -> Self {
        self.stream.push_back(Sample::Imu(scripted_imu(t)));
        self
    }

    /// Queue an IMU reading on the polled side channel
    pub fn polled_imu(mut self, t: f64) -> Self {
        self.imu_channel.push_back(Sample::Imu(scripted_imu(t)));
        self
    }

    /// Append a packet of a kind the pipeline does not know
    pub fn unrecognized(mut self, kind: &str) -> Self {
        self.stream.push_back(Sample::Unrecognized {
            kind: kind.to_string(),
        });
        self
    }

    /// Fail with a transport error once the script runs out
    pub fn then_disconnect(mut self, reason: &str) -> Self {
        self.end = ScriptEnd::Disconnect(reason.to_string());
        self
    }

    /// Log of lifecycle hook calls (`begin`, `event:<name>`, `end`)
    pub fn hook_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.hooks.clone()
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for ScriptedSource {
    fn next_sample(&mut self) -> Result<Sample, SourceError> {
        match self.stream.pop_front() {
            Some(sample) => Ok(sample),
            None => match &self.end {
                ScriptEnd::Exhausted => Err(SourceError::Exhausted),
                ScriptEnd::Disconnect(reason) => Err(SourceError::Disconnected(reason.clone())),
            },
        }
    }

    fn try_next_imu(&mut self) -> Result<Option<Sample>, SourceError> {
        Ok(self.imu_channel.pop_front())
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "scripted".to_string(),
            ..DeviceInfo::default()
        }
    }

    fn begin_capture(&mut self) -> Result<Option<String>, SourceError> {
        self.hooks.lock().push("begin".to_string());
        Ok(Some("scripted-recording".to_string()))
    }

    fn send_event(&mut self, name: &str) -> Result<(), SourceError> {
        self.hooks.lock().push(format!("event:{name}"));
        Ok(())
    }

    fn end_capture(&mut self) -> Result<(), SourceError> {
        self.hooks.lock().push("end".to_string());
        Ok(())
    }
}

/// Uniform grey frame at `t`
pub fn scripted_frame(t: f64, resolution: Resolution) -> VideoSample {
    VideoSample::new(
        Timestamp::now(t),
        vec![128; resolution.bgr_frame_len()],
        resolution,
    )
}

/// Gaze point at the frame centre
pub fn scripted_gaze(t: f64) -> GazeSample {
    GazeSample {
        timestamp: Timestamp::now(t),
        x: 800.0,
        y: 600.0,
        pupil_diameter_left: 3.5,
        pupil_diameter_right: 3.6,
    }
}

/// Level, resting IMU reading at `t`
pub fn scripted_imu(t: f64) -> ImuSample {
    ImuSample {
        timestamp: Timestamp::now(t),
        quaternion: Quaternion {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        },
        accel: Vector3 {
            x: 0.0,
            y: 0.0,
            z: 1.0,
        },
        gyro: Vector3 {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        },
    }
}
