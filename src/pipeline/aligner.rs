//! Temporal aligner
//!
//! Joins each scene frame and its gaze point with the most recently received
//! IMU reading. The IMU side is a single-slot latest-wins cache: nothing is
//! buffered or reordered, so a frame is never held back waiting for a better
//! match.

use crate::capture::{GazeSample, ImuSample, PrimaryPair, VideoSample};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Single-slot store holding the freshest IMU reading
///
/// Clones share the slot and may publish from any thread. Memory use is
/// constant however fast the sensor runs.
#[derive(Debug, Clone, Default)]
pub struct LatestImu {
    slot: Arc<Mutex<Option<ImuSample>>>,
}

impl LatestImu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached reading; the later arrival always wins
    pub fn publish(&self, sample: ImuSample) {
        *self.slot.lock() = Some(sample);
    }

    /// Copy of the cached reading
    pub fn latest(&self) -> Option<ImuSample> {
        *self.slot.lock()
    }
}

/// Unit persisted by the record writer
#[derive(Debug)]
pub struct AlignedRecord {
    /// Position in the session, starting at 0
    pub sequence: u64,
    pub video: VideoSample,
    pub gaze: Option<GazeSample>,
    pub imu: Option<ImuSample>,

    /// Scene timestamp minus IMU timestamp in seconds; negative when the
    /// IMU reading is ahead of the frame
    pub imu_staleness: Option<f64>,

    /// Host wall-clock time the record was assembled
    pub assembled_at: DateTime<Local>,
}

impl AlignedRecord {
    pub fn video_timestamp(&self) -> f64 {
        self.video.timestamp.hardware
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignError {
    #[error("Scene frame at {received}s does not follow previous frame at {previous}s")]
    OutOfOrder { previous: f64, received: f64 },
}

/// Counters kept by the aligner
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlignerStats {
    pub imu_received: u64,
    pub imu_rejected_stale: u64,
    pub out_of_order: u64,
}

pub struct TemporalAligner {
    imu: LatestImu,
    /// IMU readings older than this (in absolute seconds) are left out
    max_staleness: Option<f64>,
    last_video: Option<f64>,
    next_sequence: u64,
    stats: AlignerStats,
}

impl TemporalAligner {
    pub fn new(max_staleness: Option<f64>) -> Self {
        Self {
            imu: LatestImu::new(),
            max_staleness,
            last_video: None,
            next_sequence: 0,
            stats: AlignerStats::default(),
        }
    }

    /// Cache an IMU reading
    pub fn observe_imu(&mut self, sample: ImuSample) {
        self.stats.imu_received += 1;
        self.imu.publish(sample);
    }

    /// Pair a primary sample with the cached IMU reading
    pub fn align(&mut self, pair: PrimaryPair) -> Result<AlignedRecord, AlignError> {
        let t_video = pair.video.timestamp.hardware;

        if let Some(previous) = self.last_video {
            if t_video <= previous {
                self.stats.out_of_order += 1;
                return Err(AlignError::OutOfOrder {
                    previous,
                    received: t_video,
                });
            }
        }
        self.last_video = Some(t_video);

        let (imu, imu_staleness) = match self.imu.latest() {
            None => (None, None),
            Some(imu) => {
                let staleness = t_video - imu.timestamp.hardware;
                match self.max_staleness {
                    Some(limit) if staleness.abs() > limit => {
                        self.stats.imu_rejected_stale += 1;
                        tracing::debug!(
                            "IMU reading {:.3}s away from frame at {:.3}, leaving it out",
                            staleness,
                            t_video
                        );
                        (None, None)
                    }
                    _ => (Some(imu), Some(staleness)),
                }
            }
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Ok(AlignedRecord {
            sequence,
            video: pair.video,
            gaze: pair.gaze,
            imu,
            imu_staleness,
            assembled_at: Local::now(),
        })
    }

    pub fn stats(&self) -> AlignerStats {
        self.stats
    }
}
