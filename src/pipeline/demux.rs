//! Stream demultiplexer
//!
//! Classifies samples pulled from a source and routes them to the aligner.
//! Packets the recorder cannot use are dropped and counted.

use crate::capture::{ImuSample, PrimaryPair, Sample};

/// Where a received sample goes next
#[derive(Debug)]
pub enum Routed {
    Primary(PrimaryPair),
    Imu(ImuSample),
    Dropped(DropReason),
}

/// Why a sample was discarded
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Kind not known to the recorder
    Unrecognized(String),
    /// Known kind whose hardware timestamp is not a finite number
    InvalidTimestamp(&'static str),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Unrecognized(kind) => write!(f, "unrecognized sample kind '{kind}'"),
            DropReason::InvalidTimestamp(kind) => write!(f, "{kind} sample with invalid timestamp"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Demultiplexer {
    dropped: u64,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one sample
    pub fn route(&mut self, sample: Sample) -> Routed {
        let routed = match sample {
            Sample::Primary(pair) if !pair.video.timestamp.hardware.is_finite() => {
                Routed::Dropped(DropReason::InvalidTimestamp("scene"))
            }
            Sample::Imu(imu) if !imu.timestamp.hardware.is_finite() => {
                Routed::Dropped(DropReason::InvalidTimestamp("imu"))
            }
            Sample::Primary(pair) => Routed::Primary(pair),
            Sample::Imu(imu) => Routed::Imu(imu),
            Sample::Unrecognized { kind } => Routed::Dropped(DropReason::Unrecognized(kind)),
        };

        if let Routed::Dropped(reason) = &routed {
            self.dropped += 1;
            tracing::warn!("Dropping sample: {} ({} dropped so far)", reason, self.dropped);
        }

        routed
    }

    /// Number of samples dropped so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}
