//! Sample routing and alignment
//!
//! - Demultiplexer classifying samples by kind
//! - TemporalAligner joining scene frames with the latest IMU reading

pub mod aligner;
pub mod demux;

pub use aligner::{AlignError, AlignedRecord, AlignerStats, LatestImu, TemporalAligner};
pub use demux::{Demultiplexer, DropReason, Routed};
