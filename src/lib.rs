//! Fusion Recorder - scene video, gaze and IMU recorded in lockstep.
//!
//! This is the main library crate for the recorder. It provides the sample
//! sources, the routing and alignment pipeline, and the session controller
//! that persists aligned records to a CSV table and a scene video.

pub mod capture;
pub mod pipeline;
pub mod recorder;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
///
/// `RUST_LOG` takes precedence; otherwise `verbosity` picks the level for
/// this crate (0 = info, 1 = debug, 2+ = trace).
pub fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "fusion_recorder=info",
        1 => "fusion_recorder=debug",
        _ => "fusion_recorder=trace",
    };

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
