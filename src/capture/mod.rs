//! Sample sources
//!
//! The recorder consumes devices through [`SampleSource`]. Devices are
//! obtained once through [`connect`]; there are no retries inside the
//! pipeline.

pub mod scripted;
pub mod simulated;
pub mod traits;

use serde::{Deserialize, Serialize};

pub use scripted::ScriptedSource;
pub use simulated::{SimulatedConfig, SimulatedDevice};
pub use traits::{
    ConnectError, DeviceInfo, GazeSample, ImuSample, PrimaryPair, Quaternion, Resolution, Sample,
    SampleSource, SourceError, Timestamp, Vector3, VideoSample,
};

/// Which device to record from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceConfig {
    /// Synthetic headset
    Simulated(SimulatedConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Simulated(SimulatedConfig::default())
    }
}

/// Open the configured device and return a ready source
pub fn connect(config: &SourceConfig) -> Result<Box<dyn SampleSource>, ConnectError> {
    match config {
        SourceConfig::Simulated(sim) => Ok(Box::new(SimulatedDevice::connect(sim.clone())?)),
    }
}
