//! Recording system module
//!
//! - `SessionController` owns the session lifecycle and the consumer thread
//! - `RecordWriter` persists aligned records to the data table and video
//! - Video sinks encode scene frames through FFmpeg or write them raw
//! - Gaze overlay marks the gaze point on recorded frames

pub mod coordinator;
pub mod overlay;
pub mod state;
pub mod video;
pub mod writer;

pub use coordinator::{
    RecordingError, RecordingEvent, RecordingResult, SessionController, SessionHandle,
};
pub use state::{ConfigError, RecordingConfig, RecordingSummary, SessionState, SessionStats};
pub use video::{default_video_factory, open_video_sink, VideoFormat, VideoSink, VideoSinkFactory};
pub use writer::{RecordWriter, TabularSink, WriteError, WriterStats, COLUMNS};
