//! Record writer
//!
//! Persists aligned records: one CSV row per record, flushed and synced to
//! disk before `append` returns, and one frame submitted to the video sink.
//! A failure in one modality does not stop the other; repeated failures
//! become fatal.

use super::overlay::draw_gaze_marker;
use super::video::VideoSink;
use crate::pipeline::AlignedRecord;
use serde::Serialize;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column set of the data table, in order
pub const COLUMNS: [&str; 19] = [
    "local_time",
    "scene_frame_timestamp",
    "gaze_x",
    "gaze_y",
    "pupil_diameter_left",
    "pupil_diameter_right",
    "imu_timestamp",
    "quaternion_x",
    "quaternion_y",
    "quaternion_z",
    "quaternion_w",
    "accel_x",
    "accel_y",
    "accel_z",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "imu_staleness",
    "video_status",
];

/// Writer errors
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Failed to open {sink} output at {path:?}: {source}")]
    Open {
        sink: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Record {sequence} partially written: {reason}")]
    Degraded {
        sequence: u64,
        video_failed: bool,
        table_failed: bool,
        reason: String,
    },

    #[error("{consecutive} consecutive write failures, last: {last}")]
    Fatal { consecutive: u32, last: String },

    #[error("Writer already finished")]
    Finished,
}

impl WriteError {
    /// Whether the session must abort
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WriteError::Degraded { .. })
    }
}

/// One serialized table row; `None` fields are written empty
#[derive(Debug, Serialize)]
struct TableRow {
    local_time: String,
    scene_frame_timestamp: f64,
    gaze_x: Option<f64>,
    gaze_y: Option<f64>,
    pupil_diameter_left: Option<f64>,
    pupil_diameter_right: Option<f64>,
    imu_timestamp: Option<f64>,
    quaternion_x: Option<f64>,
    quaternion_y: Option<f64>,
    quaternion_z: Option<f64>,
    quaternion_w: Option<f64>,
    accel_x: Option<f64>,
    accel_y: Option<f64>,
    accel_z: Option<f64>,
    gyro_x: Option<f64>,
    gyro_y: Option<f64>,
    gyro_z: Option<f64>,
    imu_staleness: Option<f64>,
    video_status: &'static str,
}

impl TableRow {
    fn new(record: &AlignedRecord, video_ok: bool) -> Self {
        let gaze = record.gaze.as_ref();
        let imu = record.imu.as_ref();
        Self {
            local_time: record
                .assembled_at
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            scene_frame_timestamp: record.video_timestamp(),
            gaze_x: gaze.map(|g| g.x),
            gaze_y: gaze.map(|g| g.y),
            pupil_diameter_left: gaze.map(|g| g.pupil_diameter_left),
            pupil_diameter_right: gaze.map(|g| g.pupil_diameter_right),
            imu_timestamp: imu.map(|i| i.timestamp.hardware),
            quaternion_x: imu.map(|i| i.quaternion.x),
            quaternion_y: imu.map(|i| i.quaternion.y),
            quaternion_z: imu.map(|i| i.quaternion.z),
            quaternion_w: imu.map(|i| i.quaternion.w),
            accel_x: imu.map(|i| i.accel.x),
            accel_y: imu.map(|i| i.accel.y),
            accel_z: imu.map(|i| i.accel.z),
            gyro_x: imu.map(|i| i.gyro.x),
            gyro_y: imu.map(|i| i.gyro.y),
            gyro_z: imu.map(|i| i.gyro.z),
            imu_staleness: record.imu_staleness,
            video_status: if video_ok { "ok" } else { "failed" },
        }
    }
}

/// Append-only CSV table synced to disk after every row
pub struct TabularSink {
    writer: Option<csv::Writer<File>>,
    path: PathBuf,
    rows: u64,
}

impl TabularSink {
    /// Create the table and make its header durable
    pub fn create(path: &Path) -> Result<Self, WriteError> {
        let open_err = |source: io::Error| WriteError::Open {
            sink: "table",
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = File::create(path).map_err(open_err)?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b',')
            .has_headers(false)
            .from_writer(file);

        writer
            .write_record(COLUMNS)
            .map_err(|e| open_err(e.into()))?;
        Self::sync(&mut writer).map_err(open_err)?;

        tracing::debug!("Created data table at {:?}", path);

        Ok(Self {
            writer: Some(writer),
            path: path.to_path_buf(),
            rows: 0,
        })
    }

    fn sync(writer: &mut csv::Writer<File>) -> io::Result<()> {
        writer.flush()?;
        writer.get_ref().sync_data()
    }

    fn append(&mut self, row: &TableRow) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "table already finished"))?;
        writer.serialize(row)?;
        Self::sync(writer)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Flush and close the table; later calls do nothing
    pub fn finish(&mut self) -> io::Result<Option<PathBuf>> {
        match self.writer.take() {
            Some(mut writer) => {
                Self::sync(&mut writer)?;
                tracing::info!("Data table closed: {} rows in {:?}", self.rows, self.path);
                Ok(Some(self.path.clone()))
            }
            None => Ok(None),
        }
    }
}

/// Counters kept by the writer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WriterStats {
    pub rows_written: u64,
    pub frames_written: u64,
    pub degraded: u64,
}

/// Sole owner of the table and video sinks for a session
pub struct RecordWriter {
    table: TabularSink,
    video: Box<dyn VideoSink>,
    failure_threshold: u32,
    consecutive_failures: u32,
    degraded: u64,
    gaze_overlay: bool,
    finished: bool,
}

impl RecordWriter {
    pub fn new(table: TabularSink, video: Box<dyn VideoSink>, failure_threshold: u32) -> Self {
        Self {
            table,
            video,
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
            degraded: 0,
            gaze_overlay: false,
            finished: false,
        }
    }

    /// Mark the gaze point on each frame before it is encoded
    pub fn with_gaze_overlay(mut self, enabled: bool) -> Self {
        self.gaze_overlay = enabled;
        self
    }

    /// Persist one record
    ///
    /// On `Ok` the row is on stable storage and the frame has been handed to
    /// the encoder. A `Degraded` error means one modality failed and the
    /// other was kept; once more than `failure_threshold` appends in a row
    /// have failed the error is `Fatal`.
    pub fn append(&mut self, mut record: AlignedRecord) -> Result<(), WriteError> {
        if self.finished {
            return Err(WriteError::Finished);
        }

        if self.gaze_overlay {
            if let Some(gaze) = record.gaze {
                draw_gaze_marker(&mut record.video, gaze.x, gaze.y);
            }
        }

        let video_result = self.video.write_frame(&record.video);
        let row = TableRow::new(&record, video_result.is_ok());
        let table_result = self.table.append(&row);
        let sequence = record.sequence;
        drop(record);

        let reason = match (&video_result, &table_result) {
            (Ok(()), Ok(())) => {
                self.consecutive_failures = 0;
                return Ok(());
            }
            (Err(v), Ok(())) => format!("video: {v}"),
            (Ok(()), Err(t)) => format!("table: {t}"),
            (Err(v), Err(t)) => format!("video: {v}; table: {t}"),
        };

        self.consecutive_failures += 1;
        self.degraded += 1;

        if self.consecutive_failures > self.failure_threshold {
            tracing::error!(
                "Record {} failed ({}); {} consecutive failures, giving up",
                sequence,
                reason,
                self.consecutive_failures
            );
            return Err(WriteError::Fatal {
                consecutive: self.consecutive_failures,
                last: reason,
            });
        }

        tracing::warn!("Record {} degraded: {}", sequence, reason);
        Err(WriteError::Degraded {
            sequence,
            video_failed: video_result.is_err(),
            table_failed: table_result.is_err(),
            reason,
        })
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            rows_written: self.table.rows_written(),
            frames_written: self.video.frames_written(),
            degraded: self.degraded,
        }
    }

    /// Finalize both sinks exactly once and return the files produced
    ///
    /// Both sinks are attempted even when the first fails. Calling this
    /// again returns an empty list without touching the sinks.
    pub fn finish(&mut self) -> io::Result<Vec<PathBuf>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        let table_result = self.table.finish();
        let video_result = self.video.finish();

        let mut files = Vec::new();
        files.extend(table_result?);
        files.extend(video_result?);
        Ok(files)
    }
}
