//! Recording session controller
//!
//! Owns the session lifecycle. Samples are consumed on a dedicated blocking
//! thread: one blocking receive at a time, IMU readings folded into the
//! aligner as they arrive, and the stop flag checked before every receive so
//! a record that has been received is always written.

use super::state::{ConfigError, RecordingConfig, RecordingSummary, SessionState, SessionStats};
use super::video::{default_video_factory, VideoSinkFactory};
use super::writer::{RecordWriter, TabularSink, WriteError};
use crate::capture::{DeviceInfo, PrimaryPair, Resolution, Sample, SampleSource, SourceError};
use crate::pipeline::{AlignedRecord, Demultiplexer, Routed, TemporalAligner};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use uuid::Uuid;

/// Upper bound on polled IMU samples folded in before each receive
const MAX_IMU_DRAIN: usize = 1024;

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Session created and table opened
    Started { session_id: Uuid },
    /// First scene frame persisted
    Active,
    /// One modality of a record failed to persist
    Degraded { sequence: u64, reason: String },
    /// A sample was discarded before alignment
    SampleDropped { reason: String },
    /// Records persisted so far
    Progress { records: u64 },
    /// Fatal error, closing down
    Aborting { reason: String },
    /// Sinks finalized
    Closed { session_id: Uuid },
}

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Unknown session: {0}")]
    UnknownSession(Uuid),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Recording aborted: {0}")]
    Aborted(String),

    #[error("Session did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("Recording worker failed: {0}")]
    Worker(String),

    #[error("Failed to spawn consumer thread: {0}")]
    ThreadSpawn(String),
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// State shared between the controller, handles and the consumer thread
struct SessionShared {
    id: Uuid,
    state: watch::Sender<SessionState>,
    stop_requested: AtomicBool,
    stats: Mutex<SessionStats>,
    summary: Mutex<Option<RecordingSummary>>,
}

impl SessionShared {
    fn new(id: Uuid) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id,
            state,
            stop_requested: AtomicBool::new(false),
            stats: Mutex::new(SessionStats::default()),
            summary: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` unless the lifecycle forbids it
    ///
    /// Nothing leaves `Closed`, and `Aborting` only leads to `Closed`.
    fn transition(&self, next: SessionState) -> bool {
        let id = self.id;
        self.state.send_if_modified(|current| {
            let allowed = match *current {
                SessionState::Closed => false,
                SessionState::Aborting => next == SessionState::Closed,
                state => state != next,
            };
            if allowed {
                tracing::debug!("Session {} state {} -> {}", id, current, next);
                *current = next;
            }
            allowed
        })
    }
}

/// Caller's reference to a session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionState {
        self.shared.state()
    }

    /// Counters as of the last processed frame
    pub fn stats(&self) -> SessionStats {
        *self.shared.stats.lock()
    }

    /// Summary, available once the session is closed
    pub fn summary(&self) -> Option<RecordingSummary> {
        self.shared.summary.lock().clone()
    }

    /// Resolve once the session reaches `state` (or has closed)
    pub async fn reached(&self, state: SessionState) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx
            .wait_for(|s| *s == state || *s == SessionState::Closed)
            .await;
    }

    /// Resolve once the session is closed
    pub async fn closed(&self) {
        self.reached(SessionState::Closed).await
    }
}

struct CurrentSession {
    handle: SessionHandle,
    /// Summary sent by the consumer thread once it has closed the session
    worker: Option<oneshot::Receiver<RecordingSummary>>,
    /// Terminal result, cached so repeated stops have no side effects
    outcome: Option<Result<RecordingSummary, String>>,
}

/// Starts, stops and reports on recording sessions, one at a time
pub struct SessionController {
    config: RecordingConfig,
    video_factory: VideoSinkFactory,
    event_tx: broadcast::Sender<RecordingEvent>,
    current: Option<CurrentSession>,
}

impl SessionController {
    /// Create a new session controller
    pub fn new(config: RecordingConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            video_factory: default_video_factory(),
            event_tx,
            current: None,
        }
    }

    /// Replace the way video sinks are opened
    pub fn with_video_factory(mut self, factory: VideoSinkFactory) -> Self {
        self.video_factory = factory;
        self
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// State of `handle`'s session
    pub fn status(&self, handle: &SessionHandle) -> SessionState {
        handle.status()
    }

    /// State of the most recent session, `Idle` if none was started
    pub fn current_status(&self) -> SessionState {
        self.current
            .as_ref()
            .map(|c| c.handle.status())
            .unwrap_or(SessionState::Idle)
    }

    /// Start recording from `source`
    ///
    /// The data table is created before any sample is read; if that fails
    /// no session is left behind. The video container is opened when the
    /// first scene frame reveals the resolution.
    pub async fn start(&mut self, source: Box<dyn SampleSource>) -> RecordingResult<SessionHandle> {
        if self.current_status().is_live() {
            return Err(RecordingError::AlreadyRecording);
        }
        self.config.validate()?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let short_id: String = id.simple().to_string().chars().take(8).collect();
        let session_dir = self
            .config
            .output_dir
            .join(format!("{}-{}", started_at.format("%Y%m%d-%H%M%S"), short_id));

        let shared = Arc::new(SessionShared::new(id));
        shared.transition(SessionState::Starting);

        tracing::info!("Starting recording session {} in {:?}", id, session_dir);

        let table = match TabularSink::create(&session_dir.join(&self.config.table_file)) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!("Could not open data table: {}", e);
                shared.transition(SessionState::Aborting);
                shared.transition(SessionState::Closed);
                return Err(e.into());
            }
        };

        let _ = self.event_tx.send(RecordingEvent::Started { session_id: id });

        let worker = SessionWorker {
            shared: shared.clone(),
            events: self.event_tx.clone(),
            source,
            demux: Demultiplexer::new(),
            aligner: TemporalAligner::new(self.config.max_imu_staleness_secs),
            table: Some(table),
            writer: None,
            video_factory: self.video_factory.clone(),
            config: self.config.clone(),
            session_dir,
            started_at,
            device: DeviceInfo::default(),
            remote_recording_id: None,
            records_written: 0,
            records_degraded: 0,
        };

        // Detached so that a source stuck in a receive cannot hold up runtime shutdown
        let (summary_tx, summary_rx) = oneshot::channel();
        let spawned = thread::Builder::new()
            .name(format!("fusion-consumer-{}", id.simple()))
            .spawn(move || {
                let summary = worker.run();
                let _ = summary_tx.send(summary);
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn consumer thread: {}", e);
            shared.transition(SessionState::Aborting);
            shared.transition(SessionState::Closed);
            return Err(RecordingError::ThreadSpawn(e.to_string()));
        }

        let handle = SessionHandle { shared };
        self.current = Some(CurrentSession {
            handle: handle.clone(),
            worker: Some(summary_rx),
            outcome: None,
        });

        Ok(handle)
    }

    /// Stop the session and wait for its sinks to close
    ///
    /// Stopping a closed session returns the same result again without
    /// touching the sinks. If the consumer is stuck in a receive that never
    /// returns, the session is marked `Aborting` and `StopTimeout` is
    /// returned; it closes on its own once the receive comes back.
    pub async fn stop(&mut self, handle: &SessionHandle) -> RecordingResult<RecordingSummary> {
        let timeout = self.config.stop_timeout();
        let current = self.session_for(handle)?;
        if let Some(outcome) = &current.outcome {
            return settle(outcome);
        }
        let timeout = timeout?;

        tracing::info!("Stopping recording session {}", handle.id());
        current.handle.shared.stop_requested.store(true, Ordering::SeqCst);
        Self::join(current, Some(timeout)).await
    }

    /// Wait for the session to end on its own (end of stream or fatal error)
    pub async fn wait(&mut self, handle: &SessionHandle) -> RecordingResult<RecordingSummary> {
        let current = self.session_for(handle)?;
        if let Some(outcome) = &current.outcome {
            return settle(outcome);
        }
        Self::join(current, None).await
    }

    fn session_for(&mut self, handle: &SessionHandle) -> RecordingResult<&mut CurrentSession> {
        let current = self.current.as_mut().ok_or(RecordingError::NotRecording)?;
        if current.handle.id() != handle.id() {
            return Err(RecordingError::UnknownSession(handle.id()));
        }
        Ok(current)
    }

    async fn join(
        current: &mut CurrentSession,
        timeout: Option<Duration>,
    ) -> RecordingResult<RecordingSummary> {
        let Some(worker) = current.worker.as_mut() else {
            return Err(RecordingError::Worker("session has no consumer".to_string()));
        };

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, worker).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::error!(
                        "Session {} did not stop within {:?}; source unresponsive",
                        current.handle.id(),
                        limit
                    );
                    current.handle.shared.transition(SessionState::Aborting);
                    return Err(RecordingError::StopTimeout(limit));
                }
            },
            None => worker.await,
        };
        current.worker = None;

        let outcome = match joined {
            Ok(summary) => Ok(summary),
            Err(_) => {
                tracing::error!(
                    "Consumer thread for session {} exited without a summary",
                    current.handle.id()
                );
                let shared = &current.handle.shared;
                shared.transition(SessionState::Aborting);
                shared.transition(SessionState::Closed);
                Err("consumer thread exited without a summary".to_string())
            }
        };

        let result = settle(&outcome);
        current.outcome = Some(outcome);
        result
    }
}

fn settle(outcome: &Result<RecordingSummary, String>) -> RecordingResult<RecordingSummary> {
    match outcome {
        Ok(summary) => match &summary.abort_reason {
            Some(reason) => Err(RecordingError::Aborted(reason.clone())),
            None => Ok(summary.clone()),
        },
        Err(reason) => Err(RecordingError::Worker(reason.clone())),
    }
}

enum Next {
    Pair(PrimaryPair),
    Stop,
    EndOfStream,
}

/// Consumer side of a session; owns the source and both sinks
struct SessionWorker {
    shared: Arc<SessionShared>,
    events: broadcast::Sender<RecordingEvent>,
    source: Box<dyn SampleSource>,
    demux: Demultiplexer,
    aligner: TemporalAligner,
    /// Held here until the video container is open, then moved into `writer`
    table: Option<TabularSink>,
    writer: Option<RecordWriter>,
    video_factory: VideoSinkFactory,
    config: RecordingConfig,
    session_dir: PathBuf,
    started_at: DateTime<Utc>,
    device: DeviceInfo,
    remote_recording_id: Option<String>,
    records_written: u64,
    records_degraded: u64,
}

impl SessionWorker {
    fn run(mut self) -> RecordingSummary {
        self.open_device();

        let abort_reason = match self.consume() {
            Ok(()) if self.shared.state() == SessionState::Aborting => {
                tracing::warn!("Source returned after the stop timeout, closing late");
                Some("source did not respond within the stop timeout".to_string())
            }
            Ok(()) => {
                self.shared.transition(SessionState::Stopping);
                None
            }
            Err(e) => {
                tracing::error!("Recording session {} aborting: {}", self.shared.id, e);
                self.shared.transition(SessionState::Aborting);
                let reason = e.to_string();
                let _ = self.events.send(RecordingEvent::Aborting {
                    reason: reason.clone(),
                });
                Some(reason)
            }
        };

        let mut output_files = self.close_sinks();
        if let Err(e) = self.source.end_capture() {
            tracing::warn!("Device-side recording not saved: {}", e);
        }
        self.publish_stats();

        let manifest = self.session_dir.join("session.json");
        output_files.push(manifest.clone());

        let stopped_at = Utc::now();
        let summary = RecordingSummary {
            session_id: self.shared.id,
            session_dir: self.session_dir.clone(),
            remote_recording_id: self.remote_recording_id.clone(),
            device: self.device.clone(),
            started_at: self.started_at,
            stopped_at,
            duration_secs: (stopped_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            abort_reason,
            stats: self.stats(),
            output_files,
        };

        match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&manifest, json) {
                    tracing::warn!("Failed to write session manifest {:?}: {}", manifest, e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize session manifest: {}", e),
        }

        *self.shared.summary.lock() = Some(summary.clone());
        self.shared.transition(SessionState::Closed);
        let _ = self.events.send(RecordingEvent::Closed {
            session_id: self.shared.id,
        });

        tracing::info!(
            "Recording session {} closed: {} records ({} degraded) in {:.1}s",
            self.shared.id,
            summary.stats.records_written,
            summary.stats.records_degraded,
            summary.duration_secs
        );
        summary
    }

    fn open_device(&mut self) {
        self.device = self.source.device_info();
        tracing::info!(
            "Device: {} (address {:?}, serial {:?}, battery {:?}%, free storage {:?} bytes)",
            self.device.name,
            self.device.address,
            self.device.serial,
            self.device.battery_percent,
            self.device.free_storage_bytes
        );

        match self.source.begin_capture() {
            Ok(id) => {
                if let Some(id) = &id {
                    tracing::info!("Device-side recording started: {}", id);
                }
                self.remote_recording_id = id;
            }
            Err(e) => tracing::warn!("Device-side recording not started: {}", e),
        }

        if let Some(event) = &self.config.start_event {
            if let Err(e) = self.source.send_event(event) {
                tracing::warn!("Failed to send '{}' event: {}", event, e);
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    fn consume(&mut self) -> RecordingResult<()> {
        loop {
            self.drain_polled_imu()?;
            match self.next_primary()? {
                Next::Pair(pair) => self.process(pair)?,
                Next::Stop => {
                    tracing::info!("Stop requested, closing session {}", self.shared.id);
                    return Ok(());
                }
                Next::EndOfStream => {
                    tracing::info!("Source stream ended, closing session {}", self.shared.id);
                    return Ok(());
                }
            }
            self.publish_stats();
        }
    }

    /// Fold in IMU samples the source already holds, without blocking
    fn drain_polled_imu(&mut self) -> RecordingResult<()> {
        for _ in 0..MAX_IMU_DRAIN {
            let sample = match self.source.try_next_imu() {
                Ok(Some(sample)) => sample,
                Ok(None) => break,
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => return Err(e.into()),
            };
            if let Some(pair) = self.route(sample) {
                self.process(pair)?;
            }
        }
        Ok(())
    }

    /// Block until the next scene frame, routing everything received before it
    fn next_primary(&mut self) -> RecordingResult<Next> {
        loop {
            if self.stop_requested() {
                return Ok(Next::Stop);
            }
            let sample = match self.source.next_sample() {
                Ok(sample) => sample,
                Err(e) if e.is_end_of_stream() => return Ok(Next::EndOfStream),
                Err(e) => return Err(e.into()),
            };
            if let Some(pair) = self.route(sample) {
                return Ok(Next::Pair(pair));
            }
        }
    }

    fn route(&mut self, sample: Sample) -> Option<PrimaryPair> {
        match self.demux.route(sample) {
            Routed::Primary(pair) => Some(pair),
            Routed::Imu(imu) => {
                self.aligner.observe_imu(imu);
                None
            }
            Routed::Dropped(reason) => {
                let _ = self.events.send(RecordingEvent::SampleDropped {
                    reason: reason.to_string(),
                });
                None
            }
        }
    }

    fn process(&mut self, pair: PrimaryPair) -> RecordingResult<()> {
        match self.aligner.align(pair) {
            Ok(record) => self.persist(record),
            Err(e) => {
                tracing::warn!("Dropping scene frame: {}", e);
                let _ = self.events.send(RecordingEvent::SampleDropped {
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }

    fn persist(&mut self, record: AlignedRecord) -> RecordingResult<()> {
        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.open_writer(record.video.resolution)?,
        };
        let result = writer.append(record);
        self.writer = Some(writer);

        match result {
            Ok(()) => self.records_written += 1,
            Err(WriteError::Degraded {
                sequence, reason, ..
            }) => {
                self.records_degraded += 1;
                let _ = self.events.send(RecordingEvent::Degraded { sequence, reason });
            }
            Err(e) => return Err(e.into()),
        }

        if self.shared.state() == SessionState::Starting
            && self.shared.transition(SessionState::Active)
        {
            tracing::info!("Recording session {} active", self.shared.id);
            let _ = self.events.send(RecordingEvent::Active);
        }

        let records = self.records_written + self.records_degraded;
        if self.config.progress_interval > 0 && records % self.config.progress_interval == 0 {
            tracing::debug!("Recorded {} frames", records);
            let _ = self.events.send(RecordingEvent::Progress { records });
        }
        Ok(())
    }

    /// Open the video container for the first frame's resolution
    fn open_writer(&mut self, resolution: Resolution) -> RecordingResult<RecordWriter> {
        let stem = self.session_dir.join(&self.config.video_stem);
        let video_format = self.config.video_format;
        let video = (self.video_factory)(video_format, &stem, resolution, self.config.fps)
            .map_err(|source| WriteError::Open {
                sink: "video",
                path: stem.with_extension(video_format.extension()),
                source,
            })?;

        let table = self.table.take().ok_or(WriteError::Finished)?;
        Ok(RecordWriter::new(table, video, self.config.failure_threshold)
            .with_gaze_overlay(self.config.gaze_overlay))
    }

    /// Finalize whichever sinks are open; failures are logged, not raised
    fn close_sinks(&mut self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Some(mut writer) = self.writer.take() {
            match writer.finish() {
                Ok(closed) => files.extend(closed),
                Err(e) => tracing::warn!("Failed to finalize outputs: {}", e),
            }
        }
        if let Some(mut table) = self.table.take() {
            match table.finish() {
                Ok(closed) => files.extend(closed),
                Err(e) => tracing::warn!("Failed to finalize data table: {}", e),
            }
        }
        files
    }

    fn stats(&self) -> SessionStats {
        let aligner = self.aligner.stats();
        SessionStats {
            records_written: self.records_written,
            records_degraded: self.records_degraded,
            samples_dropped: self.demux.dropped_count(),
            frames_out_of_order: aligner.out_of_order,
            imu_received: aligner.imu_received,
            imu_rejected_stale: aligner.imu_rejected_stale,
        }
    }

    fn publish_stats(&self) {
        *self.shared.stats.lock() = self.stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::scripted::scripted_imu;
    use crate::capture::{ScriptedSource, SimulatedConfig, SimulatedDevice};
    use crate::recorder::video::{VideoFormat, VideoSink};
    use crate::recorder::writer::tests::FlakyVideo;
    use std::path::Path;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> RecordingConfig {
        RecordingConfig {
            output_dir: dir.to_path_buf(),
            video_format: VideoFormat::RawBgr,
            stop_timeout_secs: 10.0,
            ..RecordingConfig::default()
        }
    }

    fn flaky_factory(pattern: &'static [bool], finish_calls: Arc<Mutex<u32>>) -> VideoSinkFactory {
        Arc::new(
            move |_: VideoFormat,
                  _: &Path,
                  _: Resolution,
                  _: f64|
                  -> std::io::Result<Box<dyn VideoSink>> {
                let mut video = FlakyVideo::failing_at(pattern);
                video.finish_calls = finish_calls.clone();
                Ok(Box::new(video))
            },
        )
    }

    fn no_encoder(
        _: VideoFormat,
        _: &Path,
        _: Resolution,
        _: f64,
    ) -> std::io::Result<Box<dyn VideoSink>> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no encoder"))
    }

    fn live_device() -> Box<dyn SampleSource> {
        Box::new(
            SimulatedDevice::connect(SimulatedConfig {
                scene_rate_hz: 50.0,
                imu_rate_hz: 200.0,
                width: 8,
                height: 4,
                realtime: true,
                ..SimulatedConfig::default()
            })
            .unwrap(),
        )
    }

    /// Blocks in every receive until released, then ends the stream
    struct StalledSource {
        release: Arc<AtomicBool>,
    }

    impl SampleSource for StalledSource {
        fn next_sample(&mut self) -> Result<Sample, SourceError> {
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(SourceError::Exhausted)
        }
    }

    /// Streams IMU readings but never a scene frame
    struct ImuOnlySource {
        t: f64,
    }

    impl SampleSource for ImuOnlySource {
        fn next_sample(&mut self) -> Result<Sample, SourceError> {
            std::thread::sleep(Duration::from_millis(2));
            self.t += 0.01;
            Ok(Sample::Imu(scripted_imu(self.t)))
        }
    }

    fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader.records().map(|r| r.unwrap()).collect()
    }

    fn drain_events(rx: &mut broadcast::Receiver<RecordingEvent>) -> Vec<RecordingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_scripted_session_aligns_and_persists_in_order() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new()
            .primary(0.0, true)
            .imu(0.5)
            .primary(1.0, false)
            .primary(2.0, true);
        let hooks = source.hook_log();

        let mut controller = SessionController::new(config_in(dir.path()));
        let handle = controller.start(Box::new(source)).await.unwrap();
        let summary = controller.wait(&handle).await.unwrap();

        assert_eq!(handle.status(), SessionState::Closed);
        assert_eq!(summary.stats.records_written, 3);
        assert_eq!(summary.stats.imu_received, 1);
        assert_eq!(summary.remote_recording_id.as_deref(), Some("scripted-recording"));
        assert_eq!(
            *hooks.lock(),
            vec!["begin", "event:Experiment Start", "end"]
        );

        let rows = read_rows(&summary.session_dir.join("eye_data.csv"));
        let scene: Vec<&str> = rows.iter().map(|r| &r[1]).collect();
        assert_eq!(scene, vec!["0.0", "1.0", "2.0"]);

        // record@0: no IMU yet
        assert!(rows[0][6].is_empty());
        assert!(!rows[0][2].is_empty());
        // record@1: IMU from 0.5, no gaze
        assert_eq!(&rows[1][6], "0.5");
        assert!(rows[1][2].is_empty());
        // record@2: same IMU, gaze back, staleness 1.5
        assert_eq!(&rows[2][6], "0.5");
        assert!(!rows[2][2].is_empty());
        assert_eq!(&rows[2][17], "1.5");

        let video = std::fs::read(summary.session_dir.join("scene_output.bgr")).unwrap();
        assert_eq!(video.len(), 3 * Resolution::new(4, 2).bgr_frame_len());

        let manifest: RecordingSummary = serde_json::from_str(
            &std::fs::read_to_string(summary.session_dir.join("session.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.session_id, handle.id());
        assert!(!manifest.aborted());
    }

    #[tokio::test]
    async fn test_single_video_failure_degrades_without_abort() {
        let dir = tempdir().unwrap();
        let finish_calls = Arc::new(Mutex::new(0));
        let mut controller = SessionController::new(config_in(dir.path()))
            .with_video_factory(flaky_factory(&[true], finish_calls.clone()));
        let mut events = controller.subscribe();

        let source = ScriptedSource::new()
            .primary(0.0, true)
            .primary(1.0, true)
            .primary(2.0, true);
        let handle = controller.start(Box::new(source)).await.unwrap();
        let summary = controller.wait(&handle).await.unwrap();

        assert_eq!(summary.stats.records_degraded, 1);
        assert_eq!(summary.stats.records_written, 2);
        assert_eq!(*finish_calls.lock(), 1);

        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, RecordingEvent::Degraded { sequence: 0, .. })));
        assert!(events.iter().any(|e| matches!(e, RecordingEvent::Active)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, RecordingEvent::Aborting { .. })));

        let rows = read_rows(&summary.session_dir.join("eye_data.csv"));
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][18], "failed");
        assert_eq!(&rows[1][18], "ok");
    }

    #[tokio::test]
    async fn test_repeated_write_failures_abort_session() {
        let dir = tempdir().unwrap();
        let finish_calls = Arc::new(Mutex::new(0));
        let mut controller = SessionController::new(config_in(dir.path()))
            .with_video_factory(flaky_factory(&[true; 4], finish_calls.clone()));

        let mut source = ScriptedSource::new();
        for t in 0..5 {
            source = source.primary(t as f64, true);
        }
        let handle = controller.start(Box::new(source)).await.unwrap();

        let err = controller.wait(&handle).await.unwrap_err();
        assert!(matches!(err, RecordingError::Aborted(_)));
        assert_eq!(handle.status(), SessionState::Closed);
        assert_eq!(*finish_calls.lock(), 1);

        let summary = handle.summary().unwrap();
        assert!(summary.aborted());
        assert_eq!(summary.stats.records_degraded, 3);
        // Rows stay durable even though their frames failed; the fifth frame is never read
        let rows = read_rows(&summary.session_dir.join("eye_data.csv"));
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| &r[18] == "failed"));
    }

    #[tokio::test]
    async fn test_source_loss_aborts_and_keeps_written_rows() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(config_in(dir.path()));
        let mut events = controller.subscribe();

        let source = ScriptedSource::new()
            .primary(0.0, true)
            .primary(1.0, true)
            .then_disconnect("link lost");
        let hooks = source.hook_log();
        let handle = controller.start(Box::new(source)).await.unwrap();

        let err = controller.wait(&handle).await.unwrap_err();
        assert!(err.to_string().contains("link lost"));
        assert_eq!(handle.status(), SessionState::Closed);
        assert!(hooks.lock().contains(&"end".to_string()));

        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, RecordingEvent::Aborting { .. })));
        assert!(matches!(events.last(), Some(RecordingEvent::Closed { .. })));

        let summary = handle.summary().unwrap();
        assert_eq!(read_rows(&summary.session_dir.join("eye_data.csv")).len(), 2);

        // Stopping an aborted session keeps reporting the failure
        assert!(matches!(
            controller.stop(&handle).await,
            Err(RecordingError::Aborted(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let finish_calls = Arc::new(Mutex::new(0));
        let mut controller = SessionController::new(config_in(dir.path()))
            .with_video_factory(flaky_factory(&[], finish_calls.clone()));

        let handle = controller.start(live_device()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.reached(SessionState::Active))
            .await
            .unwrap();
        assert_eq!(controller.status(&handle), SessionState::Active);

        let first = controller.stop(&handle).await.unwrap();
        let second = controller.stop(&handle).await.unwrap();

        assert_eq!(handle.status(), SessionState::Closed);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.stopped_at, second.stopped_at);
        assert!(first.stats.records_written >= 1);
        assert_eq!(*finish_calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_misuse_is_rejected() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(config_in(dir.path()));

        let stray = SessionHandle {
            shared: Arc::new(SessionShared::new(Uuid::new_v4())),
        };
        assert!(matches!(
            controller.stop(&stray).await,
            Err(RecordingError::NotRecording)
        ));
        assert_eq!(controller.current_status(), SessionState::Idle);

        let handle = controller.start(live_device()).await.unwrap();
        assert!(matches!(
            controller.start(live_device()).await,
            Err(RecordingError::AlreadyRecording)
        ));
        assert!(matches!(
            controller.stop(&stray).await,
            Err(RecordingError::UnknownSession(_))
        ));
        assert!(controller.status(&handle).is_live());

        controller.stop(&handle).await.unwrap();

        // A closed session does not block the next one
        let next = controller.start(live_device()).await.unwrap();
        assert_ne!(next.id(), handle.id());
        controller.stop(&next).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_and_out_of_order_samples_are_counted() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(config_in(dir.path()));
        let source = ScriptedSource::new()
            .primary(1.0, true)
            .unrecognized("eye_state")
            .primary(0.5, true)
            .primary(2.0, true);

        let handle = controller.start(Box::new(source)).await.unwrap();
        let summary = controller.wait(&handle).await.unwrap();

        assert_eq!(summary.stats.records_written, 2);
        assert_eq!(summary.stats.samples_dropped, 1);
        assert_eq!(summary.stats.frames_out_of_order, 1);

        let rows = read_rows(&summary.session_dir.join("eye_data.csv"));
        let scene: Vec<&str> = rows.iter().map(|r| &r[1]).collect();
        assert_eq!(scene, vec!["1.0", "2.0"]);
    }

    #[tokio::test]
    async fn test_polled_imu_is_used_before_next_frame() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(config_in(dir.path()));
        let source = ScriptedSource::new().polled_imu(0.9).primary(1.0, true);

        let handle = controller.start(Box::new(source)).await.unwrap();
        let summary = controller.wait(&handle).await.unwrap();

        let rows = read_rows(&summary.session_dir.join("eye_data.csv"));
        assert_eq!(&rows[0][6], "0.9");
    }

    #[tokio::test]
    async fn test_unopenable_table_leaves_no_session() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut controller = SessionController::new(RecordingConfig {
            output_dir: blocker,
            ..config_in(dir.path())
        });

        let err = controller
            .start(Box::new(ScriptedSource::new().primary(0.0, true)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RecordingError::Write(WriteError::Open { sink: "table", .. })));
        assert_eq!(controller.current_status(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_video_open_failure_aborts_before_active() {
        let dir = tempdir().unwrap();
        let mut controller =
            SessionController::new(config_in(dir.path())).with_video_factory(Arc::new(no_encoder));
        let mut events = controller.subscribe();

        let handle = controller
            .start(Box::new(ScriptedSource::new().primary(0.0, true)))
            .await
            .unwrap();
        let err = controller.wait(&handle).await.unwrap_err();

        assert!(err.to_string().contains("no encoder"));
        let events = drain_events(&mut events);
        assert!(!events.iter().any(|e| matches!(e, RecordingEvent::Active)));

        // The table was still closed and listed
        let summary = handle.summary().unwrap();
        assert!(summary
            .output_files
            .contains(&summary.session_dir.join("eye_data.csv")));
    }

    #[test]
    fn test_unresponsive_source_times_out_without_holding_runtime() {
        let dir = tempdir().unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();

        let handle = runtime.block_on(async {
            let mut controller = SessionController::new(RecordingConfig {
                stop_timeout_secs: 0.2,
                ..config_in(dir.path())
            });
            let source = StalledSource {
                release: release.clone(),
            };
            let handle = controller.start(Box::new(source)).await.unwrap();

            let err = controller.stop(&handle).await.unwrap_err();
            assert!(matches!(err, RecordingError::StopTimeout(_)));
            assert_eq!(handle.status(), SessionState::Aborting);

            // Still stuck: a second stop reports the same
            assert!(matches!(
                controller.stop(&handle).await,
                Err(RecordingError::StopTimeout(_))
            ));
            handle
        });

        let (dropped_tx, dropped_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            drop(runtime);
            let _ = dropped_tx.send(());
        });
        assert!(
            dropped_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "runtime shutdown waited on the consumer"
        );

        // The session closes by itself once the receive returns
        release.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handle.status() != SessionState::Closed && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.status(), SessionState::Closed);
        let summary = handle.summary().unwrap();
        assert!(summary.aborted());
        assert!(summary.session_dir.join("session.json").exists());
    }

    #[tokio::test]
    async fn test_stop_before_first_frame_closes_cleanly() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(config_in(dir.path()));
        let mut events = controller.subscribe();

        let handle = controller.start(Box::new(ImuOnlySource { t: 0.0 })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status(), SessionState::Starting);

        let summary = controller.stop(&handle).await.unwrap();
        assert_eq!(handle.status(), SessionState::Closed);
        assert_eq!(summary.stats.records_written, 0);
        assert!(summary.stats.imu_received > 0);
        assert!(read_rows(&summary.session_dir.join("eye_data.csv")).is_empty());
        assert!(!summary.session_dir.join("scene_output.bgr").exists());

        let events = drain_events(&mut events);
        assert!(!events.iter().any(|e| matches!(
            e,
            RecordingEvent::Active | RecordingEvent::Aborting { .. }
        )));
    }

    #[tokio::test]
    async fn test_out_of_range_stop_timeout_is_an_error() {
        let dir = tempdir().unwrap();
        let mut controller = SessionController::new(RecordingConfig {
            stop_timeout_secs: 1e20,
            ..config_in(dir.path())
        });

        let stray = SessionHandle {
            shared: Arc::new(SessionShared::new(Uuid::new_v4())),
        };
        assert!(matches!(
            controller.stop(&stray).await,
            Err(RecordingError::NotRecording)
        ));
        assert!(matches!(
            controller.start(Box::new(ScriptedSource::new())).await,
            Err(RecordingError::Config(ConfigError::Invalid(_)))
        ));
    }
}
