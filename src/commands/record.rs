use crate::cli::RecordArgs;
use fusion_recorder::capture::{self, SourceConfig};
use fusion_recorder::recorder::{
    RecordingConfig, RecordingEvent, RecordingSummary, SessionController,
};
use fusion_recorder::utils::AppResult;
use tokio::sync::broadcast::error::RecvError;

impl RecordArgs {
    /// Load the configured file (or defaults) and apply flag overrides
    fn resolve_config(&self) -> AppResult<RecordingConfig> {
        let mut config = match &self.config {
            Some(path) => RecordingConfig::load(path)?,
            None => RecordingConfig::default(),
        };

        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(format) = self.format {
            config.video_format = format;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(limit) = self.max_imu_staleness {
            config.max_imu_staleness_secs = Some(limit);
        }
        if let Some(threshold) = self.failure_threshold {
            config.failure_threshold = threshold;
        }
        if self.no_gaze_overlay {
            config.gaze_overlay = false;
        }

        let SourceConfig::Simulated(sim) = &mut config.source;
        if let Some(frames) = self.frames {
            sim.max_frames = Some(frames);
        }
        if self.no_realtime {
            sim.realtime = false;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Record one session and print its summary
pub async fn execute(args: RecordArgs, json: bool) -> AppResult<()> {
    let config = args.resolve_config()?;
    let source = capture::connect(&config.source)?;

    let mut controller = SessionController::new(config);
    let events = controller.subscribe();
    let handle = controller.start(source).await?;

    let reporter = tokio::spawn(report_events(events, json));

    let deadline = async {
        match args.duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, stopping"),
        _ = deadline => tracing::info!("Duration reached, stopping"),
        _ = handle.closed() => {}
    }

    let result = controller.stop(&handle).await;
    reporter.abort();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            if let Some(summary) = handle.summary() {
                print_summary(&summary, json)?;
            }
            return Err(e.into());
        }
    };
    print_summary(&summary, json)
}

/// Relay session events to the terminal
async fn report_events(mut events: tokio::sync::broadcast::Receiver<RecordingEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(RecordingEvent::Active) if !json => {
                eprintln!("Recording... press Ctrl-C to stop")
            }
            Ok(RecordingEvent::Progress { records }) if !json => {
                eprintln!("  {records} frames recorded")
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} session events", skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_summary(summary: &RecordingSummary, json: bool) -> AppResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let stats = &summary.stats;
    match &summary.abort_reason {
        Some(reason) => println!("Session {} aborted: {}", summary.session_id, reason),
        None => println!("Session {} complete", summary.session_id),
    }
    println!("  Directory:        {}", summary.session_dir.display());
    println!("  Duration:         {:.1}s", summary.duration_secs);
    println!("  Records written:  {}", stats.records_written);
    println!("  Records degraded: {}", stats.records_degraded);
    println!("  Samples dropped:  {}", stats.samples_dropped);
    println!("  Out-of-order:     {}", stats.frames_out_of_order);
    println!(
        "  IMU readings:     {} ({} too stale)",
        stats.imu_received, stats.imu_rejected_stale
    );
    for file in &summary.output_files {
        println!("  Output:           {}", file.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;
    use fusion_recorder::recorder::VideoFormat;
    use tempfile::tempdir;

    fn record_args(argv: &[&str]) -> RecordArgs {
        let mut full = vec!["fusion-recorder", "record"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Record(args) => args,
            Command::Config(_) => panic!("expected record"),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recorder.json");
        std::fs::write(&path, r#"{ "fps": 30, "failureThreshold": 5 }"#).unwrap();

        let config = record_args(&[
            "--config",
            path.to_str().unwrap(),
            "--fps",
            "60",
            "--format",
            "raw-bgr",
            "--frames",
            "10",
            "--no-realtime",
            "--no-gaze-overlay",
        ])
        .resolve_config()
        .unwrap();

        assert_eq!(config.fps, 60.0);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.video_format, VideoFormat::RawBgr);
        assert!(!config.gaze_overlay);
        let SourceConfig::Simulated(sim) = config.source;
        assert_eq!(sim.max_frames, Some(10));
        assert!(!sim.realtime);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let err = record_args(&["--failure-threshold", "0"]).resolve_config().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_bounded_simulated_session_records() {
        let dir = tempdir().unwrap();
        let args = record_args(&[
            "--output",
            dir.path().to_str().unwrap(),
            "--format",
            "raw-bgr",
            "--frames",
            "12",
            "--no-realtime",
        ]);

        execute(args, true).await.unwrap();

        let session_dir = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let manifest = std::fs::read_to_string(session_dir.join("session.json")).unwrap();
        let summary: RecordingSummary = serde_json::from_str(&manifest).unwrap();
        assert_eq!(summary.stats.records_written, 12);
        assert!(session_dir.join("scene_output.bgr").exists());
    }
}
