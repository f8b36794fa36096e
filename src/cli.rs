use clap::{Args, Parser, Subcommand};
use fusion_recorder::recorder::VideoFormat;
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted --duration, one week
const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Parser)]
#[command(
    name = "fusion-recorder",
    version,
    about = "Record scene video, gaze and IMU data in lockstep",
    long_about = "Record a head-mounted eye tracker's scene camera, gaze estimate and IMU into\n\
                  one CSV row per scene frame plus a scene video. Encoded formats require\n\
                  ffmpeg on PATH; use --format raw-bgr to write frames directly."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Print results and errors as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record a session until Ctrl-C, the end of the stream, or --duration
    Record(RecordArgs),
    /// Print the default configuration, or validate a configuration file
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RecordArgs {
    /// JSON configuration file; flags below override its fields
    #[arg(long, env = "FUSION_RECORDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory receiving one subdirectory per session
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Scene video format (mpeg4-avi, h264-mp4, raw-bgr)
    #[arg(long)]
    pub format: Option<VideoFormat>,

    /// Nominal scene video frame rate
    #[arg(long)]
    pub fps: Option<f64>,

    /// Leave out IMU readings further than this many seconds from the frame
    #[arg(long)]
    pub max_imu_staleness: Option<f64>,

    /// Consecutive failed appends before the session aborts
    #[arg(long)]
    pub failure_threshold: Option<u32>,

    /// Stop after this many seconds
    #[arg(long, value_parser = parse_positive_secs)]
    pub duration: Option<Duration>,

    /// Simulated device: end the stream after this many scene frames
    #[arg(long)]
    pub frames: Option<u64>,

    /// Simulated device: produce samples as fast as possible
    #[arg(long)]
    pub no_realtime: bool,

    /// Record frames without the gaze marker
    #[arg(long)]
    pub no_gaze_overlay: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Load and validate this file instead of printing the defaults
    #[arg(long)]
    pub check: Option<PathBuf>,
}

fn parse_positive_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !(secs > 0.0 && secs <= MAX_DURATION_SECS) {
        return Err(format!(
            "expected a number of seconds in (0, {MAX_DURATION_SECS}], got {s}"
        ));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{s}: {e}"))
}
