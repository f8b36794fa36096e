//! Scene video sinks
//!
//! Frames are written in arrival order into one container per session at a
//! fixed nominal frame rate. The sink never drops or duplicates frames.

use crate::capture::{Resolution, VideoSample};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;

/// Container/codec used for the scene video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoFormat {
    /// MPEG-4 Part 2 tagged `mp4v` in an AVI container
    Mpeg4Avi,
    /// H.264 in MP4
    H264Mp4,
    /// Raw BGR24 frames back to back, no encoder required
    RawBgr,
}

impl VideoFormat {
    /// File extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            VideoFormat::Mpeg4Avi => "avi",
            VideoFormat::H264Mp4 => "mp4",
            VideoFormat::RawBgr => "bgr",
        }
    }

    /// FFmpeg output codec arguments, `None` for formats written directly
    fn ffmpeg_codec_args(&self) -> Option<Vec<&'static str>> {
        match self {
            VideoFormat::Mpeg4Avi => Some(vec!["-c:v", "mpeg4", "-vtag", "mp4v", "-q:v", "2"]),
            VideoFormat::H264Mp4 => Some(vec![
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-pix_fmt",
                "yuv420p",
                "-crf",
                "18",
                "-movflags",
                "+faststart",
            ]),
            VideoFormat::RawBgr => None,
        }
    }
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self::Mpeg4Avi
    }
}

impl std::str::FromStr for VideoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpeg4-avi" | "avi" => Ok(Self::Mpeg4Avi),
            "h264-mp4" | "mp4" => Ok(Self::H264Mp4),
            "raw-bgr" | "raw" => Ok(Self::RawBgr),
            other => Err(format!("unknown video format '{other}'")),
        }
    }
}

/// Destination for scene frames
pub trait VideoSink: Send {
    /// Submit one frame to the encoder
    fn write_frame(&mut self, frame: &VideoSample) -> io::Result<()>;

    /// Frames accepted so far
    fn frames_written(&self) -> u64;

    /// Finalize the container and return the files produced
    fn finish(&mut self) -> io::Result<Vec<PathBuf>>;
}

/// Opens a video sink once the scene resolution is known
pub type VideoSinkFactory = Arc<
    dyn Fn(VideoFormat, &Path, Resolution, f64) -> io::Result<Box<dyn VideoSink>> + Send + Sync,
>;

/// Factory producing the built-in sinks
pub fn default_video_factory() -> VideoSinkFactory {
    Arc::new(open_video_sink)
}

/// Open the sink for `format` at `stem` plus the format's extension
pub fn open_video_sink(
    format: VideoFormat,
    stem: &Path,
    resolution: Resolution,
    fps: f64,
) -> io::Result<Box<dyn VideoSink>> {
    let path = stem.with_extension(format.extension());
    match format.ffmpeg_codec_args() {
        Some(codec_args) => Ok(Box::new(FfmpegEncoder::spawn(
            &path,
            resolution,
            fps,
            &codec_args,
        )?)),
        None => Ok(Box::new(RawFrameFile::create(&path, resolution)?)),
    }
}

fn check_frame(frame: &VideoSample, expected: Resolution) -> io::Result<()> {
    if frame.resolution != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame resolution {} does not match container {}",
                frame.resolution, expected
            ),
        ));
    }
    if !frame.is_well_formed() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame buffer holds {} bytes, expected {}",
                frame.pixels.len(),
                expected.bgr_frame_len()
            ),
        ));
    }
    Ok(())
}

/// FFmpeg subprocess fed raw BGR24 frames over stdin
pub struct FfmpegEncoder {
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    resolution: Resolution,
    frame_count: u64,
}

impl FfmpegEncoder {
    fn spawn(
        output: &Path,
        resolution: Resolution,
        fps: f64,
        codec_args: &[&str],
    ) -> io::Result<Self> {
        if Command::new("ffmpeg").arg("-version").output().is_err() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "FFmpeg not found. Please install FFmpeg and add it to PATH.",
            ));
        }

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let size = resolution.to_string();
        let rate = fps.to_string();
        let output_file = output.to_string_lossy().to_string();

        // Keep stderr quiet; it is only read once the encoder exits
        let mut args: Vec<&str> = vec![
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pixel_format",
            "bgr24",
            "-video_size",
            size.as_str(),
            "-framerate",
            rate.as_str(),
            "-i",
            "-",
        ];
        args.extend_from_slice(codec_args);
        args.push(output_file.as_str());

        let mut process = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = process.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "Failed to capture FFmpeg stdin")
        })?;

        tracing::info!(
            "Started FFmpeg encoder: {} @ {}fps, output: {:?}",
            resolution,
            fps,
            output
        );

        Ok(Self {
            process: Some(process),
            stdin: Some(stdin),
            output: output.to_path_buf(),
            resolution,
            frame_count: 0,
        })
    }
}

impl VideoSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &VideoSample) -> io::Result<()> {
        check_frame(frame, self.resolution)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder already finished"))?;
        stdin.write_all(&frame.pixels)?;
        self.frame_count += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frame_count
    }

    fn finish(&mut self) -> io::Result<Vec<PathBuf>> {
        // Closing stdin lets FFmpeg flush and write the trailer
        drop(self.stdin.take());

        if let Some(process) = self.process.take() {
            let output = process.wait_with_output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!("FFmpeg exited with status {}: {}", output.status, stderr);
            }
        }

        tracing::info!(
            "FFmpeg finished: {} frames, output: {:?}",
            self.frame_count,
            self.output
        );

        let mut files = Vec::new();
        if self.output.exists() {
            files.push(self.output.clone());
        }
        Ok(files)
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            drop(self.stdin.take());
            let _ = process.wait();
        }
    }
}

/// Raw BGR24 frames appended to a single file
pub struct RawFrameFile {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    resolution: Resolution,
    frame_count: u64,
}

impl RawFrameFile {
    pub fn create(path: &Path, resolution: Resolution) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;

        tracing::info!("Writing raw {} BGR frames to {:?}", resolution, path);

        Ok(Self {
            writer: Some(BufWriter::with_capacity(resolution.bgr_frame_len(), file)),
            path: path.to_path_buf(),
            resolution,
            frame_count: 0,
        })
    }
}

impl VideoSink for RawFrameFile {
    fn write_frame(&mut self, frame: &VideoSample) -> io::Result<()> {
        check_frame(frame, self.resolution)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "raw video already finished")
            })?;
        writer.write_all(&frame.pixels)?;
        writer.flush()?;
        self.frame_count += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frame_count
    }

    fn finish(&mut self) -> io::Result<Vec<PathBuf>> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(vec![self.path.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::scripted::scripted_frame;
    use tempfile::tempdir;

    #[test]
    fn test_format_parsing_and_extension() {
        assert_eq!("mp4".parse::<VideoFormat>().unwrap(), VideoFormat::H264Mp4);
        assert_eq!("raw-bgr".parse::<VideoFormat>().unwrap().extension(), "bgr");
        assert!("gif".parse::<VideoFormat>().is_err());
        assert_eq!(VideoFormat::default().extension(), "avi");
    }

    #[test]
    fn test_raw_file_appends_frames_in_order() {
        let dir = tempdir().unwrap();
        let resolution = Resolution::new(2, 2);
        let stem = dir.path().join("scene");
        let mut sink = open_video_sink(VideoFormat::RawBgr, &stem, resolution, 25.0).unwrap();

        let mut first = scripted_frame(0.0, resolution);
        first.pixels.fill(1);
        let mut second = scripted_frame(0.04, resolution);
        second.pixels.fill(2);

        sink.write_frame(&first).unwrap();
        sink.write_frame(&second).unwrap();
        assert_eq!(sink.frames_written(), 2);

        let files = sink.finish().unwrap();
        assert_eq!(files, vec![dir.path().join("scene.bgr")]);

        let bytes = std::fs::read(&files[0]).unwrap();
        assert_eq!(bytes.len(), 24);
        assert!(bytes[..12].iter().all(|&b| b == 1));
        assert!(bytes[12..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_mismatched_frame_rejected() {
        let dir = tempdir().unwrap();
        let mut sink =
            RawFrameFile::create(&dir.path().join("scene.bgr"), Resolution::new(2, 2)).unwrap();

        let wrong = scripted_frame(0.0, Resolution::new(4, 2));
        let err = sink.write_frame(&wrong).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(sink.frames_written(), 0);
    }
}
