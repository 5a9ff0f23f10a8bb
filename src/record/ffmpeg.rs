//! FFmpeg subprocess encoder
//!
//! Frames are piped to ffmpeg's stdin; codec and container are ffmpeg's
//! business. Raw layouts go in as `rawvideo`, MJPEG payloads as an `mjpeg`
//! stream.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::{debug, warn};

use crate::capture::StreamMode;
use crate::error::RecordError;
use crate::record::{Encoder, EncoderFactory};
use crate::{Frame, RecordingConfig};

/// Spawns one ffmpeg process per recording session
#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    ffmpeg_path: PathBuf,
    codec: String,
    preset: String,
    crf: u32,
    container: String,
}

impl FfmpegEncoderFactory {
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            codec: config.codec.clone(),
            preset: config.preset.clone(),
            crf: config.crf,
            container: config.container.clone(),
        }
    }

    /// Full ffmpeg argument list for one session.
    pub fn args(&self, destination: &Path, mode: &StreamMode) -> Vec<String> {
        let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y"]);

        match mode.format.ffmpeg_pix_fmt() {
            Some(pix_fmt) => {
                args.extend(strings(&["-f", "rawvideo", "-pixel_format", pix_fmt]));
                args.push("-video_size".into());
                args.push(format!("{}x{}", mode.width, mode.height));
            }
            None => args.extend(strings(&["-f", "mjpeg"])),
        }

        args.push("-framerate".into());
        args.push(mode.fps.max(1).to_string());
        args.extend(strings(&["-i", "-", "-an", "-c:v", self.codec.as_str()]));
        if self.codec == "libx264" || self.codec == "libx265" {
            args.extend(strings(&["-preset", self.preset.as_str(), "-crf"]));
            args.push(self.crf.to_string());
        }
        args.extend(strings(&["-pix_fmt", "yuv420p"]));
        args.push(destination.to_string_lossy().into_owned());
        args
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn extension(&self) -> &str {
        &self.container
    }

    fn open(&self, destination: &Path, mode: &StreamMode) -> Result<Box<dyn Encoder>, RecordError> {
        let unavailable = |reason: String| RecordError::SinkUnavailable {
            destination: destination.to_path_buf(),
            reason,
        };

        // ffmpeg opens its output lazily; make sure it can be written now
        File::create(destination).map_err(|e| unavailable(e.to_string()))?;

        let args = self.args(destination, mode);
        debug!("Spawning {} {}", self.ffmpeg_path.display(), args.join(" "));

        let mut process = match Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
        {
            Ok(process) => process,
            Err(e) => {
                let _ = fs::remove_file(destination);
                return Err(unavailable(format!(
                    "failed to start {}: {}",
                    self.ffmpeg_path.display(),
                    e
                )));
            }
        };

        if let Ok(Some(status)) = process.try_wait() {
            return Err(unavailable(format!("ffmpeg exited immediately with {status}")));
        }

        let Some(stdin) = process.stdin.take() else {
            let _ = process.kill();
            let _ = process.wait();
            return Err(unavailable("failed to capture ffmpeg stdin".into()));
        };

        let frame_size = mode
            .format
            .frame_size(mode.width, mode.height)
            .unwrap_or(1 << 20);
        Ok(Box::new(FfmpegEncoder {
            process,
            stdin: Some(BufWriter::with_capacity(frame_size, stdin)),
            expected_size: mode.format.frame_size(mode.width, mode.height),
            frames: 0,
        }))
    }
}

/// Payload of a raw frame as ffmpeg expects it: exactly `expected` bytes.
///
/// Packed rows padded to a larger stride are repacked; any other size is an error.
fn raw_payload(frame: &Frame, expected: usize) -> io::Result<Cow<'_, [u8]>> {
    let data = &frame.data[..];
    if data.len() == expected {
        return Ok(Cow::Borrowed(data));
    }

    let meta = &frame.meta;
    let stride = meta.stride as usize;
    let height = meta.height as usize;
    match meta.format.row_bytes(meta.width) {
        Some(row)
            if stride > row
                && row * height == expected
                && data.len() >= stride * height.saturating_sub(1) + row =>
        {
            let mut packed = Vec::with_capacity(expected);
            for line in data.chunks(stride).take(height) {
                packed.extend_from_slice(&line[..row]);
            }
            Ok(Cow::Owned(packed))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame {} has {} bytes (stride {}), expected {}",
                frame.sequence(),
                data.len(),
                stride,
                expected
            ),
        )),
    }
}

/// Feeds one ffmpeg process
pub struct FfmpegEncoder {
    process: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    /// Raw layouts must arrive as exact frame-sized chunks
    expected_size: Option<usize>,
    frames: u64,
}

impl Encoder for FfmpegEncoder {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let payload = match self.expected_size {
            Some(expected) => raw_payload(frame, expected)?,
            None => Cow::Borrowed(&frame.data[..]),
        };
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdin closed"))?;
        stdin.write_all(&payload)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        // Dropping stdin sends EOF; the process is reaped whether or not the flush worked
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush(),
            None => Ok(()),
        };
        let status = self.process.wait()?;
        if let Err(e) = flushed {
            warn!("Flushing ffmpeg input failed: {}", e);
            return Err(e);
        }
        if !status.success() {
            return Err(io::Error::other(format!(
                "ffmpeg exited with {} after {} frames",
                status, self.frames
            )));
        }
        debug!("ffmpeg finished after {} frames", self.frames);
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            // Dropped without finish: don't leave ffmpeg waiting on input
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}
