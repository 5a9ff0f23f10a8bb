//! V4L2 capture source with memory-mapped buffers

use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{FrameSource, StreamMode};
use crate::error::SourceError;
use crate::utils::parse_device_index;
use crate::SourceConfig;

/// Camera opened through V4L2 and streamed with mmap buffers
pub struct V4l2Source {
    name: String,
    stream: Option<MmapStream<'static>>,
    // Kept alive for the lifetime of the stream
    _device: Box<Device>,
    mode: StreamMode,
    stride: u32,
    sequence: u64,
    /// Last dequeue timed out; the driver still holds the buffer `next` would requeue
    stalled: bool,
}

/// How long one capture call may wait for the driver before reporting a miss
fn stall_timeout(fps: u32) -> Duration {
    (Duration::from_secs(4) / fps.max(1)).max(Duration::from_millis(100))
}

impl V4l2Source {
    /// Open the device, request the configured mode and start streaming.
    ///
    /// The device may negotiate a different mode; the difference is logged and
    /// the negotiated mode is what [`FrameSource::mode`] reports.
    #[instrument(skip(config), fields(device = %config.device))]
    pub fn open(config: &SourceConfig) -> Result<Self, SourceError> {
        let open_err = |source: io::Error| SourceError::Open {
            device: config.device.clone(),
            source,
        };

        let device = match parse_device_index(&config.device) {
            Some(index) => Device::new(index),
            None => Device::with_path(&config.device),
        }
        .map_err(open_err)?;

        let caps = device.query_caps().map_err(open_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Unsupported(format!(
                "{} doesn't support video capture",
                config.device
            )));
        }

        let mut fmt = device.format().map_err(open_err)?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(&config.format.fourcc());
        let actual = device.set_format(&fmt).map_err(open_err)?;

        let format = PixelFormat::from_fourcc(&actual.fourcc.repr).ok_or_else(|| {
            SourceError::Unsupported(format!("device negotiated fourcc {}", actual.fourcc))
        })?;

        let params = device
            .set_params(&Parameters::with_fps(config.fps))
            .map_err(open_err)?;
        let fps = match params.interval.numerator {
            0 => config.fps,
            n => params.interval.denominator / n,
        };

        let mode = StreamMode {
            width: actual.width,
            height: actual.height,
            fps,
            format,
        };
        if mode.width != config.width
            || mode.height != config.height
            || mode.fps != config.fps
            || mode.format != config.format
        {
            warn!(
                "Requested {}x{}@{} {:?}, device negotiated {}x{}@{} {:?}",
                config.width,
                config.height,
                config.fps,
                config.format,
                mode.width,
                mode.height,
                mode.fps,
                mode.format
            );
        }

        let device = Box::new(device);
        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(open_err)?;
        // Without a timeout a stalled device blocks the capture thread for good
        let timeout = stall_timeout(mode.fps);
        stream.set_timeout(timeout);
        info!(
            "Capture stream started with {} buffers, timeout {:?}",
            config.buffer_count, timeout
        );

        Ok(Self {
            name: config.name.clone(),
            stream: Some(stream),
            _device: device,
            mode,
            stride: actual.stride,
            sequence: 0,
            stalled: false,
        })
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> StreamMode {
        self.mode
    }

    fn capture(&mut self) -> Result<Frame, SourceError> {
        let timestamp = Instant::now();

        let stream = self.stream.as_mut().ok_or(SourceError::NoFrame)?;

        if self.stalled {
            // Collect the frame the timed-out call was waiting for so `next`
            // requeues a buffer we actually own; its payload is dropped
            return match CaptureStream::dequeue(stream) {
                Ok(_) => {
                    self.stalled = false;
                    Err(SourceError::NoFrame)
                }
                Err(e) if is_timeout(&e) => Err(SourceError::NoFrame),
                Err(e) => Err(SourceError::Io(e)),
            };
        }

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if is_timeout(&e) => {
                self.stalled = true;
                return Err(SourceError::NoFrame);
            }
            Err(e) => return Err(SourceError::Io(e)),
        };

        // MJPEG buffers are larger than the payload; bytesused marks the end
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        if used == 0 {
            return Err(SourceError::NoFrame);
        }
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;

        let frame_meta = FrameMetadata {
            sequence: self.sequence,
            width: self.mode.width,
            height: self.mode.height,
            stride: self.stride,
            format: self.mode.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        };

        let mut frame = Frame::new(data, frame_meta);
        frame.timestamp = timestamp;
        Ok(frame)
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Capture stream for {} closed", self.name);
        }
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_timeout_spans_several_frames() {
        assert_eq!(stall_timeout(30), Duration::from_secs(4) / 30);
        assert_eq!(stall_timeout(0), Duration::from_secs(4));
        // Very high rates still get a usable poll window
        assert_eq!(stall_timeout(1000), Duration::from_millis(100));
    }
}
