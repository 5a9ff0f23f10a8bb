use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp, restamped by the capture loop when the frame enters the buffer
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Age of this frame relative to `now`, zero if `now` is earlier.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Bytes of one full frame for packed/planar raw formats, `None` for compressed ones.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::Yuyv4 => Some(pixels * 2),
            PixelFormat::Nv12 => Some(pixels * 3 / 2),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Bytes of one unpadded row for packed layouts, `None` for planar and compressed ones.
    pub fn row_bytes(self, width: u32) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(width as usize * 3),
            PixelFormat::Yuyv4 => Some(width as usize * 2),
            PixelFormat::Nv12 | PixelFormat::Mjpeg => None,
        }
    }

    /// Name ffmpeg uses for this layout when reading `rawvideo`.
    pub fn ffmpeg_pix_fmt(self) -> Option<&'static str> {
        match self {
            PixelFormat::Rgb24 => Some("rgb24"),
            PixelFormat::Bgr24 => Some("bgr24"),
            PixelFormat::Yuyv4 => Some("yuyv422"),
            PixelFormat::Nv12 => Some("nv12"),
            PixelFormat::Mjpeg => None,
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Nv12 => *b"NV12",
        }
    }

    pub fn from_fourcc(repr: &[u8; 4]) -> Option<Self> {
        match repr {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"YUYV" => Some(PixelFormat::Yuyv4),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_sizes() {
        assert_eq!(PixelFormat::Rgb24.frame_size(4, 2), Some(24));
        assert_eq!(PixelFormat::Yuyv4.frame_size(4, 2), Some(16));
        assert_eq!(PixelFormat::Nv12.frame_size(4, 2), Some(12));
        assert_eq!(PixelFormat::Mjpeg.frame_size(4, 2), None);
        assert_eq!(PixelFormat::Yuyv4.row_bytes(4), Some(8));
        assert_eq!(PixelFormat::Nv12.row_bytes(4), None);
    }

    #[test]
    fn fourcc_is_reversible() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Yuyv4,
            PixelFormat::Mjpeg,
            PixelFormat::Nv12,
        ] {
            assert_eq!(PixelFormat::from_fourcc(&format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }

    #[test]
    fn age_saturates() {
        let frame = Frame::new(Bytes::from_static(&[0; 3]), meta(1));
        let earlier = frame.timestamp - Duration::from_secs(1);
        assert_eq!(frame.age(earlier), Duration::ZERO);
        assert_eq!(
            frame.age(frame.timestamp + Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }

    fn meta(sequence: u64) -> FrameMetadata {
        FrameMetadata {
            sequence,
            width: 1,
            height: 1,
            stride: 3,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        }
    }
}
