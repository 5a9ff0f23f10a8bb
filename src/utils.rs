use std::path::Path;

use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Numeric device ids (`"0"`, `"video2"`) map to `/dev/videoN`.
pub fn parse_device_index(device: &str) -> Option<usize> {
    let trimmed = device.trim();
    let digits = trimmed.strip_prefix("video").unwrap_or(trimmed);
    digits.parse().ok()
}

/// Probe `/dev/video0..max_index` for capture devices, preferring MJPEG over YUYV.
pub fn detect_devices(max_index: usize) -> Vec<FoundDevice> {
    let mut found = Vec::new();

    for i in 0..max_index {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        let fourccs: Vec<FourCC> = formats.iter().map(|f| f.fourcc).collect();
        let format = if fourccs.contains(&FourCC::new(b"MJPG")) {
            PixelFormat::Mjpeg
        } else if fourccs.contains(&FourCC::new(b"YUYV")) {
            PixelFormat::Yuyv4
        } else {
            continue;
        };

        info!("Found {:?} device: {} - {}", format, path, caps.card);
        found.push(FoundDevice { path, format });
    }

    found
}

/// First usable capture device
pub fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");
    detect_devices(10).into_iter().next()
}
