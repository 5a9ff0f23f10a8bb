//! Frame source abstraction

use serde::{Deserialize, Serialize};

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::SourceError;

/// Mode a source actually delivers, which may differ from the one requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

/// A device that produces frames on demand.
///
/// Implementations are driven by exactly one capture thread, so `capture`
/// takes `&mut self` and may block until the device has a frame.
pub trait FrameSource: Send + 'static {
    /// Short identifier used in logs and metric labels.
    fn name(&self) -> &str;

    /// Negotiated mode.
    fn mode(&self) -> StreamMode;

    /// Pull the next frame. [`SourceError::NoFrame`] means "try again".
    fn capture(&mut self) -> Result<Frame, SourceError>;

    /// Release the device. Called once, after the capture thread has exited.
    fn close(&mut self) {}
}

impl FrameSource for Box<dyn FrameSource> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn mode(&self) -> StreamMode {
        (**self).mode()
    }

    fn capture(&mut self) -> Result<Frame, SourceError> {
        (**self).capture()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
