pub mod frame;
pub mod source;
pub mod synthetic;
pub mod v4l2;

pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
pub use source::{FrameSource, StreamMode};
pub use synthetic::SyntheticSource;
pub use v4l2::V4l2Source;
