pub mod capture_loop;
pub mod delay;
pub mod shared;

pub use capture_loop::{CaptureLoop, LoopOptions, StreamHandle};
pub use delay::DelayBuffer;
pub use shared::{DelayControl, LoopState, SharedState, StatsSnapshot, DELAY_EPSILON};
