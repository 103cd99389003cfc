pub mod decoder;
pub mod frame;
pub mod source;
pub mod synthetic;
pub mod v4l2;

pub use frame::PixelFormat;
pub use frame::RawFrame;
pub use source::{CaptureError, DeviceSelector, FrameSource};
pub use synthetic::SyntheticSource;
pub use v4l2::V4l2Source;
