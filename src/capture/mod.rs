pub mod convert;
pub mod frame;
pub mod source;
pub mod synthetic;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;

pub use frame::{Frame, FrameMut, PixelFormat};
pub use source::{FrameChannel, FrameSource, RecordingChannel};
pub use synthetic::SyntheticSource;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstSource;
