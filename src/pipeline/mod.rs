pub mod recorder;
pub mod slot;
pub mod transcoder;

pub use recorder::{Clip, ClipRecorder, RecorderState};
pub use slot::{PreviewFrame, PreviewSlot, PreviewSubscriber};
pub use transcoder::PreviewTranscoder;
