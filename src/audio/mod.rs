pub mod chunk;
pub mod codec;
pub mod recorder;

pub use chunk::ChunkBuffer;
pub use recorder::{DebugRecorder, RecorderConfig, RecorderHandle};
