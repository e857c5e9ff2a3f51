pub mod protocol;
pub mod registry;
pub mod session;

pub use protocol::{Segment, SegmentBatch, SessionConfig};
pub use registry::{AlreadyRegistered, SessionRegistry};
pub use session::{
    ReadyError, SessionError, SessionState, TranscriptCallback, TranscriptionSession,
};
