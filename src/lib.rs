//! Live room transcription bridge.
//!
//! Streams each participant's audio from a real-time room to a remote
//! speech-recognition server over a persistent websocket connection and
//! republishes the recognized text to the room as structured transcript
//! events. Each concurrently active speaker gets an independent
//! [`session::TranscriptionSession`]; the [`agent::TranscriptionAgent`]
//! coordinates their lifecycles against the room's event feed.
//!
//! The room SDK itself stays outside this crate: implement
//! [`room::TranscriptPublisher`] and feed [`room::RoomEvent`]s from your
//! bridge of choice.

pub mod agent;
pub mod audio;
pub mod config;
pub mod room;
pub mod session;

pub use agent::TranscriptionAgent;
pub use config::Settings;
pub use room::{
    AudioFrame, AudioTrack, ParticipantInfo, RoomEvent, TranscriptEvent, TranscriptPublisher,
};
pub use session::{SessionRegistry, SessionState, TranscriptionSession};
