//! Boundary to the real-time room.
//!
//! The room SDK itself is an external collaborator; the agent only consumes
//! the narrow surface defined here: a feed of room events, a frame stream
//! per subscribed audio track, and a publish operation for transcript
//! events.

pub mod event;

pub use event::{TRANSCRIPT_TOPIC, TranscriptEvent};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One frame of signed 16-bit little-endian PCM as delivered by the room,
/// at the fixed rate and channel count the bridge was asked for.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Identity of a room participant.
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    /// Opaque identifier, unique per room membership.
    pub identity: String,
    pub name: Option<String>,
}

impl ParticipantInfo {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Speaker {}", self.identity))
    }
}

/// Frame stream for one subscribed audio track. The stream ends when the
/// track ends; the bridge is expected to end every track's stream when the
/// room itself goes away.
#[derive(Debug)]
pub struct AudioTrack {
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Room lifecycle notifications the bridge delivers to the agent.
#[derive(Debug)]
pub enum RoomEvent {
    TrackSubscribed {
        track: AudioTrack,
        participant: ParticipantInfo,
    },
    ParticipantDisconnected {
        identity: String,
    },
    RoomDisconnected,
}

/// Publishes transcript events back to the room as reliable, topic-tagged
/// data messages.
#[async_trait]
pub trait TranscriptPublisher: Send + Sync {
    async fn publish(&self, event: &TranscriptEvent) -> anyhow::Result<()>;
}
