//! Outbound transcript events, published to the room as data messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Topic tag for outbound transcript publishes.
pub const TRANSCRIPT_TOPIC: &str = "transcript";

/// One transcription result for one speaker. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub id: String,
    pub participant_identity: String,
    pub participant_name: String,
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn new(
        participant_identity: impl Into<String>,
        participant_name: impl Into<String>,
        text: impl Into<String>,
        is_final: bool,
    ) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        Self {
            id: format!("transcript-{timestamp}"),
            participant_identity: participant_identity.into(),
            participant_name: participant_name.into(),
            text: text.into(),
            timestamp,
            is_final,
        }
    }

    /// Wire payload for the room data channel: the event wrapped in a typed
    /// envelope.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            r#type: &'static str,
            entry: &'a TranscriptEvent,
        }

        serde_json::to_vec(&Envelope {
            r#type: TRANSCRIPT_TOPIC,
            entry: self,
        })
    }
}
