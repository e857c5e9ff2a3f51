//! Wire messages exchanged with the speech-recognition server.
//!
//! Control messages are JSON text frames; audio is raw binary. Each
//! connection serves exactly one session, but every message still carries
//! the session uid and anything addressed elsewhere is dropped.

use serde::{Deserialize, Serialize};

/// Sentinel value of the `message` field announcing readiness.
const SERVER_READY: &str = "SERVER_READY";
/// Sentinel value of the `message` field ordering the client to go away.
const DISCONNECT: &str = "DISCONNECT";

/// Initial configuration message, sent once right after the connection
/// opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub uid: String,
    /// Target language; `None` lets the server detect it.
    pub language: Option<String>,
    pub task: String,
    pub model: String,
    pub use_vad: bool,
    pub send_last_n_segments: u32,
    pub no_speech_thresh: f64,
    pub clip_audio: bool,
    pub same_output_threshold: u32,
    pub enable_translation: bool,
    pub target_language: String,
}

/// One unit of recognized speech as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// Inbound JSON frame, before classification. The server reuses a handful
/// of optional fields rather than a tagged scheme, so everything is
/// optional here and [`classify`] decides what the message means.
#[derive(Debug, Deserialize)]
pub struct RawServerMessage {
    pub uid: Option<String>,
    pub status: Option<String>,
    /// Either a sentinel string, a human-readable detail, or (for `WAIT`)
    /// the estimated wait in minutes.
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    pub backend: Option<String>,
    pub language: Option<String>,
    pub language_prob: Option<f64>,
    pub segments: Option<Vec<Segment>>,
}

impl RawServerMessage {
    /// Whether this message is addressed to the session with `uid`.
    pub fn is_for(&self, uid: &str) -> bool {
        self.uid.as_deref() == Some(uid)
    }
}

/// Server status values carried by a `status` message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerStatus {
    /// Server at capacity; estimated wait in minutes.
    Wait { estimated_minutes: f64 },
    Error { detail: Option<String> },
    Warning { detail: Option<String> },
}

/// A classified inbound message, the input to the session's transition
/// function.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Status(ServerStatus),
    Ready { backend: Option<String> },
    Disconnect,
    LanguageDetected { language: String, probability: f64 },
    Segments(Vec<Segment>),
    /// Carried nothing this client acts on.
    Ignored,
}

/// Classify a raw message. Checks mirror the server's conventions in
/// priority order: explicit status first, then the sentinel `message`
/// values, then detection notices, then transcription results.
pub fn classify(raw: RawServerMessage) -> Inbound {
    if let Some(status) = raw.status.as_deref() {
        let detail = raw
            .message
            .as_ref()
            .and_then(|m| m.as_str())
            .map(str::to_string);
        return match status {
            "WAIT" => Inbound::Status(ServerStatus::Wait {
                estimated_minutes: raw.message.as_ref().and_then(|m| m.as_f64()).unwrap_or(0.0),
            }),
            "ERROR" => Inbound::Status(ServerStatus::Error { detail }),
            "WARNING" => Inbound::Status(ServerStatus::Warning { detail }),
            _ => Inbound::Ignored,
        };
    }

    match raw.message.as_ref().and_then(|m| m.as_str()) {
        Some(DISCONNECT) => return Inbound::Disconnect,
        Some(SERVER_READY) => {
            return Inbound::Ready {
                backend: raw.backend,
            };
        }
        _ => {}
    }

    if let Some(language) = raw.language {
        return Inbound::LanguageDetected {
            language,
            probability: raw.language_prob.unwrap_or(0.0),
        };
    }

    if let Some(segments) = raw.segments {
        return Inbound::Segments(segments);
    }

    Inbound::Ignored
}

/// Text and finality of one segment batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentBatch {
    pub text: String,
    pub is_final: bool,
}

/// Collapse a segment list into one batch: keep distinct non-empty texts,
/// skipping a segment only when its trimmed text equals the immediately
/// preceding kept text, and join with single spaces. Finality is the
/// completion flag of the last listed segment, collapsed or not. Returns
/// `None` when nothing remains.
pub fn collapse_segments(segments: &[Segment]) -> Option<SegmentBatch> {
    let last = segments.last()?;

    let mut kept: Vec<&str> = Vec::new();
    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        if kept.last() == Some(&text) {
            continue;
        }
        kept.push(text);
    }

    if kept.is_empty() {
        return None;
    }

    Some(SegmentBatch {
        text: kept.join(" "),
        is_final: last.completed,
    })
}
