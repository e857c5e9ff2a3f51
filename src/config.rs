//! Environment-driven configuration.
//!
//! Every tunable has a default matching the reference deployment; set the
//! corresponding variable (optionally via a `.env` file) to override it.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::audio::RecorderConfig;
use crate::session::SessionConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub asr: AsrSettings,
    pub audio: AudioSettings,
    pub session: SessionSettings,
    pub debug_audio: RecorderConfig,
}

/// Endpoint and model parameters for the speech-recognition server.
#[derive(Debug, Clone)]
pub struct AsrSettings {
    pub host: String,
    pub port: u16,
    /// Target language; `None` lets the server detect it.
    pub language: Option<String>,
    pub model: String,
    pub use_vad: bool,
    pub send_last_n_segments: u32,
    pub no_speech_thresh: f64,
    pub clip_audio: bool,
    pub same_output_threshold: u32,
    pub enable_translation: bool,
    pub target_language: String,
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame size in bytes for the outbound audio stream.
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bound on the readiness handshake.
    pub ready_timeout: Duration,
    /// Maximum gap between qualifying inbound activity before a streaming
    /// session counts as stale.
    pub liveness_window: Duration,
    /// How often the sweeper scans for stale sessions.
    pub liveness_check_interval: Duration,
}

impl Default for AsrSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9090,
            language: None,
            model: "small".to_string(),
            use_vad: true,
            send_last_n_segments: 10,
            no_speech_thresh: 0.45,
            clip_audio: false,
            same_output_threshold: 10,
            enable_translation: false,
            target_language: "en".to_string(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_size: 4096,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            liveness_window: Duration::from_secs(15),
            liveness_check_interval: Duration::from_secs(5),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            asr: AsrSettings::default(),
            audio: AudioSettings::default(),
            session: SessionSettings::default(),
            debug_audio: RecorderConfig::default(),
        }
    }
}

impl AsrSettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Build the configuration message for a new session, with a fresh uid.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            uid: Uuid::new_v4().to_string(),
            language: self.language.clone(),
            task: "transcribe".to_string(),
            model: self.model.clone(),
            use_vad: self.use_vad,
            send_last_n_segments: self.send_last_n_segments,
            no_speech_thresh: self.no_speech_thresh,
            clip_audio: self.clip_audio,
            same_output_threshold: self.same_output_threshold,
            enable_translation: self.enable_translation,
            target_language: self.target_language.clone(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment, reading a `.env` file
    /// first if present. Unset or unparsable variables fall back to their
    /// defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Settings::default();

        let asr = AsrSettings {
            host: var_or("WHISPER_HOST", defaults.asr.host),
            port: var_or("WHISPER_PORT", defaults.asr.port),
            language: env::var("WHISPER_LANGUAGE").ok().filter(|v| !v.is_empty()),
            model: var_or("WHISPER_MODEL", defaults.asr.model),
            use_vad: var_or("WHISPER_USE_VAD", defaults.asr.use_vad),
            send_last_n_segments: defaults.asr.send_last_n_segments,
            no_speech_thresh: defaults.asr.no_speech_thresh,
            clip_audio: defaults.asr.clip_audio,
            same_output_threshold: defaults.asr.same_output_threshold,
            enable_translation: defaults.asr.enable_translation,
            target_language: defaults.asr.target_language,
        };

        let audio = AudioSettings {
            sample_rate: var_or("AUDIO_SAMPLE_RATE", defaults.audio.sample_rate),
            channels: var_or("AUDIO_CHANNELS", defaults.audio.channels),
            chunk_size: var_or("AUDIO_CHUNK_SIZE", defaults.audio.chunk_size),
        };

        let session = SessionSettings {
            ready_timeout: secs_or("SESSION_READY_TIMEOUT_SECS", defaults.session.ready_timeout),
            liveness_window: secs_or(
                "SESSION_LIVENESS_WINDOW_SECS",
                defaults.session.liveness_window,
            ),
            liveness_check_interval: secs_or(
                "SESSION_LIVENESS_CHECK_SECS",
                defaults.session.liveness_check_interval,
            ),
        };

        let debug_audio = RecorderConfig {
            enabled: var_or("DEBUG_SAVE_AUDIO", defaults.debug_audio.enabled),
            dir: env::var("DEBUG_AUDIO_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.debug_audio.dir),
            roll: secs_or("DEBUG_AUDIO_ROLL_SECS", defaults.debug_audio.roll),
            participants: env::var("DEBUG_PARTICIPANT_FILTER")
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| v.split(',').map(|p| p.trim().to_string()).collect()),
            sample_rate: audio.sample_rate,
        };

        Settings {
            asr,
            audio,
            session,
            debug_audio,
        }
    }
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}
