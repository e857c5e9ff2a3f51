//! Rolling debug capture of outbound audio.
//!
//! Persists the same float chunks a session sends to the server as WAV
//! files, one file per roll interval, for offline inspection. Purely
//! observational: every failure is logged and nothing propagates back into
//! the audio path.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::codec;

/// Capture configuration, normally loaded from the environment.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub enabled: bool,
    /// Directory WAV chunks are written to.
    pub dir: PathBuf,
    /// Roll interval; `Duration::ZERO` keeps one unbounded recording that is
    /// written only on finish.
    pub roll: Duration,
    /// Identities to capture; `None` captures every participant.
    pub participants: Option<Vec<String>>,
    pub sample_rate: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("debug_audio"),
            roll: Duration::from_secs(5),
            participants: None,
            sample_rate: 16_000,
        }
    }
}

impl RecorderConfig {
    fn should_record(&self, identity: &str) -> bool {
        self.enabled
            && self
                .participants
                .as_ref()
                .is_none_or(|list| list.iter().any(|p| p == identity))
    }
}

#[derive(Debug)]
enum RecorderMessage {
    Samples(Vec<f32>),
    Finish,
}

/// Cheap handle for feeding the capture worker. A handle created for a
/// participant the configuration excludes is inert.
#[derive(Debug, Clone)]
pub struct RecorderHandle {
    tx: Option<mpsc::UnboundedSender<RecorderMessage>>,
}

impl RecorderHandle {
    pub fn record(&self, samples: &[f32]) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(RecorderMessage::Samples(samples.to_vec()));
        }
    }

    /// Flush the remaining buffer and stop the worker.
    pub fn finish(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(RecorderMessage::Finish);
        }
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }
}

/// Worker that buffers samples and cuts WAV chunks on the roll interval.
pub struct DebugRecorder {
    identity: String,
    dir: PathBuf,
    roll: Duration,
    sample_rate: u32,
    buffer: Vec<f32>,
    chunk_index: u32,
    last_roll: Instant,
    rx: mpsc::UnboundedReceiver<RecorderMessage>,
}

impl DebugRecorder {
    /// Build a handle and, when capture applies to `identity`, the worker to
    /// spawn alongside it.
    pub fn new(config: &RecorderConfig, identity: &str) -> (RecorderHandle, Option<DebugRecorder>) {
        if !config.should_record(identity) {
            return (RecorderHandle { tx: None }, None);
        }

        if let Err(err) = std::fs::create_dir_all(&config.dir) {
            warn!(
                dir = %config.dir.display(),
                error = %err,
                "failed to create debug audio directory, capture disabled"
            );
            return (RecorderHandle { tx: None }, None);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = DebugRecorder {
            identity: identity.to_string(),
            dir: config.dir.clone(),
            roll: config.roll,
            sample_rate: config.sample_rate,
            buffer: Vec::new(),
            chunk_index: 0,
            last_roll: Instant::now(),
            rx,
        };

        (RecorderHandle { tx: Some(tx) }, Some(worker))
    }

    pub async fn run(mut self) {
        info!(
            identity = %self.identity,
            dir = %self.dir.display(),
            "debug audio capture started"
        );

        while let Some(msg) = self.rx.recv().await {
            match msg {
                RecorderMessage::Samples(samples) => {
                    self.buffer.extend_from_slice(&samples);
                    if !self.roll.is_zero() && self.last_roll.elapsed() >= self.roll {
                        self.write_chunk();
                        self.last_roll = Instant::now();
                    }
                }
                RecorderMessage::Finish => break,
            }
        }

        // Remainder of the rolling buffer becomes the final chunk.
        self.write_chunk();

        info!(
            identity = %self.identity,
            chunks = self.chunk_index,
            "debug audio capture finished"
        );
    }

    fn write_chunk(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        self.chunk_index += 1;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!(
            "{}_chunk{:03}_{}.wav",
            self.identity, self.chunk_index, stamp
        ));

        let samples = codec::f32_to_pcm16(&std::mem::take(&mut self.buffer));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = match hound::WavWriter::create(&path, spec) {
            Ok(writer) => writer,
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to create debug WAV");
                return;
            }
        };

        for sample in &samples {
            if let Err(err) = writer.write_sample(*sample) {
                error!(path = %path.display(), error = %err, "failed to write debug WAV");
                return;
            }
        }

        if let Err(err) = writer.finalize() {
            error!(path = %path.display(), error = %err, "failed to finalize debug WAV");
            return;
        }

        info!(
            identity = %self.identity,
            path = %path.display(),
            secs = samples.len() as f64 / self.sample_rate as f64,
            "saved debug audio chunk"
        );
    }
}
