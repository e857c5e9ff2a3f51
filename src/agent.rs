//! Per-speaker orchestration against the room.
//!
//! One forwarding task per subscribed track, one liveness sweeper for the
//! whole agent. Failures in one speaker's pipeline are isolated: they tear
//! down that session and nothing else.

use std::sync::Arc;

use anyhow::Context as _;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::audio::chunk::ChunkBuffer;
use crate::audio::codec;
use crate::audio::recorder::DebugRecorder;
use crate::config::Settings;
use crate::room::{AudioTrack, ParticipantInfo, RoomEvent, TranscriptEvent, TranscriptPublisher};
use crate::session::{SessionRegistry, SessionState, TranscriptCallback, TranscriptionSession};

/// Drives transcription for one room: reacts to room events, runs the
/// per-speaker pipelines and publishes every transcript batch.
pub struct TranscriptionAgent {
    settings: Settings,
    registry: Arc<SessionRegistry>,
    publisher: Arc<dyn TranscriptPublisher>,
}

impl TranscriptionAgent {
    pub fn new(
        settings: Settings,
        registry: Arc<SessionRegistry>,
        publisher: Arc<dyn TranscriptPublisher>,
    ) -> Self {
        Self {
            settings,
            registry,
            publisher,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Consume room events until the room disconnects, then tear every
    /// remaining session down.
    pub async fn run(&self, mut events: mpsc::Receiver<RoomEvent>) -> anyhow::Result<()> {
        let sweeper = self.spawn_liveness_sweeper();

        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::TrackSubscribed { track, participant } => {
                    if self.registry.contains(&participant.identity) {
                        warn!(
                            identity = %participant.identity,
                            "session already active, ignoring new track"
                        );
                        continue;
                    }
                    info!(identity = %participant.identity, "new audio track");
                    tokio::spawn(run_speaker(
                        self.settings.clone(),
                        self.registry.clone(),
                        self.publisher.clone(),
                        track,
                        participant,
                    ));
                }
                RoomEvent::ParticipantDisconnected { identity } => {
                    if let Some(session) = self.registry.remove(&identity) {
                        info!(identity = %identity, "participant left, tearing down session");
                        session.disconnect().await;
                    }
                }
                RoomEvent::RoomDisconnected => {
                    info!("room disconnected");
                    break;
                }
            }
        }

        sweeper.abort();
        for (identity, session) in self.registry.drain() {
            debug!(identity = %identity, "closing session on shutdown");
            session.disconnect().await;
        }

        Ok(())
    }

    /// Periodically force-close streaming sessions with no qualifying
    /// inbound activity inside the liveness window.
    fn spawn_liveness_sweeper(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let window = self.settings.session.liveness_window;
        let check_interval = self.settings.session.liveness_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for (identity, session) in registry.snapshot() {
                    if session.state() == SessionState::Streaming && session.idle_for() > window {
                        warn!(
                            identity = %identity,
                            idle_secs = session.idle_for().as_secs(),
                            "session stale, forcing teardown"
                        );
                        registry.remove(&identity);
                        session.disconnect().await;
                    }
                }
            }
        })
    }
}

/// Full lifecycle of one session against one subscribed track.
async fn run_speaker(
    settings: Settings,
    registry: Arc<SessionRegistry>,
    publisher: Arc<dyn TranscriptPublisher>,
    mut track: AudioTrack,
    participant: ParticipantInfo,
) {
    let identity = participant.identity.clone();
    let display_name = participant.display_name();
    info!(identity = %identity, "starting transcription for participant");

    let session = match TranscriptionSession::connect(
        &settings.asr.url(),
        settings.asr.session_config(),
        &identity,
        &display_name,
        publish_callback(publisher),
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            error!(
                identity = %identity,
                error = %err,
                "failed to connect to transcription server"
            );
            return;
        }
    };

    if let Err(err) = registry.register(&identity, session.clone()) {
        warn!(identity = %identity, error = %err, "discarding duplicate session");
        session.disconnect().await;
        return;
    }

    if let Err(err) = session
        .wait_until_ready(settings.session.ready_timeout)
        .await
    {
        warn!(identity = %identity, error = %err, "transcription session not ready");
        registry.remove(&identity);
        session.disconnect().await;
        return;
    }

    info!(
        identity = %identity,
        backend = session.backend().as_deref().unwrap_or("unknown"),
        "transcription ready"
    );

    let (recorder, recorder_worker) = DebugRecorder::new(&settings.debug_audio, &identity);
    if let Some(worker) = recorder_worker {
        tokio::spawn(worker.run());
    }

    let mut buffer = ChunkBuffer::new(settings.audio.chunk_size);

    while let Some(frame) = track.frames.recv().await {
        // Removal from the registry, from whatever trigger, is an
        // unconditional stop signal for this loop.
        if !registry.contains(&identity) {
            debug!(identity = %identity, "session deregistered, stopping track consumption");
            break;
        }

        for chunk in buffer.push(&frame.data) {
            let samples = codec::pcm16_to_f32(&chunk);
            recorder.record(&samples);
            session.send_audio(&samples).await;
        }
    }

    if let Some(rest) = buffer.flush() {
        debug!(identity = %identity, bytes = rest.len(), "sending final partial chunk");
        let samples = codec::pcm16_to_f32(&rest);
        recorder.record(&samples);
        session.send_audio(&samples).await;
    }

    recorder.finish();
    if registry.remove(&identity).is_some() {
        session.disconnect().await;
    }
    info!(identity = %identity, "transcription finished for participant");
}

/// Adapt the publisher into the session's result callback.
fn publish_callback(publisher: Arc<dyn TranscriptPublisher>) -> TranscriptCallback {
    Arc::new(move |event: TranscriptEvent| -> BoxFuture<'static, anyhow::Result<()>> {
        let publisher = publisher.clone();
        Box::pin(async move {
            publisher
                .publish(&event)
                .await
                .context("failed to publish transcript event")
        })
    })
}
