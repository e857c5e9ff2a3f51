//! Streaming transcription session against the speech-recognition server.
//!
//! One session owns one websocket connection for one speaker. It sends the
//! configuration message on connect, then streams binary audio frames while
//! the server is ready and interprets inbound control messages on an owned
//! receive task. Transcription results are emitted through an async
//! callback; the caller observes protocol state through a watch channel.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use super::protocol::{self, Inbound, RawServerMessage, Segment, ServerStatus, SessionConfig};
use crate::audio::codec;
use crate::room::TranscriptEvent;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How long teardown waits for the receive task to finish on its own
/// before cancelling it.
const RECEIVE_STOP_LIMIT: Duration = Duration::from_secs(2);

/// Async callback invoked once per non-empty transcript batch. Errors are
/// logged and never propagate into the receive loop.
pub type TranscriptCallback =
    Arc<dyn Fn(TranscriptEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Protocol state of a session. `Closed` is terminal; `Waiting` and
/// `Errored` are terminal from the caller's perspective (no audio is
/// accepted and the orchestration layer must tear the session down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingReady,
    Streaming,
    Waiting,
    Errored,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to reach the transcription server: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode the session configuration: {0}")]
    Configure(#[from] serde_json::Error),
}

/// Why the bounded readiness wait did not end in `Streaming`.
#[derive(Debug, Error)]
pub enum ReadyError {
    #[error("server at capacity, estimated wait {estimated_minutes:.0} min")]
    ServerBusy { estimated_minutes: f64 },
    #[error("server reported an error during setup")]
    ServerError,
    #[error("connection closed before the server became ready")]
    Closed,
    #[error("no readiness message within {0:?}")]
    Timeout(Duration),
}

/// State shared between the session handle and its receive task.
struct Shared {
    uid: String,
    identity: String,
    display_name: String,
    state: watch::Sender<SessionState>,
    backend: Mutex<Option<String>>,
    estimated_wait_minutes: Mutex<Option<f64>>,
    /// Instant of the last qualifying inbound activity.
    last_activity: Mutex<Instant>,
    /// Raw text of the last segment in the previous batch, for the
    /// activity-update comparison.
    last_segment_text: Mutex<Option<String>>,
    callback: TranscriptCallback,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

/// The per-speaker protocol state machine and its connection.
pub struct TranscriptionSession {
    shared: Arc<Shared>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    receive_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TranscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionSession")
            .field("identity", &self.shared.identity)
            .field("uid", &self.shared.uid)
            .finish_non_exhaustive()
    }
}

impl TranscriptionSession {
    /// Open a connection to the server at `url`, send the configuration
    /// message and start the receive task. On error the session was never
    /// established and must not be registered.
    pub async fn connect(
        url: &str,
        config: SessionConfig,
        identity: &str,
        display_name: &str,
        callback: TranscriptCallback,
    ) -> Result<Arc<Self>, SessionError> {
        let (state_tx, _) = watch::channel(SessionState::Connecting);

        info!(identity, url, "connecting to transcription server");
        let (ws, _response) = connect_async(url).await?;
        let (mut sink, stream) = ws.split();

        sink.send(Message::Text(serde_json::to_string(&config)?))
            .await?;
        state_tx.send_replace(SessionState::AwaitingReady);

        let shared = Arc::new(Shared {
            uid: config.uid,
            identity: identity.to_string(),
            display_name: display_name.to_string(),
            state: state_tx,
            backend: Mutex::new(None),
            estimated_wait_minutes: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            last_segment_text: Mutex::new(None),
            callback,
        });

        let receive_shared = shared.clone();
        let receive_task = tokio::spawn(receive_loop(receive_shared, stream));

        Ok(Arc::new(Self {
            shared,
            sink: tokio::sync::Mutex::new(Some(sink)),
            receive_task: tokio::sync::Mutex::new(Some(receive_task)),
        }))
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Backend identifier reported with `SERVER_READY`.
    pub fn backend(&self) -> Option<String> {
        self.shared.backend.lock().unwrap().clone()
    }

    /// Time since the last qualifying inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_activity.lock().unwrap().elapsed()
    }

    /// Wait until the server handshake resolves, bounded by `limit`. Only
    /// `Streaming` counts as success; `Waiting`, `Errored` and `Closed` are
    /// reported as errors and a timeout is treated like a connect failure
    /// by the caller.
    pub async fn wait_until_ready(&self, limit: Duration) -> Result<(), ReadyError> {
        let mut state_rx = self.shared.state.subscribe();
        let settled = timeout(
            limit,
            state_rx.wait_for(|state| {
                !matches!(state, SessionState::Connecting | SessionState::AwaitingReady)
            }),
        )
        .await;

        match settled {
            Err(_) => Err(ReadyError::Timeout(limit)),
            Ok(Err(_)) => Err(ReadyError::Closed),
            Ok(Ok(state)) => match *state {
                SessionState::Streaming => Ok(()),
                SessionState::Waiting => Err(ReadyError::ServerBusy {
                    estimated_minutes: self
                        .shared
                        .estimated_wait_minutes
                        .lock()
                        .unwrap()
                        .unwrap_or(0.0),
                }),
                SessionState::Errored => Err(ReadyError::ServerError),
                _ => Err(ReadyError::Closed),
            },
        }
    }

    /// Serialize `samples` and write them to the connection. A no-op in
    /// every state but `Streaming`: audio offered early or late is dropped,
    /// never queued. Write failures are logged and swallowed; persistent
    /// failure surfaces through the liveness check instead.
    pub async fn send_audio(&self, samples: &[f32]) {
        if self.state() != SessionState::Streaming {
            debug!(
                identity = %self.shared.identity,
                state = ?self.state(),
                "dropping audio offered outside Streaming"
            );
            return;
        }

        let payload = codec::f32_to_le_bytes(samples);
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return;
        };

        if let Err(err) = sink.send(Message::Binary(payload)).await {
            warn!(
                identity = %self.shared.identity,
                error = %err,
                "failed to send audio frame"
            );
        }
    }

    /// Tear the session down: stop the receive task, await it bounded,
    /// cancel it if it overruns, then close the connection. Idempotent and
    /// safe to call concurrently from any teardown trigger; the underlying
    /// connection is closed exactly once.
    pub async fn disconnect(&self) {
        self.shared.state.send_replace(SessionState::Closed);

        if let Some(mut task) = self.receive_task.lock().await.take() {
            if timeout(RECEIVE_STOP_LIMIT, &mut task).await.is_err() {
                warn!(
                    identity = %self.shared.identity,
                    "receive task did not stop in time, cancelling"
                );
                task.abort();
                let _ = task.await;
            }
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(err) = sink.close().await {
                debug!(
                    identity = %self.shared.identity,
                    error = %err,
                    "connection already gone on close"
                );
            }
            info!(identity = %self.shared.identity, "transcription session closed");
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, mut stream: WsStream) {
    let mut state_rx = shared.state.subscribe();

    loop {
        let message = tokio::select! {
            _ = state_rx.wait_for(|state| *state == SessionState::Closed) => {
                debug!(identity = %shared.identity, "receive loop stopped");
                return;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let raw: RawServerMessage = match serde_json::from_str(&text) {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(
                            identity = %shared.identity,
                            error = %err,
                            "skipping malformed server message"
                        );
                        continue;
                    }
                };
                if !raw.is_for(&shared.uid) {
                    continue;
                }
                if !handle_inbound(&shared, protocol::classify(raw)).await {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(identity = %shared.identity, "server closed the connection");
                shared.state.send_replace(SessionState::Closed);
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(
                    identity = %shared.identity,
                    error = %err,
                    "websocket receive error"
                );
                shared.state.send_replace(SessionState::Closed);
                return;
            }
        }
    }
}

/// Apply one classified message to the session state. Returns `false` when
/// the receive loop should stop.
async fn handle_inbound(shared: &Arc<Shared>, inbound: Inbound) -> bool {
    match inbound {
        Inbound::Status(ServerStatus::Wait { estimated_minutes }) => {
            warn!(
                identity = %shared.identity,
                estimated_minutes = estimated_minutes.round(),
                "server at capacity"
            );
            *shared.estimated_wait_minutes.lock().unwrap() = Some(estimated_minutes);
            shared.state.send_replace(SessionState::Waiting);
            true
        }
        Inbound::Status(ServerStatus::Error { detail }) => {
            error!(
                identity = %shared.identity,
                detail = detail.as_deref().unwrap_or(""),
                "server reported an error"
            );
            shared.state.send_replace(SessionState::Errored);
            true
        }
        Inbound::Status(ServerStatus::Warning { detail }) => {
            warn!(
                identity = %shared.identity,
                detail = detail.as_deref().unwrap_or(""),
                "server warning"
            );
            true
        }
        Inbound::Ready { backend } => {
            info!(
                identity = %shared.identity,
                backend = backend.as_deref().unwrap_or("unknown"),
                "server ready"
            );
            *shared.backend.lock().unwrap() = backend;
            shared.touch();
            shared.state.send_replace(SessionState::Streaming);
            true
        }
        Inbound::Disconnect => {
            info!(identity = %shared.identity, "server requested disconnect");
            shared.state.send_replace(SessionState::Closed);
            false
        }
        Inbound::LanguageDetected {
            language,
            probability,
        } => {
            info!(
                identity = %shared.identity,
                language,
                probability,
                "language detected"
            );
            true
        }
        Inbound::Segments(segments) => {
            process_segments(shared, segments).await;
            true
        }
        Inbound::Ignored => true,
    }
}

/// Turn one segment batch into at most one transcript event and update the
/// activity clock. Only a change in the last segment's raw text counts as
/// activity, so a server idling on the same output cannot keep the session
/// alive past the liveness window.
async fn process_segments(shared: &Arc<Shared>, segments: Vec<Segment>) {
    let Some(last) = segments.last() else {
        return;
    };

    {
        let mut previous = shared.last_segment_text.lock().unwrap();
        if previous.as_deref() != Some(last.text.as_str()) {
            *previous = Some(last.text.clone());
            shared.touch();
        }
    }

    let Some(batch) = protocol::collapse_segments(&segments) else {
        return;
    };

    let event = TranscriptEvent::new(
        shared.identity.clone(),
        shared.display_name.clone(),
        batch.text,
        batch.is_final,
    );

    if let Err(err) = (shared.callback)(event).await {
        warn!(
            identity = %shared.identity,
            error = %err,
            "transcript callback failed"
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    fn test_config(uid: &str) -> SessionConfig {
        SessionConfig {
            uid: uid.to_string(),
            language: Some("en".to_string()),
            task: "transcribe".to_string(),
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

    fn channel_callback() -> (TranscriptCallback, mpsc::UnboundedReceiver<TranscriptEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: TranscriptCallback = Arc::new(move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(event)
                    .map_err(|_| anyhow::anyhow!("event receiver dropped"))
            })
        });
        (callback, rx)
    }

    /// Serve exactly one websocket connection with `handler`. Returns the
    /// ws:// url to dial.
    async fn spawn_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let ws = accept_async(stream).await.unwrap();
                handler(ws).await;
            }
        });
        format!("ws://{addr}")
    }

    /// Read the configuration message and answer with SERVER_READY.
    async fn handshake(ws: &mut WebSocketStream<TcpStream>) -> String {
        let config = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => text,
            other => panic!("expected configuration text frame, got {other:?}"),
        };
        let config: serde_json::Value = serde_json::from_str(&config).unwrap();
        let uid = config["uid"].as_str().unwrap().to_string();
        assert_eq!(config["task"], "transcribe");

        ws.send(Message::Text(
            serde_json::json!({"uid": uid, "message": "SERVER_READY", "backend": "test_backend"})
                .to_string(),
        ))
        .await
        .unwrap();

        uid
    }

    async fn wait_for_state(session: &TranscriptionSession, wanted: SessionState) {
        let mut rx = session.shared.state.subscribe();
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state change timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn handshake_reaches_streaming_and_records_backend() {
        let url = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            // Keep the connection open until the client closes it.
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, _events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();

        session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.backend().as_deref(), Some("test_backend"));

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn wait_status_resolves_to_server_busy() {
        let url = spawn_server(|mut ws| async move {
            let _ = ws.next().await;
            ws.send(Message::Text(
                serde_json::json!({"uid": "u1", "status": "WAIT", "message": 3.0}).to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, _events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();

        let err = session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReadyError::ServerBusy { estimated_minutes } if estimated_minutes == 3.0
        ));
        assert_eq!(session.state(), SessionState::Waiting);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn error_status_resolves_to_server_error() {
        let url = spawn_server(|mut ws| async move {
            let _ = ws.next().await;
            ws.send(Message::Text(
                serde_json::json!({"uid": "u1", "status": "ERROR", "message": "no model"})
                    .to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, _events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();

        let err = session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadyError::ServerError));

        session.disconnect().await;
    }

    #[tokio::test]
    async fn silent_server_times_out_instead_of_hanging() {
        let url = spawn_server(|mut ws| async move {
            let _ = ws.next().await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, _events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();

        let err = session
            .wait_until_ready(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadyError::Timeout(_)));

        session.disconnect().await;
    }

    #[tokio::test]
    async fn segments_emit_one_event_with_collapsed_text() {
        let url = spawn_server(|mut ws| async move {
            let uid = handshake(&mut ws).await;
            ws.send(Message::Text(
                serde_json::json!({
                    "uid": uid,
                    "segments": [
                        {"text": "a", "completed": false},
                        {"text": "a", "completed": false},
                        {"text": "b", "completed": true},
                    ],
                })
                .to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, mut events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();
        session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.text, "a b");
        assert!(event.is_final);
        assert_eq!(event.participant_identity, "alice");
        assert_eq!(event.participant_name, "Alice");

        session.disconnect().await;
    }

    #[tokio::test]
    async fn empty_segments_and_foreign_uid_emit_nothing() {
        let url = spawn_server(|mut ws| async move {
            let uid = handshake(&mut ws).await;
            // Empty text: suppressed.
            ws.send(Message::Text(
                serde_json::json!({"uid": uid, "segments": [{"text": "", "completed": false}]})
                    .to_string(),
            ))
            .await
            .unwrap();
            // Foreign uid: ignored entirely.
            ws.send(Message::Text(
                serde_json::json!({"uid": "someone-else", "segments": [{"text": "x", "completed": true}]})
                    .to_string(),
            ))
            .await
            .unwrap();
            // Sentinel the test can wait on.
            ws.send(Message::Text(
                serde_json::json!({"uid": uid, "segments": [{"text": "done", "completed": true}]})
                    .to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, mut events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();
        session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.text, "done");
        assert!(events.try_recv().is_err());

        session.disconnect().await;
    }

    #[tokio::test]
    async fn audio_outside_streaming_is_dropped() {
        let (binary_tx, mut binary_rx) = mpsc::unbounded_channel::<usize>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let url = spawn_server(move |mut ws| async move {
            // Swallow the configuration frame but hold SERVER_READY back
            // until the test has offered audio in AwaitingReady.
            let _ = ws.next().await;
            release_rx.await.unwrap();
            ws.send(Message::Text(
                serde_json::json!({"uid": "u1", "message": "SERVER_READY", "backend": "b"})
                    .to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Binary(payload) = message {
                    let _ = binary_tx.send(payload.len());
                }
            }
        })
        .await;

        let (callback, _events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();

        // Offered while AwaitingReady: must be silently dropped, not
        // queued for later.
        assert_eq!(session.state(), SessionState::AwaitingReady);
        session.send_audio(&[0.25_f32; 64]).await;

        release_tx.send(()).unwrap();
        session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();
        session.send_audio(&[0.5_f32; 32]).await;

        let first = timeout(Duration::from_secs(2), binary_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, 32 * 4);
        assert!(binary_rx.try_recv().is_err());

        session.disconnect().await;
    }

    #[tokio::test]
    async fn server_disconnect_directive_closes_the_session() {
        let url = spawn_server(|mut ws| async move {
            let uid = handshake(&mut ws).await;
            ws.send(Message::Text(
                serde_json::json!({"uid": uid, "message": "DISCONNECT"}).to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, _events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();

        wait_for_state(&session, SessionState::Closed).await;

        // Audio after the directive is dropped.
        session.send_audio(&[0.1; 16]).await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn concurrent_disconnects_close_exactly_once() {
        let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();
        let url = spawn_server(move |mut ws| async move {
            handshake(&mut ws).await;
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    let _ = close_tx.send(());
                }
            }
        })
        .await;

        let (callback, _events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();
        session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();

        tokio::join!(session.disconnect(), session.disconnect());
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);

        let _ = timeout(Duration::from_secs(2), close_rx.recv()).await;
        assert!(close_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sessions_fail_independently() {
        let url_a = spawn_server(|mut ws| async move {
            let _ = ws.next().await;
            ws.send(Message::Text(
                serde_json::json!({"uid": "ua", "status": "ERROR", "message": "boom"}).to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;
        let url_b = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback_a, _events_a) = channel_callback();
        let session_a =
            TranscriptionSession::connect(&url_a, test_config("ua"), "alice", "Alice", callback_a)
                .await
                .unwrap();
        let (callback_b, _events_b) = channel_callback();
        let session_b =
            TranscriptionSession::connect(&url_b, test_config("ub"), "bob", "Bob", callback_b)
                .await
                .unwrap();

        assert!(session_a.wait_until_ready(Duration::from_secs(2)).await.is_err());
        session_b
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(session_a.state(), SessionState::Errored);
        assert_eq!(session_b.state(), SessionState::Streaming);

        session_a.disconnect().await;
        session_b.disconnect().await;
    }

    #[tokio::test]
    async fn failing_callback_does_not_break_the_receive_loop() {
        let url = spawn_server(|mut ws| async move {
            let uid = handshake(&mut ws).await;
            for text in ["first", "second"] {
                ws.send(Message::Text(
                    serde_json::json!({"uid": uid, "segments": [{"text": text, "completed": true}]})
                        .to_string(),
                ))
                .await
                .unwrap();
            }
            while ws.next().await.is_some() {}
        })
        .await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let callback: TranscriptCallback = Arc::new(move |event| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                let _ = seen_tx.send(event.text.clone());
                anyhow::bail!("consumer exploded");
            })
        });

        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();
        session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();

        // Both batches reach the callback despite it failing every time.
        let first = timeout(Duration::from_secs(2), seen_rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(2), seen_rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("first"));
        assert_eq!(second.as_deref(), Some("second"));
        assert_eq!(session.state(), SessionState::Streaming);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn repeated_identical_last_segment_does_not_refresh_activity() {
        let url = spawn_server(|mut ws| async move {
            let uid = handshake(&mut ws).await;
            for _ in 0..2 {
                ws.send(Message::Text(
                    serde_json::json!({"uid": uid, "segments": [{"text": "same", "completed": false}]})
                        .to_string(),
                ))
                .await
                .unwrap();
            }
            while ws.next().await.is_some() {}
        })
        .await;

        let (callback, mut events) = channel_callback();
        let session =
            TranscriptionSession::connect(&url, test_config("u1"), "alice", "Alice", callback)
                .await
                .unwrap();
        session
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap();

        // Drain both batches so the activity bookkeeping has run.
        for _ in 0..2 {
            timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
        }

        testing::backdate_activity(&session, Duration::from_secs(60));
        let idle_before = session.idle_for();

        // A third identical batch must not reset the clock.
        // (Simulated directly: the comparison is the same code path.)
        process_segments(
            &session.shared,
            vec![Segment {
                text: "same".to_string(),
                completed: false,
            }],
        )
        .await;
        assert!(session.idle_for() >= idle_before);

        // A different text does.
        process_segments(
            &session.shared,
            vec![Segment {
                text: "different".to_string(),
                completed: false,
            }],
        )
        .await;
        assert!(session.idle_for() < Duration::from_secs(1));

        session.disconnect().await;
    }
}
