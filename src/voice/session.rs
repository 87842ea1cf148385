//! Voice session manager.
//!
//! Ties together:
//! - an [`AudioInput`] microphone streaming 16kHz PCM blocks upstream
//! - a [`LiveTransport`] session with the assistant backend
//! - a [`PlaybackQueue`] scheduling the assistant's 24kHz replies
//! - the host's [`ToolHandler`], whose results are relayed back by call id
//!
//! ## Architecture
//!
//! ```text
//! Mic ─▸ CaptureSink ─▸ LiveSender ─▸ backend
//!                                       │
//!   events ◂────────────────────────────┘
//!     ├─ Audio ────────▸ PlaybackQueue::enqueue
//!     ├─ Interrupted ──▸ PlaybackQueue::interrupt
//!     ├─ ToolCall ─────▸ ToolHandler::call ─▸ (if still live) toolResponse
//!     └─ Closed/Error ─▸ teardown + status
//! ```
//!
//! Every `connect` attempt gets a new epoch. A session, its inbound task and
//! any in-flight tool calls only act while their epoch is still the live one,
//! so late results from an earlier session are dropped instead of being sent
//! on a newer connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::audio::AudioBuffer;
use super::capture::{AudioInput, InputStream};
use super::error::VoiceError;
use super::gemini_live::{
    build_setup_message, FunctionCall, FunctionResponse, LiveSender, LiveTransport, MediaChunk,
};
use super::playback::{AudioOutputFactory, PlaybackQueue};
use super::VoiceEvent;
use crate::config::VoiceSettings;

/// Connection state reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Called on every status transition.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Host-side executor for the assistant's tool calls.
///
/// The returned value is sent back as the call's result. An `Err` is still
/// answered, with `{"error": "<message>"}`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, name: &str, args: Value) -> anyhow::Result<Value>;
}

// ── Shared state ───────────────────────────────────────────────────

struct ActiveSession {
    epoch: u64,
    session_id: String,
    sender: LiveSender,
    microphone: Box<dyn InputStream>,
    playback: Arc<Mutex<PlaybackQueue>>,
    inbound: JoinHandle<()>,
    on_status: StatusCallback,
}

impl ActiveSession {
    /// Release the microphone and speaker, then end the audio stream and
    /// close the connection. Returns once both devices report closed.
    async fn release(self, abort_inbound: bool) {
        let Self {
            session_id,
            sender,
            microphone,
            playback,
            inbound,
            ..
        } = self;
        if abort_inbound {
            inbound.abort();
        }
        close_devices(microphone, Some(playback)).await;
        sender.end_audio_stream();
        sender.close();
        tracing::info!(session_id = %session_id, "Voice session released");
    }

    /// [`release`](Self::release) for when no runtime is left to run it on.
    fn release_now(mut self) {
        self.inbound.abort();
        self.microphone.close();
        self.playback.lock().close();
        self.sender.end_audio_stream();
        self.sender.close();
    }
}

/// Close the devices on the blocking pool; device closes may join threads.
async fn close_devices(
    mut microphone: Box<dyn InputStream>,
    playback: Option<Arc<Mutex<PlaybackQueue>>>,
) {
    let closing = tokio::task::spawn_blocking(move || {
        microphone.close();
        if let Some(playback) = playback {
            playback.lock().close();
        }
    });
    if let Err(e) = closing.await {
        tracing::warn!(error = %e, "Audio device release failed");
    }
}

struct State {
    status: ConnectionStatus,
    session: Option<ActiveSession>,
}

struct Shared {
    state: Mutex<State>,
    epoch: AtomicU64,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Tear down the session of `epoch` if it is still installed.
    ///
    /// Returns the callback to notify, so exactly one party reports the end
    /// of a session even when backend closure races an explicit disconnect.
    async fn end_session(&self, epoch: u64, status: ConnectionStatus) -> Option<StatusCallback> {
        let session = {
            let mut state = self.state.lock();
            if !state.session.as_ref().is_some_and(|s| s.epoch == epoch) {
                return None;
            }
            state.status = status;
            state.session.take()
        }?;
        let on_status = Arc::clone(&session.on_status);
        session.release(false).await;
        Some(on_status)
    }
}

/// Liveness-checked access to one session's sender.
#[derive(Clone)]
struct SessionLink {
    shared: Arc<Shared>,
    epoch: u64,
}

impl SessionLink {
    /// The sender, only while this link's session is still installed.
    fn sender(&self) -> Option<LiveSender> {
        let state = self.shared.state.lock();
        state
            .session
            .as_ref()
            .filter(|s| s.epoch == self.epoch)
            .map(|s| s.sender.clone())
    }

    /// Run `f` under the state lock, only while this link's session is
    /// still installed.
    fn while_live<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let state = self.shared.state.lock();
        state
            .session
            .as_ref()
            .filter(|s| s.epoch == self.epoch)
            .map(|_| f())
    }
}

// ── Manager ────────────────────────────────────────────────────────

/// Owns at most one live voice session.
///
/// Neither [`connect`](Self::connect) nor [`disconnect`](Self::disconnect)
/// returns an error: every failure becomes a [`ConnectionStatus::Error`]
/// transition on the status callback.
pub struct VoiceSessionManager {
    settings: VoiceSettings,
    transport: Arc<dyn LiveTransport>,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutputFactory>,
    shared: Arc<Shared>,
}

impl VoiceSessionManager {
    pub fn new(
        settings: VoiceSettings,
        transport: Arc<dyn LiveTransport>,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutputFactory>,
    ) -> Self {
        Self {
            settings,
            transport,
            input,
            output,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    status: ConnectionStatus::Disconnected,
                    session: None,
                }),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Open a session: microphone, speaker, backend handshake, streaming.
    ///
    /// Returns once the session is live or the attempt has failed. Calling it
    /// while a session is connecting or connected is ignored.
    pub async fn connect(&self, on_tool_call: Arc<dyn ToolHandler>, on_status: StatusCallback) {
        let epoch = {
            let mut state = self.shared.state.lock();
            if matches!(
                state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            ) {
                tracing::warn!(status = %state.status, "connect ignored: session already active");
                return;
            }
            state.status = ConnectionStatus::Connecting;
            self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };
        on_status(ConnectionStatus::Connecting);

        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session_id = %session_id, epoch, "Starting voice session");

        // Microphone
        let mut microphone = match self.input.open().await {
            Ok(mic) => mic,
            Err(e) => return self.fail(epoch, &on_status, &session_id, e),
        };
        if !self.shared.is_current(epoch) {
            close_devices(microphone, None).await;
            return Self::abandoned(&on_status, &session_id);
        }

        // Speaker
        let output = match self.output.open().await {
            Ok(output) => output,
            Err(e) => {
                close_devices(microphone, None).await;
                return self.fail(epoch, &on_status, &session_id, e);
            }
        };
        let playback = Arc::new(Mutex::new(PlaybackQueue::new(output)));

        // Backend
        let setup = build_setup_message(&self.settings);
        let connection = match self.transport.open(&session_id, &setup).await {
            Ok(conn) => conn,
            Err(e) => {
                close_devices(microphone, Some(playback)).await;
                return self.fail(epoch, &on_status, &session_id, e);
            }
        };
        if !self.shared.is_current(epoch) {
            connection.sender.close();
            close_devices(microphone, Some(playback)).await;
            return Self::abandoned(&on_status, &session_id);
        }

        // Start streaming the microphone
        let sink_sender = connection.sender.clone();
        let sink_session = session_id.clone();
        let mut dropped: u64 = 0;
        let started = microphone.start(Box::new(move |block: &[f32]| {
            if !sink_sender.try_send_audio(MediaChunk::from_samples(block)) {
                dropped += 1;
                if dropped == 1 || dropped.is_multiple_of(100) {
                    tracing::warn!(
                        session_id = %sink_session,
                        dropped,
                        "Outbound audio queue full or closed, dropping chunk"
                    );
                }
            }
        }));
        if let Err(e) = started {
            connection.sender.close();
            close_devices(microphone, Some(playback)).await;
            return self.fail(epoch, &on_status, &session_id, e);
        }

        // Install the session; the inbound task waits until `Connected` is out.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let inbound = tokio::spawn(inbound_loop(
            ready_rx,
            connection.events,
            Arc::clone(&playback),
            on_tool_call,
            SessionLink {
                shared: Arc::clone(&self.shared),
                epoch,
            },
            session_id.clone(),
        ));
        let session = ActiveSession {
            epoch,
            session_id: session_id.clone(),
            sender: connection.sender,
            microphone,
            playback,
            inbound,
            on_status: Arc::clone(&on_status),
        };

        let rejected = {
            let mut state = self.shared.state.lock();
            if self.shared.is_current(epoch) {
                state.status = ConnectionStatus::Connected;
                state.session = Some(session);
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = rejected {
            session.release(true).await;
            return Self::abandoned(&on_status, &session_id);
        }

        tracing::info!(session_id = %session_id, "Voice session connected");
        on_status(ConnectionStatus::Connected);
        let _ = ready_tx.send(());
    }

    /// Close the live session, if any, and release every device it holds.
    ///
    /// Returns once the microphone and speaker report closed. Before the
    /// close frame the backend is sent `audioStreamEnd`. Safe to call
    /// repeatedly. A connect still in progress is abandoned and
    /// reports `Disconnected` itself once its pending step returns.
    pub async fn disconnect(&self) {
        let session = {
            let mut state = self.shared.state.lock();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            state.status = ConnectionStatus::Disconnected;
            state.session.take()
        };

        match session {
            Some(session) => {
                let on_status = Arc::clone(&session.on_status);
                session.release(true).await;
                on_status(ConnectionStatus::Disconnected);
            }
            None => tracing::debug!("disconnect: no live session"),
        }
    }

    fn fail(
        &self,
        epoch: u64,
        on_status: &StatusCallback,
        session_id: &str,
        error: VoiceError,
    ) {
        tracing::error!(session_id = %session_id, error = %error, "Voice session failed to start");
        let current = {
            let mut state = self.shared.state.lock();
            let current = self.shared.is_current(epoch);
            if current {
                state.status = ConnectionStatus::Error;
            }
            current
        };
        on_status(if current {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Disconnected
        });
    }

    fn abandoned(on_status: &StatusCallback, session_id: &str) {
        tracing::info!(session_id = %session_id, "Connect abandoned by disconnect");
        on_status(ConnectionStatus::Disconnected);
    }
}

impl Drop for VoiceSessionManager {
    fn drop(&mut self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let session = self.shared.state.lock().session.take();
        if let Some(session) = session {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(session.release(true));
                }
                Err(_) => session.release_now(),
            }
        }
    }
}

// ── Inbound processing ─────────────────────────────────────────────

async fn inbound_loop(
    ready: oneshot::Receiver<()>,
    mut events: mpsc::Receiver<VoiceEvent>,
    playback: Arc<Mutex<PlaybackQueue>>,
    handler: Arc<dyn ToolHandler>,
    link: SessionLink,
    session_id: String,
) {
    if ready.await.is_err() {
        return;
    }

    let terminal = loop {
        let Some(event) = events.recv().await else {
            break ConnectionStatus::Disconnected;
        };
        match event {
            VoiceEvent::Audio { data } => match AudioBuffer::from_output_pcm(&data) {
                Ok(buffer) if buffer.is_empty() => {}
                Ok(buffer) => {
                    if let Err(e) = playback.lock().enqueue(buffer) {
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to schedule audio");
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Skipping malformed audio chunk");
                }
            },
            VoiceEvent::Interrupted => {
                let stopped = playback.lock().interrupt();
                tracing::debug!(session_id = %session_id, stopped, "Playback interrupted");
            }
            VoiceEvent::ToolCall { calls } => {
                for call in calls {
                    tokio::spawn(relay_tool_call(
                        link.clone(),
                        Arc::clone(&handler),
                        call,
                    ));
                }
            }
            VoiceEvent::ToolCallCancellation { ids } => {
                tracing::info!(session_id = %session_id, ?ids, "Backend cancelled tool calls");
            }
            VoiceEvent::InputTranscript { text } => {
                tracing::debug!(session_id = %session_id, text = %text, "User said");
            }
            VoiceEvent::OutputTranscript { text } => {
                tracing::debug!(session_id = %session_id, text = %text, "Assistant said");
            }
            VoiceEvent::GoAway { time_left } => {
                tracing::warn!(session_id = %session_id, ?time_left, "Backend will close the session soon");
            }
            VoiceEvent::SetupComplete | VoiceEvent::TurnComplete => {}
            VoiceEvent::Closed { reason } => {
                tracing::info!(session_id = %session_id, ?reason, "Backend closed the session");
                break ConnectionStatus::Disconnected;
            }
            VoiceEvent::Error { message } => {
                tracing::error!(session_id = %session_id, error = %message, "Live session error");
                break ConnectionStatus::Error;
            }
        }
    };

    if let Some(on_status) = link.shared.end_session(link.epoch, terminal).await {
        on_status(terminal);
    }
}

/// Run one tool call and send its result, unless the session is gone by then.
async fn relay_tool_call(link: SessionLink, handler: Arc<dyn ToolHandler>, call: FunctionCall) {
    let FunctionCall { id, name, args } = call;

    let tool = name.clone();
    let outcome = tokio::spawn(async move { handler.call(&tool, args).await }).await;
    let result = match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            tracing::warn!(call_id = %id, tool = %name, error = %e, "Tool handler failed");
            json!({ "error": e.to_string() })
        }
        Err(e) => {
            tracing::error!(call_id = %id, tool = %name, error = %e, "Tool handler panicked");
            json!({ "error": format!("tool handler aborted: {e}") })
        }
    };

    let Some(sender) = link.sender() else {
        tracing::debug!(call_id = %id, tool = %name, "Session gone, dropping tool result");
        return;
    };
    let permit = match sender.reserve_tool_response().await {
        Ok(permit) => permit,
        Err(e) => {
            tracing::debug!(call_id = %id, error = %e, "Tool result not delivered");
            return;
        }
    };
    // The session may have ended while we waited for room.
    let response = FunctionResponse::new(id.clone(), name, result);
    if link.while_live(|| permit.send(response)).is_none() {
        tracing::debug!(call_id = %id, "Session ended while queueing, dropping tool result");
    }
}
