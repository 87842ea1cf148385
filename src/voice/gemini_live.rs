//! Gemini Live WebSocket client.
//!
//! Implements the bidirectional streaming protocol of Google's Gemini Live
//! API (BidiGenerateContent) for the SafeTravel assistant.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to the Gemini Live endpoint
//! 2. **Setup**: send model, voice, persona and tool declarations
//! 3. **Stream**: send microphone audio as `realtimeInput`, receive audio,
//!    interruptions and `toolCall`s; answer each call with `toolResponse`
//! 4. **Close**: gracefully close the WebSocket session
//!
//! ## Binary Frame Protocol
//!
//! Gemini Live sends JSON control messages as WebSocket Binary frames as well
//! as Text frames. Binary content starting with `{` is parsed as JSON;
//! anything else is skipped.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::audio::{f32_to_pcm16le, INPUT_AUDIO_MIME};
use super::error::{Result, VoiceError};
use super::tools::{hazard_tools, system_prompt, ToolSet};
use super::VoiceEvent;
use crate::config::VoiceSettings;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

// ── Setup message (JSON sent as first frame) ───────────────────────

/// Top-level setup message for Gemini Live session initialization.
#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig", skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Build the setup message: audio replies, configured voice, SafeTravel
/// persona and the two hazard tools.
pub fn build_setup_message(settings: &VoiceSettings) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", settings.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: settings.voice_name.clone(),
                        },
                    },
                }),
            },
            system_instruction: Some(SystemInstruction {
                parts: vec![TextPart {
                    text: system_prompt(),
                }],
            }),
            tools: hazard_tools(),
        },
    }
}

// ── Audio input message ────────────────────────────────────────────

/// Audio input message sent to Gemini Live.
///
/// `mediaChunks` is what the official SDKs still put on the wire; the newer
/// `audio` field is not reliably processed.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk>,
}

/// Audio chunk with MIME type and base64-encoded data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String, // base64-encoded audio
}

impl MediaChunk {
    /// Wrap raw 16kHz PCM16 bytes.
    pub fn pcm16(pcm_data: &[u8]) -> Self {
        Self {
            mime_type: INPUT_AUDIO_MIME.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(pcm_data),
        }
    }

    /// Encode one captured block of float samples.
    pub fn from_samples(samples: &[f32]) -> Self {
        Self::pcm16(&f32_to_pcm16le(samples))
    }
}

/// Build a realtime audio input message.
///
/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
pub fn build_audio_message(chunk: MediaChunk) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![chunk],
        },
    }
}

// ── Tool calls and responses ───────────────────────────────────────

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// The answer to one [`FunctionCall`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: FunctionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResult {
    pub result: Value,
}

impl FunctionResponse {
    pub fn new(id: impl Into<String>, name: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: FunctionResult { result },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ToolResponseMessage {
    #[serde(rename = "toolResponse")]
    pub tool_response: ToolResponse,
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    #[serde(rename = "functionResponses")]
    pub function_responses: Vec<FunctionResponse>,
}

/// Wire format: `{"toolResponse": {"functionResponses": [{"id", "name", "response": {"result": …}}]}}`
pub fn build_tool_response_message(responses: Vec<FunctionResponse>) -> ToolResponseMessage {
    ToolResponseMessage {
        tool_response: ToolResponse {
            function_responses: responses,
        },
    }
}

/// Tells the backend the microphone stopped so it flushes buffered input.
///
/// Wire format: `{"realtimeInput": {"audioStreamEnd": true}}`
pub fn build_audio_stream_end_message() -> Value {
    serde_json::json!({
        "realtimeInput": {
            "audioStreamEnd": true
        }
    })
}

// ── Server response parsing ────────────────────────────────────────

/// Parse a JSON frame from Gemini Live into a list of events.
///
/// A single server message can carry several events (audio plus
/// interruption, or transcription next to a tool call). Audio is emitted
/// before the interruption flag of the same message. Unparsable frames yield
/// no events.
pub fn parse_server_message(json_text: &str) -> Vec<VoiceEvent> {
    let mut events = Vec::new();

    let value: Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse Gemini Live server message");
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(VoiceEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    match base64::engine::general_purpose::STANDARD.decode(data_b64) {
                        Ok(audio_bytes) => events.push(VoiceEvent::Audio { data: audio_bytes }),
                        Err(e) => tracing::warn!(error = %e, "Dropping undecodable audio part"),
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    events.push(VoiceEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::TurnComplete);
        }
        for (key, input) in [("inputTranscription", true), ("outputTranscription", false)] {
            let text = content
                .pointer(&format!("/{key}/text"))
                .and_then(|v| v.as_str())
                .filter(|t| !t.is_empty());
            if let Some(text) = text {
                let text = text.to_string();
                events.push(if input {
                    VoiceEvent::InputTranscript { text }
                } else {
                    VoiceEvent::OutputTranscript { text }
                });
            }
        }
    }

    if let Some(calls) = value.pointer("/toolCall/functionCalls") {
        match serde_json::from_value::<Vec<FunctionCall>>(calls.clone()) {
            Ok(calls) if !calls.is_empty() => events.push(VoiceEvent::ToolCall { calls }),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Malformed toolCall payload"),
        }
    }

    if let Some(ids) = value
        .pointer("/toolCallCancellation/ids")
        .and_then(|v| v.as_array())
    {
        let ids = ids
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect();
        events.push(VoiceEvent::ToolCallCancellation { ids });
    }

    if let Some(go_away) = value.get("goAway") {
        events.push(VoiceEvent::GoAway {
            time_left: go_away
                .get("timeLeft")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        });
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(VoiceEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

// ── Transport seam ─────────────────────────────────────────────────

/// Outbound message queued for the WebSocket.
#[derive(Debug)]
pub enum OutboundMessage {
    /// One encoded microphone chunk.
    Audio(MediaChunk),
    /// Result of a tool call.
    ToolResponse(FunctionResponse),
    /// Microphone stopped; sent on disconnect just before `Close`.
    AudioStreamEnd,
    /// Close the connection.
    Close,
}

/// Cloneable sending half of a live session.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::Sender<OutboundMessage>,
}

impl LiveSender {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    /// Queue an audio chunk without waiting. Returns `false` when the chunk
    /// was dropped because the queue is full or the session is gone.
    pub fn try_send_audio(&self, chunk: MediaChunk) -> bool {
        self.tx.try_send(OutboundMessage::Audio(chunk)).is_ok()
    }

    /// Wait for room for one tool result.
    ///
    /// Nothing is queued until the permit is used, so the caller can still
    /// decide to drop the result after the wait.
    pub async fn reserve_tool_response(&self) -> Result<ToolResponsePermit<'_>> {
        self.tx
            .reserve()
            .await
            .map(ToolResponsePermit)
            .map_err(|_| VoiceError::NotConnected)
    }

    /// Queue `audioStreamEnd` without waiting. Returns `false` when the queue
    /// is full or the session is gone.
    pub fn end_audio_stream(&self) -> bool {
        self.tx.try_send(OutboundMessage::AudioStreamEnd).is_ok()
    }

    /// Request a close frame. Never waits; a full queue just drops the
    /// request and the socket closes when the sender is dropped.
    pub fn close(&self) {
        let _ = self.tx.try_send(OutboundMessage::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A reserved slot in the outbound queue for one tool result.
#[derive(Debug)]
pub struct ToolResponsePermit<'a>(mpsc::Permit<'a, OutboundMessage>);

impl ToolResponsePermit<'_> {
    pub fn send(self, response: FunctionResponse) {
        self.0.send(OutboundMessage::ToolResponse(response));
    }
}

/// An open live session: outbound queue plus inbound event stream.
#[derive(Debug)]
pub struct LiveConnection {
    pub sender: LiveSender,
    pub events: mpsc::Receiver<VoiceEvent>,
}

/// Opens live sessions. The manager only talks to the backend through this.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Perform the handshake and return once the session is ready to stream.
    async fn open(&self, session_id: &str, setup: &SetupMessage) -> Result<LiveConnection>;
}

// ── Gemini Live WebSocket transport ────────────────────────────────

/// [`LiveTransport`] over the Gemini Live WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    api_key: String,
    endpoint: String,
    setup_timeout: Duration,
    outbound_depth: usize,
    event_depth: usize,
}

impl GeminiLiveTransport {
    pub fn new(api_key: impl Into<String>, settings: &VoiceSettings) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: settings.endpoint.clone(),
            setup_timeout: Duration::from_secs(settings.setup_timeout_secs.max(1)),
            outbound_depth: settings.outbound_queue_depth.max(1),
            event_depth: settings.event_queue_depth.max(1),
        }
    }

    /// Wait for `setupComplete`, which may arrive as a Text or Binary frame.
    async fn await_setup_complete(ws_stream: &mut WsStream, session_id: &str) -> Result<()> {
        while let Some(msg_result) = ws_stream.next().await {
            match msg_result {
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        if let Some(err) = setup_rejection(text) {
                            return Err(VoiceError::session_open(err));
                        }
                        if text.contains("setupComplete") {
                            tracing::info!(session_id = %session_id, "Gemini Live setup complete");
                            return Ok(());
                        }
                    }
                }
                Ok(WsMessage::Text(text)) => {
                    if let Some(err) = setup_rejection(&text) {
                        return Err(VoiceError::session_open(err));
                    }
                    if text.contains("setupComplete") {
                        tracing::info!(
                            session_id = %session_id,
                            "Gemini Live setup complete (text frame)"
                        );
                        return Ok(());
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    return Err(VoiceError::session_open(format!(
                        "connection closed before setupComplete: {frame:?}"
                    )));
                }
                Err(e) => {
                    return Err(VoiceError::session_open(format!(
                        "WebSocket error before setupComplete: {e}"
                    )));
                }
                other => {
                    tracing::debug!(
                        session_id = %session_id,
                        msg = ?other,
                        "Gemini Live setup phase: ignoring frame"
                    );
                }
            }
        }
        Err(VoiceError::session_open("stream ended before setupComplete"))
    }

    /// Outbound loop: serialize queued messages onto the WebSocket.
    async fn outbound_loop(
        mut rx: mpsc::Receiver<OutboundMessage>,
        mut ws_sender: WsSink,
        session_id: String,
    ) {
        let mut audio_chunk_count: u64 = 0;

        while let Some(msg) = rx.recv().await {
            let json = match msg {
                OutboundMessage::Audio(chunk) => {
                    audio_chunk_count += 1;
                    if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                        tracing::debug!(
                            session_id = %session_id,
                            chunk = audio_chunk_count,
                            b64_len = chunk.data.len(),
                            "Sending audio chunk to Gemini"
                        );
                    }
                    serde_json::to_string(&build_audio_message(chunk))
                }
                OutboundMessage::ToolResponse(response) => {
                    tracing::info!(
                        session_id = %session_id,
                        call_id = %response.id,
                        tool = %response.name,
                        "Sending tool response"
                    );
                    serde_json::to_string(&build_tool_response_message(vec![response]))
                }
                OutboundMessage::AudioStreamEnd => {
                    serde_json::to_string(&build_audio_stream_end_message())
                }
                OutboundMessage::Close => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            };

            match json {
                Ok(json) => {
                    if ws_sender.send(WsMessage::text(json)).await.is_err() {
                        tracing::warn!(
                            session_id = %session_id,
                            "WebSocket send failed, closing outbound loop"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to serialize outbound message"
                    );
                }
            }
        }

        tracing::debug!(session_id = %session_id, "Outbound loop terminated");
    }

    /// Inbound loop: receive frames, parse, forward events.
    async fn inbound_loop(
        mut ws_receiver: WsSource,
        event_tx: mpsc::Sender<VoiceEvent>,
        session_id: String,
    ) {
        let start_time = std::time::Instant::now();
        let mut audio_response_count: u64 = 0;

        let terminal = loop {
            let Some(msg_result) = ws_receiver.next().await else {
                break VoiceEvent::Closed {
                    reason: Some("stream ended".to_string()),
                };
            };
            let text = match msg_result {
                Ok(WsMessage::Text(text)) => text.to_string(),
                Ok(WsMessage::Binary(data)) => {
                    if data.first() != Some(&b'{') {
                        if !data.is_empty() {
                            tracing::warn!(
                                session_id = %session_id,
                                len = data.len(),
                                "Unexpected non-JSON binary frame from Gemini Live, skipping"
                            );
                        }
                        continue;
                    }
                    match std::str::from_utf8(&data) {
                        Ok(text) => text.to_string(),
                        Err(_) => continue,
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(
                        session_id = %session_id,
                        close_frame = ?frame,
                        "Gemini Live connection closed"
                    );
                    break VoiceEvent::Closed {
                        reason: frame.map(|f| f.reason.to_string()),
                    };
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Gemini Live WebSocket error"
                    );
                    break VoiceEvent::Error {
                        message: format!("WebSocket error: {e}"),
                    };
                }
            };

            let elapsed = start_time.elapsed().as_secs_f32();
            for event in parse_server_message(&text) {
                match &event {
                    VoiceEvent::Audio { data } => {
                        audio_response_count += 1;
                        tracing::trace!(
                            session_id = %session_id,
                            t = format!("{elapsed:.1}s"),
                            audio_n = audio_response_count,
                            bytes = data.len(),
                            "⬇ Gemini audio response"
                        );
                    }
                    VoiceEvent::ToolCall { calls } => {
                        tracing::info!(
                            session_id = %session_id,
                            t = format!("{elapsed:.1}s"),
                            calls = calls.len(),
                            "⬇ Tool call"
                        );
                    }
                    VoiceEvent::Interrupted => {
                        tracing::info!(
                            session_id = %session_id,
                            t = format!("{elapsed:.1}s"),
                            "⬇ Interrupted"
                        );
                    }
                    _ => {}
                }
                if event_tx.send(event).await.is_err() {
                    tracing::debug!(
                        session_id = %session_id,
                        "Event receiver dropped, closing inbound loop"
                    );
                    return;
                }
            }
        };

        let _ = event_tx.send(terminal).await;
        tracing::debug!(session_id = %session_id, "Inbound loop terminated");
    }
}

/// Extract the server's error message from a setup-phase frame, if any.
fn setup_rejection(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let err = value.get("error")?;
    Some(
        err.get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("setup rejected")
            .to_string(),
    )
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn open(&self, session_id: &str, setup: &SetupMessage) -> Result<LiveConnection> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        tracing::info!(
            session_id = %session_id,
            model = %setup.setup.model,
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| VoiceError::session_open(format!("failed to connect: {e}")))?;

        let setup_json = serde_json::to_string(setup)?;
        tracing::debug!(session_id = %session_id, bytes = setup_json.len(), "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::text(setup_json))
            .await
            .map_err(|e| VoiceError::session_open(format!("failed to send setup message: {e}")))?;

        match tokio::time::timeout(
            self.setup_timeout,
            Self::await_setup_complete(&mut ws_stream, session_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::session_open(format!(
                    "setupComplete timeout ({}s)",
                    self.setup_timeout.as_secs()
                )))
            }
        }

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(self.outbound_depth);
        let (event_tx, event_rx) = mpsc::channel::<VoiceEvent>(self.event_depth);

        let sid_out = session_id.to_string();
        tokio::spawn(async move {
            Self::outbound_loop(outbound_rx, ws_sender, sid_out).await;
        });

        let sid_in = session_id.to_string();
        tokio::spawn(async move {
            Self::inbound_loop(ws_receiver, event_tx, sid_in).await;
        });

        Ok(LiveConnection {
            sender: LiveSender::new(outbound_tx),
            events: event_rx,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    type ServerSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Transport pointed at a local listener, with a one second setup timeout.
    async fn local_transport() -> (TcpListener, GeminiLiveTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = VoiceSettings {
            endpoint: format!("ws://{}/ws", listener.local_addr().unwrap()),
            setup_timeout_secs: 1,
            ..VoiceSettings::default()
        };
        (listener, GeminiLiveTransport::new("test-key", &settings))
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    /// Next data frame from the client, parsed as JSON.
    async fn next_json(ws: &mut ServerSocket) -> Value {
        loop {
            match ws.next().await.expect("client hung up").expect("socket error") {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Binary(data) => return serde_json::from_slice(&data).unwrap(),
                _ => {}
            }
        }
    }

    fn audio_frame(pcm: &[u8]) -> WsMessage {
        let data = base64::engine::general_purpose::STANDARD.encode(pcm);
        WsMessage::text(
            json!({"serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}}
            ]}}})
            .to_string(),
        )
    }

    fn setup() -> SetupMessage {
        build_setup_message(&VoiceSettings::default())
    }

    #[test]
    fn setup_message_carries_model_voice_and_tools() {
        let settings = VoiceSettings::default();
        let msg = build_setup_message(&settings);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            json["setup"]["model"],
            format!("models/{}", settings.model)
        );
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO"])
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        let decls = json["setup"]["tools"][0]["functionDeclarations"]
            .as_array()
            .unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0]["name"], "reportHazard");
        assert_eq!(decls[1]["name"], "getHazardsNearby");
        assert!(json["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("SafeTravel"));
    }

    #[test]
    fn audio_message_encodes_base64_pcm() {
        let chunk = MediaChunk::from_samples(&[0.5, -0.5]);
        let msg = build_audio_message(chunk);
        let json = serde_json::to_value(&msg).unwrap();

        let media = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(media["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, vec![0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn tool_response_wire_format() {
        let msg = build_tool_response_message(vec![FunctionResponse::new(
            "call-1",
            "reportHazard",
            json!({"result": "Hazard reported successfully."}),
        )]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({
                "toolResponse": {
                    "functionResponses": [{
                        "id": "call-1",
                        "name": "reportHazard",
                        "response": {"result": {"result": "Hazard reported successfully."}}
                    }]
                }
            })
        );
    }

    #[test]
    fn audio_stream_end_format() {
        let json = build_audio_stream_end_message().to_string();
        assert!(json.contains("audioStreamEnd"));
        assert!(!json.contains("mimeType"));
    }

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], VoiceEvent::SetupComplete));
    }

    #[test]
    fn parse_audio_response() {
        let audio_b64 = base64::engine::general_purpose::STANDARD.encode([10u8, 20, 30, 40]);
        let json = format!(
            r#"{{"serverContent": {{"modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{audio_b64}"}}}}]}}}}}}"#
        );
        let events = parse_server_message(&json);
        assert!(matches!(
            &events[..],
            [VoiceEvent::Audio { data }] if data == &[10u8, 20, 30, 40]
        ));
    }

    #[test]
    fn parse_audio_then_interrupted_in_same_message() {
        let audio_b64 = base64::engine::general_purpose::STANDARD.encode([0u8, 0]);
        let json = format!(
            r#"{{"serverContent": {{"interrupted": true, "modelTurn": {{"parts": [{{"inlineData": {{"data": "{audio_b64}"}}}}]}}}}}}"#
        );
        let events = parse_server_message(&json);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], VoiceEvent::Audio { .. }));
        assert!(matches!(events[1], VoiceEvent::Interrupted));
    }

    #[test]
    fn parse_turn_complete_and_transcriptions() {
        let json = r#"{"serverContent": {"turnComplete": true,
            "inputTranscription": {"text": "pothole ahead"},
            "outputTranscription": {"text": ""}}}"#;
        let events = parse_server_message(json);
        assert!(events.iter().any(|e| matches!(e, VoiceEvent::TurnComplete)));
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::InputTranscript { text } if text == "pothole ahead"
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, VoiceEvent::OutputTranscript { .. })));
    }

    #[test]
    fn parse_tool_call() {
        let json = r#"{"toolCall": {"functionCalls": [
            {"id": "fc-1", "name": "reportHazard", "args": {"type": "POTHOLE", "description": "deep pothole"}},
            {"id": "fc-2", "name": "getHazardsNearby"}
        ]}}"#;
        let events = parse_server_message(json);
        let VoiceEvent::ToolCall { calls } = &events[0] else {
            panic!("expected tool call, got {events:?}");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "fc-1");
        assert_eq!(calls[0].name, "reportHazard");
        assert_eq!(
            calls[0].args,
            json!({"type": "POTHOLE", "description": "deep pothole"})
        );
        assert_eq!(calls[1].args, Value::Null);
    }

    #[test]
    fn parse_tool_call_cancellation_and_go_away() {
        let json = r#"{"toolCallCancellation": {"ids": ["fc-1"]}, "goAway": {"timeLeft": "10s"}}"#;
        let events = parse_server_message(json);
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::ToolCallCancellation { ids } if ids == &["fc-1".to_string()]
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::GoAway { time_left: Some(t) } if t == "10s"
        )));
    }

    #[test]
    fn parse_error() {
        let events = parse_server_message(r#"{"error": {"message": "Rate limit exceeded"}}"#);
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::Error { message } if message.contains("Rate limit")
        )));
    }

    #[test]
    fn parse_invalid_json_yields_nothing() {
        assert!(parse_server_message("not json at all").is_empty());
    }

    #[test]
    fn setup_rejection_reads_error_message() {
        assert_eq!(
            setup_rejection(r#"{"error": {"message": "API key not valid"}}"#).as_deref(),
            Some("API key not valid")
        );
        assert!(setup_rejection(r#"{"setupComplete": {}}"#).is_none());
    }

    #[tokio::test]
    async fn live_sender_drops_audio_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = LiveSender::new(tx);
        assert!(sender.try_send_audio(MediaChunk::pcm16(&[0, 0])));
        assert!(!sender.try_send_audio(MediaChunk::pcm16(&[0, 0])));
        assert!(!sender.end_audio_stream());

        assert!(matches!(rx.recv().await, Some(OutboundMessage::Audio(_))));
        drop(rx);
        assert!(sender.reserve_tool_response().await.is_err());
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn unused_tool_response_permit_queues_nothing() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = LiveSender::new(tx);

        let permit = sender.reserve_tool_response().await.unwrap();
        assert!(!sender.try_send_audio(MediaChunk::pcm16(&[0, 0])));
        drop(permit);
        assert!(rx.try_recv().is_err());

        let permit = sender.reserve_tool_response().await.unwrap();
        permit.send(FunctionResponse::new("fc-1", "reportHazard", Value::Null));
        let Some(OutboundMessage::ToolResponse(resp)) = rx.recv().await else {
            panic!("expected tool response");
        };
        assert_eq!(resp.id, "fc-1");
    }

    #[tokio::test]
    async fn transport_streams_both_ways_after_text_setup_complete() {
        let (listener, transport) = local_transport().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut path = String::new();
            let callback = |req: &Request, response: Response| {
                path = req.uri().to_string();
                Ok(response)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            assert_eq!(path, "/ws?key=test-key");

            let setup = next_json(&mut ws).await;
            assert_eq!(
                setup["setup"]["model"],
                format!("models/{}", VoiceSettings::default().model)
            );
            ws.send(WsMessage::text(r#"{"setupComplete": {}}"#))
                .await
                .unwrap();
            ws.send(audio_frame(&[1, 0, 2, 0])).await.unwrap();

            let mut frames = Vec::new();
            for _ in 0..3 {
                frames.push(next_json(&mut ws).await);
            }
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            frames
        });

        let mut conn = transport.open("s-1", &setup()).await.unwrap();
        assert!(matches!(
            conn.events.recv().await,
            Some(VoiceEvent::Audio { data }) if data == [1, 0, 2, 0]
        ));

        assert!(conn.sender.try_send_audio(MediaChunk::pcm16(&[0x00, 0x40])));
        conn.sender
            .reserve_tool_response()
            .await
            .unwrap()
            .send(FunctionResponse::new(
                "fc-1",
                "reportHazard",
                json!({"result": "ok"}),
            ));
        assert!(conn.sender.end_audio_stream());

        let frames = server.await.unwrap();
        assert_eq!(
            frames[0],
            json!({"realtimeInput": {"mediaChunks": [
                {"mimeType": "audio/pcm;rate=16000", "data": "AEA="}
            ]}})
        );
        assert_eq!(
            frames[1],
            json!({"toolResponse": {"functionResponses": [
                {"id": "fc-1", "name": "reportHazard", "response": {"result": {"result": "ok"}}}
            ]}})
        );
        assert_eq!(frames[2], json!({"realtimeInput": {"audioStreamEnd": true}}));

        // A close frame from the backend ends the stream as `Closed`.
        assert!(matches!(
            conn.events.recv().await,
            Some(VoiceEvent::Closed { reason: Some(reason) }) if reason == "bye"
        ));
    }

    #[tokio::test]
    async fn binary_setup_complete_then_reset_reports_error() {
        let (listener, transport) = local_transport().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            next_json(&mut ws).await;
            ws.send(WsMessage::binary(br#"{"setupComplete": {}}"#.to_vec()))
                .await
                .unwrap();
            ws.send(audio_frame(&[1, 0, 2, 0])).await.unwrap();
            // Dropped without a closing handshake.
        });

        let mut conn = transport.open("s-2", &setup()).await.unwrap();
        server.await.unwrap();

        assert!(matches!(
            conn.events.recv().await,
            Some(VoiceEvent::Audio { data }) if data == [1, 0, 2, 0]
        ));
        let terminal = conn.events.recv().await;
        assert!(
            matches!(&terminal, Some(VoiceEvent::Error { message }) if message.starts_with("WebSocket error")),
            "{terminal:?}"
        );
    }

    #[tokio::test]
    async fn close_from_client_sends_close_frame() {
        let (listener, transport) = local_transport().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            next_json(&mut ws).await;
            ws.send(WsMessage::text(r#"{"setupComplete": {}}"#))
                .await
                .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) => return true,
                    Some(Ok(_)) => continue,
                    _ => return false,
                }
            }
        });

        let conn = transport.open("s-3", &setup()).await.unwrap();
        conn.sender.close();
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn setup_error_is_a_session_open_failure() {
        let (listener, transport) = local_transport().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            next_json(&mut ws).await;
            ws.send(WsMessage::text(
                r#"{"error": {"code": 400, "message": "API key not valid"}}"#,
            ))
            .await
            .unwrap();
            ws
        });

        let err = transport.open("s-4", &setup()).await.unwrap_err();
        assert!(
            matches!(&err, VoiceError::SessionOpen(m) if m == "API key not valid"),
            "{err}"
        );
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn missing_setup_complete_times_out() {
        let (listener, transport) = local_transport().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            next_json(&mut ws).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            ws
        });

        let err = transport.open("s-5", &setup()).await.unwrap_err();
        assert!(
            matches!(&err, VoiceError::SessionOpen(m) if m == "setupComplete timeout (1s)"),
            "{err}"
        );
        server.abort();
    }

    #[tokio::test]
    async fn close_before_setup_complete_fails_open() {
        let (listener, transport) = local_transport().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            next_json(&mut ws).await;
            let _ = ws.close(None).await;
        });

        let err = transport.open("s-6", &setup()).await.unwrap_err();
        assert!(
            matches!(&err, VoiceError::SessionOpen(m) if m.contains("before setupComplete")),
            "{err}"
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        let (listener, transport) = local_transport().await;
        drop(listener);
        let err = transport.open("s-7", &setup()).await.unwrap_err();
        assert!(
            matches!(&err, VoiceError::SessionOpen(m) if m.starts_with("failed to connect")),
            "{err}"
        );
    }
}
