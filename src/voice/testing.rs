//! In-memory microphone, speaker and transport used by the voice tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::audio::AudioBuffer;
use super::capture::{AudioInput, CaptureSink, InputStream};
use super::error::{Result, VoiceError};
use super::gemini_live::{
    FunctionResponse, LiveConnection, LiveSender, LiveTransport, OutboundMessage, SetupMessage,
};
use super::playback::{AudioOutput, AudioOutputFactory, SourceId};
use super::VoiceEvent;

/// Depth of the outbound and event queues of a [`FakeTransport`] session.
pub const QUEUE_DEPTH: usize = 64;

// ── Clock / speaker ────────────────────────────────────────────────

/// Manually driven device clock.
#[derive(Debug, Clone)]
pub struct FakeClock(Arc<Mutex<f64>>);

impl FakeClock {
    pub fn new(t: f64) -> Self {
        Self(Arc::new(Mutex::new(t)))
    }

    pub fn now(&self) -> f64 {
        *self.0.lock()
    }

    pub fn set(&self, t: f64) {
        *self.0.lock() = t;
    }

    pub fn advance(&self, dt: f64) {
        *self.0.lock() += dt;
    }
}

#[derive(Debug, Default)]
struct OutputLog {
    next_id: SourceId,
    started: Vec<(SourceId, f64, f64)>,
    stopped: Vec<SourceId>,
    closes: usize,
}

/// Speaker that records what it was asked to play.
#[derive(Debug, Clone)]
pub struct FakeOutput {
    clock: FakeClock,
    log: Arc<Mutex<OutputLog>>,
}

impl FakeOutput {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            log: Arc::new(Mutex::new(OutputLog::default())),
        }
    }

    /// `(id, start, duration)` of every started buffer.
    pub fn started(&self) -> Vec<(SourceId, f64, f64)> {
        self.log.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.log.lock().stopped.clone()
    }

    pub fn close_count(&self) -> usize {
        self.log.lock().closes
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn start(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<SourceId> {
        let mut log = self.log.lock();
        log.next_id += 1;
        let id = log.next_id;
        log.started.push((id, start_at, buffer.duration()));
        Ok(id)
    }

    fn stop(&mut self, id: SourceId) {
        self.log.lock().stopped.push(id);
    }

    fn close(&mut self) {
        self.log.lock().closes += 1;
    }
}

/// Hands out [`FakeOutput`]s sharing one clock.
pub struct FakeOutputFactory {
    pub clock: FakeClock,
    fail: bool,
    outputs: Mutex<Vec<FakeOutput>>,
}

impl FakeOutputFactory {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            fail: false,
            outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(FakeClock::new(0.0))
        }
    }

    pub fn outputs(&self) -> Vec<FakeOutput> {
        self.outputs.lock().clone()
    }

    pub fn last(&self) -> Option<FakeOutput> {
        self.outputs.lock().last().cloned()
    }
}

#[async_trait]
impl AudioOutputFactory for FakeOutputFactory {
    async fn open(&self) -> Result<Box<dyn AudioOutput>> {
        if self.fail {
            return Err(VoiceError::audio_output("no output device"));
        }
        let output = FakeOutput::new(self.clock.clone());
        self.outputs.lock().push(output.clone());
        Ok(Box::new(output))
    }
}

// ── Microphone ─────────────────────────────────────────────────────

#[derive(Default)]
struct MicState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    sink: Mutex<Option<CaptureSink>>,
}

/// Microphone whose blocks are pushed by the test.
#[derive(Default)]
pub struct FakeMicrophone {
    denied: bool,
    close_delay: Option<Duration>,
    state: Arc<MicState>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    /// A microphone whose `close` blocks its thread for `delay`.
    pub fn slow_close(delay: Duration) -> Self {
        Self {
            close_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.state.sink.lock().is_some()
    }

    /// Deliver one block to the running sink, if any.
    pub fn push_block(&self, samples: &[f32]) -> bool {
        match self.state.sink.lock().as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }
}

struct FakeInputStream {
    state: Arc<MicState>,
    close_delay: Option<Duration>,
    closed: bool,
}

impl InputStream for FakeInputStream {
    fn start(&mut self, sink: CaptureSink) -> Result<()> {
        *self.state.sink.lock() = Some(sink);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(delay) = self.close_delay {
            std::thread::sleep(delay);
        }
        self.state.sink.lock().take();
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioInput for FakeMicrophone {
    async fn open(&self) -> Result<Box<dyn InputStream>> {
        if self.denied {
            return Err(VoiceError::microphone("permission denied"));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInputStream {
            state: Arc::clone(&self.state),
            close_delay: self.close_delay,
            closed: false,
        }))
    }
}

// ── Transport ──────────────────────────────────────────────────────

/// Server side of one fake live session.
pub struct FakeServer {
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub events: mpsc::Sender<VoiceEvent>,
}

impl FakeServer {
    pub async fn send(&self, event: VoiceEvent) {
        self.events
            .send(event)
            .await
            .expect("session stopped reading events");
    }

    /// Next tool response, skipping audio and control messages.
    pub async fn next_tool_response(&mut self) -> Option<FunctionResponse> {
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(msg) = self.outbound.recv().await {
                if let OutboundMessage::ToolResponse(resp) = msg {
                    return Some(resp);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Drain whatever is queued right now.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outbound.try_recv() {
            out.push(msg);
        }
        out
    }
}

/// Transport that opens in-memory sessions.
#[derive(Default)]
pub struct FakeTransport {
    fail: bool,
    opens: AtomicUsize,
    setups: Mutex<Vec<Value>>,
    servers: Mutex<Vec<FakeServer>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Make the next `open` wait until the returned sender fires.
    pub fn hold_next_open(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn setups(&self) -> Vec<Value> {
        self.setups.lock().clone()
    }

    /// Server side of the oldest session not yet taken.
    pub fn take_server(&self) -> Option<FakeServer> {
        let mut servers = self.servers.lock();
        if servers.is_empty() {
            None
        } else {
            Some(servers.remove(0))
        }
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn open(&self, _session_id: &str, setup: &SetupMessage) -> Result<LiveConnection> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.setups.lock().push(serde_json::to_value(setup)?);

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail {
            return Err(VoiceError::session_open("handshake rejected"));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(QUEUE_DEPTH);
        self.servers.lock().push(FakeServer {
            outbound: outbound_rx,
            events: events_tx,
        });
        Ok(LiveConnection {
            sender: LiveSender::new(outbound_tx),
            events: events_rx,
        })
    }
}
