//! cpal-backed microphone and speaker.
//!
//! `cpal::Stream` is not `Send`, so each stream is built, played and dropped
//! on a dedicated thread. The async side only holds a stop channel and the
//! thread handle. `close` joins that thread and is run on the blocking pool
//! by the session manager; dropping a stream only signals the thread.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

use super::audio::{
    downmix, f32_to_i16, f32_to_u16, i16_to_f32, resample_linear, u16_to_f32, AudioBuffer,
    LinearResampler, INPUT_SAMPLE_RATE,
};
use super::capture::{AudioInput, BlockChunker, CaptureSink, InputStream};
use super::error::{Result, VoiceError};
use super::playback::{AudioOutput, AudioOutputFactory, SourceId};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stop channel plus thread handle of one device stream.
struct StreamThread {
    name: &'static str,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Ask the stream thread to drop its stream and exit.
    fn signal(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Signal and wait for the thread to exit.
    fn join(&mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(thread = self.name, "Audio stream thread panicked");
            }
        }
    }

    /// Signal and let the thread finish on its own.
    fn detach(&mut self) {
        self.signal();
        self.thread.take();
    }
}

// ── Microphone ─────────────────────────────────────────────────────

/// Default input device, delivered as 16kHz mono blocks.
#[derive(Debug, Clone)]
pub struct DeviceMicrophone {
    block_frames: usize,
}

impl DeviceMicrophone {
    pub fn new(block_frames: usize) -> Self {
        Self { block_frames }
    }
}

type SharedSink = Arc<Mutex<Option<CaptureSink>>>;

fn run_input_stream(
    block_frames: usize,
    sink: SharedSink,
    ready: oneshot::Sender<Result<()>>,
    stop: std_mpsc::Receiver<()>,
) {
    let stream = match build_input_stream(block_frames, sink) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(VoiceError::microphone(format!(
            "failed to start capture: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    // Blocks until close() signals or the handle is dropped.
    let _ = stop.recv();
    drop(stream);
    tracing::debug!("Microphone stream stopped");
}

fn build_input_stream(block_frames: usize, sink: SharedSink) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::microphone("no input device available"))?;
    let config = device
        .default_input_config()
        .map_err(|e| VoiceError::microphone(e.to_string()))?;

    let sample_rate = config.sample_rate();
    let channels = config.channels() as usize;
    let format = config.sample_format();
    tracing::info!(sample_rate, channels, format = ?format, "Opening microphone");

    let capture = CaptureState {
        channels,
        resampler: LinearResampler::new(sample_rate, INPUT_SAMPLE_RATE),
        chunker: BlockChunker::new(block_frames),
        sink,
    };
    let stream_config: cpal::StreamConfig = config.into();
    match format {
        cpal::SampleFormat::F32 => input_stream(&device, &stream_config, capture, |s: f32| s),
        cpal::SampleFormat::I16 => input_stream(&device, &stream_config, capture, i16_to_f32),
        cpal::SampleFormat::U16 => input_stream(&device, &stream_config, capture, u16_to_f32),
        other => Err(VoiceError::microphone(format!(
            "unsupported input sample format {other:?}"
        ))),
    }
}

/// Per-stream state owned by the input callback.
struct CaptureState {
    channels: usize,
    resampler: LinearResampler,
    chunker: BlockChunker,
    sink: SharedSink,
}

impl CaptureState {
    fn push(&mut self, interleaved: &[f32]) {
        let mono = downmix(interleaved, self.channels);
        let resampled = self.resampler.process(&mono);
        let mut guard = self.sink.lock();
        if let Some(deliver) = guard.as_mut() {
            self.chunker.push(&resampled, |block| deliver(block));
        }
    }
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut capture: CaptureState,
    convert: fn(T) -> f32,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| convert(s)));
                capture.push(&scratch);
            },
            |err: cpal::StreamError| tracing::warn!(error = %err, "Microphone stream error"),
            None,
        )
        .map_err(|e| VoiceError::microphone(e.to_string()))
}

struct DeviceInputStream {
    sink: SharedSink,
    thread: StreamThread,
}

impl InputStream for DeviceInputStream {
    fn start(&mut self, sink: CaptureSink) -> Result<()> {
        if !self.thread.is_running() {
            return Err(VoiceError::microphone("microphone already closed"));
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn close(&mut self) {
        self.sink.lock().take();
        self.thread.join();
    }
}

impl Drop for DeviceInputStream {
    fn drop(&mut self) {
        self.sink.lock().take();
        self.thread.detach();
    }
}

#[async_trait]
impl AudioInput for DeviceMicrophone {
    async fn open(&self) -> Result<Box<dyn InputStream>> {
        let sink: SharedSink = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();

        let block_frames = self.block_frames;
        let thread_sink = Arc::clone(&sink);
        let thread = std::thread::Builder::new()
            .name("safetravel-mic".into())
            .spawn(move || run_input_stream(block_frames, thread_sink, ready_tx, stop_rx))
            .map_err(|e| VoiceError::microphone(format!("failed to spawn capture thread: {e}")))?;

        let stream = DeviceInputStream {
            sink,
            thread: StreamThread {
                name: "safetravel-mic",
                stop: Some(stop_tx),
                thread: Some(thread),
            },
        };
        // On failure the stream is dropped, which detaches the thread.
        match tokio::time::timeout(OPEN_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Box::new(stream)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(VoiceError::microphone("capture thread exited")),
            Err(_) => Err(VoiceError::microphone("timed out opening microphone")),
        }
    }
}

// ── Speaker ────────────────────────────────────────────────────────

struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

/// Software mixer driven by the output callback.
struct Mixer {
    sample_rate: u32,
    frames_played: u64,
    next_id: SourceId,
    voices: Vec<Voice>,
}

impl Mixer {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_played: 0,
            next_id: 0,
            voices: Vec::new(),
        }
    }

    fn render(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels.max(1)) {
            let t = self.frames_played;
            let mut sample = 0.0f32;
            for voice in &self.voices {
                if t >= voice.start_frame {
                    if let Some(s) = voice.samples.get((t - voice.start_frame) as usize) {
                        sample += s;
                    }
                }
            }
            frame.fill(sample.clamp(-1.0, 1.0));
            self.frames_played += 1;
        }
        let now = self.frames_played;
        self.voices
            .retain(|v| v.start_frame + v.samples.len() as u64 > now);
    }

    /// Render into a device buffer of any sample type.
    fn render_as<T: Copy>(
        &mut self,
        data: &mut [T],
        channels: usize,
        scratch: &mut Vec<f32>,
        convert: fn(f32) -> T,
    ) {
        scratch.clear();
        scratch.resize(data.len(), 0.0);
        self.render(scratch, channels);
        for (out, &s) in data.iter_mut().zip(scratch.iter()) {
            *out = convert(s);
        }
    }
}

/// Default output device.
#[derive(Debug, Clone, Default)]
pub struct DeviceSpeaker;

impl DeviceSpeaker {
    pub fn new() -> Self {
        Self
    }
}

fn run_output_stream(
    ready: oneshot::Sender<Result<Arc<Mutex<Mixer>>>>,
    stop: std_mpsc::Receiver<()>,
) {
    let (stream, mixer) = match build_output_stream() {
        Ok(built) => built,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(VoiceError::audio_output(format!(
            "failed to start playback: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(mixer));

    let _ = stop.recv();
    drop(stream);
    tracing::debug!("Speaker stream stopped");
}

fn build_output_stream() -> Result<(cpal::Stream, Arc<Mutex<Mixer>>)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::audio_output("no output device available"))?;
    let config = device
        .default_output_config()
        .map_err(|e| VoiceError::audio_output(e.to_string()))?;

    let sample_rate = config.sample_rate();
    let channels = config.channels() as usize;
    let format = config.sample_format();
    tracing::info!(sample_rate, channels, format = ?format, "Opening speaker");

    let mixer = Arc::new(Mutex::new(Mixer::new(sample_rate)));
    let callback_mixer = Arc::clone(&mixer);
    let stream_config: cpal::StreamConfig = config.into();
    let stream = match format {
        cpal::SampleFormat::F32 => {
            output_stream(&device, &stream_config, channels, callback_mixer, |s: f32| s)?
        }
        cpal::SampleFormat::I16 => {
            output_stream(&device, &stream_config, channels, callback_mixer, f32_to_i16)?
        }
        cpal::SampleFormat::U16 => {
            output_stream(&device, &stream_config, channels, callback_mixer, f32_to_u16)?
        }
        other => {
            return Err(VoiceError::audio_output(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    };
    Ok((stream, mixer))
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mixer: Arc<Mutex<Mixer>>,
    convert: fn(f32) -> T,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixer.lock().render_as(data, channels, &mut scratch, convert);
            },
            |err: cpal::StreamError| tracing::warn!(error = %err, "Speaker stream error"),
            None,
        )
        .map_err(|e| VoiceError::audio_output(e.to_string()))
}

struct DeviceOutput {
    mixer: Arc<Mutex<Mixer>>,
    thread: StreamThread,
}

impl AudioOutput for DeviceOutput {
    fn current_time(&self) -> f64 {
        let mixer = self.mixer.lock();
        mixer.frames_played as f64 / f64::from(mixer.sample_rate)
    }

    fn start(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<SourceId> {
        if !self.thread.is_running() {
            return Err(VoiceError::audio_output("speaker closed"));
        }
        let mut mixer = self.mixer.lock();
        let samples = resample_linear(&buffer.samples, buffer.sample_rate, mixer.sample_rate);
        let start_frame = (start_at.max(0.0) * f64::from(mixer.sample_rate)).round() as u64;
        mixer.next_id += 1;
        let id = mixer.next_id;
        mixer.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        Ok(id)
    }

    fn stop(&mut self, id: SourceId) {
        self.mixer.lock().voices.retain(|v| v.id != id);
    }

    fn close(&mut self) {
        self.mixer.lock().voices.clear();
        self.thread.join();
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.mixer.lock().voices.clear();
        self.thread.detach();
    }
}

#[async_trait]
impl AudioOutputFactory for DeviceSpeaker {
    async fn open(&self) -> Result<Box<dyn AudioOutput>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("safetravel-speaker".into())
            .spawn(move || run_output_stream(ready_tx, stop_rx))
            .map_err(|e| VoiceError::audio_output(format!("failed to spawn playback thread: {e}")))?;

        let mut thread = StreamThread {
            name: "safetravel-speaker",
            stop: Some(stop_tx),
            thread: Some(thread),
        };
        let opened = match tokio::time::timeout(OPEN_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VoiceError::audio_output("playback thread exited")),
            Err(_) => Err(VoiceError::audio_output("speaker did not start")),
        };
        match opened {
            Ok(mixer) => Ok(Box::new(DeviceOutput { mixer, thread })),
            Err(e) => {
                thread.detach();
                Err(e)
            }
        }
    }
}
