//! Microphone capture
//!
//! A single-use engine: one dedicated high-priority thread reads fixed-size
//! chunks from the input device, silences them while muted, and hands them
//! to a [`CaptureSink`] until stopped.

use crossbeam_channel::{bounded, Sender};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::audio::device::{
    validate_buffer_size, AudioBackend, AudioEffect, Direction, EffectKind, InputDevice,
};
use crate::audio::frame::AudioFormat;
use crate::audio::priority::{promote_or_warn, AudioPriority};
use crate::config::SessionConfig;
use crate::error::AudioError;

/// Where captured chunks go
pub enum CaptureSink {
    /// Written and flushed to a byte stream
    Stream(Box<dyn Write + Send>),
    /// Passed to a callback
    Callback(Box<dyn FnMut(&[u8]) + Send>),
}

impl CaptureSink {
    pub fn stream(writer: impl Write + Send + 'static) -> Self {
        CaptureSink::Stream(Box::new(writer))
    }

    pub fn callback(f: impl FnMut(&[u8]) + Send + 'static) -> Self {
        CaptureSink::Callback(Box::new(f))
    }

    fn deliver(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            CaptureSink::Stream(writer) => {
                writer.write_all(chunk)?;
                writer.flush()
            }
            CaptureSink::Callback(f) => {
                f(chunk);
                Ok(())
            }
        }
    }
}

/// Microphone capture engine
pub struct AudioCapture {
    backend: Arc<dyn AudioBackend>,
    format: AudioFormat,
    fallback_buffer_bytes: usize,
    effects: Vec<EffectKind>,

    /// Consumed by the first start
    sink: Option<CaptureSink>,

    /// Whether the worker should keep recording
    alive: Arc<AtomicBool>,

    /// Read by the worker on every cycle
    muted: Arc<AtomicBool>,

    /// Worker thread handle
    worker: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// Create a capture engine delivering to `sink`
    pub fn new(backend: Arc<dyn AudioBackend>, config: &SessionConfig, sink: CaptureSink) -> Self {
        let mut effects = Vec::new();
        if config.capture.noise_suppression {
            effects.push(EffectKind::NoiseSuppression);
        }
        if config.capture.echo_cancellation {
            effects.push(EffectKind::EchoCancellation);
        }

        Self {
            backend,
            format: config.audio.format(),
            fallback_buffer_bytes: config.audio.fallback_buffer_bytes,
            effects,
            sink: Some(sink),
            alive: Arc::new(AtomicBool::new(false)),
            muted: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Start recording.
    ///
    /// Blocks until the worker has opened the microphone or failed to. A
    /// failure is logged and returned; the engine is left not recording.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.is_recording() {
            warn!("Capture already running");
            return Ok(());
        }
        let Some(sink) = self.sink.take() else {
            warn!("Capture engine already used; construct a new one to record again");
            return Ok(());
        };

        let (ready_tx, ready_rx) = bounded(1);
        let context = CaptureContext {
            backend: self.backend.clone(),
            format: self.format,
            fallback_buffer_bytes: self.fallback_buffer_bytes,
            effects: self.effects.clone(),
            sink,
            alive: self.alive.clone(),
            muted: self.muted.clone(),
            ready: ready_tx,
        };

        self.alive.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("voice-capture".into())
            .spawn(move || run_capture(context));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.alive.store(false, Ordering::Release);
                error!("Failed to spawn capture thread: {}", e);
                return Err(AudioError::ThreadSpawn(e.to_string()));
            }
        };
        self.worker = Some(handle);

        let outcome = ready_rx.recv().unwrap_or(Err(AudioError::WorkerLost));
        match outcome {
            Ok(buffer_bytes) => {
                info!(
                    sample_rate = self.format.sample_rate,
                    buffer_bytes, "Recording started"
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to start recording: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    /// Stop recording and wait until the microphone is released
    pub fn stop(&mut self) {
        self.alive.store(false, Ordering::Release);
        let Some(handle) = self.worker.take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            error!("Capture stop requested from its own worker thread; not waiting");
            return;
        }
        if handle.join().is_err() {
            error!("Capture worker panicked; treating shutdown as complete");
        }
        debug!("Capture worker joined");
    }

    /// Check if capture is running
    pub fn is_recording(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Silence outgoing audio from the next read cycle on
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the capture worker owns
struct CaptureContext {
    backend: Arc<dyn AudioBackend>,
    format: AudioFormat,
    fallback_buffer_bytes: usize,
    effects: Vec<EffectKind>,
    sink: CaptureSink,
    alive: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    ready: Sender<Result<usize, AudioError>>,
}

/// Open microphone plus attached effects.
///
/// Dropping stops the device, then releases the effects, then the device.
struct OpenInput {
    effects: Vec<Box<dyn AudioEffect>>,
    device: Box<dyn InputDevice>,
}

impl Drop for OpenInput {
    fn drop(&mut self) {
        if let Err(e) = self.device.stop() {
            error!("Failed to stop microphone: {}", e);
        }
    }
}

/// Clears the liveness flag however the worker exits
pub(crate) struct AliveGuard(pub(crate) Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn open_input(context: &CaptureContext) -> Result<(OpenInput, usize), AudioError> {
    let report = context
        .backend
        .min_buffer_size(Direction::Input, &context.format);
    let buffer_bytes =
        validate_buffer_size(report, &context.format, context.fallback_buffer_bytes)?;

    let device = context.backend.open_input(&context.format, buffer_bytes)?;
    let mut input = OpenInput {
        effects: Vec::new(),
        device,
    };

    for kind in &context.effects {
        match context.backend.enable_effect(*kind, input.device.as_ref()) {
            Some(effect) => {
                debug!(kind = ?effect.kind(), "Capture effect enabled");
                input.effects.push(effect);
            }
            None => debug!(?kind, "Capture effect not available"),
        }
    }

    input.device.start()?;
    Ok((input, buffer_bytes))
}

/// Capture worker loop
fn run_capture(context: CaptureContext) {
    let _alive = AliveGuard(context.alive.clone());
    promote_or_warn(AudioPriority::Audio);

    let (mut input, buffer_bytes) = match open_input(&context) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = context.ready.send(Err(e));
            return;
        }
    };
    let _ = context.ready.send(Ok(buffer_bytes));

    let CaptureContext {
        mut sink,
        alive,
        muted,
        ..
    } = context;
    let mut buffer = vec![0u8; buffer_bytes];

    while alive.load(Ordering::Acquire) {
        match input.device.read(&mut buffer) {
            Ok(0) => {}
            Ok(len) if len <= buffer.len() => {
                let chunk = &mut buffer[..len];
                if muted.load(Ordering::Acquire) {
                    chunk.fill(0);
                }
                if let Err(e) = sink.deliver(chunk) {
                    error!("Capture output closed: {}", e);
                    break;
                }
            }
            Ok(len) => warn!("Unexpected length returned from microphone: {}", len),
            Err(e) => warn!("Microphone read failed: {}", e),
        }
    }

    drop(input);
    drop(sink);
    info!("Recording stopped");
}
