//! Speaker playback
//!
//! A single-use engine: inbound frames go into a fresh [`PlaybackQueue`]
//! and a dedicated high-priority thread writes them to the output device in
//! arrival order.

use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::audio::buffer::{Offer, PlaybackQueue, QueueStats, SharedPlaybackQueue};
use crate::audio::capture::AliveGuard;
use crate::audio::device::{validate_buffer_size, write_all, AudioBackend, Direction, OutputDevice};
use crate::audio::frame::{AudioFormat, PcmFrame};
use crate::audio::priority::{promote_or_warn, AudioPriority};
use crate::config::SessionConfig;
use crate::error::AudioError;

/// Completion callback, fired once when the playback worker has exited
pub type OnFinish = Box<dyn FnOnce() + Send>;

/// Speaker playback engine
pub struct AudioPlayback {
    backend: Arc<dyn AudioBackend>,
    format: AudioFormat,
    fallback_buffer_bytes: usize,
    watermark: usize,

    /// Created on start, closed on stop
    queue: Option<SharedPlaybackQueue>,

    /// Whether the worker is active
    alive: Arc<AtomicBool>,

    worker: Option<JoinHandle<()>>,

    /// Moved into the worker on start
    on_finish: Option<OnFinish>,
}

impl AudioPlayback {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        config: &SessionConfig,
        on_finish: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            backend,
            format: config.audio.format(),
            fallback_buffer_bytes: config.audio.fallback_buffer_bytes,
            watermark: config.playback.max_buffer_frames,
            queue: None,
            alive: Arc::new(AtomicBool::new(false)),
            worker: None,
            on_finish: Some(Box::new(on_finish)),
        }
    }

    /// Queue a received frame. No-op unless playing.
    pub fn add_audio_data(&self, frame: PcmFrame) -> Offer {
        if !self.is_playing() {
            trace!("Dropping {} bytes, playback not active", frame.len());
            return Offer::Closed;
        }
        match &self.queue {
            Some(queue) => queue.offer(frame),
            None => Offer::Closed,
        }
    }

    /// Handle for delivery threads that offer frames directly
    pub fn queue(&self) -> Option<SharedPlaybackQueue> {
        self.queue.clone()
    }

    /// Start playing.
    ///
    /// Blocks until the worker has opened the speaker or failed to. A
    /// failure is logged and returned; the engine is left not playing.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.is_playing() {
            warn!("Playback already running");
            return Ok(());
        }
        let Some(on_finish) = self.on_finish.take() else {
            warn!("Playback engine already used; construct a new one to play again");
            return Ok(());
        };

        let queue = Arc::new(PlaybackQueue::new(self.watermark));
        self.queue = Some(queue.clone());

        let (ready_tx, ready_rx) = bounded(1);
        let context = PlaybackContext {
            backend: self.backend.clone(),
            format: self.format,
            fallback_buffer_bytes: self.fallback_buffer_bytes,
            queue,
            alive: self.alive.clone(),
            ready: ready_tx,
            on_finish,
        };

        self.alive.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("voice-playback".into())
            .spawn(move || run_playback(context));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.alive.store(false, Ordering::Release);
                error!("Failed to spawn playback thread: {}", e);
                return Err(AudioError::ThreadSpawn(e.to_string()));
            }
        };
        self.worker = Some(handle);

        let outcome = ready_rx.recv().unwrap_or(Err(AudioError::WorkerLost));
        match outcome {
            Ok(buffer_bytes) => {
                info!(
                    sample_rate = self.format.sample_rate,
                    buffer_bytes,
                    watermark = self.watermark,
                    "Playback started"
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to start playback: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    /// Stop playing and wait until the speaker is released
    pub fn stop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(queue) = &self.queue {
            queue.close();
        }
        let Some(handle) = self.worker.take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            error!("Playback stop requested from its own worker thread; not waiting");
            return;
        }
        if handle.join().is_err() {
            error!("Playback worker panicked; treating shutdown as complete");
        }
        debug!("Playback worker joined");
    }

    /// Check if a playback worker is active
    pub fn is_playing(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue
            .as_ref()
            .map(|queue| queue.stats())
            .unwrap_or_else(|| QueueStats {
                watermark: self.watermark,
                ..QueueStats::default()
            })
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PlaybackContext {
    backend: Arc<dyn AudioBackend>,
    format: AudioFormat,
    fallback_buffer_bytes: usize,
    queue: SharedPlaybackQueue,
    alive: Arc<AtomicBool>,
    ready: Sender<Result<usize, AudioError>>,
    on_finish: OnFinish,
}

/// Open speaker. Dropping stops then releases it.
struct OpenOutput {
    device: Box<dyn OutputDevice>,
}

impl Drop for OpenOutput {
    fn drop(&mut self) {
        if let Err(e) = self.device.stop() {
            error!("Failed to stop speaker: {}", e);
        }
    }
}

/// Runs the completion callback on every worker exit path
struct FinishGuard(Option<OnFinish>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(on_finish) = self.0.take() {
            on_finish();
        }
    }
}

fn open_output(
    backend: &dyn AudioBackend,
    format: &AudioFormat,
    fallback_buffer_bytes: usize,
) -> Result<(OpenOutput, usize), AudioError> {
    let report = backend.min_buffer_size(Direction::Output, format);
    let buffer_bytes = validate_buffer_size(report, format, fallback_buffer_bytes)?;

    let mut output = OpenOutput {
        device: backend.open_output(format, buffer_bytes)?,
    };
    output.device.start()?;
    Ok((output, buffer_bytes))
}

/// Playback worker loop
fn run_playback(context: PlaybackContext) {
    let PlaybackContext {
        backend,
        format,
        fallback_buffer_bytes,
        queue,
        alive,
        ready,
        on_finish,
    } = context;

    // Drop order: speaker, then liveness flag, then completion callback
    let _finish = FinishGuard(Some(on_finish));
    let _alive = AliveGuard(alive.clone());
    promote_or_warn(AudioPriority::UrgentAudio);

    let (mut output, buffer_bytes) =
        match open_output(backend.as_ref(), &format, fallback_buffer_bytes) {
            Ok(opened) => opened,
            Err(e) => {
                queue.close();
                let _ = ready.send(Err(e));
                return;
            }
        };
    let _ = ready.send(Ok(buffer_bytes));

    let mut played_bytes = 0;
    while alive.load(Ordering::Acquire) {
        let Some(frame) = queue.take() else {
            break;
        };
        if frame.is_empty() {
            continue;
        }
        match write_all(output.device.as_mut(), frame.as_bytes()) {
            Ok(()) => played_bytes += frame.len(),
            Err(e) => warn!("Speaker write failed: {}", e),
        }
    }

    let stats = queue.stats();
    queue.close();
    drop(output);
    info!(
        played = ?format.duration_of(played_bytes),
        accepted = stats.accepted,
        dropped = stats.dropped,
        clears = stats.clears,
        drop_rate = stats.drop_rate(),
        "Playback finished"
    );
}
