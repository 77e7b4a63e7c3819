//! Scriptable in-memory audio backend for tests

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::device::{
    AudioBackend, AudioEffect, BufferSizeReport, Direction, EffectKind, InputDevice, OutputDevice,
};
use crate::audio::frame::AudioFormat;
use crate::error::AudioError;

pub(crate) struct MockState {
    pub input_report: Mutex<BufferSizeReport>,
    pub output_report: Mutex<BufferSizeReport>,
    pub fail_open_input: AtomicBool,
    pub fail_open_output: AtomicBool,
    pub fail_stop: AtomicBool,
    pub effects_available: AtomicBool,
    /// Pending reads that fail
    pub read_errors: AtomicUsize,
    /// Pending reads that report more bytes than the buffer holds
    pub oversized_reads: AtomicUsize,
    /// Byte pattern the microphone produces
    pub sample_byte: AtomicU8,
    pub reads: AtomicUsize,
    pub input_opens: AtomicUsize,
    pub inputs_live: AtomicUsize,
    pub max_inputs_live: AtomicUsize,
    pub output_opens: AtomicUsize,
    pub outputs_live: AtomicUsize,
    pub effects_live: AtomicUsize,
    pub effects_created: AtomicUsize,
    pub written: Mutex<Vec<Vec<u8>>>,
    pub write_delay: Mutex<Duration>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            input_report: Mutex::new(BufferSizeReport::Bytes(320)),
            output_report: Mutex::new(BufferSizeReport::Bytes(320)),
            fail_open_input: AtomicBool::new(false),
            fail_open_output: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            effects_available: AtomicBool::new(true),
            read_errors: AtomicUsize::new(0),
            oversized_reads: AtomicUsize::new(0),
            sample_byte: AtomicU8::new(0x55),
            reads: AtomicUsize::new(0),
            input_opens: AtomicUsize::new(0),
            inputs_live: AtomicUsize::new(0),
            max_inputs_live: AtomicUsize::new(0),
            output_opens: AtomicUsize::new(0),
            outputs_live: AtomicUsize::new(0),
            effects_live: AtomicUsize::new(0),
            effects_created: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl MockState {
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for MockBackend {
    fn min_buffer_size(&self, direction: Direction, _format: &AudioFormat) -> BufferSizeReport {
        match direction {
            Direction::Input => self.state.input_report.lock().clone(),
            Direction::Output => self.state.output_report.lock().clone(),
        }
    }

    fn open_input(
        &self,
        _format: &AudioFormat,
        _buffer_bytes: usize,
    ) -> Result<Box<dyn InputDevice>, AudioError> {
        if self.state.fail_open_input.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable("mock microphone".into()));
        }
        self.state.input_opens.fetch_add(1, Ordering::SeqCst);
        let live = self.state.inputs_live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_inputs_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockInput {
            state: self.state.clone(),
        }))
    }

    fn open_output(
        &self,
        _format: &AudioFormat,
        _buffer_bytes: usize,
    ) -> Result<Box<dyn OutputDevice>, AudioError> {
        if self.state.fail_open_output.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable("mock speaker".into()));
        }
        self.state.output_opens.fetch_add(1, Ordering::SeqCst);
        self.state.outputs_live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockOutput {
            state: self.state.clone(),
        }))
    }

    fn enable_effect(
        &self,
        kind: EffectKind,
        _device: &dyn InputDevice,
    ) -> Option<Box<dyn AudioEffect>> {
        if !self.state.effects_available.load(Ordering::SeqCst) {
            return None;
        }
        self.state.effects_created.fetch_add(1, Ordering::SeqCst);
        self.state.effects_live.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(MockEffect {
            kind,
            state: self.state.clone(),
        }))
    }
}

struct MockInput {
    state: Arc<MockState>,
}

impl InputDevice for MockInput {
    fn start(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        thread::sleep(Duration::from_millis(2));
        self.state.reads.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.state.read_errors) {
            return Err(AudioError::ReadFailed("mock read error".into()));
        }
        if take_one(&self.state.oversized_reads) {
            return Ok(buf.len() + 1);
        }
        buf.fill(self.state.sample_byte.load(Ordering::SeqCst));
        Ok(buf.len())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if self.state.fail_stop.load(Ordering::SeqCst) {
            return Err(AudioError::StopFailed("mock stop failure".into()));
        }
        Ok(())
    }
}

impl Drop for MockInput {
    fn drop(&mut self) {
        self.state.inputs_live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockOutput {
    state: Arc<MockState>,
}

impl OutputDevice for MockOutput {
    fn start(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        let delay = *self.state.write_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.state.written.lock().push(data.to_vec());
        Ok(data.len())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if self.state.fail_stop.load(Ordering::SeqCst) {
            return Err(AudioError::StopFailed("mock stop failure".into()));
        }
        Ok(())
    }
}

impl Drop for MockOutput {
    fn drop(&mut self) {
        self.state.outputs_live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockEffect {
    kind: EffectKind,
    state: Arc<MockState>,
}

impl AudioEffect for MockEffect {
    fn kind(&self) -> EffectKind {
        self.kind
    }
}

impl Drop for MockEffect {
    fn drop(&mut self) {
        self.state.effects_live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Poll `condition` until it holds or `timeout` passes
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
