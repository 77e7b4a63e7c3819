//! cpal-backed audio devices
//!
//! cpal delivers audio through realtime callbacks. The engines want blocking
//! reads and writes, so each device bridges the callback to its worker with
//! a small bounded channel of 16-bit mono chunks. Devices that only offer
//! `f32` or several channels are converted on the fly: the first channel is
//! captured, and playback duplicates mono into every channel.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
    SupportedBufferSize, SupportedStreamConfig, SupportedStreamConfigRange,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::Duration;
use tracing::{debug, error, trace};

use crate::audio::device::{AudioBackend, BufferSizeReport, Direction, InputDevice, OutputDevice};
use crate::audio::frame::AudioFormat;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Callback buffers held between the realtime thread and the worker
const CHUNK_QUEUE_DEPTH: usize = 8;

/// Shortest buffer we ask the platform for, in milliseconds
const MIN_BUFFER_MS: u32 = 10;

/// Device listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_ref() == Some(&name);
                devices.push(AudioDeviceInfo {
                    name,
                    is_input: true,
                    is_output: false,
                    is_default,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                } else {
                    devices.push(AudioDeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                    });
                }
            }
        }
    }

    devices
}

/// Audio backend for the platform's default cpal host
#[derive(Debug, Clone)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl CpalBackend {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            input_device: config.input_device.clone(),
            output_device: config.output_device.clone(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }

    fn find_device(&self, direction: Direction) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        let wanted = match direction {
            Direction::Input => self.input_device.as_deref(),
            Direction::Output => self.output_device.as_deref(),
        };

        let Some(name) = wanted else {
            let default = match direction {
                Direction::Input => host.default_input_device(),
                Direction::Output => host.default_output_device(),
            };
            return default.ok_or_else(|| {
                AudioError::DeviceNotFound(format!("no default {} device", direction))
            });
        };

        let devices = match direction {
            Direction::Input => host.input_devices(),
            Direction::Output => host.output_devices(),
        }
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                return Ok(device);
            }
        }
        Err(AudioError::DeviceNotFound(name.to_string()))
    }
}

/// Pick the device configuration closest to 16-bit mono at `format`
fn choose_config(
    device: &cpal::Device,
    direction: Direction,
    format: &AudioFormat,
) -> Result<SupportedStreamConfig, AudioError> {
    let ranges: Vec<SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|it| it.collect()),
        Direction::Output => device.supported_output_configs().map(|it| it.collect()),
    }
    .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    let rate = cpal::SampleRate(format.sample_rate);
    let mut candidates: Vec<SupportedStreamConfigRange> = ranges
        .into_iter()
        .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .filter(|r| matches!(r.sample_format(), SampleFormat::I16 | SampleFormat::F32))
        .collect();
    candidates.sort_by_key(|r| {
        (
            r.channels() != format.channels,
            r.sample_format() != SampleFormat::I16,
        )
    });

    candidates
        .into_iter()
        .next()
        .map(|r| r.with_sample_rate(rate))
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!(
                "{} device has no i16/f32 config at {} Hz",
                direction, format.sample_rate
            ))
        })
}

fn stream_config(
    supported: &SupportedStreamConfig,
    format: &AudioFormat,
    buffer_bytes: usize,
) -> StreamConfig {
    let mut config = supported.config();
    let frames = (buffer_bytes / format.bytes_per_frame()) as u32;
    config.buffer_size = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&frames) => {
            BufferSize::Fixed(frames)
        }
        _ => BufferSize::Default,
    };
    config
}

impl AudioBackend for CpalBackend {
    fn min_buffer_size(&self, direction: Direction, format: &AudioFormat) -> BufferSizeReport {
        let supported = match self
            .find_device(direction)
            .and_then(|device| choose_config(&device, direction, format))
        {
            Ok(supported) => supported,
            Err(e) => return BufferSizeReport::Error(e.to_string()),
        };

        match supported.buffer_size() {
            SupportedBufferSize::Range { min, max } => {
                let floor = format.sample_rate * MIN_BUFFER_MS / 1000;
                let frames = (*min).max(floor).min(*max);
                BufferSizeReport::Bytes(frames as usize * format.bytes_per_frame())
            }
            SupportedBufferSize::Unknown => BufferSizeReport::Unknown,
        }
    }

    fn open_input(
        &self,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn InputDevice>, AudioError> {
        let device = self.find_device(Direction::Input)?;
        let supported = choose_config(&device, Direction::Input, format)?;
        let config = stream_config(&supported, format, buffer_bytes);
        debug!(?config, sample_format = ?supported.sample_format(), "Opening microphone");

        let (tx, rx) = bounded(CHUNK_QUEUE_DEPTH);
        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_input::<i16>(&device, &config, tx)?,
            SampleFormat::F32 => build_input::<f32>(&device, &config, tx)?,
            other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        };

        Ok(Box::new(CpalInput {
            stream,
            chunks: rx,
            pending: Vec::new(),
            position: 0,
            timeout: self.read_timeout,
        }))
    }

    fn open_output(
        &self,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn OutputDevice>, AudioError> {
        let device = self.find_device(Direction::Output)?;
        let supported = choose_config(&device, Direction::Output, format)?;
        let config = stream_config(&supported, format, buffer_bytes);
        debug!(?config, sample_format = ?supported.sample_format(), "Opening speaker");

        let (tx, rx) = bounded(CHUNK_QUEUE_DEPTH);
        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_output::<i16>(&device, &config, rx)?,
            SampleFormat::F32 => build_output::<f32>(&device, &config, rx)?,
            other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        };

        Ok(Box::new(CpalOutput {
            stream,
            chunks: tx,
            timeout: self.write_timeout,
        }))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunks: Sender<Vec<i16>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| i16::from_sample(frame[0]))
                    .collect();
                if chunks.try_send(mono).is_err() {
                    trace!("Microphone reader behind, dropping callback buffer");
                }
            },
            |err| error!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunks: Receiver<Vec<i16>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = config.channels.max(1) as usize;
    let mut pending: Vec<i16> = Vec::new();
    let mut position = 0;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    if position >= pending.len() {
                        position = 0;
                        pending = chunks.try_recv().unwrap_or_default();
                    }
                    let value = match pending.get(position) {
                        Some(sample) => {
                            position += 1;
                            T::from_sample(*sample)
                        }
                        // Underrun: play silence
                        None => T::EQUILIBRIUM,
                    };
                    frame.fill(value);
                }
            },
            |err| error!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

struct CpalInput {
    stream: cpal::Stream,
    chunks: Receiver<Vec<i16>>,
    pending: Vec<i16>,
    position: usize,
    timeout: Duration,
}

impl InputDevice for CpalInput {
    fn start(&mut self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    /// Blocks until `buf` is full. A timeout with partial data returns what
    /// has arrived so far.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let wanted = buf.len() / 2;
        let mut filled = 0;

        while filled < wanted {
            if self.position >= self.pending.len() {
                match self.chunks.recv_timeout(self.timeout) {
                    Ok(chunk) => {
                        self.pending = chunk;
                        self.position = 0;
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) if filled > 0 => break,
                    Err(RecvTimeoutError::Timeout) => return Err(AudioError::Timeout),
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(AudioError::ReadFailed("input stream closed".into()))
                    }
                }
            }

            let n = (wanted - filled).min(self.pending.len() - self.position);
            let samples = &self.pending[self.position..self.position + n];
            for (i, sample) in samples.iter().enumerate() {
                let at = (filled + i) * 2;
                buf[at..at + 2].copy_from_slice(&sample.to_le_bytes());
            }
            filled += n;
            self.position += n;
        }

        Ok(filled * 2)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.stream
            .pause()
            .map_err(|e| AudioError::StopFailed(e.to_string()))
    }
}

struct CpalOutput {
    stream: cpal::Stream,
    chunks: Sender<Vec<i16>>,
    timeout: Duration,
}

impl OutputDevice for CpalOutput {
    fn start(&mut self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    /// Blocks while the device is still playing earlier chunks
    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        let samples: Vec<i16> = data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        match self.chunks.send_timeout(samples, self.timeout) {
            Ok(()) => Ok(data.len()),
            Err(SendTimeoutError::Timeout(_)) => Err(AudioError::Timeout),
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(AudioError::WriteFailed("output stream closed".into()))
            }
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.stream
            .pause()
            .map_err(|e| AudioError::StopFailed(e.to_string()))
    }
}
