//! Audio device abstraction
//!
//! Engines talk to hardware through blocking read/write devices opened on
//! their own worker thread. Devices and effect handles are released when
//! dropped, so every exit path of a worker gives them back.

use std::fmt;

use crate::audio::frame::AudioFormat;
use crate::constants::MAX_DEVICE_BUFFER_BYTES;
use crate::error::AudioError;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// What the platform reports as the minimum usable buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferSizeReport {
    /// Minimum size in bytes
    Bytes(usize),
    /// The platform cannot tell; a configured fallback applies
    Unknown,
    /// The platform rejected the format
    Error(String),
}

/// Turn a platform report into a buffer size the engines can use.
///
/// Error reports and zero are rejected. Sizes are rounded up to whole
/// sample frames.
pub fn validate_buffer_size(
    report: BufferSizeReport,
    format: &AudioFormat,
    fallback: usize,
) -> Result<usize, AudioError> {
    let size = match report {
        BufferSizeReport::Bytes(0) => {
            return Err(AudioError::InvalidBufferSize("device reported 0 bytes".into()))
        }
        BufferSizeReport::Bytes(size) => size,
        BufferSizeReport::Unknown => fallback,
        BufferSizeReport::Error(reason) => return Err(AudioError::InvalidBufferSize(reason)),
    };

    if size > MAX_DEVICE_BUFFER_BYTES {
        return Err(AudioError::InvalidBufferSize(format!(
            "{} bytes exceeds limit of {}",
            size, MAX_DEVICE_BUFFER_BYTES
        )));
    }

    let align = format.bytes_per_frame();
    Ok(size.div_ceil(align) * align)
}

/// Platform audio effects that may be attached to a capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    NoiseSuppression,
    EchoCancellation,
}

/// An enabled effect. Released on drop.
pub trait AudioEffect {
    fn kind(&self) -> EffectKind;
}

/// A microphone opened for blocking reads
pub trait InputDevice {
    /// Begin delivering audio
    fn start(&mut self) -> Result<(), AudioError>;

    /// Read the next chunk into `buf`, returning the number of valid bytes
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    /// Stop delivering audio. The device is released when dropped.
    fn stop(&mut self) -> Result<(), AudioError>;
}

/// A speaker opened for blocking writes
pub trait OutputDevice {
    fn start(&mut self) -> Result<(), AudioError>;

    /// Write some of `data`, returning how many bytes were consumed
    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;
}

/// Source of audio devices.
///
/// Shared across threads; devices themselves stay on the thread that
/// opened them.
pub trait AudioBackend: Send + Sync {
    /// Minimum buffer the platform accepts for `format`
    fn min_buffer_size(&self, direction: Direction, format: &AudioFormat) -> BufferSizeReport;

    fn open_input(
        &self,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn InputDevice>, AudioError>;

    fn open_output(
        &self,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn OutputDevice>, AudioError>;

    /// Attach an effect to an open input device. `None` when the platform
    /// has no such effect.
    fn enable_effect(
        &self,
        _kind: EffectKind,
        _device: &dyn InputDevice,
    ) -> Option<Box<dyn AudioEffect>> {
        None
    }
}

/// Write all of `data`, retrying short writes
pub fn write_all(device: &mut dyn OutputDevice, mut data: &[u8]) -> Result<(), AudioError> {
    while !data.is_empty() {
        let written = device.write(data)?;
        if written == 0 {
            return Err(AudioError::WriteFailed("device accepted 0 bytes".into()));
        }
        data = &data[written.min(data.len())..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_error_report() {
        let format = AudioFormat::mono16(16_000);
        let err = validate_buffer_size(BufferSizeReport::Error("bad value".into()), &format, 1024)
            .unwrap_err();
        assert_eq!(err, AudioError::InvalidBufferSize("bad value".into()));
        assert!(validate_buffer_size(BufferSizeReport::Bytes(0), &format, 1024).is_err());
    }

    #[test]
    fn test_validate_rounds_to_samples() {
        let format = AudioFormat::mono16(16_000);
        assert_eq!(validate_buffer_size(BufferSizeReport::Bytes(641), &format, 1024), Ok(642));
        assert_eq!(validate_buffer_size(BufferSizeReport::Unknown, &format, 1024), Ok(1024));
        assert!(validate_buffer_size(
            BufferSizeReport::Bytes(MAX_DEVICE_BUFFER_BYTES + 2),
            &format,
            1024
        )
        .is_err());
    }

    struct Trickle {
        chunk: usize,
        written: Vec<u8>,
    }

    impl OutputDevice for Trickle {
        fn start(&mut self) -> Result<(), AudioError> {
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
            let n = data.len().min(self.chunk);
            self.written.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn stop(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    #[test]
    fn test_write_all_retries_short_writes() {
        let mut device = Trickle { chunk: 3, written: Vec::new() };
        write_all(&mut device, &[1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(device.written, vec![1, 2, 3, 4, 5, 6, 7]);
    }
}
