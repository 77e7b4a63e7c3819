//! PCM frames and the fixed session format

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::constants::{BYTES_PER_SAMPLE, CHANNELS};

/// Audio format of a session: signed 16-bit little-endian PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn mono16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: CHANNELS,
        }
    }

    /// Bytes per sample frame (all channels)
    pub fn bytes_per_frame(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels as usize
    }

    /// Playback duration of `len` bytes
    pub fn duration_of(&self, len: usize) -> Duration {
        let frames = (len / self.bytes_per_frame()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

/// One chunk of raw PCM audio.
///
/// Cheap to clone; the payload is shared and never mutated.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PcmFrame {
    data: Bytes,
}

impl PcmFrame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Copy a borrowed chunk, e.g. the capture worker's reusable buffer
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate the little-endian samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

impl From<Vec<u8>> for PcmFrame {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<Bytes> for PcmFrame {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl fmt::Debug for PcmFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmFrame").field("len", &self.data.len()).finish()
    }
}
