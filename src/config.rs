//! Session configuration
//!
//! Everything here is fixed for the lifetime of a session. Both peers must
//! agree on `audio.sample_rate` since frames carry no format header.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::audio::frame::AudioFormat;
use crate::constants::*;
use crate::error::Error;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

/// Device format and I/O settings shared by capture and playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Buffer size used when the backend reports no minimum
    pub fallback_buffer_bytes: usize,
    /// How long a device read may block before it counts as a transient error
    pub read_timeout_ms: u64,
    /// How long a device write may block before it counts as a transient error
    pub write_timeout_ms: u64,
    /// Microphone name; the host default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    /// Speaker name; the host default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            fallback_buffer_bytes: FALLBACK_BUFFER_BYTES,
            read_timeout_ms: DEFAULT_DEVICE_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_DEVICE_TIMEOUT_MS,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::mono16(self.sample_rate)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Microphone settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Enable platform noise suppression when available
    pub noise_suppression: bool,
    /// Enable platform echo cancellation when available
    pub echo_cancellation: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            noise_suppression: true,
            echo_cancellation: true,
        }
    }
}

/// Speaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Watermark: queue depth above which pending audio is dropped
    pub max_buffer_frames: usize,
    /// Inbound frames allowed to wait for the controller; later ones are dropped
    pub max_pending_frames: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_buffer_frames: MAX_BUFFER_SIZE,
            max_pending_frames: MAX_PENDING_INBOUND_FRAMES,
        }
    }
}

impl SessionConfig {
    /// Parse from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings no device could honour
    pub fn validate(&self) -> Result<(), Error> {
        if !(8_000..=192_000).contains(&self.audio.sample_rate) {
            return Err(Error::Config(format!(
                "sample_rate {} out of range 8000..=192000",
                self.audio.sample_rate
            )));
        }
        if self.audio.fallback_buffer_bytes < BYTES_PER_SAMPLE
            || self.audio.fallback_buffer_bytes > MAX_DEVICE_BUFFER_BYTES
        {
            return Err(Error::Config(format!(
                "fallback_buffer_bytes {} out of range {}..={}",
                self.audio.fallback_buffer_bytes, BYTES_PER_SAMPLE, MAX_DEVICE_BUFFER_BYTES
            )));
        }
        if self.playback.max_pending_frames == 0 {
            return Err(Error::Config("max_pending_frames must be non-zero".into()));
        }
        if self.audio.read_timeout_ms == 0 || self.audio.write_timeout_ms == 0 {
            return Err(Error::Config("device timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
