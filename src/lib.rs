//! # LAN Voice Relay
//!
//! Low-latency full-duplex voice between two peers on a local network.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── LOCAL PEER ─────────────────────────────────┐
//! │                                                                             │
//! │   ┌────────────┐   gates    ┌─────────────────────────────────────────┐     │
//! │   │  Session   │──────────▶│  CallStateMachine                       │     │
//! │   │ (control   │           │  Unknown ─▶ Searching ─▶ Connected      │     │
//! │   │  thread)   │◀──────────│  transition plan: effects + direction   │     │
//! │   └─────┬──────┘            └─────────────────────────────────────────┘     │
//! │         │ start/stop                                                        │
//! │   ┌─────┴──────────────┐                     ┌──────────────────────────┐   │
//! │   │  AudioCapture      │                     │  AudioPlayback           │   │
//! │   │  ┌──────────────┐  │                     │  ┌────────────────────┐  │   │
//! │   │  │ Mic worker   │  │                     │  │ PlaybackQueue      │  │   │
//! │   │  │ read ▶ mute  │  │                     │  │ (anti-lag clear)   │  │   │
//! │   │  └──────┬───────┘  │                     │  └─────────┬──────────┘  │   │
//! │   └─────────┼──────────┘                     │  ┌─────────▼──────────┐  │   │
//! │             │ PcmFrame                       │  │ Speaker worker     │  │   │
//! │             ▼                                │  └────────────────────┘  │   │
//! │   ┌──────────────────────────────────────────┴──────────────────────────┐   │
//! │   │                Transport (send / on_receive / lifecycle)           │   │
//! │   └──────────────────────────────────┬──────────────────────────────────┘   │
//! └──────────────────────────────────────┼──────────────────────────────────────┘
//!                                        │ LAN
//!                                        ▼
//!                                   REMOTE PEER
//! ```
//!
//! Audio is raw 16-bit signed little-endian mono PCM. There is no codec, no
//! sequence numbering and no mixing: exactly one peer at a time.

pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for capture and playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Channel count (mono)
    pub const CHANNELS: u16 = 1;

    /// Bytes per 16-bit sample
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Queue depth above which the playback queue is flushed
    pub const MAX_BUFFER_SIZE: usize = 15;

    /// Inbound frames that may wait for the session controller
    pub const MAX_PENDING_INBOUND_FRAMES: usize = 64;

    /// Device buffer size used when the platform cannot report one
    pub const FALLBACK_BUFFER_BYTES: usize = 1024;

    /// Upper bound accepted for a device buffer
    pub const MAX_DEVICE_BUFFER_BYTES: usize = 64 * 1024;

    /// Default blocking timeout for device reads and writes, in milliseconds
    pub const DEFAULT_DEVICE_TIMEOUT_MS: u64 = 100;

    /// Default UDP port for the demo transport
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers
}
