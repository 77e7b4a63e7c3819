//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod frame;
pub mod host;
pub mod playback;
pub mod priority;

#[cfg(test)]
pub(crate) mod mock;

pub use buffer::{Offer, PlaybackQueue, QueueStats};
pub use capture::{AudioCapture, CaptureSink};
pub use device::{AudioBackend, BufferSizeReport, Direction, EffectKind};
pub use frame::{AudioFormat, PcmFrame};
pub use host::{list_devices, AudioDeviceInfo, CpalBackend};
pub use playback::AudioPlayback;
