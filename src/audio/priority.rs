//! Scheduling priority for audio worker threads
//!
//! Elevation is best effort: unprivileged processes are often not allowed to
//! raise their priority, and that must never stop audio from flowing.

use crate::error::AudioError;

/// Priority class for an audio worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPriority {
    /// Capture threads
    Audio,
    /// Playback threads, where an underrun is immediately audible
    UrgentAudio,
}

impl AudioPriority {
    /// Linux nice value for this class
    #[cfg(target_os = "linux")]
    fn nice(self) -> libc::c_int {
        match self {
            AudioPriority::Audio => -16,
            AudioPriority::UrgentAudio => -19,
        }
    }
}

/// Raise the calling thread's scheduling priority
#[cfg(target_os = "linux")]
pub fn promote_current_thread(priority: AudioPriority) -> Result<(), AudioError> {
    // The nice value is per thread on Linux and `who == 0` targets the caller.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority.nice()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(AudioError::Priority(std::io::Error::last_os_error().to_string()))
    }
}

/// Raise the calling thread's scheduling priority
#[cfg(windows)]
pub fn promote_current_thread(priority: AudioPriority) -> Result<(), AudioError> {
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_HIGHEST,
        THREAD_PRIORITY_TIME_CRITICAL,
    };

    let level = match priority {
        AudioPriority::Audio => THREAD_PRIORITY_HIGHEST,
        AudioPriority::UrgentAudio => THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe { SetThreadPriority(GetCurrentThread(), level) }
        .map_err(|e| AudioError::Priority(e.to_string()))
}

/// Other platforms apply `setpriority` to the whole process, so the calling
/// thread is left alone.
#[cfg(not(any(target_os = "linux", windows)))]
pub fn promote_current_thread(_priority: AudioPriority) -> Result<(), AudioError> {
    Err(AudioError::Priority(
        "per-thread priority not supported on this platform".into(),
    ))
}

/// Promote the current thread, logging instead of failing
pub fn promote_or_warn(priority: AudioPriority) {
    match promote_current_thread(priority) {
        Ok(()) => tracing::debug!(?priority, "Audio thread priority raised"),
        Err(e) => tracing::warn!(?priority, "Running audio thread at normal priority: {}", e),
    }
}
