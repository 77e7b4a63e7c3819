//! Call state machine
//!
//! A plain value: it decides what each transition means and leaves doing it
//! to the controller, so it can be tested without devices or a network.

use std::fmt;
use tracing::{debug, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallState {
    /// Nothing running; initial state and the state after teardown
    #[default]
    Unknown,
    /// Discovering and advertising, waiting for a peer
    Searching,
    /// Talking to exactly one peer
    Connected,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Unknown => "unknown",
            CallState::Searching => "searching",
            CallState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Resource side effect of entering a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ClearPeers,
    DisconnectPeers,
    StartDiscovery,
    StartAdvertising,
    StopDiscovery,
    StopAdvertising,
    StartCapture,
    StopPlayback,
    StopCapture,
    StopAllEndpoints,
}

/// How a front end should animate a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    Advance,
    Retreat,
}

/// Effects run on entering `state`, in order.
///
/// Playback is always stopped before capture.
pub fn effects_for(state: CallState) -> &'static [Effect] {
    match state {
        CallState::Searching => &[
            Effect::ClearPeers,
            Effect::DisconnectPeers,
            Effect::StopPlayback,
            Effect::StopCapture,
            Effect::StartDiscovery,
            Effect::StartAdvertising,
        ],
        CallState::Connected => &[
            Effect::StopDiscovery,
            Effect::StopAdvertising,
            Effect::StartCapture,
        ],
        CallState::Unknown => &[
            Effect::StopAllEndpoints,
            Effect::StopPlayback,
            Effect::StopCapture,
        ],
    }
}

/// Direction of the `from -> to` animation
pub fn presentation_for(from: CallState, to: CallState) -> Presentation {
    match (from, to) {
        (CallState::Unknown, _) => Presentation::Advance,
        (_, CallState::Unknown) => Presentation::Retreat,
        (CallState::Searching, CallState::Connected) => Presentation::Advance,
        _ => Presentation::Retreat,
    }
}

/// A committed state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
}

impl Transition {
    pub fn effects(&self) -> &'static [Effect] {
        effects_for(self.to)
    }

    pub fn presentation(&self) -> Presentation {
        presentation_for(self.from, self.to)
    }
}

/// Holds the current [`CallState`]
#[derive(Debug, Default)]
pub struct CallStateMachine {
    state: CallState,
    transitions: u64,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == CallState::Connected
    }

    /// Number of committed transitions
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Commit `new`. Returns `None`, with a warning, if already there.
    pub fn set_state(&mut self, new: CallState) -> Option<Transition> {
        if self.state == new {
            warn!("State set to {} but already in that state", new);
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: new,
        };
        self.state = new;
        self.transitions += 1;
        debug!("State set to {} (was {})", new, transition.from);
        Some(transition)
    }
}
