//! Call session: state machine and the controller that drives it

pub mod controller;
pub mod state;

pub use controller::{Endpoint, Session, SessionEvent, SessionHandle, TransitionHook};
pub use state::{CallState, CallStateMachine, Effect, Presentation, Transition};
