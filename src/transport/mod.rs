//! Transport boundary
//!
//! Discovery, connection setup and framing belong to the transport. The
//! session only tells it when to search, when to stop, and hands it
//! captured frames; inbound traffic comes back through a
//! [`SessionHandle`](crate::session::SessionHandle).

pub mod udp;

pub use udp::UdpTransport;

use crate::audio::frame::PcmFrame;
use crate::error::TransportError;

/// What the session needs from a transport
pub trait Transport: Send + Sync {
    /// Send one captured chunk to the connected peer
    fn send(&self, frame: PcmFrame) -> Result<(), TransportError>;

    fn start_discovery(&self) -> Result<(), TransportError>;

    fn stop_discovery(&self);

    fn start_advertising(&self) -> Result<(), TransportError>;

    fn stop_advertising(&self);

    /// Drop the current peer connection, if any
    fn disconnect_from_all_endpoints(&self);

    /// Drop connections and stop discovery and advertising
    fn stop_all_endpoints(&self);
}
