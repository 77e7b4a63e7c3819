//! Point-to-point UDP transport
//!
//! A minimal stand-in for a proximity transport: one configured peer
//! address, a `HELLO` beacon while searching, `BYE` on disconnect, and raw
//! PCM chunks in `AUDIO` packets.
//!
//! Packet layout is a one-byte tag followed by the payload:
//!
//! ```text
//! 0x01 AUDIO  <pcm bytes>
//! 0x02 HELLO  <utf-8 display name>
//! 0x03 BYE
//! ```

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::audio::frame::PcmFrame;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::TransportError;
use crate::session::{Endpoint, SessionHandle};
use crate::transport::Transport;

const TAG_AUDIO: u8 = 0x01;
const TAG_HELLO: u8 = 0x02;
const TAG_BYE: u8 = 0x03;

/// Largest whole-sample audio payload that fits one packet
const MAX_AUDIO_PAYLOAD: usize = (MAX_PACKET_SIZE - 1) & !1;

/// Interval between `HELLO` beacons while searching
const BEACON_INTERVAL: Duration = Duration::from_millis(500);

/// Receive timeout, which also paces beacons and shutdown checks
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const RECV_BUFFER_BYTES: usize = 256 * 1024;

/// Decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Audio(&'a [u8]),
    Hello(&'a str),
    Bye,
}

impl<'a> Packet<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, TransportError> {
        let (&tag, payload) = data.split_first().ok_or(TransportError::InvalidPacket)?;
        match tag {
            TAG_AUDIO => Ok(Packet::Audio(payload)),
            TAG_HELLO => std::str::from_utf8(payload)
                .map(Packet::Hello)
                .map_err(|_| TransportError::InvalidPacket),
            TAG_BYE if payload.is_empty() => Ok(Packet::Bye),
            _ => Err(TransportError::InvalidPacket),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        match self {
            Packet::Audio(pcm) => {
                out.push(TAG_AUDIO);
                out.extend_from_slice(pcm);
            }
            Packet::Hello(name) => {
                out.push(TAG_HELLO);
                out.extend_from_slice(name.as_bytes());
            }
            Packet::Bye => out.push(TAG_BYE),
        }
    }
}

/// UDP transport for a single known peer
pub struct UdpTransport {
    socket: UdpSocket,
    /// Where beacons go
    peer: SocketAddr,
    /// Sent in `HELLO`
    name: String,
    /// The connected endpoint, if any
    remote: Mutex<Option<(SocketAddr, Endpoint)>>,
    discovering: AtomicBool,
    advertising: AtomicBool,
    running: AtomicBool,
}

impl UdpTransport {
    /// Bind `local` and target beacons at `peer`
    pub fn bind(
        local: SocketAddr,
        peer: SocketAddr,
        name: impl Into<String>,
    ) -> Result<Arc<Self>, TransportError> {
        let domain = if local.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
            debug!("Could not enlarge receive buffer: {}", e);
        }
        socket
            .bind(&local.into())
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", local, e)))?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        info!("UDP transport bound to {}, peer {}", socket.local_addr()?, peer);
        Ok(Arc::new(Self {
            socket,
            peer,
            name: name.into(),
            remote: Mutex::new(None),
            discovering: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.remote.lock().is_some()
    }

    fn is_searching(&self) -> bool {
        self.discovering.load(Ordering::Acquire) || self.advertising.load(Ordering::Acquire)
    }

    /// Start the receive thread, reporting to `session`
    pub fn spawn(self: &Arc<Self>, session: SessionHandle) -> io::Result<JoinHandle<()>> {
        self.running.store(true, Ordering::Release);
        let transport = self.clone();
        thread::Builder::new()
            .name("voice-transport".into())
            .spawn(move || transport.run(session))
    }

    /// Stop the receive thread. It exits within one poll interval.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn send_packet(&self, packet: &Packet<'_>, to: SocketAddr) -> io::Result<()> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        packet.encode(&mut buf);
        self.socket.send_to(&buf, to).map(|_| ())
    }

    fn run(&self, session: SessionHandle) {
        info!("Transport receive thread started");
        let mut buf = vec![0u8; 64 * 1024];
        let mut last_beacon: Option<Instant> = None;

        while self.running.load(Ordering::Acquire) {
            if self.is_searching()
                && !self.is_connected()
                && last_beacon.map_or(true, |at| at.elapsed() >= BEACON_INTERVAL)
            {
                if let Err(e) = self.send_packet(&Packet::Hello(&self.name), self.peer) {
                    debug!("Beacon to {} failed: {}", self.peer, e);
                }
                last_beacon = Some(Instant::now());
            }

            match self.socket.recv_from(&mut buf) {
                Ok((size, from)) => self.handle_packet(&buf[..size], from, &session),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    // ICMP unreachable for a beacon
                    if self.is_searching() && !self.is_connected() {
                        session.on_connection_failed(Endpoint::new(
                            self.peer.to_string(),
                            self.peer.to_string(),
                        ));
                    }
                }
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }

        if let Some((addr, _)) = self.remote.lock().take() {
            let _ = self.send_packet(&Packet::Bye, addr);
        }
        info!("Transport receive thread stopped");
    }

    /// Make `from` the connected peer unless one is already set
    fn adopt(&self, from: SocketAddr, name: &str) -> Option<Endpoint> {
        let mut remote = self.remote.lock();
        if remote.is_some() {
            return None;
        }
        let endpoint = Endpoint::new(from.to_string(), name);
        *remote = Some((from, endpoint.clone()));
        Some(endpoint)
    }

    fn handle_packet(&self, data: &[u8], from: SocketAddr, session: &SessionHandle) {
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping {} byte packet from {}: {}", data.len(), from, e);
                return;
            }
        };

        match packet {
            Packet::Audio(pcm) => {
                trace!("{} audio bytes from {}", pcm.len(), from);
                if self.is_searching() {
                    // HELLO was lost; the talking peer is the one to answer
                    if let Some(endpoint) = self.adopt(from, &from.to_string()) {
                        info!("Audio from {} before HELLO, adopting it as peer", from);
                        session.on_endpoint_connected(endpoint);
                    }
                }
                session.on_receive(PcmFrame::copy_from_slice(pcm));
            }
            Packet::Hello(name) => {
                if !self.is_searching() {
                    trace!("Ignoring HELLO from {} while not searching", from);
                    return;
                }
                let Some(endpoint) = self.adopt(from, name) else {
                    return;
                };
                // Answer so the other side connects even if it missed our beacon
                if let Err(e) = self.send_packet(&Packet::Hello(&self.name), from) {
                    debug!("HELLO reply to {} failed: {}", from, e);
                }
                session.on_endpoint_connected(endpoint);
            }
            Packet::Bye => {
                let endpoint = {
                    let mut remote = self.remote.lock();
                    match remote.as_ref() {
                        Some((addr, _)) if *addr == from => remote.take().map(|(_, ep)| ep),
                        _ => None,
                    }
                };
                if let Some(endpoint) = endpoint {
                    session.on_endpoint_disconnected(endpoint);
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, frame: PcmFrame) -> Result<(), TransportError> {
        let to = match self.remote.lock().as_ref() {
            Some((addr, _)) => *addr,
            None => return Err(TransportError::NotConnected),
        };

        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        for chunk in frame.as_bytes().chunks(MAX_AUDIO_PAYLOAD) {
            Packet::Audio(chunk).encode(&mut buf);
            self.socket
                .send_to(&buf, to)
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn start_discovery(&self) -> Result<(), TransportError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.discovering.store(true, Ordering::Release);
        debug!("Discovery started");
        Ok(())
    }

    fn stop_discovery(&self) {
        self.discovering.store(false, Ordering::Release);
        debug!("Discovery stopped");
    }

    fn start_advertising(&self) -> Result<(), TransportError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.advertising.store(true, Ordering::Release);
        debug!("Advertising as {}", self.name);
        Ok(())
    }

    fn stop_advertising(&self) {
        self.advertising.store(false, Ordering::Release);
        debug!("Advertising stopped");
    }

    fn disconnect_from_all_endpoints(&self) {
        if let Some((addr, endpoint)) = self.remote.lock().take() {
            info!("Disconnecting from {} ({})", endpoint.name, addr);
            if let Err(e) = self.send_packet(&Packet::Bye, addr) {
                debug!("BYE to {} failed: {}", addr, e);
            }
        }
    }

    fn stop_all_endpoints(&self) {
        self.disconnect_from_all_endpoints();
        self.stop_discovery();
        self.stop_advertising();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
