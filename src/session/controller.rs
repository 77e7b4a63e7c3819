//! Session controller
//!
//! Owns the call state machine and both audio engines, and turns transport
//! notifications into state transitions. All methods run on one controller
//! thread; other threads talk to it through a [`SessionHandle`].

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::audio::buffer::QueueStats;
use crate::audio::capture::{AudioCapture, CaptureSink};
use crate::audio::device::AudioBackend;
use crate::audio::frame::PcmFrame;
use crate::audio::playback::AudioPlayback;
use crate::config::SessionConfig;
use crate::session::state::{CallState, CallStateMachine, Effect, Transition};
use crate::transport::Transport;

/// A remote peer as identified by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Work posted to the controller thread
#[derive(Debug)]
pub enum SessionEvent {
    /// Inbound audio chunk
    Received(PcmFrame),
    EndpointConnected(Endpoint),
    EndpointDisconnected(Endpoint),
    ConnectionFailed(Endpoint),
    /// A playback worker exited; carries its generation
    PlaybackFinished(u64),
    SetMuted(bool),
    /// Begin searching for a peer
    Start,
    /// Tear everything down, staying ready to start again
    Stop,
    /// Tear down and leave [`Session::run`]
    Shutdown,
}

/// Inbound frames posted but not yet handled by the controller
#[derive(Debug)]
struct InboundBacklog {
    pending: AtomicUsize,
    limit: usize,
    dropped: AtomicU64,
}

impl InboundBacklog {
    fn new(limit: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            limit,
            dropped: AtomicU64::new(0),
        }
    }

    fn try_reserve(&self) -> bool {
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        reserved
    }

    fn release(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Cloneable sender for [`SessionEvent`]s
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: Sender<SessionEvent>,
    inbound: Arc<InboundBacklog>,
}

impl SessionHandle {
    /// Post an event. Returns false once the session is gone.
    pub fn post(&self, event: SessionEvent) -> bool {
        match self.events.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Session gone, dropping {:?}", e.into_inner());
                false
            }
        }
    }

    /// Post inbound audio. Returns false if the frame was dropped, either
    /// because the controller is `playback.max_pending_frames` behind or
    /// because the session is gone.
    pub fn on_receive(&self, data: impl Into<PcmFrame>) -> bool {
        if !self.inbound.try_reserve() {
            trace!("Session controller behind, dropping inbound frame");
            return false;
        }
        if self.post(SessionEvent::Received(data.into())) {
            true
        } else {
            self.inbound.release();
            false
        }
    }

    pub fn on_endpoint_connected(&self, endpoint: Endpoint) -> bool {
        self.post(SessionEvent::EndpointConnected(endpoint))
    }

    pub fn on_endpoint_disconnected(&self, endpoint: Endpoint) -> bool {
        self.post(SessionEvent::EndpointDisconnected(endpoint))
    }

    pub fn on_connection_failed(&self, endpoint: Endpoint) -> bool {
        self.post(SessionEvent::ConnectionFailed(endpoint))
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        self.post(SessionEvent::SetMuted(muted))
    }

    pub fn start(&self) -> bool {
        self.post(SessionEvent::Start)
    }

    pub fn stop(&self) -> bool {
        self.post(SessionEvent::Stop)
    }

    pub fn shutdown(&self) -> bool {
        self.post(SessionEvent::Shutdown)
    }
}

/// Called after every committed transition, e.g. to animate a state display
pub type TransitionHook = Box<dyn FnMut(&Transition) + Send>;

/// One voice session with at most one peer
pub struct Session {
    machine: CallStateMachine,
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,

    capture: Option<AudioCapture>,
    playback: Option<AudioPlayback>,
    /// Generation of the current playback engine
    playback_generation: u64,
    /// Set when the speaker failed to open; cleared on the next connect
    playback_failed: bool,

    peers: Vec<Endpoint>,
    muted: bool,

    /// Capture may hand frames to the transport only while set
    outbound_open: Arc<AtomicBool>,

    on_transition: Option<TransitionHook>,
    inbound: Arc<InboundBacklog>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        let inbound = Arc::new(InboundBacklog::new(config.playback.max_pending_frames));
        Self {
            machine: CallStateMachine::new(),
            config,
            backend,
            transport,
            capture: None,
            playback: None,
            playback_generation: 0,
            playback_failed: false,
            peers: Vec::new(),
            muted: false,
            outbound_open: Arc::new(AtomicBool::new(false)),
            on_transition: None,
            inbound,
            events_tx,
            events_rx,
        }
    }

    /// Handle for transports and front ends on other threads
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            events: self.events_tx.clone(),
            inbound: self.inbound.clone(),
        }
    }

    pub fn on_transition(&mut self, hook: impl FnMut(&Transition) + Send + 'static) {
        self.on_transition = Some(Box::new(hook));
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn peers(&self) -> &[Endpoint] {
        &self.peers
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_recording(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.is_recording())
    }

    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(|p| p.is_playing())
    }

    pub fn playback_stats(&self) -> Option<QueueStats> {
        self.playback.as_ref().map(|p| p.stats())
    }

    /// Inbound frames refused because the controller had fallen behind
    pub fn inbound_dropped(&self) -> u64 {
        self.inbound.dropped.load(Ordering::Relaxed)
    }

    /// Begin looking for a peer
    pub fn start(&mut self) {
        self.set_state(CallState::Searching);
    }

    /// Local teardown: stop playback, then capture, then drop the transport
    pub fn stop(&mut self) {
        self.stop_playing();
        self.stop_recording();
        self.set_state(CallState::Unknown);
    }

    /// Commit `new` and run its effects. Returns false if nothing changed.
    pub fn set_state(&mut self, new: CallState) -> bool {
        if self.state() == CallState::Connected && new != CallState::Connected {
            // No send may complete once the state has left Connected
            self.outbound_open.store(false, Ordering::Release);
            self.stop_playing();
            self.stop_recording();
        }

        let Some(transition) = self.machine.set_state(new) else {
            return false;
        };
        info!("Session {} -> {}", transition.from, transition.to);

        if transition.to == CallState::Connected {
            self.playback_failed = false;
        }

        for effect in transition.effects() {
            self.apply(*effect);
        }

        if let Some(hook) = self.on_transition.as_mut() {
            hook(&transition);
        }
        true
    }

    fn apply(&mut self, effect: Effect) {
        trace!(?effect, "Applying session effect");
        match effect {
            Effect::ClearPeers => self.peers.clear(),
            Effect::DisconnectPeers => self.transport.disconnect_from_all_endpoints(),
            Effect::StartDiscovery => {
                if let Err(e) = self.transport.start_discovery() {
                    warn!("Failed to start discovery: {}", e);
                }
            }
            Effect::StartAdvertising => {
                if let Err(e) = self.transport.start_advertising() {
                    warn!("Failed to start advertising: {}", e);
                }
            }
            Effect::StopDiscovery => self.transport.stop_discovery(),
            Effect::StopAdvertising => self.transport.stop_advertising(),
            Effect::StartCapture => self.start_recording(),
            Effect::StopPlayback => self.stop_playing(),
            Effect::StopCapture => self.stop_recording(),
            Effect::StopAllEndpoints => self.transport.stop_all_endpoints(),
        }
    }

    /// Inbound audio from the peer.
    ///
    /// Audio arriving while still searching means the connect notification
    /// was missed or is late, so the session is promoted first.
    pub fn on_receive(&mut self, frame: PcmFrame) {
        match self.state() {
            CallState::Unknown => {
                trace!("Dropping {} inbound bytes while idle", frame.len());
                return;
            }
            CallState::Searching => {
                info!("Audio arrived before connect notification");
                self.set_state(CallState::Connected);
            }
            CallState::Connected => {}
        }

        if !self.is_playing() && !self.start_playing() {
            return;
        }
        if let Some(playback) = &self.playback {
            playback.add_audio_data(frame);
        }
    }

    pub fn on_endpoint_connected(&mut self, endpoint: Endpoint) {
        info!("Connected to {} ({})", endpoint.name, endpoint.id);
        if !self.peers.contains(&endpoint) {
            self.peers.push(endpoint);
        }
        self.set_state(CallState::Connected);
    }

    pub fn on_endpoint_disconnected(&mut self, endpoint: Endpoint) {
        info!("Disconnected from {} ({})", endpoint.name, endpoint.id);
        self.peers.retain(|peer| peer.id != endpoint.id);
        self.stop_playing();
        self.stop_recording();

        if self.state() == CallState::Unknown {
            debug!("Ignoring disconnect after teardown");
            return;
        }
        self.set_state(CallState::Searching);
    }

    /// Try someone else
    pub fn on_connection_failed(&mut self, endpoint: Endpoint) {
        warn!("Connection to {} ({}) failed", endpoint.name, endpoint.id);
        if self.state() == CallState::Searching {
            if let Err(e) = self.transport.start_discovery() {
                warn!("Failed to restart discovery: {}", e);
            }
        }
    }

    /// Silence outgoing audio. Kept across capture restarts.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(capture) = &self.capture {
            capture.set_muted(muted);
        }
        info!(muted, "Microphone mute changed");
    }

    fn on_playback_finished(&mut self, generation: u64) {
        if generation != self.playback_generation || self.is_playing() {
            return;
        }
        if self.playback.take().is_some() {
            debug!(generation, "Released finished playback engine");
        }
    }

    fn start_recording(&mut self) {
        if self.is_recording() {
            warn!("Already recording");
            return;
        }

        let transport = self.transport.clone();
        let outbound = self.outbound_open.clone();
        let sink = CaptureSink::callback(move |chunk| {
            if !outbound.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = transport.send(PcmFrame::copy_from_slice(chunk)) {
                debug!("Outbound send failed: {}", e);
            }
        });

        let mut capture = AudioCapture::new(self.backend.clone(), &self.config, sink);
        capture.set_muted(self.muted);
        self.outbound_open.store(true, Ordering::Release);

        match capture.start() {
            Ok(()) => self.capture = Some(capture),
            Err(e) => {
                self.outbound_open.store(false, Ordering::Release);
                warn!("Microphone unavailable, session continues receive-only: {}", e);
            }
        }
    }

    fn stop_recording(&mut self) {
        self.outbound_open.store(false, Ordering::Release);
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }

    fn start_playing(&mut self) -> bool {
        if self.playback_failed {
            trace!("Speaker unavailable this session, dropping inbound audio");
            return false;
        }
        // A finished engine is single-use
        self.stop_playing();

        self.playback_generation += 1;
        let generation = self.playback_generation;
        let handle = self.handle();
        let mut playback = AudioPlayback::new(self.backend.clone(), &self.config, move || {
            handle.post(SessionEvent::PlaybackFinished(generation));
        });

        match playback.start() {
            Ok(()) => {
                self.playback = Some(playback);
                true
            }
            Err(e) => {
                warn!("Speaker unavailable, session continues send-only: {}", e);
                self.playback_failed = true;
                false
            }
        }
    }

    fn stop_playing(&mut self) {
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
    }

    /// Handle one event. Returns false on [`SessionEvent::Shutdown`].
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Received(frame) => {
                self.inbound.release();
                self.on_receive(frame)
            }
            SessionEvent::EndpointConnected(endpoint) => self.on_endpoint_connected(endpoint),
            SessionEvent::EndpointDisconnected(endpoint) => {
                self.on_endpoint_disconnected(endpoint)
            }
            SessionEvent::ConnectionFailed(endpoint) => self.on_connection_failed(endpoint),
            SessionEvent::PlaybackFinished(generation) => self.on_playback_finished(generation),
            SessionEvent::SetMuted(muted) => self.set_muted(muted),
            SessionEvent::Start => self.start(),
            SessionEvent::Stop => self.stop(),
            SessionEvent::Shutdown => {
                self.stop();
                return false;
            }
        }
        true
    }

    /// Handle everything already posted without waiting. Returns false if a
    /// shutdown was among them.
    pub fn process_pending(&mut self) -> bool {
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    if !self.handle_event(event) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Block handling events until shut down
    pub fn run(mut self) {
        info!("Session controller running");
        while let Ok(event) = self.events_rx.recv() {
            if !self.handle_event(event) {
                break;
            }
        }
        info!("Session controller stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() != CallState::Unknown {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::BufferSizeReport;
    use crate::audio::mock::{wait_until, MockBackend};
    use crate::error::TransportError;
    use crate::session::state::Presentation;
    use parking_lot::Mutex;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        StartDiscovery,
        StopDiscovery,
        StartAdvertising,
        StopAdvertising,
        DisconnectAll,
        StopAll,
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        sent: Mutex<Vec<PcmFrame>>,
        /// Frames sent when the last disconnect arrived
        sent_at_disconnect: Mutex<Option<usize>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn clear(&self) {
            self.calls.lock().clear();
        }

        fn sent(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, frame: PcmFrame) -> Result<(), TransportError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        fn start_discovery(&self) -> Result<(), TransportError> {
            self.calls.lock().push(Call::StartDiscovery);
            Ok(())
        }

        fn stop_discovery(&self) {
            self.calls.lock().push(Call::StopDiscovery);
        }

        fn start_advertising(&self) -> Result<(), TransportError> {
            self.calls.lock().push(Call::StartAdvertising);
            Ok(())
        }

        fn stop_advertising(&self) {
            self.calls.lock().push(Call::StopAdvertising);
        }

        fn disconnect_from_all_endpoints(&self) {
            *self.sent_at_disconnect.lock() = Some(self.sent());
            self.calls.lock().push(Call::DisconnectAll);
        }

        fn stop_all_endpoints(&self) {
            self.calls.lock().push(Call::StopAll);
        }
    }

    fn session() -> (Session, MockBackend, Arc<RecordingTransport>) {
        let backend = MockBackend::new();
        let transport = Arc::new(RecordingTransport::default());
        let session = Session::new(
            SessionConfig::default(),
            Arc::new(backend.clone()),
            transport.clone(),
        );
        (session, backend, transport)
    }

    fn peer() -> Endpoint {
        Endpoint::new("ep-1", "40213")
    }

    #[test]
    fn test_state_transition_scenario() {
        let (mut session, backend, transport) = session();

        session.start();
        assert_eq!(session.state(), CallState::Searching);
        assert_eq!(
            transport.calls(),
            vec![Call::DisconnectAll, Call::StartDiscovery, Call::StartAdvertising]
        );
        assert!(!session.is_recording());
        assert!(!session.is_playing());

        transport.clear();
        session.on_endpoint_connected(peer());
        assert_eq!(session.state(), CallState::Connected);
        assert_eq!(transport.calls(), vec![Call::StopDiscovery, Call::StopAdvertising]);
        assert!(session.is_recording());
        assert_eq!(session.peers(), &[peer()]);

        transport.clear();
        assert!(session.set_state(CallState::Searching));
        assert_eq!(
            transport.calls(),
            vec![Call::DisconnectAll, Call::StartDiscovery, Call::StartAdvertising]
        );
        assert!(!session.is_recording());
        assert!(session.peers().is_empty());
        assert_eq!(backend.state.inputs_live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_captured_audio_is_sent_only_while_connected() {
        let (mut session, _backend, transport) = session();
        session.start();
        session.on_endpoint_connected(peer());

        assert!(wait_until(WAIT, || transport.sent() >= 3));
        session.set_state(CallState::Searching);
        let sent = transport.sent();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.sent(), sent);
    }

    #[test]
    fn test_inbound_audio_promotes_searching_once() {
        let (mut session, backend, _transport) = session();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        {
            let transitions = transitions.clone();
            session.on_transition(move |t| transitions.lock().push(*t));
        }
        session.start();

        session.on_receive(PcmFrame::from(vec![7; 100]));
        session.on_receive(PcmFrame::from(vec![8; 100]));

        let seen = transitions.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].from, CallState::Searching);
        assert_eq!(seen[1].to, CallState::Connected);
        assert_eq!(seen[1].presentation(), Presentation::Advance);
        assert_eq!(session.state(), CallState::Connected);

        assert!(session.is_playing());
        assert!(wait_until(WAIT, || backend.state.written_frames().len() == 2));
        let tags: Vec<u8> = backend.state.written_frames().iter().map(|f| f[0]).collect();
        assert_eq!(tags, vec![7, 8]);
    }

    #[test]
    fn test_inbound_audio_ignored_when_idle() {
        let (mut session, backend, _transport) = session();
        session.on_receive(PcmFrame::from(vec![1; 10]));
        assert_eq!(session.state(), CallState::Unknown);
        assert_eq!(backend.state.output_opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remote_disconnect_stops_engines() {
        let (mut session, backend, _transport) = session();
        session.start();
        session.on_endpoint_connected(peer());
        session.on_receive(PcmFrame::from(vec![1; 10]));
        assert!(session.is_playing());
        assert!(session.is_recording());

        session.on_endpoint_disconnected(peer());
        assert_eq!(session.state(), CallState::Searching);
        assert!(!session.is_playing());
        assert!(!session.is_recording());
        assert_eq!(backend.state.inputs_live.load(Ordering::SeqCst), 0);
        assert_eq!(backend.state.outputs_live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_teardown_returns_to_unknown() {
        let (mut session, backend, transport) = session();
        session.start();
        session.on_endpoint_connected(peer());
        session.on_receive(PcmFrame::from(vec![1; 10]));

        transport.clear();
        session.stop();
        assert_eq!(session.state(), CallState::Unknown);
        assert_eq!(transport.calls(), vec![Call::StopAll]);
        assert_eq!(backend.state.inputs_live.load(Ordering::SeqCst), 0);
        assert_eq!(backend.state.outputs_live.load(Ordering::SeqCst), 0);

        // Late disconnect after teardown does not restart discovery
        transport.clear();
        session.on_endpoint_disconnected(peer());
        assert_eq!(session.state(), CallState::Unknown);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_connection_failed_retries_discovery_while_searching() {
        let (mut session, _backend, transport) = session();
        session.on_connection_failed(peer());
        assert!(transport.calls().is_empty());

        session.start();
        transport.clear();
        session.on_connection_failed(peer());
        assert_eq!(transport.calls(), vec![Call::StartDiscovery]);
    }

    #[test]
    fn test_mute_carries_into_new_capture() {
        let (mut session, _backend, transport) = session();
        session.set_muted(true);
        session.start();
        session.on_endpoint_connected(peer());

        assert!(wait_until(WAIT, || transport.sent() >= 3));
        assert!(transport
            .sent
            .lock()
            .iter()
            .all(|f| f.as_bytes().iter().all(|&b| b == 0)));

        session.set_muted(false);
        let seen = transport.sent();
        assert!(wait_until(WAIT, || transport.sent() >= seen + 3));
        let last = transport.sent.lock().last().cloned().unwrap();
        assert!(last.as_bytes().iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_microphone_failure_keeps_session() {
        let (mut session, backend, _transport) = session();
        backend.state.fail_open_input.store(true, Ordering::SeqCst);
        session.start();
        session.on_endpoint_connected(peer());

        assert_eq!(session.state(), CallState::Connected);
        assert!(!session.is_recording());

        session.on_receive(PcmFrame::from(vec![2; 10]));
        assert!(session.is_playing());
    }

    #[test]
    fn test_speaker_failure_is_not_retried_per_frame() {
        let (mut session, backend, _transport) = session();
        *backend.state.output_report.lock() = BufferSizeReport::Error("bad".into());
        session.start();
        session.on_endpoint_connected(peer());

        for _ in 0..5 {
            session.on_receive(PcmFrame::from(vec![2; 10]));
        }
        assert!(!session.is_playing());
        assert_eq!(session.state(), CallState::Connected);
        assert!(session.is_recording());
    }

    #[test]
    fn test_events_through_handle() {
        let (mut session, backend, transport) = session();
        let handle = session.handle();

        handle.start();
        handle.on_endpoint_connected(peer());
        handle.set_muted(true);
        handle.on_receive(vec![5u8; 40]);
        assert!(session.process_pending());

        assert_eq!(session.state(), CallState::Connected);
        assert!(session.is_muted());
        assert!(wait_until(WAIT, || backend.state.written_frames().len() == 1));

        handle.on_endpoint_disconnected(peer());
        handle.shutdown();
        assert!(!session.process_pending());
        assert_eq!(session.state(), CallState::Unknown);
        assert!(transport.calls().contains(&Call::StopAll));
    }

    #[test]
    fn test_run_on_controller_thread() {
        let (session, backend, _transport) = session();
        let handle = session.handle();
        let controller = std::thread::spawn(move || session.run());

        handle.start();
        handle.on_receive(vec![9u8; 20]);
        assert!(wait_until(WAIT, || backend.state.written_frames().len() == 1));

        handle.shutdown();
        controller.join().unwrap();
        assert_eq!(backend.state.outputs_live.load(Ordering::SeqCst), 0);
        assert_eq!(backend.state.inputs_live.load(Ordering::SeqCst), 0);
        assert!(!handle.start());
    }

    #[test]
    fn test_nothing_sent_after_leaving_connected() {
        let (mut session, _backend, transport) = session();
        for _ in 0..20 {
            session.start();
            session.on_endpoint_connected(peer());
            assert!(wait_until(WAIT, || transport.sent() > 0));

            session.set_state(CallState::Searching);
            let at_disconnect = transport.sent_at_disconnect.lock().take().unwrap();
            assert_eq!(transport.sent(), at_disconnect);
            std::thread::sleep(Duration::from_millis(5));
            assert_eq!(transport.sent(), at_disconnect);

            session.stop();
            transport.sent.lock().clear();
        }
    }

    #[test]
    fn test_transition_hook_runs_after_effects() {
        let (mut session, backend, _transport) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            let state = backend.state.clone();
            session.on_transition(move |t| {
                seen.lock()
                    .push((t.to, state.inputs_live.load(Ordering::SeqCst)));
            });
        }

        session.start();
        session.on_endpoint_connected(peer());
        session.set_state(CallState::Searching);

        assert_eq!(
            seen.lock().clone(),
            vec![
                (CallState::Searching, 0),
                (CallState::Connected, 1),
                (CallState::Searching, 0),
            ]
        );
    }

    #[test]
    fn test_inbound_burst_is_bounded_while_controller_busy() {
        let (mut session, backend, _transport) = session();
        let limit = SessionConfig::default().playback.max_pending_frames;
        let handle = session.handle();
        handle.start();

        let accepted = (0..10_000)
            .filter(|_| handle.on_receive(vec![0u8; 640]))
            .count();
        assert_eq!(accepted, limit);
        assert_eq!(session.events_rx.len(), limit + 1);
        assert_eq!(session.inbound_dropped(), (10_000 - limit) as u64);

        // Draining frees the backlog for new audio
        assert!(session.process_pending());
        assert_eq!(session.state(), CallState::Connected);
        assert!(handle.on_receive(vec![1u8; 640]));
        assert!(session.process_pending());
        assert!(wait_until(WAIT, || backend
            .state
            .written_frames()
            .iter()
            .any(|f| f[0] == 1)));
    }

    #[test]
    fn test_finished_playback_is_released() {
        let (mut session, _backend, _transport) = session();
        session.start();
        session.on_receive(PcmFrame::from(vec![1; 10]));
        let generation = session.playback_generation;

        // Ignored while the engine is alive
        session.on_playback_finished(generation);
        assert!(session.is_playing());

        // Worker exits on its own when its queue closes
        session.playback.as_ref().unwrap().queue().unwrap().close();
        assert!(wait_until(WAIT, || !session.is_playing()));

        session.on_playback_finished(generation + 1);
        assert!(session.playback.is_some());
        session.on_playback_finished(generation);
        assert!(session.playback.is_none());

        // Next inbound frame starts a fresh engine
        session.on_receive(PcmFrame::from(vec![2; 10]));
        assert!(session.is_playing());
        assert_eq!(session.playback_generation, generation + 1);
    }
}
