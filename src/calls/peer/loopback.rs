//! In-process peer connections.
//!
//! Endpoints created from one [`LoopbackNetwork`] negotiate with each other
//! over whatever signaling the caller uses, exactly like native connections:
//! descriptions identify the endpoint that produced them, candidates are
//! gathered when the local description is set, and an endpoint refuses
//! candidates until its remote description is known. Two endpoints connect
//! once each holds both descriptions and at least one remote candidate.
//! Received tracks mirror the sender's `enabled` flag.

use async_trait::async_trait;
use callcore::{IceCandidate, SdpType, SessionDescription};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
    PeerEventSender,
};
use crate::calls::media::MediaTrack;
use crate::config::RtcConfig;

const ENDPOINT_ATTR: &str = "a=x-loopback-endpoint:";

/// What an endpoint was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackOp {
    LocalDescription { endpoint: u64, sdp_type: SdpType },
    RemoteDescription { endpoint: u64, sdp_type: SdpType },
    CandidateAdded { endpoint: u64, candidate: String },
    CandidateRejected { endpoint: u64, candidate: String },
    Closed { endpoint: u64 },
}

impl LoopbackOp {
    pub fn endpoint(&self) -> u64 {
        match self {
            Self::LocalDescription { endpoint, .. }
            | Self::RemoteDescription { endpoint, .. }
            | Self::CandidateAdded { endpoint, .. }
            | Self::CandidateRejected { endpoint, .. }
            | Self::Closed { endpoint } => *endpoint,
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<u64, Weak<LoopbackEndpoint>>>,
    next_id: AtomicU64,
    link_down: AtomicBool,
    ops: Mutex<Vec<LoopbackOp>>,
}

impl NetworkInner {
    fn record(&self, op: LoopbackOp) {
        lock(&self.ops).push(op);
    }

    fn endpoint(&self, id: u64) -> Option<Arc<LoopbackEndpoint>> {
        lock(&self.endpoints).get(&id).and_then(Weak::upgrade)
    }

    fn live_endpoints(&self) -> Vec<Arc<LoopbackEndpoint>> {
        let mut endpoints = lock(&self.endpoints);
        endpoints.retain(|_, e| e.strong_count() > 0);
        endpoints.values().filter_map(Weak::upgrade).collect()
    }
}

/// A shared in-process "network" that loopback peers connect over.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<LoopbackOp> {
        lock(&self.inner.ops).clone()
    }

    /// Number of endpoints created and not yet dropped.
    pub fn open_endpoints(&self) -> usize {
        self.inner
            .live_endpoints()
            .iter()
            .filter(|e| !e.state().closed)
            .count()
    }

    /// Cut connectivity: connected endpoints report `disconnected`, and no
    /// new connection comes up until the link is restored.
    pub fn drop_link(&self) {
        self.inner.link_down.store(true, Ordering::SeqCst);
        for endpoint in self.inner.live_endpoints() {
            endpoint.transition_from(
                PeerConnectionState::Connected,
                PeerConnectionState::Disconnected,
            );
        }
    }

    pub fn restore_link(&self) {
        self.inner.link_down.store(false, Ordering::SeqCst);
        for endpoint in self.inner.live_endpoints() {
            endpoint.transition_from(
                PeerConnectionState::Disconnected,
                PeerConnectionState::Connected,
            );
        }
        for endpoint in self.inner.live_endpoints() {
            endpoint.try_connect();
        }
    }

    /// Fail every established connection.
    pub fn fail_link(&self) {
        self.inner.link_down.store(true, Ordering::SeqCst);
        for endpoint in self.inner.live_endpoints() {
            endpoint.transition_from(PeerConnectionState::Connected, PeerConnectionState::Failed);
            endpoint.transition_from(
                PeerConnectionState::Disconnected,
                PeerConnectionState::Failed,
            );
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackNetwork {
    async fn create(
        &self,
        config: &RtcConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        config.validate()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let endpoint = Arc::new(LoopbackEndpoint {
            id,
            network: Arc::clone(&self.inner),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        lock(&self.inner.endpoints).insert(id, Arc::downgrade(&endpoint));
        debug!("Loopback endpoint {} created", id);
        Ok(endpoint as Arc<dyn PeerConnection>)
    }
}

struct EndpointState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<u64>,
    remote_candidates: usize,
    tracks: Vec<(String, MediaTrack)>,
    gathered: bool,
    connection: PeerConnectionState,
    closed: bool,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            peer: None,
            remote_candidates: 0,
            tracks: Vec::new(),
            gathered: false,
            connection: PeerConnectionState::New,
            closed: false,
        }
    }
}

impl EndpointState {
    fn ready(&self) -> bool {
        !self.closed
            && self.local.is_some()
            && self.remote.is_some()
            && self.remote_candidates > 0
    }
}

struct LoopbackEndpoint {
    id: u64,
    network: Arc<NetworkInner>,
    events: PeerEventSender,
    state: Mutex<EndpointState>,
}

impl LoopbackEndpoint {
    fn state(&self) -> MutexGuard<'_, EndpointState> {
        lock(&self.state)
    }

    fn emit(&self, event: PeerEvent) {
        // The receiving side may already be gone.
        let _ = self.events.send(event);
    }

    fn describe(&self, sdp_type: SdpType) -> Result<SessionDescription, PeerError> {
        let state = self.state();
        if state.closed {
            return Err(PeerError::Closed);
        }
        let mut sdp = format!(
            "v=0\r\no=- {id} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{ENDPOINT_ATTR}{id}\r\n",
            id = self.id
        );
        for (stream_id, track) in &state.tracks {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{} {}\r\n",
                track.kind().as_str(),
                stream_id,
                track.id()
            ));
        }
        Ok(SessionDescription { sdp_type, sdp })
    }

    fn transition_from(&self, from: PeerConnectionState, to: PeerConnectionState) {
        let mut state = self.state();
        if state.closed || state.connection != from {
            return;
        }
        state.connection = to;
        self.emit(PeerEvent::ConnectionState(to));
    }

    /// Connect this endpoint and its peer if both are ready.
    fn try_connect(&self) {
        if self.network.link_down.load(Ordering::SeqCst) {
            return;
        }
        let (peer_id, own_tracks) = {
            let state = self.state();
            if !state.ready() {
                return;
            }
            let Some(peer_id) = state.peer else {
                return;
            };
            (peer_id, state.tracks.clone())
        };
        let Some(peer) = self.network.endpoint(peer_id) else {
            return;
        };
        let peer_tracks = {
            let state = peer.state();
            if !state.ready() || state.peer != Some(self.id) {
                return;
            }
            state.tracks.clone()
        };
        self.mark_connected(&peer_tracks);
        peer.mark_connected(&own_tracks);
    }

    fn mark_connected(&self, remote_tracks: &[(String, MediaTrack)]) {
        let mut state = self.state();
        if state.closed
            || matches!(
                state.connection,
                PeerConnectionState::Connected | PeerConnectionState::Failed
            )
        {
            return;
        }
        state.connection = PeerConnectionState::Connected;
        for (stream_id, track) in remote_tracks {
            self.emit(PeerEvent::RemoteTrack {
                stream_id: stream_id.clone(),
                track: track.mirror(),
            });
        }
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        debug!("Loopback endpoint {} connected", self.id);
    }
}

#[async_trait]
impl PeerConnection for LoopbackEndpoint {
    async fn add_track(&self, stream_id: &str, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.state();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state.tracks.push((stream_id.to_string(), track.clone()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.describe(SdpType::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.state().remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        self.describe(SdpType::Answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let gather = {
            let mut state = self.state();
            if state.closed {
                return Err(PeerError::Closed);
            }
            self.network.record(LoopbackOp::LocalDescription {
                endpoint: self.id,
                sdp_type: desc.sdp_type,
            });
            state.local = Some(desc);
            if state.connection == PeerConnectionState::New {
                state.connection = PeerConnectionState::Connecting;
            }
            !std::mem::replace(&mut state.gathered, true)
        };
        if gather {
            let candidate = IceCandidate::new(format!(
                "candidate:{id} 1 udp 2130706431 127.0.0.1 {port} typ host",
                id = self.id,
                port = 40000 + self.id
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment(format!("lb{}", self.id));
            self.emit(PeerEvent::LocalCandidate(candidate));
        }
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let peer = desc
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix(ENDPOINT_ATTR))
            .and_then(|id| id.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                PeerError::InvalidDescription("missing loopback endpoint attribute".to_string())
            })?;
        {
            let mut state = self.state();
            if state.closed {
                return Err(PeerError::Closed);
            }
            self.network.record(LoopbackOp::RemoteDescription {
                endpoint: self.id,
                sdp_type: desc.sdp_type,
            });
            state.peer = Some(peer);
            state.remote = Some(desc);
        }
        self.try_connect();
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(PeerError::Closed);
            }
            if state.remote.is_none() {
                self.network.record(LoopbackOp::CandidateRejected {
                    endpoint: self.id,
                    candidate: candidate.candidate.clone(),
                });
                return Err(PeerError::NoRemoteDescription);
            }
            if !candidate.candidate.starts_with("candidate:") {
                return Err(PeerError::InvalidCandidate(candidate.candidate));
            }
            self.network.record(LoopbackOp::CandidateAdded {
                endpoint: self.id,
                candidate: candidate.candidate.clone(),
            });
            state.remote_candidates += 1;
        }
        self.try_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let peer = {
            let mut state = self.state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.connection = PeerConnectionState::Closed;
            self.network.record(LoopbackOp::Closed { endpoint: self.id });
            state.peer
        };
        // The remote side sees its transport go away.
        if let Some(peer) = peer.and_then(|id| self.network.endpoint(id)) {
            peer.transition_from(PeerConnectionState::Connected, PeerConnectionState::Disconnected);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
