//! Peer connection lifecycle.
//!
//! [`PeerConnectionManager`] owns one native connection per call. Local ICE
//! candidates are published on the call's signaling channel as they are
//! gathered; remote tracks and connection-state changes are forwarded to the
//! session that created the connection.

pub mod loopback;
pub mod webrtc;

use async_trait::async_trait;
use callcore::{CallId, IceCandidate, SessionDescription, SignalPayload, UserId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::media::{MediaStream, MediaTrack};
use crate::config::{ConfigError, RtcConfig};
use crate::signaling::SignalTransport;

pub use self::loopback::LoopbackNetwork;
pub use self::webrtc::WebRtcPeerFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Event reported by a connection backend.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack { stream_id: String, track: MediaTrack },
    ConnectionState(PeerConnectionState),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] ::webrtc::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("remote description is not set")]
    NoRemoteDescription,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("peer connection is closed")]
    Closed,
}

/// A native peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, stream_id: &str, track: &MediaTrack) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates native connections and wires their events to `events`.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &RtcConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

pub struct PeerConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    transport: Arc<dyn SignalTransport>,
    config: RtcConfig,
    local_id: UserId,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        transport: Arc<dyn SignalTransport>,
        config: RtcConfig,
        local_id: UserId,
    ) -> Self {
        Self {
            factory,
            transport,
            config,
            local_id,
        }
    }

    /// Create the connection for `call_id`. Remote tracks and state changes
    /// are sent to `notify`; local candidates go straight to the signaling
    /// channel.
    pub async fn create(
        &self,
        call_id: &CallId,
        notify: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<PeerHandle, PeerError> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let connection = self.factory.create(&self.config, events_tx).await?;
        info!("Created peer connection for call {}", call_id);

        let transport = Arc::clone(&self.transport);
        let local_id = self.local_id.clone();
        let pump_call_id = call_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        debug!(
                            "Publishing local candidate for {}: {}",
                            pump_call_id, candidate.candidate
                        );
                        if let Err(e) = transport
                            .publish(&pump_call_id, &local_id, SignalPayload::Candidate(candidate))
                            .await
                        {
                            warn!("Failed to publish ICE candidate for {}: {}", pump_call_id, e);
                        }
                    }
                    other => {
                        if notify.send(other).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(PeerHandle {
            call_id: call_id.clone(),
            connection,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }
}

/// The connection of one call plus its event pump.
pub struct PeerHandle {
    call_id: CallId,
    connection: Arc<dyn PeerConnection>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("call_id", &self.call_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Attach every track of `stream` for sending.
    pub async fn add_local_tracks(&self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in stream.tracks() {
            self.connection.add_track(stream.id(), &track).await?;
        }
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.connection.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.connection.create_answer().await
    }

    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.connection.set_local_description(desc).await
    }

    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.connection.set_remote_description(desc).await
    }

    pub async fn has_remote_description(&self) -> bool {
        self.connection.has_remote_description().await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.connection.add_ice_candidate(candidate).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the native connection. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.connection.close().await {
            warn!("Error closing peer connection for {}: {}", self.call_id, e);
        }
        self.stop_pump();
        info!("Closed peer connection for call {}", self.call_id);
    }

    fn stop_pump(&self) {
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::TrackKind;
    use crate::signaling::MemorySignalHub;
    use callcore::SignalType;

    fn manager(
        network: &LoopbackNetwork,
        hub: &MemorySignalHub,
        user: &str,
    ) -> PeerConnectionManager {
        PeerConnectionManager::new(
            Arc::new(network.clone()),
            Arc::new(hub.clone()),
            RtcConfig::default(),
            UserId::new(user),
        )
    }

    /// Candidates gathered by the backend end up on the signaling channel.
    #[tokio::test]
    async fn test_local_candidates_are_published() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalHub::new();
        let call = CallId::new("call-1");
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();

        let handle = manager(&network, &hub, "alice")
            .create(&call, notify_tx)
            .await
            .unwrap();
        let stream = MediaStream::with_tracks("s", vec![MediaTrack::new(TrackKind::Audio, "mic")]);
        handle.add_local_tracks(&stream).await.unwrap();
        let offer = handle.create_offer().await.unwrap();
        handle.set_local_description(offer).await.unwrap();

        let mut published = Vec::new();
        for _ in 0..50 {
            published = hub
                .list_signals(&call, SignalType::IceCandidate, None)
                .await
                .unwrap();
            if !published.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].sender_id, UserId::new("alice"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalHub::new();
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        let handle = manager(&network, &hub, "alice")
            .create(&CallId::new("call-2"), notify_tx)
            .await
            .unwrap();

        handle.close().await;
        handle.close().await;
        assert!(handle.is_closed());
        assert!(matches!(
            handle.create_offer().await,
            Err(PeerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rejects_config_without_two_stun_servers() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalHub::new();
        let manager = PeerConnectionManager::new(
            Arc::new(network),
            Arc::new(hub),
            RtcConfig { ice_servers: vec![] },
            UserId::new("alice"),
        );
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        assert!(matches!(
            manager.create(&CallId::new("call-3"), notify_tx).await,
            Err(PeerError::Config(_))
        ));
    }
}
