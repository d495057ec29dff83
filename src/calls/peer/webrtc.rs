//! Native peer connections backed by webrtc-rs.
//!
//! Local tracks are published as `TrackLocalStaticSample`s (Opus for audio,
//! VP8 for video). Capture pipelines feed encoded frames through
//! [`SampleTracks::write_sample`]; frames for a disabled track are dropped,
//! which is how mute and camera-off reach the wire.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use callcore::{IceCandidate, SdpType, SessionDescription};
use dashmap::DashMap;
use log::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
    PeerEventSender,
};
use crate::calls::media::{MediaTrack, TrackKind};
use crate::config::RtcConfig;

/// Registry of outgoing sample tracks, keyed by local track id.
#[derive(Clone, Default)]
pub struct SampleTracks {
    tracks: Arc<DashMap<String, (MediaTrack, Arc<TrackLocalStaticSample>)>>,
}

impl SampleTracks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.contains_key(track_id)
    }

    /// Send one encoded frame on the track with `track_id`. Returns `false`
    /// when the frame was dropped because the track is disabled or stopped.
    pub async fn write_sample(
        &self,
        track_id: &str,
        data: Bytes,
        duration: Duration,
    ) -> Result<bool, PeerError> {
        let Some((track, sample_track)) = self.tracks.get(track_id).map(|e| e.value().clone())
        else {
            return Err(PeerError::Closed);
        };
        if !track.is_enabled() || !track.is_live() {
            return Ok(false);
        }
        sample_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    fn insert(&self, track: MediaTrack, sample_track: Arc<TrackLocalStaticSample>) {
        self.tracks
            .insert(track.id().to_string(), (track, sample_track));
    }

    fn remove(&self, track_id: &str) {
        self.tracks.remove(track_id);
    }
}

/// Creates webrtc-rs peer connections.
#[derive(Clone, Default)]
pub struct WebRtcPeerFactory {
    samples: SampleTracks,
}

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_tracks(&self) -> SampleTracks {
        self.samples.clone()
    }
}

/// Create the WebRTC API with default codecs and interceptors.
fn create_api() -> Result<webrtc::api::API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_servers(config: &RtcConfig) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(PeerError::InvalidDescription(format!(
                "unsupported sdp type {}",
                other
            )));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: &RtcConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        config.validate()?;
        let api = create_api()?;
        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: ice_servers(config),
                ..Default::default()
            })
            .await?,
        );

        let candidate_tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(candidate_from_init(init)));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let track_tx = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = track_tx.clone();
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let stream_id = track.stream_id();
                let media =
                    MediaTrack::with_id(track.id(), kind, format!("remote {}", kind.as_str()));
                info!("Remote {} track {} on stream {}", kind.as_str(), media.id(), stream_id);
                Box::pin(async move {
                    let _ = tx.send(PeerEvent::RemoteTrack {
                        stream_id,
                        track: media.clone(),
                    });
                    // Drain RTP so interceptors keep running; playback is the host's concern.
                    while track.read_rtp().await.is_ok() {
                        if !media.is_live() {
                            break;
                        }
                    }
                })
            },
        ));

        let state_tx = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    info!("Peer connection state: {}", state);
                    if let Some(state) = connection_state(state) {
                        let _ = tx.send(PeerEvent::ConnectionState(state));
                    }
                })
            },
        ));

        Ok(Arc::new(WebRtcConnection {
            peer_connection,
            samples: self.samples.clone(),
            track_ids: Mutex::new(Vec::new()),
        }))
    }
}

struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    samples: SampleTracks,
    track_ids: Mutex<Vec<String>>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn add_track(&self, stream_id: &str, track: &MediaTrack) -> Result<(), PeerError> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            stream_id.to_owned(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Read incoming RTCP so NACK and report interceptors work.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        self.samples.insert(track.clone(), sample_track);
        self.track_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(track.id().to_owned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        from_rtc_description(self.peer_connection.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        from_rtc_description(self.peer_connection.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.peer_connection
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !self.has_remote_description().await {
            return Err(PeerError::NoRemoteDescription);
        }
        self.peer_connection
            .add_ice_candidate(candidate_to_init(candidate))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let track_ids = std::mem::take(
            &mut *self
                .track_ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in track_ids {
            self.samples.remove(&id);
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_ice_servers_from_config() {
        let servers = ice_servers(&RtcConfig::default());
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(servers[1].username.is_empty());
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment("abc123");
        let init = candidate_to_init(candidate.clone());
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(candidate_from_init(init), candidate);
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            Some(PeerConnectionState::Failed)
        );
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), None);
    }

    /// Offers list one media section per attached track.
    #[tokio::test]
    async fn test_offer_contains_local_tracks() {
        let factory = WebRtcPeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory.create(&RtcConfig::default(), tx).await.unwrap();

        let mic = MediaTrack::new(TrackKind::Audio, "mic");
        let cam = MediaTrack::new(TrackKind::Video, "cam");
        pc.add_track("local", &mic).await.unwrap();
        pc.add_track("local", &cam).await.unwrap();
        assert!(factory.sample_tracks().contains(mic.id()));

        let offer = pc.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(!pc.has_remote_description().await);
        assert!(matches!(
            pc.add_ice_candidate(IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 1 typ host"))
                .await,
            Err(PeerError::NoRemoteDescription)
        ));

        mic.set_enabled(false);
        let sent = factory
            .sample_tracks()
            .write_sample(mic.id(), Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!sent);

        pc.close().await.unwrap();
        assert!(!factory.sample_tracks().contains(mic.id()));
    }
}
