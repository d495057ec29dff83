//! Per-call session state owned by the controller.
//!
//! Exactly one [`CallSession`] exists per controller. Every asynchronous
//! continuation carries the `epoch` it was started under and re-reads the
//! session before acting; a changed epoch means the call it belonged to is
//! gone.

use callcore::{CallId, CallRecord, IceCandidate, SessionDescription, SignalId};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::media::MediaStream;
use super::peer::{PeerError, PeerHandle};
use super::state::{CallRole, CallState};

/// Negotiation progress of one call.
///
/// Held behind an async mutex for the whole time a signal is being applied,
/// so live signals and the answer-side backfill never interleave.
#[derive(Debug, Default)]
pub struct Negotiation {
    remote_description_set: bool,
    pending: Vec<IceCandidate>,
    seen: HashSet<SignalId>,
    answered: bool,
}

/// What happened to a remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a signal id. Returns `false` if it was already processed.
    pub fn note_signal(&mut self, id: &SignalId) -> bool {
        self.seen.insert(id.clone())
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn answered(&self) -> bool {
        self.answered
    }

    pub fn mark_answered(&mut self) {
        self.answered = true;
    }

    /// Apply the remote description, then flush queued candidates in arrival
    /// order. A candidate the connection rejects is logged and skipped.
    /// Returns how many queued candidates were applied.
    pub async fn apply_remote_description(
        &mut self,
        peer: &PeerHandle,
        desc: SessionDescription,
    ) -> Result<usize, PeerError> {
        peer.set_remote_description(desc).await?;
        self.remote_description_set = true;

        let pending = std::mem::take(&mut self.pending);
        let mut applied = 0;
        for candidate in pending {
            match peer.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(
                    "Skipping queued ICE candidate for {}: {}",
                    peer.call_id(),
                    e
                ),
            }
        }
        if applied > 0 {
            debug!(
                "Flushed {} queued candidate(s) for {}",
                applied,
                peer.call_id()
            );
        }
        Ok(applied)
    }

    /// Apply a remote candidate now, or queue it until the remote
    /// description is known.
    pub async fn add_candidate(
        &mut self,
        peer: &PeerHandle,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, PeerError> {
        if !self.remote_description_set {
            self.pending.push(candidate);
            return Ok(CandidateDisposition::Queued);
        }
        peer.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }
}

/// Background work tied to one session.
#[derive(Debug, Default)]
pub struct SessionTasks {
    pub signals: Option<JoinHandle<()>>,
    pub ring_timer: Option<JoinHandle<()>>,
    pub connect_timer: Option<JoinHandle<()>>,
    pub grace_timer: Option<JoinHandle<()>>,
    pub ticker: Option<JoinHandle<()>>,
}

impl SessionTasks {
    pub fn abort_timers(&mut self) {
        for timer in [
            self.ring_timer.take(),
            self.connect_timer.take(),
            self.grace_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }

    pub fn abort_all(&mut self) {
        self.abort_timers();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(signals) = self.signals.take() {
            signals.abort();
        }
    }
}

/// The single in-memory call session of a controller.
#[derive(Debug)]
pub struct CallSession {
    pub epoch: u64,
    pub state: CallState,
    pub role: Option<CallRole>,
    pub record: Option<CallRecord>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub peer: Option<Arc<PeerHandle>>,
    pub negotiation: Arc<AsyncMutex<Negotiation>>,
    pub tasks: SessionTasks,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    /// The connection reported `disconnected` and has not recovered yet.
    pub link_down: bool,
    pub connected_at: Option<Instant>,
    pub duration_secs: u64,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            epoch: 0,
            state: CallState::Idle,
            role: None,
            record: None,
            local_stream: None,
            remote_stream: None,
            peer: None,
            negotiation: Arc::new(AsyncMutex::new(Negotiation::new())),
            tasks: SessionTasks::default(),
            is_muted: false,
            is_video_enabled: false,
            link_down: false,
            connected_at: None,
            duration_secs: 0,
        }
    }
}

/// Resources taken out of a session that still need releasing.
pub struct Released {
    pub peer: Option<Arc<PeerHandle>>,
}

impl CallSession {
    /// Start a new attempt: fresh negotiation state under a new epoch.
    pub fn begin(&mut self, role: CallRole) -> u64 {
        self.epoch += 1;
        self.role = Some(role);
        self.negotiation = Arc::new(AsyncMutex::new(Negotiation::new()));
        self.is_muted = false;
        self.link_down = false;
        self.duration_secs = 0;
        self.connected_at = None;
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.record.as_ref().map(|r| &r.id)
    }

    /// Reset to an empty session under a new epoch. Local tracks are stopped
    /// and background tasks aborted here; the peer connection is handed back
    /// because closing it is asynchronous.
    pub fn take_resources(&mut self) -> Released {
        self.epoch += 1;
        self.tasks.abort_all();
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        self.remote_stream = None;
        self.record = None;
        self.role = None;
        self.negotiation = Arc::new(AsyncMutex::new(Negotiation::new()));
        self.is_muted = false;
        self.is_video_enabled = false;
        self.link_down = false;
        self.connected_at = None;
        self.duration_secs = 0;
        Released {
            peer: self.peer.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::{MediaTrack, TrackKind};
    use crate::calls::peer::loopback::LoopbackOp;
    use crate::calls::peer::{LoopbackNetwork, PeerConnectionManager};
    use crate::config::RtcConfig;
    use crate::signaling::MemorySignalHub;
    use callcore::UserId;
    use tokio::sync::mpsc;

    async fn handle(network: &LoopbackNetwork, user: &str) -> PeerHandle {
        let manager = PeerConnectionManager::new(
            Arc::new(network.clone()),
            Arc::new(MemorySignalHub::new()),
            RtcConfig::default(),
            UserId::new(user),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.create(&CallId::new("c1"), tx).await.unwrap()
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
    }

    /// Candidates that arrive before the remote description are queued and
    /// applied in arrival order right after it, never before.
    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let network = LoopbackNetwork::new();
        let caller = handle(&network, "alice").await;
        let receiver = handle(&network, "bob").await;
        caller
            .add_local_tracks(&MediaStream::with_tracks(
                "s",
                vec![MediaTrack::new(TrackKind::Audio, "mic")],
            ))
            .await
            .unwrap();
        let offer = caller.create_offer().await.unwrap();

        let mut negotiation = Negotiation::new();
        for n in 1..=3 {
            let disposition = negotiation
                .add_candidate(&receiver, candidate(n))
                .await
                .unwrap();
            assert_eq!(disposition, CandidateDisposition::Queued);
        }
        assert_eq!(negotiation.pending_candidates(), 3);
        assert!(network.ops().is_empty());

        let applied = negotiation
            .apply_remote_description(&receiver, offer)
            .await
            .unwrap();
        assert_eq!(applied, 3);
        assert_eq!(negotiation.pending_candidates(), 0);
        assert!(negotiation.remote_description_set());

        let ops = network.ops();
        assert!(matches!(ops[0], LoopbackOp::RemoteDescription { .. }));
        let added: Vec<String> = ops[1..]
            .iter()
            .map(|op| match op {
                LoopbackOp::CandidateAdded { candidate, .. } => candidate.clone(),
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        assert_eq!(
            added,
            (1..=3).map(|n| candidate(n).candidate).collect::<Vec<_>>()
        );

        let disposition = negotiation
            .add_candidate(&receiver, candidate(4))
            .await
            .unwrap();
        assert_eq!(disposition, CandidateDisposition::Applied);
    }

    /// A malformed queued candidate is skipped without losing the others.
    #[tokio::test]
    async fn test_bad_queued_candidate_is_skipped() {
        let network = LoopbackNetwork::new();
        let caller = handle(&network, "alice").await;
        let receiver = handle(&network, "bob").await;
        let offer = caller.create_offer().await.unwrap();

        let mut negotiation = Negotiation::new();
        negotiation
            .add_candidate(&receiver, IceCandidate::new("garbage"))
            .await
            .unwrap();
        negotiation
            .add_candidate(&receiver, candidate(1))
            .await
            .unwrap();
        let applied = negotiation
            .apply_remote_description(&receiver, offer)
            .await
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_duplicate_signal_ids_are_detected() {
        let mut negotiation = Negotiation::new();
        let id = SignalId::new("s1");
        assert!(negotiation.note_signal(&id));
        assert!(!negotiation.note_signal(&id));
        assert!(negotiation.note_signal(&SignalId::new("s2")));
    }

    #[test]
    fn test_take_resources_stops_tracks_and_bumps_epoch() {
        let mut session = CallSession::default();
        let epoch = session.begin(CallRole::Caller);
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        session.local_stream = Some(MediaStream::with_tracks("s", vec![track.clone()]));
        session.is_muted = true;

        let released = session.take_resources();
        assert!(released.peer.is_none());
        assert!(!track.is_live());
        assert!(!session.is_current(epoch));
        assert!(session.local_stream.is_none());
        assert!(!session.is_muted);

        // A second reset has nothing left to release.
        let released = session.take_resources();
        assert!(released.peer.is_none());
    }
}
