//! The call session controller.
//!
//! [`CallSessionController`] drives one call at a time through
//! `idle → calling → ringing → connecting → connected → ended → idle`
//! (receivers skip `calling` and `ringing`). It owns the single
//! [`CallSession`]; the signal loop, peer events, record changes and timers
//! all re-read that session under the epoch they were started with, so work
//! belonging to a finished call never touches the next one.

use callcore::{
    CallId, CallRecord, CallStatus, CallType, NewCallRecord, RecordUpdate, SdpType,
    SignalMessage, SignalPayload, SignalType, UserId,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use scopeguard::ScopeGuard;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::{CallError, MediaError};
use super::media::{CaptureDevices, MediaAcquirer, MediaStream, MediaTrack};
use super::peer::{
    PeerConnectionFactory, PeerConnectionManager, PeerConnectionState, PeerError, PeerEvent,
    PeerHandle,
};
use super::session::{CallSession, CandidateDisposition, Negotiation};
use super::state::{CallRole, CallState, CallTransition, InvalidTransition};
use crate::config::CallConfig;
use crate::signaling::{SignalSubscription, SignalTransport};
use crate::store::{
    CallRecordStore, ChangeFilter, ChangeKind, ChangeSubscription, RecordChange, StoreError,
};
use crate::types::events::{CallNotice, CallStateChanged, EventBus, RemoteStreamReady};

/// Why a call is being finished.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndReason {
    /// The local user hung up.
    Hangup,
    /// The ring timer of this call fired.
    NoAnswer(CallId),
    ConnectTimeout,
    GraceExpired,
    ConnectionLost,
    Failed(String),
    /// The other party wrote a terminal status.
    Remote(CallStatus),
}

impl EndReason {
    fn applies_to(&self, session: &CallSession) -> bool {
        match self {
            Self::NoAnswer(call_id) => {
                session.state == CallState::Ringing && session.call_id() == Some(call_id)
            }
            Self::ConnectTimeout => session.state == CallState::Connecting,
            Self::GraceExpired => session.link_down,
            _ => true,
        }
    }

    fn record_update(&self, now: DateTime<Utc>) -> Option<RecordUpdate> {
        match self {
            Self::NoAnswer(_) => Some(RecordUpdate::missed(now)),
            Self::Remote(_) => None,
            _ => Some(RecordUpdate::ended(now)),
        }
    }

    fn notice(&self, call_id: Option<CallId>) -> Option<CallNotice> {
        match self {
            Self::Hangup => None,
            Self::NoAnswer(call_id) => Some(CallNotice::no_answer(call_id.clone())),
            Self::ConnectTimeout => Some(CallNotice::failed(
                call_id,
                "The call could not be connected",
            )),
            Self::GraceExpired | Self::ConnectionLost => call_id.map(CallNotice::connection_lost),
            Self::Failed(message) => Some(CallNotice::failed(call_id, message.clone())),
            Self::Remote(CallStatus::Declined) => call_id.map(CallNotice::declined),
            Self::Remote(CallStatus::Missed) => call_id.map(CallNotice::no_answer),
            Self::Remote(_) => call_id.map(CallNotice::ended_by_peer),
        }
    }
}

/// Builder for [`CallSessionController`].
pub struct CallSessionControllerBuilder {
    local_id: UserId,
    store: Option<Arc<dyn CallRecordStore>>,
    transport: Option<Arc<dyn SignalTransport>>,
    devices: Option<Arc<dyn CaptureDevices>>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    config: CallConfig,
    events: Option<Arc<EventBus>>,
}

impl CallSessionControllerBuilder {
    pub fn with_store(mut self, store: Arc<dyn CallRecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SignalTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_capture_devices(mut self, devices: Arc<dyn CaptureDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an event bus with other components. A private one is created
    /// otherwise.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(self) -> Result<Arc<CallSessionController>, CallError> {
        let store = self
            .store
            .ok_or(CallError::MissingComponent("call record store"))?;
        let transport = self
            .transport
            .ok_or(CallError::MissingComponent("signal transport"))?;
        let devices = self
            .devices
            .ok_or(CallError::MissingComponent("capture devices"))?;
        let factory = self
            .peer_factory
            .ok_or(CallError::MissingComponent("peer connection factory"))?;
        self.config.rtc.validate().map_err(PeerError::from)?;

        // Remote-side status changes arrive through both filters.
        let as_caller = store
            .subscribe(ChangeFilter::Caller(self.local_id.clone()))
            .await?;
        let as_receiver = store
            .subscribe(ChangeFilter::Receiver(self.local_id.clone()))
            .await?;

        let peers = PeerConnectionManager::new(
            factory,
            Arc::clone(&transport),
            self.config.rtc.clone(),
            self.local_id.clone(),
        );
        let (state_tx, _) = watch::channel(CallState::Idle);
        let local_id = self.local_id;
        let controller = Arc::new_cyclic(|this| CallSessionController {
            local_id: local_id.clone(),
            store,
            transport,
            media: MediaAcquirer::new(devices),
            peers,
            config: self.config,
            events: self.events.unwrap_or_default(),
            session: Mutex::new(CallSession::default()),
            state_tx,
            record_watch: Mutex::new(None),
            this: this.clone(),
        });

        let task = tokio::spawn(CallSessionController::watch_records(
            Arc::downgrade(&controller),
            as_caller,
            as_receiver,
        ));
        *controller
            .record_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        info!("Call controller ready for {}", local_id);
        Ok(controller)
    }
}

pub struct CallSessionController {
    local_id: UserId,
    store: Arc<dyn CallRecordStore>,
    transport: Arc<dyn SignalTransport>,
    media: MediaAcquirer,
    peers: PeerConnectionManager,
    config: CallConfig,
    events: Arc<EventBus>,
    session: Mutex<CallSession>,
    state_tx: watch::Sender<CallState>,
    record_watch: Mutex<Option<JoinHandle<()>>>,
    this: Weak<CallSessionController>,
}

impl CallSessionController {
    pub fn builder(local_id: UserId) -> CallSessionControllerBuilder {
        CallSessionControllerBuilder {
            local_id,
            store: None,
            transport: None,
            devices: None,
            peer_factory: None,
            config: CallConfig::default(),
            events: None,
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn state(&self) -> CallState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn current_call(&self) -> Option<CallRecord> {
        self.session().record.clone()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.session().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.session().remote_stream.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.session().is_muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.session().is_video_enabled
    }

    /// Whole seconds since the call connected.
    pub fn call_duration(&self) -> u64 {
        self.session().duration_secs
    }

    /// Place an outgoing call.
    ///
    /// Returns once the offer is published and the controller is `ringing`.
    /// On failure the controller is back in `idle` and no capture device is
    /// held.
    pub async fn start_call(
        &self,
        receiver_id: &UserId,
        is_video: bool,
    ) -> Result<CallRecord, CallError> {
        let call_type = CallType::from_video(is_video);
        let epoch = {
            let mut session = self.session();
            if !session.state.is_idle() {
                return Err(CallError::Busy(session.state));
            }
            let epoch = session.begin(CallRole::Caller);
            session.is_video_enabled = is_video;
            self.transition(&mut session, CallTransition::Dial)?;
            epoch
        };
        info!("Starting {} call to {}", call_type.as_str(), receiver_id);

        let stream = match self.media.acquire(is_video).await {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon(epoch, &e).await;
                return Err(e.into());
            }
        };
        self.adopt_stream(epoch, stream)?;

        let new_record =
            NewCallRecord::ringing(self.local_id.clone(), receiver_id.clone(), call_type);
        let record = match self.store.insert(new_record).await {
            Ok(record) => record,
            Err(e) => return Err(self.fail(epoch, e.into()).await),
        };
        let attached = {
            let mut session = self.session();
            let current = session.is_current(epoch);
            if current {
                session.record = Some(record.clone());
            }
            current
        };
        if !attached {
            self.mark_abandoned(&record.id).await;
            return Err(CallError::Aborted);
        }

        let peer = match self.open_peer(epoch, &record.id).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.fail(epoch, e).await),
        };
        if let Err(e) = self.publish_offer(&record.id, &peer).await {
            return Err(self.fail(epoch, e).await);
        }

        let mut session = self.session();
        if !session.is_current(epoch) {
            return Err(CallError::Aborted);
        }
        // The answer may already have moved the call past `calling`.
        if session.state == CallState::Calling {
            self.transition(&mut session, CallTransition::OfferSent)?;
            session.tasks.ring_timer = Some(self.spawn_timer(
                self.config.ring_timeout,
                epoch,
                EndReason::NoAnswer(record.id.clone()),
            ));
        }
        Ok(record)
    }

    /// Answer a ringing call addressed to the local user.
    pub async fn answer_call(&self, call: &CallRecord) -> Result<(), CallError> {
        if call.receiver_id != self.local_id {
            return Err(CallError::NotReceiver(call.id.clone()));
        }
        if call.status != CallStatus::Ringing {
            return Err(CallError::NotRinging {
                call_id: call.id.clone(),
                status: call.status,
            });
        }
        let epoch = {
            let mut session = self.session();
            if !session.state.is_idle() {
                return Err(CallError::Busy(session.state));
            }
            let epoch = session.begin(CallRole::Receiver);
            session.is_video_enabled = call.call_type.is_video();
            session.record = Some(call.clone());
            self.transition(&mut session, CallTransition::Answer)?;
            epoch
        };
        info!("Answering {} call {} from {}", call.call_type.as_str(), call.id, call.caller_id);

        let stream = match self.media.acquire(call.call_type.is_video()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon(epoch, &e).await;
                return Err(e.into());
            }
        };
        self.adopt_stream(epoch, stream)?;

        let peer = match self.open_peer(epoch, &call.id).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.fail(epoch, e).await),
        };
        if let Err(e) = self.negotiate_answer(epoch, &call.id, &peer).await {
            return Err(self.fail(epoch, e).await);
        }

        match self
            .store
            .update(&call.id, RecordUpdate::accepted(Utc::now()))
            .await
        {
            Ok(accepted) => {
                let mut session = self.session();
                if !session.is_current(epoch) {
                    return Err(CallError::Aborted);
                }
                session.record = Some(accepted);
                self.arm_connect_timer(&mut session, epoch);
                Ok(())
            }
            Err(e) => Err(self.fail(epoch, e.into()).await),
        }
    }

    /// Decline a ringing call without acquiring media.
    pub async fn decline_call(&self, call_id: &CallId) -> Result<CallRecord, CallError> {
        let record = self
            .store
            .get(call_id)
            .await?
            .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
        if record.receiver_id != self.local_id {
            return Err(CallError::NotReceiver(call_id.clone()));
        }
        if record.status != CallStatus::Ringing {
            return Err(CallError::NotRinging {
                call_id: call_id.clone(),
                status: record.status,
            });
        }
        let declined = self
            .store
            .update(call_id, RecordUpdate::declined(Utc::now()))
            .await?;
        info!("Declined call {}", call_id);

        // Only the session of the declined call is torn down.
        let epoch = {
            let session = self.session();
            (session.call_id() == Some(call_id)).then_some(session.epoch)
        };
        if let Some(epoch) = epoch {
            self.release(Some(epoch)).await;
        }
        Ok(declined)
    }

    /// Hang up the current call, marking its record `ended`.
    pub async fn end_call(&self) {
        let epoch = {
            let session = self.session();
            if !session.state.is_active() {
                return;
            }
            session.epoch
        };
        self.conclude(epoch, EndReason::Hangup).await;
    }

    /// Flip `enabled` on every local audio track. Returns the new muted flag.
    pub fn toggle_mute(&self) -> bool {
        let mut session = self.session();
        let Some(stream) = session.local_stream.clone() else {
            return session.is_muted;
        };
        let muted = !session.is_muted;
        set_enabled(&stream.audio_tracks(), !muted);
        session.is_muted = muted;
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    /// Flip `enabled` on every local video track. Returns the new flag.
    pub fn toggle_video(&self) -> bool {
        let mut session = self.session();
        let Some(stream) = session.local_stream.clone() else {
            return session.is_video_enabled;
        };
        let tracks = stream.video_tracks();
        if tracks.is_empty() {
            return session.is_video_enabled;
        }
        let enabled = !session.is_video_enabled;
        set_enabled(&tracks, enabled);
        session.is_video_enabled = enabled;
        info!("Camera {}", if enabled { "enabled" } else { "disabled" });
        enabled
    }

    /// Release every resource of the current session and return to `idle`.
    /// The call record is left as it is. Safe to call at any time.
    pub async fn cleanup(&self) {
        self.release(None).await;
    }

    /// Hang up any active call and stop watching record changes.
    pub async fn shutdown(&self) {
        let task = self
            .record_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.end_call().await;
        self.cleanup().await;
        info!("Call controller for {} shut down", self.local_id);
    }

    fn session(&self) -> MutexGuard<'_, CallSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        session: &mut CallSession,
        transition: CallTransition,
    ) -> Result<CallState, InvalidTransition> {
        let previous = session.state;
        let next = previous.apply(transition)?;
        if next != previous {
            session.state = next;
            self.state_tx.send_replace(next);
            match session.call_id() {
                Some(call_id) => info!("Call {}: {} -> {}", call_id, previous, next),
                None => info!("Call state {} -> {}", previous, next),
            }
            let _ = self.events.state_changed.send(Arc::new(CallStateChanged {
                call_id: session.call_id().cloned(),
                previous,
                current: next,
            }));
        }
        Ok(next)
    }

    /// Hand a freshly acquired stream to the session, or stop it if the
    /// attempt was abandoned while capture was pending.
    fn adopt_stream(&self, epoch: u64, stream: MediaStream) -> Result<(), CallError> {
        let stream = scopeguard::guard(stream, |stream| {
            info!("Discarding stream {} of an abandoned call", stream.id());
            stream.stop_all();
        });
        let mut session = self.session();
        if !session.is_current(epoch) {
            return Err(CallError::Aborted);
        }
        session.local_stream = Some(ScopeGuard::into_inner(stream));
        Ok(())
    }

    /// Create the peer connection, attach local tracks and start the signal
    /// loop for `call_id`.
    async fn open_peer(&self, epoch: u64, call_id: &CallId) -> Result<Arc<PeerHandle>, CallError> {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(self.peers.create(call_id, peer_tx).await?);
        let stream = {
            let mut session = self.session();
            if session.is_current(epoch) {
                session.peer = Some(Arc::clone(&peer));
                session.local_stream.clone()
            } else {
                None
            }
        };
        let Some(stream) = stream else {
            peer.close().await;
            return Err(CallError::Aborted);
        };
        peer.add_local_tracks(&stream).await?;

        let signals = self.transport.subscribe(call_id, &self.local_id).await?;
        debug!("Listening on {} for call {}", signals.channel(), call_id);
        let task = self.spawn_session_loop(epoch, call_id.clone(), signals, peer_rx);
        let mut session = self.session();
        if !session.is_current(epoch) {
            task.abort();
            return Err(CallError::Aborted);
        }
        session.tasks.signals = Some(task);
        Ok(peer)
    }

    async fn publish_offer(&self, call_id: &CallId, peer: &PeerHandle) -> Result<(), CallError> {
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.transport
            .publish(call_id, &self.local_id, SignalPayload::Description(offer))
            .await?;
        info!("Published offer for call {}", call_id);
        Ok(())
    }

    /// Answer-side negotiation: apply the offer published before we
    /// subscribed plus the candidates that came with it, then answer.
    async fn negotiate_answer(
        &self,
        epoch: u64,
        call_id: &CallId,
        peer: &PeerHandle,
    ) -> Result<(), CallError> {
        let negotiation = {
            let session = self.session();
            if !session.is_current(epoch) {
                return Err(CallError::Aborted);
            }
            Arc::clone(&session.negotiation)
        };
        let mut negotiation = negotiation.lock().await;

        if !negotiation.remote_description_set() {
            let offers = self
                .transport
                .list_signals(call_id, SignalType::Offer, Some(&self.local_id))
                .await?;
            for message in &offers {
                negotiation.note_signal(&message.id);
            }
            // Newest usable offer wins; a bad one is skipped like any other signal.
            for message in offers.iter().rev() {
                let applied = match message.session_description() {
                    Ok(offer) => negotiation.apply_remote_description(peer, offer).await,
                    Err(e) => {
                        warn!("Skipping malformed offer {}: {}", message.id, e);
                        continue;
                    }
                };
                match applied {
                    Ok(_) => break,
                    Err(e) => warn!("Failed to apply offer {} for {}: {}", message.id, call_id, e),
                }
            }
            if !negotiation.remote_description_set() {
                info!("No usable offer for {} yet, answering when it arrives", call_id);
            }
        }

        let candidates = self
            .transport
            .list_signals(call_id, SignalType::IceCandidate, Some(&self.local_id))
            .await?;
        for message in candidates {
            if !negotiation.note_signal(&message.id) {
                continue;
            }
            match message.ice_candidate() {
                Ok(candidate) => {
                    if let Err(e) = negotiation.add_candidate(peer, candidate).await {
                        warn!("Skipping backfilled candidate for {}: {}", call_id, e);
                    }
                }
                Err(e) => warn!("Malformed backfilled candidate {}: {}", message.id, e),
            }
        }

        if negotiation.remote_description_set() && !negotiation.answered() {
            self.send_answer(call_id, peer, &mut negotiation).await?;
        }
        Ok(())
    }

    async fn send_answer(
        &self,
        call_id: &CallId,
        peer: &PeerHandle,
        negotiation: &mut Negotiation,
    ) -> Result<(), CallError> {
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.transport
            .publish(call_id, &self.local_id, SignalPayload::Description(answer))
            .await?;
        negotiation.mark_answered();
        info!("Published answer for call {}", call_id);
        Ok(())
    }

    fn spawn_session_loop(
        &self,
        epoch: u64,
        call_id: CallId,
        mut signals: SignalSubscription,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            let mut signals_open = true;
            loop {
                tokio::select! {
                    message = signals.recv(), if signals_open => {
                        let Some(message) = message else {
                            debug!("Signal channel of {} closed", call_id);
                            signals_open = false;
                            continue;
                        };
                        let Some(controller) = this.upgrade() else { break };
                        controller.handle_signal(epoch, message).await;
                    }
                    event = peer_events.recv() => {
                        let Some(event) = event else { break };
                        let Some(controller) = this.upgrade() else { break };
                        controller.handle_peer_event(epoch, event);
                    }
                }
            }
        })
    }

    async fn handle_signal(&self, epoch: u64, message: SignalMessage) {
        if message.sender_id == self.local_id {
            debug!("Ignoring own {} signal {}", message.signal_type, message.id);
            return;
        }
        let context = {
            let session = self.session();
            if !session.is_current(epoch) || session.call_id() != Some(&message.call_id) {
                None
            } else {
                session
                    .peer
                    .clone()
                    .zip(session.role)
                    .map(|(peer, role)| (peer, role, Arc::clone(&session.negotiation)))
            }
        };
        let Some((peer, role, negotiation)) = context else {
            debug!("Dropping signal {} for an inactive call", message.id);
            return;
        };

        let mut negotiation = negotiation.lock().await;
        if !negotiation.note_signal(&message.id) {
            debug!("Dropping duplicate signal {}", message.id);
            return;
        }
        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Skipping malformed {} signal {}: {}", message.signal_type, message.id, e);
                return;
            }
        };
        let call_id = &message.call_id;

        match payload {
            SignalPayload::Description(offer) if offer.sdp_type == SdpType::Offer => {
                if role != CallRole::Receiver || negotiation.remote_description_set() {
                    debug!("Ignoring offer {} for {}", message.id, call_id);
                    return;
                }
                if let Err(e) = negotiation.apply_remote_description(&peer, offer).await {
                    warn!("Failed to apply offer for {}: {}", call_id, e);
                    return;
                }
                if let Err(e) = self.send_answer(call_id, &peer, &mut negotiation).await {
                    warn!("Failed to answer offer for {}: {}", call_id, e);
                }
            }
            SignalPayload::Description(answer) => {
                if role != CallRole::Caller || negotiation.remote_description_set() {
                    debug!("Ignoring {:?} {} for {}", answer.sdp_type, message.id, call_id);
                    return;
                }
                match negotiation.apply_remote_description(&peer, answer).await {
                    Ok(_) => {
                        drop(negotiation);
                        info!("Applied answer for call {}", call_id);
                        self.on_remote_answered(epoch);
                    }
                    Err(e) => warn!("Failed to apply answer for {}: {}", call_id, e),
                }
            }
            SignalPayload::Candidate(candidate) => {
                match negotiation.add_candidate(&peer, candidate).await {
                    Ok(CandidateDisposition::Applied) => {
                        debug!("Applied remote candidate for {}", call_id)
                    }
                    Ok(CandidateDisposition::Queued) => {
                        debug!("Queued remote candidate for {}", call_id)
                    }
                    Err(e) => warn!("Skipping ICE candidate for {}: {}", call_id, e),
                }
            }
        }
    }

    fn handle_peer_event(&self, epoch: u64, event: PeerEvent) {
        match event {
            PeerEvent::RemoteTrack { stream_id, track } => {
                self.on_remote_track(epoch, stream_id, track)
            }
            PeerEvent::ConnectionState(state) => self.on_connection_state(epoch, state),
            // Published by the peer manager.
            PeerEvent::LocalCandidate(_) => {}
        }
    }

    fn on_remote_track(&self, epoch: u64, stream_id: String, track: MediaTrack) {
        let mut session = self.session();
        if !session.is_current(epoch) {
            return;
        }
        let Some(call_id) = session.call_id().cloned() else {
            return;
        };
        // The first remote stream stays the stream; later tracks join it.
        if let Some(stream) = &session.remote_stream {
            if stream.add_track(track) {
                debug!("Merged remote track into stream {}", stream.id());
            }
            return;
        }
        let stream = MediaStream::with_tracks(stream_id, vec![track]);
        info!("Remote stream {} for call {}", stream.id(), call_id);
        session.remote_stream = Some(stream.clone());
        let _ = self
            .events
            .remote_stream
            .send(Arc::new(RemoteStreamReady { call_id, stream }));
    }

    fn on_connection_state(&self, epoch: u64, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                let mut session = self.session();
                if !session.is_current(epoch) {
                    return;
                }
                session.link_down = false;
                if let Some(grace) = session.tasks.grace_timer.take() {
                    grace.abort();
                    info!("Connection recovered");
                }
                if session.state == CallState::Connected {
                    return;
                }
                if self
                    .transition(&mut session, CallTransition::MediaConnected)
                    .is_ok()
                {
                    session.tasks.abort_timers();
                    session.connected_at = Some(Instant::now());
                    session.tasks.ticker = Some(self.spawn_ticker(epoch));
                }
            }
            PeerConnectionState::Disconnected => {
                let grace = self.config.disconnect_grace;
                if grace.is_zero() {
                    warn!("Peer connection disconnected");
                    self.conclude_detached(epoch, EndReason::ConnectionLost);
                    return;
                }
                let mut session = self.session();
                if !session.is_current(epoch) || session.link_down {
                    return;
                }
                warn!("Peer connection disconnected, waiting {:?} for recovery", grace);
                session.link_down = true;
                session.tasks.grace_timer =
                    Some(self.spawn_timer(grace, epoch, EndReason::GraceExpired));
            }
            PeerConnectionState::Failed | PeerConnectionState::Closed => {
                warn!("Peer connection {:?}", state);
                self.conclude_detached(epoch, EndReason::ConnectionLost);
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {
                debug!("Peer connection {:?}", state);
            }
        }
    }

    /// Caller side: the receiver answered (answer applied or record
    /// accepted, whichever came first).
    fn on_remote_answered(&self, epoch: u64) {
        let mut session = self.session();
        if !session.is_current(epoch)
            || !matches!(session.state, CallState::Calling | CallState::Ringing)
        {
            return;
        }
        if self
            .transition(&mut session, CallTransition::RemoteAnswered)
            .is_ok()
        {
            if let Some(ring) = session.tasks.ring_timer.take() {
                ring.abort();
            }
            self.arm_connect_timer(&mut session, epoch);
        }
    }

    fn arm_connect_timer(&self, session: &mut CallSession, epoch: u64) {
        if session.state != CallState::Connecting || session.tasks.connect_timer.is_some() {
            return;
        }
        if let Some(timeout) = self.config.connect_timeout {
            session.tasks.connect_timer =
                Some(self.spawn_timer(timeout, epoch, EndReason::ConnectTimeout));
        }
    }

    fn spawn_timer(&self, delay: Duration, epoch: u64, reason: EndReason) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = this.upgrade() {
                debug!("Timer fired: {:?}", reason);
                controller.conclude_detached(epoch, reason);
            }
        })
    }

    fn spawn_ticker(&self, epoch: u64) -> JoinHandle<()> {
        let this = self.this.clone();
        let period = self.config.duration_tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(controller) = this.upgrade() else {
                    break;
                };
                if !controller.record_tick(epoch) {
                    break;
                }
            }
        })
    }

    fn record_tick(&self, epoch: u64) -> bool {
        let mut session = self.session();
        if !session.is_current(epoch) || session.state != CallState::Connected {
            return false;
        }
        if let Some(connected_at) = session.connected_at {
            session.duration_secs = connected_at.elapsed().as_secs();
        }
        true
    }

    async fn watch_records(
        this: Weak<Self>,
        mut as_caller: ChangeSubscription,
        mut as_receiver: ChangeSubscription,
    ) {
        loop {
            let change = tokio::select! {
                Some(change) = as_caller.recv() => change,
                Some(change) = as_receiver.recv() => change,
                else => break,
            };
            let Some(controller) = this.upgrade() else {
                break;
            };
            controller.on_record_change(change);
        }
    }

    fn on_record_change(&self, change: RecordChange) {
        if change.kind != ChangeKind::Update {
            return;
        }
        let mut session = self.session();
        if session.call_id() != Some(&change.record.id) || !session.state.is_active() {
            return;
        }
        let epoch = session.epoch;
        match change.record.status {
            CallStatus::Accepted => {
                session.record = Some(change.record);
                drop(session);
                self.on_remote_answered(epoch);
            }
            status if status.is_terminal() => {
                info!("Call {} was {} by the other party", change.record.id, status);
                self.conclude_detached(epoch, EndReason::Remote(status));
            }
            _ => {}
        }
    }

    /// Run [`Self::conclude`] on its own task, so it is not cancelled when
    /// the task that triggered it is aborted by the cleanup.
    fn conclude_detached(&self, epoch: u64, reason: EndReason) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { this.conclude(epoch, reason).await });
    }

    /// Finish the call of `epoch`: move to `ended`, write the final record
    /// status, surface a notice and clean up.
    async fn conclude(&self, epoch: u64, reason: EndReason) {
        let record = {
            let mut session = self.session();
            if !session.is_current(epoch)
                || !session.state.is_active()
                || !reason.applies_to(&session)
            {
                return;
            }
            if let Err(e) = self.transition(&mut session, CallTransition::Conclude) {
                warn!("Cannot end call: {}", e);
                return;
            }
            session.tasks.abort_timers();
            session.record.clone()
        };

        if let Some(record) = &record
            && let Some(update) = reason.record_update(Utc::now())
        {
            let status = update.status;
            match self.store.update(&record.id, update).await {
                Ok(_) => info!("Call {} marked {}", record.id, status),
                Err(StoreError::InvalidTransition(e)) => {
                    debug!("Call {} already finished: {}", record.id, e)
                }
                Err(e) => warn!("Failed to mark call {} {}: {}", record.id, status, e),
            }
        }
        if let Some(notice) = reason.notice(record.map(|r| r.id)) {
            let _ = self.events.notice.send(Arc::new(notice));
        }
        self.release(Some(epoch)).await;
    }

    async fn fail(&self, epoch: u64, err: CallError) -> CallError {
        if !matches!(err, CallError::Aborted) {
            error!("Call attempt failed: {}", err);
            self.conclude(epoch, EndReason::Failed(err.to_string())).await;
        }
        err
    }

    /// Abort an attempt whose media could not be acquired. Nothing was
    /// negotiated, so the controller goes straight back to `idle`.
    async fn abandon(&self, epoch: u64, err: &MediaError) {
        let call_id = {
            let session = self.session();
            if !session.is_current(epoch) {
                return;
            }
            session.call_id().cloned()
        };
        let _ = self
            .events
            .notice
            .send(Arc::new(CallNotice::failed(call_id, err.to_string())));
        self.release(Some(epoch)).await;
    }

    /// The record of an attempt abandoned mid-setup is closed so the other
    /// party stops ringing.
    async fn mark_abandoned(&self, call_id: &CallId) {
        if let Err(e) = self
            .store
            .update(call_id, RecordUpdate::ended(Utc::now()))
            .await
        {
            warn!("Failed to close abandoned call {}: {}", call_id, e);
        }
    }

    /// Reset the session (only the one of `epoch`, if given) and close its
    /// peer connection.
    async fn release(&self, epoch: Option<u64>) {
        let released = {
            let mut session = self.session();
            if let Some(epoch) = epoch
                && !session.is_current(epoch)
            {
                return;
            }
            let _ = self.transition(&mut session, CallTransition::Reset);
            session.take_resources()
        };
        if let Some(peer) = released.peer {
            peer.close().await;
        }
    }
}

fn set_enabled(tracks: &[MediaTrack], enabled: bool) {
    for track in tracks {
        track.set_enabled(enabled);
    }
}

impl Drop for CallSessionController {
    fn drop(&mut self) {
        if let Some(task) = self
            .record_watch
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let released = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take_resources();
        if let Some(peer) = released.peer
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move { peer.close().await });
        }
    }
}
