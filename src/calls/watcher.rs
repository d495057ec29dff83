//! Surfaces ringing calls addressed to the local user.

use callcore::channel::incoming_calls_channel;
use callcore::{CallId, CallStatus, UserId};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::{
    CallRecordStore, ChangeFilter, ChangeKind, ChangeSubscription, IdentityResolver,
    RecordChange, StoreError,
};
use crate::types::events::{EventBus, IncomingCall, IncomingCallCleared};

/// Watches the record store for calls where the local user is the receiver.
///
/// A new `ringing` record becomes the current incoming call once the
/// caller's profile is resolved. It is cleared when a record with the same
/// id leaves `ringing`; updates for any other id never touch it.
pub struct IncomingCallWatcher {
    current: Arc<watch::Sender<Option<IncomingCall>>>,
    events: Arc<EventBus>,
    task: JoinHandle<()>,
}

impl IncomingCallWatcher {
    pub async fn start(
        local_id: UserId,
        store: Arc<dyn CallRecordStore>,
        resolver: Arc<dyn IdentityResolver>,
        events: Arc<EventBus>,
    ) -> Result<Self, StoreError> {
        let subscription = store
            .subscribe(ChangeFilter::Receiver(local_id.clone()))
            .await?;
        let (current, _) = watch::channel(None);
        let current = Arc::new(current);
        let task = tokio::spawn(Self::run(
            local_id,
            subscription,
            resolver,
            Arc::clone(&current),
            Arc::clone(&events),
        ));
        Ok(Self {
            current,
            events,
            task,
        })
    }

    pub fn current(&self) -> Option<IncomingCall> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<IncomingCall>> {
        self.current.subscribe()
    }

    /// Dismiss the current incoming call, e.g. after it was answered here.
    pub fn clear(&self) {
        if let Some(dismissed) = self.current.send_replace(None) {
            let _ = self
                .events
                .incoming_call_cleared
                .send(Arc::new(IncomingCallCleared {
                    call_id: dismissed.call.id,
                }));
        }
    }

    async fn run(
        local_id: UserId,
        mut subscription: ChangeSubscription,
        resolver: Arc<dyn IdentityResolver>,
        current: Arc<watch::Sender<Option<IncomingCall>>>,
        events: Arc<EventBus>,
    ) {
        let channel = incoming_calls_channel(&local_id);
        info!("Watching {}", channel);
        while let Some(change) = subscription.recv().await {
            match change.kind {
                ChangeKind::Insert => {
                    Self::on_insert(change, resolver.as_ref(), &current, &events).await
                }
                ChangeKind::Update => Self::on_update(change, &current, &events),
            }
        }
        debug!("Subscription {} closed", channel);
    }

    async fn on_insert(
        change: RecordChange,
        resolver: &dyn IdentityResolver,
        current: &watch::Sender<Option<IncomingCall>>,
        events: &EventBus,
    ) {
        let call = change.record;
        if call.status != CallStatus::Ringing {
            return;
        }
        let caller = match resolver.resolve(&call.caller_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!("Ignoring call {} from unknown user {}", call.id, call.caller_id);
                return;
            }
            Err(e) => {
                warn!("Failed to resolve caller {}: {:#}", call.caller_id, e);
                return;
            }
        };
        let incoming = IncomingCall { call, caller };
        info!(
            "{} ({})",
            incoming.notification_title(),
            incoming.notification_body()
        );
        current.send_replace(Some(incoming.clone()));
        let _ = events.incoming_call.send(Arc::new(incoming));
    }

    fn on_update(
        change: RecordChange,
        current: &watch::Sender<Option<IncomingCall>>,
        events: &EventBus,
    ) {
        if change.previous_status != Some(CallStatus::Ringing)
            || change.record.status == CallStatus::Ringing
        {
            return;
        }
        let call_id = change.record.id;
        if clear_if_current(current, &call_id) {
            debug!("Incoming call {} is now {}", call_id, change.record.status);
            let _ = events
                .incoming_call_cleared
                .send(Arc::new(IncomingCallCleared { call_id }));
        }
    }
}

/// Clear the surfaced call only if it is `call_id`.
fn clear_if_current(current: &watch::Sender<Option<IncomingCall>>, call_id: &CallId) -> bool {
    current.send_if_modified(|incoming| {
        if incoming.as_ref().is_some_and(|i| &i.call.id == call_id) {
            *incoming = None;
            true
        } else {
            false
        }
    })
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
