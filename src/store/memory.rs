use crate::store::error::{Result, StoreError};
use crate::store::traits::*;
use async_trait::async_trait;
use callcore::{CallId, CallRecord, CallStatus, NewCallRecord, RecordUpdate, UserId};
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{RwLock, mpsc};

/// In-memory call-record store. Both parties of a call share one instance.
#[derive(Clone, Default)]
pub struct MemoryCallStore {
    records: Arc<RwLock<HashMap<CallId, CallRecord>>>,
    subscribers: Arc<Mutex<Vec<(ChangeFilter, mpsc::UnboundedSender<RecordChange>)>>>,
    status_writes: Arc<Mutex<HashMap<CallId, Vec<CallStatus>>>>,
    fail_next: Arc<AtomicBool>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status successfully written for `call_id`, insert included.
    pub fn status_writes(&self, call_id: &CallId) -> Vec<CallStatus> {
        self.status_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(call_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the next insert or update fail with a backend error.
    pub fn fail_next_write(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<CallRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    fn check_injected_failure(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    fn log_status(&self, call_id: &CallId, status: CallStatus) {
        self.status_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(call_id.clone())
            .or_default()
            .push(status);
    }

    fn notify(&self, change: RecordChange) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(filter, tx)| {
            if !filter.matches(&change.record) {
                return !tx.is_closed();
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn insert(&self, record: NewCallRecord) -> Result<CallRecord> {
        self.check_injected_failure()?;
        let record = CallRecord {
            id: CallId::generate(),
            caller_id: record.caller_id,
            receiver_id: record.receiver_id,
            call_type: record.call_type,
            status: record.status,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        };
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
        self.log_status(&record.id, record.status);
        debug!(
            "Inserted call record {} ({} -> {}, {})",
            record.id, record.caller_id, record.receiver_id, record.status
        );
        self.notify(RecordChange {
            kind: ChangeKind::Insert,
            record: record.clone(),
            previous_status: None,
        });
        Ok(record)
    }

    async fn update(&self, call_id: &CallId, update: RecordUpdate) -> Result<CallRecord> {
        self.check_injected_failure()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.clone()))?;
        let previous = record.status;
        record.apply(&update)?;
        let record = record.clone();
        self.log_status(call_id, record.status);
        debug!(
            "Call record {} status {} -> {}",
            call_id, previous, record.status
        );
        self.notify(RecordChange {
            kind: ChangeKind::Update,
            record: record.clone(),
            previous_status: Some(previous),
        });
        Ok(record)
    }

    async fn get(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        Ok(self.records.read().await.get(call_id).cloned())
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((filter, tx));
        Ok(ChangeSubscription::new(rx))
    }
}

/// In-memory profile directory.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    profiles: Arc<RwLock<HashMap<UserId, CallerProfile>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, profile: CallerProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl IdentityResolver for MemoryDirectory {
    async fn resolve(&self, user_id: &UserId) -> anyhow::Result<Option<CallerProfile>> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::CallType;

    fn new_call() -> NewCallRecord {
        NewCallRecord::ringing(UserId::new("alice"), UserId::new("bob"), CallType::Audio)
    }

    #[tokio::test]
    async fn test_insert_and_update_notify_matching_subscribers() {
        let store = MemoryCallStore::new();
        let mut bob = store
            .subscribe(ChangeFilter::Receiver(UserId::new("bob")))
            .await
            .unwrap();
        let mut alice = store
            .subscribe(ChangeFilter::Caller(UserId::new("alice")))
            .await
            .unwrap();
        let mut carol = store
            .subscribe(ChangeFilter::Receiver(UserId::new("carol")))
            .await
            .unwrap();

        let record = store.insert(new_call()).await.unwrap();
        store
            .update(&record.id, RecordUpdate::accepted(Utc::now()))
            .await
            .unwrap();

        let first = bob.recv().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Insert);
        assert_eq!(first.record.status, CallStatus::Ringing);
        let second = bob.recv().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Update);
        assert_eq!(second.previous_status, Some(CallStatus::Ringing));
        assert_eq!(second.record.status, CallStatus::Accepted);

        assert_eq!(alice.recv().await.unwrap().kind, ChangeKind::Insert);
        assert!(carol.try_recv().is_none());
    }

    /// A second terminal write is rejected and never logged.
    #[tokio::test]
    async fn test_terminal_write_happens_once() {
        let store = MemoryCallStore::new();
        let record = store.insert(new_call()).await.unwrap();

        store
            .update(&record.id, RecordUpdate::missed(Utc::now()))
            .await
            .unwrap();
        let err = store
            .update(&record.id, RecordUpdate::ended(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));

        assert_eq!(
            store.status_writes(&record.id),
            vec![CallStatus::Ringing, CallStatus::Missed]
        );
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let store = MemoryCallStore::new();
        store.fail_next_write();
        assert!(matches!(
            store.insert(new_call()).await,
            Err(StoreError::Backend(_))
        ));
        assert!(store.insert(new_call()).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_unknown_record() {
        let store = MemoryCallStore::new();
        let err = store
            .update(&CallId::new("missing"), RecordUpdate::ended(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_directory_resolves_known_users_only() {
        let directory = MemoryDirectory::new();
        directory
            .insert(CallerProfile::new(UserId::new("alice")).with_display_name("Alice"))
            .await;

        let alice = directory.resolve(&UserId::new("alice")).await.unwrap();
        assert_eq!(alice.unwrap().display_label(), "Alice");
        assert!(directory.resolve(&UserId::new("eve")).await.unwrap().is_none());
    }
}
