use async_trait::async_trait;
use callcore::{CallId, CallRecord, CallStatus, NewCallRecord, RecordUpdate, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::Result;

/// Persistent call-record store shared by both parties of a call.
///
/// `update` is a conditional write: implementations must reject a status
/// change that [`CallStatus::can_transition_to`] does not allow, so a
/// terminal status can only ever be written once per record.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn insert(&self, record: NewCallRecord) -> Result<CallRecord>;
    async fn update(&self, call_id: &CallId, update: RecordUpdate) -> Result<CallRecord>;
    async fn get(&self, call_id: &CallId) -> Result<Option<CallRecord>>;

    /// Observe inserts and updates of records matching `filter`.
    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeSubscription>;
}

/// Which side of a call record a change subscription follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    Receiver(UserId),
    Caller(UserId),
}

impl ChangeFilter {
    pub fn matches(&self, record: &CallRecord) -> bool {
        match self {
            Self::Receiver(user) => &record.receiver_id == user,
            Self::Caller(user) => &record.caller_id == user,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub kind: ChangeKind,
    pub record: CallRecord,
    /// Status before this change (`None` for inserts).
    pub previous_status: Option<CallStatus>,
}

/// Live feed of record changes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChangeSubscription {
    rx: mpsc::UnboundedReceiver<RecordChange>,
}

impl ChangeSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<RecordChange>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<RecordChange> {
        self.rx.recv().await
    }

    /// Next already-delivered change, without waiting.
    pub fn try_recv(&mut self) -> Option<RecordChange> {
        self.rx.try_recv().ok()
    }
}

/// Display identity of a caller as shown on an incoming-call prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerProfile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

impl CallerProfile {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            display_name: None,
            username: None,
            avatar_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_avatar_url(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    /// Name to show, falling back to the username and then to "Someone".
    pub fn display_label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.username.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("Someone")
    }
}

/// Resolves a user id to its display identity. Backed by whatever profile
/// service the host application has.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, user_id: &UserId) -> anyhow::Result<Option<CallerProfile>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_label_fallbacks() {
        let base = CallerProfile::new(UserId::new("u1"));
        assert_eq!(base.display_label(), "Someone");

        let with_username = base.clone().with_username("ana_k");
        assert_eq!(with_username.display_label(), "ana_k");

        let with_name = with_username.with_display_name("Ana");
        assert_eq!(with_name.display_label(), "Ana");

        let empty_name = CallerProfile::new(UserId::new("u2"))
            .with_display_name("")
            .with_username("zed");
        assert_eq!(empty_name.display_label(), "zed");
    }
}
