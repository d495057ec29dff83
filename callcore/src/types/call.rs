use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque identifier of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random call id (32 uppercase hex characters).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a party as known to the record store and the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn from_video(video: bool) -> Self {
        if video { Self::Video } else { Self::Audio }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            _ => Err(()),
        }
    }
}

/// Persisted status of a call record.
///
/// Transitions are one-directional: `ringing` may move to any other status,
/// `accepted` may only move to `ended`, and the terminal statuses
/// (`declined`, `ended`, `missed`) never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Declined,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined | Self::Ended | Self::Missed)
    }

    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match self {
            Self::Ringing => next != Self::Ringing,
            Self::Accepted => next == Self::Ended,
            Self::Declined | Self::Ended | Self::Missed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Ended => "ended",
            Self::Missed => "missed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(Self::Ringing),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            "ended" => Ok(Self::Ended),
            "missed" => Ok(Self::Missed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("call {call_id}: status {from} cannot move to {to}")]
pub struct InvalidStatusTransition {
    pub call_id: CallId,
    pub from: CallStatus,
    pub to: CallStatus,
}

/// One call attempt as persisted by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    /// The other party of the call, seen from `local`.
    pub fn peer_of(&self, local: &UserId) -> &UserId {
        if &self.caller_id == local {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.receiver_id == user
    }

    /// Apply a status update, enforcing the forward-only transition rule.
    pub fn apply(&mut self, update: &RecordUpdate) -> Result<(), InvalidStatusTransition> {
        if !self.status.can_transition_to(update.status) {
            return Err(InvalidStatusTransition {
                call_id: self.id.clone(),
                from: self.status,
                to: update.status,
            });
        }
        self.status = update.status;
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(ended_at) = update.ended_at {
            self.ended_at = Some(ended_at);
        }
        Ok(())
    }
}

/// Insert request for a new call record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCallRecord {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
}

impl NewCallRecord {
    pub fn ringing(caller_id: UserId, receiver_id: UserId, call_type: CallType) -> Self {
        Self {
            caller_id,
            receiver_id,
            call_type,
            status: CallStatus::Ringing,
        }
    }
}

/// Field changes written to an existing call record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RecordUpdate {
    pub fn accepted(now: DateTime<Utc>) -> Self {
        Self {
            status: CallStatus::Accepted,
            started_at: Some(now),
            ended_at: None,
        }
    }

    pub fn declined(now: DateTime<Utc>) -> Self {
        Self::terminal(CallStatus::Declined, now)
    }

    pub fn ended(now: DateTime<Utc>) -> Self {
        Self::terminal(CallStatus::Ended, now)
    }

    pub fn missed(now: DateTime<Utc>) -> Self {
        Self::terminal(CallStatus::Missed, now)
    }

    fn terminal(status: CallStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            started_at: None,
            ended_at: Some(now),
        }
    }
}

/// Render a call duration as `MM:SS`.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
