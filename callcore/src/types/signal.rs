//! Negotiation messages exchanged over the per-call signaling channel.
//!
//! Payloads use the JSON shapes browsers produce for
//! `RTCSessionDescriptionInit` and `RTCIceCandidateInit`, so a native peer
//! and a web peer can share one channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::call::{CallId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("expected {expected} payload, message carries {found}")]
    UnexpectedType {
        expected: &'static str,
        found: SignalType,
    },

    #[error("malformed signal payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One negotiation message as stored and delivered by the signal transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub id: SignalId,
    pub call_id: CallId,
    pub sender_id: UserId,
    pub signal_type: SignalType,
    pub signal_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SignalMessage {
    /// Build a message from a typed payload, stamping a fresh id and time.
    pub fn from_payload(
        call_id: CallId,
        sender_id: UserId,
        payload: &SignalPayload,
    ) -> Result<Self, PayloadError> {
        Ok(Self {
            id: SignalId::generate(),
            call_id,
            sender_id,
            signal_type: payload.signal_type(),
            signal_data: payload.to_value()?,
            created_at: Utc::now(),
        })
    }

    pub fn session_description(&self) -> Result<SessionDescription, PayloadError> {
        match self.signal_type {
            SignalType::Offer | SignalType::Answer => {
                Ok(serde_json::from_value(self.signal_data.clone())?)
            }
            found => Err(PayloadError::UnexpectedType {
                expected: "session description",
                found,
            }),
        }
    }

    pub fn ice_candidate(&self) -> Result<IceCandidate, PayloadError> {
        match self.signal_type {
            SignalType::IceCandidate => Ok(serde_json::from_value(self.signal_data.clone())?),
            found => Err(PayloadError::UnexpectedType {
                expected: "ice candidate",
                found,
            }),
        }
    }

    pub fn payload(&self) -> Result<SignalPayload, PayloadError> {
        match self.signal_type {
            SignalType::Offer | SignalType::Answer => {
                self.session_description().map(SignalPayload::Description)
            }
            SignalType::IceCandidate => self.ice_candidate().map(SignalPayload::Candidate),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate received from or to be sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// Candidate type from the `typ` attribute of the candidate line.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next().and_then(|t| t.parse().ok());
            }
        }
        None
    }
}

/// ICE candidate type (RFC 5245).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl std::str::FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

/// Typed body of a signal before it is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Description(desc) => match desc.sdp_type {
                SdpType::Offer => SignalType::Offer,
                SdpType::Pranswer | SdpType::Answer => SignalType::Answer,
            },
            Self::Candidate(_) => SignalType::IceCandidate,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Description(desc) => serde_json::to_value(desc),
            Self::Candidate(candidate) => serde_json::to_value(candidate),
        }
    }
}
