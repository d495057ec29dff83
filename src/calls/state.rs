//! Call state machine implementation.

use serde::Serialize;

/// Current state of the call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call. Initial state and the state every cleanup returns to.
    #[default]
    Idle,
    /// Outgoing call: media acquired, offer not yet published.
    Calling,
    /// Outgoing call: offer published, waiting for the receiver.
    Ringing,
    /// Negotiation in progress, media not flowing yet.
    Connecting,
    /// Media flowing.
    Connected,
    /// Call over, cleanup pending.
    Ended,
}

impl CallState {
    /// Any state that owns call resources.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the call the local party is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Receiver,
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// Local user starts an outgoing call.
    Dial,
    /// The offer was published.
    OfferSent,
    /// Local user answers an incoming call.
    Answer,
    /// The remote party accepted (answer applied or record accepted).
    RemoteAnswered,
    MediaConnected,
    /// Call finished for any reason.
    Conclude,
    /// Cleanup finished.
    Reset,
}

impl CallState {
    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply(self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        use CallState::*;
        use CallTransition::*;

        let next = match (self, transition) {
            (Idle, Dial) => Calling,
            (Calling, OfferSent) => Ringing,
            (Idle, Answer) => Connecting,
            (Calling | Ringing, RemoteAnswered) => Connecting,
            (Calling | Ringing | Connecting, MediaConnected) => Connected,
            (Calling | Ringing | Connecting | Connected, Conclude) => Ended,
            (_, Reset) => Idle,
            (current, attempted) => {
                return Err(InvalidTransition { current, attempted });
            }
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: CallState,
    pub attempted: CallTransition,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test complete outgoing call flow.
    /// Flow: Idle → Calling → Ringing → Connecting → Connected → Ended → Idle
    #[test]
    fn test_outgoing_call_flow() {
        let mut state = CallState::Idle;

        state = state.apply(CallTransition::Dial).unwrap();
        assert_eq!(state, CallState::Calling);

        state = state.apply(CallTransition::OfferSent).unwrap();
        assert_eq!(state, CallState::Ringing);

        state = state.apply(CallTransition::RemoteAnswered).unwrap();
        assert_eq!(state, CallState::Connecting);

        state = state.apply(CallTransition::MediaConnected).unwrap();
        assert_eq!(state, CallState::Connected);

        state = state.apply(CallTransition::Conclude).unwrap();
        assert_eq!(state, CallState::Ended);
        assert!(!state.is_active());

        state = state.apply(CallTransition::Reset).unwrap();
        assert!(state.is_idle());
    }

    /// Test complete incoming call flow.
    /// Flow: Idle → Connecting → Connected → Ended
    #[test]
    fn test_incoming_call_flow() {
        let mut state = CallState::Idle;

        state = state.apply(CallTransition::Answer).unwrap();
        assert_eq!(state, CallState::Connecting);
        assert!(state.is_active());

        state = state.apply(CallTransition::MediaConnected).unwrap();
        assert_eq!(state, CallState::Connected);

        state = state.apply(CallTransition::Conclude).unwrap();
        assert_eq!(state, CallState::Ended);
    }

    /// Media can come up before the caller has seen the answer applied.
    #[test]
    fn test_media_connected_while_ringing() {
        let state = CallState::Ringing
            .apply(CallTransition::MediaConnected)
            .unwrap();
        assert_eq!(state, CallState::Connected);
    }

    #[test]
    fn test_invalid_transitions() {
        let err = CallState::Connected
            .apply(CallTransition::Dial)
            .unwrap_err();
        assert_eq!(err.current, CallState::Connected);
        assert_eq!(err.attempted, CallTransition::Dial);
        assert!(err.to_string().contains("connected"));

        assert!(CallState::Idle.apply(CallTransition::Conclude).is_err());
        assert!(CallState::Ended.apply(CallTransition::Conclude).is_err());
        assert!(CallState::Ringing.apply(CallTransition::Answer).is_err());
        assert!(CallState::Connected.apply(CallTransition::RemoteAnswered).is_err());
    }

    #[test]
    fn test_reset_from_any_state() {
        for state in [
            CallState::Idle,
            CallState::Calling,
            CallState::Ringing,
            CallState::Connecting,
            CallState::Connected,
            CallState::Ended,
        ] {
            assert_eq!(state.apply(CallTransition::Reset), Ok(CallState::Idle));
        }
    }
}
