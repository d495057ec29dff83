//! Call-related error types.

use callcore::{CallId, CallStatus, PayloadError};
use thiserror::Error;

use super::peer::PeerError;
use super::state::CallState;
use crate::signaling::TransportError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("another call is already {0}")]
    Busy(CallState),

    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("call {call_id} is {status}, not ringing")]
    NotRinging { call_id: CallId, status: CallStatus },

    #[error("call {0} is not addressed to this user")]
    NotReceiver(CallId),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("call record store: {0}")]
    Store(#[from] StoreError),

    #[error("signaling: {0}")]
    Transport(#[from] TransportError),

    #[error("peer connection: {0}")]
    Peer(#[from] PeerError),

    #[error("invalid signal payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("call attempt was abandoned")]
    Aborted,

    #[error("missing required component: {0}")]
    MissingComponent(&'static str),
}

/// Local capture failures, each carrying the text shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error(
        "Permission denied: Please allow {} access in your browser settings and try again.",
        permission_subject(.video)
    )]
    PermissionDenied { video: bool },

    #[error(
        "No {device} found. Please connect a {device} and try again.",
        device = missing_device(.video)
    )]
    DeviceNotFound { video: bool },

    #[error(
        "Device is already in use by another application. Please close other apps using your camera/microphone."
    )]
    DeviceBusy,

    #[error("Could not access media devices: {0}")]
    Other(String),
}

fn permission_subject(video: &bool) -> &'static str {
    if *video {
        "camera and microphone"
    } else {
        "microphone"
    }
}

fn missing_device(video: &bool) -> &'static str {
    if *video { "camera" } else { "microphone" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_error_messages() {
        assert_eq!(
            MediaError::PermissionDenied { video: true }.to_string(),
            "Permission denied: Please allow camera and microphone access in your browser settings and try again."
        );
        assert_eq!(
            MediaError::PermissionDenied { video: false }.to_string(),
            "Permission denied: Please allow microphone access in your browser settings and try again."
        );
        assert_eq!(
            MediaError::DeviceNotFound { video: true }.to_string(),
            "No camera found. Please connect a camera and try again."
        );
        assert_eq!(
            MediaError::DeviceNotFound { video: false }.to_string(),
            "No microphone found. Please connect a microphone and try again."
        );
        assert!(MediaError::DeviceBusy.to_string().starts_with("Device is already in use"));
    }

    #[test]
    fn test_call_error_wraps_media_error_transparently() {
        let err: CallError = MediaError::DeviceBusy.into();
        assert_eq!(err.to_string(), MediaError::DeviceBusy.to_string());
    }
}
