use crate::calls::media::MediaStream;
use crate::calls::state::CallState;
use crate::store::CallerProfile;
use callcore::{CallId, CallRecord, CallType};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }

        impl Default for EventBus {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

/// The controller moved between call states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStateChanged {
    pub call_id: Option<CallId>,
    pub previous: CallState,
    pub current: CallState,
}

/// The first remote track of a call arrived. Later tracks are merged into
/// the same stream.
#[derive(Debug, Clone)]
pub struct RemoteStreamReady {
    pub call_id: CallId,
    pub stream: MediaStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    NoAnswer,
    Declined,
    EndedByPeer,
    ConnectionLost,
    Failed,
}

/// A user-facing message about how a call finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNotice {
    pub call_id: Option<CallId>,
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
}

impl CallNotice {
    pub fn no_answer(call_id: CallId) -> Self {
        Self {
            call_id: Some(call_id),
            kind: NoticeKind::NoAnswer,
            title: "No answer".to_string(),
            message: "The call was not answered".to_string(),
        }
    }

    pub fn declined(call_id: CallId) -> Self {
        Self {
            call_id: Some(call_id),
            kind: NoticeKind::Declined,
            title: "Call declined".to_string(),
            message: "The other person declined the call".to_string(),
        }
    }

    pub fn ended_by_peer(call_id: CallId) -> Self {
        Self {
            call_id: Some(call_id),
            kind: NoticeKind::EndedByPeer,
            title: "Call ended".to_string(),
            message: "The other person ended the call".to_string(),
        }
    }

    pub fn connection_lost(call_id: CallId) -> Self {
        Self {
            call_id: Some(call_id),
            kind: NoticeKind::ConnectionLost,
            title: "Connection lost".to_string(),
            message: "The call was disconnected".to_string(),
        }
    }

    pub fn failed(call_id: Option<CallId>, message: impl Into<String>) -> Self {
        Self {
            call_id,
            kind: NoticeKind::Failed,
            title: "Call failed".to_string(),
            message: message.into(),
        }
    }
}

/// A ringing call addressed to the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call: CallRecord,
    pub caller: CallerProfile,
}

impl IncomingCall {
    pub fn notification_title(&self) -> String {
        match self.call.call_type {
            CallType::Audio => "Incoming audio call".to_string(),
            CallType::Video => "Incoming video call".to_string(),
        }
    }

    pub fn notification_body(&self) -> String {
        format!("{} is calling you", self.caller.display_label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallCleared {
    pub call_id: CallId,
}

define_event_bus! {
    // Controller events
    (state_changed, Arc<CallStateChanged>),
    (remote_stream, Arc<RemoteStreamReady>),
    (notice, Arc<CallNotice>),

    // Watcher events
    (incoming_call, Arc<IncomingCall>),
    (incoming_call_cleared, Arc<IncomingCallCleared>),
}
