pub mod channel;
pub mod types;

pub use types::call::{
    CallId, CallRecord, CallStatus, CallType, InvalidStatusTransition, NewCallRecord,
    RecordUpdate, UserId, format_duration,
};
pub use types::signal::{
    CandidateType, IceCandidate, PayloadError, SdpType, SessionDescription, SignalId,
    SignalMessage, SignalPayload, SignalType,
};
