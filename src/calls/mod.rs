//! Call lifecycle.
//!
//! - [`CallSessionController`]: the per-user call state machine
//! - [`IncomingCallWatcher`]: surfaces ringing calls addressed to the user
//! - [`media`]: local capture and the [`MediaAcquirer`]
//! - [`peer`]: peer connections and their backends
//! - [`CallState`] & [`CallTransition`]: the explicit transition table

pub mod controller;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod state;
pub mod watcher;

pub use controller::{CallSessionController, CallSessionControllerBuilder};
pub use error::{CallError, MediaError};
pub use media::{MediaAcquirer, MediaStream, MediaTrack, SyntheticDevices, TrackKind};
pub use peer::{LoopbackNetwork, PeerConnectionManager, WebRtcPeerFactory};
pub use session::{CandidateDisposition, Negotiation};
pub use state::{CallRole, CallState, CallTransition, InvalidTransition};
pub use watcher::IncomingCallWatcher;
