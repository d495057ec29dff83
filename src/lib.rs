//! Peer-to-peer audio/video call signaling.
//!
//! The runtime half of the workspace: the call session controller, peer
//! connection backends, the signaling transport and record store seams, the
//! incoming-call watcher and the event bus. Data types shared with other
//! runtimes live in `callcore`.

pub use callcore::{channel, format_duration};

pub mod types {
    pub use callcore::types::*;
    pub mod events;
}

pub mod calls;
pub mod config;
pub mod signaling;
pub mod store;

pub use calls::{CallError, CallSessionController, IncomingCallWatcher};
pub use config::{CallConfig, RtcConfig};
