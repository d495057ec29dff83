//! Per-call signaling channel.
//!
//! Offers, answers and ICE candidates travel over a pub/sub channel named
//! after the call id (see [`callcore::channel::signal_channel`]). Delivery is
//! ordered per sender and at-least-once; anything published before a
//! subscription existed is recovered through [`SignalTransport::list_signals`].

pub mod memory;

use async_trait::async_trait;
use callcore::{CallId, PayloadError, SignalMessage, SignalPayload, SignalType, UserId};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemorySignalHub;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signal channel {0} is closed")]
    Closed(String),

    #[error("failed to publish signal: {0}")]
    Publish(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Live stream of signals for one call. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SignalSubscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<SignalMessage>,
}

impl SignalSubscription {
    pub fn new(channel: String, rx: mpsc::UnboundedReceiver<SignalMessage>) -> Self {
        Self { channel, rx }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Subscribe to signals of `call_id`. Messages authored by `local_id` are
    /// not delivered.
    async fn subscribe(
        &self,
        call_id: &CallId,
        local_id: &UserId,
    ) -> Result<SignalSubscription, TransportError>;

    async fn publish(
        &self,
        call_id: &CallId,
        sender_id: &UserId,
        payload: SignalPayload,
    ) -> Result<SignalMessage, TransportError>;

    /// Signals of one type already published for `call_id`, oldest first,
    /// excluding those sent by `exclude_sender`.
    async fn list_signals(
        &self,
        call_id: &CallId,
        signal_type: SignalType,
        exclude_sender: Option<&UserId>,
    ) -> Result<Vec<SignalMessage>, TransportError>;
}
