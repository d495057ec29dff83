use super::{SignalSubscription, SignalTransport, TransportError};
use async_trait::async_trait;
use callcore::channel::signal_channel;
use callcore::{CallId, SignalMessage, SignalPayload, SignalType, UserId};
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

struct Subscriber {
    local_id: UserId,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

#[derive(Default)]
struct ChannelState {
    log: Vec<SignalMessage>,
    subscribers: Vec<Subscriber>,
}

/// In-process signal hub shared by every party that should see each other.
///
/// Each call gets an append-only log plus the live subscribers of its
/// channel. The switches below make the hub misbehave the way real
/// realtime services do, so consumers can be tested against it.
#[derive(Clone, Default)]
pub struct MemorySignalHub {
    channels: Arc<DashMap<String, ChannelState>>,
    redeliver: Arc<AtomicBool>,
    echo_self: Arc<AtomicBool>,
    fail_next_publish: Arc<AtomicBool>,
}

impl MemorySignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every live message twice.
    pub fn set_redeliver(&self, on: bool) {
        self.redeliver.store(on, Ordering::SeqCst);
    }

    /// Stop filtering a subscriber's own messages out of its stream.
    pub fn set_echo_self(&self, on: bool) {
        self.echo_self.store(on, Ordering::SeqCst);
    }

    pub fn fail_next_publish(&self) {
        self.fail_next_publish.store(true, Ordering::SeqCst);
    }

    /// Number of live subscriptions on the call's channel.
    pub fn subscriber_count(&self, call_id: &CallId) -> usize {
        self.channels
            .get(&signal_channel(call_id))
            .map(|state| {
                state
                    .subscribers
                    .iter()
                    .filter(|s| !s.tx.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Everything published on the call's channel, in order.
    pub fn published(&self, call_id: &CallId) -> Vec<SignalMessage> {
        self.channels
            .get(&signal_channel(call_id))
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SignalTransport for MemorySignalHub {
    async fn subscribe(
        &self,
        call_id: &CallId,
        local_id: &UserId,
    ) -> Result<SignalSubscription, TransportError> {
        let channel = signal_channel(call_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.channels.entry(channel.clone()).or_default();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.push(Subscriber {
            local_id: local_id.clone(),
            tx,
        });
        debug!("{} subscribed to {}", local_id, channel);
        Ok(SignalSubscription::new(channel, rx))
    }

    async fn publish(
        &self,
        call_id: &CallId,
        sender_id: &UserId,
        payload: SignalPayload,
    ) -> Result<SignalMessage, TransportError> {
        if self.fail_next_publish.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Publish("injected publish failure".to_string()));
        }
        let message = SignalMessage::from_payload(call_id.clone(), sender_id.clone(), &payload)?;
        let channel = signal_channel(call_id);
        let echo_self = self.echo_self.load(Ordering::SeqCst);
        let copies = if self.redeliver.load(Ordering::SeqCst) {
            2
        } else {
            1
        };

        let mut state = self.channels.entry(channel.clone()).or_default();
        state.log.push(message.clone());
        state.subscribers.retain(|subscriber| {
            if !echo_self && &subscriber.local_id == sender_id {
                return !subscriber.tx.is_closed();
            }
            (0..copies).all(|_| subscriber.tx.send(message.clone()).is_ok())
        });
        debug!(
            "{} published {} on {}",
            sender_id, message.signal_type, channel
        );
        Ok(message)
    }

    async fn list_signals(
        &self,
        call_id: &CallId,
        signal_type: SignalType,
        exclude_sender: Option<&UserId>,
    ) -> Result<Vec<SignalMessage>, TransportError> {
        let Some(state) = self.channels.get(&signal_channel(call_id)) else {
            return Ok(Vec::new());
        };
        Ok(state
            .log
            .iter()
            .filter(|m| m.signal_type == signal_type)
            .filter(|m| exclude_sender != Some(&m.sender_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::{IceCandidate, SessionDescription};

    fn candidate(n: u32) -> SignalPayload {
        SignalPayload::Candidate(IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"
        )))
    }

    #[tokio::test]
    async fn test_delivery_excludes_own_messages() {
        let hub = MemorySignalHub::new();
        let call = CallId::new("call-1");
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let mut alice_sub = hub.subscribe(&call, &alice).await.unwrap();
        let mut bob_sub = hub.subscribe(&call, &bob).await.unwrap();
        assert_eq!(bob_sub.channel(), "call-signals-call-1");

        hub.publish(&call, &alice, candidate(1)).await.unwrap();
        hub.publish(&call, &alice, candidate(2)).await.unwrap();

        let first = bob_sub.recv().await.unwrap();
        let second = bob_sub.recv().await.unwrap();
        assert!(first.signal_data["candidate"].as_str().unwrap().starts_with("candidate:1"));
        assert!(second.signal_data["candidate"].as_str().unwrap().starts_with("candidate:2"));
        assert!(alice_sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_redeliver_and_echo_switches() {
        let hub = MemorySignalHub::new();
        hub.set_redeliver(true);
        hub.set_echo_self(true);
        let call = CallId::new("call-2");
        let alice = UserId::new("alice");
        let mut alice_sub = hub.subscribe(&call, &alice).await.unwrap();

        let sent = hub.publish(&call, &alice, candidate(1)).await.unwrap();
        assert_eq!(alice_sub.recv().await.unwrap().id, sent.id);
        assert_eq!(alice_sub.recv().await.unwrap().id, sent.id);
    }

    /// Backfill returns signals published before anyone subscribed.
    #[tokio::test]
    async fn test_list_signals_backfill() {
        let hub = MemorySignalHub::new();
        let call = CallId::new("call-3");
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        hub.publish(
            &call,
            &alice,
            SignalPayload::Description(SessionDescription::offer("first")),
        )
        .await
        .unwrap();
        hub.publish(&call, &alice, candidate(1)).await.unwrap();
        hub.publish(&call, &bob, candidate(9)).await.unwrap();
        hub.publish(
            &call,
            &alice,
            SignalPayload::Description(SessionDescription::offer("second")),
        )
        .await
        .unwrap();

        let offers = hub
            .list_signals(&call, SignalType::Offer, None)
            .await
            .unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers.last().unwrap().session_description().unwrap().sdp, "second");

        let from_alice = hub
            .list_signals(&call, SignalType::IceCandidate, Some(&bob))
            .await
            .unwrap();
        assert_eq!(from_alice.len(), 1);
        assert_eq!(from_alice[0].sender_id, alice);

        let unknown = hub
            .list_signals(&CallId::new("nope"), SignalType::Offer, None)
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_counted_out() {
        let hub = MemorySignalHub::new();
        let call = CallId::new("call-4");
        let sub = hub.subscribe(&call, &UserId::new("bob")).await.unwrap();
        assert_eq!(hub.subscriber_count(&call), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(&call), 0);
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let hub = MemorySignalHub::new();
        let call = CallId::new("call-5");
        hub.fail_next_publish();
        let alice = UserId::new("alice");
        assert!(matches!(
            hub.publish(&call, &alice, candidate(1)).await,
            Err(TransportError::Publish(_))
        ));
        assert!(hub.publish(&call, &alice, candidate(1)).await.is_ok());
        assert_eq!(hub.published(&call).len(), 1);
    }
}
