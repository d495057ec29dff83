// Shared rig for the call integration tests: two parties, "alice" and "bob",
// on one record store, one signal hub and one loopback network.
#![allow(dead_code)]

use callcore::UserId;
use p2p_calls::calls::{CallSessionController, CallState, LoopbackNetwork, SyntheticDevices};
use p2p_calls::config::CallConfig;
use p2p_calls::signaling::MemorySignalHub;
use p2p_calls::store::{CallerProfile, MemoryCallStore, MemoryDirectory};
use std::sync::Arc;
use std::time::Duration;

pub struct Party {
    pub id: UserId,
    pub controller: Arc<CallSessionController>,
    pub devices: Arc<SyntheticDevices>,
}

pub struct Rig {
    pub store: MemoryCallStore,
    pub hub: MemorySignalHub,
    pub network: LoopbackNetwork,
    pub directory: MemoryDirectory,
    pub alice: Party,
    pub bob: Party,
}

impl Rig {
    pub async fn new() -> Self {
        Self::with_config(CallConfig::default()).await
    }

    pub async fn with_config(config: CallConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let store = MemoryCallStore::new();
        let hub = MemorySignalHub::new();
        let network = LoopbackNetwork::new();
        let directory = MemoryDirectory::new();
        directory
            .insert(CallerProfile::new(UserId::new("alice")).with_display_name("Alice"))
            .await;
        directory
            .insert(CallerProfile::new(UserId::new("bob")).with_username("bob"))
            .await;

        let alice = party("alice", &store, &hub, &network, &config).await;
        let bob = party("bob", &store, &hub, &network, &config).await;
        Self {
            store,
            hub,
            network,
            directory,
            alice,
            bob,
        }
    }
}

async fn party(
    user: &str,
    store: &MemoryCallStore,
    hub: &MemorySignalHub,
    network: &LoopbackNetwork,
    config: &CallConfig,
) -> Party {
    let id = UserId::new(user);
    let devices = Arc::new(SyntheticDevices::new());
    let controller = CallSessionController::builder(id.clone())
        .with_store(Arc::new(store.clone()))
        .with_transport(Arc::new(hub.clone()))
        .with_capture_devices(devices.clone())
        .with_peer_factory(Arc::new(network.clone()))
        .with_config(config.clone())
        .build()
        .await
        .unwrap();
    Party {
        id,
        controller,
        devices,
    }
}

/// Wait until `controller` reaches `target`.
pub async fn wait_state(controller: &CallSessionController, target: CallState) {
    let mut rx = controller.subscribe_state();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "{} never reached {} (still {})",
        controller.local_id(),
        target,
        controller.state()
    );
}

/// Poll `cond` until it holds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
