//! bluepeer integration test harness.
//!
//! Every test builds its own simulated medium and puts two or more full
//! radio services on it. Nothing here needs a radio, root or the network.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use bluepeer_core::config::BluepeerConfig;
use bluepeer_services::{
    EnvelopeStore, MemoryPeerStore, PeerStore, PowerAware, RadioService, SimulatedAir,
};

mod discovery;
mod lifecycle;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

/// One node on the shared medium.
pub struct Node {
    pub address: String,
    pub peer_id: String,
    pub service: Arc<RadioService>,
    pub store: MemoryPeerStore,
    pub inbox: EnvelopeStore,
}

/// Config with a fast scheduler and no periodic work until a test asks.
pub fn test_config(peer_id: &str) -> BluepeerConfig {
    let mut config = BluepeerConfig::default();
    config.identity.peer_id = peer_id.to_string();
    config.scheduler.poll_interval_ms = 5;
    config.discovery.power_poll_secs = 3600;
    config.discovery.interval_secs = 3600;
    config.discovery.exchange_interval_secs = 3600;
    config.storage.persist_peers = false;
    config
}

pub fn node_with(air: &Arc<SimulatedAir>, address: &str, config: BluepeerConfig) -> Node {
    let store = MemoryPeerStore::new();
    let inbox = EnvelopeStore::new();
    let peer_id = config.identity.peer_id.clone();
    let name = format!("node-{peer_id}");
    let service = RadioService::new(
        config,
        Arc::new(air.radio(address, &name)),
        Arc::new(air.transport(address)),
        Arc::new(store.clone()),
        Arc::new(inbox.clone()),
    );
    Node {
        address: address.to_string(),
        peer_id,
        service,
        store,
        inbox,
    }
}

/// A node that has already awakened and advertises its listener.
pub async fn awake_node(air: &Arc<SimulatedAir>, address: &str, peer_id: &str) -> Node {
    let node = node_with(air, address, test_config(peer_id));
    assert!(node.service.awaken().await, "{peer_id} failed to awaken");
    node
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
