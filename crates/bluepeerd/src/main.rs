//! bluepeerd: short-range radio peer discovery daemon.
//!
//! Runs the radio service over the simulated medium described in the
//! `simulation` config section until Ctrl-C.

use std::sync::Arc;

use anyhow::Result;

use bluepeer_core::config::BluepeerConfig;
use bluepeer_core::radio::{
    DataElement, SecurityMode, ServiceRecord, ATTR_PEER_ID, ATTR_SERVICE_NAME, OBEX_OBJECT_PUSH,
    URL_SCHEME,
};
use bluepeer_core::Device;
use bluepeer_services::{
    EnvelopeStore, JsonPeerStore, MemoryPeerStore, PeerStore, RadioService, SimulatedAir,
    StatusEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BluepeerConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BluepeerConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BluepeerConfig::default()
    });
    tracing::info!(
        address = %config.simulation.address,
        neighbours = config.simulation.neighbours.len(),
        "bluepeerd starting"
    );

    // Simulated medium
    let air = populate_air(&config);
    let radio = Arc::new(air.radio(&config.simulation.address, &config.simulation.friendly_name));
    let transport = Arc::new(air.transport(&config.simulation.address));

    // Persistence
    let store: Arc<dyn PeerStore> = if config.storage.persist_peers {
        let path = config.storage.peers_file();
        tracing::info!(path = %path.display(), "peer store");
        Arc::new(JsonPeerStore::open(path))
    } else {
        Arc::new(MemoryPeerStore::new())
    };
    let inbox = EnvelopeStore::new();

    let service = RadioService::new(config, radio, transport, store, Arc::new(inbox.clone()));

    // ── Shutdown signal ──────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // Status printer
    let status_printer = {
        let mut events = service.subscribe();
        let mut shutdown = shutdown_tx.subscribe();
        let service = service.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Ok(StatusEvent::Network(status)) => {
                            let counts = service.directory().counts();
                            tracing::info!(
                                ?status,
                                devices = service.registry().len(),
                                provisional = counts.provisional,
                                discovery = counts.discovery,
                                confirmed = counts.confirmed,
                                peers_of_peers = counts.peers_of_peers,
                                "network"
                            );
                        }
                        Ok(event) => tracing::debug!(?event, "status"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "status printer lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    };

    service.start();

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = status_printer     => tracing::error!("status printer exited: {:?}", r),
    }

    service.stop().await;
    tracing::info!(received = inbox.count(), "bluepeerd stopped");
    Ok(())
}

/// Build the simulated medium: the local node plus every configured
/// neighbour, each advertising an object push record.
fn populate_air(config: &BluepeerConfig) -> Arc<SimulatedAir> {
    let air = SimulatedAir::new();
    for (channel, neighbour) in config.simulation.neighbours.iter().enumerate() {
        air.add_device(Device::new(&neighbour.address).with_name(&neighbour.friendly_name));
        let mut record = ServiceRecord::new()
            .with_class(OBEX_OBJECT_PUSH)
            .with_url(
                SecurityMode::NoAuthNoEncrypt,
                format!("{URL_SCHEME}://{}:{}", neighbour.address, channel + 1),
            )
            .with_attribute(
                ATTR_SERVICE_NAME,
                DataElement::Text(config.identity.service_name.clone()),
            );
        if !neighbour.peer_id.is_empty() {
            record = record.with_attribute(ATTR_PEER_ID, DataElement::Text(neighbour.peer_id.clone()));
        }
        air.add_record(&neighbour.address, record);
        tracing::debug!(address = %neighbour.address, "simulated neighbour");
    }
    air
}
