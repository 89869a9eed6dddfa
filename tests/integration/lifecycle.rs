use crate::*;

use bluepeer_services::discovery;
use bluepeer_services::{NetworkStatus, ServiceStatus, StatusEvent};

fn polled_config(peer_id: &str) -> BluepeerConfig {
    let mut config = test_config(peer_id);
    config.discovery.power_poll_secs = 1;
    config
}

/// The power monitor drives awaken and sleep as the radio comes and goes.
#[tokio::test]
async fn test_power_cycle_drives_lifecycle() {
    let air = SimulatedAir::new();
    let a = node_with(&air, "AA:00:00:00:00:01", polled_config("peer-a"));
    let _b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;

    assert!(a.service.start());
    assert_eq!(a.service.status(), ServiceStatus::Running);
    assert!(wait_for(Duration::from_secs(3), || a.service.is_awake()).await);
    assert_eq!(a.service.state().network_status(), NetworkStatus::Connected);
    assert_eq!(a.store.local_peer().and_then(|p| p.id), Some("peer-a".to_string()));

    // Discovery is scheduled without delay and finds B.
    assert!(
        wait_for(Duration::from_secs(3), || a
            .service
            .directory()
            .lookup("peer-b")
            .is_some())
        .await
    );

    air.set_powered(&a.address, false);
    assert!(wait_for(Duration::from_secs(3), || !a.service.is_awake()).await);
    assert!(
        wait_for(Duration::from_secs(1), || a.service.state().network_status()
            == NetworkStatus::Disconnected)
        .await
    );
    assert!(!a.service.scheduler().is_registered(discovery::TASK_NAME));
    assert_eq!(a.service.status(), ServiceStatus::Running);

    air.set_powered(&a.address, true);
    assert!(wait_for(Duration::from_secs(3), || a.service.is_awake()).await);
    assert!(a.service.scheduler().is_registered(discovery::TASK_NAME));

    assert!(a.service.stop().await);
    assert_eq!(a.service.status(), ServiceStatus::GracefullyShutdown);
    assert_eq!(a.service.state().network_status(), NetworkStatus::Stopped);
    assert!(!a.service.listener().is_listening().await);
}

/// Graceful stop waits for the discovery cycle in flight.
#[tokio::test]
async fn test_graceful_stop_waits_for_discovery() {
    let air = SimulatedAir::new();
    let a = node_with(&air, "AA:00:00:00:00:01", polled_config("peer-a"));
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;
    air.set_inquiry_step(Duration::from_millis(300));

    a.service.start();
    assert!(
        wait_for(Duration::from_secs(3), || a
            .service
            .scheduler()
            .is_running(discovery::TASK_NAME))
        .await
    );
    assert!(a.service.stop().await);

    assert!(a.service.registry().contains(&b.address));
    assert!(a.service.scheduler().task_names().is_empty());
}

/// Lifecycle transitions are published for observers in order.
#[tokio::test]
async fn test_status_events_are_published() {
    let air = SimulatedAir::new();
    let a = node_with(&air, "AA:00:00:00:00:01", test_config("peer-a"));
    let mut events = a.service.subscribe();

    a.service.start();
    a.service.shutdown().await;

    let mut services = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StatusEvent::Service(status) = event {
            services.push(status);
        }
    }
    assert_eq!(
        services,
        vec![
            ServiceStatus::Initializing,
            ServiceStatus::Running,
            ServiceStatus::ShuttingDown,
            ServiceStatus::Shutdown,
        ]
    );
}

/// Restart brings the service back up with a fresh monitor.
#[tokio::test]
async fn test_restart_reawakens() {
    let air = SimulatedAir::new();
    let a = node_with(&air, "AA:00:00:00:00:01", polled_config("peer-a"));

    a.service.start();
    assert!(wait_for(Duration::from_secs(3), || a.service.is_awake()).await);

    assert!(a.service.restart().await);
    assert_eq!(a.service.status(), ServiceStatus::Running);
    assert!(wait_for(Duration::from_secs(3), || a.service.is_awake()).await);
    assert_eq!(a.service.listener().leases().await, 1);

    a.service.shutdown().await;
    assert!(!a.service.is_awake());
}
