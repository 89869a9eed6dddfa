use crate::*;

use bluepeer_core::radio::{InquiryOutcome, SearchOutcome};
use bluepeer_services::exchange::ExchangeReport;
use bluepeer_services::Tier;

/// Inquiry finds the neighbour and its advertised record resolves its id.
#[tokio::test]
async fn test_nodes_discover_each_other() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;

    let report = a.service.coordinator().run_cycle().await.unwrap();
    assert_eq!(report.outcome, InquiryOutcome::Completed);
    assert_eq!(report.discovered, 1);
    assert_eq!(report.searched, 1);

    assert!(a.service.registry().contains(&b.address));
    let peer = a.service.directory().lookup("peer-b").expect("peer-b resolved");
    assert_eq!(peer.address, b.address);
    assert_eq!(peer.display_name.as_deref(), Some("node-peer-b"));
    assert_eq!(peer.service_url(), b.service.listener().url().await.as_deref());
    assert_eq!(a.service.directory().tier("peer-b"), Some(Tier::Discovery));
    assert!(a.service.directory().list_provisional().is_empty());
}

/// Repeated cycles never duplicate a device or a peer.
#[tokio::test]
async fn test_rediscovery_is_idempotent() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let _b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;

    for _ in 0..3 {
        a.service.coordinator().run_cycle().await.unwrap();
    }
    assert_eq!(a.service.registry().len(), 1);
    let counts = a.service.directory().counts();
    assert_eq!(counts.discovery, 1);
    assert_eq!(counts.provisional, 0);
}

/// A search error drops the device until a later inquiry finds it again.
#[tokio::test]
async fn test_search_error_requires_rediscovery() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;

    air.script_search(&b.address, SearchOutcome::ERROR);
    a.service.coordinator().run_cycle().await.unwrap();
    assert!(!a.service.registry().contains(&b.address));
    assert!(a.service.directory().lookup("peer-b").is_none());

    air.clear_search_script(&b.address);
    a.service.coordinator().run_cycle().await.unwrap();
    assert!(a.service.registry().contains(&b.address));
    assert!(a.service.directory().lookup("peer-b").is_some());
}

/// A node that does not advertise stays provisional.
#[tokio::test]
async fn test_silent_device_stays_provisional() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    air.add_device(bluepeer_core::Device::new("AA:00:00:00:00:09").with_name("headset"));

    a.service.coordinator().run_cycle().await.unwrap();
    let provisional = a.service.directory().list_provisional();
    assert_eq!(provisional.len(), 1);
    assert_eq!(provisional[0].address, "AA:00:00:00:00:09");
    assert!(provisional[0].is_provisional());
}

/// Directory exchange confirms direct peers and learns peers of peers.
#[tokio::test]
async fn test_exchange_gossips_peers() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;
    let c = awake_node(&air, "AA:00:00:00:00:03", "peer-c").await;

    // B meets C directly, then C goes out of A's range.
    b.service.coordinator().run_cycle().await.unwrap();
    let report = b.service.exchange().exchange_once().await;
    assert_eq!(report.confirmed, 2);
    assert_eq!(b.service.directory().tier("peer-c"), Some(Tier::Confirmed));
    air.set_powered(&c.address, false);

    a.service.coordinator().run_cycle().await.unwrap();
    assert!(a.service.directory().lookup("peer-c").is_none());

    let report = a.service.exchange().exchange_once().await;
    assert_eq!(report.contacted, 1);
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.learned, 1);
    assert_eq!(a.service.directory().tier("peer-b"), Some(Tier::Confirmed));
    assert_eq!(a.service.directory().tier("peer-c"), Some(Tier::PeerOfPeer));
    assert_eq!(a.store.load_peer("peer-b").map(|p| p.address), Some(b.address.clone()));
}

/// Peers that keep failing the exchange are reported stale, not dropped.
#[tokio::test]
async fn test_unreachable_peer_goes_stale() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;

    a.service.coordinator().run_cycle().await.unwrap();
    a.service.exchange().exchange_once().await;
    assert_eq!(a.service.directory().tier("peer-b"), Some(Tier::Confirmed));

    // B leaves; its session to A is torn down with it.
    b.service.sleep().await;
    a.service.sessions().close(&b.address).await;

    let threshold = a.service.config().discovery.stale_after_failures;
    let mut report = ExchangeReport::default();
    for _ in 0..threshold {
        report = a.service.exchange().exchange_once().await;
    }
    assert_eq!(report.failed, 1);
    assert_eq!(report.stale, vec!["peer-b".to_string()]);
    assert_eq!(a.service.directory().tier("peer-b"), Some(Tier::Confirmed));
}
