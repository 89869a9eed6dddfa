use crate::*;

use bluepeer_core::peer::attr;
use bluepeer_core::radio::Discoverable;
use bluepeer_core::{Envelope, Peer};
use bluepeer_services::session::handler::RequestHandler;
use bluepeer_services::session::listener::ListenerHub;
use bluepeer_services::session::SessionContext;
use bluepeer_services::{NetworkState, PeerDirectory, PeerSession, SessionStatus, StatusEvent};
use serde_json::json;

/// An envelope addressed to a discovered peer reaches its router, tagged
/// with the sender's id.
#[tokio::test]
async fn test_send_out_delivers_envelope() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;
    a.service.coordinator().run_cycle().await.unwrap();

    let destination = a.service.directory().lookup("peer-b").unwrap();
    let envelope = Envelope::external(
        "messaging",
        "deliver",
        Some(a.service.local_peer()),
        destination,
        json!({"text": "hello"}),
    );
    assert!(a.service.send_out(&envelope).await);

    assert!(wait_for(Duration::from_secs(2), || b.inbox.count() == 1).await);
    let received = b.inbox.get(&a.peer_id);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], envelope);

    let session = a.service.sessions().get(&b.address).unwrap();
    assert_eq!(session.status(), SessionStatus::Connected);

    // The session is reused for the next send.
    let second = Envelope::external(
        "messaging",
        "deliver",
        None,
        a.service.directory().lookup("peer-b").unwrap(),
        json!({"text": "again"}),
    );
    assert!(a.service.send_out(&second).await);
    assert_eq!(a.service.sessions().len(), 1);
    assert!(wait_for(Duration::from_secs(2), || b.inbox.count() == 2).await);
}

/// A destination known only from the envelope is still reachable.
#[tokio::test]
async fn test_send_out_uses_envelope_url() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;

    let mut destination = Peer::new(b.address.clone()).with_id("peer-b");
    let url = b.service.listener().url().await.unwrap();
    destination.set_attribute(attr::SERVICE_URL, url);
    let envelope = Envelope::external("messaging", "deliver", None, destination, json!(1));

    assert!(a.service.handle_document(envelope).await);
    assert!(wait_for(Duration::from_secs(2), || b.inbox.count() == 1).await);
    assert_eq!(a.inbox.count(), 0);
}

/// Send to a peer that went away fails and comes back to the local router.
#[tokio::test]
async fn test_undeliverable_document_returns_locally() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;
    a.service.coordinator().run_cycle().await.unwrap();
    let destination = a.service.directory().lookup("peer-b").unwrap();

    air.set_powered(&b.address, false);
    b.service.sleep().await;

    let envelope = Envelope::external("messaging", "deliver", None, destination, json!(2));
    assert!(!a.service.handle_document(envelope.clone()).await);

    let returned = a.inbox.all();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].id, envelope.id);
    assert_eq!(returned[0].errors, vec!["Bluetooth Send Out Failed".to_string()]);
    assert_eq!(a.service.directory().failures("peer-b"), 1);
}

/// A sender without a peer id is refused at the handshake: the send fails,
/// the session ends up disconnected, and it passed through warmup and
/// connecting on the way.
#[tokio::test]
async fn test_refused_handshake_leaves_session_disconnected() {
    let air = SimulatedAir::new();
    let b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;
    let url = b.service.listener().url().await.unwrap();

    // A bare node whose local peer has no id yet.
    let address = "AA:00:00:00:00:01";
    let radio = Arc::new(air.radio(address, "anonymous"));
    let transport = Arc::new(air.transport(address));
    let state = Arc::new(NetworkState::new(Peer::new(address)));
    let handler = Arc::new(RequestHandler::new(
        PeerDirectory::new(),
        Arc::new(MemoryPeerStore::new()),
        Arc::new(EnvelopeStore::new()),
    ));
    let listener = Arc::new(ListenerHub::new(
        transport.clone(),
        radio,
        handler,
        state.clone(),
        "0001".into(),
        "anon".into(),
    ));
    let ctx = Arc::new(SessionContext {
        transport,
        state: state.clone(),
        listener: listener.clone(),
    });
    let mut events = state.subscribe();

    let session = PeerSession::new(b.address.clone(), url, ctx);
    assert_eq!(session.status(), SessionStatus::Disconnected);
    let envelope = Envelope::external(
        "messaging",
        "deliver",
        None,
        Peer::new(b.address.clone()).with_id("peer-b"),
        json!({}),
    );
    assert!(!session.send(&envelope).await);
    assert_eq!(session.status(), SessionStatus::Disconnected);
    assert_eq!(b.inbox.count(), 0);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StatusEvent::Session { address, status } = event {
            if address == b.address {
                seen.push(status);
            }
        }
    }
    assert_eq!(
        seen,
        vec![
            SessionStatus::Warmup,
            SessionStatus::Connecting,
            SessionStatus::Disconnected
        ]
    );

    // Opening the session started our own listener; closing releases it.
    assert!(listener.is_listening().await);
    assert_eq!(air.discoverable(address), Discoverable::General);
    session.close().await;
    assert!(!listener.is_listening().await);
    assert_eq!(air.discoverable(address), Discoverable::NotDiscoverable);
}

/// Closing the last session keeps the radio discoverable while the service
/// itself still advertises.
#[tokio::test]
async fn test_listener_outlives_sessions_while_advertising() {
    let air = SimulatedAir::new();
    let a = awake_node(&air, "AA:00:00:00:00:01", "peer-a").await;
    let _b = awake_node(&air, "AA:00:00:00:00:02", "peer-b").await;
    a.service.coordinator().run_cycle().await.unwrap();
    a.service.exchange().exchange_once().await;
    assert_eq!(a.service.listener().leases().await, 2);

    a.service.sessions().close_all().await;
    assert_eq!(a.service.listener().leases().await, 1);
    assert!(a.service.listener().is_listening().await);
    assert_eq!(air.discoverable(&a.address), Discoverable::General);
}
