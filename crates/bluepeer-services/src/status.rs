//! Lifecycle statuses and the shared network state observers watch.

use std::sync::RwLock;
use std::time::Duration;

use bluepeer_core::Peer;
use serde::Serialize;
use tokio::sync::broadcast;

/// Lifecycle of the host-facing radio service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    NotInitialized,
    Initializing,
    Running,
    ShuttingDown,
    Shutdown,
    GracefullyShuttingDown,
    GracefullyShutdown,
}

/// Radio network connectivity as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NetworkStatus {
    Disconnected,
    Warmup,
    Connecting,
    Connected,
    Stopping,
    Stopped,
}

/// Connection status of a single peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Disconnected,
    Warmup,
    Connecting,
    Connected,
    Stopping,
}

impl From<SessionStatus> for NetworkStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Disconnected => NetworkStatus::Disconnected,
            SessionStatus::Warmup => NetworkStatus::Warmup,
            SessionStatus::Connecting => NetworkStatus::Connecting,
            SessionStatus::Connected => NetworkStatus::Connected,
            SessionStatus::Stopping => NetworkStatus::Stopping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatusEvent {
    Service(ServiceStatus),
    Network(NetworkStatus),
    /// A peer session changed state. `address` is the remote radio address,
    /// or "listener" for the shared inbound listener.
    Session { address: String, status: SessionStatus },
}

/// Update intervals published once the radio is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateIntervals {
    pub normal: Duration,
    pub hyper: Duration,
}

/// Node-wide state shared by the service, sessions and tasks.
pub struct NetworkState {
    local_peer: RwLock<Peer>,
    network_status: RwLock<NetworkStatus>,
    intervals: RwLock<UpdateIntervals>,
    events: broadcast::Sender<StatusEvent>,
}

impl NetworkState {
    pub fn new(local_peer: Peer) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            local_peer: RwLock::new(local_peer),
            network_status: RwLock::new(NetworkStatus::Disconnected),
            intervals: RwLock::new(UpdateIntervals::default()),
            events,
        }
    }

    pub fn local_peer(&self) -> Peer {
        match self.local_peer.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Local peer id, or an empty string before identity is resolved.
    pub fn local_id(&self) -> String {
        self.local_peer().id.unwrap_or_default()
    }

    pub fn update_local_peer(&self, f: impl FnOnce(&mut Peer)) {
        match self.local_peer.write() {
            Ok(mut p) => f(&mut p),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network_status.read().map(|s| *s).unwrap_or(NetworkStatus::Disconnected)
    }

    /// Record and publish a network status change. Repeats are not published.
    pub fn set_network_status(&self, status: NetworkStatus) {
        let changed = match self.network_status.write() {
            Ok(mut current) if *current != status => {
                *current = status;
                true
            }
            _ => false,
        };
        if changed {
            tracing::debug!(?status, "network status");
            self.publish(StatusEvent::Network(status));
        }
    }

    pub fn intervals(&self) -> UpdateIntervals {
        self.intervals.read().map(|i| *i).unwrap_or_default()
    }

    pub fn set_intervals(&self, intervals: UpdateIntervals) {
        if let Ok(mut current) = self.intervals.write() {
            *current = intervals;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }
}
