//! Radio service: the host-facing lifecycle of the engine.
//!
//! The service owns every engine component and wires them together. It does
//! nothing on its own until the power monitor sees the radio come up: then
//! `awaken` resolves the local identity, starts discovery and the peer
//! exchange, and opens the inbound listener. Power loss calls `sleep`, which
//! stops discovery and tears down every session.
//!
//! Lifecycle: NotInitialized → Initializing → Running, then either
//! GracefullyShuttingDown → GracefullyShutdown (`stop`) or
//! ShuttingDown → Shutdown (`shutdown`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluepeer_core::config::BluepeerConfig;
use bluepeer_core::peer::attr;
use bluepeer_core::radio::Radio;
use bluepeer_core::{Envelope, Peer, NETWORK_TAG};
use tokio::sync::broadcast;

use crate::directory::PeerDirectory;
use crate::discovery::{self, DiscoveryCoordinator};
use crate::exchange::{self, PeerExchange};
use crate::power::{PowerAware, RadioPowerMonitor};
use crate::registry::DeviceRegistry;
use crate::router::MessageRouter;
use crate::scheduler::{Task, TaskSchedule, TaskScheduler};
use crate::session::handler::RequestHandler;
use crate::session::listener::ListenerHub;
use crate::session::{SessionContext, SessionTable};
use crate::status::{NetworkState, NetworkStatus, ServiceStatus, StatusEvent, UpdateIntervals};
use crate::store::PeerStore;
use crate::transport::Transport;

/// Error note added to an envelope that could not be delivered.
pub const SEND_OUT_FAILED: &str = "Bluetooth Send Out Failed";

pub struct RadioService {
    config: BluepeerConfig,
    radio: Arc<dyn Radio>,
    state: Arc<NetworkState>,
    registry: DeviceRegistry,
    directory: PeerDirectory,
    store: Arc<dyn PeerStore>,
    router: Arc<dyn MessageRouter>,
    scheduler: TaskScheduler,
    sessions: SessionTable,
    listener: Arc<ListenerHub>,
    coordinator: Arc<DiscoveryCoordinator>,
    exchange: Arc<PeerExchange>,
    status: Mutex<ServiceStatus>,
    /// Whether the service holds its own listener lease.
    advertising: AtomicBool,
    awake: AtomicBool,
}

impl RadioService {
    pub fn new(
        config: BluepeerConfig,
        radio: Arc<dyn Radio>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PeerStore>,
        router: Arc<dyn MessageRouter>,
    ) -> Arc<Self> {
        let mut local = store
            .local_peer()
            .unwrap_or_else(|| Peer::new(String::new()));
        if !config.identity.peer_id.is_empty() {
            local.id = Some(config.identity.peer_id.clone());
        }
        let state = Arc::new(NetworkState::new(local.clone()));

        let registry = DeviceRegistry::new();
        let directory = PeerDirectory::new();
        if let Some(id) = &local.id {
            directory.set_local_id(id.clone());
        }
        restore_peers(store.as_ref(), &directory);

        let handler = Arc::new(RequestHandler::new(
            directory.clone(),
            store.clone(),
            router.clone(),
        ));
        let listener = Arc::new(ListenerHub::new(
            transport.clone(),
            radio.clone(),
            handler,
            state.clone(),
            config.identity.service_uuid.clone(),
            config.identity.service_name.clone(),
        ));
        let sessions = SessionTable::new(Arc::new(SessionContext {
            transport,
            state: state.clone(),
            listener: listener.clone(),
        }));
        let coordinator = Arc::new(DiscoveryCoordinator::new(
            radio.clone(),
            registry.clone(),
            directory.clone(),
        ));
        let exchange = Arc::new(PeerExchange::new(
            directory.clone(),
            sessions.clone(),
            store.clone(),
            config.discovery.stale_after_failures,
        ));
        let scheduler = TaskScheduler::new(&config.scheduler);

        Arc::new(Self {
            config,
            radio,
            state,
            registry,
            directory,
            store,
            router,
            scheduler,
            sessions,
            listener,
            coordinator,
            exchange,
            status: Mutex::new(ServiceStatus::NotInitialized),
            advertising: AtomicBool::new(false),
            awake: AtomicBool::new(false),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Start watching the radio. Discovery begins once it is powered.
    pub fn start(self: &Arc<Self>) -> bool {
        if matches!(self.status(), ServiceStatus::Initializing | ServiceStatus::Running) {
            return true;
        }
        self.set_status(ServiceStatus::Initializing);
        let target: Arc<dyn PowerAware> = self.clone();
        let monitor = RadioPowerMonitor::new(self.radio.clone(), Arc::downgrade(&target));
        let schedule = TaskSchedule::every(self.config.discovery.power_poll());
        if let Err(e) = self.scheduler.register(Arc::new(monitor), schedule) {
            tracing::warn!(error = %e, "power monitor not registered");
        }
        self.scheduler.start();
        self.set_status(ServiceStatus::Running);
        tracing::info!("radio service started");
        true
    }

    /// Graceful stop: wait for in-flight tasks, then tear everything down.
    pub async fn stop(&self) -> bool {
        self.set_status(ServiceStatus::GracefullyShuttingDown);
        self.state.set_network_status(NetworkStatus::Stopping);
        let removals = self
            .scheduler
            .task_names()
            .into_iter()
            .map(|name| async move { self.scheduler.remove(&name, true).await });
        futures::future::join_all(removals).await;
        self.teardown().await;
        self.scheduler.shutdown();
        self.state.set_network_status(NetworkStatus::Stopped);
        self.set_status(ServiceStatus::GracefullyShutdown);
        tracing::info!("radio service stopped");
        true
    }

    /// Immediate stop: in-flight tasks are aborted.
    pub async fn shutdown(&self) -> bool {
        self.set_status(ServiceStatus::ShuttingDown);
        self.state.set_network_status(NetworkStatus::Stopping);
        self.scheduler.shutdown();
        self.teardown().await;
        self.state.set_network_status(NetworkStatus::Stopped);
        self.set_status(ServiceStatus::Shutdown);
        tracing::info!("radio service shut down");
        true
    }

    pub async fn restart(self: &Arc<Self>) -> bool {
        self.stop().await && self.start()
    }

    async fn teardown(&self) {
        self.awake.store(false, Ordering::SeqCst);
        self.sessions.close_all().await;
        if self.advertising.swap(false, Ordering::SeqCst) {
            self.listener.release().await;
        }
    }

    /// Resolve the local peer from the radio and persist it.
    fn resolve_identity(&self, address: &str, friendly_name: &str) -> Peer {
        let configured = &self.config.identity.peer_id;
        let service_uuid = &self.config.identity.service_uuid;
        self.state.update_local_peer(|peer| {
            let moved = peer.address != address;
            peer.address = address.to_string();
            peer.display_name = Some(friendly_name.to_string());
            if moved || peer.attribute_str(attr::UUID).is_none() {
                peer.set_attribute(attr::UUID, service_uuid.as_str());
            }
            if !configured.is_empty() {
                peer.id = Some(configured.clone());
            } else if peer.id.is_none() {
                peer.id = Some(Peer::derive_id(address));
            }
        });
        let local = self.state.local_peer();
        if let Some(id) = &local.id {
            self.directory.set_local_id(id.clone());
        }
        self.store.save_peer(&local, true);
        local
    }

    fn start_discovery(&self) {
        let discovery = &self.config.discovery;
        let coordinator: Arc<dyn Task> = self.coordinator.clone();
        if !self.scheduler.is_registered(discovery::TASK_NAME) {
            let schedule = TaskSchedule::every(discovery.interval()).long_running();
            if let Err(e) = self.scheduler.register(coordinator, schedule) {
                tracing::warn!(error = %e, "discovery not scheduled");
            }
        }
        let exchange: Arc<dyn Task> = self.exchange.clone();
        if !self.scheduler.is_registered(exchange::TASK_NAME) {
            let schedule = TaskSchedule::every(discovery.exchange_interval())
                .with_delay(discovery.exchange_interval());
            if let Err(e) = self.scheduler.register(exchange, schedule) {
                tracing::warn!(error = %e, "peer exchange not scheduled");
            }
        }
    }

    async fn stop_discovery(&self, graceful: bool) {
        futures::future::join(
            self.scheduler.remove(discovery::TASK_NAME, graceful),
            self.scheduler.remove(exchange::TASK_NAME, graceful),
        )
        .await;
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Deliver an envelope to the peer named by its route. Returns false on
    /// any failure; nothing is retried.
    pub async fn send_out(&self, envelope: &Envelope) -> bool {
        if !envelope.route.is_external() {
            tracing::warn!(id = %envelope.id, "send out: route is not external");
            return false;
        }
        let Some(destination) = envelope.route.destination() else {
            tracing::warn!(id = %envelope.id, "send out: no destination");
            return false;
        };
        if destination.network != NETWORK_TAG {
            tracing::warn!(
                id = %envelope.id,
                network = %destination.network,
                "send out: destination is on another network"
            );
            return false;
        }
        if !self.is_awake() {
            tracing::warn!(id = %envelope.id, "send out: radio is not up");
            return false;
        }
        let known = destination
            .id
            .as_deref()
            .and_then(|id| self.directory.lookup(id));
        let url = known
            .as_ref()
            .and_then(|p| p.service_url())
            .or_else(|| destination.service_url())
            .map(str::to_string);
        let Some(url) = url else {
            tracing::warn!(id = %envelope.id, address = %destination.address, "send out: no service url");
            return false;
        };
        let address = known
            .as_ref()
            .map(|p| p.address.clone())
            .unwrap_or_else(|| destination.address.clone());

        let session = self.sessions.establish(&address, &url, true).await;
        let sent = session.send(envelope).await;
        if let Some(id) = destination.id.as_deref() {
            if sent {
                self.directory.record_success(id);
            } else {
                self.directory.record_failure(id);
            }
        }
        sent
    }

    /// Send out, or hand the envelope back to the local router with an
    /// error note.
    pub async fn handle_document(&self, mut envelope: Envelope) -> bool {
        if self.send_out(&envelope).await {
            return true;
        }
        envelope.add_error(SEND_OUT_FAILED);
        self.router.route(None, envelope);
        false
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn status(&self) -> ServiceStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ServiceStatus::NotInitialized)
    }

    fn set_status(&self, status: ServiceStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
        tracing::debug!(?status, "service status");
        self.state.publish(StatusEvent::Service(status));
    }

    pub fn is_awake(&self) -> bool {
        self.awake.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &BluepeerConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<NetworkState> {
        &self.state
    }

    pub fn local_peer(&self) -> Peer {
        self.state.local_peer()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn listener(&self) -> &Arc<ListenerHub> {
        &self.listener
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &Arc<DiscoveryCoordinator> {
        &self.coordinator
    }

    pub fn exchange(&self) -> &Arc<PeerExchange> {
        &self.exchange
    }
}

#[async_trait]
impl PowerAware for RadioService {
    async fn awaken(&self) -> bool {
        let identity = self
            .radio
            .local_address()
            .and_then(|address| Ok((address, self.radio.friendly_name()?)));
        let (address, friendly_name) = match identity {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "radio identity unavailable");
                self.state.set_network_status(NetworkStatus::Disconnected);
                return false;
            }
        };
        let local = self.resolve_identity(&address, &friendly_name);
        self.state.set_intervals(UpdateIntervals {
            normal: std::time::Duration::from_secs(self.config.network.update_interval_secs),
            hyper: std::time::Duration::from_secs(self.config.network.update_interval_hyper_secs),
        });
        self.state.set_network_status(NetworkStatus::Connecting);
        self.start_discovery();
        if self.config.discovery.advertise_on_awaken && !self.advertising.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.listener.acquire().await {
                tracing::warn!(error = %e, "inbound listener not started");
                self.advertising.store(false, Ordering::SeqCst);
            }
        }
        self.awake.store(true, Ordering::SeqCst);
        self.state.set_network_status(NetworkStatus::Connected);
        tracing::info!(
            address = %address,
            name = %friendly_name,
            peer_id = local.id.as_deref().unwrap_or_default(),
            "radio service awake"
        );
        true
    }

    async fn sleep(&self) -> bool {
        self.state.set_network_status(NetworkStatus::Stopping);
        self.stop_discovery(false).await;
        self.teardown().await;
        // Nothing seen over the air survives the radio; persisted peers do.
        self.registry.clear();
        self.directory.clear();
        restore_peers(self.store.as_ref(), &self.directory);
        self.state.set_network_status(NetworkStatus::Disconnected);
        tracing::info!("radio service asleep");
        true
    }
}

/// Load persisted peers into the directory. Returns how many were restored.
fn restore_peers(store: &dyn PeerStore, directory: &PeerDirectory) -> usize {
    let mut restored = 0;
    for peer in store.peers() {
        if let Some(id) = peer.id.clone() {
            directory.promote(&id, peer);
            restored += 1;
        }
    }
    if restored > 0 {
        tracing::info!(peers = restored, "restored known peers");
    }
    restored
}
