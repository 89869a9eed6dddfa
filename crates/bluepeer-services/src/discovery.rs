//! Discovery coordinator: device inquiry and per-device service search.
//!
//! Runs as a scheduled task. Each cycle seeds the registry from the radio's
//! cache, starts an inquiry and waits for the radio to report completion.
//! Cached devices and devices reported during the inquiry are queued and
//! searched one at a time, at most once per cycle, while the inquiry is
//! still running; callbacks only record and enqueue, so the radio's
//! callback thread never waits on a search.
//!
//! Search outcome policy:
//!   completed            → records applied, device kept
//!   terminated           → logged, device kept (retried next cycle)
//!   error                → device removed from the registry
//!   no records / unreachable → logged, device kept, no peer this cycle
//!   unknown code         → logged, nothing changes
//!
//! Only records offering an unauthenticated, unencrypted connection URL are
//! used. That is a compatibility simplification of the radio protocol, not a
//! security boundary.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bluepeer_core::peer::attr;
use bluepeer_core::radio::{
    DataElement, DiscoveryListener, InquiryOutcome, Radio, RadioError, SearchOutcome,
    SecurityMode, ServiceRecord, ATTR_PEER_ID, ATTR_SERVICE_NAME, OBEX_OBJECT_PUSH,
};
use bluepeer_core::{Device, Peer};
use tokio::sync::{mpsc, Mutex};

use crate::completion::{completion, Completer};
use crate::directory::PeerDirectory;
use crate::registry::{DeviceRegistry, Upsert};
use crate::scheduler::Task;

pub const TASK_NAME: &str = "DiscoveryCoordinator";

/// Service classes searched for on every device.
pub const SEARCH_UUIDS: [u16; 1] = [OBEX_OBJECT_PUSH];
/// Attributes requested from every matching record.
pub const SEARCH_ATTRS: [u16; 2] = [ATTR_SERVICE_NAME, ATTR_PEER_ID];

/// Summary of one discovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub seeded: usize,
    pub discovered: usize,
    pub searched: usize,
    pub outcome: InquiryOutcome,
}

pub struct DiscoveryCoordinator {
    radio: Arc<dyn Radio>,
    registry: DeviceRegistry,
    directory: PeerDirectory,
    inquiry_lock: Mutex<()>,
    search_lock: Mutex<()>,
}

impl DiscoveryCoordinator {
    pub fn new(radio: Arc<dyn Radio>, registry: DeviceRegistry, directory: PeerDirectory) -> Self {
        Self {
            radio,
            registry,
            directory,
            inquiry_lock: Mutex::new(()),
            search_lock: Mutex::new(()),
        }
    }

    /// One full cycle: seed, inquire, search every known device once.
    ///
    /// Cached devices are queued before the inquiry starts so a peer that
    /// is no longer discoverable can still be resolved. A radio error while
    /// starting the inquiry or a search aborts the cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, RadioError> {
        let _inquiry = self.inquiry_lock.lock().await;

        let cached = self.radio.cached_devices();
        let seeded = self.registry.seed(cached.iter().cloned());
        let (queue_tx, mut queue) = mpsc::unbounded_channel();
        for device in cached {
            self.directory.upsert_provisional(Peer::provisional(&device));
            let _ = queue_tx.send(device);
        }

        let (completer, completion) = completion();
        let discovered = Arc::new(AtomicUsize::new(0));
        // The radio owns the only listener handle, so a radio that drops it
        // without reporting completion shows up as an abandoned wait.
        let listener = Arc::new(InquiryListener {
            registry: self.registry.clone(),
            directory: self.directory.clone(),
            queue: queue_tx,
            completer,
            discovered: discovered.clone(),
        });
        let started = self.radio.start_inquiry(listener)?;
        let mut searched = HashSet::new();
        if !started {
            tracing::warn!("radio did not start an inquiry");
            while let Ok(device) = queue.try_recv() {
                self.search_once(device, &mut searched).await?;
            }
            return Ok(CycleReport {
                seeded,
                discovered: 0,
                searched: searched.len(),
                outcome: InquiryOutcome::Terminated,
            });
        }
        tracing::debug!(seeded, "inquiry started");

        let wait = completion.wait();
        tokio::pin!(wait);
        let code = loop {
            tokio::select! {
                biased;
                Some(device) = queue.recv() => self.search_once(device, &mut searched).await?,
                done = &mut wait => break done,
            }
        };
        while let Ok(device) = queue.try_recv() {
            self.search_once(device, &mut searched).await?;
        }
        let discovered = discovered.load(Ordering::Relaxed);
        let searched = searched.len();

        let outcome = match code {
            Ok(code) => InquiryOutcome::from_code(code),
            Err(_) => {
                tracing::warn!("inquiry abandoned by the radio");
                InquiryOutcome::Terminated
            }
        };
        match outcome {
            InquiryOutcome::Completed => tracing::info!(discovered, searched, "inquiry completed"),
            InquiryOutcome::Terminated => tracing::info!(discovered, searched, "inquiry terminated"),
            InquiryOutcome::Error => tracing::warn!(discovered, searched, "inquiry error"),
            InquiryOutcome::Unknown(code) => {
                tracing::warn!(code, discovered, "inquiry ended with unknown code")
            }
        }

        Ok(CycleReport {
            seeded,
            discovered,
            searched,
            outcome,
        })
    }

    /// Search `device` unless it was already searched this cycle.
    async fn search_once(
        &self,
        device: Device,
        searched: &mut HashSet<String>,
    ) -> Result<(), RadioError> {
        if !searched.insert(device.address.clone()) {
            return Ok(());
        }
        let address = device.address.clone();
        if let Err(e) = self.search_device(device).await {
            tracing::warn!(address = %address, error = %e, "service search could not start");
            return Err(e);
        }
        Ok(())
    }

    /// Search one device's services and apply the outcome policy. Searches
    /// are serialized across the coordinator.
    pub async fn search_device(&self, device: Device) -> Result<SearchOutcome, RadioError> {
        let _search = self.search_lock.lock().await;
        let device = self.resolve_name(device).await;
        let address = device.address.clone();

        let (completer, completion) = completion();
        let listener = Arc::new(ServiceSearchListener {
            device: device.clone(),
            directory: self.directory.clone(),
            completer,
        });
        let trans_id = self
            .radio
            .search_services(&SEARCH_ATTRS, &SEARCH_UUIDS, &device, listener)?;
        tracing::debug!(address = %address, trans_id, "service search started");

        let outcome = match completion.wait().await {
            Ok(code) => SearchOutcome::from_code(code),
            Err(_) => {
                tracing::warn!(address = %address, "service search abandoned by the radio");
                SearchOutcome::Terminated
            }
        };
        match outcome {
            SearchOutcome::Completed => tracing::debug!(address = %address, "service search completed"),
            SearchOutcome::Terminated => tracing::info!(address = %address, "service search terminated"),
            SearchOutcome::Error => {
                self.registry.remove(&address);
                self.directory.remove_provisional(&address);
                tracing::warn!(address = %address, "service search error, device dropped");
            }
            SearchOutcome::NoRecords => tracing::info!(address = %address, "no matching services"),
            SearchOutcome::DeviceNotReachable => {
                tracing::info!(address = %address, "device not reachable")
            }
            SearchOutcome::Unknown(code) => {
                tracing::warn!(address = %address, code, "service search ended with unknown code")
            }
        }
        Ok(outcome)
    }

    /// Fill in a missing friendly name. The lookup may block for seconds so
    /// it runs off the async workers; failure leaves the address as the name.
    async fn resolve_name(&self, mut device: Device) -> Device {
        if device.friendly_name.is_some() {
            return device;
        }
        let radio = self.radio.clone();
        let address = device.address.clone();
        match tokio::task::spawn_blocking(move || radio.lookup_friendly_name(&address)).await {
            Ok(Ok(name)) => {
                device.friendly_name = Some(name);
                if self.registry.contains(&device.address) {
                    self.registry.upsert(device.clone());
                }
                self.directory.upsert_provisional(Peer::provisional(&device));
            }
            Ok(Err(e)) => tracing::debug!(address = %device.address, error = %e, "name lookup failed"),
            Err(e) => tracing::warn!(address = %device.address, error = %e, "name lookup task failed"),
        }
        device
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }
}

#[async_trait]
impl Task for DiscoveryCoordinator {
    fn name(&self) -> &str {
        TASK_NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        match self.run_cycle().await {
            Ok(_) => Ok(()),
            Err(RadioError::Unavailable) => {
                tracing::warn!("radio unavailable, skipping discovery cycle");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── Radio callbacks ──────────────────────────────────────────────────────────

struct InquiryListener {
    registry: DeviceRegistry,
    directory: PeerDirectory,
    queue: mpsc::UnboundedSender<Device>,
    completer: Completer<i32>,
    discovered: Arc<AtomicUsize>,
}

impl DiscoveryListener for InquiryListener {
    fn device_discovered(&self, device: Device) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
        let address = device.address.clone();
        match self.registry.upsert(device.clone()) {
            Upsert::Inserted => tracing::info!(address = %address, name = device.display_name(), "device discovered"),
            Upsert::Refreshed { changed } => tracing::debug!(address = %address, changed, "device rediscovered"),
        }
        let known = self.registry.get(&address).unwrap_or(device);
        self.directory.upsert_provisional(Peer::provisional(&known));
        if self.queue.send(known).is_err() {
            tracing::debug!(address = %address, "inquiry already finished, search not queued");
        }
    }

    fn inquiry_completed(&self, code: i32) {
        self.completer.complete(code);
    }

    fn services_discovered(&self, _trans_id: u32, _records: Vec<ServiceRecord>) {}

    fn service_search_completed(&self, _trans_id: u32, _code: i32) {}
}

struct ServiceSearchListener {
    device: Device,
    directory: PeerDirectory,
    completer: Completer<i32>,
}

impl ServiceSearchListener {
    fn apply(&self, record: &ServiceRecord) {
        let address = &self.device.address;
        let Some(url) = record.connection_url(SecurityMode::NoAuthNoEncrypt) else {
            tracing::debug!(address = %address, "skipping record without an open connection url");
            return;
        };
        let mut peer = self
            .directory
            .lookup_address(address)
            .unwrap_or_else(|| Peer::provisional(&self.device));
        peer.set_attribute(attr::SERVICE_URL, url);
        if let Some(name) = record.attribute(ATTR_SERVICE_NAME).and_then(DataElement::as_text) {
            peer.set_attribute(attr::SERVICE_NAME, name);
        }
        match record.attribute(ATTR_PEER_ID).and_then(DataElement::as_text) {
            Some(peer_id) if !peer_id.is_empty() => {
                self.directory.promote(peer_id, peer);
            }
            _ => {
                self.directory.upsert_provisional(peer);
            }
        }
    }
}

impl DiscoveryListener for ServiceSearchListener {
    fn device_discovered(&self, _device: Device) {}

    fn inquiry_completed(&self, _code: i32) {}

    fn services_discovered(&self, trans_id: u32, records: Vec<ServiceRecord>) {
        tracing::debug!(address = %self.device.address, trans_id, count = records.len(), "services discovered");
        for record in &records {
            self.apply(record);
        }
    }

    fn service_search_completed(&self, _trans_id: u32, code: i32) {
        self.completer.complete(code);
    }
}
