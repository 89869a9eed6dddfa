//! Simulated radio medium.
//!
//! `SimulatedAir` is a shared in-process "air" holding every simulated node:
//! its device identity, power state, discoverable mode and the service
//! records it advertises. `SimRadio` implements the radio interface against
//! it and delivers discovery callbacks from their own threads, the way a
//! radio stack does. `MemoryTransport` connects sessions over in-memory
//! pipes and publishes a service record for every open listener.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bluepeer_core::radio::{
    DataElement, Discoverable, DiscoveryListener, InquiryOutcome, Radio, RadioError,
    SearchOutcome, SecurityMode, ServiceRecord, ATTR_PEER_ID, ATTR_SERVICE_NAME,
    OBEX_OBJECT_PUSH, URL_SCHEME,
};
use bluepeer_core::Device;
use tokio::sync::mpsc;

use crate::transport::{Acceptor, BoxConnection, ServiceAdvertisement, Transport, TransportError};

const PIPE_CAPACITY: usize = 64 * 1024;

struct SimNode {
    device: Device,
    powered: bool,
    discoverable: Discoverable,
    /// Records by listener URL (or a fixed key for scripted records).
    records: BTreeMap<String, ServiceRecord>,
    /// Addresses this node's radio reports as already known.
    cached: Vec<String>,
}

impl SimNode {
    fn new(device: Device, discoverable: Discoverable) -> Self {
        Self {
            device,
            powered: true,
            discoverable,
            records: BTreeMap::new(),
            cached: Vec::new(),
        }
    }

    fn visible(&self) -> bool {
        self.powered && self.discoverable != Discoverable::NotDiscoverable
    }
}

type Inbound = (tokio::io::DuplexStream, String);

#[derive(Default)]
struct Air {
    nodes: BTreeMap<String, SimNode>,
    listeners: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    search_scripts: HashMap<String, i32>,
    inquiry_script: Option<i32>,
    /// When set, every search start is refused with this reason.
    search_refusal: Option<String>,
    next_channel: u16,
    inquiry_step: Duration,
    name_lookup_delay: Duration,
}

#[derive(Default)]
pub struct SimulatedAir {
    air: Mutex<Air>,
}

impl SimulatedAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Air> {
        match self.air.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a passive device that is powered and discoverable.
    pub fn add_device(&self, device: Device) {
        let address = device.address.clone();
        self.lock()
            .nodes
            .insert(address, SimNode::new(device, Discoverable::General));
    }

    /// Publish a service record on a device.
    pub fn add_record(&self, address: &str, record: ServiceRecord) {
        let mut air = self.lock();
        if let Some(node) = air.nodes.get_mut(address) {
            let key = format!("static-{}", node.records.len());
            node.records.insert(key, record);
        }
    }

    pub fn remove_device(&self, address: &str) {
        self.lock().nodes.remove(address);
    }

    pub fn set_powered(&self, address: &str, powered: bool) {
        if let Some(node) = self.lock().nodes.get_mut(address) {
            node.powered = powered;
        }
    }

    pub fn set_cached(&self, address: &str, cached: Vec<String>) {
        if let Some(node) = self.lock().nodes.get_mut(address) {
            node.cached = cached;
        }
    }

    /// Force every search on `address` to end with `code`.
    pub fn script_search(&self, address: &str, code: i32) {
        self.lock().search_scripts.insert(address.to_string(), code);
    }

    pub fn clear_search_script(&self, address: &str) {
        self.lock().search_scripts.remove(address);
    }

    /// Refuse every service search start, as a stack in the wrong state does.
    pub fn refuse_searches(&self, reason: Option<&str>) {
        self.lock().search_refusal = reason.map(str::to_string);
    }

    /// Force every inquiry to end with `code`.
    pub fn script_inquiry(&self, code: Option<i32>) {
        self.lock().inquiry_script = code;
    }

    /// Pause between inquiry callbacks.
    pub fn set_inquiry_step(&self, step: Duration) {
        self.lock().inquiry_step = step;
    }

    pub fn set_name_lookup_delay(&self, delay: Duration) {
        self.lock().name_lookup_delay = delay;
    }

    pub fn discoverable(&self, address: &str) -> Discoverable {
        self.lock()
            .nodes
            .get(address)
            .map(|n| n.discoverable)
            .unwrap_or_default()
    }

    pub fn records(&self, address: &str) -> Vec<ServiceRecord> {
        self.lock()
            .nodes
            .get(address)
            .map(|n| n.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Radio handle for a local node, created hidden if it does not exist.
    pub fn radio(self: &Arc<Self>, address: &str, name: &str) -> SimRadio {
        self.lock().nodes.entry(address.to_string()).or_insert_with(|| {
            SimNode::new(Device::new(address).with_name(name), Discoverable::NotDiscoverable)
        });
        SimRadio {
            air: self.clone(),
            address: address.to_string(),
            transactions: AtomicU32::new(1),
        }
    }

    pub fn transport(self: &Arc<Self>, address: &str) -> MemoryTransport {
        MemoryTransport {
            air: self.clone(),
            address: address.to_string(),
        }
    }

    fn unregister(&self, address: &str, url: &str) {
        let mut air = self.lock();
        air.listeners.remove(url);
        if let Some(node) = air.nodes.get_mut(address) {
            node.records.remove(url);
        }
    }
}

// ── Radio ────────────────────────────────────────────────────────────────────

pub struct SimRadio {
    air: Arc<SimulatedAir>,
    address: String,
    transactions: AtomicU32,
}

impl SimRadio {
    fn with_node<T>(&self, f: impl FnOnce(&mut SimNode) -> T) -> Result<T, RadioError> {
        let mut air = self.air.lock();
        match air.nodes.get_mut(&self.address) {
            Some(node) if node.powered => Ok(f(node)),
            _ => Err(RadioError::Unavailable),
        }
    }
}

impl Radio for SimRadio {
    fn is_powered(&self) -> bool {
        self.with_node(|_| ()).is_ok()
    }

    fn local_address(&self) -> Result<String, RadioError> {
        self.with_node(|n| n.device.address.clone())
    }

    fn friendly_name(&self) -> Result<String, RadioError> {
        self.with_node(|n| n.device.display_name().to_string())
    }

    fn cached_devices(&self) -> Vec<Device> {
        let air = self.air.lock();
        let Some(node) = air.nodes.get(&self.address) else {
            return Vec::new();
        };
        node.cached
            .iter()
            .filter_map(|a| air.nodes.get(a).map(|n| n.device.clone()))
            .collect()
    }

    fn start_inquiry(&self, listener: Arc<dyn DiscoveryListener>) -> Result<bool, RadioError> {
        self.with_node(|_| ())?;
        let (found, code, step) = {
            let air = self.air.lock();
            let found: Vec<Device> = air
                .nodes
                .values()
                .filter(|n| n.device.address != self.address && n.visible())
                .map(|n| n.device.clone())
                .collect();
            let code = air.inquiry_script.unwrap_or(InquiryOutcome::COMPLETED);
            (found, code, air.inquiry_step)
        };
        std::thread::Builder::new()
            .name("sim-inquiry".into())
            .spawn(move || {
                for device in found {
                    if !step.is_zero() {
                        std::thread::sleep(step);
                    }
                    listener.device_discovered(device);
                }
                listener.inquiry_completed(code);
            })
            .map_err(|e| RadioError::Io(e.to_string()))?;
        Ok(true)
    }

    fn search_services(
        &self,
        _attr_ids: &[u16],
        uuids: &[u16],
        device: &Device,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<u32, RadioError> {
        self.with_node(|_| ())?;
        if let Some(reason) = self.air.lock().search_refusal.clone() {
            return Err(RadioError::State(reason));
        }
        let trans_id = self.transactions.fetch_add(1, Ordering::Relaxed);
        let (records, code) = {
            let air = self.air.lock();
            let records: Vec<ServiceRecord> = match air.nodes.get(&device.address) {
                Some(node) if node.powered => node
                    .records
                    .values()
                    .filter(|r| uuids.is_empty() || uuids.iter().any(|u| r.offers(*u)))
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
            let reachable = air.nodes.get(&device.address).is_some_and(|n| n.powered);
            let code = match air.search_scripts.get(&device.address) {
                Some(code) => *code,
                None if !reachable => SearchOutcome::DEVICE_NOT_REACHABLE,
                None if records.is_empty() => SearchOutcome::NO_RECORDS,
                None => SearchOutcome::COMPLETED,
            };
            (records, code)
        };
        std::thread::Builder::new()
            .name("sim-search".into())
            .spawn(move || {
                if code == SearchOutcome::COMPLETED && !records.is_empty() {
                    listener.services_discovered(trans_id, records);
                }
                listener.service_search_completed(trans_id, code);
            })
            .map_err(|e| RadioError::Io(e.to_string()))?;
        Ok(trans_id)
    }

    fn lookup_friendly_name(&self, address: &str) -> Result<String, RadioError> {
        let delay = self.air.lock().name_lookup_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let air = self.air.lock();
        air.nodes
            .get(address)
            .filter(|n| n.powered)
            .and_then(|n| n.device.friendly_name.clone())
            .ok_or_else(|| RadioError::Io(format!("no name for {address}")))
    }

    fn set_discoverable(&self, mode: Discoverable) -> Result<bool, RadioError> {
        self.with_node(|n| n.discoverable = mode)?;
        Ok(true)
    }

    fn discoverable(&self) -> Discoverable {
        self.with_node(|n| n.discoverable)
            .unwrap_or(Discoverable::NotDiscoverable)
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct MemoryTransport {
    air: Arc<SimulatedAir>,
    address: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<BoxConnection, TransportError> {
        let sender = {
            let air = self.air.lock();
            let powered = air.nodes.get(&self.address).is_some_and(|n| n.powered);
            if !powered {
                return Err(TransportError::Closed);
            }
            air.listeners.get(url).cloned()
        };
        let sender = sender.ok_or_else(|| TransportError::NotFound(url.to_string()))?;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        sender
            .send((server, self.address.clone()))
            .map_err(|_| TransportError::NotFound(url.to_string()))?;
        Ok(Box::new(client))
    }

    async fn listen(
        &self,
        advertisement: &ServiceAdvertisement,
    ) -> Result<Box<dyn Acceptor>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = {
            let mut air = self.air.lock();
            air.next_channel += 1;
            let url = format!("{URL_SCHEME}://{}:{}", self.address, air.next_channel);
            let node = air
                .nodes
                .get_mut(&self.address)
                .filter(|n| n.powered)
                .ok_or(TransportError::Closed)?;
            let mut record = ServiceRecord::new()
                .with_class(OBEX_OBJECT_PUSH)
                .with_url(SecurityMode::NoAuthNoEncrypt, url.clone())
                .with_attribute(
                    ATTR_SERVICE_NAME,
                    DataElement::Text(advertisement.service_name.clone()),
                );
            if !advertisement.peer_id.is_empty() {
                record = record
                    .with_attribute(ATTR_PEER_ID, DataElement::Text(advertisement.peer_id.clone()));
            }
            node.records.insert(url.clone(), record);
            air.listeners.insert(url.clone(), tx);
            url
        };
        Ok(Box::new(MemoryAcceptor {
            air: self.air.clone(),
            address: self.address.clone(),
            url,
            rx,
        }))
    }
}

struct MemoryAcceptor {
    air: Arc<SimulatedAir>,
    address: String,
    url: String,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> Result<(BoxConnection, String), TransportError> {
        let (conn, remote) = self.rx.recv().await.ok_or(TransportError::Closed)?;
        Ok((Box::new(conn), remote))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.air.unregister(&self.address, &self.url);
    }
}
