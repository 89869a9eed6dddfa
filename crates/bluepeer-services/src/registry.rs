//! Device registry: radio address → last known device.
//!
//! Entries are created by inquiry callbacks and the radio's cached device
//! list, refreshed in place on rediscovery, and removed only when a service
//! search on that address fails with an error.

use std::sync::Arc;

use bluepeer_core::Device;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// Already known; `changed` is false when nothing differed.
    Refreshed { changed: bool },
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<DashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<Device> {
        self.devices.get(address).map(|d| d.clone())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.contains_key(address)
    }

    /// Insert a newly seen device or refresh the known one. At most one entry
    /// exists per address.
    pub fn upsert(&self, device: Device) -> Upsert {
        match self.devices.entry(device.address.clone()) {
            Entry::Occupied(mut known) => Upsert::Refreshed {
                changed: known.get_mut().refresh_from(&device),
            },
            Entry::Vacant(slot) => {
                slot.insert(device);
                Upsert::Inserted
            }
        }
    }

    pub fn remove(&self, address: &str) -> Option<Device> {
        self.devices.remove(address).map(|(_, d)| d)
    }

    /// Copy of every known device, sorted by address.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|e| e.value().clone()).collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    /// Seed from the radio's cached device list. Returns how many were new.
    pub fn seed(&self, devices: impl IntoIterator<Item = Device>) -> usize {
        devices
            .into_iter()
            .filter(|d| self.upsert(d.clone()) == Upsert::Inserted)
            .count()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&self) {
        self.devices.clear();
    }
}
