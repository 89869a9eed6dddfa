//! Peer records: the logical network identity behind a radio device.
//!
//! A peer starts out provisional (known only by its radio address) and is
//! promoted once a service record carries its peer id. Attribute names are
//! part of the directory exchange format and must not change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::Device;

/// Network tag carried by every peer discovered over the radio.
pub const NETWORK_TAG: &str = "short-range-radio";

/// Well-known attribute keys.
pub mod attr {
    pub const IS_AUTHENTICATED: &str = "isAuthenticated";
    pub const IS_ENCRYPTED: &str = "isEncrypted";
    pub const IS_TRUSTED_DEVICE: &str = "isTrustedDevice";
    pub const MAJOR_DEVICE_CLASS: &str = "majorDeviceClass";
    pub const MINOR_DEVICE_CLASS: &str = "minorDeviceClass";
    pub const SERVICE_CLASSES: &str = "serviceClasses";
    pub const SERVICE_URL: &str = "serviceURL";
    pub const SERVICE_NAME: &str = "serviceName";
    pub const UUID: &str = "uuid";

    /// Attributes where a newer observation overwrites the cached value.
    pub const LATEST_WINS: [&str; 2] = [SERVICE_URL, SERVICE_NAME];

    /// Device attributes refreshed on every rediscovery.
    pub const DEVICE_FLAGS: [&str; 3] = [IS_AUTHENTICATED, IS_ENCRYPTED, IS_TRUSTED_DEVICE];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Assigned once a directory service record is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub network: String,
    pub address: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: None,
            display_name: None,
            network: NETWORK_TAG.to_string(),
            address: address.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Build the provisional record for a freshly discovered device.
    pub fn provisional(device: &Device) -> Self {
        let mut peer = Peer::new(device.address.clone());
        peer.display_name = device.friendly_name.clone();
        peer.apply_device_flags(device);
        peer.set_attribute(attr::MAJOR_DEVICE_CLASS, device.class.major);
        peer.set_attribute(attr::MINOR_DEVICE_CLASS, device.class.minor);
        peer.set_attribute(attr::SERVICE_CLASSES, device.class.service_classes);
        peer
    }

    /// Peer id for a node that has none configured: the first 16 hex chars
    /// of the BLAKE3 hash of its radio address.
    pub fn derive_id(address: &str) -> String {
        hex::encode(&blake3::hash(address.as_bytes()).as_bytes()[..8])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_radio_peer(&self) -> bool {
        self.network == NETWORK_TAG
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn service_url(&self) -> Option<&str> {
        self.attribute_str(attr::SERVICE_URL)
    }

    /// Overwrite the trust/encryption flags with the latest observation.
    pub fn apply_device_flags(&mut self, device: &Device) {
        self.set_attribute(attr::IS_AUTHENTICATED, device.authenticated);
        self.set_attribute(attr::IS_ENCRYPTED, device.encrypted);
        self.set_attribute(attr::IS_TRUSTED_DEVICE, device.trusted);
    }

    /// Fold a newer record for the same peer into this one.
    ///
    /// Latest-wins attributes are overwritten; every other attribute is only
    /// added when missing. Identity fields (id, address, display name) keep
    /// their first-seen value. Returns true if anything changed.
    pub fn absorb(&mut self, newer: &Peer) -> bool {
        let mut changed = false;
        for (key, value) in &newer.attributes {
            let latest_wins = attr::LATEST_WINS.contains(&key.as_str());
            match self.attributes.get(key) {
                Some(current) if current == value => {}
                Some(_) if !latest_wins => {}
                _ => {
                    self.attributes.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
        }
        if self.display_name.is_none() && newer.display_name.is_some() {
            self.display_name = newer.display_name.clone();
            changed = true;
        }
        changed
    }

    /// Apply only the latest-wins attributes from a remote record.
    /// Returns true if anything changed.
    pub fn overwrite_latest(&mut self, remote: &Peer) -> bool {
        let mut changed = false;
        for key in attr::LATEST_WINS {
            if let Some(value) = remote.attributes.get(key) {
                if self.attributes.get(key) != Some(value) {
                    self.attributes.insert(key.to_string(), value.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}
