//! Radio devices as reported by inquiry callbacks and the radio's cache.

use serde::{Deserialize, Serialize};

/// Class-of-device bits reported alongside a discovered device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClass {
    pub major: u32,
    pub minor: u32,
    /// Bitmask of supported service classes.
    pub service_classes: u32,
}

/// A remote radio device.
///
/// The address is the stable hardware id and the only identity a device has
/// until one of its service records resolves a peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    /// Friendly name, if the radio had it cached. Resolving it otherwise
    /// needs a blocking lookup against the remote device.
    pub friendly_name: Option<String>,
    pub authenticated: bool,
    pub encrypted: bool,
    pub trusted: bool,
    pub class: DeviceClass,
}

impl Device {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            friendly_name: None,
            authenticated: false,
            encrypted: false,
            trusted: false,
            class: DeviceClass::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = Some(name.into());
        self
    }

    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }

    /// Apply a rediscovery of the same address.
    ///
    /// Security flags and class bits are last-seen-wins. The friendly name is
    /// first-seen-wins: it is only filled in when still unknown.
    /// Returns true if anything changed.
    pub fn refresh_from(&mut self, seen: &Device) -> bool {
        let before = self.clone();
        self.authenticated = seen.authenticated;
        self.encrypted = seen.encrypted;
        self.trusted = seen.trusted;
        self.class = seen.class;
        if self.friendly_name.is_none() {
            self.friendly_name = seen.friendly_name.clone();
        }
        *self != before
    }

    /// Name to show for this device: the friendly name, else the address.
    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_updates_flags_but_keeps_first_name() {
        let mut known = Device::new("AA:BB:CC:00:11:22").with_name("first");
        let mut seen = Device::new("AA:BB:CC:00:11:22").with_name("second");
        seen.encrypted = true;
        seen.trusted = true;

        assert!(known.refresh_from(&seen));
        assert!(known.encrypted);
        assert!(known.trusted);
        assert_eq!(known.friendly_name.as_deref(), Some("first"));
    }

    #[test]
    fn refresh_fills_missing_name() {
        let mut known = Device::new("AA:BB:CC:00:11:22");
        let seen = Device::new("AA:BB:CC:00:11:22").with_name("phone");
        assert!(known.refresh_from(&seen));
        assert_eq!(known.display_name(), "phone");
    }

    #[test]
    fn identical_rediscovery_is_not_a_change() {
        let mut known = Device::new("AA:BB:CC:00:11:22").with_name("phone");
        let seen = known.clone();
        assert!(!known.refresh_from(&seen));
    }
}
