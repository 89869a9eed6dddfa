//! Radio collaborator interface.
//!
//! The radio stack is callback driven: inquiry and service search are started
//! with a listener and report results from a stack-owned thread. Result codes
//! and attribute ids follow the values short-range radio stacks report, so a
//! hardware binding can pass them through untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::Device;

// ── Profiles and attributes ──────────────────────────────────────────────────

/// Object push profile, the service class every node advertises.
pub const OBEX_OBJECT_PUSH: u16 = 0x1105;
pub const OBEX_FILE_TRANSFER: u16 = 0x1106;

/// Service name attribute in a service record.
pub const ATTR_SERVICE_NAME: u16 = 0x0100;
/// Custom attribute carrying the advertising node's peer id.
pub const ATTR_PEER_ID: u16 = 0x5555;

/// URL scheme of the session transport.
pub const URL_SCHEME: &str = "btgoep";

/// Listener URL for the local node's advertised service.
pub fn listener_url(service_uuid: &str, service_name: &str) -> String {
    format!("{URL_SCHEME}://localhost:{service_uuid};name={service_name}")
}

// ── Result codes ─────────────────────────────────────────────────────────────

/// How an inquiry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InquiryOutcome {
    Completed,
    Terminated,
    Error,
    Unknown(i32),
}

impl InquiryOutcome {
    pub const COMPLETED: i32 = 0x00;
    pub const TERMINATED: i32 = 0x05;
    pub const ERROR: i32 = 0x07;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::COMPLETED => Self::Completed,
            Self::TERMINATED => Self::Terminated,
            Self::ERROR => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Completed => Self::COMPLETED,
            Self::Terminated => Self::TERMINATED,
            Self::Error => Self::ERROR,
            Self::Unknown(c) => c,
        }
    }
}

/// How a service search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Completed,
    Terminated,
    Error,
    NoRecords,
    DeviceNotReachable,
    Unknown(i32),
}

impl SearchOutcome {
    pub const COMPLETED: i32 = 0x01;
    pub const TERMINATED: i32 = 0x02;
    pub const ERROR: i32 = 0x03;
    pub const NO_RECORDS: i32 = 0x04;
    pub const DEVICE_NOT_REACHABLE: i32 = 0x06;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::COMPLETED => Self::Completed,
            Self::TERMINATED => Self::Terminated,
            Self::ERROR => Self::Error,
            Self::NO_RECORDS => Self::NoRecords,
            Self::DEVICE_NOT_REACHABLE => Self::DeviceNotReachable,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Completed => Self::COMPLETED,
            Self::Terminated => Self::TERMINATED,
            Self::Error => Self::ERROR,
            Self::NoRecords => Self::NO_RECORDS,
            Self::DeviceNotReachable => Self::DEVICE_NOT_REACHABLE,
            Self::Unknown(c) => c,
        }
    }
}

// ── Discoverability ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Discoverable {
    #[default]
    NotDiscoverable,
    /// General inquiry access code.
    General,
    /// Limited inquiry access code.
    Limited,
}

// ── Service records ──────────────────────────────────────────────────────────

/// Security requirements encoded in a connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityMode {
    NoAuthNoEncrypt,
    AuthNoEncrypt,
    AuthEncrypt,
}

/// A typed attribute value from a service record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataElement {
    Text(String),
    Uint(u64),
    Bool(bool),
}

impl DataElement {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataElement::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One service advertised by a remote device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Connection URLs keyed by the security mode they require.
    pub urls: BTreeMap<SecurityMode, String>,
    pub service_classes: Vec<u16>,
    pub attributes: BTreeMap<u16, DataElement>,
}

impl ServiceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, mode: SecurityMode, url: impl Into<String>) -> Self {
        self.urls.insert(mode, url.into());
        self
    }

    pub fn with_class(mut self, class: u16) -> Self {
        self.service_classes.push(class);
        self
    }

    pub fn with_attribute(mut self, id: u16, value: DataElement) -> Self {
        self.attributes.insert(id, value);
        self
    }

    /// Connection URL for the given security mode, if the record offers it.
    pub fn connection_url(&self, mode: SecurityMode) -> Option<&str> {
        self.urls.get(&mode).map(String::as_str)
    }

    pub fn attribute(&self, id: u16) -> Option<&DataElement> {
        self.attributes.get(&id)
    }

    pub fn offers(&self, class: u16) -> bool {
        self.service_classes.contains(&class)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum RadioError {
    /// Powered off or no stack present.
    #[error("radio unavailable")]
    Unavailable,
    /// The stack refused the call in its current state.
    #[error("radio state: {0}")]
    State(String),
    #[error("radio i/o: {0}")]
    Io(String),
}

// ── Collaborator traits ──────────────────────────────────────────────────────

/// Receives asynchronous discovery results. Called from radio-owned threads,
/// so implementations must not block on anything the caller of
/// `start_inquiry` / `search_services` may be holding.
pub trait DiscoveryListener: Send + Sync {
    fn device_discovered(&self, device: Device);
    fn inquiry_completed(&self, code: i32);
    fn services_discovered(&self, trans_id: u32, records: Vec<ServiceRecord>);
    fn service_search_completed(&self, trans_id: u32, code: i32);
}

pub trait Radio: Send + Sync {
    fn is_powered(&self) -> bool;
    fn local_address(&self) -> Result<String, RadioError>;
    fn friendly_name(&self) -> Result<String, RadioError>;
    /// Devices the stack already knows about, without an inquiry.
    fn cached_devices(&self) -> Vec<Device>;
    /// Start an inquiry. Returns false if the stack did not start one.
    fn start_inquiry(&self, listener: Arc<dyn DiscoveryListener>) -> Result<bool, RadioError>;
    /// Start a service search on `device`; returns the transaction id.
    fn search_services(
        &self,
        attr_ids: &[u16],
        uuids: &[u16],
        device: &Device,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<u32, RadioError>;
    /// Ask the remote device for its friendly name. May block for seconds.
    fn lookup_friendly_name(&self, address: &str) -> Result<String, RadioError>;
    fn set_discoverable(&self, mode: Discoverable) -> Result<bool, RadioError>;
    fn discoverable(&self) -> Discoverable;
}
