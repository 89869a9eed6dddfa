//! bluepeer-core: shared types, the radio collaborator interface, and the
//! session wire format. Every other bluepeer crate depends on this one.

pub mod config;
pub mod device;
pub mod envelope;
pub mod peer;
pub mod radio;
pub mod wire;

pub use device::{Device, DeviceClass};
pub use envelope::{Envelope, Route};
pub use peer::{Peer, NETWORK_TAG};
pub use radio::{DiscoveryListener, Radio, RadioError, ServiceRecord};
pub use wire::{Frame, NetOp, Opcode, WireError};
