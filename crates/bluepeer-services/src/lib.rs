//! bluepeer-services: the discovery engine: scheduler, registries, the
//! discovery state machine, peer sessions and the host-facing service.

pub mod completion;
pub mod directory;
pub mod discovery;
pub mod exchange;
pub mod power;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod sim;
pub mod status;
pub mod store;
pub mod transport;

pub use directory::{PeerDirectory, Tier};
pub use discovery::DiscoveryCoordinator;
pub use exchange::PeerExchange;
pub use power::{PowerAware, RadioPowerMonitor};
pub use registry::DeviceRegistry;
pub use router::{EnvelopeStore, MessageRouter};
pub use scheduler::{Task, TaskSchedule, TaskScheduler};
pub use service::RadioService;
pub use session::{PeerSession, SessionError, SessionTable};
pub use sim::{MemoryTransport, SimRadio, SimulatedAir};
pub use status::{NetworkState, NetworkStatus, ServiceStatus, SessionStatus, StatusEvent};
pub use store::{JsonPeerStore, MemoryPeerStore, PeerStore};
pub use transport::{Transport, TransportError};
