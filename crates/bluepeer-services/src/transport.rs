//! Connection-oriented transport the sessions run over.
//!
//! URLs follow the radio stack's `btgoep://<address>:<channel>` form. A
//! listener advertises a service record for as long as its acceptor lives.

use async_trait::async_trait;
use bluepeer_core::radio::listener_url;
use tokio::io::{AsyncRead, AsyncWrite};

pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// What the local listener advertises in its service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvertisement {
    pub service_uuid: String,
    pub service_name: String,
    /// Published under the peer id attribute so searchers can promote us.
    pub peer_id: String,
}

impl ServiceAdvertisement {
    pub fn url(&self) -> String {
        listener_url(&self.service_uuid, &self.service_name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no service at {0}")]
    NotFound(String),
    #[error("transport closed")]
    Closed,
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<BoxConnection, TransportError>;
    async fn listen(
        &self,
        advertisement: &ServiceAdvertisement,
    ) -> Result<Box<dyn Acceptor>, TransportError>;
}

#[async_trait]
pub trait Acceptor: Send {
    /// Next inbound connection and the remote radio address.
    async fn accept(&mut self) -> Result<(BoxConnection, String), TransportError>;
    /// URL remote peers use to reach this listener.
    fn url(&self) -> &str;
}
