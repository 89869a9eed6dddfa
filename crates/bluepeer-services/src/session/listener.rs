//! Shared inbound listener.
//!
//! One listener per node, leased by every open session and by the service
//! itself while it advertises. The first lease opens the listener and makes
//! the radio discoverable; releasing the last one stops it and hides the
//! radio again.

use std::sync::Arc;

use bluepeer_core::radio::{Discoverable, Radio};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use super::handler::RequestHandler;
use super::SessionError;
use crate::status::{NetworkState, SessionStatus, StatusEvent};
use crate::transport::{Acceptor, ServiceAdvertisement, Transport};

/// Address reported in session events for the shared listener.
pub const LISTENER: &str = "listener";

struct Running {
    leases: usize,
    url: Option<String>,
    task: Option<JoinHandle<()>>,
}

pub struct ListenerHub {
    transport: Arc<dyn Transport>,
    radio: Arc<dyn Radio>,
    handler: Arc<RequestHandler>,
    state: Arc<NetworkState>,
    service_uuid: String,
    service_name: String,
    running: Mutex<Running>,
}

impl ListenerHub {
    pub fn new(
        transport: Arc<dyn Transport>,
        radio: Arc<dyn Radio>,
        handler: Arc<RequestHandler>,
        state: Arc<NetworkState>,
        service_uuid: String,
        service_name: String,
    ) -> Self {
        Self {
            transport,
            radio,
            handler,
            state,
            service_uuid,
            service_name,
            running: Mutex::new(Running {
                leases: 0,
                url: None,
                task: None,
            }),
        }
    }

    /// Take a lease, starting the listener if it is not running.
    pub async fn acquire(&self) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        let alive = running.task.as_ref().is_some_and(|t| !t.is_finished());
        if !alive {
            let advertisement = ServiceAdvertisement {
                service_uuid: self.service_uuid.clone(),
                service_name: self.service_name.clone(),
                peer_id: self.state.local_id(),
            };
            let acceptor = self.transport.listen(&advertisement).await?;
            let url = acceptor.url().to_string();
            if let Err(e) = self.radio.set_discoverable(Discoverable::General) {
                tracing::warn!(error = %e, "could not make radio discoverable");
            }
            tracing::info!(url = %url, "inbound listener started");
            running.task = Some(tokio::spawn(accept_loop(acceptor, self.handler.clone())));
            running.url = Some(url);
            self.state.publish(StatusEvent::Session {
                address: LISTENER.to_string(),
                status: SessionStatus::Connected,
            });
        }
        running.leases += 1;
        Ok(())
    }

    /// Return a lease. The last one stops the listener.
    pub async fn release(&self) {
        let mut running = self.running.lock().await;
        running.leases = running.leases.saturating_sub(1);
        if running.leases > 0 {
            return;
        }
        let Some(task) = running.task.take() else {
            return;
        };
        self.state.publish(StatusEvent::Session {
            address: LISTENER.to_string(),
            status: SessionStatus::Stopping,
        });
        task.abort();
        let _ = task.await;
        running.url = None;
        if let Err(e) = self.radio.set_discoverable(Discoverable::NotDiscoverable) {
            tracing::warn!(error = %e, "could not leave discoverable mode");
        }
        tracing::info!("inbound listener stopped");
        self.state.publish(StatusEvent::Session {
            address: LISTENER.to_string(),
            status: SessionStatus::Disconnected,
        });
    }

    pub async fn is_listening(&self) -> bool {
        self.running
            .lock()
            .await
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub async fn leases(&self) -> usize {
        self.running.lock().await.leases
    }

    /// URL of the running listener.
    pub async fn url(&self) -> Option<String> {
        self.running.lock().await.url.clone()
    }
}

async fn accept_loop(mut acceptor: Box<dyn Acceptor>, handler: Arc<RequestHandler>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = acceptor.accept() => match accepted {
                Ok((conn, remote)) => {
                    tracing::debug!(remote = %remote, "inbound connection");
                    let handler = handler.clone();
                    connections.spawn(async move { handler.serve(conn, remote).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "listener accept failed");
                    break;
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = done {
                    tracing::warn!(error = %e, "inbound connection task failed");
                }
            }
        }
    }
}
