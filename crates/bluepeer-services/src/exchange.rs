//! Peer exchange: periodic directory pull-merge with directly seen peers.
//!
//! Every peer with a connection URL is contacted over its session. A
//! successful handshake confirms the peer; the remote directory is merged
//! into ours. Failures are counted per peer and peers past the threshold are
//! reported stale, never dropped here.

use std::sync::Arc;

use async_trait::async_trait;

use crate::directory::PeerDirectory;
use crate::scheduler::Task;
use crate::session::SessionTable;
use crate::store::PeerStore;

pub const TASK_NAME: &str = "PeerExchange";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeReport {
    pub contacted: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub learned: usize,
    /// Ids of peers at or past the failure threshold.
    pub stale: Vec<String>,
}

pub struct PeerExchange {
    directory: PeerDirectory,
    sessions: SessionTable,
    store: Arc<dyn PeerStore>,
    stale_after: u32,
}

impl PeerExchange {
    pub fn new(
        directory: PeerDirectory,
        sessions: SessionTable,
        store: Arc<dyn PeerStore>,
        stale_after: u32,
    ) -> Self {
        Self {
            directory,
            sessions,
            store,
            stale_after,
        }
    }

    pub async fn exchange_once(&self) -> ExchangeReport {
        let mut report = ExchangeReport::default();
        for peer in self.directory.exchange_candidates() {
            let (Some(id), Some(url)) = (peer.id.clone(), peer.service_url().map(str::to_string))
            else {
                continue;
            };
            report.contacted += 1;
            let session = self.sessions.establish(&peer.address, &url, false).await;
            match session.pull_peers(self.directory.list_known()).await {
                Ok(remote) => {
                    self.directory.record_success(&id);
                    if let Some(confirmed) = self.directory.confirm(&id) {
                        self.store.save_peer(&confirmed, false);
                        report.confirmed += 1;
                    }
                    report.learned += self.directory.merge_remote(&remote).added;
                }
                Err(e) => {
                    let failures = self.directory.record_failure(&id);
                    tracing::warn!(peer_id = %id, failures, error = %e, "peer exchange failed");
                    report.failed += 1;
                }
            }
        }
        for peer in self.directory.stale_peers(self.stale_after) {
            if let Some(id) = peer.id {
                tracing::warn!(peer_id = %id, "peer is stale");
                report.stale.push(id);
            }
        }
        if report.contacted > 0 {
            tracing::info!(
                contacted = report.contacted,
                confirmed = report.confirmed,
                failed = report.failed,
                learned = report.learned,
                "peer exchange round"
            );
        }
        report
    }
}

#[async_trait]
impl Task for PeerExchange {
    fn name(&self) -> &str {
        TASK_NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.exchange_once().await;
        Ok(())
    }
}
