//! Server side of the session protocol, one instance shared by every
//! accepted connection.

use std::sync::Arc;

use bluepeer_core::wire::{
    Frame, NetOp, Opcode, STATUS_BAD_REQUEST, STATUS_INTERNAL_ERROR, STATUS_OK,
};
use bluepeer_core::Envelope;
use bytes::Bytes;

use super::codec::{read_frame, write_frame};
use crate::directory::PeerDirectory;
use crate::router::MessageRouter;
use crate::store::PeerStore;
use crate::transport::BoxConnection;

/// What to do with the connection after replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    Continue,
    Close,
}

pub struct RequestHandler {
    directory: PeerDirectory,
    store: Arc<dyn PeerStore>,
    router: Arc<dyn MessageRouter>,
}

/// Per-connection state.
#[derive(Debug, Default)]
pub struct Inbound {
    pub remote_address: String,
    /// Peer id from the connect request.
    pub remote_id: Option<String>,
}

impl RequestHandler {
    pub fn new(
        directory: PeerDirectory,
        store: Arc<dyn PeerStore>,
        router: Arc<dyn MessageRouter>,
    ) -> Self {
        Self {
            directory,
            store,
            router,
        }
    }

    /// Serve one accepted connection until the peer disconnects or the
    /// stream fails. Never returns an error; failures are logged.
    pub async fn serve(&self, mut conn: BoxConnection, remote_address: String) {
        let mut inbound = Inbound {
            remote_address,
            remote_id: None,
        };
        loop {
            let frame = match read_frame(&mut conn).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!(remote = %inbound.remote_address, "inbound connection closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(remote = %inbound.remote_address, error = %e, "inbound read failed");
                    break;
                }
            };
            let (reply, after) = self.handle(&frame, &mut inbound);
            if let Err(e) = write_frame(&mut conn, &reply).await {
                tracing::warn!(remote = %inbound.remote_address, error = %e, "inbound reply failed");
                break;
            }
            if after == After::Close {
                break;
            }
        }
    }

    pub fn handle(&self, frame: &Frame, inbound: &mut Inbound) -> (Frame, After) {
        match frame.opcode {
            Opcode::Connect => (self.on_connect(frame, inbound), After::Continue),
            Opcode::Put => (self.on_push(frame, inbound), After::Continue),
            Opcode::Get => (self.on_pull(frame, inbound), After::Continue),
            Opcode::Disconnect => {
                tracing::debug!(remote = %inbound.remote_address, "peer disconnected");
                (Frame::response(STATUS_OK, Bytes::new()), After::Close)
            }
            Opcode::Response => {
                tracing::warn!(remote = %inbound.remote_address, "unsolicited response frame");
                (Frame::response(STATUS_BAD_REQUEST, Bytes::new()), After::Continue)
            }
        }
    }

    fn on_connect(&self, frame: &Frame, inbound: &mut Inbound) -> Frame {
        if frame.name.is_empty() {
            tracing::warn!(remote = %inbound.remote_address, "connect without peer id");
            return Frame::response(STATUS_BAD_REQUEST, Bytes::new());
        }
        let known = self
            .directory
            .lookup(&frame.name)
            .or_else(|| self.store.load_peer(&frame.name));
        match known {
            Some(peer) => tracing::info!(
                peer_id = %frame.name,
                address = %peer.address,
                "known peer connected"
            ),
            None => tracing::info!(
                peer_id = %frame.name,
                remote = %inbound.remote_address,
                "unknown peer connected"
            ),
        }
        inbound.remote_id = Some(frame.name.clone());
        Frame::response(STATUS_OK, Bytes::new())
    }

    fn sender<'a>(frame: &'a Frame, inbound: &'a Inbound) -> Option<&'a str> {
        inbound
            .remote_id
            .as_deref()
            .or((!frame.name.is_empty()).then_some(frame.name.as_str()))
    }

    fn on_push(&self, frame: &Frame, inbound: &Inbound) -> Frame {
        match Envelope::from_json(&frame.body) {
            Ok(envelope) => {
                self.router.route(Self::sender(frame, inbound), envelope);
                Frame::response(STATUS_OK, Bytes::new())
            }
            Err(e) => {
                tracing::warn!(remote = %inbound.remote_address, error = %e, "undecodable push");
                Frame::response(STATUS_BAD_REQUEST, Bytes::new())
            }
        }
    }

    fn on_pull(&self, frame: &Frame, inbound: &Inbound) -> Frame {
        match NetOp::from_json(&frame.body) {
            Ok(NetOp::Request { peers, from }) => {
                let report = self.directory.merge_remote(&peers);
                tracing::debug!(
                    remote = %inbound.remote_address,
                    offered = peers.len(),
                    added = report.added,
                    "directory request"
                );
                let reply = NetOp::Reply {
                    peers: self.directory.list_known(),
                    to: from.or_else(|| Self::sender(frame, inbound).map(str::to_string)),
                };
                match reply.to_json() {
                    Ok(body) => Frame::response(STATUS_OK, body),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode directory reply");
                        Frame::response(STATUS_INTERNAL_ERROR, Bytes::new())
                    }
                }
            }
            Ok(NetOp::Reply { .. }) => {
                tracing::warn!(remote = %inbound.remote_address, "directory reply sent as request");
                Frame::response(STATUS_BAD_REQUEST, Bytes::new())
            }
            Err(_) => match Envelope::from_json(&frame.body) {
                Ok(envelope) => {
                    self.router.route(Self::sender(frame, inbound), envelope);
                    Frame::response(STATUS_OK, Bytes::new())
                }
                Err(e) => {
                    tracing::warn!(remote = %inbound.remote_address, error = %e, "undecodable pull");
                    Frame::response(STATUS_BAD_REQUEST, Bytes::new())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::EnvelopeStore;
    use crate::store::MemoryPeerStore;
    use bluepeer_core::peer::attr;
    use bluepeer_core::wire::CONTENT_TYPE;
    use bluepeer_core::{Peer, Route};

    fn handler() -> (RequestHandler, PeerDirectory, EnvelopeStore) {
        let directory = PeerDirectory::new();
        let inbox = EnvelopeStore::new();
        let handler = RequestHandler::new(
            directory.clone(),
            Arc::new(MemoryPeerStore::new()),
            Arc::new(inbox.clone()),
        );
        (handler, directory, inbox)
    }

    fn confirmed(dir: &PeerDirectory, id: &str, address: &str) {
        let mut peer = Peer::new(address);
        peer.set_attribute(attr::SERVICE_URL, format!("btgoep://{address}:1"));
        dir.promote(id, peer);
        dir.confirm(id);
    }

    #[test]
    fn empty_directory_request_returns_confirmed_peers() {
        let (handler, dir, _) = handler();
        confirmed(&dir, "peer-1", "AA");
        confirmed(&dir, "peer-2", "BB");
        dir.upsert_provisional(Peer::new("CC"));

        let body = NetOp::Request { peers: vec![], from: Some("peer-9".into()) }.to_json().unwrap();
        let (reply, after) =
            handler.handle(&Frame::request(Opcode::Get, "peer-9", body), &mut Inbound::default());

        assert_eq!(after, After::Continue);
        assert!(reply.is_ok());
        assert_eq!(reply.content_type, CONTENT_TYPE);
        match NetOp::from_json(&reply.body).unwrap() {
            NetOp::Reply { peers, to } => {
                assert_eq!(peers, dir.list_known());
                assert_eq!(peers.len(), 2);
                assert_eq!(to.as_deref(), Some("peer-9"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn directory_request_merges_offered_peers() {
        let (handler, dir, _) = handler();
        let mut offered = Peer::new("DD").with_id("peer-4");
        offered.set_attribute(attr::SERVICE_URL, "btgoep://DD:1");
        let body = NetOp::Request { peers: vec![offered], from: None }.to_json().unwrap();

        handler.handle(&Frame::request(Opcode::Get, "peer-9", body), &mut Inbound::default());
        assert!(dir.lookup("peer-4").is_some());
        assert!(dir.list_known().is_empty());
    }

    #[test]
    fn connect_records_remote_id() {
        let (handler, _, inbox) = handler();
        let mut inbound = Inbound { remote_address: "AA".into(), remote_id: None };

        let (reply, _) = handler.handle(&Frame::connect(""), &mut inbound);
        assert_eq!(reply.status, STATUS_BAD_REQUEST);

        let (reply, _) = handler.handle(&Frame::connect("peer-1"), &mut inbound);
        assert!(reply.is_ok());
        assert_eq!(inbound.remote_id.as_deref(), Some("peer-1"));

        let env = Envelope::new(
            Route::Simple { service: "chat".into(), operation: "say".into() },
            serde_json::json!({"text": "hi"}),
        );
        let (reply, _) = handler.handle(
            &Frame::request(Opcode::Put, "", env.to_json().unwrap()),
            &mut inbound,
        );
        assert!(reply.is_ok());
        assert_eq!(inbox.get("peer-1"), vec![env]);
    }

    #[test]
    fn garbage_push_is_rejected_and_disconnect_closes() {
        let (handler, _, inbox) = handler();
        let mut inbound = Inbound::default();
        let (reply, _) = handler.handle(
            &Frame::request(Opcode::Put, "peer-1", Bytes::from_static(b"not json")),
            &mut inbound,
        );
        assert_eq!(reply.status, STATUS_BAD_REQUEST);
        assert_eq!(inbox.count(), 0);

        let (reply, after) = handler.handle(&Frame::disconnect("peer-1"), &mut inbound);
        assert!(reply.is_ok());
        assert_eq!(after, After::Close);
    }
}
