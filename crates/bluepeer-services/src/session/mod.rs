//! Peer sessions: one logical connection per remote radio address.
//!
//! A session lazily opens an outbound connection, handshakes with the local
//! peer id, and then pushes envelopes or pulls the remote directory. All
//! operations on one session are serialized; callers wanting retries
//! re-invoke them.
//!
//! Status: DISCONNECTED → WARMUP (opening) → CONNECTING (handshake) →
//! CONNECTED, and back to DISCONNECTED on close or a failed handshake.

pub mod codec;
pub mod handler;
pub mod listener;

use std::sync::{Arc, Mutex as StdMutex};

use bluepeer_core::wire::{Frame, NetOp, Opcode, WireError};
use bluepeer_core::{Envelope, Peer};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::status::{NetworkState, SessionStatus, StatusEvent};
use crate::transport::{BoxConnection, Transport, TransportError};
use codec::{read_frame, write_frame};
use listener::ListenerHub;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer answered with status 0x{0:02x}")]
    Status(u8),
    #[error("unexpected {0:?} frame in reply")]
    Unexpected(Opcode),
    #[error("session is not open")]
    NotOpen,
}

/// What every session on this node shares.
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub state: Arc<NetworkState>,
    pub listener: Arc<ListenerHub>,
}

pub struct PeerSession {
    address: String,
    url: String,
    ctx: Arc<SessionContext>,
    /// Outbound handle; the lock serializes every operation on the session.
    client: Mutex<Option<BoxConnection>>,
    status: StdMutex<SessionStatus>,
    leased: StdMutex<bool>,
}

impl PeerSession {
    pub fn new(address: impl Into<String>, url: impl Into<String>, ctx: Arc<SessionContext>) -> Self {
        Self {
            address: address.into(),
            url: url.into(),
            ctx,
            client: Mutex::new(None),
            status: StdMutex::new(SessionStatus::Disconnected),
            leased: StdMutex::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().map(|s| *s).unwrap_or(SessionStatus::Disconnected)
    }

    fn set_status(&self, status: SessionStatus) {
        if let Ok(mut current) = self.status.lock() {
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::debug!(address = %self.address, ?status, "session status");
        self.ctx.state.publish(StatusEvent::Session {
            address: self.address.clone(),
            status,
        });
    }

    fn take_lease(&self) -> bool {
        self.leased.lock().map(|mut l| std::mem::replace(&mut *l, true)).unwrap_or(true)
    }

    fn drop_lease(&self) -> bool {
        self.leased.lock().map(|mut l| std::mem::replace(&mut *l, false)).unwrap_or(false)
    }

    /// Open the outbound connection and make sure the shared listener runs.
    pub async fn open(&self) -> Result<(), SessionError> {
        let mut client = self.client.lock().await;
        self.open_locked(&mut client).await
    }

    async fn open_locked(&self, client: &mut Option<BoxConnection>) -> Result<(), SessionError> {
        if client.is_some() {
            return Ok(());
        }
        self.set_status(SessionStatus::Warmup);
        let conn = match self.ctx.transport.connect(&self.url).await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_status(SessionStatus::Disconnected);
                return Err(e.into());
            }
        };
        *client = Some(conn);
        if !self.take_lease() {
            if let Err(e) = self.ctx.listener.acquire().await {
                // Outbound traffic still works without the listener.
                tracing::warn!(error = %e, "inbound listener unavailable");
                self.drop_lease();
            }
        }
        tracing::debug!(address = %self.address, url = %self.url, "session opened");
        Ok(())
    }

    /// Open if needed and handshake with the local peer id.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut client = self.client.lock().await;
        self.connect_locked(&mut client).await
    }

    async fn connect_locked(&self, client: &mut Option<BoxConnection>) -> Result<(), SessionError> {
        if self.status() == SessionStatus::Connected && client.is_some() {
            return Ok(());
        }
        self.open_locked(client).await?;
        self.set_status(SessionStatus::Connecting);
        let hello = Frame::connect(self.ctx.state.local_id());
        match exchange(client, &hello).await {
            Ok(_) => {
                self.set_status(SessionStatus::Connected);
                tracing::info!(address = %self.address, "session connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(address = %self.address, error = %e, "handshake failed");
                *client = None;
                self.set_status(SessionStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Push an envelope, connecting first if needed. Failures are logged and
    /// reported as false. A broken connection is dropped so the next call
    /// reconnects.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        let body = match envelope.to_json() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "envelope not serializable");
                return false;
            }
        };
        let mut client = self.client.lock().await;
        if let Err(e) = self.connect_locked(&mut client).await {
            tracing::warn!(address = %self.address, error = %e, "send: connect failed");
            return false;
        }
        let push = Frame::request(Opcode::Put, self.ctx.state.local_id(), body);
        match exchange(&mut client, &push).await {
            Ok(_) => {
                tracing::debug!(address = %self.address, id = %envelope.id, "envelope sent");
                true
            }
            Err(e) => {
                tracing::warn!(address = %self.address, error = %e, "send failed");
                self.drop_if_broken(&mut client, &e);
                false
            }
        }
    }

    /// Offer `known` to the remote directory and return the peers it knows.
    pub async fn pull_peers(&self, known: Vec<Peer>) -> Result<Vec<Peer>, SessionError> {
        let mut client = self.client.lock().await;
        self.connect_locked(&mut client).await?;
        let local_id = self.ctx.state.local_id();
        let request = NetOp::Request {
            peers: known,
            from: (!local_id.is_empty()).then(|| local_id.clone()),
        };
        let pull = Frame::request(Opcode::Get, local_id, request.to_json()?);
        let reply = match exchange(&mut client, &pull).await {
            Ok(reply) => reply,
            Err(e) => {
                self.drop_if_broken(&mut client, &e);
                return Err(e);
            }
        };
        match NetOp::from_json(&reply.body)? {
            NetOp::Reply { peers, .. } => Ok(peers),
            NetOp::Request { .. } => Err(SessionError::Unexpected(Opcode::Get)),
        }
    }

    /// A transport or framing failure leaves the stream unusable. Status and
    /// unexpected replies keep it, since the peer is still answering.
    fn drop_if_broken(&self, client: &mut Option<BoxConnection>, error: &SessionError) {
        if matches!(error, SessionError::Transport(_) | SessionError::Wire(_)) {
            tracing::debug!(address = %self.address, "dropping broken connection");
            *client = None;
            self.set_status(SessionStatus::Disconnected);
        }
    }

    /// Say goodbye to the peer and drop the outbound connection.
    pub async fn disconnect(&self) {
        let mut client = self.client.lock().await;
        if client.is_some() && self.status() == SessionStatus::Connected {
            let bye = Frame::disconnect(self.ctx.state.local_id());
            if let Err(e) = exchange(&mut client, &bye).await {
                tracing::debug!(address = %self.address, error = %e, "disconnect not acknowledged");
            }
        }
        *client = None;
        self.set_status(SessionStatus::Disconnected);
    }

    /// Tear the session down and give back its listener lease.
    pub async fn close(&self) {
        self.disconnect().await;
        if self.drop_lease() {
            self.ctx.listener.release().await;
        }
        tracing::debug!(address = %self.address, "session closed");
    }
}

/// Send one request and read its response. Non-OK status is an error.
async fn exchange(client: &mut Option<BoxConnection>, request: &Frame) -> Result<Frame, SessionError> {
    let conn = client.as_mut().ok_or(SessionError::NotOpen)?;
    write_frame(conn, request).await?;
    let reply = read_frame(conn).await?.ok_or(TransportError::Closed)?;
    if reply.opcode != Opcode::Response {
        return Err(SessionError::Unexpected(reply.opcode));
    }
    if !reply.is_ok() {
        return Err(SessionError::Status(reply.status));
    }
    Ok(reply)
}

// ── Session table ────────────────────────────────────────────────────────────

/// Sessions by remote radio address, at most one per address.
#[derive(Clone)]
pub struct SessionTable {
    ctx: Arc<SessionContext>,
    sessions: Arc<DashMap<String, Arc<PeerSession>>>,
}

impl SessionTable {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Get or create the session for `address`. A changed URL replaces the
    /// idle session. With `auto_connect` the session is connected before it
    /// is returned; a failed connect is logged and the session returned
    /// anyway.
    pub async fn establish(&self, address: &str, url: &str, auto_connect: bool) -> Arc<PeerSession> {
        let (session, replaced) = {
            let mut replaced = None;
            let session = match self.sessions.entry(address.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(mut e) if e.get().url() != url => {
                    let fresh = Arc::new(PeerSession::new(address, url, self.ctx.clone()));
                    replaced = Some(e.insert(fresh.clone()));
                    fresh
                }
                dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
                dashmap::mapref::entry::Entry::Vacant(e) => e
                    .insert(Arc::new(PeerSession::new(address, url, self.ctx.clone())))
                    .clone(),
            };
            (session, replaced)
        };
        if let Some(old) = replaced {
            tracing::info!(address, url, "service url changed, replacing session");
            old.close().await;
        }
        if auto_connect && session.status() != SessionStatus::Connected {
            if let Err(e) = session.connect().await {
                tracing::warn!(address, error = %e, "auto-connect failed");
            }
        }
        session
    }

    pub fn get(&self, address: &str) -> Option<Arc<PeerSession>> {
        self.sessions.get(address).map(|s| s.clone())
    }

    pub async fn close(&self, address: &str) -> bool {
        match self.sessions.remove(address) {
            Some((_, session)) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<PeerSession>> = self.sessions.iter().map(|s| s.clone()).collect();
        self.sessions.clear();
        for session in sessions {
            session.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
