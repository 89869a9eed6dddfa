//! Envelopes: the opaque signed document the session layer carries.
//!
//! The engine never interprets the payload. It only reads the route to find
//! the destination peer and appends error notes when delivery fails.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::Peer;

/// Routing metadata attached to an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Route {
    /// Dispatched to a local service only.
    Simple { service: String, operation: String },
    /// Crosses the radio to another peer.
    External {
        service: String,
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Peer>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<Peer>,
    },
}

impl Route {
    pub fn service(&self) -> &str {
        match self {
            Route::Simple { service, .. } | Route::External { service, .. } => service,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Route::External { .. })
    }

    pub fn destination(&self) -> Option<&Peer> {
        match self {
            Route::External { destination, .. } => destination.as_ref(),
            Route::Simple { .. } => None,
        }
    }

    pub fn origin(&self) -> Option<&Peer> {
        match self {
            Route::External { origin, .. } => origin.as_ref(),
            Route::Simple { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Hex BLAKE3 of the route, payload and creation time.
    pub id: String,
    pub route: Route,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Envelope {
    pub fn new(route: Route, payload: Value) -> Self {
        let created = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut hasher = blake3::Hasher::new();
        hasher.update(route.service().as_bytes());
        hasher.update(payload.to_string().as_bytes());
        hasher.update(&created.to_le_bytes());
        Self {
            id: hex::encode(&hasher.finalize().as_bytes()[..16]),
            route,
            payload,
            errors: Vec::new(),
        }
    }

    /// Envelope addressed to a remote peer.
    pub fn external(
        service: impl Into<String>,
        operation: impl Into<String>,
        origin: Option<Peer>,
        destination: Peer,
        payload: Value,
    ) -> Self {
        Self::new(
            Route::External {
                service: service.into(),
                operation: operation.into(),
                origin,
                destination: Some(destination),
            },
            payload,
        )
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
