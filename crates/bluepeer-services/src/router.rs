//! Message router collaborator and an in-memory inbox.

use std::sync::Arc;

use bluepeer_core::Envelope;
use dashmap::DashMap;

/// Accepts envelopes for local dispatch.
pub trait MessageRouter: Send + Sync {
    /// `from` is the sender's peer id when the session surfaced one.
    fn route(&self, from: Option<&str>, envelope: Envelope);
}

/// Router that keeps every delivered envelope, grouped by sender.
/// Envelopes from unidentified senders are grouped under "".
#[derive(Clone, Default)]
pub struct EnvelopeStore {
    envelopes: Arc<DashMap<String, Vec<Envelope>>>,
}

impl EnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelopes received from a peer
    pub fn get(&self, from: &str) -> Vec<Envelope> {
        self.envelopes
            .get(from)
            .map(|envs| envs.clone())
            .unwrap_or_default()
    }

    /// Every envelope, in arrival order per sender
    pub fn all(&self) -> Vec<Envelope> {
        self.envelopes
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.envelopes.iter().map(|e| e.value().len()).sum()
    }

    pub fn clear(&self) {
        self.envelopes.clear();
    }
}

impl MessageRouter for EnvelopeStore {
    fn route(&self, from: Option<&str>, envelope: Envelope) {
        tracing::debug!(from = from.unwrap_or("unknown"), id = %envelope.id, "envelope delivered");
        self.envelopes
            .entry(from.unwrap_or_default().to_string())
            .or_default()
            .push(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluepeer_core::Route;

    fn env(op: &str) -> Envelope {
        Envelope::new(
            Route::Simple { service: "chat".into(), operation: op.into() },
            serde_json::Value::Null,
        )
    }

    #[test]
    fn groups_by_sender() {
        let store = EnvelopeStore::new();
        store.route(Some("peer-1"), env("a"));
        store.route(Some("peer-1"), env("b"));
        store.route(None, env("c"));

        assert_eq!(store.get("peer-1").len(), 2);
        assert_eq!(store.get("").len(), 1);
        assert_eq!(store.count(), 3);

        store.clear();
        assert_eq!(store.count(), 0);
    }
}
