//! Peer directory: every peer this node knows about, by tier.
//!
//! - Provisional:    discovered devices without a resolved peer id, by address
//! - Discovery:      resolved peer id, no successful handshake yet
//! - Confirmed:      handshake succeeded, reachable
//! - Peers of peers: learned from a remote directory pull, not seen directly
//!
//! A resolved id lives in exactly one of the last three tiers. All tiers sit
//! behind one lock so a promotion moves a record atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bluepeer_core::peer::attr;
use bluepeer_core::Peer;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tier {
    Provisional,
    Discovery,
    Confirmed,
    PeerOfPeer,
}

/// Result of promoting a provisional peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// First time this id is seen directly.
    New,
    /// Folded into the existing record for this id.
    Merged { url_changed: bool },
    /// The id is our own.
    Ignored,
}

/// Outcome of merging a remote peer list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryCounts {
    pub provisional: usize,
    pub discovery: usize,
    pub confirmed: usize,
    pub peers_of_peers: usize,
}

#[derive(Default)]
struct Tiers {
    local_id: Option<String>,
    provisional: HashMap<String, Peer>,
    discovery: HashMap<String, Peer>,
    confirmed: HashMap<String, Peer>,
    peers_of_peers: HashMap<String, Peer>,
    failures: HashMap<String, u32>,
}

impl Tiers {
    fn resolved_mut(&mut self, id: &str) -> Option<&mut Peer> {
        if self.confirmed.contains_key(id) {
            return self.confirmed.get_mut(id);
        }
        if self.discovery.contains_key(id) {
            return self.discovery.get_mut(id);
        }
        self.peers_of_peers.get_mut(id)
    }

    fn resolved_by_address_mut(&mut self, address: &str) -> Option<&mut Peer> {
        self.confirmed
            .values_mut()
            .chain(self.discovery.values_mut())
            .find(|p| p.address == address)
    }
}

#[derive(Clone, Default)]
pub struct PeerDirectory {
    tiers: Arc<Mutex<Tiers>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tiers> {
        match self.tiers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Our own peer id. Never stored as a remote peer.
    pub fn set_local_id(&self, id: impl Into<String>) {
        let id = id.into();
        let mut t = self.lock();
        t.discovery.remove(&id);
        t.confirmed.remove(&id);
        t.peers_of_peers.remove(&id);
        t.local_id = Some(id);
    }

    /// Record a discovered peer by address.
    ///
    /// Returns true if the address was new. For a known address, device
    /// flags are overwritten and other attributes are merged into whichever
    /// record (provisional or resolved) holds that address.
    pub fn upsert_provisional(&self, peer: Peer) -> bool {
        let mut t = self.lock();
        let known = if t.provisional.contains_key(&peer.address) {
            t.provisional.get_mut(&peer.address)
        } else {
            t.resolved_by_address_mut(&peer.address)
        };
        match known {
            Some(existing) => {
                for key in attr::DEVICE_FLAGS {
                    if let Some(v) = peer.attribute(key) {
                        existing.set_attribute(key, v.clone());
                    }
                }
                existing.absorb(&peer);
                false
            }
            None => {
                tracing::debug!(address = %peer.address, "provisional peer");
                t.provisional.insert(peer.address.clone(), peer);
                true
            }
        }
    }

    /// Promote the peer at `peer.address` to the resolved id `peer_id`.
    ///
    /// Any provisional record for the address is folded in, so exactly one
    /// record remains for the id. A peer learned by gossip moves to the
    /// discovery tier now that it has been seen directly.
    pub fn promote(&self, peer_id: &str, peer: Peer) -> Promotion {
        let mut t = self.lock();
        if t.local_id.as_deref() == Some(peer_id) {
            t.provisional.remove(&peer.address);
            return Promotion::Ignored;
        }

        let mut incoming = match t.provisional.remove(&peer.address) {
            Some(mut provisional) => {
                provisional.absorb(&peer);
                provisional.overwrite_latest(&peer);
                provisional
            }
            None => peer,
        };
        incoming.id = Some(peer_id.to_string());

        if let Some(gossiped) = t.peers_of_peers.remove(peer_id) {
            let mut merged = gossiped;
            let old_url = merged.service_url().map(str::to_string);
            merged.address = incoming.address.clone();
            merged.absorb(&incoming);
            merged.overwrite_latest(&incoming);
            let url_changed = merged.service_url() != old_url.as_deref();
            t.discovery.insert(peer_id.to_string(), merged);
            tracing::info!(peer_id, url_changed, "gossiped peer seen directly");
            return Promotion::Merged { url_changed };
        }

        match t.resolved_mut(peer_id) {
            Some(existing) => {
                let old_url = existing.service_url().map(str::to_string);
                existing.absorb(&incoming);
                existing.overwrite_latest(&incoming);
                let url_changed = existing.service_url() != old_url.as_deref();
                if url_changed {
                    tracing::info!(peer_id, url = ?existing.service_url(), "service url changed");
                }
                Promotion::Merged { url_changed }
            }
            None => {
                tracing::info!(peer_id, address = %incoming.address, "peer promoted");
                t.discovery.insert(peer_id.to_string(), incoming);
                Promotion::New
            }
        }
    }

    /// Move a resolved peer to the confirmed tier after a successful
    /// handshake. Returns the confirmed record.
    pub fn confirm(&self, peer_id: &str) -> Option<Peer> {
        let mut t = self.lock();
        t.failures.remove(peer_id);
        if let Some(peer) = t.confirmed.get(peer_id) {
            return Some(peer.clone());
        }
        let peer = t
            .discovery
            .remove(peer_id)
            .or_else(|| t.peers_of_peers.remove(peer_id))?;
        tracing::info!(peer_id, "peer confirmed");
        t.confirmed.insert(peer_id.to_string(), peer.clone());
        Some(peer)
    }

    pub fn lookup(&self, peer_id: &str) -> Option<Peer> {
        let t = self.lock();
        t.confirmed
            .get(peer_id)
            .or_else(|| t.discovery.get(peer_id))
            .or_else(|| t.peers_of_peers.get(peer_id))
            .cloned()
    }

    /// Record for an address, provisional or resolved.
    pub fn lookup_address(&self, address: &str) -> Option<Peer> {
        let mut t = self.lock();
        if let Some(p) = t.provisional.get(address) {
            return Some(p.clone());
        }
        t.resolved_by_address_mut(address).map(|p| p.clone())
    }

    pub fn tier(&self, peer_id: &str) -> Option<Tier> {
        let t = self.lock();
        if t.confirmed.contains_key(peer_id) {
            Some(Tier::Confirmed)
        } else if t.discovery.contains_key(peer_id) {
            Some(Tier::Discovery)
        } else if t.peers_of_peers.contains_key(peer_id) {
            Some(Tier::PeerOfPeer)
        } else if t.provisional.contains_key(peer_id) {
            Some(Tier::Provisional)
        } else {
            None
        }
    }

    /// Confirmed peers, sorted by id.
    pub fn list_known(&self) -> Vec<Peer> {
        let t = self.lock();
        let mut peers: Vec<Peer> = t.confirmed.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Provisional peers, sorted by address.
    pub fn list_provisional(&self) -> Vec<Peer> {
        let t = self.lock();
        let mut peers: Vec<Peer> = t.provisional.values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Merge peers learned from a remote directory.
    ///
    /// Unknown ids are added as peers of peers. Known ids only take the
    /// latest-wins attributes from the remote record. Peers without an id and
    /// our own record are skipped. Nothing is ever removed.
    pub fn merge_remote(&self, peers: &[Peer]) -> MergeReport {
        let mut report = MergeReport::default();
        let mut t = self.lock();
        for remote in peers {
            let Some(id) = remote.id.as_deref() else {
                report.skipped += 1;
                continue;
            };
            if t.local_id.as_deref() == Some(id) {
                report.skipped += 1;
                continue;
            }
            match t.resolved_mut(id) {
                Some(existing) => {
                    if existing.overwrite_latest(remote) {
                        report.updated += 1;
                    }
                }
                None => {
                    t.peers_of_peers.insert(id.to_string(), remote.clone());
                    report.added += 1;
                }
            }
        }
        if report.added + report.updated > 0 {
            tracing::debug!(added = report.added, updated = report.updated, "merged remote directory");
        }
        report
    }

    /// Count a failed exchange. Returns the consecutive failure count.
    pub fn record_failure(&self, peer_id: &str) -> u32 {
        let mut t = self.lock();
        let count = t.failures.entry(peer_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&self, peer_id: &str) {
        self.lock().failures.remove(peer_id);
    }

    pub fn failures(&self, peer_id: &str) -> u32 {
        self.lock().failures.get(peer_id).copied().unwrap_or(0)
    }

    /// Confirmed peers whose consecutive failures reached `threshold`.
    /// Reported only; the caller decides whether to evict.
    pub fn stale_peers(&self, threshold: u32) -> Vec<Peer> {
        let t = self.lock();
        let mut stale: Vec<Peer> = t
            .confirmed
            .iter()
            .filter(|(id, _)| t.failures.get(*id).copied().unwrap_or(0) >= threshold)
            .map(|(_, p)| p.clone())
            .collect();
        stale.sort_by(|a, b| a.id.cmp(&b.id));
        stale
    }

    /// Caller-driven removal of a resolved peer.
    pub fn evict(&self, peer_id: &str) -> Option<Peer> {
        let mut t = self.lock();
        t.failures.remove(peer_id);
        t.confirmed
            .remove(peer_id)
            .or_else(|| t.discovery.remove(peer_id))
            .or_else(|| t.peers_of_peers.remove(peer_id))
    }

    pub fn remove_provisional(&self, address: &str) -> Option<Peer> {
        self.lock().provisional.remove(address)
    }

    /// Directly seen peers with a connection URL, for directory exchange.
    pub fn exchange_candidates(&self) -> Vec<Peer> {
        let t = self.lock();
        let mut peers: Vec<Peer> = t
            .discovery
            .values()
            .chain(t.confirmed.values())
            .filter(|p| p.service_url().is_some())
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn counts(&self) -> DirectoryCounts {
        let t = self.lock();
        DirectoryCounts {
            provisional: t.provisional.len(),
            discovery: t.discovery.len(),
            confirmed: t.confirmed.len(),
            peers_of_peers: t.peers_of_peers.len(),
        }
    }

    /// Drop every tier except the local id. Used when the radio goes away.
    pub fn clear(&self) {
        let mut t = self.lock();
        let local_id = t.local_id.take();
        *t = Tiers { local_id, ..Tiers::default() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluepeer_core::Device;

    fn resolved(id: &str, address: &str, url: &str) -> Peer {
        let mut p = Peer::new(address).with_id(id);
        p.set_attribute(attr::SERVICE_URL, url);
        p
    }

    #[test]
    fn provisional_merges_into_one_resolved_peer() {
        let dir = PeerDirectory::new();
        assert!(dir.upsert_provisional(Peer::provisional(&Device::new("AA:BB:CC:00:11:22"))));
        assert!(!dir.upsert_provisional(Peer::provisional(&Device::new("AA:BB:CC:00:11:22"))));
        assert_eq!(dir.counts().provisional, 1);

        let mut found = Peer::new("AA:BB:CC:00:11:22");
        found.set_attribute(attr::SERVICE_URL, "btgoep://AA:BB:CC:00:11:22:1105");
        assert_eq!(dir.promote("peer-42", found.clone()), Promotion::New);
        assert_eq!(dir.promote("peer-42", found), Promotion::Merged { url_changed: false });

        let counts = dir.counts();
        assert_eq!(counts.provisional, 0);
        assert_eq!(counts.discovery, 1);
        let peer = dir.lookup("peer-42").unwrap();
        assert_eq!(peer.service_url(), Some("btgoep://AA:BB:CC:00:11:22:1105"));
        assert!(peer.attribute(attr::MAJOR_DEVICE_CLASS).is_some());
    }

    #[test]
    fn promotion_updates_changed_url() {
        let dir = PeerDirectory::new();
        dir.promote("peer-1", resolved("peer-1", "AA", "btgoep://AA:1"));
        dir.confirm("peer-1");
        let outcome = dir.promote("peer-1", resolved("peer-1", "AA", "btgoep://AA:2"));
        assert_eq!(outcome, Promotion::Merged { url_changed: true });
        assert_eq!(dir.lookup("peer-1").unwrap().service_url(), Some("btgoep://AA:2"));
        assert_eq!(dir.tier("peer-1"), Some(Tier::Confirmed));
    }

    #[test]
    fn list_known_returns_confirmed_only() {
        let dir = PeerDirectory::new();
        dir.promote("peer-2", resolved("peer-2", "BB", "btgoep://BB:1"));
        dir.promote("peer-1", resolved("peer-1", "AA", "btgoep://AA:1"));
        assert!(dir.list_known().is_empty());

        dir.confirm("peer-2");
        dir.confirm("peer-1");
        let ids: Vec<_> = dir.list_known().into_iter().filter_map(|p| p.id).collect();
        assert_eq!(ids, vec!["peer-1", "peer-2"]);
    }

    #[test]
    fn merge_remote_is_idempotent() {
        let dir = PeerDirectory::new();
        dir.set_local_id("me");
        dir.promote("peer-1", resolved("peer-1", "AA", "btgoep://AA:1"));

        let remote = vec![
            resolved("peer-1", "AA", "btgoep://AA:9"),
            resolved("peer-3", "CC", "btgoep://CC:1"),
            resolved("me", "00", "btgoep://00:1"),
            Peer::new("DD"),
        ];
        let first = dir.merge_remote(&remote);
        assert_eq!(first, MergeReport { added: 1, updated: 1, skipped: 2 });
        let counts = dir.counts();

        let second = dir.merge_remote(&remote);
        assert_eq!(second, MergeReport { added: 0, updated: 0, skipped: 2 });
        assert_eq!(dir.counts(), counts);
        assert_eq!(dir.lookup("peer-1").unwrap().service_url(), Some("btgoep://AA:9"));
        assert_eq!(dir.tier("peer-3"), Some(Tier::PeerOfPeer));
        assert!(dir.lookup("me").is_none());
    }

    #[test]
    fn gossiped_peer_moves_to_discovery_when_seen() {
        let dir = PeerDirectory::new();
        dir.merge_remote(&[resolved("peer-5", "EE", "btgoep://EE:1")]);
        dir.upsert_provisional(Peer::new("EE"));
        assert_eq!(
            dir.promote("peer-5", resolved("peer-5", "EE", "btgoep://EE:2")),
            Promotion::Merged { url_changed: true }
        );
        assert_eq!(dir.tier("peer-5"), Some(Tier::Discovery));
        assert_eq!(dir.counts().peers_of_peers, 0);
        assert_eq!(dir.counts().provisional, 0);
    }

    #[test]
    fn gossiped_peer_seen_at_same_url_is_unchanged() {
        let dir = PeerDirectory::new();
        dir.merge_remote(&[resolved("peer-6", "FF", "btgoep://FF:1")]);
        assert_eq!(
            dir.promote("peer-6", resolved("peer-6", "FF", "btgoep://FF:1")),
            Promotion::Merged { url_changed: false }
        );
        assert_eq!(dir.tier("peer-6"), Some(Tier::Discovery));
    }

    #[test]
    fn failures_report_stale_without_dropping() {
        let dir = PeerDirectory::new();
        dir.promote("peer-1", resolved("peer-1", "AA", "btgoep://AA:1"));
        dir.confirm("peer-1");
        assert_eq!(dir.record_failure("peer-1"), 1);
        assert_eq!(dir.record_failure("peer-1"), 2);
        assert!(dir.stale_peers(3).is_empty());
        dir.record_failure("peer-1");
        assert_eq!(dir.stale_peers(3).len(), 1);
        assert!(dir.lookup("peer-1").is_some());

        dir.record_success("peer-1");
        assert!(dir.stale_peers(3).is_empty());
        assert!(dir.evict("peer-1").is_some());
        assert!(dir.lookup("peer-1").is_none());
    }

    #[test]
    fn rediscovery_refreshes_flags_of_resolved_peer() {
        let dir = PeerDirectory::new();
        dir.promote("peer-1", resolved("peer-1", "AA", "btgoep://AA:1"));
        let mut device = Device::new("AA");
        device.trusted = true;
        assert!(!dir.upsert_provisional(Peer::provisional(&device)));
        let peer = dir.lookup("peer-1").unwrap();
        assert_eq!(peer.attribute(attr::IS_TRUSTED_DEVICE), Some(&serde_json::Value::from(true)));
        assert_eq!(dir.counts().provisional, 0);
    }
}
