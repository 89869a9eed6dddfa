//! Peer persistence.
//!
//! The directory only caches; the store is what survives a restart. When
//! backed by a file, the whole store is written on every save and reloaded
//! on construction. Persistence is best-effort: failures are logged and the
//! in-memory copy stays authoritative.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bluepeer_core::Peer;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub trait PeerStore: Send + Sync {
    fn load_peer(&self, id: &str) -> Option<Peer>;
    /// Save a peer. `is_local` marks the record describing this node.
    fn save_peer(&self, peer: &Peer, is_local: bool);
    fn local_peer(&self) -> Option<Peer>;
    /// Every saved remote peer, sorted by id.
    fn peers(&self) -> Vec<Peer>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryPeerStore {
    peers: Arc<DashMap<String, Peer>>,
    local: Arc<RwLock<Option<Peer>>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> StoreFile {
        StoreFile {
            local: self.local_peer(),
            peers: self.peers(),
        }
    }

    fn restore(&self, file: StoreFile) -> usize {
        if let Ok(mut local) = self.local.write() {
            *local = file.local;
        }
        let mut loaded = 0;
        for peer in file.peers {
            if let Some(id) = peer.id.clone() {
                self.peers.insert(id, peer);
                loaded += 1;
            }
        }
        loaded
    }
}

impl PeerStore for MemoryPeerStore {
    fn load_peer(&self, id: &str) -> Option<Peer> {
        if let Some(peer) = self.peers.get(id) {
            return Some(peer.clone());
        }
        self.local_peer().filter(|p| p.id.as_deref() == Some(id))
    }

    fn save_peer(&self, peer: &Peer, is_local: bool) {
        if is_local {
            if let Ok(mut local) = self.local.write() {
                *local = Some(peer.clone());
            }
            return;
        }
        match peer.id.clone() {
            Some(id) => {
                self.peers.insert(id, peer.clone());
            }
            None => tracing::debug!(address = %peer.address, "not saving peer without id"),
        }
    }

    fn local_peer(&self) -> Option<Peer> {
        self.local.read().ok().and_then(|l| l.clone())
    }

    fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}

// ── JSON file ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    local: Option<Peer>,
    #[serde(default)]
    peers: Vec<Peer>,
}

/// Write-through JSON file store.
#[derive(Clone)]
pub struct JsonPeerStore {
    memory: MemoryPeerStore,
    path: Arc<PathBuf>,
}

impl JsonPeerStore {
    /// Open the store at `path`, loading existing peers if the file exists.
    pub fn open(path: PathBuf) -> Self {
        let store = Self {
            memory: MemoryPeerStore::new(),
            path: Arc::new(path),
        };
        store.load_from_disk();
        store
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn save_to_disk(&self) {
        let path = self.path.as_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %e, path = %parent.display(), "failed to create peer store dir");
                return;
            }
        }
        match serde_json::to_string_pretty(&self.memory.snapshot()) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist peers");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize peers"),
        }
    }

    fn load_from_disk(&self) {
        let path = self.path.as_path();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read peers");
                return;
            }
        };
        let file: StoreFile = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse peers");
                return;
            }
        };
        let loaded = self.memory.restore(file);
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted peers");
        }
    }
}

impl PeerStore for JsonPeerStore {
    fn load_peer(&self, id: &str) -> Option<Peer> {
        self.memory.load_peer(id)
    }

    fn save_peer(&self, peer: &Peer, is_local: bool) {
        self.memory.save_peer(peer, is_local);
        self.save_to_disk();
    }

    fn local_peer(&self) -> Option<Peer> {
        self.memory.local_peer()
    }

    fn peers(&self) -> Vec<Peer> {
        self.memory.peers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_separates_local_peer() {
        let store = MemoryPeerStore::new();
        store.save_peer(&Peer::new("00").with_id("me"), true);
        store.save_peer(&Peer::new("AA").with_id("peer-1"), false);
        store.save_peer(&Peer::new("BB"), false);

        assert_eq!(store.peers().len(), 1);
        assert_eq!(store.local_peer().and_then(|p| p.id), Some("me".to_string()));
        assert!(store.load_peer("me").is_some());
        assert!(store.load_peer("peer-1").is_some());
        assert!(store.load_peer("peer-2").is_none());
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("bluepeer-store-{}", std::process::id()));
        let path = dir.join("peers.json");
        let _ = std::fs::remove_file(&path);

        {
            let store = JsonPeerStore::open(path.clone());
            store.save_peer(&Peer::new("00").with_id("me"), true);
            store.save_peer(&Peer::new("AA").with_id("peer-1"), false);
        }

        let reopened = JsonPeerStore::open(path.clone());
        assert_eq!(reopened.peers().len(), 1);
        assert_eq!(reopened.load_peer("peer-1").map(|p| p.address), Some("AA".to_string()));
        assert_eq!(reopened.local_peer().and_then(|p| p.id), Some("me".to_string()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = std::env::temp_dir().join(format!("bluepeer-store-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peers.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonPeerStore::open(path);
        assert!(store.peers().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
