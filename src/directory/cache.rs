//! Local cache for the bootstrap peer list and the node key

use super::{DirectoryError, PeerAddress};
use std::path::Path;

/// Key under which the bootstrap peer list is stored
const PEERS_KEY: &[u8] = b"bootstrap_peers";

/// Key under which the node's protobuf-encoded keypair is stored
const NODE_KEY: &[u8] = b"node_key";

/// sled-backed store that survives restarts
#[derive(Clone)]
pub struct PeerCache {
    db: sled::Db,
}

impl PeerCache {
    /// Open (or create) the cache at the given directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let db = sled::open(path.as_ref())
            .map_err(|e| DirectoryError::Cache(format!("Failed to open cache: {}", e)))?;
        Ok(Self { db })
    }

    /// Load the cached peer list. `None` if nothing was stored yet.
    pub fn load_peers(&self) -> Result<Option<Vec<PeerAddress>>, DirectoryError> {
        let Some(raw) = self
            .db
            .get(PEERS_KEY)
            .map_err(|e| DirectoryError::Cache(format!("Failed to read peers: {}", e)))?
        else {
            return Ok(None);
        };

        let peers: Vec<PeerAddress> = serde_json::from_slice(&raw)
            .map_err(|e| DirectoryError::Serialization(format!("Failed to parse peers: {}", e)))?;

        tracing::debug!("Loaded {} peers from cache", peers.len());
        Ok(Some(peers))
    }

    /// Replace the cached peer list
    pub fn save_peers(&self, peers: &[PeerAddress]) -> Result<(), DirectoryError> {
        let raw = serde_json::to_vec(peers)
            .map_err(|e| DirectoryError::Serialization(format!("Failed to serialize peers: {}", e)))?;

        self.db
            .insert(PEERS_KEY, raw)
            .map_err(|e| DirectoryError::Cache(format!("Failed to write peers: {}", e)))?;
        self.flush()
    }

    pub fn load_node_key(&self) -> Result<Option<Vec<u8>>, DirectoryError> {
        self.db
            .get(NODE_KEY)
            .map(|value| value.map(|v| v.to_vec()))
            .map_err(|e| DirectoryError::Cache(format!("Failed to read node key: {}", e)))
    }

    pub fn save_node_key(&self, encoded: &[u8]) -> Result<(), DirectoryError> {
        self.db
            .insert(NODE_KEY, encoded)
            .map_err(|e| DirectoryError::Cache(format!("Failed to write node key: {}", e)))?;
        self.flush()
    }

    fn flush(&self) -> Result<(), DirectoryError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| DirectoryError::Cache(format!("Failed to flush cache: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_cache_has_no_peers() {
        let temp_dir = TempDir::new().unwrap();
        let cache = PeerCache::open(temp_dir.path()).unwrap();

        assert!(cache.load_peers().unwrap().is_none());
        assert!(cache.load_node_key().unwrap().is_none());
    }

    #[test]
    fn test_peers_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let peers = vec![
            PeerAddress::from("/dns4/node0.example.net/tcp/443/wss/p2p/QmA"),
            PeerAddress::from("/dns4/node1.example.net/tcp/443/wss/p2p/QmB"),
        ];

        {
            let cache = PeerCache::open(temp_dir.path()).unwrap();
            cache.save_peers(&peers).unwrap();
        }

        let cache = PeerCache::open(temp_dir.path()).unwrap();
        assert_eq!(cache.load_peers().unwrap(), Some(peers));
    }

    #[test]
    fn test_save_replaces_whole_list() {
        let temp_dir = TempDir::new().unwrap();
        let cache = PeerCache::open(temp_dir.path()).unwrap();

        cache.save_peers(&[PeerAddress::from("/a/wss/p2p/A"), PeerAddress::from("/b/wss/p2p/B")]).unwrap();
        cache.save_peers(&[PeerAddress::from("/c/wss/p2p/C")]).unwrap();

        let loaded = cache.load_peers().unwrap().unwrap();
        assert_eq!(loaded, vec![PeerAddress::from("/c/wss/p2p/C")]);
    }

    #[test]
    fn test_node_key_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let cache = PeerCache::open(temp_dir.path()).unwrap();

        cache.save_node_key(&[7u8; 68]).unwrap();
        assert_eq!(cache.load_node_key().unwrap(), Some(vec![7u8; 68]));
    }

    struct CachedSource {
        cache: PeerCache,
        fetched: Vec<PeerAddress>,
    }

    #[async_trait::async_trait]
    impl crate::directory::DirectorySource for CachedSource {
        async fn load(&self) -> Result<Option<Vec<PeerAddress>>, DirectoryError> {
            self.cache.load_peers()
        }

        async fn fetch(&self) -> Result<Vec<PeerAddress>, DirectoryError> {
            Ok(self.fetched.clone())
        }

        async fn save(&self, peers: &[PeerAddress]) -> Result<(), DirectoryError> {
            self.cache.save_peers(peers)
        }
    }

    #[tokio::test]
    async fn test_corrupt_peer_list_is_replaced_by_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let cache = PeerCache::open(temp_dir.path()).unwrap();
        cache.db.insert(PEERS_KEY, &b"garbage"[..]).unwrap();
        assert!(matches!(cache.load_peers(), Err(DirectoryError::Serialization(_))));

        let fetched = vec![PeerAddress::from("/dns4/node0.example.net/tcp/443/wss/p2p/QmA")];
        let source = std::sync::Arc::new(CachedSource {
            cache: cache.clone(),
            fetched: fetched.clone(),
        });

        let resolved = crate::directory::resolve(source).await.unwrap();

        assert_eq!(resolved.directory.as_slice(), fetched.as_slice());
        assert_eq!(cache.load_peers().unwrap(), Some(fetched));
    }
}

