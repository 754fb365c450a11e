use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::geo::LatLon;

/// Snapshot source for known relay peers.
pub trait PeerLocationProvider: Send + Sync {
    fn peer_locations(&self) -> HashMap<String, LatLon>;
}

/// No peers at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPeers;

impl PeerLocationProvider for NoPeers {
    fn peer_locations(&self) -> HashMap<String, LatLon> {
        HashMap::new()
    }
}

/// Peer table updated by whatever tracks the mesh.
#[derive(Debug, Default)]
pub struct StaticPeers {
    peers: RwLock<HashMap<String, LatLon>>,
}

impl StaticPeers {
    pub fn new(peers: impl IntoIterator<Item = PeerRecord>) -> Self {
        Self {
            peers: RwLock::new(
                peers
                    .into_iter()
                    .map(|p| {
                        let location = p.location();
                        (p.id, location)
                    })
                    .collect(),
            ),
        }
    }

    pub fn upsert(&self, id: impl Into<String>, location: LatLon) {
        self.peers.write().unwrap_or_else(PoisonError::into_inner).insert(id.into(), location);
    }

    pub fn remove(&self, id: &str) -> Option<LatLon> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }
}

impl PeerLocationProvider for StaticPeers {
    fn peer_locations(&self) -> HashMap<String, LatLon> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl PeerRecord {
    pub fn location(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }
}

/// Reads `id,latitude,longitude` rows (with header).
pub fn load_peers_from_csv(path: &Path) -> anyhow::Result<Vec<PeerRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open peers file {:?}", path))?;
    let mut peers = Vec::new();
    for record in reader.deserialize::<PeerRecord>() {
        let peer = record.with_context(|| format!("Malformed peer row in {:?}", path))?;
        peers.push(peer);
    }
    Ok(peers)
}

pub fn load_peers_from_json(path: &Path) -> anyhow::Result<Vec<PeerRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open peers file {:?}", path))?;
    let reader = std::io::BufReader::new(file);
    let peers: Vec<PeerRecord> = serde_json::from_reader(reader)
        .with_context(|| format!("Failed to parse peers file {:?}", path))?;
    Ok(peers)
}

/// Picks the loader from the file extension (`.json`, anything else CSV).
pub fn load_peers(path: &Path) -> anyhow::Result<Vec<PeerRecord>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => load_peers_from_json(path),
        _ => load_peers_from_csv(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_peers_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.csv");
        std::fs::write(&path, "id,latitude,longitude\nalpha,47.01,-122.0\nbravo,47.2,-121.9\n").unwrap();

        let peers = load_peers(&path).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].id, "bravo");
        assert_eq!(peers[1].location(), LatLon::new(47.2, -121.9));
    }

    #[test]
    fn json_peers_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, r#"[{"id":"alpha","latitude":1.0,"longitude":2.0}]"#).unwrap();

        let peers = load_peers(&path).unwrap();
        assert_eq!(peers, vec![PeerRecord { id: "alpha".into(), latitude: 1.0, longitude: 2.0 }]);
    }

    #[test]
    fn malformed_csv_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.csv");
        std::fs::write(&path, "id,latitude,longitude\nalpha,north,-122.0\n").unwrap();

        assert!(load_peers(&path).is_err());
    }

    #[test]
    fn malformed_json_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, r#"[{"id":"alpha","latitude":"north"}]"#).unwrap();

        let err = load_peers(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse peers file"));
        assert!(err.to_string().contains("peers.json"));
    }

    #[test]
    fn static_peers_snapshot_reflects_updates() {
        let peers = StaticPeers::new(vec![PeerRecord { id: "a".into(), latitude: 1.0, longitude: 1.0 }]);
        peers.upsert("b", LatLon::new(2.0, 2.0));
        peers.remove("a");

        let snapshot = peers.peer_locations();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("b"));
    }
}
