// Peer Registry
//
// Last-known location of every peer in the current room. Owned by the
// presence event loop, so no locking. Writes are last-write-wins by arrival
// order; an older `source_timestamp` arriving late replaces a newer one.

use geopresence_core::{Coordinate, Identity};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Everything known about one peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRecord {
    pub id: Identity,
    pub coordinate: Coordinate,
    /// When the peer captured the position (epoch milliseconds)
    pub source_timestamp: i64,
    /// When the position was applied locally (epoch milliseconds)
    pub last_seen: i64,
}

/// Inbound position of a peer, before it is stamped with `last_seen`
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSighting {
    pub id: Identity,
    pub coordinate: Coordinate,
    pub source_timestamp: i64,
}

pub struct PeerRegistry {
    self_id: Identity,
    stale_after_ms: i64,
    peers: HashMap<Identity, PeerRecord>,
    /// Bumped on every mutation
    state_version: u64,
}

impl PeerRegistry {
    pub fn new(self_id: Identity, stale_after: Duration) -> Self {
        Self {
            self_id,
            stale_after_ms: i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX),
            peers: HashMap::new(),
            state_version: 0,
        }
    }

    /// Insert or replace a peer's record, stamping `last_seen = now`.
    ///
    /// Sightings of the local identity are ignored. Returns whether the
    /// registry changed.
    pub fn upsert(&mut self, sighting: PeerSighting, now: i64) -> bool {
        if sighting.id == self.self_id {
            tracing::debug!("Ignoring sighting of self");
            return false;
        }

        let record = PeerRecord {
            id: sighting.id.clone(),
            coordinate: sighting.coordinate,
            source_timestamp: sighting.source_timestamp,
            last_seen: now,
        };
        self.peers.insert(sighting.id, record);
        self.state_version += 1;
        true
    }

    /// Remove a peer. No-op if unknown.
    pub fn remove(&mut self, id: &Identity) -> bool {
        if self.peers.remove(id).is_some() {
            self.state_version += 1;
            true
        } else {
            false
        }
    }

    /// Evict every peer not seen within the staleness window.
    ///
    /// Returns the number of evicted peers.
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.peers.len();
        let stale_after_ms = self.stale_after_ms;
        self.peers
            .retain(|_, record| now.saturating_sub(record.last_seen) <= stale_after_ms);

        let removed = before - self.peers.len();
        if removed > 0 {
            self.state_version += 1;
            tracing::debug!("Evicted {} stale peer(s)", removed);
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.peers.is_empty() {
            self.peers.clear();
            self.state_version += 1;
        }
    }

    /// Owned copy of the current records, ordered by identity
    pub fn snapshot(&self) -> BTreeMap<Identity, PeerRecord> {
        self.peers
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn get(&self, id: &Identity) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn state_version(&self) -> u64 {
        self.state_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_millis(30_000);

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Identity::from("me"), STALE)
    }

    fn sighting(id: &str, lat: f64, lon: f64, ts: i64) -> PeerSighting {
        PeerSighting {
            id: Identity::from(id),
            coordinate: Coordinate::new(lat, lon).unwrap(),
            source_timestamp: ts,
        }
    }

    #[test]
    fn test_upsert_stamps_local_time() {
        let mut reg = registry();
        assert!(reg.upsert(sighting("b", 1.0, 1.0, 111), 5_000));

        let record = reg.get(&Identity::from("b")).unwrap();
        assert_eq!(record.source_timestamp, 111);
        assert_eq!(record.last_seen, 5_000);
    }

    #[test]
    fn test_upsert_overwrites_by_arrival_not_timestamp() {
        let mut reg = registry();
        reg.upsert(sighting("b", 1.0, 1.0, 2_000), 10);
        reg.upsert(sighting("b", 2.0, 2.0, 1_000), 20);

        let record = reg.get(&Identity::from("b")).unwrap();
        assert_eq!(record.coordinate, Coordinate::new(2.0, 2.0).unwrap());
        assert_eq!(record.source_timestamp, 1_000);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_self_is_never_stored() {
        let mut reg = registry();
        assert!(!reg.upsert(sighting("me", 1.0, 1.0, 1), 1));
        assert!(!reg.contains(&Identity::from("me")));
        assert!(reg.is_empty());
        assert_eq!(reg.state_version(), 0);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut reg = registry();
        reg.upsert(sighting("b", 1.0, 1.0, 1), 1);
        assert!(!reg.remove(&Identity::from("zzz")));
        assert!(reg.remove(&Identity::from("b")));
        assert!(!reg.remove(&Identity::from("b")));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_staleness_boundary() {
        let t0 = 1_000_000;
        let mut reg = registry();
        reg.upsert(sighting("b", 1.0, 1.0, t0), t0);

        assert_eq!(reg.sweep(t0 + 29_999), 0);
        assert!(reg.contains(&Identity::from("b")));
        assert_eq!(reg.sweep(t0 + 30_000), 0);
        assert_eq!(reg.sweep(t0 + 30_001), 1);
        assert!(!reg.contains(&Identity::from("b")));
    }

    #[test]
    fn test_huge_staleness_window_saturates() {
        let mut reg = PeerRegistry::new(Identity::from("me"), Duration::MAX);
        reg.upsert(sighting("b", 1.0, 1.0, 0), 0);
        assert_eq!(reg.sweep(i64::MAX), 0);
        assert!(reg.contains(&Identity::from("b")));
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let build = || {
            let mut reg = registry();
            reg.upsert(sighting("a", 1.0, 1.0, 0), 0);
            reg.upsert(sighting("b", 1.0, 1.0, 0), 10_000);
            reg.upsert(sighting("c", 1.0, 1.0, 0), 25_000);
            reg
        };

        for (t1, t2) in [(0, 40_000), (35_000, 45_000), (50_000, 50_000), (20_000, 90_000)] {
            let mut twice = build();
            twice.sweep(t1);
            twice.sweep(t2);

            let mut once = build();
            once.sweep(t2);

            assert_eq!(twice.snapshot(), once.snapshot(), "t1={} t2={}", t1, t2);
        }
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let mut reg = registry();
        reg.upsert(sighting("b", 1.0, 1.0, 1), 1);

        let mut snapshot = reg.snapshot();
        snapshot.clear();
        assert_eq!(reg.len(), 1);

        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.snapshot().is_empty());
    }
}
