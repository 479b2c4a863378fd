// Presence View
//
// The read-only state exposed to observers: connection status, own
// position, and every peer classified as close or far.

use crate::connection::ConnectionState;
use crate::registry::PeerRecord;
use geopresence_core::{distance_meters, Coordinate, Identity};
use serde::Serialize;
use std::collections::BTreeMap;

/// Most recent position of this participant
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelfLocation {
    pub coordinate: Coordinate,
    pub captured_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerView {
    pub id: Identity,
    pub coordinate: Coordinate,
    pub source_timestamp: i64,
    pub last_seen: i64,
    /// `None` until our own position is known
    pub distance_meters: Option<f64>,
    pub is_close: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceView {
    pub status: ConnectionState,
    pub error: Option<String>,
    pub self_identity: Identity,
    pub room: Option<String>,
    pub self_location: Option<SelfLocation>,
    pub sharing: bool,
    pub peers: Vec<PeerView>,
}

impl PresenceView {
    pub fn new(self_identity: Identity) -> Self {
        Self {
            status: ConnectionState::Disconnected,
            error: None,
            self_identity,
            room: None,
            self_location: None,
            sharing: false,
            peers: Vec::new(),
        }
    }

    pub fn close_peers(&self) -> impl Iterator<Item = &PeerView> {
        self.peers.iter().filter(|p| p.is_close)
    }

    pub fn peer(&self, id: &Identity) -> Option<&PeerView> {
        self.peers.iter().find(|p| &p.id == id)
    }
}

/// Annotate every peer with its distance and proximity flag.
///
/// A peer is close when it is at most `proximity_m` meters away. Without a
/// known own position nobody is close.
pub fn classify(
    self_location: Option<&SelfLocation>,
    peers: &BTreeMap<Identity, PeerRecord>,
    proximity_m: f64,
) -> Vec<PeerView> {
    peers
        .values()
        .map(|record| {
            let distance = self_location.map(|me| distance_meters(me.coordinate, record.coordinate));
            PeerView {
                id: record.id.clone(),
                coordinate: record.coordinate,
                source_timestamp: record.source_timestamp,
                last_seen: record.last_seen,
                distance_meters: distance,
                is_close: distance.is_some_and(|d| d <= proximity_m),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(entries: &[(&str, f64, f64)]) -> BTreeMap<Identity, PeerRecord> {
        entries
            .iter()
            .map(|(id, lat, lon)| {
                let id = Identity::from(*id);
                let record = PeerRecord {
                    id: id.clone(),
                    coordinate: Coordinate::new(*lat, *lon).unwrap(),
                    source_timestamp: 1,
                    last_seen: 2,
                };
                (id, record)
            })
            .collect()
    }

    fn me(lat: f64, lon: f64) -> SelfLocation {
        SelfLocation {
            coordinate: Coordinate::new(lat, lon).unwrap(),
            captured_at: 0,
        }
    }

    #[test]
    fn test_classify_threshold() {
        let snapshot = peers(&[("near", 0.0, 0.0449), ("far", 0.0, 0.05)]);
        let views = classify(Some(&me(0.0, 0.0)), &snapshot, 5_000.0);

        let near = views.iter().find(|p| p.id == Identity::from("near")).unwrap();
        let far = views.iter().find(|p| p.id == Identity::from("far")).unwrap();
        assert!(near.is_close);
        assert!(!far.is_close);
        assert!((far.distance_meters.unwrap() - 5_559.75).abs() < 1.0);
    }

    #[test]
    fn test_unknown_self_location_means_nobody_close() {
        let snapshot = peers(&[("b", 0.0, 0.0)]);
        let views = classify(None, &snapshot, 5_000.0);
        assert_eq!(views.len(), 1);
        assert!(!views[0].is_close);
        assert_eq!(views[0].distance_meters, None);
    }

    #[test]
    fn test_close_peers_filter() {
        let snapshot = peers(&[("b", 1.0, 1.0), ("c", 40.0, 40.0)]);
        let mut view = PresenceView::new(Identity::from("a"));
        view.peers = classify(Some(&me(1.0, 1.0)), &snapshot, 5_000.0);

        let close: Vec<_> = view.close_peers().map(|p| p.id.as_str()).collect();
        assert_eq!(close, vec!["b"]);
        assert!(view.peer(&Identity::from("c")).is_some());
    }
}
