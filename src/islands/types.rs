//! Peers, islands and the per-flush update records.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::geometry::{centroid_and_radius, IslandShape, Position3D};

/// A connected client and its last reported position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub position: Position3D,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_island_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub island_id: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<String>, position: Position3D) -> Self {
        Peer {
            id: id.into(),
            position,
            preferred_island_id: None,
            island_id: None,
        }
    }
}

/// What a position report says about the peer's preferred island.
///
/// A report that does not mention the preference leaves it alone; a report
/// that mentions it without a value clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PreferredIsland {
    #[default]
    Unchanged,
    Clear,
    Set(String),
}

impl PreferredIsland {
    /// Apply this change to a stored preference.
    pub fn apply(&self, current: &mut Option<String>) {
        match self {
            PreferredIsland::Unchanged => {}
            PreferredIsland::Clear => *current = None,
            PreferredIsland::Set(id) => *current = Some(id.clone()),
        }
    }

    /// Preference for a peer seen for the first time.
    pub fn initial(&self) -> Option<String> {
        match self {
            PreferredIsland::Set(id) => Some(id.clone()),
            _ => None,
        }
    }
}

/// One entry of a position batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionChange {
    pub id: String,
    pub position: Position3D,
    pub preferred_island: PreferredIsland,
}

impl PositionChange {
    pub fn new(id: impl Into<String>, position: Position3D) -> Self {
        PositionChange {
            id: id.into(),
            position,
            preferred_island: PreferredIsland::Unchanged,
        }
    }

    pub fn with_preferred_island(mut self, preferred: PreferredIsland) -> Self {
        self.preferred_island = preferred;
        self
    }
}

/// A cluster of peers sharing one room.
///
/// Members are stored by peer id; positions always come from the engine's
/// peer table. `center` and `radius` are cached and only valid while
/// `geometry_dirty` is false.
#[derive(Debug, Clone)]
pub struct Island {
    pub id: String,
    pub peers: Vec<String>,
    pub max_peers: usize,
    pub sequence_id: u64,
    pub transport_id: u32,
    center: Position3D,
    radius: f64,
    geometry_dirty: bool,
}

impl Island {
    pub fn new(
        id: String,
        peers: Vec<String>,
        max_peers: usize,
        sequence_id: u64,
        transport_id: u32,
    ) -> Self {
        Island {
            id,
            peers,
            max_peers,
            sequence_id,
            transport_id,
            center: [0.0, 0.0, 0.0],
            radius: 0.0,
            geometry_dirty: true,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn mark_dirty(&mut self) {
        self.geometry_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.geometry_dirty
    }

    /// Member positions in member order. Ids missing from the table are skipped.
    pub fn positions(&self, peers: &IndexMap<String, Peer>) -> Vec<Position3D> {
        self.peers
            .iter()
            .filter_map(|id| peers.get(id).map(|p| p.position))
            .collect()
    }

    /// Center and radius, recomputed and cached if the island is dirty.
    ///
    /// An empty island keeps its previous values and stays dirty.
    pub fn resolved_geometry(&mut self, peers: &IndexMap<String, Peer>) -> (Position3D, f64) {
        if self.geometry_dirty && !self.peers.is_empty() {
            let (center, radius) = centroid_and_radius(&self.positions(peers));
            self.center = center;
            self.radius = radius;
            self.geometry_dirty = false;
        }
        (self.center, self.radius)
    }

    /// Center and radius without touching the cache.
    pub fn current_geometry(&self, peers: &IndexMap<String, Peer>) -> (Position3D, f64) {
        if self.geometry_dirty && !self.peers.is_empty() {
            centroid_and_radius(&self.positions(peers))
        } else {
            (self.center, self.radius)
        }
    }

    /// Owned copy for readers outside the engine.
    pub fn snapshot(&self, peers: &IndexMap<String, Peer>) -> IslandSnapshot {
        let (center, radius) = self.current_geometry(peers);
        IslandSnapshot {
            id: self.id.clone(),
            peers: self
                .peers
                .iter()
                .filter_map(|id| peers.get(id).cloned())
                .collect(),
            center,
            radius,
            max_peers: self.max_peers,
            sequence_id: self.sequence_id,
            transport_id: self.transport_id,
        }
    }
}

/// Resolved geometry plus member positions, ready for intersection tests.
pub(crate) struct ResolvedIsland {
    pub center: Position3D,
    pub radius: f64,
    pub positions: Vec<Position3D>,
}

impl ResolvedIsland {
    pub fn shape(&self) -> IslandShape<'_> {
        IslandShape {
            center: self.center,
            radius: self.radius,
            positions: &self.positions,
        }
    }
}

/// Read-only view of an island.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IslandSnapshot {
    pub id: String,
    pub peers: Vec<Peer>,
    pub center: Position3D,
    pub radius: f64,
    pub max_peers: usize,
    pub sequence_id: u64,
    pub transport_id: u32,
}

impl IslandSnapshot {
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }
}

/// Outcome of one flush for a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IslandUpdate {
    /// The peer now belongs to `island_id` and connects with `conn_str`.
    ChangeTo {
        island_id: String,
        conn_str: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_island_id: Option<String>,
    },
    /// The peer left `island_id` and has no island.
    Leave { island_id: String },
}

impl IslandUpdate {
    pub fn island_id(&self) -> &str {
        match self {
            IslandUpdate::ChangeTo { island_id, .. } | IslandUpdate::Leave { island_id } => {
                island_id
            }
        }
    }
}

/// Per-flush batch, keyed by peer id, in the order updates were recorded.
pub type IslandUpdates = IndexMap<String, IslandUpdate>;

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, Position3D)]) -> IndexMap<String, Peer> {
        entries
            .iter()
            .map(|(id, pos)| (id.to_string(), Peer::new(*id, *pos)))
            .collect()
    }

    #[test]
    fn preferred_island_tri_state() {
        let mut pref = Some("I1".to_string());
        PreferredIsland::Unchanged.apply(&mut pref);
        assert_eq!(pref.as_deref(), Some("I1"));
        PreferredIsland::Set("I7".into()).apply(&mut pref);
        assert_eq!(pref.as_deref(), Some("I7"));
        PreferredIsland::Clear.apply(&mut pref);
        assert_eq!(pref, None);
        assert_eq!(PreferredIsland::Clear.initial(), None);
    }

    #[test]
    fn geometry_is_cached_until_marked_dirty() {
        let mut peers = table(&[("1", [0.0, 0.0, 0.0]), ("2", [40.0, 0.0, 40.0])]);
        let mut island = Island::new("I1".into(), vec!["1".into(), "2".into()], 100, 1, 0);

        let (center, _) = island.resolved_geometry(&peers);
        assert_eq!(center, [20.0, 0.0, 20.0]);
        assert!(!island.is_dirty());

        peers.get_mut("2").unwrap().position = [80.0, 0.0, 80.0];
        assert_eq!(island.resolved_geometry(&peers).0, [20.0, 0.0, 20.0]);

        island.mark_dirty();
        assert_eq!(island.current_geometry(&peers).0, [40.0, 0.0, 40.0]);
        assert!(island.is_dirty());
        assert_eq!(island.resolved_geometry(&peers).0, [40.0, 0.0, 40.0]);
        assert!(!island.is_dirty());
    }

    #[test]
    fn snapshot_copies_members_in_order() {
        let peers = table(&[("a", [1.0, 0.0, 1.0]), ("b", [3.0, 0.0, 3.0])]);
        let island = Island::new("I9".into(), vec!["b".into(), "a".into()], 10, 4, 2);
        let snap = island.snapshot(&peers);
        assert_eq!(snap.peer_ids(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(snap.center, [2.0, 0.0, 2.0]);
        assert_eq!(snap.transport_id, 2);
    }

    #[test]
    fn update_serializes_with_action_tag() {
        let update = IslandUpdate::ChangeTo {
            island_id: "I2".into(),
            conn_str: "p2p:I2:1".into(),
            from_island_id: None,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["action"], "change_to");
        assert!(json.get("from_island_id").is_none());
        assert_eq!(IslandUpdate::Leave { island_id: "I3".into() }.island_id(), "I3");
    }
}
