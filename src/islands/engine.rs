//! The island engine: incremental proximity clustering of peers.
//!
//! Position reports are buffered; all clustering happens in [`IslandEngine::flush`],
//! which runs admission, the split pass and the merge pass in that order and
//! returns one update per peer whose island changed.
//!
//! The engine is a plain single-owner struct. Every table is insertion
//! ordered so the same input sequence always produces the same islands, ids
//! and updates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use super::error::EngineError;
use super::geometry::{circles_overlap, islands_intersect, peer_intersects_group, Position3D};
use super::id_gen::SequentialIdGenerator;
use super::metrics;
use super::transport::{Transport, TransportInfo, TransportRegistry};
use super::types::{
    Island, IslandSnapshot, IslandUpdate, IslandUpdates, Peer, PositionChange, ResolvedIsland,
};

pub const DEFAULT_ROOM_PREFIX: &str = "I";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Islands whose closest members are within this distance merge.
    pub join_distance: f64,
    /// Members farther than this from every other member split off.
    pub leave_distance: f64,
    /// Prefix of generated island ids.
    pub room_prefix: String,
}

impl EngineOptions {
    pub fn new(join_distance: f64, leave_distance: f64) -> Self {
        EngineOptions {
            join_distance,
            leave_distance,
            room_prefix: DEFAULT_ROOM_PREFIX.to_string(),
        }
    }

    pub fn with_room_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.room_prefix = prefix.into();
        self
    }
}

/// Connected component found by the split pass.
#[derive(Default)]
struct PeerGroup {
    ids: Vec<String>,
    positions: Vec<Position3D>,
}

impl PeerGroup {
    fn push(&mut self, id: String, position: Position3D) {
        self.ids.push(id);
        self.positions.push(position);
    }

    fn absorb(&mut self, other: PeerGroup) {
        self.ids.extend(other.ids);
        self.positions.extend(other.positions);
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

pub struct IslandEngine {
    join_distance: f64,
    leave_distance: f64,
    peers: IndexMap<String, Peer>,
    islands: IndexMap<String, Island>,
    pending_new_peers: IndexMap<String, Peer>,
    pending_updates: IslandUpdates,
    current_sequence: u64,
    island_ids: SequentialIdGenerator,
    transports: TransportRegistry,
}

impl IslandEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self::with_transports(options, TransportRegistry::new())
    }

    pub fn with_transports(options: EngineOptions, transports: TransportRegistry) -> Self {
        if options.leave_distance < options.join_distance {
            warn!(
                join = options.join_distance,
                leave = options.leave_distance,
                "leave distance is below join distance, islands may flap"
            );
        }
        IslandEngine {
            join_distance: options.join_distance,
            leave_distance: options.leave_distance,
            peers: IndexMap::new(),
            islands: IndexMap::new(),
            pending_new_peers: IndexMap::new(),
            pending_updates: IndexMap::new(),
            current_sequence: 0,
            island_ids: SequentialIdGenerator::new(options.room_prefix),
            transports,
        }
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Buffer a batch of position reports. No clustering happens until the
    /// next [`flush`](Self::flush).
    ///
    /// Unknown peers are staged for admission. A known peer without an
    /// island (its admission or spin-off failed) is staged again as well.
    pub fn update_positions(&mut self, changes: impl IntoIterator<Item = PositionChange>) {
        for change in changes {
            let orphaned = match self.peers.get_mut(&change.id) {
                None if self.pending_new_peers.contains_key(&change.id) => {
                    if let Some(staged) = self.pending_new_peers.get_mut(&change.id) {
                        staged.position = change.position;
                        change.preferred_island.apply(&mut staged.preferred_island_id);
                    }
                    continue;
                }
                None => {
                    let mut peer = Peer::new(change.id.clone(), change.position);
                    peer.preferred_island_id = change.preferred_island.initial();
                    self.pending_new_peers.insert(change.id, peer);
                    continue;
                }
                Some(peer) => {
                    peer.position = change.position;
                    change.preferred_island.apply(&mut peer.preferred_island_id);
                    match peer.island_id.as_deref().and_then(|id| self.islands.get_mut(id)) {
                        Some(island) => {
                            island.mark_dirty();
                            false
                        }
                        None => true,
                    }
                }
            };

            if orphaned {
                if let Some(mut peer) = self.peers.shift_remove(&change.id) {
                    peer.island_id = None;
                    debug!(peer = %peer.id, "re-staging peer without island");
                    self.pending_new_peers.insert(change.id, peer);
                }
            }
        }
    }

    /// Forget a peer. Its island shrinks (and disappears if empty) and the
    /// next flush reports a `Leave` for it. Unknown ids are ignored.
    pub fn remove_peer(&mut self, peer_id: &str) {
        self.pending_new_peers.shift_remove(peer_id);

        let Some(peer) = self.peers.shift_remove(peer_id) else {
            return;
        };
        let Some(island_id) = peer.island_id else {
            return;
        };

        if let Some(island) = self.islands.get_mut(&island_id) {
            if let Some(idx) = island.peers.iter().position(|p| p == peer_id) {
                island.peers.remove(idx);
            }
            island.mark_dirty();
            if island.is_empty() {
                self.islands.shift_remove(&island_id);
                debug!(island = %island_id, "island emptied");
            }
        }

        self.pending_updates
            .insert(peer.id, IslandUpdate::Leave { island_id });
    }

    // -----------------------------------------------------------------------
    // Transports
    // -----------------------------------------------------------------------

    /// Register a transport or refresh its advertised capacity.
    pub fn on_transport_heartbeat(&mut self, info: TransportInfo, transport: Arc<dyn Transport>) {
        let id = info.id;
        let kind = info.kind;
        if self.transports.upsert(info, transport) {
            info!(transport = id, kind = kind.as_str(), "transport connected");
        }
    }

    /// Drop a transport. Its islands keep their peers but accept no more
    /// (`max_peers` becomes 0).
    pub fn on_transport_disconnected(&mut self, id: u32) {
        if self.transports.remove(id).is_none() {
            return;
        }
        let mut demoted = 0;
        for island in self.islands.values_mut().filter(|i| i.transport_id == id) {
            island.max_peers = 0;
            demoted += 1;
        }
        warn!(transport = id, demoted, "transport disconnected");
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn islands(&self) -> Vec<IslandSnapshot> {
        self.islands
            .values()
            .map(|island| island.snapshot(&self.peers))
            .collect()
    }

    pub fn island(&self, id: &str) -> Option<IslandSnapshot> {
        self.islands.get(id).map(|island| island.snapshot(&self.peers))
    }

    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).cloned()
    }

    /// Admitted peers. Peers still waiting for their first flush are not counted.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn island_count(&self) -> usize {
        self.islands.len()
    }

    pub fn pending_peer_count(&self) -> usize {
        self.pending_new_peers.len()
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    /// Run one clustering pass over everything buffered since the last flush
    /// and return the resulting updates, at most one per peer.
    ///
    /// Per-island failures are logged and never abort the pass.
    pub async fn flush(&mut self) -> IslandUpdates {
        let started = Instant::now();

        let staged = std::mem::take(&mut self.pending_new_peers);
        for (id, peer) in staged {
            self.peers.insert(id.clone(), peer);
            if let Err(err) = self.create_island(vec![id.clone()]).await {
                metrics::transport_failure("admission");
                error!(peer = %id, error = %err, "failed to create island for new peer");
            }
        }

        let mut affected: Vec<String> = self
            .islands
            .values()
            .filter(|island| island.is_dirty())
            .map(|island| island.id.clone())
            .collect();
        let mut known: HashSet<String> = affected.iter().cloned().collect();

        // Islands spun off by a split are appended and visited too.
        let mut idx = 0;
        while idx < affected.len() {
            let island_id = affected[idx].clone();
            for created in self.check_split_island(&island_id).await {
                if known.insert(created.clone()) {
                    affected.push(created);
                }
            }
            idx += 1;
        }

        let mut processed: HashSet<String> = HashSet::new();
        for island_id in &affected {
            if processed.contains(island_id) || !self.islands.contains_key(island_id) {
                continue;
            }
            let intersected = self.intersecting_islands(island_id);
            if !intersected.is_empty() {
                processed.insert(island_id.clone());
                let mut group = Vec::with_capacity(intersected.len() + 1);
                group.push(island_id.clone());
                group.extend(intersected);
                self.merge_islands(group).await;
            }
        }

        let updates = std::mem::take(&mut self.pending_updates);
        self.record_metrics(started, &updates);
        debug!(
            islands = self.islands.len(),
            peers = self.peers.len(),
            updates = updates.len(),
            "flush complete"
        );
        updates
    }

    /// Partition an island into connected components under the leave
    /// distance. The biggest component keeps the island; every other one is
    /// spun off. Returns the ids of the islands created.
    async fn check_split_island(&mut self, island_id: &str) -> Vec<String> {
        let Some(island) = self.islands.get(island_id) else {
            return Vec::new();
        };
        if island.len() < 2 {
            return Vec::new();
        }

        let mut groups: Vec<PeerGroup> = Vec::new();
        for peer_id in &island.peers {
            let Some(peer) = self.peers.get(peer_id) else {
                continue;
            };
            let touched: Vec<usize> = groups
                .iter()
                .enumerate()
                .filter(|(_, g)| peer_intersects_group(&peer.position, &g.positions, self.leave_distance))
                .map(|(i, _)| i)
                .collect();

            match touched.split_first() {
                None => {
                    let mut group = PeerGroup::default();
                    group.push(peer_id.clone(), peer.position);
                    groups.push(group);
                }
                Some((&first, rest)) => {
                    groups[first].push(peer_id.clone(), peer.position);
                    // `rest` is ascending and every index is past `first`.
                    let mut absorbed: Vec<PeerGroup> =
                        rest.iter().rev().map(|&i| groups.remove(i)).collect();
                    absorbed.reverse();
                    for group in absorbed {
                        groups[first].absorb(group);
                    }
                }
            }
        }

        if groups.len() <= 1 {
            return Vec::new();
        }

        let mut biggest = 0;
        for (i, group) in groups.iter().enumerate().skip(1) {
            if group.len() > groups[biggest].len() {
                biggest = i;
            }
        }
        let kept = groups.remove(biggest);

        if let Some(island) = self.islands.get_mut(island_id) {
            island.peers = kept.ids;
            island.mark_dirty();
        }
        debug!(island = %island_id, spin_offs = groups.len(), "splitting island");

        let mut created = Vec::new();
        for group in groups {
            match self.create_island(group.ids.clone()).await {
                Ok(id) => created.push(id),
                Err(err) => {
                    metrics::transport_failure("split");
                    error!(
                        island = %island_id,
                        peers = group.len(),
                        error = %err,
                        "failed to spin off island, detaching peers"
                    );
                    self.detach_peers(&group.ids, island_id);
                }
            }
        }
        created
    }

    /// Every other island within join distance of `island_id`, in table order.
    fn intersecting_islands(&mut self, island_id: &str) -> Vec<String> {
        let Some(current) = self.resolve(island_id) else {
            return Vec::new();
        };
        let shape = current.shape();

        let mut found = Vec::new();
        for other in self.islands.values_mut() {
            if other.id == island_id {
                continue;
            }
            let (center, radius) = other.resolved_geometry(&self.peers);
            if !circles_overlap(&shape.center, shape.radius, &center, radius, self.join_distance) {
                continue;
            }
            let other_shape = ResolvedIsland {
                center,
                radius,
                positions: other.positions(&self.peers),
            };
            if islands_intersect(&shape, &other_shape.shape(), self.join_distance) {
                found.push(other.id.clone());
            }
        }
        found
    }

    fn resolve(&mut self, island_id: &str) -> Option<ResolvedIsland> {
        let island = self.islands.get_mut(island_id)?;
        let (center, radius) = island.resolved_geometry(&self.peers);
        Some(ResolvedIsland {
            center,
            radius,
            positions: island.positions(&self.peers),
        })
    }

    /// Merge a set of mutually reachable islands, biggest (then oldest) first.
    ///
    /// Each island tries its preferred survivor, then every survivor in
    /// order. Islands that fit nowhere become survivors themselves.
    async fn merge_islands(&mut self, island_ids: Vec<String>) {
        let mut ordered: Vec<(String, usize, u64)> = island_ids
            .into_iter()
            .filter_map(|id| {
                let island = self.islands.get(&id)?;
                let (len, seq) = (island.len(), island.sequence_id);
                Some((id, len, seq))
            })
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut ordered = ordered.into_iter().map(|(id, _, _)| id);
        let Some(first) = ordered.next() else {
            return;
        };
        let mut survivors = vec![first];

        for island_id in ordered {
            let mut merged = false;

            // Preferences only pull toward islands already ahead in the order.
            if let Some(preferred) = self.preferred_island_for(&island_id) {
                if survivors.contains(&preferred) {
                    merged = self.merge_into_if_possible(&preferred, &island_id).await;
                }
            }

            for target in &survivors {
                if merged {
                    break;
                }
                merged = self.merge_into_if_possible(target, &island_id).await;
            }

            if !merged {
                survivors.push(island_id);
            }
        }
    }

    /// Majority vote of the island's members. The first candidate to reach
    /// the top count wins ties.
    fn preferred_island_for(&self, island_id: &str) -> Option<String> {
        let island = self.islands.get(island_id)?;
        let mut votes: HashMap<&str, usize> = HashMap::new();
        let mut most_voted: Option<(&str, usize)> = None;

        for peer_id in &island.peers {
            let Some(preferred) = self
                .peers
                .get(peer_id)
                .and_then(|p| p.preferred_island_id.as_deref())
                .filter(|p| !p.is_empty())
            else {
                continue;
            };
            let count = votes.entry(preferred).or_insert(0);
            *count += 1;
            let count = *count;
            match most_voted {
                Some((_, best)) if best >= count => {}
                _ => most_voted = Some((preferred, count)),
            }
        }
        most_voted.map(|(id, _)| id.to_string())
    }

    /// Move every peer of `source_id` into `target_id` if the target has
    /// room and its transport grants credentials. Nothing changes on failure.
    async fn merge_into_if_possible(&mut self, target_id: &str, source_id: &str) -> bool {
        let (Some(target), Some(source)) =
            (self.islands.get(target_id), self.islands.get(source_id))
        else {
            return false;
        };
        if target.len() + source.len() > target.max_peers {
            return false;
        }
        let transport_id = target.transport_id;
        let moving = source.peers.clone();

        let conn_strs = match self
            .transports
            .request_connection_strings(transport_id, &moving, target_id)
            .await
        {
            Ok(conn_strs) => conn_strs,
            Err(err) => {
                metrics::transport_failure("merge");
                warn!(
                    target = %target_id,
                    source = %source_id,
                    transport = transport_id,
                    error = %err,
                    "merge skipped"
                );
                return false;
            }
        };

        if let Some(target) = self.islands.get_mut(target_id) {
            target.peers.extend(moving.iter().cloned());
            target.mark_dirty();
        }
        self.islands.shift_remove(source_id);
        self.set_peers_island(target_id, &moving, &conn_strs);
        debug!(target = %target_id, source = %source_id, moved = moving.len(), "islands merged");
        true
    }

    /// Create an island for `group` on the first transport that can host it.
    ///
    /// The id is taken from the generator after a transport is chosen and is
    /// not returned if the credential request fails.
    async fn create_island(&mut self, group: Vec<String>) -> Result<String, EngineError> {
        let (transport_id, max_peers) = self.select_transport(group.len())?;
        let island_id = self.island_ids.next_id();

        let conn_strs = self
            .transports
            .request_connection_strings(transport_id, &group, &island_id)
            .await?;

        self.current_sequence += 1;
        let island = Island::new(
            island_id.clone(),
            group.clone(),
            max_peers,
            self.current_sequence,
            transport_id,
        );
        self.islands.insert(island_id.clone(), island);
        self.set_peers_island(&island_id, &group, &conn_strs);

        debug!(island = %island_id, transport = transport_id, peers = group.len(), "island created");
        Ok(island_id)
    }

    /// First-fit by ascending transport id. A limited transport qualifies
    /// only if a full island still fits after the free slots already
    /// reserved by its existing islands.
    fn select_transport(&self, group_size: usize) -> Result<(u32, usize), EngineError> {
        for info in self.transports.iter() {
            if info.max_island_size < group_size || info.max_island_size == 0 {
                continue;
            }
            if info.is_unlimited() {
                return Ok((info.id, info.max_island_size));
            }
            let reserved: i64 = self
                .islands
                .values()
                .filter(|island| island.transport_id == info.id)
                .map(|island| island.max_peers.saturating_sub(island.len()) as i64)
                .sum();
            if info.available_seats - reserved >= info.max_island_size as i64 {
                return Ok((info.id, info.max_island_size));
            }
        }
        Err(EngineError::NoTransportAvailable { group_size })
    }

    fn set_peers_island(
        &mut self,
        island_id: &str,
        peer_ids: &[String],
        conn_strs: &HashMap<String, String>,
    ) {
        for peer_id in peer_ids {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                continue;
            };
            let from_island_id = peer.island_id.replace(island_id.to_string());
            let conn_str = conn_strs.get(peer_id).cloned().unwrap_or_default();
            self.pending_updates.insert(
                peer_id.clone(),
                IslandUpdate::ChangeTo {
                    island_id: island_id.to_string(),
                    conn_str,
                    from_island_id,
                },
            );
        }
    }

    fn detach_peers(&mut self, peer_ids: &[String], island_id: &str) {
        for peer_id in peer_ids {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.island_id = None;
                self.pending_updates.insert(
                    peer_id.clone(),
                    IslandUpdate::Leave {
                        island_id: island_id.to_string(),
                    },
                );
            }
        }
    }

    fn record_metrics(&self, started: Instant, updates: &IslandUpdates) {
        metrics::record_flush(
            self.islands.len(),
            self.peers.len(),
            started.elapsed(),
            updates,
        );

        let mut by_kind: HashMap<&'static str, (usize, usize)> = HashMap::new();
        for island in self.islands.values() {
            let kind = self
                .transports
                .get(island.transport_id)
                .map(|t| t.kind.as_str())
                .unwrap_or("unknown");
            let entry = by_kind.entry(kind).or_default();
            entry.0 += 1;
            entry.1 += island.len();
        }
        for (kind, (islands, peers)) in by_kind {
            metrics::transport_distribution(kind, islands, peers);
        }
    }
}
