//! The routing network value and its owning database.
//!
//! A [`RoutingNetwork`] is a sparse collection of tiles plus the attribute
//! indexes they were classified against. The [`RouterDb`] owns the `Latest`
//! published network and hands out the exclusive write handles; readers
//! clone the `Arc` and keep a consistent snapshot for as long as they like.

mod enumerator;
mod mutator;
mod writer;

pub use enumerator::{EdgeEnumerator, EdgeView};
pub use mutator::GraphMutator;
pub use writer::GraphWriter;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::attributes::{AttributeSet, AttributeSetIndex};
use crate::error::{GraphError, Result};
use crate::geo::{self, BoundingBox, Coordinate};
use crate::model::VertexId;
use crate::tile::GraphTile;

/// Hook invoked before a tile is touched, so demand-loading providers can
/// materialize it first. The call may block; the core does not cache.
pub trait TileUsageListener: Send + Sync {
    fn notify(&self, tile_id: u32);
}

#[derive(Clone)]
pub(crate) struct TileSlot {
    pub(crate) tile: Arc<GraphTile>,
    pub(crate) edge_type_generation: u32,
}

/// One immutable-to-readers version of the tiled graph.
pub struct RoutingNetwork {
    zoom: u32,
    tiles: RwLock<HashMap<u32, TileSlot>>,
    edge_type_index: Arc<AttributeSetIndex>,
    turn_cost_index: Arc<AttributeSetIndex>,
    usage: RwLock<Option<Arc<dyn TileUsageListener>>>,
}

impl RoutingNetwork {
    pub fn new(zoom: u32) -> Self {
        Self::with_indexes(
            zoom,
            Arc::new(AttributeSetIndex::default()),
            Arc::new(AttributeSetIndex::default()),
        )
    }

    pub(crate) fn with_indexes(
        zoom: u32,
        edge_type_index: Arc<AttributeSetIndex>,
        turn_cost_index: Arc<AttributeSetIndex>,
    ) -> Self {
        Self {
            zoom,
            tiles: RwLock::new(HashMap::new()),
            edge_type_index,
            turn_cost_index,
            usage: RwLock::new(None),
        }
    }

    pub(crate) fn with_tiles(
        zoom: u32,
        tiles: HashMap<u32, TileSlot>,
        edge_type_index: Arc<AttributeSetIndex>,
        turn_cost_index: Arc<AttributeSetIndex>,
        usage: Option<Arc<dyn TileUsageListener>>,
    ) -> Self {
        Self {
            zoom,
            tiles: RwLock::new(tiles),
            edge_type_index,
            turn_cost_index,
            usage: RwLock::new(usage),
        }
    }

    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    pub fn edge_type_index(&self) -> &Arc<AttributeSetIndex> {
        &self.edge_type_index
    }

    pub fn turn_cost_index(&self) -> &Arc<AttributeSetIndex> {
        &self.turn_cost_index
    }

    /// Installs the demand-load hook consulted before tile reads.
    pub fn set_usage_listener(&self, listener: Arc<dyn TileUsageListener>) {
        *self.usage.write() = Some(listener);
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.read().len()
    }

    pub fn vertex_count(&self) -> u64 {
        self.tiles
            .read()
            .values()
            .map(|slot| slot.tile.vertex_count() as u64)
            .sum()
    }

    /// Canonical edges only; mirrors are not counted twice.
    pub fn edge_count(&self) -> u64 {
        self.edges().count() as u64
    }

    /// A read snapshot of one tile, rewritten first when its edge-type
    /// classification is stale.
    pub fn tile_snapshot(&self, tile_id: u32) -> Option<Arc<GraphTile>> {
        if let Some(listener) = self.usage.read().as_ref() {
            listener.notify(tile_id);
        }
        let current = self.edge_type_index.generation();
        {
            let tiles = self.tiles.read();
            let slot = tiles.get(&tile_id)?;
            if slot.edge_type_generation == current {
                return Some(Arc::clone(&slot.tile));
            }
        }
        let mut tiles = self.tiles.write();
        let slot = tiles.get_mut(&tile_id)?;
        if slot.edge_type_generation != current {
            debug!(
                tile_id,
                from = slot.edge_type_generation,
                to = current,
                "rewriting tile for new edge-type classification"
            );
            slot.tile = Arc::new(self.edge_type_index.update(&slot.tile));
            slot.edge_type_generation = current;
        }
        Some(Arc::clone(&slot.tile))
    }

    /// Dequantized coordinate of any vertex in the network.
    pub fn vertex(&self, vertex: VertexId) -> Option<Coordinate> {
        self.tile_snapshot(vertex.tile_id)?.try_get_vertex(vertex)
    }

    /// All vertices whose coordinates fall inside `area`.
    pub fn vertices_in_box(
        &self,
        area: &BoundingBox,
    ) -> impl Iterator<Item = (VertexId, Coordinate)> {
        let area = *area;
        let tiles = self.tiles_overlapping(&area);
        tiles.into_iter().flat_map(move |tile| {
            let tile_id = tile.tile_id();
            (0..tile.vertex_count()).filter_map(move |local_id| {
                let vertex = VertexId::new(tile_id, local_id);
                let (lon, lat) = tile.try_get_vertex(vertex)?;
                area.contains(lon, lat).then_some((vertex, (lon, lat)))
            })
        })
    }

    /// Snapshots of every tile whose rectangle overlaps `area`, demand
    /// loading along the way.
    pub(crate) fn tiles_overlapping(&self, area: &BoundingBox) -> Vec<Arc<GraphTile>> {
        let (x0, y0, x1, y1) = geo::tile_range(area, self.zoom);
        let mut tiles = Vec::new();
        for y in y0..=y1 {
            for x in x0..=x1 {
                let tile_id = geo::tile_id(x, y, self.zoom);
                if let Some(tile) = self.tile_snapshot(tile_id) {
                    tiles.push(tile);
                }
            }
        }
        tiles
    }

    /// A fresh enumerator over vertex adjacencies.
    pub fn get_edge_enumerator(&self) -> EdgeEnumerator<'_> {
        EdgeEnumerator::new(self)
    }

    /// Every canonical edge in the network, in tile then insertion order.
    /// Mirror records are skipped.
    pub fn edges(&self) -> impl Iterator<Item = EdgeView> {
        let mut ids: Vec<u32> = self.tiles.read().keys().copied().collect();
        ids.sort_unstable();
        let tiles: Vec<Arc<GraphTile>> = ids
            .into_iter()
            .filter_map(|tile_id| self.tile_snapshot(tile_id))
            .collect();
        tiles.into_iter().flat_map(|tile| {
            (0..tile.edge_count()).filter_map(move |index| {
                let record = tile.record_by_index(index)?;
                if tile.is_mirror(&record) {
                    return None;
                }
                Some(EdgeView::new(Arc::clone(&tile), record, record.vertex1))
            })
        })
    }

    pub(crate) fn tiles(&self) -> &RwLock<HashMap<u32, TileSlot>> {
        &self.tiles
    }

    pub(crate) fn clone_slots(&self) -> HashMap<u32, TileSlot> {
        self.tiles.read().clone()
    }

    pub(crate) fn usage_listener(&self) -> Option<Arc<dyn TileUsageListener>> {
        self.usage.read().clone()
    }
}

impl std::fmt::Debug for RoutingNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingNetwork")
            .field("zoom", &self.zoom)
            .field("tiles", &self.tile_count())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Idle,
    WriterOut,
    MutatorOut,
}

/// Owner of the `Latest` published [`RoutingNetwork`].
///
/// At most one writer or one mutator is live at a time; the handles restore
/// the idle state on drop. Publication is a single pointer swap, so readers
/// observe either the pre-mutation network or the committed one, never a
/// partial state.
pub struct RouterDb {
    zoom: u32,
    latest: RwLock<Arc<RoutingNetwork>>,
    lifecycle: Mutex<Lifecycle>,
    metadata: Mutex<AttributeSet>,
}

impl RouterDb {
    /// A new empty database at the given zoom. Zoom is fixed for the
    /// lifetime of the graph and must keep tile ids within `u32`.
    pub fn new(zoom: u32) -> Result<Self> {
        if zoom > 16 {
            return Err(GraphError::InvalidArgument(format!(
                "zoom {zoom} does not fit tile ids in 32 bits"
            )));
        }
        Ok(Self {
            zoom,
            latest: RwLock::new(Arc::new(RoutingNetwork::new(zoom))),
            lifecycle: Mutex::new(Lifecycle::Idle),
            metadata: Mutex::new(AttributeSet::new()),
        })
    }

    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    /// The currently published network snapshot.
    pub fn latest(&self) -> Arc<RoutingNetwork> {
        Arc::clone(&self.latest.read())
    }

    pub fn metadata(&self) -> AttributeSet {
        self.metadata.lock().clone()
    }

    pub fn set_metadata(&self, metadata: AttributeSet) {
        *self.metadata.lock() = metadata;
    }

    /// The exclusive append-only writer over the latest network.
    pub fn get_writer(&self) -> Result<GraphWriter<'_>> {
        self.acquire(Lifecycle::WriterOut)?;
        debug!("graph writer acquired");
        Ok(GraphWriter::new(self, self.latest()))
    }

    /// The exclusive copy-on-write mutator; `commit` publishes a new
    /// network.
    pub fn get_mutator(&self) -> Result<GraphMutator<'_>> {
        self.acquire(Lifecycle::MutatorOut)?;
        debug!("graph mutator acquired");
        Ok(GraphMutator::new(self, self.latest()))
    }

    fn acquire(&self, target: Lifecycle) -> Result<()> {
        let mut state = self.lifecycle.lock();
        match *state {
            Lifecycle::Idle => {
                *state = target;
                Ok(())
            }
            Lifecycle::WriterOut => Err(GraphError::InvalidState("a graph writer is live")),
            Lifecycle::MutatorOut => Err(GraphError::InvalidState("a graph mutator is live")),
        }
    }

    pub(crate) fn release(&self) {
        *self.lifecycle.lock() = Lifecycle::Idle;
    }

    /// Rebuilds a database from persisted parts.
    pub(crate) fn assemble(
        zoom: u32,
        tiles: Vec<(u32, u32, GraphTile)>,
        edge_type_index: Arc<AttributeSetIndex>,
        turn_cost_index: Arc<AttributeSetIndex>,
        metadata: AttributeSet,
    ) -> Self {
        let slots = tiles
            .into_iter()
            .map(|(tile_id, generation, tile)| {
                (
                    tile_id,
                    TileSlot {
                        tile: Arc::new(tile),
                        edge_type_generation: generation,
                    },
                )
            })
            .collect();
        let network = RoutingNetwork::with_tiles(zoom, slots, edge_type_index, turn_cost_index, None);
        Self {
            zoom,
            latest: RwLock::new(Arc::new(network)),
            lifecycle: Mutex::new(Lifecycle::Idle),
            metadata: Mutex::new(metadata),
        }
    }

    pub(crate) fn publish(&self, network: Arc<RoutingNetwork>) {
        *self.latest.write() = network;
    }
}

impl std::fmt::Debug for RouterDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterDb")
            .field("zoom", &self.zoom)
            .field("latest", &*self.latest.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::DEFAULT_ZOOM;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn zoom_past_sixteen_is_rejected() {
        assert!(matches!(
            RouterDb::new(17),
            Err(GraphError::InvalidArgument(_))
        ));
    }

    #[test]
    fn one_writer_or_one_mutator_at_a_time() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        let writer = db.get_writer().expect("first writer");
        assert!(matches!(
            db.get_writer(),
            Err(GraphError::InvalidState(_))
        ));
        assert!(matches!(
            db.get_mutator(),
            Err(GraphError::InvalidState(_))
        ));
        drop(writer);

        let mutator = db.get_mutator().expect("mutator after writer drop");
        assert!(matches!(
            db.get_writer(),
            Err(GraphError::InvalidState(_))
        ));
        drop(mutator);
        assert!(db.get_writer().is_ok());
    }

    #[test]
    fn vertices_in_box_filters_by_coordinate() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            writer.add_vertex(0.0002, 0.0004);
            writer.add_vertex(0.0008, 0.0004);
            writer.add_vertex(0.0100, 0.0004);
        }
        let network = db.latest();
        let area = BoundingBox::new(0.0, 0.0, 0.001, 0.001);
        let found: Vec<_> = network.vertices_in_box(&area).collect();
        assert_eq!(found.len(), 2);
        for (_, (lon, lat)) in found {
            assert!(area.contains(lon, lat));
        }
    }

    #[test]
    fn edges_skips_mirror_records() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        let canonical = {
            let mut writer = db.get_writer().expect("writer");
            let east = writer.add_vertex(0.0005, 0.0005);
            let west = writer.add_vertex(-0.0005, 0.0005);
            writer.add_edge(east, west, &[], None, None).expect("edge")
        };
        let network = db.latest();
        assert_eq!(network.tile_count(), 2);
        let all: Vec<_> = network.edges().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), canonical);
    }

    #[test]
    fn usage_listener_sees_touched_tiles() {
        struct Counter(AtomicUsize);
        impl TileUsageListener for Counter {
            fn notify(&self, _tile_id: u32) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            writer.add_vertex(0.0002, 0.0004);
        }
        let network = db.latest();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        network.set_usage_listener(counter.clone());
        let _ = network.vertex(VertexId::new(geo::tile_for(0.0002, 0.0004, DEFAULT_ZOOM), 0));
        assert!(counter.0.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn replacing_the_edge_type_function_rewrites_tiles_lazily() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            let a = writer.add_vertex(0.0002, 0.0004);
            let b = writer.add_vertex(0.0008, 0.0004);
            let c = writer.add_vertex(0.0005, 0.0008);
            let first = AttributeSet::from_pairs([("highway", "residential"), ("name", "A")]);
            let second = AttributeSet::from_pairs([("highway", "residential"), ("name", "B")]);
            writer.add_edge(a, b, &[], Some(&first), None).expect("ab");
            writer.add_edge(b, c, &[], Some(&second), None).expect("bc");
        }
        // Identity classification keeps the bags apart.
        let before: Vec<_> = db.latest().edges().map(|e| e.edge_type_id()).collect();
        assert_ne!(before[0], before[1]);

        {
            let mut mutator = db.get_mutator().expect("mutator");
            mutator.set_edge_type_function(Arc::new(|bag: &AttributeSet| {
                AttributeSet::from_pairs(bag.iter().filter(|(k, _)| *k == "highway"))
            }));
            mutator.commit();
        }
        let after: Vec<_> = db.latest().edges().map(|e| e.edge_type_id()).collect();
        assert_eq!(after[0], after[1], "both edges share the classification");
        assert_ne!(before[0], after[0]);
    }

    #[test]
    fn mutator_additions_stay_invisible_until_commit() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            let a = writer.add_vertex(0.0002, 0.0004);
            let b = writer.add_vertex(0.0008, 0.0004);
            writer.add_edge(a, b, &[], None, None).expect("ab");
        }
        let reader = db.latest();
        assert_eq!(reader.edge_count(), 1);

        let mut mutator = db.get_mutator().expect("mutator");
        let c = mutator.add_vertex(0.0005, 0.0008);
        let a = VertexId::new(geo::tile_for(0.0002, 0.0004, DEFAULT_ZOOM), 0);
        mutator.add_edge(a, c, &[], None, None).expect("ac");
        assert_eq!(reader.edge_count(), 1, "reader still sees the old value");
        assert_eq!(db.latest().edge_count(), 1, "latest unchanged before commit");

        mutator.commit();
        assert_eq!(reader.edge_count(), 1, "held snapshot is immutable");
        assert_eq!(db.latest().edge_count(), 2);
    }
}
