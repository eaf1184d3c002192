//! The exclusive copy-on-write mutation handle.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::attributes::{AttributeSet, AttributeSetIndex, ClassifyFn};
use crate::error::{GraphError, Result};
use crate::geo::{self, Coordinate};
use crate::model::{EdgeId, VertexId};
use crate::tile::GraphTile;

use super::{RouterDb, RoutingNetwork, TileSlot};

/// Prepares the next network version while readers keep the current one.
///
/// Every touched tile is cloned once into a private map; `commit` assembles
/// a new [`RoutingNetwork`] from the base slots plus the clones and swaps it
/// into the database's `Latest`. Dropping without committing discards the
/// clones.
pub struct GraphMutator<'a> {
    db: &'a RouterDb,
    base: Arc<RoutingNetwork>,
    touched: HashMap<u32, (GraphTile, u32)>,
    edge_type_index: Arc<AttributeSetIndex>,
    turn_cost_index: Arc<AttributeSetIndex>,
}

impl<'a> std::fmt::Debug for GraphMutator<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphMutator")
            .field("touched", &self.touched.len())
            .finish_non_exhaustive()
    }
}

impl<'a> GraphMutator<'a> {
    pub(crate) fn new(db: &'a RouterDb, base: Arc<RoutingNetwork>) -> Self {
        let edge_type_index = Arc::clone(base.edge_type_index());
        let turn_cost_index = Arc::clone(base.turn_cost_index());
        Self {
            db,
            base,
            touched: HashMap::new(),
            edge_type_index,
            turn_cost_index,
        }
    }

    /// The immutable network this mutation is based on.
    pub fn base(&self) -> &Arc<RoutingNetwork> {
        &self.base
    }

    fn tile_mut(&mut self, tile_id: u32) -> &mut GraphTile {
        let generation = self.edge_type_index.generation();
        let base = &self.base;
        let zoom = base.zoom();
        let (tile, _) = self.touched.entry(tile_id).or_insert_with(|| {
            let tile = match base.tile_snapshot(tile_id) {
                Some(tile) => (*tile).clone(),
                None => GraphTile::new(zoom, tile_id),
            };
            (tile, generation)
        });
        tile
    }

    fn vertex_coordinate(&self, vertex: VertexId) -> Option<Coordinate> {
        if let Some((tile, _)) = self.touched.get(&vertex.tile_id) {
            return tile.try_get_vertex(vertex);
        }
        self.base.vertex(vertex)
    }

    pub fn add_vertex(&mut self, lon: f64, lat: f64) -> VertexId {
        let tile_id = geo::tile_for(lon, lat, self.base.zoom());
        self.tile_mut(tile_id).add_vertex(lon, lat)
    }

    /// Same contract as [`super::GraphWriter::add_edge`], against the
    /// private clones.
    pub fn add_edge(
        &mut self,
        v1: VertexId,
        v2: VertexId,
        shape: &[Coordinate],
        attributes: Option<&AttributeSet>,
        length_cm: Option<u32>,
    ) -> Result<EdgeId> {
        let edge_type_id = attributes.map(|bag| self.edge_type_index.get(bag));
        let from = self
            .vertex_coordinate(v1)
            .ok_or(GraphError::NotFound("vertex"))?;
        let to = self
            .vertex_coordinate(v2)
            .ok_or(GraphError::NotFound("vertex"))?;
        let length_cm = length_cm.unwrap_or_else(|| {
            let mut line = Vec::with_capacity(shape.len() + 2);
            line.push(from);
            line.extend_from_slice(shape);
            line.push(to);
            (geo::polyline_length_m(&line) * 100.0).round() as u32
        });

        let canonical = self.tile_mut(v1.tile_id).add_edge(
            v1,
            v2,
            Some(shape),
            attributes,
            None,
            edge_type_id,
            Some(length_cm),
        )?;
        if v2.tile_id != v1.tile_id {
            let mut reversed: Vec<Coordinate> = shape.to_vec();
            reversed.reverse();
            self.tile_mut(v2.tile_id).add_edge(
                v1,
                v2,
                Some(&reversed),
                attributes,
                Some(canonical),
                edge_type_id,
                Some(length_cm),
            )?;
        }
        Ok(canonical)
    }

    pub fn add_turn_costs(
        &mut self,
        vertex: VertexId,
        attributes: &AttributeSet,
        edges: &[EdgeId],
        costs: &[u32],
    ) -> Result<()> {
        let turn_cost_type = self.turn_cost_index.get(attributes);
        self.tile_mut(vertex.tile_id)
            .add_turn_costs(vertex, turn_cost_type, edges.to_vec(), costs.to_vec())
    }

    /// Replaces the edge-type classification for the committed network.
    ///
    /// Interned ids are preserved; tiles written against the old function
    /// are rewritten lazily when the committed network first touches them.
    pub fn set_edge_type_function(&mut self, classify: ClassifyFn) {
        self.edge_type_index = Arc::new(self.edge_type_index.next(classify));
    }

    pub fn set_turn_cost_function(&mut self, classify: ClassifyFn) {
        self.turn_cost_index = Arc::new(self.turn_cost_index.next(classify));
    }

    /// Atomically publishes the prepared network as `Latest`.
    pub fn commit(mut self) -> Arc<RoutingNetwork> {
        let mut slots = self.base.clone_slots();
        let touched = std::mem::take(&mut self.touched);
        let touched_count = touched.len();
        for (tile_id, (tile, generation)) in touched {
            slots.insert(
                tile_id,
                TileSlot {
                    tile: Arc::new(tile),
                    edge_type_generation: generation,
                },
            );
        }
        let network = Arc::new(RoutingNetwork::with_tiles(
            self.base.zoom(),
            slots,
            Arc::clone(&self.edge_type_index),
            Arc::clone(&self.turn_cost_index),
            self.base.usage_listener(),
        ));
        self.db.publish(Arc::clone(&network));
        debug!(touched = touched_count, "graph mutator committed");
        network
    }
}

impl Drop for GraphMutator<'_> {
    fn drop(&mut self) {
        debug!("graph mutator released");
        self.db.release();
    }
}
