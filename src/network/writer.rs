//! The exclusive append-only write handle.

use std::sync::Arc;

use tracing::debug;

use crate::attributes::AttributeSet;
use crate::error::{GraphError, Result};
use crate::geo::{self, Coordinate};
use crate::model::{EdgeId, VertexId};
use crate::tile::GraphTile;

use super::{RouterDb, RoutingNetwork, TileSlot};

/// Appends vertices, edges and turn costs to the latest network in place.
///
/// Only one writer (or mutator) exists at a time; readers of the same
/// network value are logically frozen while it is live. Dropping the writer
/// returns the database to the idle state.
pub struct GraphWriter<'a> {
    db: &'a RouterDb,
    network: Arc<RoutingNetwork>,
}

impl<'a> GraphWriter<'a> {
    pub(crate) fn new(db: &'a RouterDb, network: Arc<RoutingNetwork>) -> Self {
        Self { db, network }
    }

    pub fn network(&self) -> &Arc<RoutingNetwork> {
        &self.network
    }

    /// Adds a vertex to the tile owning `(lon, lat)`, creating the tile on
    /// first use.
    pub fn add_vertex(&mut self, lon: f64, lat: f64) -> VertexId {
        let zoom = self.network.zoom();
        let tile_id = geo::tile_for(lon, lat, zoom);
        let generation = self.network.edge_type_index().generation();
        let mut tiles = self.network.tiles().write();
        let slot = tiles.entry(tile_id).or_insert_with(|| TileSlot {
            tile: Arc::new(GraphTile::new(zoom, tile_id)),
            edge_type_generation: generation,
        });
        Arc::make_mut(&mut slot.tile).add_vertex(lon, lat)
    }

    /// Adds an edge between two existing vertices.
    ///
    /// The canonical record lands in `v1`'s tile; a tile-crossing edge also
    /// leaves a mirror record (reversed geometry, same canonical id) in
    /// `v2`'s tile. The edge type is classified from `attributes` and the
    /// length is measured from the geometry when not supplied.
    pub fn add_edge(
        &mut self,
        v1: VertexId,
        v2: VertexId,
        shape: &[Coordinate],
        attributes: Option<&AttributeSet>,
        length_cm: Option<u32>,
    ) -> Result<EdgeId> {
        let edge_type_id = attributes.map(|bag| self.network.edge_type_index().get(bag));
        let mut tiles = self.network.tiles().write();

        let from = tiles
            .get(&v1.tile_id)
            .and_then(|slot| slot.tile.try_get_vertex(v1))
            .ok_or(GraphError::NotFound("vertex"))?;
        let to = tiles
            .get(&v2.tile_id)
            .and_then(|slot| slot.tile.try_get_vertex(v2))
            .ok_or(GraphError::NotFound("vertex"))?;

        let length_cm = length_cm.unwrap_or_else(|| {
            let mut line = Vec::with_capacity(shape.len() + 2);
            line.push(from);
            line.extend_from_slice(shape);
            line.push(to);
            (geo::polyline_length_m(&line) * 100.0).round() as u32
        });

        let canonical_slot = tiles
            .get_mut(&v1.tile_id)
            .ok_or(GraphError::NotFound("tile"))?;
        let canonical = Arc::make_mut(&mut canonical_slot.tile).add_edge(
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
            let mirror_slot = tiles
                .get_mut(&v2.tile_id)
                .ok_or(GraphError::NotFound("tile"))?;
            Arc::make_mut(&mut mirror_slot.tile).add_edge(
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

    /// Registers an N x N turn-cost matrix at `vertex`, classified through
    /// the turn-cost index.
    pub fn add_turn_costs(
        &mut self,
        vertex: VertexId,
        attributes: &AttributeSet,
        edges: &[EdgeId],
        costs: &[u32],
    ) -> Result<()> {
        let turn_cost_type = self.network.turn_cost_index().get(attributes);
        let mut tiles = self.network.tiles().write();
        let slot = tiles
            .get_mut(&vertex.tile_id)
            .ok_or(GraphError::NotFound("tile"))?;
        Arc::make_mut(&mut slot.tile).add_turn_costs(
            vertex,
            turn_cost_type,
            edges.to_vec(),
            costs.to_vec(),
        )
    }
}

impl Drop for GraphWriter<'_> {
    fn drop(&mut self) {
        debug!("graph writer released");
        self.db.release();
    }
}
