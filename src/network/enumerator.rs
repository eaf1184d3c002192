//! Read-only views over edges, for traversal and for cost callbacks.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::attributes::AttributeSet;
use crate::geo::Coordinate;
use crate::model::{EdgeId, VertexId};
use crate::tile::{EdgeRecord, GraphTile};

use super::RoutingNetwork;

/// One edge, oriented the way it was reached.
///
/// This is the accessor surface handed to cost callbacks: canonical id,
/// direction, endpoints, stored attributes, geometry and turn-cost tables
/// are all reachable from here.
#[derive(Clone)]
pub struct EdgeView {
    tile: Arc<GraphTile>,
    record: EdgeRecord,
    canonical: EdgeId,
    mirror: bool,
    tail: VertexId,
}

impl EdgeView {
    pub(crate) fn new(tile: Arc<GraphTile>, record: EdgeRecord, tail: VertexId) -> Self {
        let canonical = tile.canonical_id(&record);
        let mirror = tile.is_mirror(&record);
        Self {
            tile,
            record,
            canonical,
            mirror,
            tail,
        }
    }

    /// The canonical edge id, also for mirror records.
    pub fn id(&self) -> EdgeId {
        self.canonical
    }

    /// True when the traversal follows the edge's native direction.
    pub fn forward(&self) -> bool {
        let record_forward = self.record.vertex1 == self.tail;
        record_forward ^ self.mirror
    }

    /// The vertex this traversal leaves from.
    pub fn tail(&self) -> VertexId {
        self.tail
    }

    /// The vertex this traversal arrives at.
    pub fn head(&self) -> VertexId {
        self.record.other(self.tail)
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror
    }

    pub fn edge_type_id(&self) -> Option<u32> {
        self.record.edge_type_id
    }

    pub fn length_cm(&self) -> Option<u32> {
        self.record.length_cm
    }

    /// The full attribute bag, empty when the edge stored none.
    pub fn attributes(&self) -> AttributeSet {
        match self.record.attribute_pointer {
            Some(pointer) => self.tile.attributes_at(pointer),
            None => AttributeSet::new(),
        }
    }

    /// Intermediate shape points in traversal order (endpoints excluded).
    pub fn shape(&self) -> Vec<Coordinate> {
        let mut points = match self.record.shape_pointer {
            Some(pointer) => self.tile.shape_at(pointer),
            None => Vec::new(),
        };
        if self.record.vertex1 != self.tail {
            points.reverse();
        }
        points
    }

    /// Turn costs applying when pivoting from `previous` onto this edge at
    /// the tail vertex, as `(turn_cost_type, cost)` pairs.
    pub fn turn_costs_from(&self, previous: EdgeId) -> SmallVec<[(u32, u32); 2]> {
        let mut found = SmallVec::new();
        for table in self.tile.turn_cost_tables(self.tail) {
            if let Some(cost) = table.cost_between(previous, self.canonical) {
                found.push((table.turn_cost_type, cost));
            }
        }
        found
    }

}

impl std::fmt::Debug for EdgeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeView")
            .field("id", &self.canonical)
            .field("forward", &self.forward())
            .field("tail", &self.tail)
            .field("head", &self.head())
            .finish()
    }
}

/// Walks the edges incident to one vertex at a time.
///
/// Reusable: `move_to` repositions it on another vertex, demand-loading the
/// owning tile through the network's usage listener.
pub struct EdgeEnumerator<'a> {
    network: &'a RoutingNetwork,
    tile: Option<Arc<GraphTile>>,
    vertex: VertexId,
    next: Option<u32>,
}

impl<'a> EdgeEnumerator<'a> {
    pub(crate) fn new(network: &'a RoutingNetwork) -> Self {
        Self {
            network,
            tile: None,
            vertex: VertexId::EMPTY,
            next: None,
        }
    }

    /// Positions the enumerator on `vertex`. Returns false when the vertex
    /// does not exist.
    pub fn move_to(&mut self, vertex: VertexId) -> bool {
        self.vertex = vertex;
        self.next = None;
        self.tile = self.network.tile_snapshot(vertex.tile_id);
        let Some(tile) = &self.tile else {
            return false;
        };
        if vertex.local_id >= tile.vertex_count() {
            return false;
        }
        self.next = tile.adjacency(vertex).next().map(|record| record.offset);
        true
    }
}

impl Iterator for EdgeEnumerator<'_> {
    type Item = EdgeView;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let tile = self.tile.as_ref()?;
        let record = tile.record_at(offset);
        self.next = if record.vertex1 == self.vertex {
            record.prev1
        } else {
            record.prev2
        };
        Some(EdgeView::new(Arc::clone(tile), record, self.vertex))
    }
}
