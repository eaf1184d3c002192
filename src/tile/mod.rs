//! One spatial tile of the routing graph.
//!
//! A tile owns byte arenas for vertex coordinates, edge records, shapes,
//! attribute runs and interned strings, plus the per-vertex head pointers
//! that anchor the intrusive edge chains. All public operations are either
//! read-only (safe to share across readers) or append-only (reached through
//! the unique writer or a mutator's private clone).

mod turn_costs;

pub use turn_costs::TurnCostTable;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::attributes::{AttributeSet, AttributeSetIndex};
use crate::codec;
use crate::error::{GraphError, Result};
use crate::geo::{self, BoundingBox, Coordinate};
use crate::model::{EdgeId, VertexId, MIN_CROSS_ID};

/// Sentinel in the per-vertex head pointer array: no incident edges.
const VERTEX_HEAD_NONE: u32 = u32::MAX;

/// Cells per axis of the per-tile coordinate grid.
const COORD_CELLS: u32 = (1 << 12) - 1;

/// Bytes per axis of a stored coordinate.
const COORD_AXIS_BYTES: usize = 3;

/// Upper bound on the encoded size of one edge record.
const MAX_EDGE_RECORD: usize = 64;

/// A decoded edge record.
///
/// `vertex1` is always resident in the owning tile; for tile-crossing edges
/// `vertex2` lives in the neighbouring tile and `canonical_id` carries the
/// edge's canonical identity (which names the other tile in mirror records).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeRecord {
    pub offset: u32,
    pub size: u32,
    pub vertex1: VertexId,
    pub vertex2: VertexId,
    pub prev1: Option<u32>,
    pub prev2: Option<u32>,
    pub canonical_id: Option<EdgeId>,
    pub edge_type_id: Option<u32>,
    pub length_cm: Option<u32>,
    pub shape_pointer: Option<u32>,
    pub attribute_pointer: Option<u32>,
}

impl EdgeRecord {
    pub fn is_cross(&self) -> bool {
        self.vertex1.tile_id != self.vertex2.tile_id
    }

    /// The endpoint opposite `vertex`.
    pub fn other(&self, vertex: VertexId) -> VertexId {
        if self.vertex1 == vertex {
            self.vertex2
        } else {
            self.vertex1
        }
    }
}

#[derive(Clone, Debug)]
pub struct GraphTile {
    zoom: u32,
    tile_id: u32,
    bounds: BoundingBox,
    next_vertex_id: u32,
    next_edge_id: u32,
    edges_tail: u32,
    next_attribute_pointer: u32,
    next_shape_pointer: u32,
    next_string_id: u32,
    strings_tail: u32,
    pointers: Vec<u32>,
    edge_index: Vec<u32>,
    edges: Vec<u8>,
    coordinates: Arc<Vec<u8>>,
    shapes: Arc<Vec<u8>>,
    attributes: Arc<Vec<u8>>,
    strings: Arc<Vec<u8>>,
    string_index: Arc<Vec<u32>>,
    string_lookup: Arc<HashMap<String, u32>>,
    turn_costs: Arc<BTreeMap<u32, Vec<TurnCostTable>>>,
}

impl GraphTile {
    pub fn new(zoom: u32, tile_id: u32) -> Self {
        Self {
            zoom,
            tile_id,
            bounds: geo::tile_bounds(tile_id, zoom),
            next_vertex_id: 0,
            next_edge_id: 0,
            edges_tail: 0,
            next_attribute_pointer: 0,
            next_shape_pointer: 0,
            next_string_id: 0,
            strings_tail: 0,
            pointers: Vec::new(),
            edge_index: Vec::new(),
            edges: Vec::new(),
            coordinates: Arc::new(Vec::new()),
            shapes: Arc::new(Vec::new()),
            attributes: Arc::new(Vec::new()),
            strings: Arc::new(Vec::new()),
            string_index: Arc::new(Vec::new()),
            string_lookup: Arc::new(HashMap::new()),
            turn_costs: Arc::new(BTreeMap::new()),
        }
    }

    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    pub fn tile_id(&self) -> u32 {
        self.tile_id
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    pub fn vertex_count(&self) -> u32 {
        self.next_vertex_id
    }

    pub fn edge_count(&self) -> u32 {
        self.next_edge_id
    }

    // ---- vertices ----

    /// Quantizes `(lon, lat)` onto the tile grid and appends it.
    pub fn add_vertex(&mut self, lon: f64, lat: f64) -> VertexId {
        let local_id = self.next_vertex_id;
        let qx = self.quantize(lon, self.bounds.min_lon, self.bounds.max_lon);
        let qy = self.quantize(lat, self.bounds.min_lat, self.bounds.max_lat);
        let coordinates = Arc::make_mut(&mut self.coordinates);
        let pos = local_id as usize * COORD_AXIS_BYTES * 2;
        codec::write_fixed(coordinates, pos, COORD_AXIS_BYTES, qx as u64);
        codec::write_fixed(coordinates, pos + COORD_AXIS_BYTES, COORD_AXIS_BYTES, qy as u64);
        self.pointers.push(VERTEX_HEAD_NONE);
        self.next_vertex_id += 1;
        VertexId::new(self.tile_id, local_id)
    }

    /// Dequantized coordinate of a vertex, `None` when it does not exist in
    /// this tile.
    pub fn try_get_vertex(&self, vertex: VertexId) -> Option<Coordinate> {
        if vertex.tile_id != self.tile_id || vertex.local_id >= self.next_vertex_id {
            return None;
        }
        let pos = vertex.local_id as usize * COORD_AXIS_BYTES * 2;
        let qx = codec::read_fixed(&self.coordinates, pos, COORD_AXIS_BYTES) as u32;
        let qy = codec::read_fixed(&self.coordinates, pos + COORD_AXIS_BYTES, COORD_AXIS_BYTES) as u32;
        Some((
            self.dequantize(qx, self.bounds.min_lon, self.bounds.max_lon),
            self.dequantize(qy, self.bounds.min_lat, self.bounds.max_lat),
        ))
    }

    fn quantize(&self, value: f64, min: f64, max: f64) -> u32 {
        let t = (value - min) / (max - min) * COORD_CELLS as f64;
        t.round().clamp(0.0, COORD_CELLS as f64) as u32
    }

    fn dequantize(&self, cell: u32, min: f64, max: f64) -> f64 {
        min + cell as f64 / COORD_CELLS as f64 * (max - min)
    }

    // ---- edges ----

    /// Appends an edge record.
    ///
    /// When `v1` lives in another tile this is the mirror record of an edge
    /// canonical elsewhere: `edge_id` must carry the canonical id and the
    /// endpoints are swapped so the locally resident endpoint is recorded
    /// first. Otherwise a fresh id `(tile_id, next_edge_id)` is allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn add_edge(
        &mut self,
        v1: VertexId,
        v2: VertexId,
        shape: Option<&[Coordinate]>,
        attributes: Option<&AttributeSet>,
        edge_id: Option<EdgeId>,
        edge_type_id: Option<u32>,
        length_cm: Option<u32>,
    ) -> Result<EdgeId> {
        if v1.is_empty() || v2.is_empty() {
            return Err(GraphError::InvalidArgument(
                "edge endpoints must not be the empty sentinel".into(),
            ));
        }
        let mirror = v1.tile_id != self.tile_id;
        let (a, b) = if mirror { (v2, v1) } else { (v1, v2) };
        if a.tile_id != self.tile_id {
            return Err(GraphError::InvalidArgument(format!(
                "edge {v1:?} -> {v2:?} has no endpoint in tile {}",
                self.tile_id
            )));
        }
        if a.local_id >= self.next_vertex_id {
            return Err(GraphError::NotFound("vertex"));
        }
        let cross = b.tile_id != self.tile_id;
        if !cross && b.local_id >= self.next_vertex_id {
            return Err(GraphError::NotFound("vertex"));
        }

        let index = self.next_edge_id;
        let (own_id, canonical) = if mirror {
            // Mirror of an edge canonical in the neighbouring tile.
            let id = edge_id.ok_or_else(|| {
                GraphError::InvalidArgument(
                    "cross-tile mirror requires the canonical edge id".into(),
                )
            })?;
            if id.tile_id == self.tile_id {
                return Err(GraphError::InvalidArgument(
                    "mirror record requires a foreign canonical id".into(),
                ));
            }
            (EdgeId::new(self.tile_id, MIN_CROSS_ID + index), Some(id))
        } else {
            if edge_id.is_some() {
                return Err(GraphError::InvalidArgument(
                    "canonical edge ids are allocated by the owning tile".into(),
                ));
            }
            let id = EdgeId::new(self.tile_id, index);
            (id, cross.then_some(id))
        };

        let shape_pointer = match shape {
            Some(points) if !points.is_empty() => Some(self.append_shape(points)),
            _ => None,
        };
        let attribute_pointer = match attributes {
            Some(bag) if !bag.is_empty() => Some(self.append_attributes(bag)),
            _ => None,
        };

        self.edges_tail = append_record(
            &mut self.edges,
            &mut self.edge_index,
            &mut self.pointers,
            self.edges_tail,
            self.tile_id,
            a,
            b,
            canonical,
            edge_type_id,
            length_cm,
            shape_pointer,
            attribute_pointer,
        );
        self.next_edge_id += 1;
        Ok(own_id)
    }

    /// Decodes the record starting at `offset`. The arena is trusted.
    pub fn record_at(&self, offset: u32) -> EdgeRecord {
        let buf = &self.edges;
        let mut pos = offset as usize;
        let (raw1, size) = codec::read_varuint(buf, pos);
        pos += size;
        let (raw2, size) = codec::read_varuint(buf, pos);
        pos += size;
        let vertex1 = self.decode_vertex(raw1);
        let vertex2 = self.decode_vertex(raw2);
        let (prev1, size) = codec::read_varuint_nullable(buf, pos);
        pos += size;
        let (prev2, size) = codec::read_varuint_nullable(buf, pos);
        pos += size;
        let canonical_id = if vertex1.tile_id != vertex2.tile_id {
            let (raw, size) = codec::read_varuint(buf, pos);
            pos += size;
            Some(EdgeId::decode(raw))
        } else {
            None
        };
        let (edge_type_id, size) = codec::read_varuint_nullable(buf, pos);
        pos += size;
        let (length_cm, size) = codec::read_varuint_nullable(buf, pos);
        pos += size;
        let (shape_pointer, size) = codec::read_varuint_nullable(buf, pos);
        pos += size;
        let (attribute_pointer, size) = codec::read_varuint_nullable(buf, pos);
        pos += size;
        EdgeRecord {
            offset,
            size: pos as u32 - offset,
            vertex1,
            vertex2,
            prev1: prev1.map(|v| v as u32),
            prev2: prev2.map(|v| v as u32),
            canonical_id,
            edge_type_id: edge_type_id.map(|v| v as u32),
            length_cm: length_cm.map(|v| v as u32),
            shape_pointer: shape_pointer.map(|v| v as u32),
            attribute_pointer: attribute_pointer.map(|v| v as u32),
        }
    }

    pub fn record_by_index(&self, index: u32) -> Option<EdgeRecord> {
        let offset = *self.edge_index.get(index as usize)?;
        Some(self.record_at(offset))
    }

    /// Resolves an edge id (canonical or mirror) owned by this tile.
    pub fn resolve(&self, edge: EdgeId) -> Option<EdgeRecord> {
        if edge.tile_id != self.tile_id {
            return None;
        }
        let index = if edge.local_id >= MIN_CROSS_ID {
            edge.local_id - MIN_CROSS_ID
        } else {
            edge.local_id
        };
        self.record_by_index(index)
    }

    /// The canonical id of a decoded record.
    pub fn canonical_id(&self, record: &EdgeRecord) -> EdgeId {
        match record.canonical_id {
            Some(id) => id,
            None => EdgeId::new(self.tile_id, self.index_of(record.offset)),
        }
    }

    /// True when `record` mirrors an edge canonical in another tile.
    pub fn is_mirror(&self, record: &EdgeRecord) -> bool {
        record
            .canonical_id
            .map(|id| id.tile_id != self.tile_id)
            .unwrap_or(false)
    }

    fn index_of(&self, offset: u32) -> u32 {
        self.edge_index
            .binary_search(&offset)
            .expect("record offset is registered") as u32
    }

    fn decode_vertex(&self, raw: u64) -> VertexId {
        if raw >> 32 == 0 {
            VertexId::new(self.tile_id, raw as u32)
        } else {
            VertexId::decode(raw)
        }
    }

    /// Walks the intrusive edge chain of a local vertex, newest record
    /// first.
    pub fn adjacency(&self, vertex: VertexId) -> TileAdjacency<'_> {
        let next = if vertex.tile_id == self.tile_id {
            self.pointers
                .get(vertex.local_id as usize)
                .copied()
                .filter(|&head| head != VERTEX_HEAD_NONE)
        } else {
            None
        };
        TileAdjacency {
            tile: self,
            vertex,
            next,
        }
    }

    /// All records in insertion order, mirrors included.
    pub fn records(&self) -> impl Iterator<Item = (u32, EdgeRecord)> + '_ {
        (0..self.next_edge_id).map(move |i| (i, self.record_at(self.edge_index[i as usize])))
    }

    // ---- shapes ----

    fn append_shape(&mut self, points: &[Coordinate]) -> u32 {
        let pointer = self.next_shape_pointer;
        let shapes = Arc::make_mut(&mut self.shapes);
        let mut pos = pointer as usize;
        pos += codec::write_varuint(shapes, pos, points.len() as u64);
        for &(lon, lat) in points {
            let qlon = (lon * 1e7).round() as i32;
            let qlat = (lat * 1e7).round() as i32;
            pos += codec::write_fixed(shapes, pos, 4, qlon as u32 as u64);
            pos += codec::write_fixed(shapes, pos, 4, qlat as u32 as u64);
        }
        self.next_shape_pointer = pos as u32;
        pointer
    }

    /// Intermediate shape points stored at `pointer`, in record order.
    pub fn shape_at(&self, pointer: u32) -> Vec<Coordinate> {
        let mut pos = pointer as usize;
        let (count, size) = codec::read_varuint(&self.shapes, pos);
        pos += size;
        let mut points = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let qlon = codec::read_fixed(&self.shapes, pos, 4) as u32 as i32;
            pos += 4;
            let qlat = codec::read_fixed(&self.shapes, pos, 4) as u32 as i32;
            pos += 4;
            points.push((qlon as f64 / 1e7, qlat as f64 / 1e7));
        }
        points
    }

    // ---- strings and attribute runs ----

    fn intern_string(&mut self, value: &str) -> u32 {
        if let Some(&id) = self.string_lookup.get(value) {
            return id;
        }
        let id = self.next_string_id;
        let strings = Arc::make_mut(&mut self.strings);
        let mut pos = self.strings_tail as usize;
        pos += codec::write_varuint(strings, pos, value.len() as u64);
        codec::ensure_capacity(strings, pos, value.len());
        strings[pos..pos + value.len()].copy_from_slice(value.as_bytes());
        pos += value.len();
        Arc::make_mut(&mut self.string_index).push(self.strings_tail);
        Arc::make_mut(&mut self.string_lookup).insert(value.to_owned(), id);
        self.strings_tail = pos as u32;
        self.next_string_id += 1;
        id
    }

    pub fn string_at(&self, id: u32) -> Option<&str> {
        let offset = *self.string_index.get(id as usize)? as usize;
        let (len, size) = codec::read_varuint(&self.strings, offset);
        let start = offset + size;
        std::str::from_utf8(&self.strings[start..start + len as usize]).ok()
    }

    fn append_attributes(&mut self, bag: &AttributeSet) -> u32 {
        let ids: Vec<(u32, u32)> = bag
            .iter()
            .map(|(k, v)| {
                let k = self.intern_string(k);
                let v = self.intern_string(v);
                (k, v)
            })
            .collect();
        let pointer = self.next_attribute_pointer;
        let attributes = Arc::make_mut(&mut self.attributes);
        let mut pos = pointer as usize;
        pos += codec::write_varuint(attributes, pos, ids.len() as u64);
        for (k, v) in ids {
            pos += codec::write_varuint(attributes, pos, k as u64);
            pos += codec::write_varuint(attributes, pos, v as u64);
        }
        self.next_attribute_pointer = pos as u32;
        pointer
    }

    /// The attribute bag stored at `pointer`.
    pub fn attributes_at(&self, pointer: u32) -> AttributeSet {
        let mut pos = pointer as usize;
        let (count, size) = codec::read_varuint(&self.attributes, pos);
        pos += size;
        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (k, size) = codec::read_varuint(&self.attributes, pos);
            pos += size;
            let (v, size) = codec::read_varuint(&self.attributes, pos);
            pos += size;
            let key = self.string_at(k as u32).unwrap_or_default().to_owned();
            let value = self.string_at(v as u32).unwrap_or_default().to_owned();
            pairs.push((key, value));
        }
        AttributeSet::from_pairs(pairs)
    }

    // ---- turn costs ----

    pub fn add_turn_costs(
        &mut self,
        vertex: VertexId,
        turn_cost_type: u32,
        edges: Vec<EdgeId>,
        costs: Vec<u32>,
    ) -> Result<()> {
        if vertex.tile_id != self.tile_id || vertex.local_id >= self.next_vertex_id {
            return Err(GraphError::NotFound("vertex"));
        }
        let table = TurnCostTable::new(turn_cost_type, edges, costs)?;
        Arc::make_mut(&mut self.turn_costs)
            .entry(vertex.local_id)
            .or_default()
            .push(table);
        Ok(())
    }

    pub fn turn_cost_tables(&self, vertex: VertexId) -> &[TurnCostTable] {
        if vertex.tile_id != self.tile_id {
            return &[];
        }
        self.turn_costs
            .get(&vertex.local_id)
            .map(|tables| tables.as_slice())
            .unwrap_or(&[])
    }

    // ---- classification rewrite ----

    /// Rewrites every record's `edge_type_id` through `index`.
    ///
    /// The edges arena and the vertex chains are rebuilt record by record;
    /// coordinate, shape, attribute and string arenas are shared with the
    /// source tile. Record order, and therefore edge ids, are preserved.
    pub fn apply_edge_type_fn(&self, index: &AttributeSetIndex) -> GraphTile {
        let mut edges = Vec::new();
        let mut edge_index = Vec::with_capacity(self.edge_index.len());
        let mut pointers = vec![VERTEX_HEAD_NONE; self.pointers.len()];
        let mut tail = 0u32;
        for (_, record) in self.records() {
            let edge_type_id = record
                .attribute_pointer
                .map(|pointer| index.get(&self.attributes_at(pointer)));
            tail = append_record(
                &mut edges,
                &mut edge_index,
                &mut pointers,
                tail,
                self.tile_id,
                record.vertex1,
                record.vertex2,
                record.canonical_id,
                edge_type_id,
                record.length_cm,
                record.shape_pointer,
                record.attribute_pointer,
            );
        }
        GraphTile {
            zoom: self.zoom,
            tile_id: self.tile_id,
            bounds: self.bounds,
            next_vertex_id: self.next_vertex_id,
            next_edge_id: self.next_edge_id,
            edges_tail: tail,
            next_attribute_pointer: self.next_attribute_pointer,
            next_shape_pointer: self.next_shape_pointer,
            next_string_id: self.next_string_id,
            strings_tail: self.strings_tail,
            pointers,
            edge_index,
            edges,
            coordinates: Arc::clone(&self.coordinates),
            shapes: Arc::clone(&self.shapes),
            attributes: Arc::clone(&self.attributes),
            strings: Arc::clone(&self.strings),
            string_index: Arc::clone(&self.string_index),
            string_lookup: Arc::clone(&self.string_lookup),
            turn_costs: Arc::clone(&self.turn_costs),
        }
    }

    // ---- persistence access ----

    pub(crate) fn counters(&self) -> [u32; 7] {
        [
            self.next_vertex_id,
            self.next_edge_id,
            self.edges_tail,
            self.next_attribute_pointer,
            self.next_shape_pointer,
            self.next_string_id,
            self.strings_tail,
        ]
    }

    pub(crate) fn edges_bytes(&self) -> &[u8] {
        &self.edges[..self.edges_tail as usize]
    }

    pub(crate) fn coordinates_bytes(&self) -> &[u8] {
        &self.coordinates[..self.next_vertex_id as usize * COORD_AXIS_BYTES * 2]
    }

    pub(crate) fn shapes_bytes(&self) -> &[u8] {
        &self.shapes[..self.next_shape_pointer as usize]
    }

    pub(crate) fn attributes_bytes(&self) -> &[u8] {
        &self.attributes[..self.next_attribute_pointer as usize]
    }

    pub(crate) fn strings_bytes(&self) -> &[u8] {
        &self.strings[..self.strings_tail as usize]
    }

    pub(crate) fn pointers_slice(&self) -> &[u32] {
        &self.pointers
    }

    pub(crate) fn turn_cost_map(&self) -> &BTreeMap<u32, Vec<TurnCostTable>> {
        &self.turn_costs
    }

    /// Rebuilds a tile from persisted arenas, re-deriving the derived
    /// indexes and validating what it scans.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        zoom: u32,
        tile_id: u32,
        counters: [u32; 7],
        pointers: Vec<u32>,
        edges: Vec<u8>,
        coordinates: Vec<u8>,
        shapes: Vec<u8>,
        attributes: Vec<u8>,
        strings: Vec<u8>,
        turn_costs: BTreeMap<u32, Vec<TurnCostTable>>,
    ) -> Result<Self> {
        let [next_vertex_id, next_edge_id, edges_tail, next_attribute_pointer, next_shape_pointer, next_string_id, strings_tail] =
            counters;
        if pointers.len() != next_vertex_id as usize {
            return Err(GraphError::Corruption(format!(
                "tile {tile_id}: head pointer array does not match vertex count"
            )));
        }
        if coordinates.len() < next_vertex_id as usize * COORD_AXIS_BYTES * 2 {
            return Err(GraphError::Corruption(format!(
                "tile {tile_id}: coordinate arena truncated"
            )));
        }
        if edges.len() < edges_tail as usize
            || strings.len() < strings_tail as usize
            || shapes.len() < next_shape_pointer as usize
            || attributes.len() < next_attribute_pointer as usize
        {
            return Err(GraphError::Corruption(format!(
                "tile {tile_id}: arena shorter than its tail pointer"
            )));
        }
        let mut tile = Self {
            zoom,
            tile_id,
            bounds: geo::tile_bounds(tile_id, zoom),
            next_vertex_id,
            next_edge_id,
            edges_tail,
            next_attribute_pointer,
            next_shape_pointer,
            next_string_id,
            strings_tail,
            pointers,
            edge_index: Vec::with_capacity(next_edge_id as usize),
            edges,
            coordinates: Arc::new(coordinates),
            shapes: Arc::new(shapes),
            attributes: Arc::new(attributes),
            strings: Arc::new(strings),
            string_index: Arc::new(Vec::with_capacity(next_string_id as usize)),
            string_lookup: Arc::new(HashMap::new()),
            turn_costs: Arc::new(turn_costs),
        };

        // Records are self-delimiting; a bounds-checked sequential scan
        // recovers the index-to-offset table.
        let mut offset = 0u32;
        let mut edge_index = Vec::with_capacity(next_edge_id as usize);
        for _ in 0..next_edge_id {
            let Some(end) = checked_record_end(&tile.edges, offset, edges_tail, tile_id) else {
                return Err(GraphError::Corruption(format!(
                    "tile {tile_id}: edge record at {offset} malformed"
                )));
            };
            edge_index.push(offset);
            offset = end;
        }
        if offset != edges_tail {
            return Err(GraphError::Corruption(format!(
                "tile {tile_id}: trailing bytes in edge arena"
            )));
        }
        let record_starts: std::collections::HashSet<u32> = edge_index.iter().copied().collect();
        for (vertex, &head) in tile.pointers.iter().enumerate() {
            if head != VERTEX_HEAD_NONE && !record_starts.contains(&head) {
                return Err(GraphError::Corruption(format!(
                    "tile {tile_id}: vertex {vertex} head pointer misaligned"
                )));
            }
        }
        tile.edge_index = edge_index;

        let mut string_index = Vec::with_capacity(next_string_id as usize);
        let mut string_lookup = HashMap::with_capacity(next_string_id as usize);
        let mut pos = 0usize;
        for id in 0..next_string_id {
            if pos >= strings_tail as usize {
                return Err(GraphError::Corruption(format!(
                    "tile {tile_id}: string arena ends before string count"
                )));
            }
            string_index.push(pos as u32);
            let Some((len, size)) = codec::try_read_varuint(&tile.strings, pos, strings_tail as usize)
            else {
                return Err(GraphError::Corruption(format!(
                    "tile {tile_id}: string {id} length malformed"
                )));
            };
            let start = pos + size;
            let end = start + len as usize;
            if end > strings_tail as usize {
                return Err(GraphError::Corruption(format!(
                    "tile {tile_id}: string {id} truncated"
                )));
            }
            let value = std::str::from_utf8(&tile.strings[start..end])
                .map_err(|_| GraphError::Corruption(format!("tile {tile_id}: string {id} not UTF-8")))?;
            string_lookup.insert(value.to_owned(), id);
            pos = end;
        }
        tile.string_index = Arc::new(string_index);
        tile.string_lookup = Arc::new(string_lookup);
        Ok(tile)
    }
}

/// Iterator over the intrusive edge chain of one vertex.
pub struct TileAdjacency<'a> {
    tile: &'a GraphTile,
    vertex: VertexId,
    next: Option<u32>,
}

impl<'a> Iterator for TileAdjacency<'a> {
    type Item = EdgeRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let record = self.tile.record_at(offset);
        self.next = if record.vertex1 == self.vertex {
            record.prev1
        } else {
            record.prev2
        };
        Some(record)
    }
}

/// Encodes one record at `tail` and links it into the vertex chains.
///
/// Returns the new tail. `v1` must be resident in `tile_id`.
#[allow(clippy::too_many_arguments)]
fn append_record(
    edges: &mut Vec<u8>,
    edge_index: &mut Vec<u32>,
    pointers: &mut [u32],
    tail: u32,
    tile_id: u32,
    v1: VertexId,
    v2: VertexId,
    canonical: Option<EdgeId>,
    edge_type_id: Option<u32>,
    length_cm: Option<u32>,
    shape_pointer: Option<u32>,
    attribute_pointer: Option<u32>,
) -> u32 {
    let offset = tail;
    let mut pos = tail as usize;
    codec::ensure_capacity(edges, pos, MAX_EDGE_RECORD);

    pos += codec::write_varuint(edges, pos, encode_vertex(tile_id, v1));
    pos += codec::write_varuint(edges, pos, encode_vertex(tile_id, v2));

    let head1 = chain_head(pointers, v1);
    pos += codec::write_varuint_nullable(edges, pos, head1.map(u64::from));
    let head2 = if v2.tile_id == tile_id && v2 != v1 {
        chain_head(pointers, v2)
    } else {
        None
    };
    pos += codec::write_varuint_nullable(edges, pos, head2.map(u64::from));

    if let Some(id) = canonical {
        pos += codec::write_varuint(edges, pos, id.encode());
    }
    pos += codec::write_varuint_nullable(edges, pos, edge_type_id.map(u64::from));
    pos += codec::write_varuint_nullable(edges, pos, length_cm.map(u64::from));
    pos += codec::write_varuint_nullable(edges, pos, shape_pointer.map(u64::from));
    pos += codec::write_varuint_nullable(edges, pos, attribute_pointer.map(u64::from));

    pointers[v1.local_id as usize] = offset;
    if v2.tile_id == tile_id && v2 != v1 {
        pointers[v2.local_id as usize] = offset;
    }
    edge_index.push(offset);
    pos as u32
}

/// Bounds-checked scan of one record; `None` when the record runs past
/// `end` or a field is malformed. Load-time validation only.
fn checked_record_end(buf: &[u8], offset: u32, end: u32, tile_id: u32) -> Option<u32> {
    let end = end as usize;
    let mut pos = offset as usize;
    let (raw1, size) = codec::try_read_varuint(buf, pos, end)?;
    pos += size;
    let (raw2, size) = codec::try_read_varuint(buf, pos, end)?;
    pos += size;
    let tile1 = if raw1 >> 32 == 0 { tile_id } else { (raw1 >> 32) as u32 };
    let tile2 = if raw2 >> 32 == 0 { tile_id } else { (raw2 >> 32) as u32 };
    // prev1, prev2, optional canonical id, type, length, shape, attributes.
    let fields = if tile1 != tile2 { 7 } else { 6 };
    for _ in 0..fields {
        let (_, size) = codec::try_read_varuint(buf, pos, end)?;
        pos += size;
    }
    Some(pos as u32)
}

fn chain_head(pointers: &[u32], vertex: VertexId) -> Option<u32> {
    let head = pointers[vertex.local_id as usize];
    (head != VERTEX_HEAD_NONE).then_some(head)
}

fn encode_vertex(tile_id: u32, vertex: VertexId) -> u64 {
    if vertex.tile_id == tile_id {
        vertex.local_id as u64
    } else {
        vertex.encode()
    }
}
