//! The versioned container framing a database for storage.
//!
//! Layout, all integers little-endian: one version byte, the network (zoom,
//! tiles with their counters, arenas and turn-cost blocks), the two
//! attribute-set index tables, then the metadata bag. Corruption is detected
//! here, at the trust boundary; in-memory operations trust the arenas.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::attributes::{AttributeSet, AttributeSetIndex};
use crate::error::{GraphError, Result};
use crate::model::EdgeId;
use crate::network::RouterDb;
use crate::tile::{GraphTile, TurnCostTable};

const CONTAINER_VERSION: u8 = 1;

/// Upper bound on any single length prefix; anything larger is corruption.
const MAX_BLOCK: u32 = 1 << 30;

impl RouterDb {
    /// Frames the latest network, the index tables and the metadata bag
    /// into `out`.
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        let network = self.latest();
        out.write_all(&[CONTAINER_VERSION])?;
        write_u32(out, network.zoom())?;

        let tiles = network.tiles().read();
        let mut ordered: Vec<_> = tiles.iter().collect();
        ordered.sort_by_key(|(tile_id, _)| **tile_id);
        write_u32(out, ordered.len() as u32)?;
        for (tile_id, slot) in ordered {
            write_u32(out, *tile_id)?;
            write_u32(out, slot.edge_type_generation)?;
            write_tile(out, &slot.tile)?;
        }
        drop(tiles);

        write_index(out, network.edge_type_index())?;
        write_index(out, network.turn_cost_index())?;
        write_bag(out, &self.metadata())?;
        Ok(())
    }

    /// Reads a container produced by [`RouterDb::write_to`].
    ///
    /// Classification functions are code, not data: both loaded indexes use
    /// the identity function until a profile installs a real one through
    /// the mutator.
    pub fn read_from(input: &mut impl Read) -> Result<RouterDb> {
        let mut version = [0u8; 1];
        input.read_exact(&mut version)?;
        if version[0] != CONTAINER_VERSION {
            return Err(GraphError::Corruption(format!(
                "unsupported container version {}",
                version[0]
            )));
        }
        let zoom = read_u32(input)?;
        if zoom > 16 {
            return Err(GraphError::Corruption(format!("invalid zoom {zoom}")));
        }

        let tile_count = read_u32(input)?;
        let mut tiles = Vec::with_capacity(tile_count as usize);
        for _ in 0..tile_count {
            let tile_id = read_u32(input)?;
            let generation = read_u32(input)?;
            let tile = read_tile(input, zoom, tile_id)?;
            tiles.push((tile_id, generation, tile));
        }

        let edge_type_index = read_index(input)?;
        let turn_cost_index = read_index(input)?;
        let metadata = read_bag(input)?;

        Ok(RouterDb::assemble(
            zoom,
            tiles,
            Arc::new(edge_type_index),
            Arc::new(turn_cost_index),
            metadata,
        ))
    }
}

fn write_tile(out: &mut impl Write, tile: &GraphTile) -> Result<()> {
    for counter in tile.counters() {
        write_u32(out, counter)?;
    }
    let pointers = tile.pointers_slice();
    write_u32(out, pointers.len() as u32)?;
    for &pointer in pointers {
        write_u32(out, pointer)?;
    }
    write_bytes(out, tile.edges_bytes())?;
    write_bytes(out, tile.coordinates_bytes())?;
    write_bytes(out, tile.shapes_bytes())?;
    write_bytes(out, tile.attributes_bytes())?;
    write_bytes(out, tile.strings_bytes())?;

    let turn_costs = tile.turn_cost_map();
    write_u32(out, turn_costs.len() as u32)?;
    for (vertex, tables) in turn_costs {
        write_u32(out, *vertex)?;
        write_u32(out, tables.len() as u32)?;
        for table in tables {
            write_u32(out, table.turn_cost_type)?;
            write_u32(out, table.edges.len() as u32)?;
            for edge in &table.edges {
                write_u64(out, edge.encode())?;
            }
            for &cost in &table.costs {
                write_u32(out, cost)?;
            }
        }
    }
    Ok(())
}

fn read_tile(input: &mut impl Read, zoom: u32, tile_id: u32) -> Result<GraphTile> {
    let mut counters = [0u32; 7];
    for counter in &mut counters {
        *counter = read_u32(input)?;
    }
    let pointer_count = checked_len(read_u32(input)?)?;
    let mut pointers = Vec::with_capacity(pointer_count);
    for _ in 0..pointer_count {
        pointers.push(read_u32(input)?);
    }
    let edges = read_bytes(input)?;
    let coordinates = read_bytes(input)?;
    let shapes = read_bytes(input)?;
    let attributes = read_bytes(input)?;
    let strings = read_bytes(input)?;

    let mut turn_costs: BTreeMap<u32, Vec<TurnCostTable>> = BTreeMap::new();
    let vertex_count = checked_len(read_u32(input)?)?;
    for _ in 0..vertex_count {
        let vertex = read_u32(input)?;
        let table_count = checked_len(read_u32(input)?)?;
        let mut tables = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            let turn_cost_type = read_u32(input)?;
            let edge_count = checked_len(read_u32(input)?)?;
            let mut edges = Vec::with_capacity(edge_count);
            for _ in 0..edge_count {
                edges.push(EdgeId::decode(read_u64(input)?));
            }
            let mut costs = Vec::with_capacity(edge_count * edge_count);
            for _ in 0..edge_count * edge_count {
                costs.push(read_u32(input)?);
            }
            tables.push(
                TurnCostTable::new(turn_cost_type, edges, costs)
                    .map_err(|_| GraphError::Corruption("turn-cost table malformed".into()))?,
            );
        }
        turn_costs.insert(vertex, tables);
    }

    GraphTile::from_parts(
        zoom,
        tile_id,
        counters,
        pointers,
        edges,
        coordinates,
        shapes,
        attributes,
        strings,
        turn_costs,
    )
}

fn write_index(out: &mut impl Write, index: &AttributeSetIndex) -> Result<()> {
    write_u32(out, index.generation())?;
    let bags = index.bags_snapshot();
    write_u32(out, bags.len() as u32)?;
    for bag in &bags {
        write_bag(out, bag)?;
    }
    Ok(())
}

fn read_index(input: &mut impl Read) -> Result<AttributeSetIndex> {
    let generation = read_u32(input)?;
    let count = checked_len(read_u32(input)?)?;
    let mut bags = Vec::with_capacity(count);
    for _ in 0..count {
        bags.push(read_bag(input)?);
    }
    Ok(AttributeSetIndex::restore(bags, generation))
}

fn write_bag(out: &mut impl Write, bag: &AttributeSet) -> Result<()> {
    write_u32(out, bag.len() as u32)?;
    for (key, value) in bag.iter() {
        write_bytes(out, key.as_bytes())?;
        write_bytes(out, value.as_bytes())?;
    }
    Ok(())
}

fn read_bag(input: &mut impl Read) -> Result<AttributeSet> {
    let count = checked_len(read_u32(input)?)?;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_string(input)?;
        let value = read_string(input)?;
        pairs.push((key, value));
    }
    Ok(AttributeSet::from_pairs(pairs))
}

fn write_u32(out: &mut impl Write, value: u32) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u64(out: &mut impl Write, value: u64) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_bytes(out: &mut impl Write, bytes: &[u8]) -> Result<()> {
    write_u32(out, bytes.len() as u32)?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_u32(input: &mut impl Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(input: &mut impl Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_bytes(input: &mut impl Read) -> Result<Vec<u8>> {
    let len = checked_len(read_u32(input)?)?;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_string(input: &mut impl Read) -> Result<String> {
    let bytes = read_bytes(input)?;
    String::from_utf8(bytes).map_err(|_| GraphError::Corruption("string not UTF-8".into()))
}

fn checked_len(len: u32) -> Result<usize> {
    if len > MAX_BLOCK {
        return Err(GraphError::Corruption(format!(
            "length prefix {len} exceeds container limit"
        )));
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::DEFAULT_ZOOM;
    use std::io::Cursor;

    fn sample_db() -> RouterDb {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            let a = writer.add_vertex(0.0001, 0.0004);
            let b = writer.add_vertex(0.0009, 0.0004);
            let c = writer.add_vertex(-0.0004, 0.0004);
            let bag = AttributeSet::from_pairs([("highway", "residential")]);
            let ab = writer
                .add_edge(a, b, &[(0.0005, 0.00045)], Some(&bag), None)
                .expect("ab");
            let ca = writer.add_edge(c, a, &[], Some(&bag), None).expect("ca");
            writer
                .add_turn_costs(a, &bag, &[ab, ca], &[0, 5, 7, 0])
                .expect("turn costs");
        }
        db.set_metadata(AttributeSet::from_pairs([("source", "unit-test")]));
        db
    }

    #[test]
    fn container_round_trip() -> Result<()> {
        let db = sample_db();
        let mut buffer = Vec::new();
        db.write_to(&mut buffer)?;

        let restored = RouterDb::read_from(&mut Cursor::new(&buffer))?;
        assert_eq!(restored.zoom(), db.zoom());
        assert_eq!(restored.metadata(), db.metadata());

        let before = db.latest();
        let after = restored.latest();
        assert_eq!(after.tile_count(), before.tile_count());
        assert_eq!(after.vertex_count(), before.vertex_count());
        assert_eq!(after.edge_count(), before.edge_count());

        let snaps_before = before.snap(0.0005, 0.0004, 100.0).expect("snap");
        let snaps_after = after.snap(0.0005, 0.0004, 100.0).expect("snap");
        assert_eq!(snaps_before, snaps_after);
        Ok(())
    }

    #[test]
    fn round_trip_through_a_file() -> Result<()> {
        let db = sample_db();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("network.mdm");
        let mut file = std::fs::File::create(&path)?;
        db.write_to(&mut file)?;
        drop(file);

        let mut file = std::fs::File::open(&path)?;
        let restored = RouterDb::read_from(&mut file)?;
        assert_eq!(restored.latest().edge_count(), db.latest().edge_count());
        Ok(())
    }

    #[test]
    fn wrong_version_is_corruption() {
        let db = sample_db();
        let mut buffer = Vec::new();
        db.write_to(&mut buffer).expect("write");
        buffer[0] = 9;
        let err = RouterDb::read_from(&mut Cursor::new(&buffer)).unwrap_err();
        assert!(matches!(err, GraphError::Corruption(_)));
    }

    #[test]
    fn truncated_container_is_an_error() {
        let db = sample_db();
        let mut buffer = Vec::new();
        db.write_to(&mut buffer).expect("write");
        buffer.truncate(buffer.len() / 2);
        assert!(RouterDb::read_from(&mut Cursor::new(&buffer)).is_err());
    }
}
