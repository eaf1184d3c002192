//! Loading a record stream into the graph.
//!
//! Producers deliver vertices and edges in topological order (both
//! endpoints of an edge before the edge). The loader remaps producer ids to
//! [`VertexId`]s, applies the tag filter to every attribute pair, and
//! drives the exclusive writer.

use std::collections::HashMap;

use tracing::debug;

use crate::attributes::AttributeSet;
use crate::error::{GraphError, Result};
use crate::geo::Coordinate;
use crate::model::VertexId;
use crate::network::{GraphWriter, RouterDb};

/// One record of an ingestion stream.
#[derive(Clone, Debug)]
pub enum NetworkRecord {
    Vertex {
        id: u64,
        lon: f64,
        lat: f64,
    },
    Edge {
        from: u64,
        to: u64,
        shape: Vec<Coordinate>,
        attributes: AttributeSet,
    },
}

/// Streams [`NetworkRecord`]s into a database through its writer.
pub struct StreamLoader<'db> {
    writer: GraphWriter<'db>,
    vertices: HashMap<u64, VertexId>,
    tag_filter: Option<Box<dyn FnMut(&str, &str) -> bool + 'db>>,
    edges: u64,
}

impl<'db> StreamLoader<'db> {
    pub fn new(db: &'db RouterDb) -> Result<Self> {
        Ok(Self {
            writer: db.get_writer()?,
            vertices: HashMap::new(),
            tag_filter: None,
            edges: 0,
        })
    }

    /// Keeps only attribute pairs the predicate approves of.
    pub fn with_tag_filter(
        db: &'db RouterDb,
        filter: impl FnMut(&str, &str) -> bool + 'db,
    ) -> Result<Self> {
        let mut loader = Self::new(db)?;
        loader.tag_filter = Some(Box::new(filter));
        Ok(loader)
    }

    pub fn push(&mut self, record: NetworkRecord) -> Result<()> {
        match record {
            NetworkRecord::Vertex { id, lon, lat } => {
                let vertex = self.writer.add_vertex(lon, lat);
                self.vertices.insert(id, vertex);
                Ok(())
            }
            NetworkRecord::Edge {
                from,
                to,
                shape,
                attributes,
            } => {
                let &v1 = self
                    .vertices
                    .get(&from)
                    .ok_or(GraphError::NotFound("vertex"))?;
                let &v2 = self
                    .vertices
                    .get(&to)
                    .ok_or(GraphError::NotFound("vertex"))?;
                let filtered = match &mut self.tag_filter {
                    Some(filter) => {
                        AttributeSet::from_pairs(attributes.iter().filter(|(k, v)| filter(k, v)))
                    }
                    None => attributes,
                };
                let bag = (!filtered.is_empty()).then_some(&filtered);
                self.writer.add_edge(v1, v2, &shape, bag, None)?;
                self.edges += 1;
                Ok(())
            }
        }
    }

    /// Consumes the stream, returning the number of edges written.
    pub fn finish(self) -> u64 {
        debug!(
            vertices = self.vertices.len(),
            edges = self.edges,
            "ingestion stream finished"
        );
        self.edges
    }
}

/// Loads a whole stream in one call.
pub fn load(db: &RouterDb, records: impl IntoIterator<Item = NetworkRecord>) -> Result<u64> {
    let mut loader = StreamLoader::new(db)?;
    for record in records {
        loader.push(record)?;
    }
    Ok(loader.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::DEFAULT_ZOOM;

    fn stream() -> Vec<NetworkRecord> {
        vec![
            NetworkRecord::Vertex {
                id: 10,
                lon: 0.0001,
                lat: 0.0004,
            },
            NetworkRecord::Vertex {
                id: 20,
                lon: 0.0009,
                lat: 0.0004,
            },
            NetworkRecord::Edge {
                from: 10,
                to: 20,
                shape: vec![],
                attributes: AttributeSet::from_pairs([
                    ("highway", "residential"),
                    ("note", "scratch"),
                ]),
            },
        ]
    }

    #[test]
    fn loads_vertices_then_edges() -> Result<()> {
        let db = RouterDb::new(DEFAULT_ZOOM)?;
        let edges = load(&db, stream())?;
        assert_eq!(edges, 1);
        assert_eq!(db.latest().vertex_count(), 2);
        assert_eq!(db.latest().edge_count(), 1);
        Ok(())
    }

    #[test]
    fn tag_filter_drops_pairs() -> Result<()> {
        let db = RouterDb::new(DEFAULT_ZOOM)?;
        {
            let mut loader = StreamLoader::with_tag_filter(&db, |key, _| key == "highway")?;
            for record in stream() {
                loader.push(record)?;
            }
            loader.finish();
        }
        let network = db.latest();
        let edge = network.edges().next().expect("edge");
        let bag = edge.attributes();
        assert_eq!(bag.get("highway"), Some("residential"));
        assert_eq!(bag.get("note"), None);
        Ok(())
    }

    #[test]
    fn misordered_stream_is_rejected() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        let err = load(
            &db,
            [NetworkRecord::Edge {
                from: 1,
                to: 2,
                shape: vec![],
                attributes: AttributeSet::new(),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::NotFound(_)));
    }
}
