//! A tiled, mutation-friendly road-routing graph with coordinate snapping
//! and an edge-based shortest-path search.

pub mod attributes;
pub mod codec;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod model;
pub mod network;
pub mod persist;
pub mod search;
pub mod snap;
pub mod tile;

pub use crate::attributes::{AttributeSet, AttributeSetIndex, ClassifyFn};
pub use crate::error::{GraphError, Result};
pub use crate::geo::{BoundingBox, Coordinate, DEFAULT_ZOOM};
pub use crate::ingest::{NetworkRecord, StreamLoader};
pub use crate::model::{EdgeId, Path, SnapPoint, VertexId, MIN_CROSS_ID, OFFSET_MAX};
pub use crate::network::{
    EdgeEnumerator, EdgeView, GraphMutator, GraphWriter, RouterDb, RoutingNetwork,
    TileUsageListener,
};
pub use crate::search::{CostFunction, Dijkstra, PathTrace};
pub use crate::tile::{GraphTile, TurnCostTable};
