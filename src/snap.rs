//! Projecting coordinates onto the nearest acceptable edge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::geo::{self, BoundingBox, Coordinate};
use crate::model::{SnapPoint, VertexId, OFFSET_MAX};
use crate::network::{EdgeView, RoutingNetwork};
use crate::tile::{EdgeRecord, GraphTile};

/// Distances below this are treated as exact hits and end the search.
const EXACT_TOLERANCE_M: f64 = 1.0;

#[derive(Clone, Copy, Debug)]
struct Candidate {
    distance: f64,
    along_m: f64,
    is_vertex: bool,
}

impl RoutingNetwork {
    /// Snaps the center of `area` to the closest acceptable edge with at
    /// least one endpoint inside `area`, within `max_distance_m` meters.
    pub fn snap_in_box(
        &self,
        area: &BoundingBox,
        mut accept: Option<&mut dyn FnMut(&EdgeView) -> bool>,
        max_distance_m: f64,
    ) -> Option<SnapPoint> {
        let center = area.center();
        let mut accepted: HashMap<u64, bool> = HashMap::new();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut best: Option<(Candidate, SnapPoint)> = None;

        'tiles: for tile in self.tiles_overlapping(area) {
            for (vertex, record) in edges_with_endpoint_in(&tile, area) {
                let canonical = tile.canonical_id(&record);
                if !seen.insert(canonical.encode()) {
                    continue;
                }
                let Some(geometry) = self.record_geometry(&tile, &record) else {
                    continue;
                };
                let current = best.as_ref().map(|(candidate, _)| *candidate);
                let Some(candidate) =
                    best_on_polyline(center, &geometry, max_distance_m, current)
                else {
                    continue;
                };
                if !is_acceptable(&mut accepted, &mut accept, &tile, &record, vertex) {
                    continue;
                }
                let snap = SnapPoint::new(
                    canonical,
                    offset_on(&geometry, candidate.along_m, tile.is_mirror(&record)),
                );
                let exact = candidate.distance < EXACT_TOLERANCE_M;
                best = Some((candidate, snap));
                if exact {
                    break 'tiles;
                }
            }
        }
        trace!(found = best.is_some(), "snap_in_box");
        best.map(|(_, snap)| snap)
    }

    /// Every acceptable edge in `area` with its own best snap, one per
    /// edge. With `projected_only`, edges whose best candidate was an
    /// endpoint or shape vertex rather than a projected foot are skipped.
    pub fn snap_all_in_box(
        &self,
        area: &BoundingBox,
        mut accept: Option<&mut dyn FnMut(&EdgeView) -> bool>,
        max_distance_m: f64,
        projected_only: bool,
    ) -> Vec<SnapPoint> {
        let center = area.center();
        let mut accepted: HashMap<u64, bool> = HashMap::new();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut snaps = Vec::new();

        for tile in self.tiles_overlapping(area) {
            for (vertex, record) in edges_with_endpoint_in(&tile, area) {
                let canonical = tile.canonical_id(&record);
                if !seen.insert(canonical.encode()) {
                    continue;
                }
                let Some(geometry) = self.record_geometry(&tile, &record) else {
                    continue;
                };
                let Some(candidate) = best_on_polyline(center, &geometry, max_distance_m, None)
                else {
                    continue;
                };
                if projected_only && candidate.is_vertex {
                    continue;
                }
                if !is_acceptable(&mut accepted, &mut accept, &tile, &record, vertex) {
                    continue;
                }
                snaps.push(SnapPoint::new(
                    canonical,
                    offset_on(&geometry, candidate.along_m, tile.is_mirror(&record)),
                ));
            }
        }
        snaps
    }

    /// Convenience point snap: searches a box of `max_distance_m` around
    /// the coordinate.
    pub fn snap(&self, lon: f64, lat: f64, max_distance_m: f64) -> Option<SnapPoint> {
        let area = BoundingBox::around(lon, lat, max_distance_m);
        self.snap_in_box(&area, None, max_distance_m)
    }

    /// Full polyline of a record in record orientation: tail coordinate,
    /// stored shape, head coordinate. `None` when the foreign endpoint of a
    /// crossing edge is not loaded.
    pub(crate) fn record_geometry(
        &self,
        tile: &Arc<GraphTile>,
        record: &EdgeRecord,
    ) -> Option<Vec<Coordinate>> {
        let from = tile.try_get_vertex(record.vertex1)?;
        let to = if record.vertex2.tile_id == tile.tile_id() {
            tile.try_get_vertex(record.vertex2)?
        } else {
            self.vertex(record.vertex2)?
        };
        let mut points = Vec::new();
        points.push(from);
        if let Some(pointer) = record.shape_pointer {
            points.extend(tile.shape_at(pointer));
        }
        points.push(to);
        Some(points)
    }
}

/// Edges with at least one endpoint inside `area`, each paired with the
/// in-box vertex it was reached from. An edge can appear once per endpoint;
/// callers dedupe by canonical id.
fn edges_with_endpoint_in<'a>(
    tile: &'a Arc<GraphTile>,
    area: &'a BoundingBox,
) -> impl Iterator<Item = (VertexId, EdgeRecord)> + 'a {
    (0..tile.vertex_count()).flat_map(move |local_id| {
        let vertex = VertexId::new(tile.tile_id(), local_id);
        let in_box = tile
            .try_get_vertex(vertex)
            .map(|(lon, lat)| area.contains(lon, lat))
            .unwrap_or(false);
        in_box
            .then(|| tile.adjacency(vertex).map(move |record| (vertex, record)))
            .into_iter()
            .flatten()
    })
}

fn is_acceptable(
    cache: &mut HashMap<u64, bool>,
    accept: &mut Option<&mut dyn FnMut(&EdgeView) -> bool>,
    tile: &Arc<GraphTile>,
    record: &EdgeRecord,
    vertex: VertexId,
) -> bool {
    let key = tile.canonical_id(record).encode();
    if let Some(&ok) = cache.get(&key) {
        return ok;
    }
    let ok = match accept {
        Some(f) => f(&EdgeView::new(Arc::clone(tile), *record, vertex)),
        None => true,
    };
    cache.insert(key, ok);
    ok
}

/// Streams vertex and projected-foot candidates along `points`, keeping the
/// improvement rules: a vertex candidate must be strictly closer than the
/// running best, a projected foot also wins ties against a vertex best.
fn best_on_polyline(
    center: Coordinate,
    points: &[Coordinate],
    max_distance_m: f64,
    current: Option<Candidate>,
) -> Option<Candidate> {
    let mut running = current;
    let mut found: Option<Candidate> = None;
    let mut prefix = 0.0;
    for i in 0..points.len() {
        if i > 0 {
            let segment_start = points[i - 1];
            let segment_end = points[i];
            let (foot, t) = geo::project_on_segment(center, segment_start, segment_end);
            if (0.0..=1.0).contains(&t) {
                let distance = geo::distance_m(center, foot);
                let improves = distance <= max_distance_m
                    && match running {
                        None => true,
                        Some(best) => {
                            distance < best.distance
                                || (distance == best.distance && best.is_vertex)
                        }
                    };
                if improves {
                    let candidate = Candidate {
                        distance,
                        along_m: prefix + geo::distance_m(segment_start, foot),
                        is_vertex: false,
                    };
                    running = Some(candidate);
                    found = Some(candidate);
                }
            }
            prefix += geo::distance_m(segment_start, segment_end);
        }
        let distance = geo::distance_m(center, points[i]);
        let improves = distance <= max_distance_m
            && running.map(|best| distance < best.distance).unwrap_or(true);
        if improves {
            let candidate = Candidate {
                distance,
                along_m: prefix,
                is_vertex: true,
            };
            running = Some(candidate);
            found = Some(candidate);
        }
    }
    found
}

/// Converts a cumulative length along the record geometry into the edge's
/// canonical 16-bit offset.
fn offset_on(points: &[Coordinate], along_m: f64, mirror: bool) -> u16 {
    let total = geo::polyline_length_m(points);
    let offset = if total > 0.0 {
        ((along_m / total) * OFFSET_MAX as f64).floor().clamp(0.0, OFFSET_MAX as f64) as u16
    } else {
        0
    };
    if mirror {
        OFFSET_MAX - offset
    } else {
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeSet;
    use crate::geo::DEFAULT_ZOOM;
    use crate::network::RouterDb;

    fn single_edge_db() -> (RouterDb, crate::model::EdgeId) {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        let edge = {
            let mut writer = db.get_writer().expect("writer");
            let a = writer.add_vertex(0.0, 0.0);
            let b = writer.add_vertex(0.001, 0.0);
            writer.add_edge(a, b, &[], None, None).expect("edge")
        };
        (db, edge)
    }

    #[test]
    fn snap_lands_on_the_edge_with_proportional_offset() {
        let (db, edge) = single_edge_db();
        let network = db.latest();
        let snap = network.snap(0.0002, 0.0, 50.0).expect("snap");
        assert_eq!(snap.edge_id, edge);
        let factor = snap.offset_factor();
        assert!((factor - 0.2).abs() < 0.01, "factor {factor}");
    }

    #[test]
    fn snap_outside_max_distance_is_none() {
        let (db, _) = single_edge_db();
        let network = db.latest();
        assert_eq!(network.snap(0.0005, 0.01, 50.0), None);
    }

    #[test]
    fn acceptable_is_cached_and_filters() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            let a = writer.add_vertex(0.0, 0.0);
            let b = writer.add_vertex(0.001, 0.0);
            let residential = AttributeSet::from_pairs([("highway", "residential")]);
            writer
                .add_edge(a, b, &[], Some(&residential), None)
                .expect("edge");
        }
        let network = db.latest();
        let mut calls = 0;
        let mut reject_all = |_view: &EdgeView| {
            calls += 1;
            false
        };
        let area = BoundingBox::around(0.0002, 0.0, 50.0);
        let snap = network.snap_in_box(&area, Some(&mut reject_all), 50.0);
        assert_eq!(snap, None);
        assert_eq!(calls, 1, "acceptance ran once per edge");
    }

    #[test]
    fn snap_all_yields_one_snap_per_edge() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            let a = writer.add_vertex(0.0, 0.0);
            let b = writer.add_vertex(0.001, 0.0);
            let c = writer.add_vertex(0.0005, 0.0003);
            writer.add_edge(a, b, &[], None, None).expect("ab");
            writer.add_edge(a, c, &[], None, None).expect("ac");
            writer.add_edge(b, c, &[], None, None).expect("bc");
        }
        let network = db.latest();
        let area = BoundingBox::around(0.0005, 0.0001, 300.0);
        let snaps = network.snap_all_in_box(&area, None, 300.0, false);
        assert_eq!(snaps.len(), 3);
    }

    #[test]
    fn mirror_side_snap_inverts_the_offset() {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        let edge = {
            let mut writer = db.get_writer().expect("writer");
            let east = writer.add_vertex(0.0005, 0.0005);
            let west = writer.add_vertex(-0.0005, 0.0005);
            writer.add_edge(east, west, &[], None, None).expect("edge")
        };
        let network = db.latest();
        // Close to the western endpoint, in the mirror's tile.
        let snap = network.snap(-0.0004, 0.0005, 100.0).expect("snap");
        assert_eq!(snap.edge_id, edge);
        assert!(
            snap.offset_factor() > 0.8,
            "offset should be near the `to` endpoint, got {}",
            snap.offset_factor()
        );
    }
}
