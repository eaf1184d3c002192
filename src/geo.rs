//! Geographic primitives: slippy-map tiles, distances, projections.
//!
//! Tiles follow the slippy-map convention: at zoom `z` the world is split
//! into `2^z x 2^z` Web-Mercator cells, and the tile at `(x, y)` has local
//! id `y * 2^z + x`. Coordinates are `(lon, lat)` pairs in degrees
//! throughout the crate.

use std::f64::consts::PI;

/// A `(lon, lat)` pair in degrees.
pub type Coordinate = (f64, f64);

/// Zoom level used by the standard tiled networks.
pub const DEFAULT_ZOOM: u32 = 14;

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Latitude bound of the Web-Mercator projection.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Geographic rectangle, edges included.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Builds a box centered on `(lon, lat)` extending `radius_m` meters in
    /// each direction.
    pub fn around(lon: f64, lat: f64, radius_m: f64) -> Self {
        let lat_degree = radius_m / 111_320.0;
        let lon_degree = lat_degree / lat.to_radians().cos().max(0.01);
        Self {
            min_lon: lon - lon_degree,
            min_lat: lat - lat_degree,
            max_lon: lon + lon_degree,
            max_lat: lat + lat_degree,
        }
    }

    pub fn center(&self) -> Coordinate {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }
}

/// Tile x/y cell for a coordinate.
pub fn tile_xy(lon: f64, lat: f64, zoom: u32) -> (u32, u32) {
    let n = (1u64 << zoom) as f64;
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - lat.to_radians().tan().asinh() / PI) / 2.0 * n).floor();
    let max = (1u64 << zoom) - 1;
    (
        (x as i64).clamp(0, max as i64) as u32,
        (y as i64).clamp(0, max as i64) as u32,
    )
}

pub fn tile_id(x: u32, y: u32, zoom: u32) -> u32 {
    y * (1u32 << zoom) + x
}

/// The id of the tile owning `(lon, lat)`.
pub fn tile_for(lon: f64, lat: f64, zoom: u32) -> u32 {
    let (x, y) = tile_xy(lon, lat, zoom);
    tile_id(x, y, zoom)
}

/// Geographic rectangle covered by a tile.
pub fn tile_bounds(tile: u32, zoom: u32) -> BoundingBox {
    let per_row = 1u32 << zoom;
    let x = tile % per_row;
    let y = tile / per_row;
    let n = (1u64 << zoom) as f64;
    let lon_at = |x: f64| x / n * 360.0 - 180.0;
    let lat_at = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    BoundingBox {
        min_lon: lon_at(x as f64),
        min_lat: lat_at((y + 1) as f64),
        max_lon: lon_at((x + 1) as f64),
        max_lat: lat_at(y as f64),
    }
}

/// Inclusive x/y tile ranges covering `area`.
pub fn tile_range(area: &BoundingBox, zoom: u32) -> (u32, u32, u32, u32) {
    let (x0, y0) = tile_xy(area.min_lon, area.max_lat, zoom);
    let (x1, y1) = tile_xy(area.max_lon, area.min_lat, zoom);
    (x0, y0, x1, y1)
}

/// Great-circle distance between two coordinates, in meters.
pub fn distance_m(a: Coordinate, b: Coordinate) -> f64 {
    let (lon1, lat1) = (a.0.to_radians(), a.1.to_radians());
    let (lon2, lat2) = (b.0.to_radians(), b.1.to_radians());
    let sin_dlat = ((lat2 - lat1) / 2.0).sin();
    let sin_dlon = ((lon2 - lon1) / 2.0).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Total length of a polyline in meters.
pub fn polyline_length_m(points: &[Coordinate]) -> f64 {
    points.windows(2).map(|w| distance_m(w[0], w[1])).sum()
}

/// Orthogonal projection of `p` onto segment `a -> b` in a local
/// equirectangular frame.
///
/// Returns the foot coordinate and the parameter `t`; the foot falls within
/// the segment only when `0 <= t <= 1`.
pub fn project_on_segment(p: Coordinate, a: Coordinate, b: Coordinate) -> (Coordinate, f64) {
    let scale = p.1.to_radians().cos().max(0.01);
    let ax = (a.0 - p.0) * scale;
    let ay = a.1 - p.1;
    let bx = (b.0 - p.0) * scale;
    let by = b.1 - p.1;
    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return (a, 0.0);
    }
    let t = -(ax * dx + ay * dy) / len_sq;
    let foot = (a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t);
    (foot, t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_id_follows_row_major_convention() {
        let zoom = 2;
        assert_eq!(tile_for(-180.0, 80.0, zoom), 0);
        // One tile to the east.
        assert_eq!(tile_for(-80.0, 80.0, zoom), 1);
        // One row south of the first tile.
        assert_eq!(tile_for(-180.0, 40.0, zoom), 4);
    }

    #[test]
    fn tile_bounds_invert_tile_for() {
        let zoom = DEFAULT_ZOOM;
        for (lon, lat) in [(4.89, 52.37), (-0.12, 51.5), (0.0005, 0.0005), (151.2, -33.87)] {
            let tile = tile_for(lon, lat, zoom);
            let bounds = tile_bounds(tile, zoom);
            assert!(
                bounds.contains(lon, lat),
                "{lon},{lat} not in {bounds:?} (tile {tile})"
            );
        }
    }

    #[test]
    fn distance_known_value() {
        // Amsterdam Centraal to Dam Square, roughly 1.1km.
        let d = distance_m((4.9003, 52.3791), (4.8931, 52.3730));
        assert!((900.0..1300.0).contains(&d), "unexpected distance {d}");
    }

    #[test]
    fn projection_foot_within_segment() {
        let a = (0.0, 0.0);
        let b = (0.001, 0.0);
        let (foot, t) = project_on_segment((0.0002, 0.0001), a, b);
        assert!((t - 0.2).abs() < 1e-6);
        assert!((foot.0 - 0.0002).abs() < 1e-9);
        assert!(foot.1.abs() < 1e-9);
    }

    #[test]
    fn projection_foot_outside_segment() {
        let a = (0.0, 0.0);
        let b = (0.001, 0.0);
        let (_, t) = project_on_segment((0.002, 0.0), a, b);
        assert!(t > 1.0);
    }

    #[test]
    fn box_around_radius_contains_nearby_point() {
        let b = BoundingBox::around(4.9, 52.37, 100.0);
        assert!(b.contains(4.9003, 52.3705));
        assert!(!b.contains(4.92, 52.37));
    }
}
