//! Tile identifiers and the projection math between geographic and map-pixel space
//! Web Mercator (EPSG:3857), the scheme every built-in OSM source uses

use std::f64::consts::PI;

/// Unique identifier for a map tile
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TileId {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileId {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }
}

/// Geographic position in degrees
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Point with longitude wrapped into [-180, 180] and latitude clamped to the Mercator limit
    pub fn wrapped(lon: f64, lat: f64) -> Self {
        Self { lon: normalize_longitude(lon), lat: clamp_latitude(lat) }
    }
}

/// Project lon/lat onto a square map `size` pixels wide.
///
/// Latitudes beyond the Mercator limit land on the top or bottom edge.
pub fn geo_to_coord(lon: f64, lat: f64, size: i32) -> (i32, i32) {
    let size = size as f64;
    let x = ((lon + 180.0) / 360.0 * size).floor();

    let lat_rad = clamp_latitude(lat) * PI / 180.0;
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * size).floor();

    (x as i32, y as i32)
}

/// Inverse of [`geo_to_coord`]
pub fn coord_to_geo(x: i32, y: i32, size: i32) -> GeoPoint {
    let size = size as f64;
    let lon = x as f64 / size * 360.0 - 180.0;
    let lat = 180.0 / PI * (PI - 2.0 * PI * y as f64 / size).sinh().atan();
    GeoPoint { lon, lat }
}

/// Integer zoom for a map of `size` pixels built from `tile`-pixel tiles
pub fn zoom_for_size(size: i32, tile: i32) -> i32 {
    if size <= 0 || tile <= 0 {
        return 0;
    }
    (size as f64 / tile as f64).log2().floor() as i32
}

/// Snap a fractional zoom to the tile zoom it displays
pub fn round_zoom(z: f64) -> i32 {
    if z < 0.0 {
        (z - 0.005).ceil() as i32
    } else {
        (z + 0.005).floor() as i32
    }
}

/// Rotate `(x, y)` around `(cx, cy)` by `degrees`.
///
/// The second axis uses a quarter-turn phase shift instead of the usual sin/cos swap; the
/// result is identical to a standard rotation.
pub fn rotate_point(x: f64, y: f64, cx: f64, cy: f64, degrees: f64) -> (f64, f64) {
    let r = degrees * PI / 180.0;
    let quarter = r + PI / 2.0;
    let dx = x - cx;
    let dy = y - cy;
    (
        dx * r.cos() + dy * quarter.cos() + cx,
        dx * r.sin() + dy * quarter.sin() + cy,
    )
}

/// Rotation snapped to the nearest canvas pixel
pub fn rotate_coord(x: i32, y: i32, cx: i32, cy: i32, degrees: f64) -> (i32, i32) {
    let (rx, ry) = rotate_point(x as f64, y as f64, cx as f64, cy as f64, degrees);
    (rx.round() as i32, ry.round() as i32)
}

/// Latitude at which the square Mercator map ends
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Normalize longitude to [-180, 180]
pub fn normalize_longitude(lon: f64) -> f64 {
    if !lon.is_finite() {
        return 0.0;
    }
    let mut l = lon;
    while l < -180.0 {
        l += 360.0;
    }
    while l > 180.0 {
        l -= 360.0;
    }
    l
}

/// Clamp latitude to valid Mercator range
pub fn clamp_latitude(lat: f64) -> f64 {
    if lat.is_nan() {
        return 0.0;
    }
    lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_to_coord_tile_index() {
        // Seoul at zoom 10 lands in tile (872, 395)
        let size = 256 << 10;
        let (x, y) = geo_to_coord(126.9780, 37.5665, size);
        assert_eq!(x / 256, 872);
        assert_eq!(y / 256, 395);
    }

    #[test]
    fn test_projection_round_trip() {
        for zoom in [2, 8, 14, 18] {
            let size = 256 << zoom;
            let eps = 360.0 / size as f64 * 2.0;
            for (lon, lat) in [(0.0, 0.0), (126.978, 37.5665), (-122.42, -33.9), (179.0, 80.0)] {
                let (x, y) = geo_to_coord(lon, lat, size);
                let back = coord_to_geo(x, y, size);
                assert!((back.lon - lon).abs() < eps, "lon {} vs {}", back.lon, lon);
                assert!((back.lat - lat).abs() < eps, "lat {} vs {}", back.lat, lat);
            }
        }
    }

    #[test]
    fn test_coord_to_geo_corners() {
        let top_left = coord_to_geo(0, 0, 256);
        assert!((top_left.lon + 180.0).abs() < 0.001);
        assert!((top_left.lat - 85.0511).abs() < 0.001);

        let center = coord_to_geo(128, 128, 256);
        assert!(center.lon.abs() < 0.001);
        assert!(center.lat.abs() < 0.001);
    }

    #[test]
    fn test_round_zoom() {
        assert_eq!(round_zoom(2.0), 2);
        assert_eq!(round_zoom(2.996), 3);
        assert_eq!(round_zoom(2.5), 2);
        assert_eq!(round_zoom(-0.996), -1);
        assert_eq!(round_zoom(-0.5), 0);
    }

    #[test]
    fn test_rotate_round_trip() {
        for deg in [0.0, 33.0, 90.0, 181.5, -45.0] {
            let (rx, ry) = rotate_point(120.0, -40.0, 10.0, 20.0, deg);
            let (x, y) = rotate_point(rx, ry, 10.0, 20.0, -deg);
            assert!((x - 120.0).abs() < 1e-9);
            assert!((y + 40.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rotate_quarter_turn() {
        let (x, y) = rotate_point(1.0, 0.0, 0.0, 0.0, 90.0);
        assert!(x.abs() < 1e-9);
        assert!((y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zoom_for_size() {
        assert_eq!(zoom_for_size(256 << 5, 256), 5);
        assert_eq!(zoom_for_size(256, 256), 0);
        assert_eq!(zoom_for_size(0, 256), 0);
    }

    #[test]
    fn test_poles_land_on_map_edges() {
        let size = 256 << 3;
        assert_eq!(geo_to_coord(0.0, 90.0, size), geo_to_coord(0.0, MAX_LATITUDE, size));
        let (_, top) = geo_to_coord(0.0, 90.0, size);
        let (_, bottom) = geo_to_coord(0.0, -90.0, size);
        assert!((0..=1).contains(&top));
        assert!((size - 1..=size).contains(&bottom));
    }

    #[test]
    fn test_wrapped_point() {
        let p = GeoPoint::wrapped(190.0, -90.0);
        assert!((p.lon + 170.0).abs() < 1e-9);
        assert!((p.lat + MAX_LATITUDE).abs() < 1e-9);
        assert_eq!(GeoPoint::wrapped(f64::NAN, f64::NAN), GeoPoint::new(0.0, 0.0));
    }

    #[test]
    fn test_normalize_longitude() {
        assert!((normalize_longitude(190.0) + 170.0).abs() < 1e-9);
        assert!((normalize_longitude(-370.0) + 10.0).abs() < 1e-9);
    }
}
