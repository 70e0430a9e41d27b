//! Tile, route and geocoding source descriptors
//!
//! Each widget owns a [`Sources`] registry with the built-in providers pre-registered and one
//! active source per kind.

use std::fmt;
use std::sync::Arc;

use crate::error::{MapError, Result};

use super::name::NameMethod;
use super::route::{RouteMethod, RouteType};
use super::tile::GeoPoint;

/// Highest zoom a tile source may declare; keeps `2^zoom * 256` inside `i32`
pub const MAX_SOURCE_ZOOM: i32 = 22;

pub type TileUrlFn = Arc<dyn Fn(u32, u32, u8) -> String + Send + Sync>;
pub type ScaleFn = Arc<dyn Fn(f64, f64, i32) -> f64 + Send + Sync>;
/// Provider projection override: `(lon, lat, zoom, size) -> (x, y)`
pub type GeoToCoordFn = Arc<dyn Fn(f64, f64, i32, i32) -> (i32, i32) + Send + Sync>;
/// Provider projection override: `(x, y, zoom, size) -> geo`
pub type CoordToGeoFn = Arc<dyn Fn(i32, i32, i32, i32) -> GeoPoint + Send + Sync>;
pub type RouteUrlFn =
    Arc<dyn Fn(RouteType, RouteMethod, f64, f64, f64, f64) -> String + Send + Sync>;
/// `(method, address, lon, lat, current zoom) -> url`
pub type NameUrlFn = Arc<dyn Fn(NameMethod, Option<&str>, f64, f64, i32) -> String + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Tile,
    Route,
    Name,
}

#[derive(Clone)]
pub struct TileSource {
    pub name: String,
    pub zoom_min: i32,
    pub zoom_max: i32,
    pub url: TileUrlFn,
    pub scale: ScaleFn,
    pub geo_to_coord: Option<GeoToCoordFn>,
    pub coord_to_geo: Option<CoordToGeoFn>,
}

impl TileSource {
    pub fn new(
        name: impl Into<String>,
        zoom_min: i32,
        zoom_max: i32,
        url: impl Fn(u32, u32, u8) -> String + Send + Sync + 'static,
    ) -> Self {
        let zoom_max = zoom_max.clamp(0, MAX_SOURCE_ZOOM);
        Self {
            name: name.into(),
            zoom_min: zoom_min.clamp(0, zoom_max),
            zoom_max,
            url: Arc::new(url),
            scale: Arc::new(osm_scale),
            geo_to_coord: None,
            coord_to_geo: None,
        }
    }

    pub fn with_scale(
        mut self,
        scale: impl Fn(f64, f64, i32) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.scale = Arc::new(scale);
        self
    }

    pub fn with_projection(mut self, forward: GeoToCoordFn, inverse: CoordToGeoFn) -> Self {
        self.geo_to_coord = Some(forward);
        self.coord_to_geo = Some(inverse);
        self
    }

    pub fn tile_url(&self, x: u32, y: u32, zoom: u8) -> String {
        (self.url)(x, y, zoom)
    }

    /// Built-in OSM-family providers in registration order
    pub fn builtin() -> Vec<TileSource> {
        vec![
            TileSource::new("Mapnik", 0, 18, |x, y, z| {
                format!(
                    "http://{}.tile.openstreetmap.org/{}/{}/{}.png",
                    mirror_letter(x, y, z),
                    z,
                    x,
                    y
                )
            }),
            TileSource::new("Osmarender", 0, 17, |x, y, z| {
                format!(
                    "http://{}.tah.openstreetmap.org/Tiles/tile/{}/{}/{}.png",
                    mirror_letter(x, y, z),
                    z,
                    x,
                    y
                )
            }),
            TileSource::new("CycleMap", 0, 16, |x, y, z| {
                format!(
                    "http://{}.tile.opencyclemap.org/cycle/{}/{}/{}.png",
                    mirror_letter(x, y, z),
                    z,
                    x,
                    y
                )
            }),
            TileSource::new("MapQuest", 0, 18, |x, y, z| {
                format!(
                    "http://otile{}.mqcdn.com/tiles/1.0.0/osm/{}/{}/{}.png",
                    mirror_number(x, y, z),
                    z,
                    x,
                    y
                )
            }),
            TileSource::new("MapQuest Open Aerial", 0, 11, |x, y, z| {
                format!(
                    "http://oatile{}.mqcdn.com/naip/{}/{}/{}.png",
                    mirror_number(x, y, z),
                    z,
                    x,
                    y
                )
            }),
        ]
    }
}

impl fmt::Debug for TileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileSource")
            .field("name", &self.name)
            .field("zoom_min", &self.zoom_min)
            .field("zoom_max", &self.zoom_max)
            .finish_non_exhaustive()
    }
}

fn mirror_letter(x: u32, y: u32, z: u8) -> char {
    let n = (x as u64 + y as u64 + z as u64) % 3;
    (b'a' + n as u8) as char
}

fn mirror_number(x: u32, y: u32, z: u8) -> u64 {
    (x as u64 + y as u64 + z as u64) % 4 + 1
}

/// Metres per pixel at the equator for OSM zoom levels 0..=18
const OSM_METERS_PER_PIXEL: [f64; 19] = [
    78206.0,
    39135.758482,
    19567.879241,
    9783.939621,
    4891.969810,
    2445.984905,
    1222.992453,
    611.496226,
    305.748113,
    152.874057,
    76.437028,
    38.218514,
    19.109257,
    9.554629,
    4.777314,
    2.388657,
    1.194329,
    0.597164,
    0.29858,
];

/// Metres per pixel at `lat`, or 0 when `zoom` has no table entry
pub fn osm_scale(_lon: f64, lat: f64, zoom: i32) -> f64 {
    if !(0..OSM_METERS_PER_PIXEL.len() as i32).contains(&zoom) {
        return 0.0;
    }
    OSM_METERS_PER_PIXEL[zoom as usize] / (lat * std::f64::consts::PI / 180.0).cos()
}

#[derive(Clone)]
pub struct RouteSource {
    pub name: String,
    pub url: RouteUrlFn,
}

impl RouteSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Fn(RouteType, RouteMethod, f64, f64, f64, f64) -> String + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), url: Arc::new(url) }
    }

    pub fn builtin() -> Vec<RouteSource> {
        vec![RouteSource::new("Yours", |kind, method, flon, flat, tlon, tlat| {
            format!(
                "http://www.yournavigation.org/api/dev/route.php?\
                 flat={:.6}&flon={:.6}&tlat={:.6}&tlon={:.6}&v={}&fast={}&instructions=1",
                flat,
                flon,
                tlat,
                tlon,
                kind.as_str(),
                method as i32
            )
        })]
    }
}

#[derive(Clone)]
pub struct NameSource {
    pub name: String,
    pub url: NameUrlFn,
}

impl NameSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Fn(NameMethod, Option<&str>, f64, f64, i32) -> String + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), url: Arc::new(url) }
    }

    pub fn builtin() -> Vec<NameSource> {
        vec![NameSource::new("Nominatim", |method, address, lon, lat, zoom| match method {
            NameMethod::Search | NameMethod::SearchList => {
                let query = address
                    .unwrap_or_default()
                    .split(' ')
                    .filter(|word| !word.is_empty())
                    .collect::<Vec<_>>()
                    .join("+");
                format!(
                    "http://nominatim.openstreetmap.org/search?\
                     q={}&format=xml&polygon=0&addressdetails=0",
                    query
                )
            }
            NameMethod::Reverse => format!(
                "http://nominatim.openstreetmap.org/reverse?\
                 format=xml&lat={:.6}&lon={:.6}&zoom={}&addressdetails=0",
                lat, lon, zoom
            ),
        })]
    }
}

/// Registered sources plus the active one per kind
pub struct Sources {
    tiles: Vec<TileSource>,
    routes: Vec<RouteSource>,
    names: Vec<NameSource>,
    tile: usize,
    route: usize,
    name: usize,
}

impl Sources {
    pub fn tile(&self) -> &TileSource {
        &self.tiles[self.tile]
    }

    pub fn route(&self) -> &RouteSource {
        &self.routes[self.route]
    }

    pub fn name(&self) -> &NameSource {
        &self.names[self.name]
    }

    pub fn names(&self, kind: SourceKind) -> Vec<&str> {
        match kind {
            SourceKind::Tile => self.tiles.iter().map(|s| s.name.as_str()).collect(),
            SourceKind::Route => self.routes.iter().map(|s| s.name.as_str()).collect(),
            SourceKind::Name => self.names.iter().map(|s| s.name.as_str()).collect(),
        }
    }

    pub fn current(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Tile => &self.tile().name,
            SourceKind::Route => &self.route().name,
            SourceKind::Name => &self.name().name,
        }
    }

    /// Activate a source by name. Returns `false` when it was already active.
    pub fn select(&mut self, kind: SourceKind, name: &str) -> Result<bool> {
        let found = match kind {
            SourceKind::Tile => self.tiles.iter().position(|s| s.name == name),
            SourceKind::Route => self.routes.iter().position(|s| s.name == name),
            SourceKind::Name => self.names.iter().position(|s| s.name == name),
        };
        let Some(index) = found else {
            return Err(MapError::UnknownSource { kind, name: name.to_string() });
        };
        let slot = match kind {
            SourceKind::Tile => &mut self.tile,
            SourceKind::Route => &mut self.route,
            SourceKind::Name => &mut self.name,
        };
        if *slot == index {
            return Ok(false);
        }
        *slot = index;
        Ok(true)
    }

    /// Register or replace a tile source by name.
    /// Returns `true` when the active source was replaced.
    pub fn add_tile(&mut self, source: TileSource) -> bool {
        match self.tiles.iter().position(|s| s.name == source.name) {
            Some(i) => {
                self.tiles[i] = source;
                i == self.tile
            }
            None => {
                self.tiles.push(source);
                false
            }
        }
    }

    pub fn add_route(&mut self, source: RouteSource) {
        match self.routes.iter().position(|s| s.name == source.name) {
            Some(i) => self.routes[i] = source,
            None => self.routes.push(source),
        }
    }

    pub fn add_name(&mut self, source: NameSource) {
        match self.names.iter().position(|s| s.name == source.name) {
            Some(i) => self.names[i] = source,
            None => self.names.push(source),
        }
    }
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            tiles: TileSource::builtin(),
            routes: RouteSource::builtin(),
            names: NameSource::builtin(),
            tile: 0,
            route: 0,
            name: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapnik_url_mirrors() {
        let sources = Sources::default();
        let mapnik = sources.tile();
        assert_eq!(mapnik.name, "Mapnik");
        assert_eq!(mapnik.tile_url(1, 2, 3), "http://a.tile.openstreetmap.org/3/1/2.png");
        assert_eq!(mapnik.tile_url(1, 2, 4), "http://b.tile.openstreetmap.org/4/1/2.png");
    }

    #[test]
    fn test_mapquest_url_mirrors() {
        let sources = TileSource::builtin();
        let mapquest = &sources[3];
        assert_eq!(mapquest.tile_url(0, 0, 0), "http://otile1.mqcdn.com/tiles/1.0.0/osm/0/0/0.png");
        assert_eq!(mapquest.tile_url(1, 1, 1), "http://otile4.mqcdn.com/tiles/1.0.0/osm/1/1/1.png");
        assert_eq!(sources[4].zoom_max, 11);
    }

    #[test]
    fn test_osm_scale() {
        assert!((osm_scale(0.0, 0.0, 0) - 78206.0).abs() < 1e-9);
        assert!((osm_scale(0.0, 60.0, 1) - 39135.758482 * 2.0).abs() < 1e-6);
        assert_eq!(osm_scale(0.0, 0.0, 19), 0.0);
        assert_eq!(osm_scale(0.0, 0.0, -1), 0.0);
    }

    #[test]
    fn test_route_url() {
        let sources = Sources::default();
        let url = (sources.route().url)(
            RouteType::Bicycle,
            RouteMethod::Fastest,
            10.0,
            20.0,
            11.5,
            21.25,
        );
        assert_eq!(
            url,
            "http://www.yournavigation.org/api/dev/route.php?\
             flat=20.000000&flon=10.000000&tlat=21.250000&tlon=11.500000&\
             v=bicycle&fast=1&instructions=1"
        );
    }

    #[test]
    fn test_name_urls() {
        let sources = Sources::default();
        let search =
            (sources.name().url)(NameMethod::Search, Some("Seoul  city hall"), 0.0, 0.0, 3);
        assert!(search.contains("search?q=Seoul+city+hall&format=xml"));
        let reverse = (sources.name().url)(NameMethod::Reverse, None, 126.5, 37.25, 7);
        assert!(reverse.contains("lat=37.250000&lon=126.500000&zoom=7"));
    }

    #[test]
    fn test_select_source() {
        let mut sources = Sources::default();
        assert!(!sources.select(SourceKind::Tile, "Mapnik").unwrap());
        assert!(sources.select(SourceKind::Tile, "CycleMap").unwrap());
        assert_eq!(sources.current(SourceKind::Tile), "CycleMap");
        assert!(matches!(
            sources.select(SourceKind::Route, "Nope"),
            Err(MapError::UnknownSource { kind: SourceKind::Route, .. })
        ));
    }

    #[test]
    fn test_add_tile_reports_active_replacement() {
        let mut sources = Sources::default();
        assert!(!sources.add_tile(TileSource::new("Local", 0, 5, |_, _, _| String::new())));
        assert!(sources.add_tile(TileSource::new("Mapnik", 2, 9, |_, _, _| String::new())));
        assert_eq!(sources.tile().zoom_max, 9);
        assert_eq!(sources.names(SourceKind::Tile).len(), 6);
    }

    #[test]
    fn test_custom_source_zoom_cap() {
        let source = TileSource::new("Deep", 3, 30, |_, _, _| String::new());
        assert_eq!(source.zoom_max, MAX_SOURCE_ZOOM);
        assert_eq!(source.zoom_min, 3);
    }
}
