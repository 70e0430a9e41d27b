//! Route requests against the active route source and parsing of the KML-like reply

use std::path::PathBuf;

use slotmap::new_key_type;

use crate::error::{MapError, Result};
use crate::event::MapEvent;

use super::cache;
use super::loader::{read_reply, FetchRequest, JobId};
use super::tile::GeoPoint;
use super::{MapWidget, Request};

new_key_type! {
    /// Handle to a route request owned by a widget
    pub struct RouteId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteType {
    Motorcar,
    Bicycle,
    Foot,
}

impl RouteType {
    /// Vehicle name understood by the route service
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Motorcar => "motorcar",
            RouteType::Bicycle => "bicycle",
            RouteType::Foot => "foot",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMethod {
    Shortest = 0,
    Fastest = 1,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RouteNode {
    pub idx: usize,
    pub pos: GeoPoint,
}

/// Parsed route reply
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteInfo {
    /// Length in kilometres
    pub distance: f64,
    pub waypoints: Vec<String>,
    pub nodes: Vec<RouteNode>,
    /// Raw description text
    pub waypoints_text: Option<String>,
    /// Raw coordinates text
    pub nodes_text: String,
}

/// Called once with the loaded route, or `None` on failure
pub type RouteCallback = Box<dyn FnOnce(RouteId, Option<&Route>)>;

pub struct Route {
    kind: RouteType,
    method: RouteMethod,
    from: GeoPoint,
    to: GeoPoint,
    file: PathBuf,
    job: Option<JobId>,
    info: Option<RouteInfo>,
    callback: Option<RouteCallback>,
}

impl Route {
    pub fn kind(&self) -> RouteType {
        self.kind
    }

    pub fn method(&self) -> RouteMethod {
        self.method
    }

    pub fn endpoints(&self) -> (GeoPoint, GeoPoint) {
        (self.from, self.to)
    }

    pub fn is_pending(&self) -> bool {
        self.job.is_some()
    }

    pub fn info(&self) -> Option<&RouteInfo> {
        self.info.as_ref()
    }

    pub fn distance(&self) -> f64 {
        self.info.as_ref().map_or(0.0, |i| i.distance)
    }

    pub fn nodes(&self) -> &[RouteNode] {
        self.info.as_ref().map_or(&[], |i| &i.nodes)
    }
}

fn element_text<'a>(doc: &'a roxmltree::Document, name: &str) -> Option<&'a str> {
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .map(|n| n.text().unwrap_or_default())
}

/// Parse a route reply carrying `distance`, `description` and `coordinates` elements
pub fn parse_route(xml: &str) -> Result<RouteInfo> {
    let doc = roxmltree::Document::parse(xml)?;

    let distance = match element_text(&doc, "distance") {
        Some(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| MapError::Malformed(format!("distance {:?}", text)))?,
        None => 0.0,
    };

    let waypoints_text = element_text(&doc, "description").map(str::to_string);
    let waypoints = waypoints_text
        .as_deref()
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    let Some(coordinates) = element_text(&doc, "coordinates") else {
        return Err(MapError::Malformed("route without coordinates".to_string()));
    };
    let mut nodes = Vec::new();
    for line in coordinates.split_whitespace() {
        let mut parts = line.split(',');
        let lon = parts.next().and_then(|v| v.parse::<f64>().ok());
        let lat = parts.next().and_then(|v| v.parse::<f64>().ok());
        let (Some(lon), Some(lat)) = (lon, lat) else {
            return Err(MapError::Malformed(format!("route node {:?}", line)));
        };
        nodes.push(RouteNode { idx: nodes.len(), pos: GeoPoint::wrapped(lon, lat) });
    }

    Ok(RouteInfo {
        distance,
        waypoints,
        nodes,
        waypoints_text,
        nodes_text: coordinates.to_string(),
    })
}

impl MapWidget {
    /// Request a route between two points from the active route source
    #[allow(clippy::too_many_arguments)]
    pub fn route_add(
        &mut self,
        kind: RouteType,
        method: RouteMethod,
        flon: f64,
        flat: f64,
        tlon: f64,
        tlat: f64,
        callback: Option<RouteCallback>,
    ) -> Result<RouteId> {
        let (from, to) = (GeoPoint::wrapped(flon, flat), GeoPoint::wrapped(tlon, tlat));
        let url = (self.sources.route().url)(kind, method, from.lon, from.lat, to.lon, to.lat);
        let file = self.tiles.layout_mut().request_path("route");
        cache::ensure_parent(&file);

        let job = match self.fetcher.start(FetchRequest { url, dest: file.clone() }) {
            Ok(job) => job,
            Err(e) => {
                log::error!("Can't request route: {}", e);
                return Err(e);
            }
        };

        let id = self.routes.insert(Route {
            kind,
            method,
            from,
            to,
            file,
            job: Some(job),
            info: None,
            callback,
        });
        self.requests.insert(job, Request::Route(id));
        self.events.push(MapEvent::RouteLoad(id));
        self.events.push(MapEvent::BusyStart);
        Ok(id)
    }

    /// Drop a route. A pending request is aborted and reported as failed.
    pub fn route_del(&mut self, id: RouteId) -> Result<()> {
        let mut route = self.routes.remove(id).ok_or(MapError::StaleHandle)?;
        cache::remove_file(&route.file);
        let Some(job) = route.job else {
            return Ok(());
        };
        self.fetcher.abort(job);
        self.requests.remove(&job);
        log::debug!("Route {:?} deleted while loading", id);
        if let Some(callback) = route.callback.take() {
            callback(id, None);
        }
        self.events.push(MapEvent::RouteLoadedFail(id));
        self.events.push(MapEvent::BusyStop);
        Ok(())
    }

    pub fn route(&self, id: RouteId) -> Option<&Route> {
        self.routes.get(id)
    }

    pub fn route_distance_get(&self, id: RouteId) -> Option<f64> {
        self.routes.get(id).map(Route::distance)
    }

    /// Raw `lon,lat` node text of a loaded route
    pub fn route_node_get(&self, id: RouteId) -> Option<&str> {
        self.routes.get(id)?.info.as_ref().map(|i| i.nodes_text.as_str())
    }

    /// Raw description text of a loaded route
    pub fn route_waypoint_get(&self, id: RouteId) -> Option<&str> {
        self.routes.get(id)?.info.as_ref()?.waypoints_text.as_deref()
    }

    pub(super) fn route_complete(&mut self, id: RouteId, status: u16) {
        let Some(route) = self.routes.get_mut(id) else {
            return;
        };
        route.job = None;
        route.info = match read_reply(&route.file, status).and_then(|body| parse_route(&body)) {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("Route request failed: {}", e);
                None
            }
        };

        let loaded = route.info.is_some();
        if let Some(callback) = route.callback.take() {
            let route = &self.routes[id];
            callback(id, loaded.then_some(route));
        }
        self.events.push(if loaded {
            MapEvent::RouteLoaded(id)
        } else {
            MapEvent::RouteLoadedFail(id)
        });
        self.events.push(MapEvent::BusyStop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://earth.google.com/kml/2.0">
  <Document>
    <name>KML Samples</name>
    <distance>1.257</distance>
    <traveltime>91</traveltime>
    <description><![CDATA[Continue on Main Street.
Turn left onto Oak Road.
]]></description>
    <Folder>
      <Placemark>
        <LineString>
          <coordinates>
            8.0,52.0
            8.01,52.005
            8.02,52.01
          </coordinates>
        </LineString>
      </Placemark>
    </Folder>
  </Document>
</kml>"#;

    #[test]
    fn test_parse_route() {
        let info = parse_route(REPLY).unwrap();
        assert!((info.distance - 1.257).abs() < 1e-9);
        assert_eq!(info.waypoints, vec!["Continue on Main Street.", "Turn left onto Oak Road."]);
        assert_eq!(info.nodes.len(), 3);
        assert_eq!(info.nodes[2].idx, 2);
        assert!((info.nodes[1].pos.lon - 8.01).abs() < 1e-9);
        assert!((info.nodes[1].pos.lat - 52.005).abs() < 1e-9);
        assert!(info.nodes_text.contains("8.02,52.01"));
    }

    #[test]
    fn test_route_without_coordinates_is_malformed() {
        let err =
            parse_route("<kml><Document><distance>3</distance></Document></kml>").unwrap_err();
        assert!(matches!(err, MapError::Malformed(_)));
    }

    #[test]
    fn test_route_bad_node_is_malformed() {
        let err = parse_route("<kml><coordinates>8.0,abc</coordinates></kml>").unwrap_err();
        assert!(matches!(err, MapError::Malformed(_)));
    }

    #[test]
    fn test_route_not_xml() {
        assert!(matches!(parse_route("not xml <"), Err(MapError::Xml(_))));
    }

    #[test]
    fn test_route_type_names() {
        assert_eq!(RouteType::Motorcar.as_str(), "motorcar");
        assert_eq!(RouteMethod::Fastest as i32, 1);
    }
}
