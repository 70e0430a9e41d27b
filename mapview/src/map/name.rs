//! Forward and reverse geocoding against the active name source

use std::path::PathBuf;

use slotmap::new_key_type;

use crate::error::{MapError, Result};
use crate::event::MapEvent;

use super::cache;
use super::loader::{read_reply, FetchRequest, JobId};
use super::tile::GeoPoint;
use super::{MapWidget, Request};

new_key_type! {
    /// Handle to a geocoding result owned by a widget
    pub struct NameId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameMethod {
    /// Address to position, first match
    Search,
    /// Position to address
    Reverse,
    /// Address to every matching position
    SearchList,
}

/// One geocoded place
#[derive(Clone, Debug, PartialEq)]
pub struct Place {
    pub address: String,
    pub pos: GeoPoint,
}

pub type NameCallback = Box<dyn FnOnce(NameId, Option<&Name>)>;
pub type NameListCallback = Box<dyn FnOnce(Option<&[NameId]>)>;

pub struct Name {
    method: NameMethod,
    address: Option<String>,
    pos: GeoPoint,
    file: Option<PathBuf>,
    job: Option<JobId>,
    callback: Option<NameCallback>,
}

impl Name {
    pub fn method(&self) -> NameMethod {
        self.method
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn region(&self) -> GeoPoint {
        self.pos
    }

    pub fn is_pending(&self) -> bool {
        self.job.is_some()
    }
}

fn place_of(node: roxmltree::Node) -> Option<Place> {
    let address = match node.attribute("display_name") {
        Some(name) => name.to_string(),
        None if node.tag_name().name() == "result" => node.text()?.trim().to_string(),
        None => return None,
    };
    if address.is_empty() {
        return None;
    }
    let coord = |attr: &str| node.attribute(attr).and_then(|v| v.trim().parse::<f64>().ok());
    let pos = match (coord("lon"), coord("lat")) {
        (Some(lon), Some(lat)) => GeoPoint::wrapped(lon, lat),
        _ => return None,
    };
    Some(Place { address, pos })
}

fn places(xml: &str) -> Result<Vec<Place>> {
    let doc = roxmltree::Document::parse(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.is_element() && matches!(n.tag_name().name(), "place" | "result"))
        .filter_map(place_of)
        .collect())
}

/// First place of a search or reverse reply
pub fn parse_name(xml: &str) -> Result<Place> {
    places(xml)?
        .into_iter()
        .next()
        .ok_or_else(|| MapError::Malformed("no place in reply".to_string()))
}

/// Every place of a search reply; an empty match list is not an error
pub fn parse_name_list(xml: &str) -> Result<Vec<Place>> {
    places(xml)
}

impl MapWidget {
    /// Geocode `address`, or reverse-geocode `(lon, lat)` when no address is given
    pub fn name_add(
        &mut self,
        address: Option<&str>,
        lon: f64,
        lat: f64,
        callback: Option<NameCallback>,
    ) -> Result<NameId> {
        let method = if address.is_some() { NameMethod::Search } else { NameMethod::Reverse };
        let pos = GeoPoint::wrapped(lon, lat);
        let url = (self.sources.name().url)(method, address, pos.lon, pos.lat, self.view.zoom());
        let file = self.tiles.layout_mut().request_path("name");
        cache::ensure_parent(&file);

        let job = match self.fetcher.start(FetchRequest { url, dest: file.clone() }) {
            Ok(job) => job,
            Err(e) => {
                log::error!("Can't request name: {}", e);
                return Err(e);
            }
        };

        let id = self.names.insert(Name {
            method,
            address: address.map(str::to_string),
            pos,
            file: Some(file),
            job: Some(job),
            callback,
        });
        self.requests.insert(job, Request::Name(id));
        self.events.push(MapEvent::NameLoad(id));
        self.events.push(MapEvent::BusyStart);
        Ok(id)
    }

    /// Search `address` and report every match as its own name
    pub fn name_search(&mut self, address: &str, callback: Option<NameListCallback>) -> Result<()> {
        let zoom = self.view.zoom();
        let url = (self.sources.name().url)(NameMethod::SearchList, Some(address), 0.0, 0.0, zoom);
        let file = self.tiles.layout_mut().request_path("name");
        cache::ensure_parent(&file);

        let job = match self.fetcher.start(FetchRequest { url, dest: file.clone() }) {
            Ok(job) => job,
            Err(e) => {
                log::error!("Can't request name list: {}", e);
                return Err(e);
            }
        };
        self.requests.insert(job, Request::NameList { file, callback });
        self.events.push(MapEvent::BusyStart);
        Ok(())
    }

    /// Drop a name. A pending request is aborted and reported as failed.
    pub fn name_del(&mut self, id: NameId) -> Result<()> {
        let mut name = self.names.remove(id).ok_or(MapError::StaleHandle)?;
        if let Some(file) = &name.file {
            cache::remove_file(file);
        }
        let Some(job) = name.job else {
            return Ok(());
        };
        self.fetcher.abort(job);
        self.requests.remove(&job);
        log::debug!("Name {:?} deleted while loading", id);
        if let Some(callback) = name.callback.take() {
            callback(id, None);
        }
        self.events.push(MapEvent::NameLoadedFail(id));
        self.events.push(MapEvent::BusyStop);
        Ok(())
    }

    pub fn name(&self, id: NameId) -> Option<&Name> {
        self.names.get(id)
    }

    pub fn name_address_get(&self, id: NameId) -> Option<&str> {
        self.names.get(id)?.address()
    }

    pub fn name_region_get(&self, id: NameId) -> Option<GeoPoint> {
        self.names.get(id).map(Name::region)
    }

    pub(super) fn name_complete(&mut self, id: NameId, status: u16) {
        let Some(name) = self.names.get_mut(id) else {
            return;
        };
        name.job = None;
        let reply = match &name.file {
            Some(file) => read_reply(file, status).and_then(|body| parse_name(&body)),
            None => Err(MapError::Malformed("name without reply file".to_string())),
        };
        let place = match reply {
            Ok(place) => Some(place),
            Err(e) => {
                log::warn!("Name request failed: {}", e);
                None
            }
        };

        let loaded = place.is_some();
        if let Some(place) = place {
            name.address = Some(place.address);
            name.pos = place.pos;
        }
        if let Some(callback) = name.callback.take() {
            let name = &self.names[id];
            callback(id, loaded.then_some(name));
        }
        self.events.push(if loaded {
            MapEvent::NameLoaded(id)
        } else {
            MapEvent::NameLoadedFail(id)
        });
        self.events.push(MapEvent::BusyStop);
    }

    pub(super) fn name_list_complete(
        &mut self,
        file: PathBuf,
        callback: Option<NameListCallback>,
        status: u16,
    ) {
        let places = read_reply(&file, status)
            .and_then(|body| parse_name_list(&body))
            .map_err(|e| log::warn!("Name list request failed: {}", e))
            .ok();
        cache::remove_file(&file);

        let ids: Option<Vec<NameId>> = places.map(|places| {
            places
                .into_iter()
                .map(|place| {
                    self.names.insert(Name {
                        method: NameMethod::Search,
                        address: Some(place.address),
                        pos: place.pos,
                        file: None,
                        job: None,
                        callback: None,
                    })
                })
                .collect()
        });
        if let Some(callback) = callback {
            callback(ids.as_deref());
        }
        self.events.push(MapEvent::BusyStop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<searchresults timestamp="Sat, 07 Nov 09 14:42:10 +0000" querystring="city hall" polygon="false">
  <place place_id="1620612" osm_type="node" lat="37.5663" lon="126.9779"
    display_name="Seoul City Hall, Jung-gu, Seoul" class="amenity" type="townhall"/>
  <place place_id="1620613" osm_type="node" lat="35.1798" lon="129.0750"
    display_name="Busan City Hall, Yeonje-gu, Busan" class="amenity" type="townhall"/>
</searchresults>"#;

    const REVERSE: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<reversegeocode timestamp="Fri, 06 Nov 09 16:33:54 +0000"
  querystring="format=xml&amp;lat=51.5&amp;lon=-0.12">
  <result place_id="1620612" osm_type="node" lat="51.5000" lon="-0.1200"
    >Westminster Bridge, London, United Kingdom</result>
  <addressparts><road>Westminster Bridge</road></addressparts>
</reversegeocode>"#;

    #[test]
    fn test_parse_search_first_match() {
        let place = parse_name(SEARCH).unwrap();
        assert_eq!(place.address, "Seoul City Hall, Jung-gu, Seoul");
        assert!((place.pos.lon - 126.9779).abs() < 1e-9);
        assert!((place.pos.lat - 37.5663).abs() < 1e-9);
    }

    #[test]
    fn test_parse_reverse_result_text() {
        let place = parse_name(REVERSE).unwrap();
        assert_eq!(place.address, "Westminster Bridge, London, United Kingdom");
        assert!((place.pos.lon + 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_parse_name_list() {
        let list = parse_name_list(SEARCH).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].address, "Busan City Hall, Yeonje-gu, Busan");
        assert!(parse_name_list("<searchresults/>").unwrap().is_empty());
    }

    #[test]
    fn test_empty_reply_is_malformed() {
        assert!(matches!(parse_name("<searchresults/>"), Err(MapError::Malformed(_))));
    }
}
