//! Signals emitted by the map widget
//!
//! Events accumulate inside the widget during API calls and `tick`, and the host drains them
//! with `MapWidget::take_events`.

use crate::map::name::NameId;
use crate::map::overlay::OverlayId;
use crate::map::route::RouteId;
use crate::map::tile::TileId;

/// Target of an overlay click: a stored overlay or the group led by `boss`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayTarget {
    Overlay(OverlayId),
    Group { boss: OverlayId },
}

#[derive(Clone, Debug, PartialEq)]
pub enum MapEvent {
    Clicked { x: i32, y: i32 },
    ClickedDouble { x: i32, y: i32 },
    Press { x: i32, y: i32 },
    LongPressed { x: i32, y: i32 },
    Scroll,
    ScrollDragStart,
    ScrollDragStop,
    ScrollAnimStart,
    ScrollAnimStop,
    ZoomStart,
    ZoomChange,
    ZoomStop,
    Loaded,
    TileLoad(TileId),
    TileLoaded(TileId),
    TileLoadedFail(TileId),
    RouteLoad(RouteId),
    RouteLoaded(RouteId),
    RouteLoadedFail(RouteId),
    NameLoad(NameId),
    NameLoaded(NameId),
    NameLoadedFail(NameId),
    OverlayClicked(OverlayTarget),
    OverlayDel(OverlayId),
    BusyStart,
    BusyStop,
}

impl MapEvent {
    /// Signal name as seen by observers
    pub fn signal(&self) -> &'static str {
        match self {
            MapEvent::Clicked { .. } => "clicked",
            MapEvent::ClickedDouble { .. } => "clicked,double",
            MapEvent::Press { .. } => "press",
            MapEvent::LongPressed { .. } => "longpressed",
            MapEvent::Scroll => "scroll",
            MapEvent::ScrollDragStart => "scroll,drag,start",
            MapEvent::ScrollDragStop => "scroll,drag,stop",
            MapEvent::ScrollAnimStart => "scroll,anim,start",
            MapEvent::ScrollAnimStop => "scroll,anim,stop",
            MapEvent::ZoomStart => "zoom,start",
            MapEvent::ZoomChange => "zoom,change",
            MapEvent::ZoomStop => "zoom,stop",
            MapEvent::Loaded => "loaded",
            MapEvent::TileLoad(_) => "tile,load",
            MapEvent::TileLoaded(_) => "tile,loaded",
            MapEvent::TileLoadedFail(_) => "tile,loaded,fail",
            MapEvent::RouteLoad(_) => "route,load",
            MapEvent::RouteLoaded(_) => "route,loaded",
            MapEvent::RouteLoadedFail(_) => "route,loaded,fail",
            MapEvent::NameLoad(_) => "name,load",
            MapEvent::NameLoaded(_) => "name,loaded",
            MapEvent::NameLoadedFail(_) => "name,loaded,fail",
            MapEvent::OverlayClicked(_) => "overlay,clicked",
            MapEvent::OverlayDel(_) => "overlay,del",
            MapEvent::BusyStart => "busy,start",
            MapEvent::BusyStop => "busy,stop",
        }
    }
}
