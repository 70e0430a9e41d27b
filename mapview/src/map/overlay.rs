//! Overlay store, per-pass placement and the overlay half of the widget API
//!
//! Every overlay lives in one slotmap arena and one insertion-ordered list. Class overlays
//! reference their members by id; group overlays are rebuilt from scratch on every placement
//! pass and are addressed by the id of their boss member.

use std::any::Any;

use slotmap::{new_key_type, SlotMap};

use crate::error::{MapError, Result};
use crate::event::{MapEvent, OverlayTarget};

use super::camera::Projector;
use super::decluster::{Declusterer, Member};
use super::route::RouteId;
use super::tile::GeoPoint;
use super::MapWidget;

new_key_type! {
    /// Handle to an overlay owned by a widget
    pub struct OverlayId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayKind {
    Default,
    Class,
    Group,
    Bubble,
    Route,
    Line,
    Polyline,
    Polygon,
    Circle,
    Scale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Colour a freshly created overlay of `kind` starts with
pub fn default_color(kind: OverlayKind) -> Color {
    match kind {
        OverlayKind::Class | OverlayKind::Group => Color::rgba(0x90, 0xee, 0x90, 0xff),
        OverlayKind::Default => Color::rgba(0x87, 0xce, 0xeb, 0xff),
        OverlayKind::Bubble => Color::rgba(0xff, 0xff, 0xff, 0xff),
        OverlayKind::Route | OverlayKind::Line => Color::rgba(0xff, 0x00, 0x00, 0xff),
        OverlayKind::Polyline | OverlayKind::Polygon | OverlayKind::Circle => {
            Color::rgba(0xdc, 0x14, 0x3c, 0xdc)
        }
        OverlayKind::Scale => Color::rgba(0x00, 0x00, 0x00, 0xff),
    }
}

/// Host-drawn visual: an opaque key the host resolves plus its box size
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Visual {
    pub key: String,
    pub width: i32,
    pub height: i32,
}

impl Visual {
    pub fn new(key: impl Into<String>, width: i32, height: i32) -> Self {
        Self { key: key.into(), width, height }
    }
}

/// What a marker box shows, in fallback order
#[derive(Clone, Debug, PartialEq)]
pub enum MarkerVisual {
    Content(Visual),
    ClassContent(Visual),
    Icon(Visual),
    ClassIcon(Visual),
    /// Themed marker, with the member count for groups
    Layout { label: Option<String> },
}

/// Canvas placement computed by the last pass
#[derive(Clone, Debug, PartialEq)]
pub enum OverlayGeometry {
    Marker { x: i32, y: i32, w: i32, h: i32, visual: MarkerVisual },
    Bubble { x: i32, y: i32, w: i32, h: i32, contents: Vec<Visual> },
    /// Route outline polygon
    Path { points: Vec<(i32, i32)> },
    Line { from: (i32, i32), to: (i32, i32) },
    Segments { segments: Vec<((i32, i32), (i32, i32))>, width: i32 },
    Polygon { points: Vec<(i32, i32)> },
    Circle { x: i32, y: i32, w: i32, h: i32 },
    Scale { x: i32, y: i32, w: i32, h: i32, bar_width: i32, padding: i32, label: String },
}

impl OverlayGeometry {
    /// Box for hit testing, markers and bubbles only
    fn hit_box(&self) -> Option<(i32, i32, i32, i32)> {
        match *self {
            OverlayGeometry::Marker { x, y, w, h, .. }
            | OverlayGeometry::Bubble { x, y, w, h, .. } => Some((x, y, w, h)),
            _ => None,
        }
    }
}

pub type OverlayCallback = Box<dyn FnMut(OverlayTarget)>;
pub type OverlayDelCallback = Box<dyn FnOnce(OverlayId)>;

pub(crate) struct DefaultData {
    pos: GeoPoint,
    coord: Option<(i32, i32)>,
    icon: Option<Visual>,
    content: Option<Visual>,
    class_icon: Option<Visual>,
    class_content: Option<Visual>,
}

impl DefaultData {
    fn marker(&self, marker: (i32, i32), label: Option<String>) -> (MarkerVisual, (i32, i32)) {
        if let Some(c) = &self.content {
            (MarkerVisual::Content(c.clone()), (c.width, c.height))
        } else if let (None, Some(c)) = (&self.icon, &self.class_content) {
            (MarkerVisual::ClassContent(c.clone()), (c.width, c.height))
        } else if let Some(i) = &self.icon {
            (MarkerVisual::Icon(i.clone()), marker)
        } else if let Some(i) = &self.class_icon {
            (MarkerVisual::ClassIcon(i.clone()), marker)
        } else {
            (MarkerVisual::Layout { label }, marker)
        }
    }
}

pub(crate) struct ClassData {
    members: Vec<OverlayId>,
    icon: Option<Visual>,
    content: Option<Visual>,
    zoom_max: i32,
}

pub(crate) struct BubbleData {
    pos: Option<GeoPoint>,
    coord: Option<(i32, i32)>,
    follow: Option<OverlayTarget>,
    size: (i32, i32),
    contents: Vec<Visual>,
}

pub(crate) struct CircleData {
    center: GeoPoint,
    radius: f64,
    /// Radius over the map width at creation
    ratio: f64,
}

pub(crate) struct ScaleData {
    x: i32,
    y: i32,
    size: (i32, i32),
    padding: i32,
}

pub(crate) enum Payload {
    Default(DefaultData),
    Class(ClassData),
    Bubble(BubbleData),
    Route { route: RouteId, nodes: Vec<GeoPoint> },
    Line { from: GeoPoint, to: GeoPoint },
    Polyline { regions: Vec<GeoPoint>, width: i32 },
    Polygon { regions: Vec<GeoPoint> },
    Circle(CircleData),
    Scale(ScaleData),
}

impl Payload {
    fn kind(&self) -> OverlayKind {
        match self {
            Payload::Default(_) => OverlayKind::Default,
            Payload::Class(_) => OverlayKind::Class,
            Payload::Bubble(_) => OverlayKind::Bubble,
            Payload::Route { .. } => OverlayKind::Route,
            Payload::Line { .. } => OverlayKind::Line,
            Payload::Polyline { .. } => OverlayKind::Polyline,
            Payload::Polygon { .. } => OverlayKind::Polygon,
            Payload::Circle(_) => OverlayKind::Circle,
            Payload::Scale(_) => OverlayKind::Scale,
        }
    }
}

pub struct Overlay {
    payload: Payload,
    color: Color,
    hide: bool,
    zoom_min: i32,
    paused: bool,
    visible: bool,
    class: Option<OverlayId>,
    in_group: bool,
    boss: bool,
    geometry: Option<OverlayGeometry>,
    data: Option<Box<dyn Any>>,
    on_click: Option<OverlayCallback>,
    on_del: Option<OverlayDelCallback>,
}

impl Overlay {
    fn new(payload: Payload) -> Self {
        Self {
            color: default_color(payload.kind()),
            payload,
            hide: false,
            zoom_min: 0,
            paused: false,
            visible: false,
            class: None,
            in_group: false,
            boss: false,
            geometry: None,
            data: None,
            on_click: None,
            on_del: None,
        }
    }

    pub fn kind(&self) -> OverlayKind {
        self.payload.kind()
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn is_hidden(&self) -> bool {
        self.hide
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn displayed_zoom_min(&self) -> i32 {
        self.zoom_min
    }

    pub fn class(&self) -> Option<OverlayId> {
        self.class
    }

    /// Absorbed into a group marker by the last pass
    pub fn is_grouped(&self) -> bool {
        self.in_group
    }

    pub fn geometry(&self) -> Option<&OverlayGeometry> {
        self.geometry.as_ref()
    }

    /// Size used for the marker box and for grouping
    fn marker_box(&self, marker: (i32, i32)) -> Option<(i32, i32, i32, i32)> {
        match &self.payload {
            Payload::Default(d) => {
                let (x, y) = d.coord?;
                let (_, (w, h)) = d.marker(marker, None);
                Some((x, y, w, h))
            }
            Payload::Bubble(b) => {
                let (x, y) = b.coord?;
                Some((x, y, b.size.0, b.size.1))
            }
            _ => None,
        }
    }
}

/// Synthetic marker standing in for a cluster of class members
#[derive(Clone, Debug, PartialEq)]
pub struct GroupOverlay {
    pub boss: OverlayId,
    pub class: OverlayId,
    pub members: Vec<OverlayId>,
    /// Centroid in map pixels
    pub center: (f64, f64),
    pub region: GeoPoint,
    pub label: String,
    pub color: Color,
    pub geometry: Option<OverlayGeometry>,
}

/// Viewport-dependent inputs of one placement pass
pub(crate) struct PlaceContext<'a> {
    pub projector: Projector<'a>,
    pub marker_size: (i32, i32),
    pub declusterer: &'a Declusterer,
}

#[derive(Default)]
pub struct OverlayStore {
    arena: SlotMap<OverlayId, Overlay>,
    order: Vec<OverlayId>,
    groups: Vec<GroupOverlay>,
}

impl OverlayStore {
    pub(crate) fn insert(&mut self, payload: Payload) -> OverlayId {
        let id = self.arena.insert(Overlay::new(payload));
        self.order.push(id);
        id
    }

    pub fn get(&self, id: OverlayId) -> Option<&Overlay> {
        self.arena.get(id)
    }

    fn get_mut(&mut self, id: OverlayId) -> Result<&mut Overlay> {
        self.arena.get_mut(id).ok_or(MapError::StaleHandle)
    }

    /// Overlays in insertion order
    pub fn ids(&self) -> &[OverlayId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn groups(&self) -> &[GroupOverlay] {
        &self.groups
    }

    pub fn group(&self, boss: OverlayId) -> Option<&GroupOverlay> {
        self.groups.iter().find(|g| g.boss == boss)
    }

    /// Unlink and free an overlay. Class members are detached first.
    pub(crate) fn remove(&mut self, id: OverlayId) -> Option<Overlay> {
        let class = self.arena.get(id)?.class;
        if let Some(class) = class {
            self.detach(class, id);
        }
        if let Some(Payload::Class(data)) = self.arena.get(id).map(|o| &o.payload) {
            for member in data.members.clone() {
                self.detach(id, member);
            }
        }
        self.groups.retain(|g| g.boss != id && g.class != id && !g.members.contains(&id));
        self.order.retain(|o| *o != id);
        self.arena.remove(id)
    }

    fn attach(&mut self, class: OverlayId, member: OverlayId) -> Result<()> {
        let (icon, content) = match self.arena.get(class).map(|o| &o.payload) {
            Some(Payload::Class(c)) => {
                if c.members.contains(&member) {
                    return Err(MapError::InvalidArgument(
                        "overlay is already a class member".to_string(),
                    ));
                }
                (c.icon.clone(), c.content.clone())
            }
            Some(other) => {
                return Err(MapError::WrongKind { op: "class_append", actual: other.kind() });
            }
            None => return Err(MapError::StaleHandle),
        };
        let previous = match self.arena.get(member) {
            Some(o) => match o.kind() {
                OverlayKind::Default | OverlayKind::Bubble => o.class,
                other => return Err(MapError::WrongKind { op: "class member", actual: other }),
            },
            None => return Err(MapError::StaleHandle),
        };
        if let Some(previous) = previous {
            self.detach(previous, member);
        }

        if let Some(Payload::Class(c)) = self.arena.get_mut(class).map(|o| &mut o.payload) {
            c.members.push(member);
        }
        let ov = self.get_mut(member)?;
        ov.class = Some(class);
        if let Payload::Default(d) = &mut ov.payload {
            d.class_icon = icon;
            d.class_content = content;
        }
        Ok(())
    }

    fn detach(&mut self, class: OverlayId, member: OverlayId) -> bool {
        let found = match self.arena.get_mut(class).map(|o| &mut o.payload) {
            Some(Payload::Class(c)) => {
                let before = c.members.len();
                c.members.retain(|m| *m != member);
                before != c.members.len()
            }
            _ => false,
        };
        if let Some(ov) = self.arena.get_mut(member) {
            if ov.class == Some(class) {
                ov.class = None;
                ov.in_group = false;
                ov.boss = false;
                if let Payload::Default(d) = &mut ov.payload {
                    d.class_icon = None;
                    d.class_content = None;
                }
            }
        }
        found
    }

    /// Copy a class visual into every member's fallback slot
    fn propagate_class_visuals(&mut self, class: OverlayId) {
        let Some(Payload::Class(c)) = self.arena.get(class).map(|o| &o.payload) else {
            return;
        };
        let (members, icon, content) = (c.members.clone(), c.icon.clone(), c.content.clone());
        for member in members {
            if let Some(Overlay { payload: Payload::Default(d), .. }) = self.arena.get_mut(member) {
                d.class_icon = icon.clone();
                d.class_content = content.clone();
            }
        }
    }

    /// Geo bounds `(min_lon, max_lon, min_lat, max_lat)` of one overlay
    pub(crate) fn region_bounds(&self, id: OverlayId) -> Option<(f64, f64, f64, f64)> {
        let ov = self.arena.get(id)?;
        let points: Vec<GeoPoint> = match &ov.payload {
            Payload::Default(d) => vec![d.pos],
            Payload::Bubble(b) => b.pos.into_iter().collect(),
            Payload::Class(c) => c
                .members
                .iter()
                .filter_map(|m| self.region_bounds(*m))
                .flat_map(|(x0, x1, y0, y1)| [GeoPoint::new(x0, y0), GeoPoint::new(x1, y1)])
                .collect(),
            Payload::Route { nodes, .. } => nodes.clone(),
            Payload::Line { from, to } => vec![*from, *to],
            Payload::Polyline { regions, .. } | Payload::Polygon { regions } => regions.clone(),
            Payload::Circle(c) => vec![c.center],
            Payload::Scale(_) => Vec::new(),
        };
        points.iter().fold(None, |acc, p| {
            let (x0, x1, y0, y1) = acc.unwrap_or((p.lon, p.lon, p.lat, p.lat));
            Some((x0.min(p.lon), x1.max(p.lon), y0.min(p.lat), y1.max(p.lat)))
        })
    }

    /// Topmost visible marker, bubble or group under a canvas point
    pub fn hit_test(&self, x: i32, y: i32) -> Option<OverlayTarget> {
        let inside = |g: &OverlayGeometry| {
            g.hit_box()
                .is_some_and(|(bx, by, bw, bh)| x >= bx && x < bx + bw && y >= by && y < by + bh)
        };
        for id in self.order.iter().rev() {
            let ov = &self.arena[*id];
            if ov.kind() == OverlayKind::Bubble
                && ov.visible
                && ov.geometry.as_ref().is_some_and(inside)
            {
                return Some(OverlayTarget::Overlay(*id));
            }
        }
        if let Some(group) =
            self.groups.iter().rev().find(|g| g.geometry.as_ref().is_some_and(inside))
        {
            return Some(OverlayTarget::Group { boss: group.boss });
        }
        self.order
            .iter()
            .rev()
            .find(|id| {
                let ov = &self.arena[**id];
                ov.kind() == OverlayKind::Default
                    && ov.visible
                    && ov.geometry.as_ref().is_some_and(inside)
            })
            .map(|id| OverlayTarget::Overlay(*id))
    }

    /// Recompute positions, regroup every class and place every overlay on the canvas
    pub(crate) fn place(&mut self, ctx: &PlaceContext) {
        let projector = &ctx.projector;
        let zoom = projector.view.zoom();

        self.groups.clear();
        for id in &self.order {
            let ov = &mut self.arena[*id];
            if ov.paused {
                continue;
            }
            ov.in_group = false;
            ov.boss = false;
            match &mut ov.payload {
                Payload::Default(d) => d.coord = Some(projector.to_coord(d.pos.lon, d.pos.lat)),
                Payload::Bubble(b) if b.follow.is_none() => {
                    b.coord = b.pos.map(|p| projector.to_coord(p.lon, p.lat));
                }
                Payload::Bubble(b) => b.coord = None,
                _ => {}
            }
        }

        for class in self.order.clone() {
            self.group_class(class, ctx);
        }

        for group in &mut self.groups {
            let class = &self.arena[group.class];
            let (cx, cy) = projector
                .view
                .coord_to_canvas(group.center.0.round() as i32, group.center.1.round() as i32);
            let (visual, (w, h)) = match &class.payload {
                Payload::Class(ClassData { content: Some(c), .. }) => {
                    (MarkerVisual::Content(c.clone()), (c.width, c.height))
                }
                Payload::Class(ClassData { icon: Some(i), .. }) => {
                    (MarkerVisual::Icon(i.clone()), ctx.marker_size)
                }
                _ => {
                    let label = Some(group.label.clone());
                    (MarkerVisual::Layout { label }, ctx.marker_size)
                }
            };
            let (x, y) = (cx - w / 2, cy - h / 2);
            group.geometry = Some(OverlayGeometry::Marker { x, y, w, h, visual });
        }

        // bubbles last: they may follow a marker placed in this pass
        for bubbles in [false, true] {
            for id in self.order.clone() {
                if (self.arena[id].kind() == OverlayKind::Bubble) == bubbles {
                    self.show(id, zoom, ctx);
                }
            }
        }
    }

    fn group_class(&mut self, class: OverlayId, ctx: &PlaceContext) {
        let zoom = ctx.projector.view.zoom();
        let ov = &self.arena[class];
        let Payload::Class(data) = &ov.payload else {
            return;
        };
        if ov.hide || ov.paused || ov.zoom_min > zoom || data.zoom_max < zoom {
            return;
        }

        let mut members: Vec<Member> = data
            .members
            .iter()
            .filter_map(|id| {
                let m = self.arena.get(*id)?;
                let (x, y, w, h) = m.marker_box(ctx.marker_size)?;
                let mut member = Member::new(*id, x, y, w, h);
                member.eligible = !m.hide && m.zoom_min <= zoom;
                Some(member)
            })
            .collect();
        let color = ov.color;
        let clusters = ctx.declusterer.group_class(&mut members);

        for m in &members {
            let ov = &mut self.arena[m.id];
            ov.in_group = m.in_group;
            ov.boss = m.boss;
        }
        for cluster in clusters {
            let (cx, cy) = (cluster.center.0.round() as i32, cluster.center.1.round() as i32);
            self.groups.push(GroupOverlay {
                boss: cluster.boss,
                class,
                label: cluster.members.len().to_string(),
                members: cluster.members,
                center: cluster.center,
                region: ctx.projector.to_region(cx, cy),
                color,
                geometry: None,
            });
        }
    }

    fn is_shown(&self, id: OverlayId, zoom: i32) -> bool {
        let ov = &self.arena[id];
        if ov.kind() == OverlayKind::Class || ov.hide || ov.in_group || ov.zoom_min > zoom {
            return false;
        }
        match ov.class.and_then(|c| self.arena.get(c)) {
            Some(class) => !class.hide && class.zoom_min <= zoom,
            None => true,
        }
    }

    fn show(&mut self, id: OverlayId, zoom: i32, ctx: &PlaceContext) {
        let ov = &self.arena[id];
        if ov.paused || ov.class.and_then(|c| self.arena.get(c)).is_some_and(|c| c.paused) {
            return;
        }
        let geometry = if self.is_shown(id, zoom) { self.geometry_of(id, ctx) } else { None };
        let ov = &mut self.arena[id];
        ov.visible = geometry.is_some();
        ov.geometry = geometry;
    }

    fn geometry_of(&self, id: OverlayId, ctx: &PlaceContext) -> Option<OverlayGeometry> {
        let projector = &ctx.projector;
        let view = projector.view;
        let canvas = |p: &GeoPoint| projector.region_to_canvas(p.lon, p.lat);

        match &self.arena[id].payload {
            Payload::Class(_) => None,
            Payload::Default(d) => {
                let (x, y) = d.coord?;
                let (cx, cy) = view.coord_to_canvas(x, y);
                let (visual, (w, h)) = d.marker(ctx.marker_size, None);
                Some(OverlayGeometry::Marker { x: cx - w / 2, y: cy - h / 2, w, h, visual })
            }
            Payload::Bubble(b) => {
                let (ax, ay) = match b.follow {
                    Some(parent) => {
                        let parent = match parent {
                            OverlayTarget::Overlay(p) => {
                                self.arena.get(p).filter(|p| p.visible)?.geometry.as_ref()
                            }
                            OverlayTarget::Group { boss } => self.group(boss)?.geometry.as_ref(),
                        };
                        let (px, py, pw, _) = parent?.hit_box()?;
                        (px + pw / 2, py)
                    }
                    None => {
                        let (x, y) = b.coord?;
                        view.coord_to_canvas(x, y)
                    }
                };
                let (w, h) = b.size;
                let contents = b.contents.clone();
                Some(OverlayGeometry::Bubble { x: ax - w / 2, y: ay - h, w, h, contents })
            }
            Payload::Route { nodes, .. } => {
                let path: Vec<(i32, i32)> = nodes.iter().map(canvas).collect();
                let mut points: Vec<(i32, i32)> =
                    path.iter().map(|(x, y)| (x - 3, y - 3)).collect();
                points.extend(path.iter().rev().map(|(x, y)| (x + 3, y + 3)));
                Some(OverlayGeometry::Path { points })
            }
            Payload::Line { from, to } => {
                Some(OverlayGeometry::Line { from: canvas(from), to: canvas(to) })
            }
            Payload::Polyline { regions, width } => {
                let points: Vec<(i32, i32)> = regions.iter().map(canvas).collect();
                let segments = points.windows(2).map(|w| (w[0], w[1])).collect();
                Some(OverlayGeometry::Segments { segments, width: *width })
            }
            Payload::Polygon { regions } => {
                Some(OverlayGeometry::Polygon { points: regions.iter().map(canvas).collect() })
            }
            Payload::Circle(c) => {
                let r = (c.ratio * view.map_size() as f64) as i32;
                let (x, y) = canvas(&c.center);
                Some(OverlayGeometry::Circle { x: x - r, y: y - r, w: r * 2, h: r * 2 })
            }
            Payload::Scale(s) => match scale_bar(s, projector) {
                Ok(geometry) => Some(geometry),
                Err(e) => {
                    log::error!("Scale bar hidden: {}", e);
                    None
                }
            },
        }
    }
}

/// Ground distance covered by the scale bar at each zoom, in metres
const SCALE_TABLE: [i32; 23] = [
    10000000, 5000000, 2000000, 1000000, 500000, 200000, 100000, 50000, 20000, 10000, 5000, 2000,
    1000, 500, 500, 200, 100, 50, 20, 10, 5, 2, 1,
];

fn scale_bar(s: &ScaleData, projector: &Projector) -> Result<OverlayGeometry> {
    let view = projector.view;
    let zoom = view.zoom();
    let Some(&meters) = usize::try_from(zoom).ok().and_then(|z| SCALE_TABLE.get(z)) else {
        return Err(MapError::ScaleZoom(zoom));
    };
    let center = projector.center();
    let mpp = (projector.source.scale)(center.lon, center.lat, zoom);
    if mpp <= 0.0 {
        return Err(MapError::ScaleZoom(zoom));
    }

    let bar_width = (meters as f64 / mpp * (view.zoom_detail() - zoom as f64 + 1.0)) as i32;
    let label = if meters / 1000 < 1 {
        format!("{} m", meters)
    } else {
        format!("{} km", meters / 1000)
    };
    Ok(OverlayGeometry::Scale {
        x: s.x,
        y: s.y,
        w: s.size.0,
        h: s.size.1,
        bar_width,
        padding: s.padding,
        label,
    })
}

impl MapWidget {
    fn overlay_insert(&mut self, payload: Payload) -> OverlayId {
        self.changed = true;
        self.overlays.insert(payload)
    }

    fn overlay_mut(&mut self, id: OverlayId) -> Result<&mut Overlay> {
        self.changed = true;
        self.overlays.get_mut(id)
    }

    /// Add a default marker at `(lon, lat)`
    pub fn overlay_add(&mut self, lon: f64, lat: f64) -> OverlayId {
        self.overlay_insert(Payload::Default(DefaultData {
            pos: GeoPoint::wrapped(lon, lat),
            coord: None,
            icon: None,
            content: None,
            class_icon: None,
            class_content: None,
        }))
    }

    pub fn overlays(&self) -> &OverlayStore {
        &self.overlays
    }

    pub fn overlay(&self, id: OverlayId) -> Option<&Overlay> {
        self.overlays.get(id)
    }

    /// Every overlay followed by the groups of the last pass
    pub fn overlays_get(&self) -> Vec<OverlayTarget> {
        self.overlays
            .ids()
            .iter()
            .map(|id| OverlayTarget::Overlay(*id))
            .chain(self.overlays.groups().iter().map(|g| OverlayTarget::Group { boss: g.boss }))
            .collect()
    }

    pub fn overlay_del(&mut self, id: OverlayId) -> Result<()> {
        let mut overlay = self.overlays.remove(id).ok_or(MapError::StaleHandle)?;
        self.changed = true;
        self.events.push(MapEvent::OverlayDel(id));
        if let Some(on_del) = overlay.on_del.take() {
            on_del(id);
        }
        Ok(())
    }

    pub fn overlay_kind(&self, target: OverlayTarget) -> Option<OverlayKind> {
        match target {
            OverlayTarget::Overlay(id) => self.overlays.get(id).map(Overlay::kind),
            OverlayTarget::Group { boss } => self.overlays.group(boss).map(|_| OverlayKind::Group),
        }
    }

    pub fn overlay_data_set(&mut self, id: OverlayId, data: Box<dyn Any>) -> Result<()> {
        self.overlays.get_mut(id)?.data = Some(data);
        Ok(())
    }

    pub fn overlay_data_get(&self, id: OverlayId) -> Option<&dyn Any> {
        self.overlays.get(id)?.data.as_deref()
    }

    pub fn overlay_hide_set(&mut self, id: OverlayId, hide: bool) -> Result<()> {
        self.overlay_mut(id)?.hide = hide;
        Ok(())
    }

    pub fn overlay_hide_get(&self, id: OverlayId) -> Option<bool> {
        self.overlays.get(id).map(Overlay::is_hidden)
    }

    pub fn overlay_displayed_zoom_min_set(&mut self, id: OverlayId, zoom: i32) -> Result<()> {
        self.overlay_mut(id)?.zoom_min = zoom;
        Ok(())
    }

    pub fn overlay_displayed_zoom_min_get(&self, id: OverlayId) -> Option<i32> {
        self.overlays.get(id).map(Overlay::displayed_zoom_min)
    }

    /// A paused overlay keeps its last placement until resumed
    pub fn overlay_paused_set(&mut self, id: OverlayId, paused: bool) -> Result<()> {
        self.overlay_mut(id)?.paused = paused;
        Ok(())
    }

    pub fn overlay_paused_get(&self, id: OverlayId) -> Option<bool> {
        self.overlays.get(id).map(Overlay::is_paused)
    }

    pub fn overlay_visible_get(&self, target: OverlayTarget) -> bool {
        match target {
            OverlayTarget::Overlay(id) => self.overlays.get(id).is_some_and(Overlay::is_visible),
            OverlayTarget::Group { boss } => {
                self.overlays.group(boss).is_some_and(|g| g.geometry.is_some())
            }
        }
    }

    pub fn overlay_geometry(&self, target: OverlayTarget) -> Option<&OverlayGeometry> {
        match target {
            OverlayTarget::Overlay(id) => self.overlays.get(id)?.geometry(),
            OverlayTarget::Group { boss } => self.overlays.group(boss)?.geometry.as_ref(),
        }
    }

    /// Centre the view on one overlay
    pub fn overlay_show(&mut self, id: OverlayId) -> Result<()> {
        let ov = self.overlays.get(id).ok_or(MapError::StaleHandle)?;
        match &ov.payload {
            Payload::Default(d) => {
                let pos = d.pos;
                self.region_show(pos.lon, pos.lat);
            }
            Payload::Bubble(BubbleData { pos: Some(pos), .. }) => {
                let pos = *pos;
                self.region_show(pos.lon, pos.lat);
            }
            Payload::Class(_) => {
                let (x0, x1, y0, y1) = self
                    .overlays
                    .region_bounds(id)
                    .ok_or_else(|| MapError::InvalidArgument("class has no members".to_string()))?;
                self.region_show((x0 + x1) / 2.0, (y0 + y1) / 2.0);
            }
            Payload::Polyline { .. }
            | Payload::Polygon { .. }
            | Payload::Route { .. }
            | Payload::Line { .. } => {
                self.overlays_show(&[id]);
            }
            other => return Err(MapError::WrongKind { op: "overlay_show", actual: other.kind() }),
        }
        Ok(())
    }

    /// Zoom to fit every listed overlay and centre on them, at the next recalculation
    pub fn overlays_show(&mut self, ids: &[OverlayId]) {
        self.pending.overlays = Some(ids.to_vec());
        self.changed = true;
    }

    pub fn overlay_region_set(&mut self, id: OverlayId, lon: f64, lat: f64) -> Result<()> {
        let ov = self.overlay_mut(id)?;
        match &mut ov.payload {
            Payload::Default(d) => d.pos = GeoPoint::wrapped(lon, lat),
            Payload::Bubble(b) => {
                b.pos = Some(GeoPoint::wrapped(lon, lat));
                b.follow = None;
            }
            other => {
                return Err(MapError::WrongKind { op: "overlay_region_set", actual: other.kind() });
            }
        }
        Ok(())
    }

    pub fn overlay_region_get(&self, target: OverlayTarget) -> Option<GeoPoint> {
        match target {
            OverlayTarget::Group { boss } => self.overlays.group(boss).map(|g| g.region),
            OverlayTarget::Overlay(id) => match &self.overlays.get(id)?.payload {
                Payload::Default(d) => Some(d.pos),
                Payload::Bubble(b) => b.pos,
                other => {
                    log::warn!("overlay_region_get is not supported for {:?}", other.kind());
                    None
                }
            },
        }
    }

    pub fn overlay_icon_set(&mut self, id: OverlayId, icon: Visual) -> Result<()> {
        match &mut self.overlay_mut(id)?.payload {
            Payload::Default(d) => d.icon = Some(icon),
            Payload::Class(c) => {
                c.icon = Some(icon);
                self.overlays.propagate_class_visuals(id);
            }
            other => {
                return Err(MapError::WrongKind { op: "overlay_icon_set", actual: other.kind() });
            }
        }
        Ok(())
    }

    pub fn overlay_icon_get(&self, id: OverlayId) -> Option<&Visual> {
        match &self.overlays.get(id)?.payload {
            Payload::Default(d) => d.icon.as_ref(),
            Payload::Class(c) => c.icon.as_ref(),
            _ => None,
        }
    }

    pub fn overlay_content_set(&mut self, id: OverlayId, content: Visual) -> Result<()> {
        match &mut self.overlay_mut(id)?.payload {
            Payload::Default(d) => d.content = Some(content),
            Payload::Class(c) => {
                c.content = Some(content);
                self.overlays.propagate_class_visuals(id);
            }
            other => {
                return Err(MapError::WrongKind { op: "overlay_content_set", actual: other.kind() });
            }
        }
        Ok(())
    }

    pub fn overlay_content_get(&self, id: OverlayId) -> Option<&Visual> {
        match &self.overlays.get(id)?.payload {
            Payload::Default(d) => d.content.as_ref(),
            Payload::Class(c) => c.content.as_ref(),
            _ => None,
        }
    }

    pub fn overlay_color_set(&mut self, id: OverlayId, color: Color) -> Result<()> {
        self.overlay_mut(id)?.color = color;
        Ok(())
    }

    pub fn overlay_color_get(&self, target: OverlayTarget) -> Option<Color> {
        match target {
            OverlayTarget::Overlay(id) => self.overlays.get(id).map(Overlay::color),
            OverlayTarget::Group { boss } => self.overlays.group(boss).map(|g| g.color),
        }
    }

    /// Callback for clicks on the overlay; for a class it fires on clicks on its groups
    pub fn overlay_get_cb_set(&mut self, id: OverlayId, callback: OverlayCallback) -> Result<()> {
        self.overlays.get_mut(id)?.on_click = Some(callback);
        Ok(())
    }

    pub fn overlay_del_cb_set(
        &mut self,
        id: OverlayId,
        callback: OverlayDelCallback,
    ) -> Result<()> {
        self.overlays.get_mut(id)?.on_del = Some(callback);
        Ok(())
    }

    /// Hit-test a canvas point and report the click to the overlay under it
    pub fn click_at(&mut self, x: i32, y: i32) -> Option<OverlayTarget> {
        let target = self.overlays.hit_test(x, y)?;
        let owner = match target {
            OverlayTarget::Overlay(id) => id,
            OverlayTarget::Group { boss } => self.overlays.group(boss)?.class,
        };
        self.events.push(MapEvent::OverlayClicked(target));

        let callback = self.overlays.arena.get_mut(owner).and_then(|o| o.on_click.take());
        if let Some(mut callback) = callback {
            callback(target);
            if let Some(ov) = self.overlays.arena.get_mut(owner) {
                ov.on_click.get_or_insert(callback);
            }
        }
        Some(target)
    }

    pub fn overlay_class_add(&mut self) -> OverlayId {
        self.overlay_insert(Payload::Class(ClassData {
            members: Vec::new(),
            icon: None,
            content: None,
            zoom_max: 255,
        }))
    }

    pub fn overlay_class_append(&mut self, class: OverlayId, member: OverlayId) -> Result<()> {
        self.changed = true;
        self.overlays.attach(class, member)
    }

    pub fn overlay_class_remove(&mut self, class: OverlayId, member: OverlayId) -> Result<()> {
        match self.overlays.get(class).map(Overlay::kind) {
            Some(OverlayKind::Class) => {}
            Some(actual) => return Err(MapError::WrongKind { op: "overlay_class_remove", actual }),
            None => return Err(MapError::StaleHandle),
        }
        self.changed = true;
        if !self.overlays.detach(class, member) {
            return Err(MapError::InvalidArgument("overlay is not a class member".to_string()));
        }
        Ok(())
    }

    /// Above this zoom the class stops grouping its members
    pub fn overlay_class_zoom_max_set(&mut self, class: OverlayId, zoom: i32) -> Result<()> {
        match &mut self.overlay_mut(class)?.payload {
            Payload::Class(c) => c.zoom_max = zoom,
            other => {
                return Err(MapError::WrongKind {
                    op: "overlay_class_zoom_max_set",
                    actual: other.kind(),
                });
            }
        }
        Ok(())
    }

    pub fn overlay_class_zoom_max_get(&self, class: OverlayId) -> Option<i32> {
        match &self.overlays.get(class)?.payload {
            Payload::Class(c) => Some(c.zoom_max),
            _ => None,
        }
    }

    pub fn overlay_class_members_get(&self, class: OverlayId) -> Option<&[OverlayId]> {
        match &self.overlays.get(class)?.payload {
            Payload::Class(c) => Some(&c.members),
            _ => None,
        }
    }

    pub fn overlay_group_members_get(&self, boss: OverlayId) -> Option<&[OverlayId]> {
        self.overlays.group(boss).map(|g| g.members.as_slice())
    }

    pub fn overlay_bubble_add(&mut self) -> OverlayId {
        let size = self.config.bubble_size;
        self.overlay_insert(Payload::Bubble(BubbleData {
            pos: None,
            coord: None,
            follow: None,
            size,
            contents: Vec::new(),
        }))
    }

    /// Pin a bubble above a default marker or a group
    pub fn overlay_bubble_follow(
        &mut self,
        bubble: OverlayId,
        parent: OverlayTarget,
    ) -> Result<()> {
        if let OverlayTarget::Overlay(p) = parent {
            match self.overlays.get(p).map(Overlay::kind) {
                Some(OverlayKind::Default) => {}
                Some(actual) => return Err(MapError::WrongKind { op: "bubble parent", actual }),
                None => return Err(MapError::StaleHandle),
            }
        }
        match &mut self.overlay_mut(bubble)?.payload {
            Payload::Bubble(b) => b.follow = Some(parent),
            other => {
                return Err(MapError::WrongKind {
                    op: "overlay_bubble_follow",
                    actual: other.kind(),
                });
            }
        }
        Ok(())
    }

    pub fn overlay_bubble_content_append(
        &mut self,
        bubble: OverlayId,
        content: Visual,
    ) -> Result<()> {
        match &mut self.overlay_mut(bubble)?.payload {
            Payload::Bubble(b) => b.contents.push(content),
            other => {
                return Err(MapError::WrongKind {
                    op: "overlay_bubble_content_append",
                    actual: other.kind(),
                });
            }
        }
        Ok(())
    }

    pub fn overlay_bubble_content_clear(&mut self, bubble: OverlayId) -> Result<()> {
        match &mut self.overlay_mut(bubble)?.payload {
            Payload::Bubble(b) => b.contents.clear(),
            other => {
                return Err(MapError::WrongKind {
                    op: "overlay_bubble_content_clear",
                    actual: other.kind(),
                });
            }
        }
        Ok(())
    }

    /// Draw a loaded route; its nodes are copied
    pub fn overlay_route_add(&mut self, route: RouteId) -> Result<OverlayId> {
        let nodes = self
            .routes
            .get(route)
            .ok_or(MapError::StaleHandle)?
            .nodes()
            .iter()
            .map(|n| n.pos)
            .collect();
        Ok(self.overlay_insert(Payload::Route { route, nodes }))
    }

    pub fn overlay_route_get(&self, id: OverlayId) -> Option<RouteId> {
        match &self.overlays.get(id)?.payload {
            Payload::Route { route, .. } => Some(*route),
            _ => None,
        }
    }

    pub fn overlay_line_add(&mut self, flon: f64, flat: f64, tlon: f64, tlat: f64) -> OverlayId {
        let (from, to) = (GeoPoint::wrapped(flon, flat), GeoPoint::wrapped(tlon, tlat));
        self.overlay_insert(Payload::Line { from, to })
    }

    pub fn overlay_polyline_add(&mut self) -> OverlayId {
        self.overlay_insert(Payload::Polyline { regions: Vec::new(), width: 1 })
    }

    pub fn overlay_polyline_region_add(&mut self, id: OverlayId, lon: f64, lat: f64) -> Result<()> {
        match &mut self.overlay_mut(id)?.payload {
            Payload::Polyline { regions, .. } => regions.push(GeoPoint::wrapped(lon, lat)),
            other => {
                return Err(MapError::WrongKind {
                    op: "overlay_polyline_region_add",
                    actual: other.kind(),
                });
            }
        }
        Ok(())
    }

    pub fn overlay_polyline_width_set(&mut self, id: OverlayId, width: i32) -> Result<()> {
        if width < 0 {
            return Err(MapError::InvalidArgument(format!("polyline width {}", width)));
        }
        match &mut self.overlay_mut(id)?.payload {
            Payload::Polyline { width: w, .. } => *w = width,
            other => {
                return Err(MapError::WrongKind {
                    op: "overlay_polyline_width_set",
                    actual: other.kind(),
                });
            }
        }
        Ok(())
    }

    pub fn overlay_polyline_width_get(&self, id: OverlayId) -> Option<i32> {
        match &self.overlays.get(id)?.payload {
            Payload::Polyline { width, .. } => Some(*width),
            _ => None,
        }
    }

    pub fn overlay_polygon_add(&mut self) -> OverlayId {
        self.overlay_insert(Payload::Polygon { regions: Vec::new() })
    }

    pub fn overlay_polygon_region_add(&mut self, id: OverlayId, lon: f64, lat: f64) -> Result<()> {
        match &mut self.overlay_mut(id)?.payload {
            Payload::Polygon { regions } => regions.push(GeoPoint::wrapped(lon, lat)),
            other => {
                return Err(MapError::WrongKind {
                    op: "overlay_polygon_region_add",
                    actual: other.kind(),
                });
            }
        }
        Ok(())
    }

    /// Circle whose `radius` in pixels is taken at the current map width and scales with zoom
    pub fn overlay_circle_add(&mut self, lon: f64, lat: f64, radius: f64) -> OverlayId {
        let ratio = radius / self.view.map_size().max(1) as f64;
        let center = GeoPoint::wrapped(lon, lat);
        self.overlay_insert(Payload::Circle(CircleData { center, radius, ratio }))
    }

    pub fn overlay_circle_radius_get(&self, id: OverlayId) -> Option<f64> {
        match &self.overlays.get(id)?.payload {
            Payload::Circle(c) => Some(c.radius),
            _ => None,
        }
    }

    /// Scale bar fixed at canvas position `(x, y)`
    pub fn overlay_scale_add(&mut self, x: i32, y: i32) -> OverlayId {
        let (size, padding) = (self.config.scale_size, self.config.scale_padding);
        self.overlay_insert(Payload::Scale(ScaleData { x, y, size, padding }))
    }
}
