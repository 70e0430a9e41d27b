//! Viewport state: zoom, pan, rotation and the transforms between map and canvas space

use std::time::Duration;

use web_time::Instant;

use crate::event::MapEvent;

use super::source::TileSource;
use super::tile::{coord_to_geo, geo_to_coord, rotate_coord, round_zoom, zoom_for_size, GeoPoint};

/// Tile size in pixels (standard OSM tile size)
pub const TILE_SIZE: i32 = 256;

/// One-shot debounce timer driven by the widget clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SettleTimer {
    deadline: Option<Instant>,
}

impl SettleTimer {
    pub fn restart(&mut self, now: Instant, delay: Duration) {
        self.deadline = Some(now + delay);
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// True exactly once, when the deadline has passed
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Visible rectangle in map-pixel space
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl ViewRect {
    pub fn intersects(&self, x: i32, y: i32, w: i32, h: i32) -> bool {
        rects_intersect(x, y, w, h, self.x, self.y, self.w, self.h)
    }
}

/// Open-interval rectangle overlap test
#[allow(clippy::too_many_arguments)]
pub fn rects_intersect(x: i32, y: i32, w: i32, h: i32, xx: i32, yy: i32, ww: i32, hh: i32) -> bool {
    let (x, y, w, h) = (x as i64, y as i64, w as i64, h as i64);
    let (xx, yy, ww, hh) = (xx as i64, yy as i64, ww as i64, hh as i64);
    x < xx + ww && xx < x + w && y < yy + hh && yy < y + h
}

/// Canvas positions are kept within this distance of the origin
const CANVAS_LIMIT: i64 = 1 << 30;

fn canvas_i32(v: i64) -> i32 {
    v.clamp(-CANVAS_LIMIT, CANVAS_LIMIT) as i32
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ZoomMode {
    #[default]
    Manual,
    /// Largest zoom whose map fits inside the viewport
    AutoFit,
    /// Smallest zoom whose map covers the viewport
    AutoFill,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rotation {
    pub degrees: f64,
    pub cx: i32,
    pub cy: i32,
}

#[derive(Debug, Clone, Copy)]
struct ZoomAnimation {
    steps_left: u32,
    zoom: f64,
    diff: f64,
}

#[derive(Debug, Clone, Copy)]
struct ScrollAnimation {
    from: (i32, i32),
    to: (i32, i32),
    step: u32,
    steps: u32,
}

/// Zoom, pan offset and rotation of one map widget
#[derive(Debug)]
pub struct ViewportController {
    zoom: i32,
    zoom_detail: f64,
    pub(crate) zoom_min: i32,
    pub(crate) zoom_max: i32,
    mode: ZoomMode,
    tsize: i32,
    size: (i32, i32),
    tile: i32,
    pan: (i32, i32),
    viewport: (i32, i32),
    origin: (i32, i32),
    rotation: Rotation,
    animation: Option<ZoomAnimation>,
    scroll_animation: Option<ScrollAnimation>,
    pub(crate) zoom_timer: SettleTimer,
    pub(crate) scroll_timer: SettleTimer,
    settle_delay: Duration,
}

impl ViewportController {
    pub fn new(tsize: i32, settle_delay: Duration) -> Self {
        Self {
            zoom: 0,
            zoom_detail: 0.0,
            zoom_min: 0,
            zoom_max: 18,
            mode: ZoomMode::Manual,
            tsize,
            size: (tsize, tsize),
            tile: tsize,
            pan: (0, 0),
            viewport: (0, 0),
            origin: (0, 0),
            rotation: Rotation { degrees: 0.0, cx: 0, cy: 0 },
            animation: None,
            scroll_animation: None,
            zoom_timer: SettleTimer::default(),
            scroll_timer: SettleTimer::default(),
            settle_delay,
        }
    }

    pub fn zoom(&self) -> i32 {
        self.zoom
    }

    pub fn zoom_detail(&self) -> f64 {
        self.zoom_detail
    }

    pub fn mode(&self) -> ZoomMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ZoomMode) {
        self.mode = mode;
    }

    /// Map width in pixels at the current zoom detail
    pub fn map_size(&self) -> i32 {
        self.size.0
    }

    /// Edge of one tile in pixels, scaled while between integer zooms
    pub fn tile_size(&self) -> i32 {
        self.tile
    }

    pub fn base_tile_size(&self) -> i32 {
        self.tsize
    }

    pub fn viewport(&self) -> (i32, i32) {
        self.viewport
    }

    pub fn set_viewport(&mut self, w: i32, h: i32) {
        self.viewport = (w.max(0), h.max(0));
        let (x, y) = self.pan;
        self.content_region_show(x, y);
    }

    pub fn origin(&self) -> (i32, i32) {
        self.origin
    }

    pub fn set_origin(&mut self, x: i32, y: i32) {
        self.origin = (x, y);
    }

    pub fn pan(&self) -> (i32, i32) {
        self.pan
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn set_rotation(&mut self, degrees: f64, cx: i32, cy: i32) {
        self.rotation = Rotation { degrees, cx, cy };
    }

    /// Largest pan offset per axis
    pub fn pan_max(&self) -> (i32, i32) {
        (
            (self.size.0 - self.viewport.0).max(0),
            (self.size.1 - self.viewport.1).max(0),
        )
    }

    /// Visible rect in map pixels; a viewport wider than the map centres it
    pub fn viewport_coord(&self) -> ViewRect {
        let (mut x, mut y) = self.pan;
        let (w, h) = self.viewport;
        if w > self.size.0 {
            x -= (w - self.size.0) / 2;
        }
        if h > self.size.1 {
            y -= (h - self.size.1) / 2;
        }
        ViewRect { x, y, w, h }
    }

    /// Scroll so that `(x, y)` becomes the top-left of the viewport, clamped to the map
    pub fn content_region_show(&mut self, x: i32, y: i32) -> bool {
        let (max_x, max_y) = self.pan_max();
        let pan = (x.clamp(0, max_x), y.clamp(0, max_y));
        let changed = pan != self.pan;
        self.pan = pan;
        changed
    }

    /// Begin an animated scroll towards `(x, y)`
    pub fn bring_in(&mut self, x: i32, y: i32, steps: u32) {
        let (max_x, max_y) = self.pan_max();
        self.scroll_animation = Some(ScrollAnimation {
            from: self.pan,
            to: (x.clamp(0, max_x), y.clamp(0, max_y)),
            step: 0,
            steps: steps.max(1),
        });
    }

    pub fn stop_scroll_animation(&mut self) -> bool {
        self.scroll_animation.take().is_some()
    }

    /// Advance the bring-in animation; returns `Some(finished)` while one runs
    pub fn step_scroll_animation(&mut self) -> Option<bool> {
        let mut anim = self.scroll_animation?;
        anim.step += 1;
        let t = anim.step as f64 / anim.steps as f64;
        let x = anim.from.0 + ((anim.to.0 - anim.from.0) as f64 * t) as i32;
        let y = anim.from.1 + ((anim.to.1 - anim.from.1) as f64 * t) as i32;
        self.content_region_show(x, y);
        if anim.step >= anim.steps {
            self.scroll_animation = None;
            Some(true)
        } else {
            self.scroll_animation = Some(anim);
            Some(false)
        }
    }

    pub fn is_animating(&self) -> bool {
        self.animation.is_some()
    }

    /// Drop a running zoom animation, settling on the current integer zoom
    pub fn stop_zoom_animation(
        &mut self,
        range: (i32, i32),
        now: Instant,
        events: &mut Vec<MapEvent>,
    ) -> bool {
        if self.animation.take().is_none() {
            return false;
        }
        self.zoom_detail = self.zoom as f64;
        self.pan_zoom_do(self.zoom_detail, range, now, events);
        true
    }

    /// Zoom engine: animate or jump to `zoom`, or fit the viewport in the auto modes
    pub fn apply_zoom(
        &mut self,
        zoom: f64,
        animate: bool,
        steps: u32,
        range: (i32, i32),
        now: Instant,
        events: &mut Vec<MapEvent>,
    ) {
        match self.mode {
            ZoomMode::Manual if animate => {
                let steps = steps.max(1);
                self.animation = Some(ZoomAnimation {
                    steps_left: steps,
                    zoom: self.zoom as f64,
                    diff: (zoom - self.zoom as f64) / steps as f64,
                });
            }
            ZoomMode::Manual => {
                self.zoom_detail = zoom;
                self.zoom = round_zoom(zoom);
                self.pan_zoom_do(zoom, range, now, events);
            }
            ZoomMode::AutoFit | ZoomMode::AutoFill => {
                let (vw, vh) = self.viewport;
                if vw <= 0 || vh <= 0 {
                    return;
                }
                let fit = self.fit_zoom(zoom, vw, vh).clamp(range.0 as f64, range.1 as f64);
                self.zoom_detail = fit;
                self.zoom = round_zoom(fit);
                self.pan_zoom_do(fit, range, now, events);
            }
        }
    }

    fn fit_zoom(&self, mut zoom: f64, vw: i32, vh: i32) -> f64 {
        let edge = |z: f64| (2f64.powf(z) * self.tsize as f64) as i32;
        let (mut w, mut h) = self.size;
        if self.mode == ZoomMode::AutoFit {
            if w < vw && h < vh {
                while w < vw && h < vh {
                    zoom += 0.001;
                    w = edge(zoom);
                    h = w;
                }
            } else {
                while w > vw || h > vh {
                    zoom -= 0.001;
                    w = edge(zoom);
                    h = w;
                }
            }
        } else if w < vw || h < vh {
            while w < vw || h < vh {
                zoom += 0.01;
                w = edge(zoom);
                h = w;
            }
        } else {
            while w > vw && h > vh {
                zoom -= 0.01;
                w = edge(zoom);
                h = w;
            }
        }
        zoom
    }

    /// Advance the zoom animation; returns `Some(finished)` while one runs
    pub fn step_zoom_animation(
        &mut self,
        range: (i32, i32),
        now: Instant,
        events: &mut Vec<MapEvent>,
    ) -> Option<bool> {
        let mut anim = self.animation?;
        anim.zoom += anim.diff;
        anim.steps_left = anim.steps_left.saturating_sub(1);
        self.zoom_detail = anim.zoom;
        self.zoom = round_zoom(anim.zoom);
        self.pan_zoom_do(anim.zoom, range, now, events);
        if anim.steps_left == 0 {
            self.animation = None;
            Some(true)
        } else {
            self.animation = Some(anim);
            Some(false)
        }
    }

    /// Rescale tiles for `zoom`, keeping the point under the viewport centre in place.
    ///
    /// Every call restarts the zoom settle timer, emitting `zoom,start` when it was idle.
    pub fn pan_zoom_do(
        &mut self,
        zoom: f64,
        range: (i32, i32),
        now: Instant,
        events: &mut Vec<MapEvent>,
    ) {
        let zoom = zoom.clamp(range.0 as f64, range.1 as f64);
        let (ow, oh) = self.size;

        self.tile = (2f64.powf(zoom - self.zoom as f64) * self.tsize as f64) as i32;
        let edge = (2f64.powi(self.zoom) * self.tile as f64) as i32;
        self.size = (edge, edge);

        let vr = self.viewport_coord();
        let (vw, vh) = (vr.w, vr.h);
        if vw > 0 && vh > 0 && ow > 0 && oh > 0 {
            let sx = if vw > ow { 0.5 } else { (vr.x as f64 + (vw / 2) as f64) / ow as f64 };
            let sy = if vh > oh { 0.5 } else { (vr.y as f64 + (vh / 2) as f64) / oh as f64 };
            let sx = sx.min(1.0);
            let sy = sy.min(1.0);
            let x = (sx * self.size.0 as f64 - (vw / 2) as f64).ceil() as i32;
            let y = (sy * self.size.1 as f64 - (vh / 2) as f64).ceil() as i32;
            self.content_region_show(x, y);
        }

        if !self.zoom_timer.is_active() {
            events.push(MapEvent::ZoomStart);
        }
        self.zoom_timer.restart(now, self.settle_delay);
        events.push(MapEvent::ZoomChange);
    }

    /// Start or extend a user scroll, emitting drag start when idle
    pub fn scroll_to(&mut self, x: i32, y: i32, now: Instant, events: &mut Vec<MapEvent>) -> bool {
        if self.stop_scroll_animation() {
            events.push(MapEvent::ScrollAnimStop);
        }
        let moved = self.content_region_show(x, y);
        if !self.scroll_timer.is_active() {
            events.push(MapEvent::ScrollDragStart);
        }
        self.scroll_timer.restart(now, self.settle_delay);
        events.push(MapEvent::Scroll);
        moved
    }

    /// Tiles render smooth-scaled only when no zoom or scroll is settling
    pub fn smooth(&self) -> bool {
        !self.zoom_timer.is_active() && !self.scroll_timer.is_active()
    }

    /// Map pixel to canvas position, without rotation
    pub fn coord_to_canvas_unrotated(&self, x: i32, y: i32) -> (i32, i32) {
        let vr = self.viewport_coord();
        (
            canvas_i32(x as i64 - vr.x as i64 + self.origin.0 as i64),
            canvas_i32(y as i64 - vr.y as i64 + self.origin.1 as i64),
        )
    }

    pub fn coord_to_canvas(&self, x: i32, y: i32) -> (i32, i32) {
        let (x, y) = self.coord_to_canvas_unrotated(x, y);
        let r = self.rotation;
        rotate_coord(x, y, r.cx, r.cy, r.degrees)
    }

    pub fn canvas_to_coord(&self, x: i32, y: i32) -> (i32, i32) {
        let vr = self.viewport_coord();
        let (sx, sy) = self.origin;
        let r = self.rotation;
        let shift = |v: i32| canvas_i32(v as i64 - sx as i64 + vr.x as i64);
        let shift_y = |v: i32| canvas_i32(v as i64 - sy as i64 + vr.y as i64);
        rotate_coord(shift(x), shift_y(y), shift(r.cx), shift_y(r.cy), -r.degrees)
    }
}

/// Geo/canvas conversions for the current viewport and tile source
pub struct Projector<'a> {
    pub view: &'a ViewportController,
    pub source: &'a TileSource,
}

impl<'a> Projector<'a> {
    pub fn new(view: &'a ViewportController, source: &'a TileSource) -> Self {
        Self { view, source }
    }

    /// Geo to map pixels for a map `size` pixels wide
    pub fn region_to_coord(&self, lon: f64, lat: f64, size: i32) -> (i32, i32) {
        match &self.source.geo_to_coord {
            Some(forward) => {
                let zoom = zoom_for_size(size, self.view.base_tile_size());
                forward(lon, lat, zoom, size)
            }
            None => geo_to_coord(lon, lat, size),
        }
    }

    pub fn coord_to_region(&self, x: i32, y: i32, size: i32) -> GeoPoint {
        match &self.source.coord_to_geo {
            Some(inverse) => {
                let zoom = zoom_for_size(size, self.view.tile_size());
                inverse(x, y, zoom, size)
            }
            None => coord_to_geo(x, y, size),
        }
    }

    /// Geo to map pixels at the current zoom
    pub fn to_coord(&self, lon: f64, lat: f64) -> (i32, i32) {
        self.region_to_coord(lon, lat, self.view.map_size())
    }

    pub fn to_region(&self, x: i32, y: i32) -> GeoPoint {
        self.coord_to_region(x, y, self.view.map_size())
    }

    pub fn region_to_canvas(&self, lon: f64, lat: f64) -> (i32, i32) {
        let (x, y) = self.to_coord(lon, lat);
        self.view.coord_to_canvas(x, y)
    }

    pub fn canvas_to_region(&self, x: i32, y: i32) -> GeoPoint {
        let (x, y) = self.view.canvas_to_coord(x, y);
        self.to_region(x, y)
    }

    /// Geo point under the viewport centre
    pub fn center(&self) -> GeoPoint {
        let vr = self.view.viewport_coord();
        self.to_region(vr.x + vr.w / 2, vr.y + vr.h / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(zoom: f64) -> (ViewportController, Vec<MapEvent>) {
        let mut view = ViewportController::new(TILE_SIZE, Duration::from_millis(250));
        let mut events = Vec::new();
        view.set_viewport(400, 300);
        view.apply_zoom(zoom, false, 10, (0, 18), Instant::now(), &mut events);
        (view, events)
    }

    #[test]
    fn test_settle_timer_fires_once() {
        let now = Instant::now();
        let mut timer = SettleTimer::default();
        timer.restart(now, Duration::from_millis(250));
        assert!(!timer.fire(now + Duration::from_millis(100)));
        assert!(timer.fire(now + Duration::from_millis(300)));
        assert!(!timer.fire(now + Duration::from_millis(400)));
        assert!(!timer.is_active());
    }

    #[test]
    fn test_manual_zoom_sizes() {
        let (view, events) = controller(3.0);
        assert_eq!(view.zoom(), 3);
        assert_eq!(view.tile_size(), 256);
        assert_eq!(view.map_size(), 2048);
        assert_eq!(events, vec![MapEvent::ZoomStart, MapEvent::ZoomChange]);
    }

    #[test]
    fn test_fractional_zoom_scales_tiles() {
        let (view, _) = controller(2.3);
        assert_eq!(view.zoom(), 2);
        assert_eq!(view.tile_size(), (2f64.powf(0.3) * 256.0) as i32);
        assert_eq!(view.map_size(), 4 * view.tile_size());
    }

    #[test]
    fn test_pan_clamped() {
        let (mut view, _) = controller(3.0);
        view.content_region_show(5000, -20);
        assert_eq!(view.pan(), (2048 - 400, 0));
    }

    #[test]
    fn test_small_map_centered() {
        let (view, _) = controller(0.0);
        let vr = view.viewport_coord();
        assert_eq!(vr, ViewRect { x: -72, y: -22, w: 400, h: 300 });
    }

    #[test]
    fn test_zoom_keeps_center_fraction() {
        let (mut view, mut events) = controller(3.0);
        view.content_region_show(824, 874);
        view.apply_zoom(4.0, false, 10, (0, 18), Instant::now(), &mut events);
        // centre (1024, 1024) of 2048 maps to (2048, 2048) of 4096
        assert_eq!(view.pan(), (2048 - 200, 2048 - 150));
    }

    #[test]
    fn test_zoom_animation_steps() {
        let (mut view, mut events) = controller(2.0);
        let now = Instant::now();
        view.apply_zoom(4.0, true, 10, (0, 18), now, &mut events);
        assert!(view.is_animating());
        let mut steps = 0;
        let mut last = view.zoom_detail();
        while let Some(done) = view.step_zoom_animation((0, 18), now, &mut events) {
            steps += 1;
            assert!(view.zoom_detail() > last);
            last = view.zoom_detail();
            if done {
                break;
            }
        }
        assert_eq!(steps, 10);
        assert_eq!(view.zoom(), 4);
        assert!((view.zoom_detail() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_auto_fit_and_fill() {
        let (mut view, mut events) = controller(5.0);
        view.set_mode(ZoomMode::AutoFit);
        view.apply_zoom(5.0, false, 10, (0, 18), Instant::now(), &mut events);
        assert!(view.map_size() <= 300);
        assert_eq!(view.zoom(), 0);

        view.set_mode(ZoomMode::AutoFill);
        view.apply_zoom(view.zoom() as f64, false, 10, (0, 18), Instant::now(), &mut events);
        assert!(view.map_size() >= 400);
        assert!(view.zoom_detail() > 0.6 && view.zoom_detail() < 0.7);
    }

    #[test]
    fn test_canvas_round_trip_with_rotation() {
        let (mut view, _) = controller(4.0);
        view.content_region_show(1000, 700);
        view.set_origin(30, 40);
        for deg in [0.0, 30.0, 90.0, 200.0] {
            view.set_rotation(deg, 230, 190);
            let (cx, cy) = view.coord_to_canvas(1200, 800);
            let (x, y) = view.canvas_to_coord(cx, cy);
            assert!((x - 1200).abs() <= 2, "deg {} x {}", deg, x);
            assert!((y - 800).abs() <= 2, "deg {} y {}", deg, y);
        }
    }

    #[test]
    fn test_canvas_offset_without_rotation() {
        let (mut view, _) = controller(4.0);
        view.content_region_show(1000, 700);
        view.set_origin(30, 40);
        assert_eq!(view.coord_to_canvas(1200, 800), (230, 140));
        assert_eq!(view.canvas_to_coord(230, 140), (1200, 800));
    }

    #[test]
    fn test_bring_in_reaches_target() {
        let (mut view, _) = controller(4.0);
        view.bring_in(1000, 500, 4);
        let mut finished = false;
        while let Some(done) = view.step_scroll_animation() {
            finished = done;
            if done {
                break;
            }
        }
        assert!(finished);
        assert_eq!(view.pan(), (1000, 500));
    }

    #[test]
    fn test_projector_center() {
        let (mut view, _) = controller(2.0);
        let sources = super::super::source::TileSource::builtin();
        view.content_region_show(312, 362);
        let projector = Projector::new(&view, &sources[0]);
        let center = projector.center();
        assert!(center.lon.abs() < 0.5);
        assert!(center.lat.abs() < 0.5);
    }
}
