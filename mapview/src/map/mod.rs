//! Map widget with tile grids, downloads, overlays and viewport control

pub mod cache;
pub mod camera;
pub mod decluster;
pub mod grid;
pub mod loader;
pub mod name;
pub mod overlay;
pub mod route;
pub mod source;
pub mod tile;

use std::collections::HashMap;
use std::path::PathBuf;

use slotmap::SlotMap;
use web_time::Instant;

use crate::config::MapConfig;
use crate::error::Result;
use crate::event::MapEvent;

use cache::{CacheLayout, CacheStats};
use camera::{Projector, Rotation, ViewportController, ZoomMode};
use decluster::Declusterer;
use grid::{Grid, TileLayer, TileQuad};
use loader::{Fetcher, JobId};
use name::{Name, NameId, NameListCallback};
use overlay::{OverlayId, OverlayStore, PlaceContext};
use route::{Route, RouteId};
use source::{NameSource, RouteSource, SourceKind, Sources, TileSource};
use tile::GeoPoint;

/// Owner of a non-tile fetch
pub(crate) enum Request {
    Route(RouteId),
    Name(NameId),
    NameList { file: PathBuf, callback: Option<NameListCallback> },
}

/// Work deferred to the next recalculation
#[derive(Default)]
struct PendingCalc {
    /// Target zoom and whether to animate
    zoom: Option<(f64, bool)>,
    /// Point to centre and whether to scroll there smoothly
    show: Option<(GeoPoint, bool)>,
    overlays: Option<Vec<OverlayId>>,
}

/// Headless map widget
///
/// All state changes happen on the caller's thread. API calls record what changed and
/// [`MapWidget::tick`] drains fetch completions, advances animations and timers, recalculates
/// the layout and runs the download pass.
pub struct MapWidget {
    config: MapConfig,
    view: ViewportController,
    sources: Sources,
    tiles: TileLayer,
    overlays: OverlayStore,
    declusterer: Declusterer,
    routes: SlotMap<RouteId, Route>,
    names: SlotMap<NameId, Name>,
    requests: HashMap<JobId, Request>,
    fetcher: Box<dyn Fetcher>,
    events: Vec<MapEvent>,
    pending: PendingCalc,
    changed: bool,
    paused: bool,
    wheel_disabled: bool,
    pinch_zoom: f64,
    now: Instant,
}

impl MapWidget {
    /// Create a widget downloading over HTTP where available
    pub fn new(config: MapConfig) -> Self {
        let fetcher = loader::default_fetcher(&config.user_agent);
        Self::with_fetcher(config, fetcher)
    }

    pub fn with_fetcher(config: MapConfig, mut fetcher: Box<dyn Fetcher>) -> Self {
        if !fetcher.is_available() {
            log::error!("Download protocol unavailable, map tiles will not load");
        }
        fetcher.set_user_agent(&config.user_agent);

        let sources = Sources::default();
        let (zoom_min, zoom_max) = (sources.tile().zoom_min, sources.tile().zoom_max);
        let mut view = ViewportController::new(config.tile_size, config.settle_delay);
        view.zoom_min = zoom_min;
        view.zoom_max = zoom_max;

        let layout = CacheLayout::new(config.cache_dir());
        log::info!("Map widget {} caching under {}", layout.id(), layout.root().display());
        let mut tiles =
            TileLayer::new(layout, config.max_concurrent_downloads, config.settle_delay);
        let mut events = Vec::new();
        tiles.reset(zoom_min, zoom_max, fetcher.as_mut(), &mut events);

        Self {
            config,
            view,
            sources,
            tiles,
            overlays: OverlayStore::default(),
            declusterer: Declusterer::default(),
            routes: SlotMap::with_key(),
            names: SlotMap::with_key(),
            requests: HashMap::new(),
            fetcher,
            events,
            pending: PendingCalc::default(),
            changed: true,
            paused: false,
            wheel_disabled: false,
            pinch_zoom: 0.0,
            now: Instant::now(),
        }
    }

    /// Advance the widget to `now`
    pub fn tick(&mut self, now: Instant) {
        self.now = now;
        let range = self.source_range();

        // 1. Apply finished downloads
        while let Some(outcome) = self.fetcher.poll() {
            if self.tiles.complete(outcome, &self.view, now, &mut self.events) {
                continue;
            }
            match self.requests.remove(&outcome.job) {
                Some(Request::Route(id)) => self.route_complete(id, outcome.status),
                Some(Request::Name(id)) => self.name_complete(id, outcome.status),
                Some(Request::NameList { file, callback }) => {
                    self.name_list_complete(file, callback, outcome.status)
                }
                None => log::debug!("Ignoring completion of unknown job {:?}", outcome.job),
            }
        }

        // 2. Step animations
        if self.view.step_zoom_animation(range, now, &mut self.events).is_some() {
            self.changed = true;
        }
        if let Some(done) = self.view.step_scroll_animation() {
            self.events.push(MapEvent::Scroll);
            if done {
                self.events.push(MapEvent::ScrollAnimStop);
            }
            self.changed = true;
        }

        // 3. Settle timers
        if self.view.zoom_timer.fire(now) {
            self.tiles.smooth_update(&self.view);
            self.events.push(MapEvent::ZoomStop);
            self.changed = true;
        }
        if self.view.scroll_timer.fire(now) {
            self.tiles.smooth_update(&self.view);
            self.events.push(MapEvent::ScrollDragStop);
            self.changed = true;
        }
        if self.tiles.fire_loaded(now) {
            self.events.push(MapEvent::Loaded);
        }

        // 4. Recalculate layout
        if self.changed {
            self.changed = false;
            self.calculate(now);
        }

        // 5. Start queued downloads
        self.tiles.download_pass(&self.view, self.fetcher.as_mut(), &mut self.events);
    }

    fn calculate(&mut self, now: Instant) {
        let (w, h) = self.view.viewport();
        if w <= 0 || h <= 0 {
            return;
        }
        let source = self.sources.tile();
        self.tiles.place(&self.view, source, self.fetcher.as_mut(), now, &mut self.events);
        self.place_overlays();

        if let Some((zoom, animate)) = self.pending.zoom.take() {
            self.zoom_to(zoom, animate);
        }
        if self.view.is_animating() {
            return;
        }
        if let Some((pos, animate)) = self.pending.show.take() {
            self.show_region(pos, animate);
        }
        if let Some(ids) = self.pending.overlays.take() {
            self.fit_overlays(&ids);
        }
    }

    fn place_overlays(&mut self) {
        let ctx = PlaceContext {
            projector: Projector::new(&self.view, self.sources.tile()),
            marker_size: self.config.marker_size,
            declusterer: &self.declusterer,
        };
        self.overlays.place(&ctx);
    }

    fn source_range(&self) -> (i32, i32) {
        let source = self.sources.tile();
        (source.zoom_min, source.zoom_max)
    }

    fn zoom_to(&mut self, zoom: f64, animate: bool) {
        let zoom = zoom.clamp(self.view.zoom_min as f64, self.view.zoom_max as f64);
        let range = self.source_range();
        self.view.apply_zoom(
            zoom,
            animate && !self.paused,
            self.config.zoom_animation_steps,
            range,
            self.now,
            &mut self.events,
        );
        self.changed = true;
    }

    fn show_region(&mut self, pos: GeoPoint, animate: bool) {
        let (x, y) = Projector::new(&self.view, self.sources.tile()).to_coord(pos.lon, pos.lat);
        let (w, h) = self.view.viewport();
        let (x, y) = (x - w / 2, y - h / 2);
        if animate {
            self.view.bring_in(x, y, self.config.bring_in_steps);
            self.events.push(MapEvent::ScrollAnimStart);
        } else {
            self.view.content_region_show(x, y);
        }
        self.changed = true;
    }

    /// Largest zoom at which the bounds of every listed overlay fit, then centre on them
    fn fit_overlays(&mut self, ids: &[OverlayId]) {
        let bounds = ids
            .iter()
            .filter_map(|id| {
                let bounds = self.overlays.region_bounds(*id);
                if bounds.is_none() {
                    log::warn!("Overlay {:?} has no region to show", id);
                }
                bounds
            })
            .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1), a.2.min(b.2), a.3.max(b.3)));
        let Some((min_lon, max_lon, min_lat, max_lat)) = bounds else {
            return;
        };

        let (w, h) = self.view.viewport();
        let source = self.sources.tile();
        let projector = Projector::new(&self.view, source);
        let tsize = self.view.base_tile_size() as f64;
        let zoom_max = source.zoom_max.min(self.view.zoom_max);
        let mut zoom = source.zoom_min;
        while zoom <= zoom_max {
            let size = (2f64.powi(zoom) * tsize) as i32;
            let (x0, y0) = projector.region_to_coord(min_lon, max_lat, size);
            let (x1, y1) = projector.region_to_coord(max_lon, min_lat, size);
            if x1 - x0 > w || y1 - y0 > h {
                break;
            }
            zoom += 1;
        }

        self.zoom_to((zoom - 1) as f64, false);
        let center = GeoPoint::new((min_lon + max_lon) / 2.0, (min_lat + max_lat) / 2.0);
        self.show_region(center, false);
    }

    /// Drain the events accumulated since the last call
    pub fn take_events(&mut self) -> Vec<MapEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn view(&self) -> &ViewportController {
        &self.view
    }

    // Zoom

    /// Request integer zoom `zoom`; only honoured in manual mode
    pub fn zoom_set(&mut self, zoom: i32) {
        if self.view.mode() != ZoomMode::Manual {
            return;
        }
        let zoom = zoom.max(0);
        if zoom == self.view.zoom() {
            return;
        }
        self.pending.zoom = Some((zoom as f64, true));
        self.changed = true;
    }

    pub fn zoom_get(&self) -> i32 {
        self.view.zoom()
    }

    pub fn zoom_detail_get(&self) -> f64 {
        self.view.zoom_detail()
    }

    pub fn zoom_min_set(&mut self, zoom: i32) {
        let (min, max) = self.source_range();
        if zoom < min || zoom > max {
            log::warn!("Zoom minimum {} outside source range {}..={}", zoom, min, max);
            return;
        }
        self.view.zoom_min = zoom;
    }

    pub fn zoom_min_get(&self) -> i32 {
        self.view.zoom_min
    }

    pub fn zoom_max_set(&mut self, zoom: i32) {
        let (min, max) = self.source_range();
        if zoom < min || zoom > max {
            log::warn!("Zoom maximum {} outside source range {}..={}", zoom, min, max);
            return;
        }
        self.view.zoom_max = zoom;
    }

    pub fn zoom_max_get(&self) -> i32 {
        self.view.zoom_max
    }

    pub fn zoom_mode_set(&mut self, mode: ZoomMode) {
        if mode == self.view.mode() {
            return;
        }
        self.view.set_mode(mode);
        self.pending.zoom = Some((self.view.zoom() as f64, false));
        self.changed = true;
    }

    pub fn zoom_mode_get(&self) -> ZoomMode {
        self.view.mode()
    }

    /// Mouse wheel: each notch of `delta` zooms out by a tenth of a level
    pub fn wheel(&mut self, delta: i32) {
        if self.paused || self.wheel_disabled {
            return;
        }
        self.zoom_to(self.view.zoom_detail() - delta as f64 / 10.0, false);
    }

    pub fn wheel_disabled_set(&mut self, disabled: bool) {
        self.wheel_disabled = disabled;
    }

    pub fn wheel_disabled_get(&self) -> bool {
        self.wheel_disabled
    }

    pub fn pinch_start(&mut self) {
        self.pinch_zoom = self.view.zoom_detail();
    }

    /// Pinch by `scale` relative to the distance at [`MapWidget::pinch_start`]
    pub fn pinch(&mut self, scale: f64) {
        if self.paused || scale <= 0.0 {
            return;
        }
        let zoom = if scale >= 1.0 {
            self.pinch_zoom + scale - 1.0
        } else {
            self.pinch_zoom - 1.0 / scale + 1.0
        };
        self.zoom_to(zoom, false);
    }

    /// Freeze zoom animation and gesture zoom
    pub fn paused_set(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        if paused {
            let range = self.source_range();
            self.view.stop_zoom_animation(range, self.now, &mut self.events);
            self.events.push(MapEvent::BusyStop);
        } else if self.tiles.downloader().in_flight() > 0 {
            self.events.push(MapEvent::BusyStart);
        }
        self.changed = true;
    }

    pub fn paused_get(&self) -> bool {
        self.paused
    }

    // Viewport

    pub fn resize(&mut self, w: i32, h: i32) {
        self.view.set_viewport(w, h);
        if self.pending.zoom.is_none() {
            self.pending.zoom = Some((self.view.zoom() as f64, false));
        }
        self.changed = true;
    }

    /// Canvas position of the widget's top-left corner
    pub fn move_to(&mut self, x: i32, y: i32) {
        self.view.set_origin(x, y);
        self.changed = true;
    }

    /// User drag to pan position `(x, y)`
    pub fn scroll_to(&mut self, x: i32, y: i32) {
        self.view.scroll_to(x, y, self.now, &mut self.events);
        self.changed = true;
    }

    pub fn scroll_by(&mut self, dx: i32, dy: i32) {
        let (x, y) = self.view.pan();
        self.scroll_to(x + dx, y + dy);
    }

    /// Centre on `(lon, lat)` at the next recalculation
    pub fn region_show(&mut self, lon: f64, lat: f64) {
        self.pending.show = Some((GeoPoint::wrapped(lon, lat), false));
        self.changed = true;
    }

    /// Scroll smoothly to `(lon, lat)`
    pub fn region_bring_in(&mut self, lon: f64, lat: f64) {
        self.pending.show = Some((GeoPoint::wrapped(lon, lat), true));
        self.changed = true;
    }

    /// Geo point under the viewport centre
    pub fn region_get(&self) -> GeoPoint {
        Projector::new(&self.view, self.sources.tile()).center()
    }

    pub fn canvas_to_region(&self, x: i32, y: i32) -> GeoPoint {
        Projector::new(&self.view, self.sources.tile()).canvas_to_region(x, y)
    }

    pub fn region_to_canvas(&self, lon: f64, lat: f64) -> (i32, i32) {
        Projector::new(&self.view, self.sources.tile()).region_to_canvas(lon, lat)
    }

    /// Rotate the canvas by `degrees` around canvas point `(cx, cy)`
    pub fn rotate_set(&mut self, degrees: f64, cx: i32, cy: i32) {
        self.view.set_rotation(degrees, cx, cy);
        self.changed = true;
    }

    pub fn rotate_get(&self) -> Rotation {
        self.view.rotation()
    }

    // Sources

    /// Activate a registered source. Switching tile source rebuilds every grid.
    pub fn source_set(&mut self, kind: SourceKind, name: &str) -> Result<()> {
        let switched = self.sources.select(kind, name).inspect_err(|e| log::warn!("{}", e))?;
        if switched && kind == SourceKind::Tile {
            self.tile_source_changed();
        }
        Ok(())
    }

    /// Fit zoom limits to the active tile source and rebuild every grid
    fn tile_source_changed(&mut self) {
        let (min, max) = self.source_range();
        let zoom = self.view.zoom().clamp(min, max);
        self.view.zoom_max = self.view.zoom_max.min(max);
        self.view.zoom_min = self.view.zoom_min.max(min).min(self.view.zoom_max);
        log::info!("Tile source {} with zoom {}..={}", self.sources.tile().name, min, max);

        self.tiles.reset(min, max, self.fetcher.as_mut(), &mut self.events);
        self.view.stop_zoom_animation((min, max), self.now, &mut self.events);
        self.view.apply_zoom(
            zoom as f64,
            false,
            self.config.zoom_animation_steps,
            (min, max),
            self.now,
            &mut self.events,
        );
        self.changed = true;
    }

    pub fn source_get(&self, kind: SourceKind) -> &str {
        self.sources.current(kind)
    }

    pub fn sources_get(&self, kind: SourceKind) -> Vec<&str> {
        self.sources.names(kind)
    }

    /// Register a tile source. Replacing the active one rebuilds the grids like a switch.
    pub fn tile_source_add(&mut self, source: TileSource) {
        if self.sources.add_tile(source) {
            self.tile_source_changed();
        }
    }

    pub fn route_source_add(&mut self, source: RouteSource) {
        self.sources.add_route(source);
    }

    pub fn name_source_add(&mut self, source: NameSource) {
        self.sources.add_name(source);
    }

    pub fn user_agent_set(&mut self, user_agent: &str) {
        self.config.user_agent = user_agent.to_string();
        self.fetcher.set_user_agent(user_agent);
    }

    pub fn user_agent_get(&self) -> &str {
        &self.config.user_agent
    }

    // Tiles

    /// `(attempted, finished)` tile downloads
    pub fn tile_load_status(&self) -> (i32, i32) {
        self.tiles.load_status()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.tiles.stats()
    }

    /// Drop every tile, failed ones included, and load the view again
    pub fn reload_tiles(&mut self) {
        let (min, max) = self.source_range();
        self.tiles.reset(min, max, self.fetcher.as_mut(), &mut self.events);
        self.changed = true;
    }

    pub fn grid(&self, zoom: i32) -> Option<&Grid> {
        self.tiles.grid(zoom)
    }

    pub fn tiles(&self) -> &TileLayer {
        &self.tiles
    }

    /// Decoded tiles of the current zoom with their canvas placement
    pub fn tile_quads(&self) -> Vec<TileQuad<'_>> {
        self.tiles.quads(&self.view)
    }

    // Input

    pub fn press(&mut self, x: i32, y: i32) {
        self.events.push(MapEvent::Press { x, y });
    }

    /// Single click; also reported to the overlay under the point
    pub fn clicked(&mut self, x: i32, y: i32) {
        self.events.push(MapEvent::Clicked { x, y });
        self.click_at(x, y);
    }

    pub fn clicked_double(&mut self, x: i32, y: i32) {
        self.events.push(MapEvent::ClickedDouble { x, y });
    }

    pub fn long_pressed(&mut self, x: i32, y: i32) {
        self.events.push(MapEvent::LongPressed { x, y });
    }
}

impl Drop for MapWidget {
    fn drop(&mut self) {
        for id in self.overlays.ids().to_vec() {
            let _ = self.overlay_del(id);
        }
        for id in self.routes.keys().collect::<Vec<_>>() {
            let _ = self.route_del(id);
        }
        for id in self.names.keys().collect::<Vec<_>>() {
            let _ = self.name_del(id);
        }
        for (job, request) in self.requests.drain() {
            self.fetcher.abort(job);
            if let Request::NameList { file, .. } = request {
                cache::remove_file(&file);
            }
        }

        self.tiles.shutdown(self.fetcher.as_mut());
        if self.config.purge_cache_on_drop {
            self.tiles.layout().purge();
        }
    }
}
