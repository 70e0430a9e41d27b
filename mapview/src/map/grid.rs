//! Per-zoom tile grids and the tile lifecycle
//!
//! Only the grid matching the current integer zoom materializes tiles; every other grid is
//! kept fully unloaded. A tile stays relevant while it is inside the tile window of the
//! viewport, prefetch margin included.
//!
//! Tiles move `Empty -> Queued -> Downloading -> Resident | Failed` and back to `Empty`
//! when cancelled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use image::RgbaImage;
use web_time::Instant;

use crate::event::MapEvent;

use super::cache::{self, CacheLayout, CacheStats};
use super::camera::{SettleTimer, ViewRect, ViewportController};
use super::loader::{load_tile_file, Downloader, FetchOutcome, FetchRequest, Fetcher, JobId};
use super::source::TileSource;
use super::tile::TileId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    Empty,
    Queued,
    Downloading,
    Resident,
    Failed,
}

/// One tile record of a grid
#[derive(Debug)]
pub struct Tile {
    pub id: TileId,
    url: Option<String>,
    file: PathBuf,
    state: TileState,
    image: Option<RgbaImage>,
    job: Option<JobId>,
    shown: bool,
    smooth: bool,
}

impl Tile {
    fn new(id: TileId, url: Option<String>, file: PathBuf) -> Self {
        Self {
            id,
            url,
            file,
            state: TileState::Empty,
            image: None,
            job: None,
            shown: false,
            smooth: false,
        }
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn file(&self) -> &std::path::Path {
        &self.file
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn image(&self) -> Option<&RgbaImage> {
        self.image.as_ref()
    }

    pub fn is_shown(&self) -> bool {
        self.shown
    }

    pub fn is_smooth(&self) -> bool {
        self.smooth
    }

    /// Show the tile, decoding it from disk if the image was released.
    /// A file that fails to decode is deleted and the tile becomes Failed.
    fn update(&mut self, smooth: bool) -> bool {
        if self.image.is_none() {
            match load_tile_file(&self.file) {
                Ok(image) => self.image = Some(image),
                Err(e) => {
                    log::warn!("Failed to decode tile {:?}: {}", self.id, e);
                    cache::remove_file(&self.file);
                    self.state = TileState::Failed;
                    self.shown = false;
                    return false;
                }
            }
        }
        self.shown = true;
        self.smooth = smooth;
        true
    }

    fn unload(
        &mut self,
        downloader: &mut Downloader,
        fetcher: &mut dyn Fetcher,
        events: &mut Vec<MapEvent>,
    ) {
        match self.state {
            TileState::Resident => {
                self.shown = false;
                self.image = None;
            }
            TileState::Downloading => {
                if let Some(job) = self.job.take() {
                    downloader.cancel(job, fetcher, events);
                }
                cache::remove_file(&self.file);
                self.state = TileState::Empty;
            }
            TileState::Queued => {
                downloader.dequeue(self.id);
                self.state = TileState::Empty;
            }
            TileState::Empty | TileState::Failed => {}
        }
    }

    fn free(
        mut self,
        downloader: &mut Downloader,
        fetcher: &mut dyn Fetcher,
        events: &mut Vec<MapEvent>,
    ) {
        self.unload(downloader, fetcher, events);
        if self.state == TileState::Resident {
            cache::remove_file(&self.file);
        }
    }
}

/// Range of tile indices a viewport needs, prefetch margin included
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TileWindow {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl TileWindow {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }

    pub fn len(&self) -> usize {
        (self.w.max(0) * self.h.max(0)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cells(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        (self.y..self.y + self.h).flat_map(move |y| (self.x..self.x + self.w).map(move |x| (x, y)))
    }
}

/// Sparse tile grid for one zoom level, keyed by `(y, x)`
#[derive(Debug)]
pub struct Grid {
    zoom: u8,
    tw: i32,
    th: i32,
    tiles: BTreeMap<(u32, u32), Tile>,
}

impl Grid {
    pub fn new(zoom: u8) -> Self {
        let edge = 1_i32 << zoom;
        Self {
            zoom,
            tw: edge,
            th: edge,
            tiles: BTreeMap::new(),
        }
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// Number of addressable cells, `2^zoom * 2^zoom`
    pub fn addressable(&self) -> i64 {
        self.tw as i64 * self.th as i64
    }

    pub fn tile(&self, x: u32, y: u32) -> Option<&Tile> {
        self.tiles.get(&(y, x))
    }

    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    /// Window of tile indices for `view`: one tile of leading margin, three tiles of span
    /// padding, clipped to the grid
    pub fn window(&self, view: &ViewRect, tile: i32) -> TileWindow {
        if tile <= 0 {
            return TileWindow::default();
        }
        let vx = view.x.max(0);
        let vy = view.y.max(0);

        let x = (vx / tile - 1).max(0);
        let mut w = view.w / tile + 3;
        if x + w >= self.tw {
            w = self.tw - x;
        }

        let y = (vy / tile - 1).max(0);
        let mut h = view.h / tile + 3;
        if y + h >= self.th {
            h = self.th - y;
        }

        TileWindow { x, y, w: w.max(0), h: h.max(0) }
    }

    /// Whether `id` still falls inside the window of `view`
    pub fn is_current(&self, id: TileId, view: &ViewRect, tile: i32) -> bool {
        id.z == self.zoom && self.window(view, tile).contains(id.x as i32, id.y as i32)
    }
}

/// A decoded tile positioned on the canvas, before rotation
#[derive(Debug)]
pub struct TileQuad<'a> {
    pub id: TileId,
    pub x: i32,
    pub y: i32,
    pub size: i32,
    pub smooth: bool,
    pub image: &'a RgbaImage,
}

/// All grids of the active tile source plus their download bookkeeping
pub struct TileLayer {
    grids: Vec<Grid>,
    downloader: Downloader,
    layout: CacheLayout,
    loaded_timer: SettleTimer,
    settle_delay: Duration,
}

impl TileLayer {
    pub fn new(layout: CacheLayout, max_in_flight: usize, settle_delay: Duration) -> Self {
        Self {
            grids: Vec::new(),
            downloader: Downloader::new(max_in_flight),
            layout,
            loaded_timer: SettleTimer::default(),
            settle_delay,
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn layout_mut(&mut self) -> &mut CacheLayout {
        &mut self.layout
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn grid(&self, zoom: i32) -> Option<&Grid> {
        self.grids.iter().find(|g| g.zoom as i32 == zoom)
    }

    pub fn grids(&self) -> &[Grid] {
        &self.grids
    }

    /// Free every grid and allocate empty ones for `zoom_min..=zoom_max`
    pub fn reset(
        &mut self,
        zoom_min: i32,
        zoom_max: i32,
        fetcher: &mut dyn Fetcher,
        events: &mut Vec<MapEvent>,
    ) {
        self.clear(fetcher, events);
        self.grids = (zoom_min.max(0)..=zoom_max.max(0))
            .map(|zoom| Grid::new(zoom as u8))
            .collect();
    }

    /// Free all tiles, deleting their cache files
    pub fn clear(&mut self, fetcher: &mut dyn Fetcher, events: &mut Vec<MapEvent>) {
        for grid in &mut self.grids {
            for (_, tile) in std::mem::take(&mut grid.tiles) {
                tile.free(&mut self.downloader, fetcher, events);
            }
        }
        self.downloader.clear_worklist();
    }

    /// Load the grid of the current zoom and unload every other one
    pub fn place(
        &mut self,
        view: &ViewportController,
        source: &TileSource,
        fetcher: &mut dyn Fetcher,
        now: Instant,
        events: &mut Vec<MapEvent>,
    ) {
        let rect = view.viewport_coord();
        let tile_size = view.tile_size();
        let smooth = view.smooth();
        for grid in &mut self.grids {
            if grid.zoom as i32 == view.zoom() {
                Self::load_grid(
                    grid,
                    &rect,
                    tile_size,
                    smooth,
                    source,
                    &self.layout,
                    &mut self.downloader,
                    fetcher,
                    events,
                );
            } else {
                for tile in grid.tiles.values_mut() {
                    tile.unload(&mut self.downloader, fetcher, events);
                }
            }
        }
        if self.any_shown() {
            self.loaded_timer.restart(now, self.settle_delay);
        }
        self.downloader.wake();
    }

    #[allow(clippy::too_many_arguments)]
    fn load_grid(
        grid: &mut Grid,
        rect: &ViewRect,
        tile_size: i32,
        smooth: bool,
        source: &TileSource,
        layout: &CacheLayout,
        downloader: &mut Downloader,
        fetcher: &mut dyn Fetcher,
        events: &mut Vec<MapEvent>,
    ) {
        let window = grid.window(rect, tile_size);
        for tile in grid.tiles.values_mut() {
            if !window.contains(tile.id.x as i32, tile.id.y as i32) {
                tile.unload(downloader, fetcher, events);
            }
        }

        for (x, y) in window.cells() {
            let id = TileId::new(x as u32, y as u32, grid.zoom);
            let tile = grid.tiles.entry((id.y, id.x)).or_insert_with(|| {
                let url = source.tile_url(id.x, id.y, id.z);
                let url = if url.is_empty() {
                    log::error!("Getting source url failed for {:?}", id);
                    None
                } else {
                    Some(url)
                };
                let file = layout.tile_path(id);
                cache::ensure_parent(&file);
                Tile::new(id, url, file)
            });

            match tile.state {
                TileState::Resident => {
                    tile.update(smooth);
                }
                TileState::Empty | TileState::Queued => {
                    tile.state = TileState::Queued;
                    downloader.enqueue(id);
                }
                TileState::Downloading | TileState::Failed => {}
            }
        }
    }

    fn any_shown(&self) -> bool {
        self.grids.iter().any(|g| g.tiles.values().any(|t| t.shown))
    }

    /// One download pass, newest requests first. Stale entries are dropped.
    pub fn download_pass(
        &mut self,
        view: &ViewportController,
        fetcher: &mut dyn Fetcher,
        events: &mut Vec<MapEvent>,
    ) {
        if !self.downloader.is_running() {
            return;
        }
        if self.downloader.worklist().is_empty() || !fetcher.is_available() {
            self.downloader.sleep();
            return;
        }

        let rect = view.viewport_coord();
        let tile_size = view.tile_size();
        let mut i = self.downloader.worklist().len();
        while i > 0 {
            i -= 1;
            let id = self.downloader.worklist()[i];
            let Some(grid) = self.grids.iter_mut().find(|g| g.zoom == id.z) else {
                self.downloader.remove_at(i);
                continue;
            };
            let current = id.z as i32 == view.zoom() && grid.is_current(id, &rect, tile_size);
            let Some(tile) = grid.tiles.get_mut(&(id.y, id.x)) else {
                self.downloader.remove_at(i);
                continue;
            };

            if !current {
                self.downloader.remove_at(i);
                tile.state = TileState::Empty;
                log::debug!("Dropped stale tile {:?}", id);
                continue;
            }

            if !self.downloader.has_slot() {
                return;
            }
            self.downloader.remove_at(i);

            let Some(url) = tile.url.clone() else {
                tile.state = TileState::Failed;
                events.push(MapEvent::TileLoadedFail(id));
                continue;
            };
            let request = FetchRequest { url, dest: tile.file.clone() };
            match fetcher.start(request) {
                Ok(job) => {
                    tile.state = TileState::Downloading;
                    tile.job = Some(job);
                    self.downloader.started(job, id, events);
                }
                Err(e) => {
                    log::error!("Can't start to download {:?}: {}", id, e);
                    tile.state = TileState::Failed;
                    events.push(MapEvent::TileLoadedFail(id));
                }
            }
        }
    }

    /// Apply a fetch completion. Returns `false` when the job is not a tile job.
    pub fn complete(
        &mut self,
        outcome: FetchOutcome,
        view: &ViewportController,
        now: Instant,
        events: &mut Vec<MapEvent>,
    ) -> bool {
        let Some(id) = self.downloader.complete(outcome.job) else {
            return false;
        };
        let rect = view.viewport_coord();
        let grid = self.grids.iter_mut().find(|g| g.zoom == id.z);
        let current = grid.as_ref().is_some_and(|g| {
            id.z as i32 == view.zoom() && g.is_current(id, &rect, view.tile_size())
        });
        let tile = grid.and_then(|g| g.tiles.get_mut(&(id.y, id.x)));

        let Some(tile) = tile else {
            cache::remove_file(&self.layout.tile_path(id));
            self.downloader.release(outcome.job, false, events);
            return true;
        };
        tile.job = None;

        let ok = if outcome.status == 200 {
            tile.state = TileState::Resident;
            if current {
                tile.update(view.smooth())
            } else {
                true
            }
        } else {
            log::warn!("Download of tile {:?} failed with status {}", id, outcome.status);
            cache::remove_file(&tile.file);
            tile.state = TileState::Failed;
            false
        };

        if ok {
            self.loaded_timer.restart(now, self.settle_delay);
            events.push(MapEvent::TileLoaded(id));
        } else {
            events.push(MapEvent::TileLoadedFail(id));
        }
        self.downloader.release(outcome.job, ok, events);
        true
    }

    /// Re-enable smooth scaling on every tile in view
    pub fn smooth_update(&mut self, view: &ViewportController) {
        let rect = view.viewport_coord();
        let tile_size = view.tile_size();
        for grid in &mut self.grids {
            let window = grid.window(&rect, tile_size);
            for tile in grid.tiles.values_mut() {
                if window.contains(tile.id.x as i32, tile.id.y as i32) {
                    tile.smooth = true;
                }
            }
        }
    }

    /// True once when the quiet period after the last tile update ends with nothing left to do
    pub fn fire_loaded(&mut self, now: Instant) -> bool {
        self.loaded_timer.fire(now)
            && self.downloader.in_flight() == 0
            && !self.downloader.is_running()
    }

    /// Cancel downloads and drop every tile, deleting this widget's tile files
    pub fn shutdown(&mut self, fetcher: &mut dyn Fetcher) {
        let mut events = Vec::new();
        self.clear(fetcher, &mut events);
        self.downloader.abort_all(fetcher);
        self.grids.clear();
    }

    pub fn load_status(&self) -> (i32, i32) {
        self.downloader.load_status()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for tile in self.grids.iter().flat_map(|g| g.tiles.values()) {
            stats.tile_count += 1;
            match tile.state {
                TileState::Resident => {
                    stats.on_disk += 1;
                    if tile.image.is_some() {
                        stats.resident += 1;
                    }
                }
                TileState::Queued => stats.queued += 1,
                TileState::Downloading => stats.downloading += 1,
                TileState::Failed => stats.failed += 1,
                TileState::Empty => {}
            }
        }
        stats
    }

    /// Decoded tiles of the current zoom with their canvas placement
    pub fn quads(&self, view: &ViewportController) -> Vec<TileQuad<'_>> {
        let Some(grid) = self.grid(view.zoom()) else {
            return Vec::new();
        };
        let tile_size = view.tile_size();
        grid.tiles
            .values()
            .filter(|t| t.shown)
            .filter_map(|t| {
                let image = t.image.as_ref()?;
                let (x, y) = (t.id.x as i32 * tile_size, t.id.y as i32 * tile_size);
                let (x, y) = view.coord_to_canvas_unrotated(x, y);
                Some(TileQuad { id: t.id, x, y, size: tile_size, smooth: t.smooth, image })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::loader::testing::ScriptedFetcher;

    fn view_at(zoom: f64, w: i32, h: i32, pan: (i32, i32)) -> ViewportController {
        let mut view = ViewportController::new(256, Duration::from_millis(250));
        let mut events = Vec::new();
        view.set_viewport(w, h);
        view.apply_zoom(zoom, false, 10, (0, 18), Instant::now(), &mut events);
        view.content_region_show(pan.0, pan.1);
        view
    }

    fn layer(dir: &std::path::Path) -> TileLayer {
        let layout = CacheLayout::new(dir.join("elm_map"));
        let mut layer = TileLayer::new(layout, 10, Duration::from_millis(250));
        let mut fetcher = ScriptedFetcher::default();
        layer.reset(0, 18, &mut fetcher, &mut Vec::new());
        layer
    }

    #[test]
    fn test_window_at_origin() {
        let grid = Grid::new(3);
        assert_eq!(grid.addressable(), 64);
        let window = grid.window(&ViewRect { x: 0, y: 0, w: 400, h: 400 }, 256);
        assert_eq!(window, TileWindow { x: 0, y: 0, w: 4, h: 4 });
        assert_eq!(window.w, (400f64 / 256.0).ceil() as i32 + 2);
    }

    #[test]
    fn test_window_clipped_to_grid() {
        let grid = Grid::new(3);
        let window = grid.window(&ViewRect { x: 1648, y: 1648, w: 400, h: 400 }, 256);
        assert_eq!(window, TileWindow { x: 5, y: 5, w: 3, h: 3 });

        let tiny = Grid::new(0);
        let window = tiny.window(&ViewRect { x: -72, y: -22, w: 400, h: 300 }, 256);
        assert_eq!(window, TileWindow { x: 0, y: 0, w: 1, h: 1 });
    }

    #[test]
    fn test_window_tiles_near_viewport() {
        let grid = Grid::new(6);
        let tile = 256;
        for (x, y) in [(0, 0), (300, 900), (5000, 7000), (16000, 16000)] {
            let view = ViewRect { x, y, w: 640, h: 480 };
            let window = grid.window(&view, tile);
            let margin =
                ViewRect { x: x - tile, y: y - tile, w: 640 + 3 * tile, h: 480 + 3 * tile };
            for (tx, ty) in window.cells() {
                assert!(margin.intersects(tx * tile, ty * tile, tile, tile), "tile {} {}", tx, ty);
            }
        }
    }

    #[test]
    fn test_place_queues_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let view = view_at(3.0, 400, 400, (0, 0));
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();

        layer.place(&view, source, &mut fetcher, Instant::now(), &mut events);
        assert_eq!(layer.downloader().worklist().len(), 16);
        assert_eq!(layer.stats().queued, 16);
        let tile = layer.grid(3).unwrap().tile(1, 2).unwrap();
        assert_eq!(tile.url(), Some("http://a.tile.openstreetmap.org/3/1/2.png"));
        assert!(tile.file().ends_with("3/1/2.png"));
    }

    #[test]
    fn test_concurrency_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let view = view_at(3.0, 400, 400, (0, 0));
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();
        let now = Instant::now();

        layer.place(&view, source, &mut fetcher, now, &mut events);
        layer.download_pass(&view, &mut fetcher, &mut events);
        assert_eq!(layer.downloader().in_flight(), 10);
        assert_eq!(layer.downloader().worklist().len(), 6);

        // newest request goes first
        let first = &fetcher.pending()[0].1;
        assert!(first.url.ends_with("/3/3/3.png"), "{}", first.url);

        for (job, _) in fetcher.pending().into_iter().take(3) {
            fetcher.respond(job, 200);
        }
        while let Some(outcome) = fetcher.poll() {
            assert!(layer.complete(outcome, &view, now, &mut events));
            assert!(layer.downloader().in_flight() <= 10);
        }
        layer.download_pass(&view, &mut fetcher, &mut events);
        assert_eq!(layer.downloader().in_flight(), 10);
        assert_eq!(layer.downloader().worklist().len(), 3);
        assert_eq!(layer.load_status(), (13, 3));
        assert_eq!(events.iter().filter(|e| **e == MapEvent::BusyStart).count(), 1);
    }

    #[test]
    fn test_stale_queued_tile_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();

        let view = view_at(3.0, 400, 400, (0, 0));
        layer.place(&view, source, &mut fetcher, Instant::now(), &mut events);
        let corner = TileId::new(0, 0, 3);
        assert!(layer.downloader().worklist().contains(&corner));

        let scrolled = view_at(3.0, 400, 400, (1648, 1648));
        layer.download_pass(&scrolled, &mut fetcher, &mut events);
        assert!(!layer.downloader().worklist().contains(&corner));
        assert_eq!(layer.grid(3).unwrap().tile(0, 0).unwrap().state(), TileState::Empty);
        assert!(fetcher.pending().iter().all(|(_, r)| !r.url.ends_with("/3/0/0.png")));
    }

    #[test]
    fn test_failed_tile_not_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();
        let now = Instant::now();
        let view = view_at(0.0, 400, 300, (0, 0));

        layer.place(&view, source, &mut fetcher, now, &mut events);
        layer.download_pass(&view, &mut fetcher, &mut events);
        let (job, request) = fetcher.pending().remove(0);
        fetcher.respond_body(job, 404, b"not found");
        let outcome = fetcher.poll().unwrap();
        layer.complete(outcome, &view, now, &mut events);

        let tile = layer.grid(0).unwrap().tile(0, 0).unwrap();
        assert_eq!(tile.state(), TileState::Failed);
        assert!(!request.dest.exists());
        assert!(events.contains(&MapEvent::TileLoadedFail(TileId::new(0, 0, 0))));
        assert_eq!(events.last(), Some(&MapEvent::BusyStop));

        layer.place(&view, source, &mut fetcher, now, &mut events);
        assert!(layer.downloader().worklist().is_empty());
        assert_eq!(layer.grid(0).unwrap().tile(0, 0).unwrap().state(), TileState::Failed);
    }

    #[test]
    fn test_unload_keeps_file_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();
        let now = Instant::now();
        let view = view_at(1.0, 200, 200, (0, 0));

        layer.place(&view, source, &mut fetcher, now, &mut events);
        layer.download_pass(&view, &mut fetcher, &mut events);
        for (job, _) in fetcher.pending() {
            fetcher.respond(job, 200);
        }
        while let Some(outcome) = fetcher.poll() {
            layer.complete(outcome, &view, now, &mut events);
        }
        let stats = layer.stats();
        assert_eq!(stats.resident, 4);
        assert_eq!(layer.quads(&view).len(), 4);

        // zoom 2 grid takes over, zoom 1 tiles release their images
        let zoomed = view_at(2.0, 200, 200, (0, 0));
        layer.place(&zoomed, source, &mut fetcher, now, &mut events);
        let tile = layer.grid(1).unwrap().tile(0, 0).unwrap();
        assert_eq!(tile.state(), TileState::Resident);
        assert!(tile.image().is_none());
        assert!(tile.file().exists());

        layer.place(&view, source, &mut fetcher, now, &mut events);
        assert!(layer.grid(1).unwrap().tile(0, 0).unwrap().image().is_some());
    }

    #[test]
    fn test_cancel_in_flight_on_zoom_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();
        let now = Instant::now();
        let view = view_at(1.0, 200, 200, (0, 0));

        layer.place(&view, source, &mut fetcher, now, &mut events);
        layer.download_pass(&view, &mut fetcher, &mut events);
        assert_eq!(layer.downloader().in_flight(), 4);

        let zoomed = view_at(2.0, 200, 200, (0, 0));
        layer.place(&zoomed, source, &mut fetcher, now, &mut events);
        assert_eq!(layer.downloader().in_flight(), 0);
        assert_eq!(fetcher.0.borrow().aborted.len(), 4);
        assert_eq!(layer.load_status(), (0, 0));
        assert_eq!(events.last(), Some(&MapEvent::BusyStop));
    }

    #[test]
    fn test_corrupt_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();
        let now = Instant::now();
        let view = view_at(0.0, 400, 300, (0, 0));

        layer.place(&view, source, &mut fetcher, now, &mut events);
        layer.download_pass(&view, &mut fetcher, &mut events);
        let (job, request) = fetcher.pending().remove(0);
        fetcher.respond_body(job, 200, b"garbage");
        layer.complete(fetcher.poll().unwrap(), &view, now, &mut events);

        assert_eq!(layer.grid(0).unwrap().tile(0, 0).unwrap().state(), TileState::Failed);
        assert!(!request.dest.exists());
        assert_eq!(layer.load_status(), (1, 0));
    }

    #[test]
    fn test_reset_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();
        let now = Instant::now();
        let view = view_at(0.0, 400, 300, (0, 0));

        layer.place(&view, source, &mut fetcher, now, &mut events);
        layer.download_pass(&view, &mut fetcher, &mut events);
        let (job, request) = fetcher.pending().remove(0);
        fetcher.respond(job, 200);
        layer.complete(fetcher.poll().unwrap(), &view, now, &mut events);
        assert!(request.dest.exists());

        layer.reset(0, 16, &mut fetcher, &mut events);
        assert!(!request.dest.exists());
        assert_eq!(layer.grids().len(), 17);
        assert_eq!(layer.stats().tile_count, 0);
    }

    #[test]
    fn test_loaded_fires_after_quiet_period() {
        let dir = tempfile::tempdir().unwrap();
        let mut layer = layer(dir.path());
        let source = &TileSource::builtin()[0];
        let mut fetcher = ScriptedFetcher::default();
        let mut events = Vec::new();
        let now = Instant::now();
        let view = view_at(0.0, 400, 300, (0, 0));

        layer.place(&view, source, &mut fetcher, now, &mut events);
        layer.download_pass(&view, &mut fetcher, &mut events);
        let (job, _) = fetcher.pending().remove(0);
        fetcher.respond(job, 200);
        layer.complete(fetcher.poll().unwrap(), &view, now, &mut events);

        layer.download_pass(&view, &mut fetcher, &mut events);
        assert!(!layer.downloader().is_running());
        assert!(!layer.fire_loaded(now + Duration::from_millis(100)));
        assert!(layer.fire_loaded(now + Duration::from_millis(300)));
    }
}
