//! Widget configuration

use std::path::PathBuf;
use std::time::Duration;

/// Directory created under the cache root for everything the widget writes
pub const CACHE_DIR_NAME: &str = "elm_map";

/// Construction-time settings for a `MapWidget`
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Parent of the `elm_map` cache tree
    pub cache_root: PathBuf,
    pub user_agent: String,
    /// Baseline tile edge in pixels
    pub tile_size: i32,
    pub max_concurrent_downloads: usize,
    /// Quiet period for zoom-stop, scroll-stop and loaded signals
    pub settle_delay: Duration,
    pub zoom_animation_steps: u32,
    pub bring_in_steps: u32,
    /// Marker box used for default overlays without content
    pub marker_size: (i32, i32),
    pub bubble_size: (i32, i32),
    pub scale_size: (i32, i32),
    pub scale_padding: i32,
    /// Remove the whole `elm_map` tree when the widget is dropped
    pub purge_cache_on_drop: bool,
}

impl MapConfig {
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max.max(1);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_marker_size(mut self, w: i32, h: i32) -> Self {
        self.marker_size = (w, h);
        self
    }

    pub fn with_purge_cache_on_drop(mut self, purge: bool) -> Self {
        self.purge_cache_on_drop = purge;
        self
    }

    /// `<cache_root>/elm_map`
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_root.join(CACHE_DIR_NAME)
    }
}

fn default_cache_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(std::env::temp_dir)
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            user_agent: "mapview/0.1 (+https://www.openstreetmap.org/copyright)".to_string(),
            tile_size: crate::map::camera::TILE_SIZE,
            max_concurrent_downloads: crate::map::loader::MAX_CONCURRENT_DOWNLOAD,
            settle_delay: Duration::from_millis(250),
            zoom_animation_steps: 10,
            bring_in_steps: 10,
            marker_size: (40, 40),
            bubble_size: (200, 80),
            scale_size: (100, 60),
            scale_padding: 10,
            purge_cache_on_drop: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_dir_layout() {
        let config = MapConfig::default().with_cache_root("/tmp/x");
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/x/elm_map"));
        assert_eq!(config.max_concurrent_downloads, 10);
    }
}
