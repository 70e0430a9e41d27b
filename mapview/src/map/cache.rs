//! On-disk cache layout for tiles and request bodies

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use super::tile::TileId;

static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Paths owned by one widget under `<cache_root>/elm_map`
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    id: u32,
    request_seq: u64,
}

impl CacheLayout {
    /// `root` is the `elm_map` directory itself
    pub fn new(root: PathBuf) -> Self {
        let counter = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff;
        Self {
            root,
            id: (std::process::id() << 16) | counter,
            request_seq: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Widget instance id used as the tile directory name
    pub fn id(&self) -> u32 {
        self.id
    }

    /// `<root>/<id>/<zoom>/<x>/<y>.png`
    pub fn tile_path(&self, tile: TileId) -> PathBuf {
        self.root
            .join(self.id.to_string())
            .join(tile.z.to_string())
            .join(tile.x.to_string())
            .join(format!("{}.png", tile.y))
    }

    /// Fresh file under `<root>/route` or `<root>/name` for one request body
    pub fn request_path(&mut self, dir: &str) -> PathBuf {
        self.request_seq += 1;
        self.root
            .join(dir)
            .join(format!("{}-{}", self.id, self.request_seq))
    }

    /// Remove the whole cache tree; failures are logged
    pub fn purge(&self) {
        if !self.root.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            log::warn!("Deleting cache {} failed: {}", self.root.display(), e);
        }
    }
}

/// Create the parent directory of `path`; failures are logged
pub fn ensure_parent(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return true;
    };
    match fs::create_dir_all(parent) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Could not create cache directory {}: {}", parent.display(), e);
            false
        }
    }
}

/// Remove a cache file if present
pub fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
    }
}

/// Tile bookkeeping snapshot for debugging/UI
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub tile_count: usize,
    /// Tiles with a decoded image in memory
    pub resident: usize,
    /// Tiles whose file is on disk, decoded or not
    pub on_disk: usize,
    pub queued: usize,
    pub downloading: usize,
    pub failed: usize,
}

impl CacheStats {
    pub fn resident_percent(&self) -> f32 {
        if self.tile_count == 0 {
            0.0
        } else {
            (self.resident as f32 / self.tile_count as f32) * 100.0
        }
    }

    pub fn failed_percent(&self) -> f32 {
        if self.tile_count == 0 {
            0.0
        } else {
            (self.failed as f32 / self.tile_count as f32) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_path_layout() {
        let layout = CacheLayout::new(PathBuf::from("/cache/elm_map"));
        let path = layout.tile_path(TileId::new(5, 7, 3));
        let expected = PathBuf::from("/cache/elm_map")
            .join(layout.id().to_string())
            .join("3/5/7.png");
        assert_eq!(path, expected);
    }

    #[test]
    fn test_instance_ids_differ() {
        let a = CacheLayout::new(PathBuf::from("/c"));
        let b = CacheLayout::new(PathBuf::from("/c"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id() >> 16, std::process::id() & 0xffff);
    }

    #[test]
    fn test_request_paths_unique() {
        let mut layout = CacheLayout::new(PathBuf::from("/c/elm_map"));
        let first = layout.request_path("route");
        let second = layout.request_path("route");
        assert_ne!(first, second);
        assert!(first.starts_with("/c/elm_map/route"));
    }

    #[test]
    fn test_purge_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("elm_map"));
        let path = layout.tile_path(TileId::new(0, 0, 0));
        assert!(ensure_parent(&path));
        fs::write(&path, b"x").unwrap();
        layout.purge();
        assert!(!layout.root().exists());
    }

    #[test]
    fn test_stats_percent() {
        let stats = CacheStats { tile_count: 4, resident: 1, failed: 2, ..Default::default() };
        assert!((stats.resident_percent() - 25.0).abs() < 0.001);
        assert!((stats.failed_percent() - 50.0).abs() < 0.001);
        assert_eq!(CacheStats::default().resident_percent(), 0.0);
    }
}
