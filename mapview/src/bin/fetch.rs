//! Prefetch the tiles around a point into the widget cache
//!
//! Usage: `mapview-fetch <lon> <lat> [zoom] [cache-root]`

use std::time::Duration;

use anyhow::{Context, bail};
use web_time::Instant;

use mapview::{MapConfig, MapEvent, MapWidget};

const VIEWPORT: (i32, i32) = (800, 600);
const TIMEOUT: Duration = Duration::from_secs(60);

fn arg<T: std::str::FromStr>(args: &[String], index: usize, name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    args.get(index)
        .map(|value| value.parse::<T>().with_context(|| format!("invalid {} {:?}", name, value)))
        .transpose()
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(lon), Some(lat)) =
        (arg::<f64>(&args, 0, "longitude")?, arg::<f64>(&args, 1, "latitude")?)
    else {
        bail!("usage: mapview-fetch <lon> <lat> [zoom] [cache-root]");
    };
    let zoom = arg::<i32>(&args, 2, "zoom")?.unwrap_or(12);

    let mut config = MapConfig::default().with_purge_cache_on_drop(false);
    if let Some(root) = args.get(3) {
        config = config.with_cache_root(root);
    }
    log::info!("Caching under {}", config.cache_dir().display());

    let mut map = MapWidget::new(config);
    map.resize(VIEWPORT.0, VIEWPORT.1);
    map.zoom_set(zoom);
    map.region_show(lon, lat);

    let start = Instant::now();
    loop {
        let now = Instant::now();
        map.tick(now);
        let events = map.take_events();
        for event in &events {
            match event {
                MapEvent::TileLoaded(tile) => log::debug!("Loaded {:?}", tile),
                MapEvent::TileLoadedFail(tile) => log::warn!("Failed {:?}", tile),
                _ => {}
            }
        }
        if events.contains(&MapEvent::Loaded) {
            break;
        }
        if now.duration_since(start) > TIMEOUT {
            log::warn!("Gave up waiting for tiles after {:?}", TIMEOUT);
            break;
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    let stats = map.cache_stats();
    let (tried, finished) = map.tile_load_status();
    let center = map.region_get();
    println!(
        "zoom {} at ({:.5}, {:.5}): {} tiles on disk, {} failed, {}/{} downloads finished",
        map.zoom_get(),
        center.lon,
        center.lat,
        stats.on_disk,
        stats.failed,
        finished,
        tried
    );
    Ok(())
}
