//! Asynchronous file downloads and the bounded tile download worklist

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{MapError, Result};
use crate::event::MapEvent;

use super::tile::TileId;

/// Global cap on simultaneous tile downloads
pub const MAX_CONCURRENT_DOWNLOAD: usize = 10;

/// Handle for one in-flight fetch
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct JobId(pub u64);

/// Download `url` into the file at `dest`
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub dest: PathBuf,
}

/// Completion of a job; `status` is the HTTP status, 0 on transport failure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchOutcome {
    pub job: JobId,
    pub status: u16,
}

/// HTTP-capable file downloader
///
/// Completions may arrive in any order. An aborted job never reports.
pub trait Fetcher {
    fn start(&mut self, request: FetchRequest) -> Result<JobId>;
    fn abort(&mut self, job: JobId);
    fn poll(&mut self) -> Option<FetchOutcome>;

    fn is_available(&self) -> bool {
        true
    }

    fn set_user_agent(&mut self, _user_agent: &str) {}
}

/// Fetcher used when no HTTP backend is compiled in
#[derive(Debug, Default)]
pub struct NullFetcher;

impl Fetcher for NullFetcher {
    fn start(&mut self, _request: FetchRequest) -> Result<JobId> {
        Err(MapError::ProtocolUnavailable)
    }

    fn abort(&mut self, _job: JobId) {}

    fn poll(&mut self) -> Option<FetchOutcome> {
        None
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use http::HttpFetcher;

#[cfg(not(target_arch = "wasm32"))]
mod http {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{Receiver, Sender, TryRecvError};
    use std::sync::Arc;

    use super::{FetchOutcome, FetchRequest, Fetcher, JobId};
    use crate::error::{MapError, Result};
    use crate::map::cache;

    /// Blocking `reqwest` downloads, one worker thread per job
    pub struct HttpFetcher {
        client: Option<reqwest::blocking::Client>,
        result_tx: Sender<FetchOutcome>,
        result_rx: Receiver<FetchOutcome>,
        aborts: HashMap<JobId, Arc<AtomicBool>>,
        next_job: u64,
    }

    impl HttpFetcher {
        pub fn new(user_agent: &str) -> Self {
            let (result_tx, result_rx) = std::sync::mpsc::channel();
            Self {
                client: build_client(user_agent),
                result_tx,
                result_rx,
                aborts: HashMap::new(),
                next_job: 0,
            }
        }

        fn worker(
            client: reqwest::blocking::Client,
            job: JobId,
            request: FetchRequest,
            aborted: Arc<AtomicBool>,
            result_tx: Sender<FetchOutcome>,
        ) {
            let status = match client.get(&request.url).send() {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match response.bytes() {
                        Ok(bytes) if !aborted.load(Ordering::Acquire) => {
                            if write_body(&request.dest, &bytes) { status } else { 0 }
                        }
                        Ok(_) => status,
                        Err(e) => {
                            log::debug!("Reading {} failed: {}", request.url, e);
                            0
                        }
                    }
                }
                Err(e) => {
                    log::debug!("Fetching {} failed: {}", request.url, e);
                    0
                }
            };

            if aborted.load(Ordering::Acquire) {
                cache::remove_file(&request.dest);
                return;
            }
            // Receiver gone means the widget was dropped
            let _ = result_tx.send(FetchOutcome { job, status });
        }
    }

    fn build_client(user_agent: &str) -> Option<reqwest::blocking::Client> {
        match reqwest::blocking::Client::builder().user_agent(user_agent).build() {
            Ok(client) => Some(client),
            Err(e) => {
                log::error!("Failed to create HTTP client: {}", e);
                None
            }
        }
    }

    fn write_body(dest: &Path, bytes: &[u8]) -> bool {
        if !cache::ensure_parent(dest) {
            return false;
        }
        match std::fs::write(dest, bytes) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Writing {} failed: {}", dest.display(), e);
                false
            }
        }
    }

    impl Fetcher for HttpFetcher {
        fn start(&mut self, request: FetchRequest) -> Result<JobId> {
            let Some(client) = self.client.clone() else {
                return Err(MapError::ProtocolUnavailable);
            };
            self.next_job += 1;
            let job = JobId(self.next_job);
            let aborted = Arc::new(AtomicBool::new(false));
            self.aborts.insert(job, aborted.clone());

            let result_tx = self.result_tx.clone();
            std::thread::Builder::new()
                .name(format!("mapview-fetch-{}", job.0))
                .spawn(move || Self::worker(client, job, request, aborted, result_tx))
                .map_err(|e| {
                    self.aborts.remove(&job);
                    MapError::Transport(e.to_string())
                })?;
            Ok(job)
        }

        fn abort(&mut self, job: JobId) {
            if let Some(flag) = self.aborts.remove(&job) {
                flag.store(true, Ordering::Release);
            }
        }

        fn poll(&mut self) -> Option<FetchOutcome> {
            loop {
                match self.result_rx.try_recv() {
                    Ok(outcome) => {
                        if self.aborts.remove(&outcome.job).is_some() {
                            return Some(outcome);
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
                }
            }
        }

        fn is_available(&self) -> bool {
            self.client.is_some()
        }

        fn set_user_agent(&mut self, user_agent: &str) {
            self.client = build_client(user_agent);
        }
    }
}

/// Fetcher matching the target: `reqwest` natively, nothing on wasm
pub fn default_fetcher(user_agent: &str) -> Box<dyn Fetcher> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        Box::new(HttpFetcher::new(user_agent))
    }

    #[cfg(target_arch = "wasm32")]
    {
        let _ = user_agent;
        Box::new(NullFetcher)
    }
}

/// Decode downloaded tile bytes
pub fn decode_tile_image(data: &[u8]) -> std::result::Result<image::RgbaImage, image::ImageError> {
    let img = image::load_from_memory(data)?;
    Ok(img.to_rgba8())
}

/// Read and decode a cached tile file
pub fn load_tile_file(path: &Path) -> Result<image::RgbaImage> {
    let data = std::fs::read(path)?;
    Ok(decode_tile_image(&data)?)
}

/// Body of a finished route or name request; `status` 0 means the transfer failed
pub fn read_reply(path: &Path, status: u16) -> Result<String> {
    match status {
        200 => Ok(std::fs::read_to_string(path)?),
        0 => Err(MapError::Transport("no response".to_string())),
        status => Err(MapError::HttpStatus(status)),
    }
}

/// Tile download bookkeeping: the worklist, in-flight jobs and load counters
///
/// The worklist is ordered by request time; passes walk it newest first.
#[derive(Debug)]
pub struct Downloader {
    worklist: Vec<TileId>,
    jobs: HashMap<JobId, TileId>,
    max_in_flight: usize,
    try_num: i32,
    finish_num: i32,
    running: bool,
}

impl Downloader {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            worklist: Vec::new(),
            jobs: HashMap::new(),
            max_in_flight,
            try_num: 0,
            finish_num: 0,
            running: false,
        }
    }

    /// Queue a tile, moving it to the newest position if already queued
    pub fn enqueue(&mut self, tile: TileId) {
        self.worklist.retain(|t| *t != tile);
        self.worklist.push(tile);
    }

    pub fn dequeue(&mut self, tile: TileId) -> bool {
        let before = self.worklist.len();
        self.worklist.retain(|t| *t != tile);
        before != self.worklist.len()
    }

    pub fn worklist(&self) -> &[TileId] {
        &self.worklist
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> TileId {
        self.worklist.remove(index)
    }

    pub fn clear_worklist(&mut self) {
        self.worklist.clear();
    }

    /// Start the recurring download pass
    pub fn wake(&mut self) {
        self.running = true;
    }

    pub fn sleep(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    pub fn has_slot(&self) -> bool {
        self.jobs.len() < self.max_in_flight
    }

    /// Record a started job
    pub fn started(&mut self, job: JobId, tile: TileId, events: &mut Vec<MapEvent>) {
        self.jobs.insert(job, tile);
        self.try_num += 1;
        events.push(MapEvent::TileLoad(tile));
        if self.jobs.len() == 1 {
            events.push(MapEvent::BusyStart);
        }
        log::debug!("Downloading tile {:?} ({} in flight)", tile, self.jobs.len());
    }

    /// Abort an in-flight job and return its slot
    pub fn cancel(&mut self, job: JobId, fetcher: &mut dyn Fetcher, events: &mut Vec<MapEvent>) {
        fetcher.abort(job);
        if let Some(tile) = self.jobs.remove(&job) {
            self.try_num -= 1;
            log::debug!("Cancelled tile {:?}", tile);
            if self.jobs.is_empty() {
                events.push(MapEvent::BusyStop);
            }
        }
    }

    /// Tile a completed job belongs to; `None` for unknown or cancelled jobs
    pub fn complete(&mut self, job: JobId) -> Option<TileId> {
        self.jobs.get(&job).copied()
    }

    /// Release the slot of a completed job after its result was handled
    pub fn release(&mut self, job: JobId, success: bool, events: &mut Vec<MapEvent>) {
        if self.jobs.remove(&job).is_none() {
            return;
        }
        if success {
            self.finish_num += 1;
        }
        if self.jobs.is_empty() {
            events.push(MapEvent::BusyStop);
        }
    }

    /// Abort every in-flight job without touching counters
    pub fn abort_all(&mut self, fetcher: &mut dyn Fetcher) {
        for job in self.jobs.keys() {
            fetcher.abort(*job);
        }
        self.jobs.clear();
        self.worklist.clear();
    }

    /// `(attempted, finished)` download counters
    pub fn load_status(&self) -> (i32, i32) {
        (self.try_num, self.finish_num)
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new(MAX_CONCURRENT_DOWNLOAD)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_reply_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("route-1");
        std::fs::write(&path, "<kml/>").unwrap();
        assert_eq!(read_reply(&path, 200).unwrap(), "<kml/>");
        assert!(matches!(read_reply(&path, 404), Err(MapError::HttpStatus(404))));
        assert!(matches!(read_reply(&path, 0), Err(MapError::Transport(_))));
        assert!(matches!(read_reply(&dir.path().join("missing"), 200), Err(MapError::Io(_))));
    }

    #[test]
    fn test_enqueue_moves_to_newest() {
        let mut downloader = Downloader::default();
        let a = TileId::new(0, 0, 1);
        let b = TileId::new(1, 0, 1);
        downloader.enqueue(a);
        downloader.enqueue(b);
        downloader.enqueue(a);
        assert_eq!(downloader.worklist(), &[b, a]);
        assert!(downloader.dequeue(b));
        assert!(!downloader.dequeue(b));
    }

    #[test]
    fn test_busy_signals_and_counters() {
        let mut downloader = Downloader::new(2);
        let mut fetcher = testing::ScriptedFetcher::default();
        let mut events = Vec::new();
        let tile = TileId::new(0, 0, 0);

        downloader.started(JobId(1), tile, &mut events);
        assert_eq!(events, vec![MapEvent::TileLoad(tile), MapEvent::BusyStart]);
        downloader.started(JobId(2), tile, &mut events);
        assert!(!downloader.has_slot());

        events.clear();
        downloader.cancel(JobId(2), &mut fetcher, &mut events);
        assert!(events.is_empty());
        assert_eq!(downloader.load_status(), (1, 0));

        assert_eq!(downloader.complete(JobId(1)), Some(tile));
        downloader.release(JobId(1), true, &mut events);
        assert_eq!(events, vec![MapEvent::BusyStop]);
        assert_eq!(downloader.load_status(), (1, 1));
        assert_eq!(downloader.complete(JobId(1)), None);
        assert_eq!(fetcher.0.borrow().aborted, vec![JobId(2)]);
    }

    #[test]
    fn test_decode_tile_image() {
        let mut png = Vec::new();
        image::RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 255]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_tile_image(&png).unwrap();
        assert_eq!(decoded.dimensions(), (2, 2));
        assert!(decode_tile_image(b"not a png").is_err());
    }

    #[test]
    fn test_null_fetcher_unavailable() {
        let mut fetcher = NullFetcher;
        assert!(!fetcher.is_available());
        let request = FetchRequest { url: "http://x".into(), dest: PathBuf::from("/tmp/x") };
        assert!(matches!(fetcher.start(request), Err(MapError::ProtocolUnavailable)));
    }
}
