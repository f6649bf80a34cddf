//! Procedural tile sources rendered on a background thread pool.
//!
//! Requests are queued on a channel shared by the workers. Each carries a
//! cancellation flag checked before and after rendering, so a tile the
//! quadtree gave up on is neither rendered nor delivered when avoidable.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use glam::DVec2;
use tracing::{debug, trace, warn};

use orbis_config::LayerSource;
use orbis_quadtree::{
    RequestToken, TerrainHeights, TileCallback, TileError, TileKind, TilePayload, TileProvider,
    TileRequest,
};
use orbis_render::TileImage;

/// Edge length of generated imagery tiles, in pixels.
pub const TILE_SIZE: u32 = 128;

/// Samples per side of generated terrain tiles.
pub const TERRAIN_SAMPLES: u32 = 17;

/// What a procedural provider draws.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TileSource {
    Imagery(LayerSource),
    /// Rolling hills of the given amplitude, in meters.
    Terrain { amplitude_m: f32 },
}

struct Job {
    request: TileRequest,
    source: TileSource,
    on_complete: TileCallback,
    cancelled: Arc<AtomicBool>,
}

type ActiveJobs = Arc<DashMap<RequestToken, Arc<AtomicBool>>>;

/// Threads rendering tiles off the frame loop.
pub struct TileWorkerPool {
    jobs: Sender<Job>,
    // Keeps the queue open when no worker is running.
    _queue: Receiver<Job>,
    active: ActiveJobs,
    in_flight: Arc<AtomicU64>,
    threads: usize,
}

impl TileWorkerPool {
    /// Spawn `thread_count` workers. Zero is allowed; jobs then wait forever.
    pub fn new(thread_count: usize) -> io::Result<Self> {
        let (jobs, receiver) = unbounded::<Job>();
        let active: ActiveJobs = Arc::new(DashMap::new());
        let in_flight = Arc::new(AtomicU64::new(0));

        for i in 0..thread_count {
            let receiver = receiver.clone();
            let active = Arc::clone(&active);
            let in_flight = Arc::clone(&in_flight);
            std::thread::Builder::new()
                .name(format!("tile-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        run_job(job, &active);
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                    }
                })?;
        }
        debug!("Tile worker pool started with {thread_count} threads");

        Ok(Self {
            jobs,
            _queue: receiver,
            active,
            in_flight,
            threads: thread_count,
        })
    }

    /// All cores but the one running the frame loop.
    pub fn with_defaults() -> io::Result<Self> {
        let threads = num_cpus::get().saturating_sub(1).max(1);
        Self::new(threads)
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }

    fn submit(&self, request: TileRequest, source: TileSource, on_complete: TileCallback) {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.active.insert(request.token, Arc::clone(&cancelled));
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        let job = Job {
            request,
            source,
            on_complete,
            cancelled,
        };
        if let Err(e) = self.jobs.send(job) {
            let job = e.into_inner();
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.active.remove(&job.request.token);
            warn!("Tile workers are gone, failing request {}", job.request.token.0);
            (job.on_complete)(Err(TileError::Provider("tile workers stopped".into())));
        }
    }

    /// Stop a queued or running job. Finished jobs are unaffected.
    pub fn cancel(&self, token: RequestToken) {
        if let Some((_, flag)) = self.active.remove(&token) {
            flag.store(true, Ordering::Relaxed);
            trace!(token = token.0, "Tile job cancelled");
        }
    }

    pub fn is_pending(&self, token: RequestToken) -> bool {
        self.active.contains_key(&token)
    }

    /// Jobs queued or running.
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

fn run_job(job: Job, active: &ActiveJobs) {
    if job.cancelled.load(Ordering::Relaxed) {
        return;
    }
    let result = render_tile(job.source, &job.request);
    active.remove(&job.request.token);
    if !job.cancelled.load(Ordering::Relaxed) {
        (job.on_complete)(result);
    }
}

/// A [`TileProvider`] drawing one [`TileSource`] on a shared pool.
pub struct ProceduralProvider {
    source: TileSource,
    pool: Arc<TileWorkerPool>,
}

impl ProceduralProvider {
    pub fn new(source: TileSource, pool: Arc<TileWorkerPool>) -> Self {
        Self { source, pool }
    }

    pub fn source(&self) -> TileSource {
        self.source
    }
}

impl TileProvider for ProceduralProvider {
    fn request_tile(&self, request: TileRequest, on_complete: TileCallback) -> RequestToken {
        let token = request.token;
        self.pool.submit(request, self.source, on_complete);
        token
    }

    fn cancel(&self, token: RequestToken) {
        self.pool.cancel(token);
    }
}

/// Render one tile synchronously.
pub fn render_tile(source: TileSource, request: &TileRequest) -> Result<TilePayload, TileError> {
    match (source, request.kind) {
        (TileSource::Imagery(layer), TileKind::Imagery(_)) => Ok(TilePayload::Imagery(
            render_imagery(layer, request, TILE_SIZE),
        )),
        (TileSource::Terrain { amplitude_m }, TileKind::Terrain) => Ok(TilePayload::Terrain(
            render_terrain(amplitude_m, request, TERRAIN_SAMPLES)?,
        )),
        (TileSource::Imagery(_), TileKind::Terrain) => Err(TileError::Provider(
            "imagery source cannot serve terrain".into(),
        )),
        (TileSource::Terrain { .. }, TileKind::Imagery(_)) => Err(TileError::Provider(
            "terrain source cannot serve imagery".into(),
        )),
    }
}

/// Longitude/latitude at the fractional tile position `(u, v)`, `v` running
/// from the north edge.
fn lon_lat_at(request: &TileRequest, u: f64, v: f64) -> DVec2 {
    let e = &request.extent;
    let p = DVec2::new(
        e.west() + u * e.width(),
        e.north() - v * e.height(),
    );
    request.projection.to_lon_lat(p)
}

/// Border color of a tile, cycling with depth.
fn depth_color(depth: u8) -> [u8; 3] {
    const PALETTE: [[u8; 3]; 6] = [
        [230, 60, 60],
        [240, 170, 40],
        [220, 220, 60],
        [70, 200, 90],
        [60, 150, 230],
        [170, 90, 220],
    ];
    PALETTE[usize::from(depth) % PALETTE.len()]
}

fn render_imagery(layer: LayerSource, request: &TileRequest, size: u32) -> TileImage {
    let inv = 1.0 / f64::from(size);
    match layer {
        LayerSource::Checkerboard => {
            let (light, dark) = if request.depth % 2 == 0 {
                ([235, 235, 235, 255], [60, 60, 60, 255])
            } else {
                ([200, 220, 240, 255], [40, 60, 90, 255])
            };
            let cell = (size / 8).max(1);
            TileImage::from_fn(size, size, |x, y| {
                if (x / cell + y / cell) % 2 == 0 { light } else { dark }
            })
        }
        LayerSource::Gradient => TileImage::from_fn(size, size, |x, y| {
            let ll = lon_lat_at(request, (f64::from(x) + 0.5) * inv, (f64::from(y) + 0.5) * inv);
            let r = ((ll.x + 180.0) / 360.0 * 255.0).clamp(0.0, 255.0) as u8;
            let g = ((ll.y + 90.0) / 180.0 * 255.0).clamp(0.0, 255.0) as u8;
            [r, g, 160, 255]
        }),
        LayerSource::TileGrid => {
            let [r, g, b] = depth_color(request.depth);
            let border = (size / 64).max(1);
            TileImage::from_fn(size, size, |x, y| {
                let edge = x < border || y < border || x >= size - border || y >= size - border;
                if edge { [r, g, b, 255] } else { [0, 0, 0, 0] }
            })
        }
    }
}

fn render_terrain(
    amplitude_m: f32,
    request: &TileRequest,
    samples: u32,
) -> Result<TerrainHeights, TileError> {
    let step = 1.0 / f64::from(samples - 1);
    let mut heights = Vec::with_capacity((samples * samples) as usize);
    for row in 0..samples {
        for col in 0..samples {
            let ll = lon_lat_at(request, f64::from(col) * step, f64::from(row) * step);
            let (lon, lat) = (ll.x.to_radians(), ll.y.to_radians());
            let h = (3.0 * lon).sin() * (2.0 * lat).cos() * 0.5 + 0.5;
            heights.push(amplitude_m * h as f32);
        }
    }
    TerrainHeights::new(samples, heights)
}
