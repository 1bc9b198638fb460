//! Viewer-side chunk loading.
//!
//! The manager owns one state machine per chunk and drives every transition
//! on the caller's task. Fetches cross the process-internal request boundary
//! on a small pool of worker threads; the pool width is the concurrency cap,
//! so at most `fetch_slots` chunks are ever in flight. Replies are settled
//! one at a time on the manager task: parse, upload, notify, then start the
//! next queued chunk. No timers are involved.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::blob;
use crate::error::Result;
use crate::types::ImageMetadata;
use crate::viewer::gpu::TextureUploader;
use crate::viewer::scheduler;

/// The fetch half of the viewer/backend boundary. Implemented by the chunk
/// server as a local call.
pub trait ChunkTransport: Send + Sync + 'static {
    fn fetch_chunk(&self, path: &str, cx: u32, cy: u32) -> Result<Vec<u8>>;
}

/// Default number of in-flight chunk fetches. Small on purpose: it bounds
/// peak CPU memory to `slots * chunk_size^2 * 4` bytes plus the incoming
/// blob, and keeps the request boundary and the upload path from saturating.
pub const DEFAULT_FETCH_SLOTS: usize = 3;

/// Lifecycle of one chunk. The texture handle lives only in `InGpu`; any
/// transition out of `InGpu` drops it.
enum ChunkState<Tex> {
    Unrequested,
    Requesting,
    InCpu {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
    InGpu {
        texture: Tex,
    },
    Failed {
        kind: &'static str,
    },
}

/// Status tag exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Unrequested,
    Requesting,
    InCpu,
    InGpu,
    Failed,
}

/// Per-variant population counts, for status readouts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusStats {
    pub unrequested: usize,
    pub requesting: usize,
    pub in_cpu: usize,
    pub in_gpu: usize,
    pub failed: usize,
}

struct ChunkSlot<Tex> {
    state: ChunkState<Tex>,
    last_access: Instant,
}

impl<Tex> ChunkSlot<Tex> {
    fn status(&self) -> ChunkStatus {
        match self.state {
            ChunkState::Unrequested => ChunkStatus::Unrequested,
            ChunkState::Requesting => ChunkStatus::Requesting,
            ChunkState::InCpu { .. } => ChunkStatus::InCpu,
            ChunkState::InGpu { .. } => ChunkStatus::InGpu,
            ChunkState::Failed { .. } => ChunkStatus::Failed,
        }
    }
}

struct FetchJob {
    path: Arc<str>,
    cx: u32,
    cy: u32,
}

struct FetchDone {
    cx: u32,
    cy: u32,
    result: Result<Vec<u8>>,
}

struct Session<Tex> {
    path: Arc<str>,
    metadata: ImageMetadata,
    slots: HashMap<(u32, u32), ChunkSlot<Tex>>,
    pending: VecDeque<(u32, u32)>,
    in_flight: usize,
    /// `InGpu` arrivals in order, so the ready callback and `loaded_chunks`
    /// reflect upload order.
    ready_order: Vec<(u32, u32)>,
}

pub struct ChunkManager<U: TextureUploader> {
    uploader: U,
    fetch_slots: usize,
    tx_job: Option<Sender<FetchJob>>,
    rx_done: Receiver<FetchDone>,
    workers: Vec<JoinHandle<()>>,
    session: Option<Session<U::Texture>>,
    on_ready: Option<Box<dyn FnMut(u32, u32)>>,
}

impl<U: TextureUploader> ChunkManager<U> {
    /// Spawn the fetch pool. `fetch_slots` worker threads share one job
    /// queue and keep the transport alive; the manager never hands out more
    /// jobs than it has workers.
    pub fn new<T: ChunkTransport>(transport: Arc<T>, uploader: U, fetch_slots: usize) -> Self {
        let fetch_slots = fetch_slots.max(1);
        let (tx_job, rx_job) = unbounded::<FetchJob>();
        let (tx_done, rx_done) = unbounded::<FetchDone>();

        let workers = (0..fetch_slots)
            .map(|_| {
                let transport = transport.clone();
                let rx_job = rx_job.clone();
                let tx_done = tx_done.clone();
                std::thread::spawn(move || {
                    while let Ok(job) = rx_job.recv() {
                        let result = transport.fetch_chunk(&job.path, job.cx, job.cy);
                        let done = FetchDone {
                            cx: job.cx,
                            cy: job.cy,
                            result,
                        };
                        if tx_done.send(done).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        ChunkManager {
            uploader,
            fetch_slots,
            tx_job: Some(tx_job),
            rx_done,
            workers,
            session: None,
            on_ready: None,
        }
    }

    /// Install a source and build one `Unrequested` slot per chunk. A bad
    /// metadata record is rejected before any state exists, and any previous
    /// session is torn down first.
    pub fn initialize(&mut self, path: &str, metadata: ImageMetadata) -> Result<()> {
        metadata.validate()?;
        if self.session.is_some() {
            self.cleanup();
        }

        let now = Instant::now();
        let slots = metadata
            .chunks
            .iter()
            .map(|c| {
                (
                    (c.cx, c.cy),
                    ChunkSlot {
                        state: ChunkState::Unrequested,
                        last_access: now,
                    },
                )
            })
            .collect();

        debug!(
            "viewer session start path={} grid={}x{} chunks={}",
            path,
            metadata.chunks_x,
            metadata.chunks_y,
            metadata.chunk_count()
        );

        self.session = Some(Session {
            path: Arc::from(path),
            metadata,
            slots,
            pending: VecDeque::new(),
            in_flight: 0,
            ready_order: Vec::new(),
        });
        Ok(())
    }

    /// Callback fired on the manager task each time a chunk reaches `InGpu`,
    /// exactly once per chunk.
    pub fn set_on_ready(&mut self, cb: impl FnMut(u32, u32) + 'static) {
        self.on_ready = Some(Box::new(cb));
    }

    /// Queue a chunk for loading. Idempotent: anything already requested,
    /// resident, or failed is left alone.
    pub fn request(&mut self, cx: u32, cy: u32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(slot) = session.slots.get_mut(&(cx, cy)) else {
            debug!("request for unknown chunk cx={} cy={}", cx, cy);
            return;
        };
        if !matches!(slot.state, ChunkState::Unrequested) {
            return;
        }
        slot.last_access = Instant::now();
        session.pending.push_back((cx, cy));
    }

    /// Run the pump until the queue is empty and nothing is in flight.
    /// Every settle (success or failure) frees a slot and immediately starts
    /// the next queued chunk.
    pub fn drain(&mut self) {
        loop {
            self.start_pending();
            let in_flight = self.session.as_ref().map_or(0, |s| s.in_flight);
            if in_flight == 0 {
                break;
            }
            match self.rx_done.recv() {
                Ok(done) => self.settle(done),
                Err(_) => break,
            }
        }
    }

    /// Load the whole grid in the four spatial parity batches. Batch k+1 is
    /// not started until every request of batch k has settled.
    pub fn run_batches(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let batches =
            scheduler::parity_batches(session.metadata.chunks_x, session.metadata.chunks_y);
        for batch in batches {
            for (cx, cy) in batch {
                self.request(cx, cy);
            }
            self.drain();
        }
    }

    /// All chunks currently resident on the GPU, in upload order.
    pub fn loaded_chunks(&self) -> Vec<(u32, u32)> {
        self.session
            .as_ref()
            .map(|s| s.ready_order.clone())
            .unwrap_or_default()
    }

    pub fn texture(&self, cx: u32, cy: u32) -> Option<&U::Texture> {
        let slot = self.session.as_ref()?.slots.get(&(cx, cy))?;
        match &slot.state {
            ChunkState::InGpu { texture } => Some(texture),
            _ => None,
        }
    }

    pub fn chunk_status(&self, cx: u32, cy: u32) -> Option<ChunkStatus> {
        Some(self.session.as_ref()?.slots.get(&(cx, cy))?.status())
    }

    /// When this chunk's state last changed (or was last queried).
    pub fn last_access(&self, cx: u32, cy: u32) -> Option<Instant> {
        Some(self.session.as_ref()?.slots.get(&(cx, cy))?.last_access)
    }

    /// Error kind tag for a failed chunk.
    pub fn failure_kind(&self, cx: u32, cy: u32) -> Option<&'static str> {
        match &self.session.as_ref()?.slots.get(&(cx, cy))?.state {
            ChunkState::Failed { kind } => Some(kind),
            _ => None,
        }
    }

    pub fn status_stats(&self) -> StatusStats {
        let mut stats = StatusStats::default();
        if let Some(session) = &self.session {
            for slot in session.slots.values() {
                match slot.status() {
                    ChunkStatus::Unrequested => stats.unrequested += 1,
                    ChunkStatus::Requesting => stats.requesting += 1,
                    ChunkStatus::InCpu => stats.in_cpu += 1,
                    ChunkStatus::InGpu => stats.in_gpu += 1,
                    ChunkStatus::Failed => stats.failed += 1,
                }
            }
        }
        stats
    }

    /// Tear down the session: wait for in-flight fetches to settle, then
    /// drop all per-chunk state and its textures.
    pub fn cleanup(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.pending.clear();
        while session.in_flight > 0 {
            match self.rx_done.recv() {
                Ok(_) => session.in_flight -= 1,
                Err(_) => break,
            }
        }
        self.session = None;
        debug!("viewer session cleaned up");
    }

    fn start_pending(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(tx_job) = self.tx_job.as_ref() else {
            return;
        };
        while session.in_flight < self.fetch_slots {
            let Some((cx, cy)) = session.pending.pop_front() else {
                break;
            };
            let slot = session
                .slots
                .get_mut(&(cx, cy))
                .expect("pending chunk has a slot");
            // A chunk queued twice before the pump ran is started once.
            if !matches!(slot.state, ChunkState::Unrequested) {
                continue;
            }
            slot.state = ChunkState::Requesting;
            slot.last_access = Instant::now();
            session.in_flight += 1;
            let job = FetchJob {
                path: session.path.clone(),
                cx,
                cy,
            };
            if tx_job.send(job).is_err() {
                session.in_flight -= 1;
                break;
            }
        }
    }

    fn settle(&mut self, done: FetchDone) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.in_flight -= 1;
        let id = (done.cx, done.cy);
        let Some(slot) = session.slots.get_mut(&id) else {
            return;
        };

        let parsed = match done.result.and_then(|bytes| blob::parse_blob(&bytes)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "chunk failed cx={} cy={} kind={} err={}",
                    done.cx,
                    done.cy,
                    e.kind(),
                    e
                );
                slot.state = ChunkState::Failed { kind: e.kind() };
                slot.last_access = Instant::now();
                return;
            }
        };

        // The blob's own header sizes the upload; for edge tiles it is the
        // authority over the metadata record.
        slot.state = ChunkState::InCpu {
            width: parsed.width,
            height: parsed.height,
            pixels: parsed.pixels,
        };
        slot.last_access = Instant::now();

        let uploaded = match &slot.state {
            ChunkState::InCpu {
                width,
                height,
                pixels,
            } => self.uploader.upload_rgba8(*width, *height, pixels),
            _ => unreachable!(),
        };

        match uploaded {
            Ok(texture) => {
                // Replacing the state drops the CPU pixel copy.
                slot.state = ChunkState::InGpu { texture };
                slot.last_access = Instant::now();
                session.ready_order.push(id);
                if let Some(cb) = self.on_ready.as_mut() {
                    cb(done.cx, done.cy);
                }
            }
            Err(e) => {
                warn!(
                    "chunk upload failed cx={} cy={} kind={} err={}",
                    done.cx,
                    done.cy,
                    e.kind(),
                    e
                );
                slot.state = ChunkState::Failed { kind: e.kind() };
                slot.last_access = Instant::now();
            }
        }
    }
}

impl<U: TextureUploader> Drop for ChunkManager<U> {
    fn drop(&mut self) {
        self.cleanup();
        // Closing the job channel lets the workers run off the end.
        self.tx_job.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
