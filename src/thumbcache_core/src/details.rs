//! File-system details cache.
//!
//! Same scheduler as the thumbnail cache, with a small worker pool and a
//! cheap per-item job: stat the file and, for JPEGs, read the dimensions
//! from the header without decoding pixels.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::warn;

use crate::config::QueueConfig;
use crate::decoder::read_jpeg_dimensions;
use crate::dispatch::{CacheKind, Dispatcher, Notification};
use crate::error::{CacheError, CacheResult};
use crate::scheduler::{Handler, Job, Scheduler};

/// Default worker count for details lookups.
pub const DEFAULT_DETAILS_WORKERS: usize = 2;

/// JPEG headers (SOF included) nearly always sit in the first 64 KiB.
const HEADER_SCAN_BYTES: u64 = 64 * 1024;

/// File-system details for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDetails {
    pub len: u64,
    pub modified: Option<SystemTime>,
    /// Pixel dimensions, when the file is a readable JPEG.
    pub dimensions: Option<(u32, u32)>,
}

/// Produces [`ItemDetails`] for a path.
pub trait DetailsProvider: Send + Sync {
    fn details(&self, path: &Path) -> CacheResult<ItemDetails>;
}

/// Reads metadata from the local file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDetailsProvider;

impl DetailsProvider for FsDetailsProvider {
    fn details(&self, path: &Path) -> CacheResult<ItemDetails> {
        let meta = std::fs::metadata(path)?;
        let dimensions = if meta.is_file() {
            let mut head = Vec::new();
            File::open(path)?.take(HEADER_SCAN_BYTES).read_to_end(&mut head)?;
            read_jpeg_dimensions(&head).ok()
        } else {
            None
        };
        Ok(ItemDetails {
            len: meta.len(),
            modified: meta.modified().ok(),
            dimensions,
        })
    }
}

#[derive(Debug)]
pub struct DetailsRequest {
    path: PathBuf,
}

impl Job for DetailsRequest {
    type Key = PathBuf;

    fn key(&self) -> &PathBuf {
        &self.path
    }
}

#[derive(Default)]
pub struct DetailsState {
    details: HashMap<PathBuf, ItemDetails>,
    failed: HashSet<PathBuf>,
}

pub struct DetailsWorker {
    provider: Arc<dyn DetailsProvider>,
}

impl Handler for DetailsWorker {
    type Job = DetailsRequest;
    type Output = CacheResult<ItemDetails>;
    type State = DetailsState;

    const KIND: CacheKind = CacheKind::Details;

    fn accept(&self, state: &DetailsState, job: &DetailsRequest) -> bool {
        !state.details.contains_key(&job.path) && !state.failed.contains(&job.path)
    }

    fn process(&self, job: &DetailsRequest) -> Option<CacheResult<ItemDetails>> {
        Some(self.provider.details(&job.path))
    }

    fn recover(&self, _job: &DetailsRequest, panic: &str) -> Option<CacheResult<ItemDetails>> {
        Some(Err(CacheError::Decode(format!("details provider panicked: {panic}"))))
    }

    fn publish(
        &self,
        state: &mut DetailsState,
        job: DetailsRequest,
        output: CacheResult<ItemDetails>,
    ) -> Vec<Notification> {
        match output {
            Ok(details) => {
                state.details.insert(job.path.clone(), details);
                vec![Notification::DetailsReady { path: job.path }]
            }
            Err(e) => {
                warn!("details of {} failed: {e}", job.path.display());
                let key = job.path.display().to_string();
                state.failed.insert(job.path);
                vec![Notification::CacheError {
                    key,
                    error: Arc::new(e),
                    source: CacheKind::Details,
                }]
            }
        }
    }
}

/// Asynchronous cache of [`ItemDetails`] keyed by path.
pub struct DetailsCache {
    scheduler: Scheduler<DetailsWorker>,
}

impl DetailsCache {
    /// Cache backed by [`FsDetailsProvider`] with the default worker pool.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> CacheResult<Self> {
        Self::with_provider(
            Arc::new(FsDetailsProvider),
            dispatcher,
            QueueConfig::new(1, DEFAULT_DETAILS_WORKERS),
        )
    }

    pub fn with_provider(
        provider: Arc<dyn DetailsProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        config: QueueConfig,
    ) -> CacheResult<Self> {
        let scheduler = Scheduler::new(
            "thumbcache-details",
            DetailsWorker { provider },
            DetailsState::default(),
            config,
            dispatcher,
        )?;
        Ok(Self { scheduler })
    }

    /// Queue a lookup for `path`. No-op if it is already known.
    pub fn add(&self, path: impl Into<PathBuf>) -> CacheResult<bool> {
        let lane = self.scheduler.config().normal_lane();
        self.scheduler.enqueue(DetailsRequest { path: path.into() }, lane)
    }

    pub fn get(&self, path: &Path) -> Option<ItemDetails> {
        self.scheduler.with_state(|st| st.details.get(path).cloned())
    }

    /// Forget `path` so the next `add` looks it up again.
    pub fn remove(&self, path: &Path) -> bool {
        self.scheduler.cancel(&path.to_path_buf());
        self.scheduler.with_state(|st| {
            let had = st.details.remove(path).is_some();
            st.failed.remove(path) || had
        })
    }

    pub fn clear(&self) {
        self.scheduler.cancel_all();
        self.scheduler.with_state(|st| {
            st.details.clear();
            st.failed.clear();
        });
    }

    pub fn len(&self) -> usize {
        self.scheduler.with_state(|st| st.details.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }
}
