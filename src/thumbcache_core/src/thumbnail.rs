//! Asynchronous thumbnail cache.
//!
//! `add` never decodes on the caller's thread: it queues a request on a
//! dedicated worker, which checks visibility (on-demand mode), decodes
//! outside the lock, and publishes the result into the [`CacheStore`].
//! A separate single-slot preview cache holds one large image outside the
//! bounded store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::cache::{CacheStats, CacheStore, EntryState};
use crate::config::{CacheConfig, CacheLimit, CacheMode, QueueConfig};
use crate::decoder::{Decoder, Payload};
use crate::dispatch::{CacheKind, Dispatcher, Notification};
use crate::error::{CacheError, CacheResult};
use crate::key::{EmbeddedPolicy, ItemKey, ThumbSize, VirtualKey};
use crate::scheduler::{Handler, Job, Scheduler};
use crate::visibility::VisibilityOracle;

/// Check if per-decode timing logs are enabled via env var.
fn decode_timing_enabled() -> bool {
    std::env::var("THUMBCACHE_TIMING").is_ok_and(|v| v == "1" || v == "true")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Store,
    Preview,
}

/// A queued thumbnail request.
#[derive(Debug)]
pub struct ThumbRequest {
    key: ItemKey,
    size: ThumbSize,
    policy: EmbeddedPolicy,
    target: Target,
    /// Set at dequeue time from the cache mode.
    check_visibility: bool,
}

impl Job for ThumbRequest {
    type Key = ItemKey;

    fn key(&self) -> &ItemKey {
        &self.key
    }
}

/// The single preview slot.
#[derive(Debug, Clone)]
struct PreviewSlot {
    key: ItemKey,
    size: ThumbSize,
    payload: Payload,
}

/// Cache state guarded by the scheduler lock.
pub struct ThumbState {
    store: CacheStore,
    mode: CacheMode,
    retry_on_error: bool,
    preview: Option<PreviewSlot>,
}

/// Worker side of the thumbnail cache.
pub struct ThumbWorker {
    decoder: Arc<dyn Decoder>,
    oracle: Arc<dyn VisibilityOracle>,
    timing: bool,
}

impl Handler for ThumbWorker {
    type Job = ThumbRequest;
    type Output = CacheResult<Payload>;
    type State = ThumbState;

    const KIND: CacheKind = CacheKind::Thumbnail;

    fn accept(&self, state: &ThumbState, job: &ThumbRequest) -> bool {
        match job.target {
            Target::Store => !state.store.is_satisfied(&job.key, job.size, job.policy),
            Target::Preview => true,
        }
    }

    fn admit(&self, state: &mut ThumbState, job: &mut ThumbRequest) -> bool {
        if job.target == Target::Store && state.store.is_editing(&job.key) {
            debug!("{} is being edited, request dropped", job.key);
            return false;
        }
        job.check_visibility = job.target == Target::Store && state.mode == CacheMode::OnDemand;
        true
    }

    fn process(&self, job: &ThumbRequest) -> Option<CacheResult<Payload>> {
        if job.check_visibility && !self.oracle.is_visible(&job.key) {
            return None;
        }

        let t0 = self.timing.then(Instant::now);
        let result = match &job.key {
            ItemKey::Path(path) => self.decoder.decode(path, job.size, job.policy),
            ItemKey::Virtual(key) => self.decoder.decode_virtual(key, job.size),
        };
        if let Some(t) = t0 {
            debug!("[DECODE TIMING] {} {} total={:.2?}", job.key, job.size, t.elapsed());
        }
        Some(result)
    }

    fn recover(&self, _job: &ThumbRequest, panic: &str) -> Option<CacheResult<Payload>> {
        Some(Err(CacheError::Decode(format!("decoder panicked: {panic}"))))
    }

    fn publish(
        &self,
        state: &mut ThumbState,
        job: ThumbRequest,
        output: CacheResult<Payload>,
    ) -> Vec<Notification> {
        let ThumbRequest {
            key,
            size,
            policy,
            target,
            ..
        } = job;

        if target == Target::Preview {
            return match output {
                Ok(payload) => {
                    state.preview = Some(PreviewSlot {
                        key: key.clone(),
                        size,
                        payload,
                    });
                    vec![Notification::PreviewReady { key, size }]
                }
                Err(e) => {
                    warn!("preview of {key} failed: {e}");
                    vec![Notification::CacheError {
                        key: key.to_string(),
                        error: Arc::new(e),
                        source: CacheKind::Preview,
                    }]
                }
            };
        }

        if state.store.is_editing(&key) {
            debug!("{key} is being edited, result discarded");
            return Vec::new();
        }

        match output {
            Ok(payload) => {
                state
                    .store
                    .insert_payload(key.clone(), size, policy, payload, self.oracle.as_ref());
                vec![Notification::ItemCached {
                    key,
                    size,
                    error: None,
                }]
            }
            Err(e) => {
                warn!("thumbnail of {key} failed: {e}");
                if !state.retry_on_error {
                    state
                        .store
                        .insert_error(key.clone(), size, policy, self.oracle.as_ref());
                }
                let error = Arc::new(e);
                vec![
                    Notification::ItemCached {
                        key: key.clone(),
                        size,
                        error: Some(Arc::clone(&error)),
                    },
                    Notification::CacheError {
                        key: key.to_string(),
                        error,
                        source: CacheKind::Thumbnail,
                    },
                ]
            }
        }
    }
}

/// Thumbnail cache with one dedicated background worker by default.
///
/// Usage:
/// ```no_run
/// use std::sync::Arc;
/// use thumbcache_core::{
///     notification_channel, CacheConfig, EmbeddedPolicy, FsDecoder, ThumbSize, ThumbnailCache,
///     VisibleSet,
/// };
///
/// let visible = Arc::new(VisibleSet::new());
/// let (dispatcher, events) = notification_channel();
/// let cache = ThumbnailCache::new(
///     Arc::new(FsDecoder::new()),
///     visible.clone(),
///     Arc::new(dispatcher),
///     CacheConfig::default(),
/// )
/// .unwrap();
///
/// cache.add("/photos/a.jpg", ThumbSize::new(96, 96), EmbeddedPolicy::Auto).unwrap();
/// for event in events.drain() {
///     println!("{event:?}");
/// }
/// ```
pub struct ThumbnailCache {
    scheduler: Scheduler<ThumbWorker>,
}

impl ThumbnailCache {
    /// Create a cache. Workers start with the first request.
    pub fn new(
        decoder: Arc<dyn Decoder>,
        oracle: Arc<dyn VisibilityOracle>,
        dispatcher: Arc<dyn Dispatcher>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        let worker = ThumbWorker {
            decoder,
            oracle,
            timing: decode_timing_enabled(),
        };
        let state = ThumbState {
            store: CacheStore::new(config.limit),
            mode: config.mode,
            retry_on_error: config.retry_on_error,
            preview: None,
        };
        let scheduler = Scheduler::new("thumbcache", worker, state, config.queue, dispatcher)?;
        Ok(Self { scheduler })
    }

    /// Queue a thumbnail for the file at `path` on the normal lane.
    ///
    /// No-op if a finished entry for the same size and policy exists.
    pub fn add(&self, path: impl Into<PathBuf>, size: ThumbSize, policy: EmbeddedPolicy) -> CacheResult<bool> {
        let priority = self.normal_lane();
        self.add_with_priority(ItemKey::Path(path.into()), size, policy, priority)
    }

    /// Queue a thumbnail for a virtual item on the normal lane.
    pub fn add_virtual(&self, key: VirtualKey, size: ThumbSize, policy: EmbeddedPolicy) -> CacheResult<bool> {
        let priority = self.normal_lane();
        self.add_with_priority(ItemKey::Virtual(key), size, policy, priority)
    }

    /// Queue a thumbnail on lane `priority` (0 is highest).
    pub fn add_with_priority(
        &self,
        key: ItemKey,
        size: ThumbSize,
        policy: EmbeddedPolicy,
        priority: usize,
    ) -> CacheResult<bool> {
        self.scheduler.enqueue(
            ThumbRequest {
                key,
                size,
                policy,
                target: Target::Store,
                check_visibility: false,
            },
            priority,
        )
    }

    /// Queue a large preview image into the single preview slot.
    pub fn add_preview(&self, key: ItemKey, size: ThumbSize) -> CacheResult<bool> {
        self.scheduler.enqueue(
            ThumbRequest {
                key,
                size,
                policy: EmbeddedPolicy::Never,
                target: Target::Preview,
                check_visibility: false,
            },
            0,
        )
    }

    /// Preview payload, if the slot currently holds `key`.
    pub fn get_preview(&self, key: &ItemKey) -> Option<Payload> {
        self.scheduler.with_state(|st| {
            st.preview
                .as_ref()
                .filter(|slot| &slot.key == key)
                .map(|slot| slot.payload.clone())
        })
    }

    /// Size the preview slot was generated at, if it holds `key`.
    pub fn preview_size(&self, key: &ItemKey) -> Option<ThumbSize> {
        self.scheduler.with_state(|st| {
            st.preview
                .as_ref()
                .filter(|slot| &slot.key == key)
                .map(|slot| slot.size)
        })
    }

    fn normal_lane(&self) -> usize {
        self.scheduler.config().normal_lane()
    }

    /// Remove `key`, immediately or through the batched evictor.
    pub fn remove(&self, key: &ItemKey, now: bool) -> bool {
        let oracle = self.scheduler.handler().oracle.as_ref();
        self.scheduler.with_state(|st| st.store.remove(key, now, oracle))
    }

    /// Mark every cached thumbnail stale without dropping it.
    pub fn rebuild(&self) {
        self.scheduler.with_state(|st| st.store.rebuild());
    }

    /// Drop every thumbnail, the preview and every queued request.
    pub fn clear(&self) {
        self.scheduler.cancel_all();
        self.scheduler.with_state(|st| {
            st.store.clear();
            st.preview = None;
        });
    }

    /// Thumbnail for `key`. `clone` returns a private copy of the pixels.
    pub fn get_image(&self, key: &ItemKey, clone: bool) -> Option<Payload> {
        self.scheduler.with_state(|st| st.store.get_image(key, clone))
    }

    /// Lifecycle state of `key`; unknown keys report [`EntryState::Unknown`].
    pub fn get_state(&self, key: &ItemKey) -> EntryState {
        self.scheduler.with_state(|st| st.store.state(key))
    }

    /// Protect `key` from being overwritten by workers until [`end_edit`](Self::end_edit).
    pub fn begin_edit(&self, key: ItemKey) {
        self.scheduler.with_state(|st| st.store.begin_edit(key));
    }

    /// Let workers write `key` again. Requests dropped meanwhile must be re-added.
    pub fn end_edit(&self, key: &ItemKey) {
        self.scheduler.with_state(|st| st.store.end_edit(key));
    }

    /// Drop queued requests for `key` and discard an in-flight result.
    pub fn cancel(&self, key: &ItemKey) -> usize {
        self.scheduler.cancel(key)
    }

    /// Drop every request queued in lane `priority`.
    pub fn cancel_lane(&self, priority: usize) -> CacheResult<usize> {
        self.scheduler.cancel_lane(priority)
    }

    /// Whether off-screen requests are decoded.
    pub fn cache_mode(&self) -> CacheMode {
        self.scheduler.with_state(|st| st.mode)
    }

    pub fn set_cache_mode(&self, mode: CacheMode) {
        self.scheduler.with_state(|st| st.mode = mode);
    }

    /// Current bound on the store.
    pub fn limit(&self) -> CacheLimit {
        self.scheduler.with_state(|st| st.store.limit())
    }

    /// Bound the store by item count. Clears any memory limit and forces on-demand mode.
    pub fn set_limit_items(&self, items: usize) {
        self.set_limit(CacheLimit::Items(items));
    }

    /// Bound the store by decoded bytes. Clears any item limit and forces on-demand mode.
    pub fn set_limit_bytes(&self, bytes: u64) {
        self.set_limit(CacheLimit::Bytes(bytes));
    }

    fn set_limit(&self, limit: CacheLimit) {
        self.scheduler.with_state(|st| {
            st.store.set_limit(limit);
            st.mode = CacheMode::OnDemand;
        });
    }

    /// Whether failed items are decoded again on the next request.
    pub fn retry_on_error(&self) -> bool {
        self.scheduler.with_state(|st| st.retry_on_error)
    }

    pub fn set_retry_on_error(&self, retry: bool) {
        self.scheduler.with_state(|st| st.retry_on_error = retry);
    }

    /// Change lanes, workers or lane order. Fails once a request has been queued.
    pub fn set_queue_config(&self, config: QueueConfig) -> CacheResult<()> {
        self.scheduler.configure(config)
    }

    pub fn stats(&self) -> CacheStats {
        let queued = self.scheduler.queued();
        let mut stats = self.scheduler.with_state(|st| st.store.stats());
        stats.queued = queued;
        stats
    }

    pub fn reset_stats(&self) {
        self.scheduler.with_state(|st| st.store.reset_stats());
    }

    /// Whether nothing is queued or being decoded.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Ask the worker to exit after its current decode. Idempotent.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }

    /// Stop, wait for the worker and release every payload.
    pub fn dispose(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        self.scheduler.join();
        self.scheduler.with_state(|st| {
            st.store.clear();
            st.preview = None;
        });
    }

    /// Run `f` against the store, e.g. to inspect accounting.
    pub fn with_store<R>(&self, f: impl FnOnce(&CacheStore) -> R) -> R {
        self.scheduler.with_state(|st| f(&st.store))
    }
}

impl Drop for ThumbnailCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
