//! Cache and scheduler configuration.
//!
//! Configuration can be built in code or loaded from a JSON file:
//!
//! ```json
//! { "mode": "on_demand", "limit": { "items": 200 }, "retry_on_error": true }
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Default memory limit for thumbnails: 20 MiB of decoded pixels.
pub const DEFAULT_LIMIT_BYTES: u64 = 20 * 1024 * 1024;

/// Default number of priority lanes.
pub const DEFAULT_LANES: usize = 5;

/// When thumbnails are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Only visible items are decoded; the store is bounded by the limit.
    #[default]
    OnDemand,
    /// Every request is decoded regardless of visibility.
    Continuous,
}

/// Bound on the thumbnail store. Item-count and memory limits are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLimit {
    /// At most this many decoded payloads.
    Items(usize),
    /// At most this many bytes of decoded pixels.
    Bytes(u64),
    Unbounded,
}

impl CacheLimit {
    /// Limit expressed in the store's cost unit, `None` if unbounded.
    pub fn units(&self) -> Option<u64> {
        match *self {
            CacheLimit::Items(n) => Some(n as u64),
            CacheLimit::Bytes(b) => Some(b),
            CacheLimit::Unbounded => None,
        }
    }
}

impl Default for CacheLimit {
    fn default() -> Self {
        CacheLimit::Bytes(DEFAULT_LIMIT_BYTES)
    }
}

/// Insertion order inside one priority lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Append at the tail; oldest request first.
    #[default]
    Fifo,
    /// Append at the head; newest request first.
    Lifo,
}

/// Which workers may serve a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneAffinity {
    #[default]
    Any,
    /// Only the worker with this index serves the lane.
    Worker(usize),
}

/// Shape of a scheduler: lane count, worker count, lane order and pinning.
///
/// Fixed once the first request has been enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub lanes: usize,
    pub workers: usize,
    pub processing: ProcessingMode,
    /// Per-lane affinity. Lanes beyond the end of this list use `Any`.
    pub affinity: Vec<LaneAffinity>,
}

impl QueueConfig {
    pub fn new(lanes: usize, workers: usize) -> Self {
        Self {
            lanes,
            workers,
            ..Default::default()
        }
    }

    pub fn with_processing(mut self, processing: ProcessingMode) -> Self {
        self.processing = processing;
        self
    }

    /// Pin `lane` to the worker at `worker`.
    pub fn pin_lane(mut self, lane: usize, worker: usize) -> Self {
        if self.affinity.len() <= lane {
            self.affinity.resize(lane + 1, LaneAffinity::Any);
        }
        self.affinity[lane] = LaneAffinity::Worker(worker);
        self
    }

    /// Pin every lane to one worker.
    pub fn pin_all(mut self, worker: usize) -> Self {
        self.affinity = vec![LaneAffinity::Worker(worker); self.lanes];
        self
    }

    pub fn affinity_of(&self, lane: usize) -> LaneAffinity {
        self.affinity.get(lane).copied().unwrap_or_default()
    }

    /// Lane used for ordinary requests.
    pub fn normal_lane(&self) -> usize {
        self.lanes / 2
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.lanes == 0 {
            return Err(CacheError::configuration("lane count must be at least 1"));
        }
        if self.workers == 0 {
            return Err(CacheError::configuration("worker count must be at least 1"));
        }
        if self.affinity.len() > self.lanes {
            return Err(CacheError::configuration(format!(
                "affinity given for {} lanes but only {} exist",
                self.affinity.len(),
                self.lanes
            )));
        }
        for (lane, affinity) in self.affinity.iter().enumerate() {
            if let LaneAffinity::Worker(w) = affinity {
                if *w >= self.workers {
                    return Err(CacheError::configuration(format!(
                        "lane {lane} pinned to worker {w} but only {} workers exist",
                        self.workers
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lanes: DEFAULT_LANES,
            workers: 1,
            processing: ProcessingMode::Fifo,
            affinity: Vec::new(),
        }
    }
}

/// Thumbnail cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub mode: CacheMode,
    pub limit: CacheLimit,
    /// When false, failed decodes are cached as errors and not retried.
    pub retry_on_error: bool,
    pub queue: QueueConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::OnDemand,
            limit: CacheLimit::default(),
            retry_on_error: false,
            queue: QueueConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        let config: CacheConfig = serde_json::from_str(json)?;
        config.queue.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}
