//! Thumbcache Core - asynchronous thumbnail cache for list and grid views.
//!
//! This crate provides:
//! - Priority work queue drained by dedicated worker threads, with FIFO/LIFO
//!   lanes, cancellation and per-lane thread pinning
//! - Bounded thumbnail store with batched, visibility-aware eviction
//! - JPEG decoding with embedded-thumbnail shortcut and parallel downscale
//! - Throttled notifications posted back to the owning view
//! - File-details and shell-icon variants on the same scheduler

mod cache;
mod config;
mod decoder;
mod details;
mod dispatch;
mod error;
mod key;
mod queue;
mod scheduler;
mod shell_icon;
mod thumbnail;
mod visibility;
#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{CacheEntry, CacheStats, CacheStore, EntryState};
pub use config::{
    CacheConfig, CacheLimit, CacheMode, LaneAffinity, ProcessingMode, QueueConfig, DEFAULT_LANES,
    DEFAULT_LIMIT_BYTES,
};
pub use decoder::{
    decode_jpeg_bytes, downscale, extract_embedded_jpeg, fit_within, read_jpeg_dimensions, Decoder,
    FsDecoder, Payload, VirtualSource, BITS_PER_PIXEL,
};
pub use details::{DetailsCache, DetailsProvider, FsDetailsProvider, ItemDetails, DEFAULT_DETAILS_WORKERS};
pub use dispatch::{
    notification_channel, CacheKind, ChannelDispatcher, Dispatcher, Notification, NotificationReceiver,
    NullDispatcher, REFRESH_INTERVAL,
};
pub use error::{CacheError, CacheResult};
pub use key::{EmbeddedPolicy, ItemKey, ThumbSize, VirtualKey};
pub use queue::Lanes;
pub use scheduler::{Handler, Job, Scheduler};
pub use shell_icon::{IconProvider, ShellIconCache};
pub use thumbnail::ThumbnailCache;
pub use visibility::{VisibilityOracle, VisibleSet};
