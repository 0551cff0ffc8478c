//! Notifications from workers to the owning view.
//!
//! Workers never call into the view directly. They post [`Notification`]s
//! through a [`Dispatcher`]; the stock [`ChannelDispatcher`] forwards them
//! over a channel that the view drains from its own event loop.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::key::{ItemKey, ThumbSize};

/// Minimum spacing between refresh notifications while a queue drains.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Which cache produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Thumbnail,
    Preview,
    Details,
    ShellIcon,
}

/// Event delivered to the owning view.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A thumbnail request finished, successfully or not.
    ItemCached {
        key: ItemKey,
        size: ThumbSize,
        error: Option<Arc<CacheError>>,
    },
    /// The preview slot was filled.
    PreviewReady { key: ItemKey, size: ThumbSize },
    /// File-system details for a path are available.
    DetailsReady { path: PathBuf },
    /// An icon for a file extension is available.
    IconReady { extension: String },
    /// A request failed. `key` is the display form of the item.
    CacheError {
        key: String,
        error: Arc<CacheError>,
        source: CacheKind,
    },
    /// The view should repaint.
    Refresh { source: CacheKind },
}

/// Delivers notifications onto the owner's thread.
///
/// Posting after the owner has been torn down must be a silent no-op.
pub trait Dispatcher: Send + Sync {
    fn post(&self, notification: Notification);
}

/// Dispatcher that drops everything; for caches nobody listens to.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn post(&self, _notification: Notification) {}
}

/// Channel-backed dispatcher.
pub struct ChannelDispatcher {
    tx: Sender<Notification>,
}

impl Dispatcher for ChannelDispatcher {
    fn post(&self, notification: Notification) {
        // Receiver gone means the view was torn down
        if self.tx.send(notification).is_err() {
            tracing::trace!("notification dropped, receiver closed");
        }
    }
}

/// Receiving half held by the view's event loop.
pub struct NotificationReceiver {
    rx: Receiver<Notification>,
}

impl NotificationReceiver {
    /// Take every notification posted so far without blocking.
    pub fn drain(&self) -> Vec<Notification> {
        self.rx.try_iter().collect()
    }

    /// Block until a notification arrives or `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        match self.rx.recv_timeout(timeout) {
            Ok(n) => Some(n),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Create a connected dispatcher/receiver pair.
pub fn notification_channel() -> (ChannelDispatcher, NotificationReceiver) {
    let (tx, rx) = channel();
    (ChannelDispatcher { tx }, NotificationReceiver { rx })
}

/// Coalesces refresh requests: at most one per interval while work keeps
/// arriving, plus one when the queue runs dry.
#[derive(Debug)]
pub(crate) struct RefreshThrottle {
    interval: Duration,
    last: Option<Instant>,
    dirty: bool,
}

impl RefreshThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            dirty: false,
        }
    }

    /// Record the end of one request. Returns true if a refresh should be posted now.
    pub(crate) fn record(&mut self, changed: bool, drained: bool, now: Instant) -> bool {
        if changed {
            self.dirty = true;
        }
        if !self.dirty {
            return false;
        }
        let due = drained
            || match self.last {
                Some(last) => now.duration_since(last) >= self.interval,
                None => true,
            };
        if due {
            self.dirty = false;
            self.last = Some(now);
        }
        due
    }
}
