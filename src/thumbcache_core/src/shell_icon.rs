//! Icon cache keyed by file extension.
//!
//! Icon providers are generally not safe to call from more than one thread,
//! so every lane is pinned to worker 0 regardless of the pool size.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::config::QueueConfig;
use crate::decoder::Payload;
use crate::dispatch::{CacheKind, Dispatcher, Notification};
use crate::error::{CacheError, CacheResult};
use crate::key::ThumbSize;
use crate::scheduler::{Handler, Job, Scheduler};

/// Produces the icon for a file extension. Always called from the same thread.
pub trait IconProvider: Send + Sync {
    fn icon(&self, extension: &str, size: ThumbSize) -> CacheResult<Payload>;
}

fn normalize(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

#[derive(Debug)]
pub struct IconRequest {
    extension: String,
    size: ThumbSize,
}

impl Job for IconRequest {
    type Key = String;

    fn key(&self) -> &String {
        &self.extension
    }
}

pub struct IconWorker {
    provider: Arc<dyn IconProvider>,
}

impl Handler for IconWorker {
    type Job = IconRequest;
    type Output = CacheResult<Payload>;
    type State = HashMap<String, (ThumbSize, Payload)>;

    const KIND: CacheKind = CacheKind::ShellIcon;

    fn accept(&self, icons: &Self::State, job: &IconRequest) -> bool {
        !icons
            .get(&job.extension)
            .is_some_and(|(size, _)| *size == job.size)
    }

    fn process(&self, job: &IconRequest) -> Option<CacheResult<Payload>> {
        Some(self.provider.icon(&job.extension, job.size))
    }

    fn recover(&self, _job: &IconRequest, panic: &str) -> Option<CacheResult<Payload>> {
        Some(Err(CacheError::Unsupported(format!("icon provider panicked: {panic}"))))
    }

    fn publish(&self, icons: &mut Self::State, job: IconRequest, output: CacheResult<Payload>) -> Vec<Notification> {
        match output {
            Ok(icon) => {
                icons.insert(job.extension.clone(), (job.size, icon));
                vec![Notification::IconReady {
                    extension: job.extension,
                }]
            }
            Err(e) => {
                warn!("icon for .{} failed: {e}", job.extension);
                vec![Notification::CacheError {
                    key: job.extension,
                    error: Arc::new(e),
                    source: CacheKind::ShellIcon,
                }]
            }
        }
    }
}

/// Asynchronous icon cache running its provider on a single pinned worker.
pub struct ShellIconCache {
    scheduler: Scheduler<IconWorker>,
}

impl ShellIconCache {
    pub fn new(provider: Arc<dyn IconProvider>, dispatcher: Arc<dyn Dispatcher>) -> CacheResult<Self> {
        Self::with_config(provider, dispatcher, QueueConfig::new(1, 1))
    }

    /// Build with a custom layout. Every lane is pinned to worker 0 regardless.
    pub fn with_config(
        provider: Arc<dyn IconProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        config: QueueConfig,
    ) -> CacheResult<Self> {
        let scheduler = Scheduler::new(
            "thumbcache-icons",
            IconWorker { provider },
            HashMap::new(),
            config.pin_all(0),
            dispatcher,
        )?;
        Ok(Self { scheduler })
    }

    /// Queue the icon for `extension` (case and leading dot ignored).
    pub fn add(&self, extension: &str, size: ThumbSize) -> CacheResult<bool> {
        let lane = self.scheduler.config().normal_lane();
        self.scheduler.enqueue(
            IconRequest {
                extension: normalize(extension),
                size,
            },
            lane,
        )
    }

    pub fn get(&self, extension: &str) -> Option<Payload> {
        let extension = normalize(extension);
        self.scheduler
            .with_state(|icons| icons.get(&extension).map(|(_, icon)| icon.clone()))
    }

    pub fn clear(&self) {
        self.scheduler.cancel_all();
        self.scheduler.with_state(HashMap::clear);
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
