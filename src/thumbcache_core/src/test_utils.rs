//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::decoder::{Decoder, Payload};
use crate::dispatch::{Dispatcher, Notification};
use crate::error::{CacheError, CacheResult};
use crate::key::{EmbeddedPolicy, ItemKey, ThumbSize, VirtualKey};

/// Poll `f` until it holds or five seconds pass.
pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    f()
}

pub fn key(path: &str) -> ItemKey {
    ItemKey::path(path)
}

/// Solid-grey payload of exactly `size`.
pub fn payload(size: ThumbSize) -> Payload {
    let len = size.width as usize * size.height as usize * 3;
    Payload::new(vec![128; len], size.width, size.height)
}

/// Dispatcher that keeps everything posted to it.
#[derive(Default)]
pub struct RecordingDispatcher {
    posted: Mutex<Vec<Notification>>,
}

impl RecordingDispatcher {
    pub fn count(&self, pred: impl Fn(&Notification) -> bool) -> usize {
        self.posted.lock().iter().filter(|n| pred(*n)).count()
    }

    pub fn last(&self) -> Option<Notification> {
        self.posted.lock().last().cloned()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn post(&self, notification: Notification) {
        self.posted.lock().push(notification);
    }
}

/// Decoder producing solid payloads of the requested size.
///
/// Keys can be made to fail, and decoding can be held until released.
#[derive(Default)]
pub struct MockDecoder {
    failing: Mutex<HashSet<ItemKey>>,
    exploding: Mutex<HashSet<ItemKey>>,
    calls: AtomicUsize,
    virtual_calls: AtomicUsize,
    held: Mutex<bool>,
    release: Condvar,
}

impl MockDecoder {
    pub fn fail(&self, key: ItemKey) {
        self.failing.lock().insert(key);
    }

    /// Make decoding `key` panic.
    pub fn explode(&self, key: ItemKey) {
        self.exploding.lock().insert(key);
    }

    pub fn heal(&self, key: &ItemKey) {
        self.failing.lock().remove(key);
    }

    /// Block every decode until [`release`](Self::release).
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.release.notify_all();
    }

    /// Decodes attempted so far, path and virtual.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn virtual_calls(&self) -> usize {
        self.virtual_calls.load(Ordering::SeqCst)
    }

    fn run(&self, key: ItemKey, size: ThumbSize) -> CacheResult<Payload> {
        {
            let mut held = self.held.lock();
            let deadline = Instant::now() + Duration::from_secs(5);
            while *held {
                if self.release.wait_until(&mut held, deadline).timed_out() {
                    break;
                }
            }
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let explode = self.exploding.lock().contains(&key);
        if explode {
            panic!("{key}: decoder crashed");
        }
        if self.failing.lock().contains(&key) {
            return Err(CacheError::Decode(format!("{key}: corrupt image")));
        }
        Ok(payload(size))
    }
}

impl Decoder for MockDecoder {
    fn decode(&self, path: &Path, size: ThumbSize, _policy: EmbeddedPolicy) -> CacheResult<Payload> {
        self.run(ItemKey::path(path), size)
    }

    fn decode_virtual(&self, key: &VirtualKey, size: ThumbSize) -> CacheResult<Payload> {
        self.virtual_calls.fetch_add(1, Ordering::SeqCst);
        self.run(ItemKey::Virtual(key.clone()), size)
    }
}
