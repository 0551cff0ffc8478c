//! Priority work scheduler with dedicated worker threads.
//!
//! One mutex guards the lanes, the cancellation bookkeeping and the
//! handler's own state (the cache store); one condition variable wakes
//! workers on new work, on start-up and on shutdown. Workers dequeue under
//! the lock, run [`Handler::process`] with the lock released, then take the
//! lock again to publish.
//!
//! Workers are spawned lazily by the first enqueue, which also freezes the
//! [`QueueConfig`]. Lanes can be pinned to one worker for collaborators that
//! must always run on the same thread.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::QueueConfig;
use crate::dispatch::{CacheKind, Dispatcher, Notification, RefreshThrottle, REFRESH_INTERVAL};
use crate::error::{CacheError, CacheResult};
use crate::queue::Lanes;

/// A queued request.
pub trait Job: Send + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + 'static;

    fn key(&self) -> &Self::Key;
}

/// The work a scheduler performs.
///
/// `accept`, `admit` and `publish` run with the scheduler lock held and
/// must be quick; `process` runs unlocked.
pub trait Handler: Send + Sync + 'static {
    type Job: Job;
    type Output: Send;
    type State: Send + 'static;

    /// Source tag for refresh notifications.
    const KIND: CacheKind;

    /// Whether a new request should be queued at all.
    fn accept(&self, _state: &Self::State, _job: &Self::Job) -> bool {
        true
    }

    /// Last check after dequeue; returning false drops the job unprocessed.
    fn admit(&self, _state: &mut Self::State, _job: &mut Self::Job) -> bool {
        true
    }

    /// Do the slow part. `None` drops the job silently.
    fn process(&self, job: &Self::Job) -> Option<Self::Output>;

    /// Output for a job whose `process` panicked. `None` drops it silently.
    fn recover(&self, _job: &Self::Job, _panic: &str) -> Option<Self::Output> {
        None
    }

    /// Write the result back and return the notifications to post.
    fn publish(&self, state: &mut Self::State, job: Self::Job, output: Self::Output) -> Vec<Notification>;
}

type KeyOf<H> = <<H as Handler>::Job as Job>::Key;

/// A job stamped with its enqueue sequence number.
struct Queued<J> {
    seq: u64,
    job: J,
}

struct QueueState<H: Handler> {
    config: QueueConfig,
    lanes: Lanes<Queued<H::Job>>,
    next_seq: u64,
    /// Jobs currently being processed, by sequence number.
    in_flight: HashMap<u64, KeyOf<H>>,
    /// In-flight jobs whose results must be discarded.
    cancelled: HashSet<u64>,
    started: bool,
    stopping: bool,
    /// Workers that have signalled start-up.
    ready: usize,
    /// Workers that have not exited yet.
    running: usize,
    refresh: RefreshThrottle,
    store: H::State,
}

struct Shared<H: Handler> {
    handler: H,
    dispatcher: Arc<dyn Dispatcher>,
    state: Mutex<QueueState<H>>,
    wake: Condvar,
}

/// Priority work queue drained by a fixed set of worker threads.
pub struct Scheduler<H: Handler> {
    name: String,
    shared: Arc<Shared<H>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: Handler> Scheduler<H> {
    /// Create a scheduler. No thread is spawned until the first enqueue.
    ///
    /// # Arguments
    /// * `name` - Thread name prefix; workers are named `{name}-{index}`
    /// * `handler` - Does the work
    /// * `store` - Handler state guarded by the scheduler lock
    /// * `config` - Lane/worker layout
    /// * `dispatcher` - Receives notifications
    pub fn new(
        name: impl Into<String>,
        handler: H,
        store: H::State,
        config: QueueConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let state = QueueState {
            lanes: Lanes::new(&config),
            config,
            next_seq: 0,
            in_flight: HashMap::new(),
            cancelled: HashSet::new(),
            started: false,
            stopping: false,
            ready: 0,
            running: 0,
            refresh: RefreshThrottle::new(REFRESH_INTERVAL),
            store,
        };
        Ok(Self {
            name: name.into(),
            shared: Arc::new(Shared {
                handler,
                dispatcher,
                state: Mutex::new(state),
                wake: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Replace the lane/worker layout. Fails once any request has been enqueued.
    pub fn configure(&self, config: QueueConfig) -> CacheResult<()> {
        config.validate()?;
        let mut st = self.shared.state.lock();
        if st.started {
            return Err(CacheError::configuration(format!(
                "{}: queue layout is fixed once work has been enqueued",
                self.name
            )));
        }
        st.lanes = Lanes::new(&config);
        st.config = config;
        Ok(())
    }

    /// Current lane/worker layout.
    pub fn config(&self) -> QueueConfig {
        self.shared.state.lock().config.clone()
    }

    /// The handler shared by every worker.
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Run `f` against the handler state under the scheduler lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut H::State) -> R) -> R {
        let mut st = self.shared.state.lock();
        f(&mut st.store)
    }

    /// Queue `job` in lane `priority`.
    ///
    /// Returns `Ok(false)` if the handler declined the job or the scheduler
    /// is stopping. Never blocks beyond the critical section, except for the
    /// one-time worker start-up on the very first call.
    pub fn enqueue(&self, job: H::Job, priority: usize) -> CacheResult<bool> {
        self.ensure_started()?;

        let mut st = self.shared.state.lock();
        if st.stopping {
            trace!("{}: dropping {:?}, scheduler stopping", self.name, job.key());
            return Ok(false);
        }
        if !self.shared.handler.accept(&st.store, &job) {
            return Ok(false);
        }
        let seq = st.next_seq;
        st.lanes.push(Queued { seq, job }, priority)?;
        st.next_seq += 1;
        if st.lanes.is_pinned(priority) {
            // notify_one could pick a worker that may not serve this lane
            self.shared.wake.notify_all();
        } else {
            self.shared.wake.notify_one();
        }
        Ok(true)
    }

    /// Spawn the workers and wait until every one of them is running.
    fn ensure_started(&self) -> CacheResult<()> {
        let mut handles = self.handles.lock();
        let workers = {
            let mut st = self.shared.state.lock();
            if st.started || st.stopping {
                return Ok(());
            }
            st.started = true;
            st.config.workers
        };

        let mut spawn_error = None;
        for index in 0..workers {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, index))
                .spawn(move || worker_loop(shared, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let spawned = handles.len();
        let mut st = self.shared.state.lock();
        while st.ready < spawned {
            self.shared.wake.wait(&mut st);
        }
        debug!("{}: {} workers started", self.name, spawned);

        match spawn_error {
            Some(e) => {
                st.stopping = true;
                self.shared.wake.notify_all();
                Err(CacheError::Io(e))
            }
            None => Ok(()),
        }
    }

    /// Drop queued requests for `key` and discard the result of any in-flight one.
    ///
    /// Requests enqueued afterwards are unaffected. Returns the number of
    /// queued requests removed.
    pub fn cancel(&self, key: &KeyOf<H>) -> usize {
        let mut st = self.shared.state.lock();
        let removed = st.lanes.remove_where(|q| q.job.key() == key);
        let running: Vec<u64> = st
            .in_flight
            .iter()
            .filter(|(_, k)| *k == key)
            .map(|(seq, _)| *seq)
            .collect();
        st.cancelled.extend(running);
        removed
    }

    /// Drop every request queued in lane `priority`.
    pub fn cancel_lane(&self, priority: usize) -> CacheResult<usize> {
        let mut st = self.shared.state.lock();
        Ok(st.lanes.drain_lane(priority)?.len())
    }

    /// Drop every queued request and discard all in-flight results.
    pub fn cancel_all(&self) -> usize {
        let mut st = self.shared.state.lock();
        let running: Vec<u64> = st.in_flight.keys().copied().collect();
        st.cancelled.extend(running);
        st.lanes.clear()
    }

    /// Number of queued requests.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().lanes.len()
    }

    /// Whether nothing is queued and no worker is mid-request.
    pub fn is_idle(&self) -> bool {
        let st = self.shared.state.lock();
        st.lanes.is_empty() && st.in_flight.is_empty()
    }

    /// Ask the workers to exit. In-flight requests run to completion but
    /// their notifications are suppressed. Idempotent; does not block.
    pub fn stop(&self) {
        let mut st = self.shared.state.lock();
        if st.stopping {
            return;
        }
        st.stopping = true;
        let dropped = st.lanes.clear();
        debug!("{}: stopping, {} queued requests dropped", self.name, dropped);
        self.shared.wake.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.state.lock().stopping
    }

    /// True once stop was requested and the last worker has exited.
    pub fn is_stopped(&self) -> bool {
        let st = self.shared.state.lock();
        st.stopping && st.running == 0
    }

    /// Stop and wait for every worker to exit.
    pub fn join(&self) {
        self.stop();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in handles {
            // A worker dropping its own scheduler cannot wait for itself
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl<H: Handler> Drop for Scheduler<H> {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop<H: Handler>(shared: Arc<Shared<H>>, index: usize) {
    {
        let mut st = shared.state.lock();
        st.ready += 1;
        st.running += 1;
        shared.wake.notify_all();
    }
    trace!("worker {index} running");

    loop {
        let mut st = shared.state.lock();
        let next = loop {
            if st.stopping {
                break None;
            }
            if let Some(job) = st.lanes.pop_for(index) {
                break Some(job);
            }
            shared.wake.wait(&mut st);
        };
        let Some(Queued { seq, mut job }) = next else { break };

        if !shared.handler.admit(&mut st.store, &mut job) {
            let drained = !st.lanes.has_work_for(index);
            let refresh = st.refresh.record(false, drained, Instant::now());
            let stopping = st.stopping;
            drop(st);
            if refresh && !stopping {
                shared.dispatcher.post(Notification::Refresh { source: H::KIND });
            }
            continue;
        }

        st.in_flight.insert(seq, job.key().clone());
        drop(st);

        let output = match catch_unwind(AssertUnwindSafe(|| shared.handler.process(&job))) {
            Ok(output) => output,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("worker {index}: processing {:?} panicked: {message}", job.key());
                shared.handler.recover(&job, &message)
            }
        };

        let mut st = shared.state.lock();
        st.in_flight.remove(&seq);
        let cancelled = st.cancelled.remove(&seq);

        let notes = match output {
            Some(output) if !cancelled => shared.handler.publish(&mut st.store, job, output),
            _ => Vec::new(),
        };
        let drained = !st.lanes.has_work_for(index);
        let refresh = st.refresh.record(!notes.is_empty(), drained, Instant::now());
        let stopping = st.stopping;
        drop(st);

        // Owner may be tearing down; never post during shutdown
        if stopping {
            continue;
        }
        for note in notes {
            shared.dispatcher.post(note);
        }
        if refresh {
            shared.dispatcher.post(Notification::Refresh { source: H::KIND });
        }
    }

    let mut st = shared.state.lock();
    st.running -= 1;
    shared.wake.notify_all();
    trace!("worker {index} exited, {} still running", st.running);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingMode;
    use crate::dispatch::NullDispatcher;
    use crate::test_utils::{wait_until, RecordingDispatcher};
    use parking_lot::Mutex as PlMutex;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug)]
    struct Echo {
        key: u32,
    }

    impl Job for Echo {
        type Key = u32;

        fn key(&self) -> &u32 {
            &self.key
        }
    }

    /// Key whose processing panics.
    const PANIC_KEY: u32 = 666;

    /// Records processing order and thread; optionally blocks on a gate.
    #[derive(Default)]
    struct EchoHandler {
        processed: PlMutex<Vec<(u32, String)>>,
        gate: PlMutex<Option<mpsc::Receiver<()>>>,
    }

    impl Handler for EchoHandler {
        type Job = Echo;
        type Output = u32;
        type State = Vec<u32>;

        const KIND: CacheKind = CacheKind::Details;

        fn accept(&self, state: &Vec<u32>, job: &Echo) -> bool {
            !state.contains(&job.key)
        }

        fn process(&self, job: &Echo) -> Option<u32> {
            if job.key == PANIC_KEY {
                panic!("collaborator blew up on {}", job.key);
            }
            if let Some(gate) = self.gate.lock().as_ref() {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            let thread = std::thread::current().name().unwrap_or_default().to_string();
            self.processed.lock().push((job.key, thread));
            Some(job.key)
        }

        fn publish(&self, state: &mut Vec<u32>, _job: Echo, output: u32) -> Vec<Notification> {
            state.push(output);
            vec![Notification::IconReady {
                extension: output.to_string(),
            }]
        }
    }

    fn scheduler(config: QueueConfig) -> Scheduler<EchoHandler> {
        Scheduler::new(
            "echo",
            EchoHandler::default(),
            Vec::new(),
            config,
            Arc::new(NullDispatcher),
        )
        .unwrap()
    }

    /// Scheduler whose single worker blocks in `process` until the returned sender fires.
    fn gated(config: QueueConfig) -> (Scheduler<EchoHandler>, mpsc::Sender<()>) {
        gated_with(config, Arc::new(NullDispatcher))
    }

    fn gated_with(
        config: QueueConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> (Scheduler<EchoHandler>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let handler = EchoHandler {
            gate: PlMutex::new(Some(rx)),
            ..Default::default()
        };
        let s = Scheduler::new("echo", handler, Vec::new(), config, dispatcher).unwrap();
        (s, tx)
    }

    fn order(s: &Scheduler<EchoHandler>) -> Vec<u32> {
        s.handler().processed.lock().iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_processes_and_publishes() {
        let s = scheduler(QueueConfig::new(1, 2));
        for k in 0..10 {
            assert!(s.enqueue(Echo { key: k }, 0).unwrap());
        }
        assert!(wait_until(|| s.is_idle()));
        let mut published = s.with_state(|st| st.clone());
        published.sort();
        assert_eq!(published, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_accept_dedups_against_state() {
        let s = scheduler(QueueConfig::new(1, 1));
        s.enqueue(Echo { key: 1 }, 0).unwrap();
        assert!(wait_until(|| s.is_idle()));
        assert!(!s.enqueue(Echo { key: 1 }, 0).unwrap());
        assert_eq!(s.queued(), 0);
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let (s, gate) = gated(QueueConfig::new(3, 1));
        // Key 0 occupies the worker while the rest queue up
        s.enqueue(Echo { key: 0 }, 2).unwrap();
        assert!(wait_until(|| s.queued() == 0));
        s.enqueue(Echo { key: 1 }, 2).unwrap();
        s.enqueue(Echo { key: 2 }, 1).unwrap();
        s.enqueue(Echo { key: 3 }, 0).unwrap();
        s.enqueue(Echo { key: 4 }, 0).unwrap();
        for _ in 0..5 {
            gate.send(()).unwrap();
        }
        assert!(wait_until(|| s.is_idle()));
        assert_eq!(order(&s), vec![0, 3, 4, 2, 1]);
    }

    #[test]
    fn test_lifo_order() {
        let (s, gate) = gated(QueueConfig::new(1, 1).with_processing(ProcessingMode::Lifo));
        s.enqueue(Echo { key: 0 }, 0).unwrap();
        assert!(wait_until(|| s.queued() == 0));
        for k in 1..4 {
            s.enqueue(Echo { key: k }, 0).unwrap();
        }
        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        assert!(wait_until(|| s.is_idle()));
        assert_eq!(order(&s), vec![0, 3, 2, 1]);
    }

    #[test]
    fn test_configure_after_start_fails() {
        let s = scheduler(QueueConfig::new(2, 1));
        assert!(s.configure(QueueConfig::new(3, 2)).is_ok());
        assert_eq!(s.config().lanes, 3);

        s.enqueue(Echo { key: 1 }, 0).unwrap();
        let result = s.configure(QueueConfig::new(5, 1));
        assert!(matches!(result, Err(CacheError::Configuration(_))));
        assert_eq!(s.config().lanes, 3);
    }

    #[test]
    fn test_invalid_priority_is_rejected() {
        let s = scheduler(QueueConfig::new(2, 1));
        assert!(s.enqueue(Echo { key: 1 }, 7).is_err());
    }

    #[test]
    fn test_cancel_queued_key() {
        let (s, gate) = gated(QueueConfig::new(1, 1));
        s.enqueue(Echo { key: 0 }, 0).unwrap();
        assert!(wait_until(|| s.queued() == 0));
        s.enqueue(Echo { key: 1 }, 0).unwrap();
        s.enqueue(Echo { key: 2 }, 0).unwrap();

        assert_eq!(s.cancel(&1), 1);
        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert!(wait_until(|| s.is_idle()));
        assert_eq!(order(&s), vec![0, 2]);
    }

    #[test]
    fn test_cancel_in_flight_discards_result() {
        let (s, gate) = gated(QueueConfig::new(1, 1));
        s.enqueue(Echo { key: 7 }, 0).unwrap();
        assert!(wait_until(|| s.queued() == 0 && !s.is_idle()));

        assert_eq!(s.cancel(&7), 0);
        gate.send(()).unwrap();
        assert!(wait_until(|| s.is_idle()));

        // Processed, but never published
        assert_eq!(order(&s), vec![7]);
        assert!(s.with_state(|st| st.is_empty()));
        // The cancellation mark does not leak into later requests
        s.enqueue(Echo { key: 7 }, 0).unwrap();
        gate.send(()).unwrap();
        assert!(wait_until(|| s.with_state(|st| st.contains(&7))));
    }

    #[test]
    fn test_cancel_lane() {
        let (s, gate) = gated(QueueConfig::new(2, 1));
        s.enqueue(Echo { key: 0 }, 0).unwrap();
        assert!(wait_until(|| s.queued() == 0));
        s.enqueue(Echo { key: 1 }, 1).unwrap();
        s.enqueue(Echo { key: 2 }, 1).unwrap();
        s.enqueue(Echo { key: 3 }, 0).unwrap();

        assert_eq!(s.cancel_lane(1).unwrap(), 2);
        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert!(wait_until(|| s.is_idle()));
        assert_eq!(order(&s), vec![0, 3]);
    }

    #[test]
    fn test_pinned_lane_runs_on_one_worker() {
        let s = scheduler(QueueConfig::new(2, 3).pin_lane(0, 2));
        for k in 0..20 {
            s.enqueue(Echo { key: k }, 0).unwrap();
        }
        for k in 100..120 {
            s.enqueue(Echo { key: k }, 1).unwrap();
        }
        assert!(wait_until(|| s.is_idle()));

        let processed = s.handler().processed.lock().clone();
        assert_eq!(processed.len(), 40);
        for (key, thread) in processed {
            if key < 100 {
                assert_eq!(thread, "echo-2");
            }
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let s = scheduler(QueueConfig::new(1, 2));
        s.enqueue(Echo { key: 1 }, 0).unwrap();
        s.stop();
        s.stop();
        assert!(s.is_stopping());
        assert!(wait_until(|| s.is_stopped()));
        assert!(s.is_stopped());
        s.join();
        assert!(s.is_stopped());
    }

    #[test]
    fn test_stop_before_start() {
        let s = scheduler(QueueConfig::new(1, 1));
        s.stop();
        assert!(s.is_stopped());
        assert!(!s.enqueue(Echo { key: 1 }, 0).unwrap());
    }

    #[test]
    fn test_stop_lets_in_flight_finish() {
        let (s, gate) = gated(QueueConfig::new(1, 1));
        s.enqueue(Echo { key: 1 }, 0).unwrap();
        s.enqueue(Echo { key: 2 }, 0).unwrap();
        assert!(wait_until(|| s.queued() == 1));

        s.stop();
        assert_eq!(s.queued(), 0);
        assert!(!s.is_stopped());
        gate.send(()).unwrap();
        assert!(wait_until(|| s.is_stopped()));
        assert_eq!(order(&s), vec![1]);
    }

    #[test]
    fn test_notifications_and_final_refresh() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let (s, gate) = gated_with(QueueConfig::new(1, 1), dispatcher.clone());
        s.enqueue(Echo { key: 0 }, 0).unwrap();
        assert!(wait_until(|| s.queued() == 0));
        for k in 1..5 {
            s.enqueue(Echo { key: k }, 0).unwrap();
        }
        for _ in 0..5 {
            gate.send(()).unwrap();
        }
        assert!(wait_until(|| s.is_idle()));
        assert!(wait_until(|| dispatcher.count(|n| matches!(n, Notification::IconReady { .. })) == 5));
        assert!(wait_until(|| matches!(dispatcher.last(), Some(Notification::Refresh { .. }))));

        let refreshes = dispatcher.count(|n| matches!(n, Notification::Refresh { .. }));
        // Coalesced: fewer refreshes than results, but at least the final one
        assert!((1..5).contains(&refreshes), "got {refreshes} refreshes");
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let s = scheduler(QueueConfig::new(1, 1));
        s.enqueue(Echo { key: PANIC_KEY }, 0).unwrap();
        s.enqueue(Echo { key: 1 }, 0).unwrap();

        assert!(wait_until(|| s.with_state(|st| st.contains(&1))));
        assert!(wait_until(|| s.is_idle()));
        assert!(!s.with_state(|st| st.contains(&PANIC_KEY)));

        s.stop();
        assert!(wait_until(|| s.is_stopped()));
    }

    #[test]
    fn test_recover_turns_panic_into_output() {
        struct Recovering;

        impl Handler for Recovering {
            type Job = Echo;
            type Output = Result<u32, String>;
            type State = Vec<Result<u32, String>>;

            const KIND: CacheKind = CacheKind::Thumbnail;

            fn process(&self, job: &Echo) -> Option<Result<u32, String>> {
                if job.key == PANIC_KEY {
                    panic!("bad input");
                }
                Some(Ok(job.key))
            }

            fn recover(&self, _job: &Echo, panic: &str) -> Option<Result<u32, String>> {
                Some(Err(panic.to_string()))
            }

            fn publish(&self, state: &mut Self::State, _job: Echo, output: Self::Output) -> Vec<Notification> {
                state.push(output);
                Vec::new()
            }
        }

        let s = Scheduler::new(
            "recover",
            Recovering,
            Vec::new(),
            QueueConfig::new(1, 1),
            Arc::new(NullDispatcher),
        )
        .unwrap();
        s.enqueue(Echo { key: PANIC_KEY }, 0).unwrap();
        s.enqueue(Echo { key: 2 }, 0).unwrap();

        assert!(wait_until(|| s.with_state(|st| st.len() == 2)));
        let published = s.with_state(|st| st.clone());
        assert_eq!(published[0], Err("bad input".to_string()));
        assert_eq!(published[1], Ok(2));
    }

    /// Job carrying its own gate, so two requests for one key can be
    /// released independently.
    struct Versioned {
        key: u32,
        version: u32,
        gate: Option<mpsc::Receiver<()>>,
    }

    impl Job for Versioned {
        type Key = u32;

        fn key(&self) -> &u32 {
            &self.key
        }
    }

    struct VersionedHandler;

    impl Handler for VersionedHandler {
        type Job = Versioned;
        type Output = (u32, u32);
        type State = Vec<(u32, u32)>;

        const KIND: CacheKind = CacheKind::Details;

        fn process(&self, job: &Versioned) -> Option<(u32, u32)> {
            if let Some(gate) = &job.gate {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            Some((job.key, job.version))
        }

        fn publish(&self, state: &mut Vec<(u32, u32)>, _job: Versioned, output: (u32, u32)) -> Vec<Notification> {
            state.push(output);
            Vec::new()
        }
    }

    #[test]
    fn test_cancel_spares_later_request_for_same_key() {
        let s = Scheduler::new(
            "versioned",
            VersionedHandler,
            Vec::new(),
            QueueConfig::new(1, 2),
            Arc::new(NullDispatcher),
        )
        .unwrap();
        let (release_old, gate) = mpsc::channel();
        s.enqueue(
            Versioned {
                key: 1,
                version: 0,
                gate: Some(gate),
            },
            0,
        )
        .unwrap();
        assert!(wait_until(|| s.queued() == 0 && !s.is_idle()));

        assert_eq!(s.cancel(&1), 0);
        s.enqueue(
            Versioned {
                key: 1,
                version: 1,
                gate: None,
            },
            0,
        )
        .unwrap();
        // The newer request finishes while the cancelled one is still running
        assert!(wait_until(|| s.with_state(|st| st.contains(&(1, 1)))));

        release_old.send(()).unwrap();
        assert!(wait_until(|| s.is_idle()));
        assert_eq!(s.with_state(|st| st.clone()), vec![(1, 1)]);
    }

    #[test]
    fn test_cancel_all_spares_later_requests() {
        let (s, gate) = gated(QueueConfig::new(1, 1));
        s.enqueue(Echo { key: 5 }, 0).unwrap();
        assert!(wait_until(|| s.queued() == 0 && !s.is_idle()));

        s.cancel_all();
        s.enqueue(Echo { key: 6 }, 0).unwrap();
        gate.send(()).unwrap();
        gate.send(()).unwrap();

        assert!(wait_until(|| s.with_state(|st| st.contains(&6))));
        assert!(!s.with_state(|st| st.contains(&5)));
    }
}
