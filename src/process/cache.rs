//! Process cache
//!
//! Answers "what is running in the foreground of this session" from a snapshot of the
//! process table. Readers never touch the OS: they clone the published `Arc` and walk
//! it. Snapshots are rebuilt on demand (`update_synchronously`), on request from the
//! background refresher (`request_immediate_update`), or on the refresher's next tick
//! after `set_needs_update(true)`.

use crate::broker::config::CacheConfig;
use crate::process::{ProcessInfo, ProcessSnapshot, ProcessSource};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;
use tracing::{debug, warn};

type UpdateCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct RefreshState {
    in_progress: bool,
    /// Refreshes finished since the cache was created
    completed: u64,
}

/// Shared, periodically refreshed view of the process table
pub struct ProcessCache {
    source: Box<dyn ProcessSource>,
    config: CacheConfig,
    snapshot: RwLock<Arc<ProcessSnapshot>>,
    needs_update: AtomicBool,
    /// Tracked pid to the pid of its deepest foreground job at the last refresh
    tracked: Mutex<HashMap<i32, Option<i32>>>,
    dirty: Mutex<HashSet<i32>>,
    refresh: Mutex<RefreshState>,
    refreshed: Condvar,
    requests: Mutex<Option<Sender<UpdateCallback>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a refresh finished even if building the snapshot panicked
struct RefreshGuard<'a> {
    cache: &'a ProcessCache,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.cache.refresh);
        state.in_progress = false;
        state.completed += 1;
        self.cache.refreshed.notify_all();
    }
}

impl ProcessCache {
    /// Create a cache and start its background refresher
    ///
    /// The first snapshot is built on the refresher's first tick, or earlier by
    /// `update_synchronously`.
    pub fn new<S>(source: S, config: CacheConfig) -> Arc<Self>
    where
        S: ProcessSource + 'static,
    {
        let cache = Arc::new(Self {
            source: Box::new(source),
            config,
            snapshot: RwLock::new(Arc::new(ProcessSnapshot::empty())),
            needs_update: AtomicBool::new(true),
            tracked: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            refresh: Mutex::new(RefreshState::default()),
            refreshed: Condvar::new(),
            requests: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(&cache);
        let interval = config.refresh_interval;
        match thread::Builder::new()
            .name("ptybroker-process-cache".to_string())
            .spawn(move || run_refresher(weak, rx, interval))
        {
            Ok(_) => *lock(&cache.requests) = Some(tx),
            Err(e) => warn!(error = %e, "cannot start process cache refresher; updates run inline"),
        }
        cache
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The currently published snapshot
    pub fn snapshot(&self) -> Arc<ProcessSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn process_info_for(&self, pid: i32) -> Option<ProcessInfo> {
        self.snapshot().get(pid).cloned()
    }

    /// Deepest foreground descendant of `pid`, or `pid` itself when nothing below it is
    /// in the foreground
    pub fn deepest_foreground_job_for(&self, pid: i32) -> Option<ProcessInfo> {
        self.snapshot().deepest_foreground_job(pid).cloned()
    }

    /// All descendants of `pid`, breadth-first
    pub fn process_tree_for(&self, pid: i32) -> Vec<ProcessInfo> {
        self.snapshot()
            .descendants(pid)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Flag the snapshot stale; the refresher rebuilds it on its next tick
    pub fn set_needs_update(&self, needs_update: bool) {
        self.needs_update.store(needs_update, Ordering::Release);
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update.load(Ordering::Acquire)
    }

    /// Rebuild and publish a snapshot before returning
    ///
    /// A caller that arrives while another refresh is running waits for that one to
    /// publish instead of enumerating again.
    pub fn update_synchronously(&self) {
        let mut state = lock(&self.refresh);
        if state.in_progress {
            let target = state.completed + 1;
            while state.completed < target {
                state = self
                    .refreshed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            return;
        }
        state.in_progress = true;
        drop(state);

        let _guard = RefreshGuard { cache: self };
        self.rebuild();
    }

    /// Refresh on the background thread, then call `completion` there
    ///
    /// Requests that queue up while the refresher is busy share one refresh.
    pub fn request_immediate_update<F>(&self, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let callback: UpdateCallback = Box::new(completion);
        let undelivered = match lock(&self.requests).as_ref() {
            Some(tx) => tx.send(callback).err().map(|e| e.0),
            None => Some(callback),
        };
        if let Some(callback) = undelivered {
            self.update_synchronously();
            callback();
        }
    }

    /// Watch `pid` for changes of its deepest foreground job
    pub fn register_tracked_pid(&self, pid: i32) {
        let job = self.snapshot().deepest_foreground_job(pid).map(|info| info.pid);
        lock(&self.tracked).insert(pid, job);
    }

    pub fn unregister_tracked_pid(&self, pid: i32) {
        lock(&self.tracked).remove(&pid);
    }

    /// Whether `pid` changed since the last time anyone asked; asking clears the mark
    pub fn process_is_dirty(&self, pid: i32) -> bool {
        lock(&self.dirty).remove(&pid)
    }

    fn rebuild(&self) {
        self.needs_update.store(false, Ordering::Release);

        let processes = match self.source.enumerate() {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "process enumeration failed; keeping previous snapshot");
                return;
            }
        };

        let previous = self.snapshot();
        let next = Arc::new(ProcessSnapshot::from_processes(
            processes,
            previous.generation() + 1,
        ));

        let mut changed = next.changed_pids(&previous);
        for (pid, last_job) in lock(&self.tracked).iter_mut() {
            let job = next.deepest_foreground_job(*pid).map(|info| info.pid);
            if job != *last_job {
                changed.insert(*pid);
                *last_job = job;
            }
        }

        debug!(
            generation = next.generation(),
            processes = next.len(),
            changed = changed.len(),
            "process snapshot published"
        );
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next;
        lock(&self.dirty).extend(changed);
    }
}

impl std::fmt::Debug for ProcessCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCache")
            .field("config", &self.config)
            .field("generation", &self.snapshot().generation())
            .field("needs_update", &self.needs_update())
            .finish()
    }
}

fn run_refresher(cache: Weak<ProcessCache>, requests: Receiver<UpdateCallback>, interval: std::time::Duration) {
    loop {
        match requests.recv_timeout(interval) {
            Ok(first) => {
                let mut callbacks = vec![first];
                callbacks.extend(requests.try_iter());
                let Some(cache) = cache.upgrade() else { return };
                cache.update_synchronously();
                drop(cache);
                for callback in callbacks {
                    callback();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let Some(cache) = cache.upgrade() else { return };
                if cache.needs_update() {
                    cache.update_synchronously();
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
