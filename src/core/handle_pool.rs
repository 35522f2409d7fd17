/*!
 * Resource-handle pool (C6)
 *
 * A database-handle-pool pattern: N-way deadlock-free multi-handle
 * acquisition with per-thread hold accounting, idle/stale reaping, and
 * version-based invalidation. Grounded on
 * `examples/original_source/nsdb/dbinit.c`'s `Ns_DbPoolTimedGetMultipleHandles`
 * (exclusive-waiter serialization plus per-thread `IncrCount` deadlock
 * rejection), `ReturnHandle` (connected-first/disconnected-last ordering),
 * `IsStale`, `Ns_DbBouncePool`, and `CheckPool`.
 */

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::HandlePoolConfig;
use crate::error::{Component, Result, ServerError};

/// Boundary trait standing in for a real SQL driver connection. The
/// driver itself (connection string parsing, query execution) is out
/// of scope; the pool only needs open/close/liveness.
pub trait DbDriver: Send + 'static {
    fn connect(datasource: &str, user: Option<&str>, password: Option<&str>) -> Result<Self>
    where
        Self: Sized;
    fn disconnect(&mut self);
    fn reset(&mut self);
}

/// A pool-managed checkout of a driver connection.
pub struct DbHandle<D: DbDriver> {
    driver: Option<D>,
    generation: u64,
    open_time: Instant,
    last_access: Instant,
    stale: bool,
}

impl<D: DbDriver> DbHandle<D> {
    pub fn connected(&self) -> bool {
        self.driver.is_some()
    }

    pub fn driver(&self) -> Option<&D> {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> Option<&mut D> {
        self.driver.as_mut()
    }
}

struct PoolState<D: DbDriver> {
    free: VecDeque<DbHandle<D>>,
    checked_out: usize,
    waiting: bool,
    stale_on_close: u64,
    shutdown: bool,
}

thread_local! {
    static HELD: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// A named pool of database handles. Mirrors `nsdb`'s `Pool`: a fixed
/// `max` handle count, a `stale_on_close` generation counter bumped by
/// [`HandlePool::bounce`], and an exclusive-waiter role serializing
/// multi-handle acquisitions the same way [`crate::core::proxy_pool::ProxyPool`]
/// does for worker checkouts.
pub struct HandlePool<D: DbDriver> {
    id: usize,
    pub name: String,
    config: Mutex<HandlePoolConfig>,
    state: Mutex<PoolState<D>>,
    wait_cond: Condvar,
    get_cond: Condvar,
    next_generation: AtomicU64,
}

impl<D: DbDriver> HandlePool<D> {
    pub fn new(name: impl Into<String>, config: HandlePoolConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            config: Mutex::new(config),
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                checked_out: 0,
                waiting: false,
                stale_on_close: 0,
                shutdown: false,
            }),
            wait_cond: Condvar::new(),
            get_cond: Condvar::new(),
            next_generation: AtomicU64::new(1),
        })
    }

    fn max(&self) -> usize {
        self.config.lock().unwrap().connections
    }

    /// Acquires `count` handles within `timeout`. The calling thread's
    /// already-held count for this pool is tracked in thread-local
    /// storage so a request that would push `held + count` over `max`
    /// is rejected as `Deadlock` rather than left to block forever, per
    /// `IncrCount`'s "thread already owns N handles" check.
    pub fn acquire_multi(&self, count: usize, timeout: Duration) -> Result<Vec<DbHandle<D>>> {
        let max = self.max();
        if count > max {
            return Err(ServerError::Range(Component::HandlePool));
        }

        let already_held = HELD.with(|h| *h.borrow().get(&self.id).unwrap_or(&0));
        if already_held + count > max {
            return Err(ServerError::Deadlock(Component::HandlePool));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        while !state.shutdown && state.waiting {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ServerError::GetTimeout(Component::HandlePool));
            }
            let (guard, result) = self.wait_cond.wait_timeout(state, remaining).unwrap();
            state = guard;
            if result.timed_out() {
                return Err(ServerError::GetTimeout(Component::HandlePool));
            }
        }
        if state.shutdown {
            return Err(ServerError::ShuttingDown(Component::HandlePool));
        }
        state.waiting = true;

        let mut acquired = Vec::with_capacity(count);
        let outcome = loop {
            while acquired.len() < count {
                if let Some(handle) = state.free.pop_front() {
                    state.checked_out += 1;
                    acquired.push(handle);
                } else {
                    break;
                }
            }
            if acquired.len() >= count {
                break Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(ServerError::GetTimeout(Component::HandlePool));
            }
            let (guard, _) = self.get_cond.wait_timeout(state, remaining).unwrap();
            state = guard;
        };

        state.waiting = false;
        self.wait_cond.notify_one();

        match outcome {
            Ok(()) => {
                drop(state);
                HELD.with(|h| {
                    *h.borrow_mut().entry(self.id).or_insert(0) += count;
                });

                let config = self.config.lock().unwrap().clone();
                for handle in acquired.iter_mut() {
                    self.refresh_if_stale(handle, &config);
                }
                Ok(acquired)
            }
            Err(e) => {
                for handle in acquired {
                    state.checked_out = state.checked_out.saturating_sub(1);
                    state.free.push_front(handle);
                }
                self.get_cond.notify_one();
                Err(e)
            }
        }
    }

    /// Convenience wrapper for the common single-handle case.
    pub fn acquire(&self, timeout: Duration) -> Result<DbHandle<D>> {
        self.acquire_multi(1, timeout).map(|mut v| v.pop().unwrap())
    }

    fn is_stale(&self, handle: &DbHandle<D>, config: &HandlePoolConfig, stale_on_close: u64) -> bool {
        if !handle.connected() {
            return false;
        }
        let now = Instant::now();
        let idle_expired = config.max_idle_secs > 0
            && now.saturating_duration_since(handle.last_access) > config.max_idle();
        let open_expired = config.max_open_secs > 0
            && now.saturating_duration_since(handle.open_time) > config.max_open();
        idle_expired || open_expired || handle.stale || handle.generation < stale_on_close
    }

    /// Reconnects a handle in place if it is stale, outside the pool
    /// lock (driver I/O). Mirrors `IsStale` + the disconnect/reconnect
    /// pair in `Ns_DbPoolTimedGetMultipleHandles`'s `Connect`.
    fn refresh_if_stale(&self, handle: &mut DbHandle<D>, config: &HandlePoolConfig) {
        let stale_on_close = self.state.lock().unwrap().stale_on_close;
        if self.is_stale(handle, config, stale_on_close) {
            if config.verbose {
                debug!(pool = %self.name, "closing stale handle");
            }
            if let Some(driver) = handle.driver.as_mut() {
                driver.disconnect();
            }
            handle.driver = None;
            handle.stale = false;
        }
        if handle.driver.is_none() {
            match D::connect(
                &config.datasource,
                config.user.as_deref(),
                config.password.as_deref(),
            ) {
                Ok(driver) => {
                    handle.driver = Some(driver);
                    handle.open_time = Instant::now();
                    handle.generation = self.next_generation.load(Ordering::Relaxed);
                }
                Err(e) => {
                    if config.log_errors {
                        warn!(pool = %self.name, error = %e, "failed to (re)connect handle");
                    }
                }
            }
        }
        handle.last_access = Instant::now();
    }

    /// Returns handles to the pool. Connected handles go to the head
    /// (preferred for the next acquire), disconnected ones to the tail,
    /// matching `ReturnHandle`'s ordering.
    pub fn return_handles(&self, handles: Vec<DbHandle<D>>) {
        let count = handles.len();
        let mut state = self.state.lock().unwrap();
        for mut handle in handles {
            handle.last_access = Instant::now();
            state.checked_out = state.checked_out.saturating_sub(1);
            if handle.connected() {
                state.free.push_front(handle);
            } else {
                state.free.push_back(handle);
            }
        }
        if state.waiting {
            self.get_cond.notify_one();
        }
        drop(state);

        HELD.with(|h| {
            if let Some(n) = h.borrow_mut().get_mut(&self.id) {
                *n = n.saturating_sub(count);
            }
        });
    }

    /// Marks every currently outstanding handle stale on its next
    /// return by bumping the pool's generation counter, per
    /// `Ns_DbBouncePool`.
    pub fn bounce(&self) {
        let mut state = self.state.lock().unwrap();
        state.stale_on_close += 1;
        self.next_generation.fetch_add(1, Ordering::Relaxed);
        for handle in state.free.iter_mut() {
            handle.stale = true;
        }
    }

    /// Periodic reaper (scheduled via C1's [`crate::core::scheduler::Scheduler`]):
    /// detaches the free list under the lock, disconnects stale handles
    /// outside it, then reattaches. Mirrors `CheckPool`.
    pub fn check(&self) {
        let detached: Vec<DbHandle<D>> = {
            let mut state = self.state.lock().unwrap();
            state.free.drain(..).collect()
        };
        if detached.is_empty() {
            return;
        }

        let config = self.config.lock().unwrap().clone();
        let stale_on_close = self.state.lock().unwrap().stale_on_close;
        let mut checked = Vec::with_capacity(detached.len());
        for mut handle in detached {
            if self.is_stale(&handle, &config, stale_on_close) {
                if let Some(driver) = handle.driver.as_mut() {
                    driver.disconnect();
                }
                handle.driver = None;
                handle.stale = false;
            }
            checked.push(handle);
        }

        let mut state = self.state.lock().unwrap();
        for handle in checked {
            if handle.connected() {
                state.free.push_front(handle);
            } else {
                state.free.push_back(handle);
            }
        }
        if state.waiting {
            self.get_cond.notify_one();
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        for handle in state.free.iter_mut() {
            if let Some(driver) = handle.driver.as_mut() {
                driver.disconnect();
            }
            handle.driver = None;
        }
        self.wait_cond.notify_all();
        self.get_cond.notify_all();
    }

    /// Seeds the free list with `n` freshly-minted disconnected handle
    /// shells, matching `InitPool`'s pre-allocation of `nhandles`.
    pub fn seed(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        for _ in 0..n {
            state.free.push_back(DbHandle {
                driver: None,
                generation: 0,
                open_time: now,
                last_access: now,
                stale: false,
            });
        }
    }
}

/// Registry of named handle pools, one per configured datasource.
pub struct HandlePoolRegistry<D: DbDriver> {
    pools: Mutex<HashMap<String, Arc<HandlePool<D>>>>,
}

impl<D: DbDriver> Default for HandlePoolRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DbDriver> HandlePoolRegistry<D> {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self, name: &str, config: HandlePoolConfig) -> Arc<HandlePool<D>> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(name.to_string())
            .or_insert_with(|| {
                let n = config.connections;
                let pool = HandlePool::new(name, config);
                pool.seed(n);
                pool
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<HandlePool<D>>> {
        self.pools.lock().unwrap().get(name).cloned()
    }
}
