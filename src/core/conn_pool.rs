/*!
 * Connection worker pool (C7)
 *
 * Queues accepted connections and dispatches them to an elastically
 * sized set of service threads. Grounded on
 * `examples/original_source/nsd/serv.c`'s `Ns_QueueConn` (free/waiting
 * list triad, create-on-demand thread spawn, consecutive-drop shutdown
 * trigger), `NsConnThread` (idle-timeout exit, active-list splice,
 * ready-proc hook), and `NsStopServer` (broadcast-and-join drain with a
 * deadline).
 */

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::ConnPoolConfig;
use crate::core::cache::Cache;
use crate::core::thread_id;
use crate::error::{Component, Result, ServerError};

/// Boundary trait for the HTTP/auth/filter pipeline that actually
/// services a connection. Request parsing, auth, and the filter-phase
/// dispatch (pre-auth/auth/post-auth/request/trace/cleanup) are out of
/// scope for the core; the pool only needs somewhere to hand the
/// opaque driver reference once a service thread is ready.
pub trait ConnHandler: Send + Sync + 'static {
    fn service(&self, conn: &mut ConnRecord);
}

/// Opaque per-request context. `driver_ref` is the out-of-scope
/// driver's connection handle; everything else is bookkeeping the pool
/// itself fills in.
pub struct ConnRecord {
    pub id: u64,
    pub driver_ref: Box<dyn std::any::Any + Send>,
    pub url: Option<String>,
    pub arrival: Instant,
    pub queued_at: Instant,
    pub service_start: Option<Instant>,
    pub service_end: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Ok,
    Overflow,
    ShuttingDown,
}

#[derive(Default, Clone, Copy)]
struct StatsBundle {
    requests: u64,
    wait_time: Duration,
    open_time: Duration,
    closed_time: Duration,
}

impl StatsBundle {
    fn record(&mut self, wait: Duration, open: Duration, closed: Duration) {
        self.requests += 1;
        self.wait_time += wait;
        self.open_time += open;
        self.closed_time += closed;
    }
}

struct State {
    free: Vec<u64>,
    waiting: VecDeque<ConnRecord>,
    active: Vec<u64>,
    current_threads: usize,
    idle_threads: usize,
    next_conn_id: u64,
    consecutive_drops: u32,
    terminate_sent: bool,
    shutdown: bool,
    global_stats: StatsBundle,
}

/// Elastic connection worker pool. Owns a bounded pool of
/// `ConnRecord`s and dispatches queued connections to `minThreads..=
/// maxThreads` service threads.
pub struct ConnPool<H: ConnHandler> {
    config: ConnPoolConfig,
    handler: Arc<H>,
    state: Mutex<State>,
    cond: Condvar,
    url_stats: Arc<Cache<String, StatsBundle>>,
    signal_terminate: Box<dyn Fn() + Send + Sync>,
}

impl<H: ConnHandler> ConnPool<H> {
    /// Creates the pool and spawns `min_threads` service threads.
    /// `maxConns`/`maxThreads` are clamped the way `NsInitServer` does:
    /// `maxThreads` never exceeds `maxConns`, `minThreads` never exceeds
    /// `maxThreads`.
    pub fn new(
        mut config: ConnPoolConfig,
        handler: H,
        signal_terminate: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        if config.max_threads > config.max_conns {
            warn!(
                max_threads = config.max_threads,
                max_conns = config.max_conns,
                "conn_pool: clamping max_threads to max_conns"
            );
            config.max_threads = config.max_conns;
        }
        if config.min_threads > config.max_threads {
            warn!(
                min_threads = config.min_threads,
                max_threads = config.max_threads,
                "conn_pool: clamping min_threads to max_threads"
            );
            config.min_threads = config.max_threads;
        }

        let free: Vec<u64> = (0..config.max_conns as u64).rev().collect();
        let min_threads = config.min_threads;
        let url_stats_size = config.url_stats_cache_size;

        let pool = Arc::new(Self {
            config,
            handler: Arc::new(handler),
            state: Mutex::new(State {
                free,
                waiting: VecDeque::new(),
                active: Vec::new(),
                current_threads: min_threads,
                idle_threads: min_threads,
                next_conn_id: 1,
                consecutive_drops: 0,
                terminate_sent: false,
                shutdown: false,
                global_stats: StatsBundle::default(),
            }),
            cond: Condvar::new(),
            url_stats: Cache::new(url_stats_size.max(1), None),
            signal_terminate: Box::new(signal_terminate),
        });

        for _ in 0..min_threads {
            spawn_service_thread(pool.clone());
        }

        pool
    }

    /// Appends a connection to the waiting list, assigning it a fresh
    /// id and timestamp. May spin up one new service thread (outside
    /// the lock) if no thread is idle and the pool is below
    /// `maxThreads`. Yields the calling thread once afterward as an
    /// anti-thundering-herd hint, matching `Ns_QueueConn`.
    pub fn enqueue(self: &Arc<Self>, driver_ref: Box<dyn std::any::Any + Send>) -> EnqueueOutcome {
        self.enqueue_with_url(driver_ref, None)
    }

    pub fn enqueue_with_url(
        self: &Arc<Self>,
        driver_ref: Box<dyn std::any::Any + Send>,
        url: Option<String>,
    ) -> EnqueueOutcome {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if state.shutdown {
            return EnqueueOutcome::ShuttingDown;
        }

        let Some(id_slot) = state.free.pop() else {
            state.consecutive_drops += 1;
            if !state.terminate_sent
                && state.consecutive_drops as usize > self.config.max_consecutive_drops as usize
                && self.config.max_consecutive_drops > 0
            {
                state.terminate_sent = true;
                warn!(
                    dropped = state.consecutive_drops,
                    "conn_pool: shutting down after too many dropped connections"
                );
                (self.signal_terminate)();
            }
            return EnqueueOutcome::Overflow;
        };
        state.consecutive_drops = 0;

        let record = ConnRecord {
            id: state.next_conn_id,
            driver_ref,
            url,
            arrival: now,
            queued_at: now,
            service_start: None,
            service_end: None,
        };
        state.next_conn_id += 1;
        let _ = id_slot;
        state.waiting.push_back(record);

        let mut create = false;
        if state.idle_threads == 0 && state.current_threads < self.config.max_threads {
            state.idle_threads += 1;
            state.current_threads += 1;
            create = true;
        }
        self.cond.notify_one();
        drop(state);

        if create {
            spawn_service_thread(self.clone());
        }

        thread::yield_now();
        EnqueueOutcome::Ok
    }

    fn idle_timeout_applies(&self, current_threads: usize) -> bool {
        current_threads > self.config.min_threads
    }

    /// Point-in-time snapshot for admin introspection.
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().unwrap();
        PoolSnapshot {
            current_threads: state.current_threads,
            idle_threads: state.idle_threads,
            waiting_conns: state.waiting.len(),
            active_conns: state.active.len(),
            free_conns: state.free.len(),
        }
    }

    pub fn global_stats(&self) -> (u64, Duration, Duration, Duration) {
        let s = self.state.lock().unwrap().global_stats;
        (s.requests, s.wait_time, s.open_time, s.closed_time)
    }

    /// Sets the shutdown flag and broadcasts, then waits (bounded by
    /// `deadline`) for the waiting list to drain and every service
    /// thread to exit, matching `NsStopServer`.
    pub fn stop(&self, deadline: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.cond.notify_all();

        while !(state.waiting.is_empty() && state.current_threads == 0) {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("conn_pool: timed out waiting for connection threads to exit");
                return Err(ServerError::GetTimeout(Component::ConnPool));
            }
            let (guard, result) = self.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
            if result.timed_out() {
                warn!("conn_pool: timed out waiting for connection threads to exit");
                return Err(ServerError::GetTimeout(Component::ConnPool));
            }
        }

        Ok(())
    }
}

pub struct PoolSnapshot {
    pub current_threads: usize,
    pub idle_threads: usize,
    pub waiting_conns: usize,
    pub active_conns: usize,
    pub free_conns: usize,
}

fn spawn_service_thread<H: ConnHandler>(pool: Arc<ConnPool<H>>) {
    thread::spawn(move || {
        let my_id = thread_id::current();
        debug!(thread = my_id, "conn_pool: service thread starting");
        service_loop(&pool);

        let mut state = pool.state.lock().unwrap();
        state.idle_threads = state.idle_threads.saturating_sub(1);
        state.current_threads = state.current_threads.saturating_sub(1);
        if state.current_threads == 0 {
            pool.cond.notify_all();
        }
        debug!(thread = my_id, "conn_pool: service thread exiting");
    });
}

fn service_loop<H: ConnHandler>(pool: &Arc<ConnPool<H>>) {
    loop {
        let mut record = {
            let mut state = pool.state.lock().unwrap();
            loop {
                if !state.waiting.is_empty() {
                    break;
                }
                if state.shutdown {
                    return;
                }
                let timeout = if pool.idle_timeout_applies(state.current_threads) {
                    Some(pool.config.thread_idle_timeout())
                } else {
                    None
                };
                match timeout {
                    None => state = pool.cond.wait(state).unwrap(),
                    Some(t) => {
                        let (guard, result) = pool.cond.wait_timeout(state, t).unwrap();
                        state = guard;
                        if result.timed_out() && state.waiting.is_empty() {
                            return;
                        }
                    }
                }
            }

            let record = state.waiting.pop_front().expect("checked non-empty above");
            state.active.push(record.id);
            state.idle_threads = state.idle_threads.saturating_sub(1);
            record
        };

        record.service_start = Some(Instant::now());
        pool.handler.service(&mut record);
        record.service_end = Some(Instant::now());

        let wait = record
            .service_start
            .unwrap()
            .saturating_duration_since(record.queued_at);
        let open = record
            .service_end
            .unwrap()
            .saturating_duration_since(record.service_start.unwrap());

        let mut state = pool.state.lock().unwrap();
        state.active.retain(|id| *id != record.id);
        let closed = Instant::now().saturating_duration_since(record.service_end.unwrap());
        state.global_stats.record(wait, open, closed);

        if let Some(url) = record.url.clone() {
            let (entry, _is_new) = pool.url_stats.create_entry(url);
            let mut bundle = pool.url_stats.value(&entry).unwrap_or_default();
            bundle.record(wait, open, closed);
            pool.url_stats.set_value(&entry, bundle, 1);
        }

        let was_empty = state.free.is_empty();
        state.free.push(record.id);
        state.idle_threads += 1;
        drop(state);

        if was_empty {
            // Ready-proc hook (external): subsystems waiting on "a
            // connection record became available" run here, outside
            // the lock, matching `NsRunAtReadyProcs`.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        seen: Arc<AtomicUsize>,
    }

    impl ConnHandler for CountingHandler {
        fn service(&self, _conn: &mut ConnRecord) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn test_config() -> ConnPoolConfig {
        ConnPoolConfig {
            min_threads: 2,
            max_threads: 4,
            max_conns: 8,
            thread_idle_timeout_secs: 1,
            max_consecutive_drops: 100,
            url_stats_cache_size: 16,
        }
    }

    #[test]
    fn clamps_min_and_max_threads() {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(
            ConnPoolConfig {
                min_threads: 50,
                max_threads: 10,
                max_conns: 4,
                thread_idle_timeout_secs: 1,
                max_consecutive_drops: 100,
                url_stats_cache_size: 16,
            },
            CountingHandler { seen },
            || {},
        );
        assert_eq!(pool.config.max_threads, 4);
        assert_eq!(pool.config.min_threads, 4);
        pool.stop(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn enqueue_and_drain() {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(test_config(), CountingHandler { seen: seen.clone() }, || {});

        for i in 0..6 {
            let outcome = pool.enqueue_with_url(Box::new(i), Some("/x".to_string()));
            assert_eq!(outcome, EnqueueOutcome::Ok);
        }

        pool.stop(Duration::from_secs(2)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 6);

        let snap = pool.snapshot();
        assert_eq!(snap.waiting_conns, 0);
        assert_eq!(snap.active_conns, 0);
        assert_eq!(snap.current_threads, 0);
    }

    #[test]
    fn overflow_when_free_stack_exhausted() {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(
            ConnPoolConfig {
                min_threads: 0,
                max_threads: 0,
                max_conns: 1,
                thread_idle_timeout_secs: 1,
                max_consecutive_drops: 100,
                url_stats_cache_size: 16,
            },
            CountingHandler { seen },
            || {},
        );
        assert_eq!(pool.enqueue(Box::new(1)), EnqueueOutcome::Ok);
        assert_eq!(pool.enqueue(Box::new(2)), EnqueueOutcome::Overflow);
    }

    #[test]
    fn shutdown_rejects_new_enqueues() {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(test_config(), CountingHandler { seen }, || {});
        pool.stop(Duration::from_secs(2)).unwrap();
        assert_eq!(
            pool.enqueue(Box::new(1)),
            EnqueueOutcome::ShuttingDown
        );
    }

    #[test]
    fn consecutive_drops_triggers_termination_signal() {
        let seen = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicUsize::new(0));
        let terminated2 = terminated.clone();
        let pool = ConnPool::new(
            ConnPoolConfig {
                min_threads: 0,
                max_threads: 0,
                max_conns: 1,
                thread_idle_timeout_secs: 1,
                max_consecutive_drops: 2,
                url_stats_cache_size: 16,
            },
            CountingHandler { seen },
            move || {
                terminated2.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(pool.enqueue(Box::new(1)), EnqueueOutcome::Ok);
        assert_eq!(pool.enqueue(Box::new(2)), EnqueueOutcome::Overflow);
        assert_eq!(pool.enqueue(Box::new(3)), EnqueueOutcome::Overflow);
        assert_eq!(pool.enqueue(Box::new(4)), EnqueueOutcome::Overflow);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }
}
