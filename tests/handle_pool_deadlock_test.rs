/*!
 * Integration tests for the resource-handle pool's deadlock-avoidance
 * and contention behavior.
 *
 * A single thread that already holds handles from a pool must be
 * rejected immediately (not blocked) if asking for more would push it
 * past the pool's max; a second, independent thread with no handles
 * held should instead wait and eventually time out if the pool stays
 * exhausted.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use servcore::config::HandlePoolConfig;
use servcore::core::handle_pool::{DbDriver, HandlePool};
use servcore::error::{Component, ServerError};
use servcore::Result;

struct FakeDriver {
    alive: Arc<AtomicBool>,
}

impl DbDriver for FakeDriver {
    fn connect(_datasource: &str, _user: Option<&str>, _password: Option<&str>) -> Result<Self> {
        Ok(FakeDriver {
            alive: Arc::new(AtomicBool::new(true)),
        })
    }
    fn disconnect(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
    fn reset(&mut self) {}
}

fn config(connections: u32) -> HandlePoolConfig {
    HandlePoolConfig {
        datasource: "test".into(),
        user: None,
        password: None,
        driver: "fake".into(),
        connections,
        max_idle_secs: 600,
        max_open_secs: 3600,
        check_interval_secs: 600,
        verbose: false,
        log_errors: true,
    }
}

#[test]
fn holding_thread_is_rejected_immediately_instead_of_blocking() {
    let pool: Arc<HandlePool<FakeDriver>> = HandlePool::new("db", config(2));
    pool.seed(2);

    let first = pool.acquire_multi(2, Duration::from_secs(1)).unwrap();
    assert_eq!(first.len(), 2);

    let start = std::time::Instant::now();
    let err = pool
        .acquire_multi(1, Duration::from_secs(5))
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, ServerError::Deadlock(Component::HandlePool)));
    assert!(
        elapsed < Duration::from_millis(200),
        "deadlock rejection should be immediate, took {elapsed:?}"
    );

    pool.return_handles(first);
}

#[test]
fn unrelated_thread_waits_then_times_out_while_pool_is_exhausted() {
    let pool: Arc<HandlePool<FakeDriver>> = HandlePool::new("db", config(1));
    pool.seed(1);

    let held = pool.acquire_multi(1, Duration::from_secs(1)).unwrap();

    let waiter_pool = pool.clone();
    let waiter = thread::spawn(move || {
        let start = std::time::Instant::now();
        let result = waiter_pool.acquire(Duration::from_millis(150));
        (result, start.elapsed())
    });

    let (result, elapsed) = waiter.join().unwrap();
    assert!(matches!(result, Err(ServerError::GetTimeout(Component::HandlePool))));
    assert!(elapsed >= Duration::from_millis(140));

    pool.return_handles(held);
}

#[test]
fn unrelated_thread_succeeds_once_handles_are_returned() {
    let pool: Arc<HandlePool<FakeDriver>> = HandlePool::new("db", config(1));
    pool.seed(1);

    let held = pool.acquire_multi(1, Duration::from_secs(1)).unwrap();
    let pool_for_waiter = pool.clone();

    let waiter = thread::spawn(move || pool_for_waiter.acquire(Duration::from_secs(2)));

    thread::sleep(Duration::from_millis(50));
    pool.return_handles(held);

    let handle = waiter.join().unwrap().unwrap();
    assert!(handle.connected());
    pool.return_handles(vec![handle]);
}
