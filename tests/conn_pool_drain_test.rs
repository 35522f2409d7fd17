/*!
 * Integration test for the connection worker pool's shutdown drain.
 *
 * Queues a burst of work, starts shutting down while some of it is
 * still in flight, and verifies `stop` blocks until every queued
 * connection has actually been serviced and every service thread has
 * exited, rather than just discarding the backlog.
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use servcore::config::ConnPoolConfig;
use servcore::core::conn_pool::{ConnHandler, ConnPool, ConnRecord, EnqueueOutcome};

struct SlowHandler {
    serviced: Arc<AtomicUsize>,
}

impl ConnHandler for SlowHandler {
    fn service(&self, _conn: &mut ConnRecord) {
        std::thread::sleep(Duration::from_millis(15));
        self.serviced.fetch_add(1, Ordering::SeqCst);
    }
}

fn config() -> ConnPoolConfig {
    ConnPoolConfig {
        min_threads: 2,
        max_threads: 4,
        max_conns: 32,
        thread_idle_timeout_secs: 5,
        max_consecutive_drops: 1000,
        url_stats_cache_size: 16,
    }
}

#[test]
fn stop_drains_the_backlog_before_returning() {
    let serviced = Arc::new(AtomicUsize::new(0));
    let pool = ConnPool::new(
        config(),
        SlowHandler { serviced: serviced.clone() },
        || {},
    );

    for i in 0..20 {
        let outcome = pool.enqueue(Box::new(i));
        assert_eq!(outcome, EnqueueOutcome::Ok);
    }

    pool.stop(Duration::from_secs(5)).unwrap();

    assert_eq!(serviced.load(Ordering::SeqCst), 20, "every queued connection must be serviced before stop returns");
    let snap = pool.snapshot();
    assert_eq!(snap.current_threads, 0);
    assert_eq!(snap.waiting_conns, 0);
    assert_eq!(snap.active_conns, 0);
}

#[test]
fn enqueue_after_stop_is_rejected_and_handler_never_called_again() {
    let serviced = Arc::new(AtomicUsize::new(0));
    let pool = ConnPool::new(
        config(),
        SlowHandler { serviced: serviced.clone() },
        || {},
    );

    pool.enqueue(Box::new(1));
    pool.stop(Duration::from_secs(5)).unwrap();
    let after_stop = serviced.load(Ordering::SeqCst);

    assert_eq!(pool.enqueue(Box::new(2)), EnqueueOutcome::ShuttingDown);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(serviced.load(Ordering::SeqCst), after_stop, "rejected enqueue must not be serviced");
}

#[test]
fn stop_times_out_if_a_service_thread_never_drains() {
    struct StuckHandler;
    impl ConnHandler for StuckHandler {
        fn service(&self, _conn: &mut ConnRecord) {
            std::thread::sleep(Duration::from_secs(10));
        }
    }

    let pool = ConnPool::new(
        ConnPoolConfig {
            min_threads: 1,
            max_threads: 1,
            max_conns: 4,
            thread_idle_timeout_secs: 30,
            max_consecutive_drops: 1000,
            url_stats_cache_size: 16,
        },
        StuckHandler,
        || {},
    );

    pool.enqueue(Box::new(1));
    std::thread::sleep(Duration::from_millis(20));

    let err = pool.stop(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, servcore::ServerError::GetTimeout(servcore::Component::ConnPool)));
}
