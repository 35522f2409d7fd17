/*!
 * Monotonic thread identifiers
 *
 * The donor C sources mint a human-readable thread id by casting a
 * pthread_t through an int, which is non-portable. Rust's
 * `std::thread::ThreadId` has no portable integer representation either,
 * so each thread that enters the core mints its own id here the first
 * time it's asked.
 */

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THIS_THREAD: Cell<u64> = Cell::new(0);
}

/// Returns a small monotonic id unique to the calling thread, minted on
/// first use and stable for the thread's lifetime.
pub fn current() -> u64 {
    THIS_THREAD.with(|cell| {
        let mut id = cell.get();
        if id == 0 {
            id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            cell.set(id);
        }
        id
    })
}
