/*!
 * servcore - Application server concurrency core
 *
 * A multi-threaded application-server runtime independent of any
 * specific protocol handler or script engine. Hosts seven
 * subsystems:
 *
 * - [`core::conn_pool`] (C7): a queue of accepted connections dispatched
 *   to an elastic thread pool.
 * - [`core::scheduler`] (C1): a timed/periodic dispatcher backed by a
 *   min-heap of events.
 * - [`core::cache`] (C2): a scoped LRU cache with single-flight fills.
 * - [`core::interp_pool`] (C4): a per-thread script-interpreter pool
 *   with generational shared-state update.
 * - [`core::proxy_pool`] (C5): a worker-subprocess pool exchanging
 *   length-framed requests over pipes.
 * - [`core::handle_pool`] (C6): a deadlock-free pooled resource
 *   (database handle) manager.
 * - [`core::task_queue`] (C3): a poll-driven non-blocking I/O task
 *   queue.
 *
 * HTTP parsing, on-disk path resolution, the script engine itself, and
 * the SQL driver are out of scope; the core only defines the contract
 * boundary ([`core::conn_pool::ConnHandler`], [`core::interp_pool::ScriptEngine`],
 * [`core::handle_pool::DbDriver`]) each collaborator must satisfy.
 */

pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use config::ServerConfig;
pub use error::{Component, Result, ServerError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
