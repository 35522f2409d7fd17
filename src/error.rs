/*!
 * Error types for servcore
 */

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Which core subsystem raised an error, for logging and instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Scheduler,
    Cache,
    TaskQueue,
    InterpPool,
    ProxyPool,
    HandlePool,
    ConnPool,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Scheduler => write!(f, "scheduler"),
            Component::Cache => write!(f, "cache"),
            Component::TaskQueue => write!(f, "task_queue"),
            Component::InterpPool => write!(f, "interp_pool"),
            Component::ProxyPool => write!(f, "proxy_pool"),
            Component::HandlePool => write!(f, "handle_pool"),
            Component::ConnPool => write!(f, "conn_pool"),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    /// Pool or stack exhausted (connection pool, recursive interp alloc)
    Overflow(Component),

    /// Operation refused because the owning subsystem is tearing down
    ShuttingDown(Component),

    /// Proxy is already evaluating a script
    Busy,

    /// Child process for a proxy is not alive
    Dead,

    /// Wait/Receive called without a prior Send
    Idle,

    /// Receive called before Wait completed
    NoWait,

    /// A child's init or reinit script failed
    Init(String),

    /// A reply frame could not be decoded into the caller's fields
    Import(String),

    /// Writing a request frame to a proxy pipe failed
    Send(io::Error),

    /// Reading a reply frame from a proxy pipe failed
    Recv(io::Error),

    /// Spawning a child process failed
    Exec(io::Error),

    /// Deadline expired while acquiring a proxy or handle
    GetTimeout(Component),

    /// Deadline expired while waiting for a proxy evaluation to finish
    EvalTimeout,

    /// Requested more handles/proxies than the pool's configured max
    Range(Component),

    /// This request, combined with other waiting threads' holds, could
    /// never be satisfied without risking deadlock
    Deadlock(Component),

    /// An id did not resolve to a known handle/proxy/event/task
    InvalidId(Component, String),

    /// I/O error without a more specific classification
    Io(io::Error),

    /// Configuration error
    Config(String),
}

impl ServerError {
    /// Which subsystem this error originated in, where known.
    pub fn component(&self) -> Option<Component> {
        match self {
            ServerError::Overflow(c) => Some(*c),
            ServerError::ShuttingDown(c) => Some(*c),
            ServerError::GetTimeout(c) => Some(*c),
            ServerError::Range(c) => Some(*c),
            ServerError::Deadlock(c) => Some(*c),
            ServerError::InvalidId(c, _) => Some(*c),
            ServerError::Busy
            | ServerError::Dead
            | ServerError::Idle
            | ServerError::NoWait
            | ServerError::Init(_)
            | ServerError::Import(_)
            | ServerError::Send(_)
            | ServerError::Recv(_)
            | ServerError::Exec(_)
            | ServerError::EvalTimeout => Some(Component::ProxyPool),
            ServerError::Io(_) | ServerError::Config(_) => None,
        }
    }

    /// Whether this error should not be retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Config(_) => true,
            ServerError::Import(_) => true,
            ServerError::Range(_) => true,
            ServerError::Deadlock(_) => true,
            ServerError::InvalidId(_, _) => true,
            ServerError::Init(_) => true,
            ServerError::Overflow(_) => true,
            ServerError::ShuttingDown(_) => true,

            ServerError::Busy
            | ServerError::Dead
            | ServerError::Idle
            | ServerError::NoWait
            | ServerError::Send(_)
            | ServerError::Recv(_)
            | ServerError::Exec(_)
            | ServerError::GetTimeout(_)
            | ServerError::EvalTimeout
            | ServerError::Io(_) => false,
        }
    }

    /// Whether this error is transient and often resolves on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::GetTimeout(_) | ServerError::EvalTimeout => true,
            ServerError::Dead | ServerError::Busy => true,
            ServerError::Io(err) => Self::is_io_transient(err),
            ServerError::Send(err) | ServerError::Recv(err) => Self::is_io_transient(err),
            _ => false,
        }
    }

    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
                | WriteZero
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Overflow(c) => write!(f, "{}: pool exhausted", c),
            ServerError::ShuttingDown(c) => write!(f, "{}: shutting down", c),
            ServerError::Busy => write!(f, "proxy busy"),
            ServerError::Dead => write!(f, "proxy child is not alive"),
            ServerError::Idle => write!(f, "no pending send to wait or receive on"),
            ServerError::NoWait => write!(f, "receive requested before wait completed"),
            ServerError::Init(msg) => write!(f, "init script failed: {}", msg),
            ServerError::Import(msg) => write!(f, "failed to import reply: {}", msg),
            ServerError::Send(err) => write!(f, "send failed: {}", err),
            ServerError::Recv(err) => write!(f, "receive failed: {}", err),
            ServerError::Exec(err) => write!(f, "exec failed: {}", err),
            ServerError::GetTimeout(c) => write!(f, "{}: timed out acquiring", c),
            ServerError::EvalTimeout => write!(f, "evaluation timed out"),
            ServerError::Range(c) => write!(f, "{}: requested more than pool max", c),
            ServerError::Deadlock(c) => write!(f, "{}: request would risk deadlock", c),
            ServerError::InvalidId(c, id) => write!(f, "{}: unknown id {}", c, id),
            ServerError::Io(err) => write!(f, "I/O error: {}", err),
            ServerError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(err) | ServerError::Send(err) | ServerError::Recv(err) | ServerError::Exec(err) => {
                Some(err)
            }
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        ServerError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(ServerError::Config("bad".into()).is_fatal());
        assert!(ServerError::Range(Component::HandlePool).is_fatal());
        assert!(ServerError::Deadlock(Component::ProxyPool).is_fatal());
    }

    #[test]
    fn non_fatal_errors() {
        assert!(!ServerError::Busy.is_fatal());
        assert!(!ServerError::GetTimeout(Component::ConnPool).is_fatal());
    }

    #[test]
    fn transient_errors() {
        assert!(ServerError::EvalTimeout.is_transient());
        assert!(ServerError::Dead.is_transient());
        assert!(!ServerError::Deadlock(Component::HandlePool).is_transient());
    }

    #[test]
    fn component_attribution() {
        assert_eq!(
            ServerError::Range(Component::ProxyPool).component(),
            Some(Component::ProxyPool)
        );
        assert_eq!(ServerError::Busy.component(), Some(Component::ProxyPool));
        assert_eq!(ServerError::Config("x".into()).component(), None);
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            ServerError::InvalidId(Component::HandlePool, "h1".into()).to_string(),
            "handle_pool: unknown id h1"
        );
    }
}
