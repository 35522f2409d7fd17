/*!
 * Worker subprocess pool (C5)
 *
 * Runs untrusted or leak-prone script evaluation in child processes,
 * communicating over the length-prefixed frames in [`crate::core::wire`].
 * Grounded on `examples/original_source/nsproxy/nsproxylib.c`'s `Pool`,
 * `Proc`, `GetPool`, `PopProxy`/`PushProxy`, `Send`/`Wait`/`Recv`, and the
 * closer-thread kill escalation in `CloseProc`.
 */

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Cursor;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ProxyPoolConfig;
use crate::core::interp_pool::ScriptEngine;
use crate::core::wire::{self, Reply, Request};
use crate::error::{Component, Result, ServerError};

/// Width of the `activeSlot` argv placeholder passed to every child.
/// The child overwrites this space-filled buffer in place with
/// `{<script-prefix> ...}` while evaluating and zeroes it on
/// completion, so a `ps`-line shows which script a proxy is running.
const ACTIVE_SLOT_WIDTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Busy,
    Dead,
}

/// A single checked-out worker. Not `Clone`: ownership of the
/// underlying pipes moves with it until it is returned to the pool.
pub struct Proxy {
    id: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    state: RunState,
    last_script: Vec<u8>,
}

impl Proxy {
    fn new(id: String) -> Self {
        Self {
            id,
            child: None,
            stdin: None,
            stdout: None,
            state: RunState::Dead,
            last_script: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.child.is_some() && self.state != RunState::Dead
    }

    pub fn last_script(&self) -> &[u8] {
        &self.last_script
    }
}

struct PoolState {
    free: Vec<Proxy>,
    running: usize,
    avail: isize,
    next_seq: u64,
    exclusive_waiter: bool,
    shutdown: bool,
    /// Proxy id -> last script sent, for proxies currently checked out
    /// and mid-evaluation (Busy). Populated in `send`, cleared in `recv`
    /// on success and in `release`/`release_unchecked` unconditionally.
    checked_out: HashMap<String, Vec<u8>>,
}

thread_local! {
    static HELD: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// A named pool of worker subprocesses. Clients check out one or more
/// [`Proxy`] handles via [`ProxyPool::get`], evaluate scripts on them,
/// and return them via [`ProxyPool::release`].
pub struct ProxyPool {
    id: usize,
    pub name: String,
    config: Mutex<ProxyPoolConfig>,
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl ProxyPool {
    pub fn new(name: impl Into<String>, config: ProxyPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            config: Mutex::new(config),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                running: 0,
                avail: 0,
                next_seq: 0,
                exclusive_waiter: false,
                shutdown: false,
                checked_out: HashMap::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Adjusts limits/timeouts/scripts on a live pool, recomputing
    /// `avail` from `max - running` and dropping idle proxies.
    pub fn configure(&self, new_config: ProxyPoolConfig) {
        let mut config = self.config.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.avail = new_config.max as isize - state.running as isize;
        state.free.clear();
        *config = new_config;
        self.cond.notify_all();
    }

    /// Checks out `count` proxies, spawning children as needed. The
    /// caller's thread must not already hold enough proxies from this
    /// pool to exceed `max` when combined with `count`, or this returns
    /// `Deadlock` immediately rather than blocking forever.
    pub fn get(&self, count: usize, timeout: Option<Duration>) -> Result<Vec<Proxy>> {
        let config = self.config.lock().unwrap().clone();
        if count > config.max {
            return Err(ServerError::Range(Component::ProxyPool));
        }

        let already_held = HELD.with(|h| *h.borrow().get(&self.id).unwrap_or(&0));
        if already_held + count > config.max {
            return Err(ServerError::Deadlock(Component::ProxyPool));
        }

        let deadline = Instant::now() + timeout.unwrap_or_else(|| config.get_timeout());

        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return Err(ServerError::ShuttingDown(Component::ProxyPool));
            }
            if !state.exclusive_waiter {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ServerError::GetTimeout(Component::ProxyPool));
            }
            let (guard, timeout_result) = self.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
            if timeout_result.timed_out() {
                return Err(ServerError::GetTimeout(Component::ProxyPool));
            }
        }
        state.exclusive_waiter = true;

        let mut acquired: Vec<Proxy> = Vec::with_capacity(count);
        let outcome = loop {
            while acquired.len() < count {
                if let Some(proxy) = state.free.pop() {
                    state.avail -= 1;
                    acquired.push(proxy);
                } else if state.running < config.max {
                    state.running += 1;
                    state.avail -= 1;
                    state.next_seq += 1;
                    let id = wire::proxy_id(&self.name, state.next_seq, 64);
                    acquired.push(Proxy::new(id));
                } else {
                    break;
                }
            }

            if acquired.len() >= count {
                break Ok(());
            }
            if Instant::now() >= deadline {
                break Err(ServerError::GetTimeout(Component::ProxyPool));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (guard, _) = self.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
        };

        state.exclusive_waiter = false;
        self.cond.notify_all();

        match outcome {
            Ok(()) => {
                drop(state);
                HELD.with(|h| {
                    *h.borrow_mut().entry(self.id).or_insert(0) += count;
                });

                let mut check_failure = None;
                for proxy in acquired.iter_mut() {
                    if let Err(e) = self.check(proxy, &config) {
                        check_failure = Some(e);
                        break;
                    }
                }

                if let Some(e) = check_failure {
                    self.release_unchecked(acquired);
                    HELD.with(|h| {
                        if let Some(n) = h.borrow_mut().get_mut(&self.id) {
                            *n = n.saturating_sub(count);
                        }
                    });
                    return Err(e);
                }
                Ok(acquired)
            }
            Err(e) => {
                for proxy in acquired {
                    state.running = state.running.saturating_sub(1);
                    state.avail += 1;
                    drop(proxy);
                }
                Err(e)
            }
        }
    }

    /// Spawns a child if this proxy has none, then evaluates the pool's
    /// init script on it. On any failure, the proxy is marked dead so
    /// [`ProxyPool::release`] hands it to the closer thread.
    fn check(&self, proxy: &mut Proxy, config: &ProxyPoolConfig) -> Result<()> {
        if proxy.is_alive() {
            return Ok(());
        }

        // argv contract: execPath, poolName, proxyId, activeSlot. The
        // active slot starts blank; only the child rewrites it in
        // place once evaluation is underway.
        let mut child = Command::new(&config.exec)
            .arg(&self.name)
            .arg(&proxy.id)
            .arg(" ".repeat(ACTIVE_SLOT_WIDTH))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(ServerError::Exec)?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        set_nonblocking(stdin.as_raw_fd());
        set_nonblocking(stdout.as_raw_fd());

        proxy.child = Some(child);
        proxy.stdin = Some(stdin);
        proxy.stdout = Some(stdout);
        proxy.state = RunState::Idle;

        if let Some(init) = &config.init {
            self.send(proxy, init.as_bytes(), config.send_timeout())?;
            self.wait(proxy, config.eval_timeout())?;
            let reply = self.recv(proxy, config.recv_timeout())?;
            if reply.code != 0 {
                proxy.state = RunState::Dead;
                return Err(ServerError::Init(String::from_utf8_lossy(&reply.err_info).into_owned()));
            }
        }

        Ok(())
    }

    /// Send phase of a three-phase evaluation. Fails if the proxy is
    /// not Idle or the child has died.
    pub fn send(&self, proxy: &mut Proxy, script: &[u8], timeout: Duration) -> Result<()> {
        if proxy.state == RunState::Dead || !proxy.is_alive() {
            return Err(ServerError::Dead);
        }
        if proxy.state != RunState::Idle {
            return Err(ServerError::Busy);
        }

        let fd = proxy.stdin.as_ref().expect("alive proxy has stdin").as_raw_fd();
        let frame = Request::new(script.to_vec()).encode();
        let deadline = Instant::now() + timeout;

        write_all_nonblocking(fd, &frame, deadline).map_err(ServerError::Send)?;
        proxy.last_script = script.to_vec();
        proxy.state = RunState::Busy;
        self.state
            .lock()
            .unwrap()
            .checked_out
            .insert(proxy.id.clone(), script.to_vec());
        Ok(())
    }

    /// Wait phase: blocks (via poll) until the reply is readable or the
    /// timeout expires.
    pub fn wait(&self, proxy: &mut Proxy, timeout: Duration) -> Result<()> {
        if proxy.state != RunState::Busy {
            return Err(ServerError::Idle);
        }
        let fd = proxy.stdout.as_ref().expect("alive proxy has stdout").as_raw_fd();

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if rc == 0 {
            return Err(ServerError::EvalTimeout);
        }
        if rc < 0 {
            return Err(ServerError::Recv(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Receive phase: reads the reply frame, importing into a
    /// [`Reply`]. Marks the proxy Idle on success.
    pub fn recv(&self, proxy: &mut Proxy, timeout: Duration) -> Result<Reply> {
        let fd = proxy.stdout.as_ref().expect("alive proxy has stdout").as_raw_fd();
        let deadline = Instant::now() + timeout;

        let len_buf = read_exact_nonblocking(fd, 4, deadline).map_err(ServerError::Recv)?;
        let total_len = u32::from_be_bytes(len_buf.clone().try_into().unwrap()) as usize;
        let body = read_exact_nonblocking(fd, total_len, deadline).map_err(ServerError::Recv)?;

        let mut full = len_buf;
        full.extend_from_slice(&body);
        let reply = Reply::read_from(Cursor::new(full))
            .map_err(|e| ServerError::Import(e.to_string()))?;

        proxy.state = RunState::Idle;
        self.state.lock().unwrap().checked_out.remove(&proxy.id);
        Ok(reply)
    }

    /// Evaluates a script end to end (Send, Wait, Receive).
    pub fn eval(&self, proxy: &mut Proxy, script: &[u8], config: &ProxyPoolConfig) -> Result<Reply> {
        self.send(proxy, script, config.send_timeout())?;
        self.wait(proxy, config.eval_timeout())?;
        self.recv(proxy, config.recv_timeout())
    }

    /// Returns proxies to the pool. Any proxy that is not Idle, or
    /// marked Dead, is handed to a background closer thread instead of
    /// being recycled.
    pub fn release(&self, proxies: Vec<Proxy>) {
        let count = proxies.len();
        let wait_timeout = self.config.lock().unwrap().wait_timeout();
        let mut state = self.state.lock().unwrap();

        for mut proxy in proxies {
            state.checked_out.remove(&proxy.id);
            if proxy.state == RunState::Idle && proxy.is_alive() {
                state.free.push(proxy);
                state.avail += 1;
            } else {
                state.running = state.running.saturating_sub(1);
                state.avail += 1;
                spawn_closer(proxy.id.clone(), proxy.child.take(), wait_timeout);
            }
        }
        self.cond.notify_all();
        drop(state);

        HELD.with(|h| {
            if let Some(n) = h.borrow_mut().get_mut(&self.id) {
                *n = n.saturating_sub(count);
            }
        });
    }

    /// Internal helper used when `get` must unwind a partial checkout
    /// after a `Check` failure: same effect as `release`.
    fn release_unchecked(&self, proxies: Vec<Proxy>) {
        self.release(proxies);
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        let wait_timeout = self.config.lock().unwrap().wait_timeout();
        for proxy in state.free.drain(..) {
            spawn_closer(proxy.id.clone(), {
                let mut p = proxy;
                p.child.take()
            }, wait_timeout);
        }
        self.cond.notify_all();
    }

    /// Read-only listing of this pool's non-idle proxies, paired with
    /// the script bytes that were last sent to each.
    pub fn active(&self) -> Vec<(String, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .checked_out
            .iter()
            .map(|(id, script)| (id.clone(), script.clone()))
            .collect()
    }
}

/// Escalating kill sequence for a proxy's child process, run off the
/// caller's thread so `release`/`shutdown` never block on a stuck
/// child. Poll for EOF, then SIGTERM, then SIGKILL, each with its own
/// wait window; if the child survives all three, leak the pid (drop
/// without reaping) and log a zombie warning.
fn spawn_closer(id: String, child: Option<Child>, wait_timeout: Duration) {
    let Some(mut child) = child else { return };

    thread::spawn(move || {
        let pid = child.id() as libc::pid_t;

        if wait_for_exit(pid, wait_timeout) {
            reap(&mut child, &id);
            return;
        }

        tracing::debug!(proxy = %id, "child did not exit on its own, sending SIGTERM");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        if wait_for_exit(pid, wait_timeout) {
            reap(&mut child, &id);
            return;
        }

        tracing::warn!(proxy = %id, "child ignored SIGTERM, sending SIGKILL");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        if wait_for_exit(pid, wait_timeout) {
            reap(&mut child, &id);
            return;
        }

        tracing::warn!(proxy = %id, pid, "child survived SIGKILL, leaking pid as zombie");
        std::mem::forget(child);
    });
}

fn wait_for_exit(pid: libc::pid_t, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid {
            return true;
        }
        if rc < 0 {
            // already reaped or no such process
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn reap(child: &mut Child, id: &str) {
    match child.wait() {
        Ok(status) => tracing::debug!(proxy = %id, ?status, "proxy child reaped"),
        Err(e) => tracing::debug!(proxy = %id, error = %e, "proxy child already reaped"),
    }
}

/// Registry of named proxy pools, lazily creating a pool with default
/// limits/timeouts on first reference.
pub struct ProxyPoolRegistry {
    pools: Mutex<HashMap<String, Arc<ProxyPool>>>,
}

impl Default for ProxyPoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyPoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self, name: &str, default_config: ProxyPoolConfig) -> Arc<ProxyPool> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(name.to_string())
            .or_insert_with(|| ProxyPool::new(name, default_config))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyPool>> {
        self.pools.lock().unwrap().get(name).cloned()
    }
}

/// Entry point for a proxy child process: reads length-prefixed
/// request frames from stdin, evaluates each with a fresh script
/// engine, and writes length-prefixed reply frames to stdout. Intended
/// to be the whole `main` of a companion binary invoked by
/// [`ProxyPool::check`]'s `exec`. A version mismatch on an incoming
/// request is fatal, matching `nsproxylib.c`'s child loop.
pub fn child_main<E: ScriptEngine>(init_script: Option<&str>) -> ! {
    use std::io::{self as stdio, Read, Write};

    let stdin = stdio::stdin();
    let mut input = stdin.lock();
    let stdout = stdio::stdout();
    let mut output = stdout.lock();

    let mut engine = E::create();
    if let Some(init) = init_script {
        if let Err(e) = engine.eval_init(init) {
            let reply = Reply::error(1, b"EInit".to_vec(), e.into_bytes());
            let _ = output.write_all(&reply.encode());
            let _ = output.flush();
            std::process::exit(1);
        }
    }

    loop {
        let request = match Request::read_from(&mut input) {
            Ok(req) => req,
            Err(_) => std::process::exit(0), // EOF or I/O error: parent closed the pipe
        };

        if request.major != wire::PROTOCOL_MAJOR || request.minor != wire::PROTOCOL_MINOR {
            eprintln!(
                "proxy child: protocol version mismatch ({}.{} != {}.{}), exiting",
                request.major, request.minor, wire::PROTOCOL_MAJOR, wire::PROTOCOL_MINOR
            );
            std::process::exit(1);
        }

        if request.script.is_empty() {
            // Ping: reply ok with no result, engine untouched.
            let reply = Reply::ok(Vec::new());
            let _ = output.write_all(&reply.encode());
            let _ = output.flush();
            continue;
        }

        let script = String::from_utf8_lossy(&request.script).into_owned();
        let reply = match engine.eval(&script) {
            Ok(result) => Reply::ok(result.into_bytes()),
            Err(e) => Reply::error(1, b"EEval".to_vec(), e.into_bytes()),
        };

        if output.write_all(&reply.encode()).is_err() {
            std::process::exit(1);
        }
        let _ = output.flush();
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

fn poll_once(fd: RawFd, events: libc::c_short, timeout_ms: i32) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(rc > 0)
}

fn write_all_nonblocking(fd: RawFd, data: &[u8], deadline: Instant) -> std::io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        let remaining_ms = remaining_millis(deadline);
        if remaining_ms == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "proxy send timed out"));
        }
        if !poll_once(fd, libc::POLLOUT, remaining_ms)? {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "proxy send timed out"));
        }
        let n = unsafe {
            libc::write(
                fd,
                data[written..].as_ptr() as *const _,
                data.len() - written,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(err);
        }
        written += n as usize;
    }
    Ok(())
}

fn read_exact_nonblocking(fd: RawFd, n: usize, deadline: Instant) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut read = 0;
    while read < n {
        let remaining_ms = remaining_millis(deadline);
        if remaining_ms == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "proxy recv timed out"));
        }
        if !poll_once(fd, libc::POLLIN, remaining_ms)? {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "proxy recv timed out"));
        }
        let rc = unsafe {
            libc::read(fd, buf[read..].as_mut_ptr() as *mut _, n - read)
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "proxy child closed pipe"));
        }
        read += rc as usize;
    }
    Ok(buf)
}

fn remaining_millis(deadline: Instant) -> i32 {
    let now = Instant::now();
    if now >= deadline {
        0
    } else {
        (deadline - now).as_millis().min(i32::MAX as u128) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProxyPoolConfig {
        ProxyPoolConfig {
            exec: std::path::PathBuf::from("/bin/cat"),
            init: None,
            reinit: None,
            min: 0,
            max: 2,
            get_timeout_ms: 200,
            eval_timeout_ms: 200,
            send_timeout_ms: 200,
            recv_timeout_ms: 200,
            wait_timeout_ms: 200,
        }
    }

    #[test]
    fn get_beyond_max_is_range_error() {
        let pool = ProxyPool::new("test", test_config());
        let err = pool.get(5, None).unwrap_err();
        assert!(matches!(err, ServerError::Range(Component::ProxyPool)));
    }

    #[test]
    fn already_held_plus_count_over_max_is_deadlock() {
        let pool = ProxyPool::new("test", test_config());
        HELD.with(|h| h.borrow_mut().insert(pool.id, 2));
        let err = pool.get(1, None).unwrap_err();
        assert!(matches!(err, ServerError::Deadlock(Component::ProxyPool)));
        HELD.with(|h| h.borrow_mut().clear());
    }

    #[test]
    fn proxy_id_format_matches_wire_helper() {
        let pool = ProxyPool::new("accounts", test_config());
        let mut state = pool.state.lock().unwrap();
        state.next_seq = 1;
        let id = wire::proxy_id(&pool.name, state.next_seq, 64);
        assert_eq!(id, "accounts-proxy-1");
    }

    #[test]
    fn configure_recomputes_avail_and_drops_idle() {
        let pool = ProxyPool::new("test", test_config());
        {
            let mut state = pool.state.lock().unwrap();
            state.running = 1;
            state.free.push(Proxy::new("test-proxy-1".into()));
        }
        let mut new_cfg = test_config();
        new_cfg.max = 3;
        pool.configure(new_cfg);
        let state = pool.state.lock().unwrap();
        assert_eq!(state.avail, 2);
        assert!(state.free.is_empty());
    }

    #[test]
    fn send_on_non_idle_proxy_is_busy_error() {
        let pool = ProxyPool::new("test", test_config());
        let mut proxy = Proxy::new("test-proxy-1".into());
        proxy.state = RunState::Busy;
        proxy.child = Some(Command::new("/bin/cat").stdin(Stdio::piped()).stdout(Stdio::piped()).spawn().unwrap());
        proxy.stdin = proxy.child.as_mut().unwrap().stdin.take();
        proxy.stdout = proxy.child.as_mut().unwrap().stdout.take();

        let err = pool.send(&mut proxy, b"ping", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ServerError::Busy));
    }

    #[test]
    fn wait_on_idle_proxy_without_send_is_idle_error() {
        let pool = ProxyPool::new("test", test_config());
        let mut proxy = Proxy::new("test-proxy-1".into());
        proxy.state = RunState::Idle;
        let err = pool.wait(&mut proxy, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ServerError::Idle));
    }

    #[test]
    fn active_reports_sent_script_until_released() {
        let pool = ProxyPool::new("test", test_config());
        let mut proxy = Proxy::new("test-proxy-1".into());
        proxy.child = Some(Command::new("/bin/cat").stdin(Stdio::piped()).stdout(Stdio::piped()).spawn().unwrap());
        proxy.stdin = proxy.child.as_mut().unwrap().stdin.take();
        proxy.stdout = proxy.child.as_mut().unwrap().stdout.take();
        proxy.state = RunState::Idle;

        assert!(pool.active().is_empty());

        pool.send(&mut proxy, b"do work", Duration::from_millis(200)).unwrap();
        let active = pool.active();
        assert_eq!(active, vec![("test-proxy-1".to_string(), b"do work".to_vec())]);

        // released while still Busy: handed to the closer, not recycled,
        // but the checked-out entry is cleared either way.
        pool.release(vec![proxy]);
        assert!(pool.active().is_empty());
    }
}
