/*!
 * Non-blocking I/O task queue (C3)
 *
 * One owner thread per queue; callers communicate only through a signal
 * list drained under the queue lock, so the owner thread is the sole
 * mutator of task state between drains. Grounded on
 * `examples/original_source/nsd/task.c`: the self-pipe trigger used to
 * wake a blocked `poll()`, the Init/Cancel/Done signal vocabulary, and
 * the fixed Exceptional -> Writable -> Readable dispatch order for a
 * descriptor with more than one ready event bit.
 */

use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

pub type TaskId = u64;

/// Event mask a task is interested in. Dispatch order for a descriptor
/// signalling more than one of these in a single poll is fixed:
/// Exceptional, then Writable, then Readable. A plain newtype over `u8`,
/// matching the donor crate's preference for small hand-rolled flag sets
/// over an external bitflags crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const EXCEPTIONAL: Interest = Interest(0b100);

    pub fn empty() -> Self {
        Interest(0)
    }

    pub fn contains(&self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// What happened on a task's callback invocation.
pub enum Event {
    Init,
    Readable,
    Writable,
    Exceptional,
    Timeout,
    Cancel,
    Exit,
}

pub type TaskCallback = Box<dyn FnMut(TaskId, RawFd, Event) -> TaskAction + Send>;

/// What the callback wants to happen next.
pub enum TaskAction {
    /// Keep waiting with a (possibly updated) interest set and deadline.
    Continue(Interest, Option<Instant>),
    /// The task is finished; it will be removed from the queue.
    Done,
}

struct Task {
    fd: RawFd,
    interest: Interest,
    deadline: Option<Instant>,
    callback: TaskCallback,
    cancel_requested: bool,
    init_pending: bool,
}

struct State {
    tasks: std::collections::HashMap<TaskId, Task>,
    next_id: TaskId,
    signalled: Vec<TaskId>,
    shutdown: bool,
    stopped: bool,
}

/// One poll-driven queue with its own owner thread.
pub struct TaskQueue {
    state: Mutex<State>,
    cond: Condvar,
    trigger_write: RawFd,
    trigger_read: RawFd,
    owner: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(name: &str) -> std::io::Result<Arc<Self>> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        unsafe {
            set_nonblocking(fds[0]);
            set_nonblocking(fds[1]);
        }

        let queue = Arc::new(Self {
            state: Mutex::new(State {
                tasks: std::collections::HashMap::new(),
                next_id: 1,
                signalled: Vec::new(),
                shutdown: false,
                stopped: false,
            }),
            cond: Condvar::new(),
            trigger_read: fds[0],
            trigger_write: fds[1],
            owner: Mutex::new(None),
        });

        let owner_queue = queue.clone();
        let thread_name = format!("task-queue-{name}");
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || owner_queue.owner_loop())
            .expect("spawn task queue owner thread");
        *queue.owner.lock().unwrap() = Some(handle);

        Ok(queue)
    }

    /// Register a new task; its callback will first receive `Event::Init`
    /// on the owner thread, which should return the real interest set.
    pub fn enqueue(&self, fd: RawFd, callback: TaskCallback) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(
            id,
            Task {
                fd,
                interest: Interest::empty(),
                deadline: None,
                callback,
                cancel_requested: false,
                init_pending: true,
            },
        );
        state.signalled.push(id);
        drop(state);
        self.trigger();
        id
    }

    /// Request cancellation. Advisory: the task's callback still must
    /// observe `Event::Cancel` and return `TaskAction::Done`.
    pub fn cancel(&self, id: TaskId) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.cancel_requested = true;
            state.signalled.push(id);
        }
        drop(state);
        self.trigger();
    }

    fn trigger(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.trigger_write, byte.as_ptr() as *const _, 1);
        }
    }

    fn drain_trigger(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.trigger_read, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.trigger();
        self.cond.notify_all();

        if let Some(handle) = self.owner.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn owner_loop(self: Arc<Self>) {
        loop {
            let mut init_ids = Vec::new();
            let mut cancel_ids = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                if state.shutdown {
                    self.finish_shutdown(&mut state);
                    return;
                }
                for id in state.signalled.drain(..).collect::<Vec<_>>() {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        if task.init_pending {
                            task.init_pending = false;
                            init_ids.push(id);
                        }
                        if task.cancel_requested {
                            cancel_ids.push(id);
                        }
                    }
                }
            }

            for id in init_ids {
                self.invoke(id, Event::Init);
            }
            for id in cancel_ids {
                self.invoke(id, Event::Cancel);
            }

            let (pollfds, ids, deadline) = {
                let state = self.state.lock().unwrap();
                if state.shutdown {
                    drop(state);
                    let mut state = self.state.lock().unwrap();
                    self.finish_shutdown(&mut state);
                    return;
                }
                self.build_pollfds(&state)
            };

            let timeout_ms = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if d <= now {
                        0
                    } else {
                        (d - now).as_millis().min(i32::MAX as u128) as i32
                    }
                }
                None => -1,
            };

            let mut raw = pollfds;
            let rc = unsafe { libc::poll(raw.as_mut_ptr(), raw.len() as libc::nfds_t, timeout_ms) };

            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    error!(?err, "poll failed in task queue");
                }
                continue;
            }

            if raw[0].revents != 0 {
                self.drain_trigger();
            }

            let now = Instant::now();
            for (slot, id) in raw.iter().skip(1).zip(ids.iter()) {
                self.dispatch_ready(*id, slot.revents, now);
            }
        }
    }

    fn build_pollfds(&self, state: &State) -> (Vec<libc::pollfd>, Vec<TaskId>, Option<Instant>) {
        let mut pollfds = vec![libc::pollfd {
            fd: self.trigger_read,
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut ids = Vec::new();
        let mut deadline: Option<Instant> = None;

        for (&id, task) in state.tasks.iter() {
            let mut events = 0;
            if task.interest.contains(Interest::EXCEPTIONAL) {
                events |= libc::POLLPRI;
            }
            if task.interest.contains(Interest::WRITABLE) {
                events |= libc::POLLOUT;
            }
            if task.interest.contains(Interest::READABLE) {
                events |= libc::POLLIN;
            }
            pollfds.push(libc::pollfd {
                fd: task.fd,
                events,
                revents: 0,
            });
            ids.push(id);

            if let Some(d) = task.deadline {
                deadline = Some(deadline.map_or(d, |cur| cur.min(d)));
            }
        }

        (pollfds, ids, deadline)
    }

    fn dispatch_ready(&self, id: TaskId, revents: i16, now: Instant) {
        if revents == 0 {
            let expired = {
                let state = self.state.lock().unwrap();
                state
                    .tasks
                    .get(&id)
                    .and_then(|t| t.deadline)
                    .map_or(false, |d| d <= now)
            };
            if expired {
                self.invoke(id, Event::Timeout);
            }
            return;
        }

        let hup_as_readable = revents & (libc::POLLHUP | libc::POLLIN) != 0;

        // Fixed order: exceptional, writable, readable.
        if revents & libc::POLLPRI != 0 {
            self.invoke(id, Event::Exceptional);
        }
        if revents & libc::POLLOUT != 0 {
            self.invoke(id, Event::Writable);
        }
        if hup_as_readable {
            self.invoke(id, Event::Readable);
        }
    }

    fn invoke(&self, id: TaskId, event: Event) {
        let mut state = self.state.lock().unwrap();
        let Some(mut task) = state.tasks.remove(&id) else {
            return;
        };
        drop(state);

        let fd = task.fd;
        let action = (task.callback)(id, fd, event);

        let mut state = self.state.lock().unwrap();
        match action {
            TaskAction::Continue(interest, deadline) => {
                task.interest = interest;
                task.deadline = deadline;
                state.tasks.insert(id, task);
            }
            TaskAction::Done => {
                debug!(task_id = id, "task completed");
            }
        }
    }

    fn finish_shutdown(&self, state: &mut State) {
        let remaining: Vec<(TaskId, Task)> = state.tasks.drain().collect();
        state.stopped = true;

        for (id, mut task) in remaining {
            let _ = (task.callback)(id, task.fd, Event::Exit);
        }
        self.cond.notify_all();
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.trigger_read);
            libc::close(self.trigger_write);
        }
    }
}

unsafe fn set_nonblocking(fd: RawFd) {
    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
    if flags >= 0 {
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        (fds[0], fds[1])
    }

    #[test]
    fn readable_task_fires_on_write() {
        let queue = TaskQueue::new("test").unwrap();
        let (read_fd, write_fd) = make_pipe();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        queue.enqueue(
            read_fd,
            Box::new(move |_id, _fd, event| match event {
                Event::Init => TaskAction::Continue(Interest::READABLE, None),
                Event::Readable => {
                    f.fetch_add(1, Ordering::SeqCst);
                    TaskAction::Done
                }
                _ => TaskAction::Done,
            }),
        );

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const _, 1);
        }

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        queue.shutdown();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn cancel_delivers_cancel_event() {
        let queue = TaskQueue::new("test-cancel").unwrap();
        let (read_fd, write_fd) = make_pipe();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = cancelled.clone();

        let id = queue.enqueue(
            read_fd,
            Box::new(move |_id, _fd, event| match event {
                Event::Init => TaskAction::Continue(Interest::READABLE, None),
                Event::Cancel => {
                    c.fetch_add(1, Ordering::SeqCst);
                    TaskAction::Done
                }
                _ => TaskAction::Continue(Interest::READABLE, None),
            }),
        );

        thread::sleep(Duration::from_millis(20));
        queue.cancel(id);
        thread::sleep(Duration::from_millis(100));

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        queue.shutdown();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn shutdown_invokes_exit_on_remaining_tasks() {
        let queue = TaskQueue::new("test-exit").unwrap();
        let (read_fd, write_fd) = make_pipe();
        let exited = Arc::new(AtomicUsize::new(0));
        let e = exited.clone();

        queue.enqueue(
            read_fd,
            Box::new(move |_id, _fd, event| match event {
                Event::Init => TaskAction::Continue(Interest::READABLE, None),
                Event::Exit => {
                    e.fetch_add(1, Ordering::SeqCst);
                    TaskAction::Done
                }
                _ => TaskAction::Continue(Interest::READABLE, None),
            }),
        );

        thread::sleep(Duration::from_millis(20));
        queue.shutdown();

        assert_eq!(exited.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
