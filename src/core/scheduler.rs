/*!
 * Timed/periodic scheduler (C1)
 *
 * A dispatcher thread drives a min-heap of events ordered by absolute
 * next-fire time. Events flagged `Thread` are handed to a pool of
 * detached event workers created on demand; everything else runs
 * synchronously on the dispatcher thread between heap pops.
 *
 * Grounded on `examples/original_source/nsd/sched.c`: the stored
 * heap-position field on every event (enabling O(log n) cancellation),
 * the grow-by-1000 heap storage policy, and the daily/weekly next-fire
 * computation (zero hour/minute/second, apply the configured
 * seconds-of-period, roll forward a day/week if not strictly in the
 * future).
 */

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, Timelike};
use tracing::{debug, instrument, warn};

use crate::error::{Component, Result, ServerError};

pub type EventId = u64;

type Callback = Box<dyn FnMut() + Send>;
type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Once,
    Interval(Duration),
    Daily(u32),
    Weekly(u32),
}

impl Schedule {
    fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::Once)
    }
}

struct Event {
    id: EventId,
    schedule: Schedule,
    detached: bool,
    paused: bool,
    running: bool,
    next_fire: Instant,
    heap_pos: usize,
    callback: Option<Callback>,
    cleanup: Option<Cleanup>,
}

/// Binary min-heap over event ids, ordered by `next_fire`. Maintains each
/// event's `heap_pos` (1-indexed; 0 means "not in the heap") so a cancel
/// can locate its slot directly instead of scanning.
struct Heap {
    slots: Vec<EventId>,
}

impl Heap {
    fn new() -> Self {
        // Grow-by-1000 policy from sched.c's QueueEvent; Vec's own growth
        // strategy already amortizes this, so no manual reserve loop is
        // needed, but we seed capacity to avoid the first few reallocs.
        Self {
            slots: Vec::with_capacity(1000),
        }
    }

    fn peek(&self) -> Option<EventId> {
        self.slots.first().copied()
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn push(&mut self, id: EventId, events: &mut HashMap<EventId, Event>) {
        self.slots.push(id);
        let pos = self.slots.len() - 1;
        events.get_mut(&id).unwrap().heap_pos = pos + 1;
        self.sift_up(pos, events);
    }

    fn remove(&mut self, id: EventId, events: &mut HashMap<EventId, Event>) {
        let pos = match events.get(&id) {
            Some(ev) if ev.heap_pos != 0 => ev.heap_pos - 1,
            _ => return,
        };
        let last = self.slots.len() - 1;
        self.slots.swap(pos, last);
        self.slots.pop();
        events.get_mut(&id).unwrap().heap_pos = 0;
        if pos < self.slots.len() {
            let moved = self.slots[pos];
            events.get_mut(&moved).unwrap().heap_pos = pos + 1;
            self.sift_down(pos, events);
            self.sift_up(pos, events);
        }
    }

    fn pop(&mut self, events: &mut HashMap<EventId, Event>) -> Option<EventId> {
        let id = *self.slots.first()?;
        self.remove(id, events);
        Some(id)
    }

    fn sift_up(&mut self, mut pos: usize, events: &mut HashMap<EventId, Event>) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.fire_of(self.slots[parent], events) <= self.fire_of(self.slots[pos], events) {
                break;
            }
            self.swap_slots(pos, parent, events);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize, events: &mut HashMap<EventId, Event>) {
        loop {
            let left = pos * 2 + 1;
            let right = pos * 2 + 2;
            let mut smallest = pos;
            if left < self.slots.len()
                && self.fire_of(self.slots[left], events) < self.fire_of(self.slots[smallest], events)
            {
                smallest = left;
            }
            if right < self.slots.len()
                && self.fire_of(self.slots[right], events) < self.fire_of(self.slots[smallest], events)
            {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap_slots(pos, smallest, events);
            pos = smallest;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize, events: &mut HashMap<EventId, Event>) {
        self.slots.swap(a, b);
        events.get_mut(&self.slots[a]).unwrap().heap_pos = a + 1;
        events.get_mut(&self.slots[b]).unwrap().heap_pos = b + 1;
    }

    fn fire_of(&self, id: EventId, events: &HashMap<EventId, Event>) -> Instant {
        events[&id].next_fire
    }
}

struct State {
    heap: Heap,
    events: HashMap<EventId, Event>,
    next_id: EventId,
    shutdown: bool,
    detached_queue: Vec<EventId>,
    busy_workers: usize,
    idle_workers: usize,
}

/// A timed/periodic scheduler backed by a min-heap dispatcher thread and
/// on-demand detached event workers.
pub struct Scheduler {
    state: Arc<Mutex<State>>,
    cond: Arc<Condvar>,
    worker_cond: Arc<Condvar>,
    max_elapsed_warning: Duration,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(max_elapsed_warning: Duration) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            state: Arc::new(Mutex::new(State {
                heap: Heap::new(),
                events: HashMap::new(),
                next_id: 1,
                shutdown: false,
                detached_queue: Vec::new(),
                busy_workers: 0,
                idle_workers: 0,
            })),
            cond: Arc::new(Condvar::new()),
            worker_cond: Arc::new(Condvar::new()),
            max_elapsed_warning,
            dispatcher: Mutex::new(None),
        });

        let dispatcher_scheduler = scheduler.clone();
        let handle = thread::spawn(move || dispatcher_scheduler.dispatcher_loop());
        *scheduler.dispatcher.lock().unwrap() = Some(handle);

        scheduler
    }

    /// Run `cb` once after `delay`.
    pub fn after<F>(&self, delay: Duration, cb: F, cleanup: Option<Cleanup>) -> Result<EventId>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(Schedule::Once, false, Instant::now() + delay, cb, cleanup)
    }

    /// Run `cb` every `interval`, optionally on a detached thread.
    pub fn every<F>(
        &self,
        interval: Duration,
        detached: bool,
        cb: F,
        cleanup: Option<Cleanup>,
    ) -> Result<EventId>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(
            Schedule::Interval(interval),
            detached,
            Instant::now() + interval,
            cb,
            cleanup,
        )
    }

    /// Run `cb` once per day at `seconds_past_midnight` local time.
    pub fn daily<F>(
        &self,
        seconds_past_midnight: u32,
        cb: F,
        cleanup: Option<Cleanup>,
    ) -> Result<EventId>
    where
        F: FnMut() + Send + 'static,
    {
        let next = next_daily_fire(seconds_past_midnight);
        self.schedule(Schedule::Daily(seconds_past_midnight), false, next, cb, cleanup)
    }

    /// Run `cb` once per week at `seconds_past_sunday_midnight` local time.
    pub fn weekly<F>(
        &self,
        seconds_past_sunday_midnight: u32,
        cb: F,
        cleanup: Option<Cleanup>,
    ) -> Result<EventId>
    where
        F: FnMut() + Send + 'static,
    {
        let next = next_weekly_fire(seconds_past_sunday_midnight);
        self.schedule(
            Schedule::Weekly(seconds_past_sunday_midnight),
            false,
            next,
            cb,
            cleanup,
        )
    }

    fn schedule<F>(
        &self,
        schedule: Schedule,
        detached: bool,
        next_fire: Instant,
        cb: F,
        cleanup: Option<Cleanup>,
    ) -> Result<EventId>
    where
        F: FnMut() + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(ServerError::ShuttingDown(Component::Scheduler));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.events.insert(
            id,
            Event {
                id,
                schedule,
                detached,
                paused: false,
                running: false,
                next_fire,
                heap_pos: 0,
                callback: Some(Box::new(cb)),
                cleanup,
            },
        );
        state.heap.push(id, &mut state.events);
        drop(state);
        self.cond.notify_all();
        Ok(id)
    }

    /// Cancel a scheduled event. Returns whether it was actually cancelled
    /// (false if the id was unknown or already removed).
    pub fn cancel(&self, id: EventId) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.events.contains_key(&id) {
            return false;
        }
        state.heap.remove(id, &mut state.events);
        let event = state.events.remove(&id).unwrap();
        drop(state);
        if let Some(cleanup) = event.cleanup {
            cleanup();
        }
        true
    }

    pub fn pause(&self, id: EventId) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(event) = state.events.get_mut(&id) {
            event.paused = true;
            true
        } else {
            false
        }
    }

    pub fn resume(&self, id: EventId) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.events.contains_key(&id) {
            return false;
        }
        state.events.get_mut(&id).unwrap().paused = false;
        // The event's key (next_fire) is changing, so it must leave and
        // re-enter the heap rather than being mutated in place -- a
        // lowered key on a non-root slot would otherwise break the
        // min-heap property without a re-sift.
        state.heap.remove(id, &mut state.events);
        let next = recompute_next_fire(&state.events[&id].schedule, Instant::now());
        state.events.get_mut(&id).unwrap().next_fire = next;
        state.heap.push(id, &mut state.events);
        self.cond.notify_all();
        true
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.cond.notify_all();
        self.worker_cond.notify_all();

        let mut state = self.state.lock().unwrap();
        while state.busy_workers > 0 {
            state = self.worker_cond.wait(state).unwrap();
        }
        let events: Vec<Event> = state.events.drain().map(|(_, v)| v).collect();
        drop(state);
        for event in events {
            if let Some(cleanup) = event.cleanup {
                cleanup();
            }
        }

        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    #[instrument(skip(self), name = "scheduler_dispatch")]
    fn dispatcher_loop(self: Arc<Self>) {
        loop {
            let mut run_now = Vec::new();
            let mut run_detached = Vec::new();
            let wait_until;

            {
                let mut state = self.state.lock().unwrap();
                if state.shutdown {
                    return;
                }

                let now = Instant::now();
                loop {
                    let Some(head) = state.heap.peek() else { break };
                    let fire_time = state.events[&head].next_fire;
                    if fire_time > now {
                        break;
                    }
                    state.heap.pop(&mut state.events);

                    if state.events[&head].paused {
                        // Stays in the heap, just pushed out past this
                        // sweep so the dispatcher doesn't spin on it;
                        // `resume` recomputes a real next-fire later.
                        let ev = state.events.get_mut(&head).unwrap();
                        ev.next_fire = now + Duration::from_secs(3600);
                        state.heap.push(head, &mut state.events);
                        continue;
                    }

                    let event = state.events.get_mut(&head).unwrap();
                    event.running = true;
                    if event.detached {
                        run_detached.push(head);
                    } else {
                        run_now.push(head);
                    }
                }

                if !run_detached.is_empty() {
                    state.detached_queue.extend(run_detached.iter().copied());
                    if state.idle_workers == 0 {
                        state.busy_workers += 1;
                        let worker_scheduler = self.clone();
                        thread::spawn(move || worker_scheduler.worker_loop());
                    }
                    drop(state);
                    self.worker_cond.notify_all();
                } else {
                    wait_until = state.heap.peek().map(|id| state.events[&id].next_fire);
                    drop(state);
                }
            }

            for id in &run_now {
                self.run_sync(*id);
            }

            if run_detached.is_empty() {
                let mut state = self.state.lock().unwrap();
                if state.shutdown {
                    return;
                }
                match wait_until {
                    Some(deadline) => {
                        let now = Instant::now();
                        if deadline > now {
                            let (guard, _) = self
                                .cond
                                .wait_timeout(state, deadline - now)
                                .unwrap();
                            state = guard;
                        }
                        drop(state);
                    }
                    None => {
                        let _unused = self.cond.wait(state).unwrap();
                    }
                }
            }
        }
    }

    fn run_sync(&self, id: EventId) {
        let started = Instant::now();
        let mut state = self.state.lock().unwrap();
        let mut event = match state.events.remove(&id) {
            Some(e) => e,
            None => return,
        };
        drop(state);

        if let Some(cb) = event.callback.as_mut() {
            cb();
        }

        let elapsed = started.elapsed();
        if elapsed > self.max_elapsed_warning {
            warn!(event_id = id, ?elapsed, "scheduled event exceeded warning threshold");
        }

        self.requeue_or_drop(event);
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let id = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(id) = state.detached_queue.pop() {
                        break id;
                    }
                    if state.shutdown {
                        state.busy_workers -= 1;
                        self.worker_cond.notify_all();
                        return;
                    }
                    state.idle_workers += 1;
                    let (guard, timeout) = self
                        .worker_cond
                        .wait_timeout(state, Duration::from_secs(30))
                        .unwrap();
                    state = guard;
                    state.idle_workers -= 1;
                    if timeout.timed_out() && state.detached_queue.is_empty() {
                        state.busy_workers -= 1;
                        self.worker_cond.notify_all();
                        return;
                    }
                }
            };

            let started = Instant::now();
            let mut state = self.state.lock().unwrap();
            let mut event = match state.events.remove(&id) {
                Some(e) => e,
                None => continue,
            };
            drop(state);

            if let Some(cb) = event.callback.as_mut() {
                cb();
            }

            let elapsed = started.elapsed();
            if elapsed > self.max_elapsed_warning {
                warn!(event_id = id, ?elapsed, "detached event exceeded warning threshold");
            }

            self.requeue_or_drop(event);
        }
    }

    fn requeue_or_drop(&self, mut event: Event) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            if let Some(cleanup) = event.cleanup.take() {
                drop(state);
                cleanup();
            }
            return;
        }
        event.running = false;
        if event.schedule.is_recurring() {
            event.next_fire = recompute_next_fire(&event.schedule, Instant::now());
            let id = event.id;
            state.events.insert(id, event);
            state.heap.push(id, &mut state.events);
            drop(state);
            self.cond.notify_all();
        } else {
            drop(state);
            debug!(event_id = event.id, "one-shot event completed");
            if let Some(cleanup) = event.cleanup.take() {
                cleanup();
            }
        }
    }
}

fn recompute_next_fire(schedule: &Schedule, now: Instant) -> Instant {
    match schedule {
        Schedule::Once => now,
        Schedule::Interval(interval) => now + *interval,
        Schedule::Daily(secs) => next_daily_fire(*secs),
        Schedule::Weekly(secs) => next_weekly_fire(*secs),
    }
}

fn next_daily_fire(seconds_past_midnight: u32) -> Instant {
    let now = Local::now();
    let midnight = now
        .with_hour(0)
        .unwrap()
        .with_minute(0)
        .unwrap()
        .with_second(0)
        .unwrap()
        .with_nanosecond(0)
        .unwrap();
    let mut candidate = midnight + chrono::Duration::seconds(seconds_past_midnight as i64);
    if candidate <= now {
        candidate += chrono::Duration::days(1);
    }
    wall_clock_to_instant(candidate, now)
}

fn next_weekly_fire(seconds_past_sunday_midnight: u32) -> Instant {
    let now = Local::now();
    let days_since_sunday = now.weekday().num_days_from_sunday();
    let sunday_midnight = (now - chrono::Duration::days(days_since_sunday as i64))
        .with_hour(0)
        .unwrap()
        .with_minute(0)
        .unwrap()
        .with_second(0)
        .unwrap()
        .with_nanosecond(0)
        .unwrap();
    let mut candidate =
        sunday_midnight + chrono::Duration::seconds(seconds_past_sunday_midnight as i64);
    if candidate <= now {
        candidate += chrono::Duration::days(7);
    }
    wall_clock_to_instant(candidate, now)
}

fn wall_clock_to_instant(target: chrono::DateTime<Local>, now: chrono::DateTime<Local>) -> Instant {
    let delta = target - now;
    let std_delta = delta.to_std().unwrap_or(Duration::from_secs(0));
    Instant::now() + std_delta
}
