/*!
 * Script-interpreter pool (C4)
 *
 * Per-thread free lists of script engines backed by a shared "epoch": a
 * version counter bumped whenever the shared init script changes, so
 * every thread lazily re-initializes its interpreters the next time it
 * allocates one. Grounded on `examples/original_source/nsd/tclinit.c`'s
 * `NsInterpData`/`PopInterp`/`PushInterp`/`Ns_TclMarkForDelete`.
 */

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Component, Result, ServerError};

/// Boundary trait standing in for a real script engine (Tcl, Lua, ...).
/// `InterpPool` is generic over this so the pool itself can be tested
/// without pulling in a real scripting runtime.
pub trait ScriptEngine: Send + 'static {
    fn create() -> Self;
    fn eval_init(&mut self, script: &str) -> std::result::Result<(), String>;
    fn reset(&mut self);

    /// Evaluates a script and returns its textual result. The default
    /// forwards to `eval_init` (init scripts and request scripts share
    /// one evaluation entry point in the donor's Tcl engine); a real
    /// engine overrides this to return the interpreter's result string.
    fn eval(&mut self, script: &str) -> std::result::Result<String, String> {
        self.eval_init(script)?;
        Ok(String::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trace {
    Create,
    Delete,
    Allocate,
    Deallocate,
    GetConn,
    FreeConn,
}

type TraceFn = Arc<dyn Fn() + Send + Sync>;

struct SharedState {
    version: AtomicU32,
    init_script: Mutex<String>,
    traces: Mutex<HashMap<&'static str, Vec<TraceFn>>>,
}

impl SharedState {
    fn new(init_script: String) -> Self {
        Self {
            version: AtomicU32::new(1),
            init_script: Mutex::new(init_script),
            traces: Mutex::new(HashMap::new()),
        }
    }

    fn fire(&self, trace: Trace) {
        let key = trace_key(trace);
        let traces = self.traces.lock().unwrap();
        if let Some(fns) = traces.get(key) {
            for f in fns {
                f();
            }
        }
    }
}

fn trace_key(trace: Trace) -> &'static str {
    match trace {
        Trace::Create => "create",
        Trace::Delete => "delete",
        Trace::Allocate => "allocate",
        Trace::Deallocate => "deallocate",
        Trace::GetConn => "get_conn",
        Trace::FreeConn => "free_conn",
    }
}

/// A checked-out script engine plus the bookkeeping needed to return it.
pub struct Interp<E: ScriptEngine> {
    pub engine: E,
    version: u32,
    delete_marked: bool,
    bound_conn: bool,
}

impl<E: ScriptEngine> Interp<E> {
    /// Marks this interpreter for destruction instead of recycling on
    /// the next `deallocate`.
    pub fn mark_for_delete(&mut self) {
        self.delete_marked = true;
    }
}

struct FreeList<E: ScriptEngine> {
    entries: RefCell<Vec<Interp<E>>>,
}

impl<E: ScriptEngine> FreeList<E> {
    fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }
}

thread_local! {
    static FREE_LISTS: RefCell<HashMap<usize, Box<dyn std::any::Any>>> = RefCell::new(HashMap::new());
    static ALLOC_DEPTH: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

/// A script evaluating inside an allocated interp that itself calls back
/// into `allocate` (e.g. a handler invoked re-entrantly from within a
/// request) can recurse without bound if nothing stops it. This caps how
/// many interps one thread may hold concurrently from a single pool.
const MAX_ALLOC_DEPTH: usize = 64;

/// A pool of script engines shared across the threads of one server,
/// each thread keeping its own free list to avoid cross-thread locking
/// on the common allocate/deallocate path.
pub struct InterpPool<E: ScriptEngine> {
    id: usize,
    shared: Arc<SharedState>,
    _marker: std::marker::PhantomData<E>,
}

static NEXT_POOL_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);

impl<E: ScriptEngine> InterpPool<E> {
    pub fn new(init_script: impl Into<String>) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(SharedState::new(init_script.into())),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn add_trace<F>(&self, trace: Trace, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .traces
            .lock()
            .unwrap()
            .entry(trace_key(trace))
            .or_default()
            .push(Arc::new(f));
    }

    fn with_free_list<R>(&self, f: impl FnOnce(&FreeList<E>) -> R) -> R {
        FREE_LISTS.with(|lists| {
            let mut lists = lists.borrow_mut();
            let entry = lists
                .entry(self.id)
                .or_insert_with(|| Box::new(FreeList::<E>::new()));
            let list = entry
                .downcast_ref::<FreeList<E>>()
                .expect("free list type mismatch for pool id");
            f(list)
        })
    }

    /// Pops an interp off this thread's free list (creating one if
    /// empty), fires Allocate traces, and re-evaluates the shared init
    /// script if this thread's interp is behind the current version.
    /// Rejects with `Overflow` once this thread holds `MAX_ALLOC_DEPTH`
    /// un-deallocated interps from this pool, guarding against unbounded
    /// recursive allocation.
    pub fn allocate(&self) -> Result<Interp<E>> {
        let depth = ALLOC_DEPTH.with(|d| *d.borrow().get(&self.id).unwrap_or(&0));
        if depth >= MAX_ALLOC_DEPTH {
            return Err(ServerError::Overflow(Component::InterpPool));
        }

        let popped = self.with_free_list(|list| list.entries.borrow_mut().pop());

        let mut interp = match popped {
            Some(interp) => interp,
            None => {
                let engine = E::create();
                self.shared.fire(Trace::Create);
                Interp {
                    engine,
                    version: 0,
                    delete_marked: false,
                    bound_conn: false,
                }
            }
        };

        self.shared.fire(Trace::Allocate);

        let current_version = self.shared.version.load(Ordering::Acquire);
        if interp.version != current_version {
            let script = self.shared.init_script.lock().unwrap().clone();
            interp
                .engine
                .eval_init(&script)
                .map_err(ServerError::Init)?;
            interp.version = current_version;
        }

        ALLOC_DEPTH.with(|d| *d.borrow_mut().entry(self.id).or_insert(0) += 1);
        Ok(interp)
    }

    /// Returns an interp to this thread's free list, or destroys it if
    /// it was marked for delete. A no-op if the interp is still bound
    /// to a connection — the connection owns the release in that case.
    pub fn deallocate(&self, mut interp: Interp<E>) {
        if interp.bound_conn {
            return;
        }

        ALLOC_DEPTH.with(|d| {
            if let Some(n) = d.borrow_mut().get_mut(&self.id) {
                *n = n.saturating_sub(1);
            }
        });

        self.shared.fire(Trace::Deallocate);

        if interp.delete_marked {
            self.shared.fire(Trace::Delete);
            return;
        }

        interp.engine.reset();
        self.with_free_list(|list| list.entries.borrow_mut().push(interp));
    }

    /// Binds an interp to a connection, firing GetConn. Distinct from
    /// Allocate: bound interps are not returned to the free list by a
    /// plain `deallocate` until explicitly unbound.
    pub fn bind_conn(&self, interp: &mut Interp<E>) {
        interp.bound_conn = true;
        self.shared.fire(Trace::GetConn);
    }

    pub fn unbind_conn(&self, interp: &mut Interp<E>) {
        interp.bound_conn = false;
        self.shared.fire(Trace::FreeConn);
    }

    /// Atomically replaces the shared init script and bumps the
    /// version, skipping zero on wraparound. Every thread's next
    /// `allocate` will detect the mismatch and re-evaluate.
    pub fn save(&self, init_script: impl Into<String>) {
        *self.shared.init_script.lock().unwrap() = init_script.into();
        loop {
            let prev = self.shared.version.fetch_add(1, Ordering::AcqRel);
            if prev.wrapping_add(1) != 0 {
                break;
            }
        }
    }

    pub fn version(&self) -> u32 {
        self.shared.version.load(Ordering::Acquire)
    }

    /// Drops this thread's free list, destroying each interp under the
    /// Delete-trace path. Called when a thread is exiting.
    pub fn thread_exit(&self) {
        let drained = self.with_free_list(|list| list.entries.borrow_mut().drain(..).collect::<Vec<_>>());
        for _ in drained {
            self.shared.fire(Trace::Delete);
        }
    }
}

/// Registry of named interp pools, one per virtual server.
#[derive(Default)]
pub struct InterpPoolRegistry<E: ScriptEngine> {
    pools: Mutex<HashMap<String, Arc<InterpPool<E>>>>,
}

impl<E: ScriptEngine> InterpPoolRegistry<E> {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self, server: &str, default_init_script: impl Into<String>) -> Arc<InterpPool<E>> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(InterpPool::new(default_init_script)))
            .clone()
    }

    pub fn get(&self, server: &str) -> Option<Arc<InterpPool<E>>> {
        self.pools.lock().unwrap().get(server).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MockEngine {
        last_init: String,
        reset_count: usize,
    }

    impl ScriptEngine for MockEngine {
        fn create() -> Self {
            MockEngine {
                last_init: String::new(),
                reset_count: 0,
            }
        }
        fn eval_init(&mut self, script: &str) -> std::result::Result<(), String> {
            self.last_init = script.to_string();
            Ok(())
        }
        fn reset(&mut self) {
            self.reset_count += 1;
        }
    }

    #[test]
    fn allocate_creates_and_evaluates_init_on_new_interp() {
        let pool: InterpPool<MockEngine> = InterpPool::new("set x 1");
        let interp = pool.allocate().unwrap();
        assert_eq!(interp.engine.last_init, "set x 1");
    }

    #[test]
    fn deallocate_then_allocate_reuses_from_free_list() {
        let pool: InterpPool<MockEngine> = InterpPool::new("init");
        let interp = pool.allocate().unwrap();
        pool.deallocate(interp);
        let interp2 = pool.allocate().unwrap();
        assert_eq!(interp2.engine.reset_count, 1);
    }

    #[test]
    fn save_bumps_version_and_forces_reevaluation() {
        let pool: InterpPool<MockEngine> = InterpPool::new("v1");
        let interp = pool.allocate().unwrap();
        assert_eq!(interp.engine.last_init, "v1");
        pool.deallocate(interp);

        pool.save("v2");
        let interp2 = pool.allocate().unwrap();
        assert_eq!(interp2.engine.last_init, "v2");
    }

    #[test]
    fn delete_marked_interp_is_not_recycled() {
        let pool: InterpPool<MockEngine> = InterpPool::new("init");
        let mut interp = pool.allocate().unwrap();
        interp.mark_for_delete();
        pool.deallocate(interp);
        // free list should be empty, so a new interp is created and
        // re-evaluates init from scratch.
        let interp2 = pool.allocate().unwrap();
        assert_eq!(interp2.engine.reset_count, 0);
    }

    #[test]
    fn bound_conn_interp_is_not_returned_by_plain_deallocate() {
        let pool: InterpPool<MockEngine> = InterpPool::new("init");
        let mut interp = pool.allocate().unwrap();
        pool.bind_conn(&mut interp);
        pool.deallocate(interp);
        // the free list should still be empty since the interp was bound
        let interp2 = pool.allocate().unwrap();
        assert_eq!(interp2.engine.reset_count, 0);
    }

    #[test]
    fn traces_fire_in_registered_order() {
        let pool: InterpPool<MockEngine> = InterpPool::new("init");
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        pool.add_trace(Trace::Allocate, move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let _interp = pool.allocate().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allocate_past_max_depth_overflows() {
        let pool: InterpPool<MockEngine> = InterpPool::new("init");
        let mut held = Vec::new();
        for _ in 0..MAX_ALLOC_DEPTH {
            held.push(pool.allocate().unwrap());
        }
        match pool.allocate() {
            Err(ServerError::Overflow(Component::InterpPool)) => {}
            other => panic!("expected Overflow(InterpPool), got {other:?}"),
        }
        // releasing one interp frees up a slot again
        pool.deallocate(held.pop().unwrap());
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn registry_returns_same_pool_for_same_server() {
        let registry: InterpPoolRegistry<MockEngine> = InterpPoolRegistry::new();
        let a = registry.pool("default", "init");
        let b = registry.pool("default", "init");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
