//! Request/future engine.
//!
//! A [`Request`] is a handle to a deferred computation producing a
//! [`Value`]. Slot reads return requests; nothing is computed until a request
//! is submitted to the [`ThreadPool`] or waited on.
//!
//! # Architecture
//!
//! - **Shared state**: every handle points at one `Shared` record holding the
//!   phase (`Pending(work)` / `Running` / `Finished(result)`), the completion
//!   callbacks and a condition variable. Handles are cheap to clone; several
//!   readers of the same cache block hold clones of one fetch request.
//! - **Thread donation**: a thread that waits on a request nobody has started
//!   yet runs it inline. A worker blocked in `wait` therefore never waits on
//!   queued work, which keeps a bounded pool free of nested-wait deadlocks.
//!   Only waits on requests already running elsewhere block.
//! - **Cancellation**: each handle holds one unit of interest. `cancel()`
//!   drops the handle's interest; the shared computation is flagged cancelled
//!   only when no interest remains. Requests created while another request
//!   executes on the same thread become its children and observe its
//!   cancellation, unless created with [`Request::detached`]. Operators poll
//!   [`check_cancelled`].
//! - **Synchronous mode**: a pool with zero workers runs every request on the
//!   thread that submits or waits on it.

mod batch;
mod pool;

pub use batch::RequestBatch;
pub use pool::ThreadPool;

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{LazyflowError, Result};
use crate::value::Value;

type Work = Box<dyn FnOnce() -> Result<Value> + Send + 'static>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// How often an interruptible wait rechecks the waiting request.
const CANCEL_POLL: Duration = Duration::from_millis(5);

thread_local! {
    /// Requests executing on this thread, innermost last.
    static CURRENT: RefCell<Vec<Arc<Shared>>> = const { RefCell::new(Vec::new()) };
}

/// Observable life-cycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Created, not started.
    Pending,
    /// Executing on some thread.
    Running,
    /// Finished with a value.
    Done,
    /// Finished because it was cancelled.
    Cancelled,
    /// Finished with an error.
    Failed,
}

enum Phase {
    Pending(Option<Work>),
    Running,
    Finished(Result<Value>),
}

enum Callback {
    Finished(Box<dyn FnOnce(&Value) + Send>),
    Failed(Box<dyn FnOnce(&LazyflowError) + Send>),
    Cancelled(Box<dyn FnOnce() + Send>),
}

impl Callback {
    fn fire(self, result: &Result<Value>) {
        match (self, result) {
            (Callback::Finished(f), Ok(value)) => f(value),
            (Callback::Failed(f), Err(err)) if !err.is_cancelled() => f(err),
            (Callback::Cancelled(f), Err(LazyflowError::Cancelled)) => f(),
            _ => {}
        }
    }
}

struct State {
    phase: Phase,
    queued: bool,
    callbacks: Vec<Callback>,
}

pub(crate) struct Shared {
    id: u64,
    state: Mutex<State>,
    done: Condvar,
    cancelled: AtomicBool,
    interest: AtomicUsize,
    parent: Option<Weak<Shared>>,
    pool: Option<ThreadPool>,
}

impl Shared {
    fn new(phase: Phase, pool: Option<ThreadPool>, parent: Option<Weak<Shared>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State {
                phase,
                queued: false,
                callbacks: Vec::new(),
            }),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
            interest: AtomicUsize::new(1),
            parent,
            pool,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|p| p.is_cancelled())
    }

    /// Take the work of a pending request, moving it to `Running`.
    fn claim(&self) -> Option<Work> {
        let mut state = self.state.lock();
        match &mut state.phase {
            Phase::Pending(work) => {
                let work = work.take();
                if work.is_some() {
                    state.phase = Phase::Running;
                }
                work
            }
            _ => None,
        }
    }

    fn run(self: &Arc<Self>, work: Work) {
        let result = if self.is_cancelled() {
            drop(work);
            Err(LazyflowError::Cancelled)
        } else {
            tracing::trace!("request {} started", self.id);
            CURRENT.with(|c| c.borrow_mut().push(Arc::clone(self)));
            let result = panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|payload| Err(panic_error(payload.as_ref())));
            CURRENT.with(|c| c.borrow_mut().pop());
            result
        };
        self.finish(result);
    }

    fn finish(&self, result: Result<Value>) {
        match &result {
            Ok(_) => tracing::trace!("request {} finished", self.id),
            Err(LazyflowError::Cancelled) => tracing::trace!("request {} cancelled", self.id),
            Err(err) => tracing::debug!("request {} failed: {err}", self.id),
        }
        let callbacks = {
            let mut state = self.state.lock();
            state.phase = Phase::Finished(result.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.done.notify_all();
        for callback in callbacks {
            callback.fire(&result);
        }
    }

    fn on_stack(self: &Arc<Self>) -> bool {
        CURRENT.with(|c| c.borrow().iter().any(|s| Arc::ptr_eq(s, self)))
    }
}

fn current_parent() -> Option<Weak<Shared>> {
    CURRENT.with(|c| c.borrow().last().map(Arc::downgrade))
}

fn panic_error(payload: &(dyn std::any::Any + Send)) -> LazyflowError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    LazyflowError::computation("request", format!("panicked: {message}"))
}

/// Handle to a deferred computation.
pub struct Request {
    shared: Arc<Shared>,
    cancelled: AtomicBool,
}

impl Request {
    /// Create a pending request. `pool` decides where [`submit`](Self::submit)
    /// runs it; `None` means the submitting or waiting thread.
    pub fn new<F>(pool: Option<&ThreadPool>, work: F) -> Self
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        Self::from_shared(Shared::new(
            Phase::Pending(Some(Box::new(work))),
            pool.cloned(),
            current_parent(),
        ))
    }

    /// Like [`new`](Self::new), but the request is not a child of the
    /// request executing on this thread. It is cancelled only through its
    /// own handles, which suits work shared by several unrelated readers.
    pub fn detached<F>(pool: Option<&ThreadPool>, work: F) -> Self
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        Self::from_shared(Shared::new(
            Phase::Pending(Some(Box::new(work))),
            pool.cloned(),
            None,
        ))
    }

    /// A request that is already finished with `value`.
    pub fn ready(value: Value) -> Self {
        Self::from_shared(Shared::new(Phase::Finished(Ok(value)), None, None))
    }

    /// A request that has already failed with `err`.
    pub fn failed(err: LazyflowError) -> Self {
        Self::from_shared(Shared::new(Phase::Finished(Err(err)), None, None))
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Schedule the request on its pool. In synchronous mode (no pool, or a
    /// pool without workers) the request runs to completion before this
    /// returns.
    pub fn submit(&self) -> &Self {
        let shared = &self.shared;
        match &shared.pool {
            Some(pool) if pool.num_workers() > 0 => {
                let enqueue = {
                    let mut state = shared.state.lock();
                    let pending = matches!(state.phase, Phase::Pending(Some(_)));
                    let enqueue = pending && !state.queued;
                    state.queued |= enqueue;
                    enqueue
                };
                if enqueue {
                    pool.enqueue(Arc::clone(shared));
                }
            }
            _ => {
                if !shared.on_stack() {
                    if let Some(work) = shared.claim() {
                        shared.run(work);
                    }
                }
            }
        }
        self
    }

    /// Block until the request finishes and return its result.
    ///
    /// If nobody has started the request yet it runs on this thread.
    pub fn wait(&self) -> Result<Value> {
        self.wait_inner(false)
    }

    /// Like [`wait`](Self::wait), but gives up with
    /// [`LazyflowError::Cancelled`] as soon as the request executing on this
    /// thread is cancelled, while the awaited request runs elsewhere.
    pub fn wait_interruptible(&self) -> Result<Value> {
        self.wait_inner(true)
    }

    fn wait_inner(&self, interruptible: bool) -> Result<Value> {
        if self.cancelled.load(Ordering::Acquire) || (interruptible && current_cancelled()) {
            return Err(LazyflowError::Cancelled);
        }
        let shared = &self.shared;
        if let Some(work) = shared.claim() {
            shared.run(work);
        }
        let mut state = shared.state.lock();
        loop {
            if let Phase::Finished(result) = &state.phase {
                return result.clone();
            }
            drop(state);
            if shared.on_stack() {
                return Err(LazyflowError::CircularWait);
            }
            if interruptible && current_cancelled() {
                return Err(LazyflowError::Cancelled);
            }
            state = shared.state.lock();
            if !matches!(state.phase, Phase::Finished(_)) {
                if interruptible {
                    shared.done.wait_for(&mut state, CANCEL_POLL);
                } else {
                    shared.done.wait(&mut state);
                }
            }
        }
    }

    /// Withdraw this handle's interest. The computation stops (or never
    /// starts) once every handle has cancelled.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.shared;
        if shared.interest.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.cancelled.store(true, Ordering::Release);
            tracing::trace!("request {} cancelled by last interested handle", shared.id);
            if let Some(work) = shared.claim() {
                drop(work);
                shared.finish(Err(LazyflowError::Cancelled));
            }
        }
    }

    /// True if this handle was cancelled or the shared computation was.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.shared.is_cancelled()
    }

    /// Current life-cycle state.
    pub fn state(&self) -> RequestState {
        match &self.shared.state.lock().phase {
            Phase::Pending(_) => RequestState::Pending,
            Phase::Running => RequestState::Running,
            Phase::Finished(Ok(_)) => RequestState::Done,
            Phase::Finished(Err(LazyflowError::Cancelled)) => RequestState::Cancelled,
            Phase::Finished(Err(_)) => RequestState::Failed,
        }
    }

    /// True once the request has a result.
    pub fn is_finished(&self) -> bool {
        matches!(self.shared.state.lock().phase, Phase::Finished(_))
    }

    /// Call `f` with the value when the request succeeds. Runs immediately
    /// if it already has.
    pub fn notify_finished(&self, f: impl FnOnce(&Value) + Send + 'static) {
        self.add_callback(Callback::Finished(Box::new(f)));
    }

    /// Call `f` with the error when the request fails (not on cancellation).
    pub fn notify_failed(&self, f: impl FnOnce(&LazyflowError) + Send + 'static) {
        self.add_callback(Callback::Failed(Box::new(f)));
    }

    /// Call `f` when the request ends cancelled.
    pub fn notify_cancelled(&self, f: impl FnOnce() + Send + 'static) {
        self.add_callback(Callback::Cancelled(Box::new(f)));
    }

    fn add_callback(&self, callback: Callback) {
        let mut state = self.shared.state.lock();
        if let Phase::Finished(result) = &state.phase {
            let result = result.clone();
            drop(state);
            callback.fire(&result);
        } else {
            state.callbacks.push(callback);
        }
    }
}

impl Clone for Request {
    fn clone(&self) -> Self {
        self.shared.interest.fetch_add(1, Ordering::AcqRel);
        Self::from_shared(Arc::clone(&self.shared))
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.cancelled.load(Ordering::Acquire) {
            self.shared.interest.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// True if the request executing on this thread has been cancelled.
pub fn current_cancelled() -> bool {
    CURRENT.with(|c| c.borrow().last().is_some_and(|s| s.is_cancelled()))
}

/// Fail with [`LazyflowError::Cancelled`] if the request executing on this
/// thread has been cancelled.
pub fn check_cancelled() -> Result<()> {
    if current_cancelled() {
        Err(LazyflowError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn counting(counter: Arc<AtomicUsize>, value: i64) -> impl FnOnce() -> Result<Value> + Send {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(value))
        }
    }

    // --- waiting ---

    #[test]
    fn wait_runs_pending_request_inline() {
        let runs = Arc::new(AtomicUsize::new(0));
        let req = Request::new(None, counting(Arc::clone(&runs), 7));
        assert_eq!(req.state(), RequestState::Pending);
        assert_eq!(req.wait().unwrap(), Value::Int(7));
        assert_eq!(req.wait().unwrap(), Value::Int(7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(req.state(), RequestState::Done);
    }

    #[test]
    fn submit_without_workers_is_synchronous() {
        let pool = ThreadPool::new(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let req = Request::new(Some(&pool), counting(Arc::clone(&runs), 1));
        req.submit();
        assert!(req.is_finished());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_runs_submitted_requests() {
        let pool = ThreadPool::new(2);
        let (tx, rx) = mpsc::channel();
        let req = Request::new(Some(&pool), || Ok(Value::Int(3)));
        req.notify_finished(move |v| {
            let _ = tx.send(v.clone());
        });
        req.submit();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Value::Int(3));
        pool.finalize();
    }

    #[test]
    fn nested_waits_on_single_worker_complete() {
        let pool = ThreadPool::new(1);
        let inner_pool = pool.clone();
        let outer = Request::new(Some(&pool), move || {
            let children: Vec<_> = (0..4)
                .map(|i| Request::new(Some(&inner_pool), move || Ok(Value::Int(i))))
                .collect();
            for c in &children {
                c.submit();
            }
            let mut sum = 0;
            for c in &children {
                sum += c.wait()?.as_int()?;
            }
            Ok(Value::Int(sum))
        });
        outer.submit();
        assert_eq!(outer.wait().unwrap(), Value::Int(6));
        pool.finalize();
    }

    // --- failure ---

    #[test]
    fn errors_reach_every_waiter() {
        let req = Request::new(None, || {
            Err(LazyflowError::computation("OpBroken", "bad input"))
        });
        let copy = req.clone();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        req.notify_failed(move |_| flag.store(true, Ordering::SeqCst));
        assert!(req.wait().is_err());
        assert!(matches!(copy.wait(), Err(LazyflowError::Computation { .. })));
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(req.state(), RequestState::Failed);
    }

    #[test]
    fn panics_become_computation_errors() {
        let req = Request::new(None, || panic!("kernel exploded"));
        let err = req.wait().unwrap_err();
        assert!(err.to_string().contains("kernel exploded"));
    }

    #[test]
    fn waiting_on_itself_is_circular() {
        let slot: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let req = Request::new(None, move || {
            let me = inner.lock().clone();
            match me {
                Some(me) => me.wait(),
                None => Ok(Value::Empty),
            }
        });
        *slot.lock() = Some(req.clone());
        assert!(matches!(req.wait(), Err(LazyflowError::CircularWait)));
    }

    // --- cancellation ---

    #[test]
    fn cancel_requires_all_handles() {
        let runs = Arc::new(AtomicUsize::new(0));
        let a = Request::new(None, counting(Arc::clone(&runs), 5));
        let b = a.clone();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(matches!(a.wait(), Err(LazyflowError::Cancelled)));
        assert_eq!(b.wait().unwrap(), Value::Int(5));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_cancel_stops_pending_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let a = Request::new(None, counting(Arc::clone(&runs), 5));
        let b = a.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        b.notify_cancelled(move || flag.store(true, Ordering::SeqCst));
        a.cancel();
        b.cancel();
        assert_eq!(a.state(), RequestState::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn children_inherit_cancellation() {
        let pool = ThreadPool::new(1);
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let outer = Request::new(Some(&pool), move || {
            let _ = started_tx.send(());
            let _ = go_rx.recv();
            let child = Request::new(None, || {
                check_cancelled()?;
                Ok(Value::Int(1))
            });
            child.wait()
        });
        let (cancelled_tx, cancelled_rx) = mpsc::channel();
        outer.notify_cancelled(move || {
            let _ = cancelled_tx.send(());
        });
        outer.submit();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        outer.cancel();
        go_tx.send(()).unwrap();
        cancelled_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outer.state(), RequestState::Cancelled);
        pool.finalize();
    }

    #[test]
    fn detached_requests_outlive_cancelled_creator() {
        let pool = ThreadPool::new(1);
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (result_tx, result_rx) = mpsc::channel();
        let outer = Request::new(Some(&pool), move || {
            let _ = started_tx.send(());
            let _ = go_rx.recv();
            let detached = Request::detached(None, || {
                check_cancelled()?;
                Ok(Value::Int(2))
            });
            let child = Request::new(None, || {
                check_cancelled()?;
                Ok(Value::Int(1))
            });
            let _ = result_tx.send((detached.wait(), child.wait()));
            Ok(Value::Empty)
        });
        outer.submit();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        outer.cancel();
        go_tx.send(()).unwrap();
        let (detached, child) = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(detached.unwrap(), Value::Int(2));
        assert!(matches!(child, Err(LazyflowError::Cancelled)));
        pool.finalize();
    }

    #[test]
    fn interruptible_wait_stops_when_waiter_is_cancelled() {
        let pool = ThreadPool::new(2);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let slow = Request::detached(Some(&pool), move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(Value::Int(9))
        });
        slow.submit();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let awaited = slow.clone();
        let (waiting_tx, waiting_rx) = mpsc::channel();
        let waiter = Request::new(Some(&pool), move || {
            let _ = waiting_tx.send(());
            awaited.wait_interruptible()
        });
        let (done_tx, done_rx) = mpsc::channel();
        waiter.notify_cancelled(move || {
            let _ = done_tx.send(());
        });
        waiter.submit();
        waiting_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.cancel();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!slow.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(slow.wait().unwrap(), Value::Int(9));
        pool.finalize();
    }

    #[test]
    fn check_cancelled_outside_requests_is_ok() {
        assert!(check_cancelled().is_ok());
        assert!(!current_cancelled());
    }
}
