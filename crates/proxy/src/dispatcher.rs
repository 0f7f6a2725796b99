//! Per-connection event loop primitives
//!
//! Everything bound to one downstream connection runs on a single
//! [`Dispatcher`]. Work that must not run inside the caller's stack (stream
//! operations requested from filter callbacks, destruction of streams that
//! may still be executing) is queued here and drained by the event loop.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

/// Clock used for stream and upstream timing
pub trait TimeSource {
    fn monotonic_time(&self) -> Instant;
    fn system_time(&self) -> SystemTime;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct RealTimeSource;

impl TimeSource for RealTimeSource {
    fn monotonic_time(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock
#[derive(Debug)]
pub struct SimulatedTimeSource {
    monotonic: Cell<Instant>,
    system: Cell<SystemTime>,
}

impl SimulatedTimeSource {
    pub fn new() -> Self {
        Self {
            monotonic: Cell::new(Instant::now()),
            system: Cell::new(SystemTime::now()),
        }
    }

    /// Move both clocks forward
    pub fn advance(&self, by: Duration) {
        self.monotonic.set(self.monotonic.get() + by);
        self.system.set(self.system.get() + by);
    }
}

impl Default for SimulatedTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SimulatedTimeSource {
    fn monotonic_time(&self) -> Instant {
        self.monotonic.get()
    }

    fn system_time(&self) -> SystemTime {
        self.system.get()
    }
}

type PostedCallback = Box<dyn FnOnce()>;
type Wakeup = Rc<dyn Fn()>;

/// Single-threaded work queue with deferred deletion
pub struct Dispatcher {
    time_source: Rc<dyn TimeSource>,
    posted: RefCell<VecDeque<PostedCallback>>,
    deferred_delete: RefCell<Vec<Box<dyn Any>>>,
    wakeup: RefCell<Option<Wakeup>>,
}

impl Dispatcher {
    /// Create a dispatcher driven by the given clock
    pub fn new(time_source: Rc<dyn TimeSource>) -> Rc<Self> {
        Rc::new(Self {
            time_source,
            posted: RefCell::new(VecDeque::new()),
            deferred_delete: RefCell::new(Vec::new()),
            wakeup: RefCell::new(None),
        })
    }

    /// Create a dispatcher on the wall clock
    pub fn with_real_time() -> Rc<Self> {
        Self::new(Rc::new(RealTimeSource))
    }

    pub fn time_source(&self) -> &dyn TimeSource {
        self.time_source.as_ref()
    }

    /// Queue a callback to run on the next loop iteration
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.posted.borrow_mut().push_back(Box::new(callback));
        let wakeup = self.wakeup.borrow().clone();
        if let Some(wakeup) = wakeup {
            wakeup();
        }
    }

    /// Install a hook run whenever work is posted. The event loop uses it
    /// to notice callbacks posted from outside a read.
    pub fn set_wakeup<F>(&self, wakeup: F)
    where
        F: Fn() + 'static,
    {
        *self.wakeup.borrow_mut() = Some(Rc::new(wakeup));
    }

    /// Hand an object over for destruction once the current stack unwinds
    pub fn deferred_delete(&self, object: Box<dyn Any>) {
        self.deferred_delete.borrow_mut().push(object);
    }

    /// Number of objects waiting for destruction
    pub fn deferred_delete_len(&self) -> usize {
        self.deferred_delete.borrow().len()
    }

    /// Destroy everything queued for deferred deletion
    pub fn clear_deferred_delete_list(&self) {
        // Destructors may queue further deletions.
        loop {
            let batch = std::mem::take(&mut *self.deferred_delete.borrow_mut());
            if batch.is_empty() {
                break;
            }
            trace!(count = batch.len(), "Clearing deferred delete list");
            drop(batch);
        }
    }

    /// Run posted callbacks and deferred deletions until both queues are empty
    pub fn run_until_idle(&self) {
        loop {
            let next = self.posted.borrow_mut().pop_front();
            match next {
                Some(callback) => callback(),
                None if self.deferred_delete.borrow().is_empty() => break,
                None => self.clear_deferred_delete_list(),
            }
        }
    }

    /// True when nothing is queued
    pub fn is_idle(&self) -> bool {
        self.posted.borrow().is_empty() && self.deferred_delete.borrow().is_empty()
    }
}
