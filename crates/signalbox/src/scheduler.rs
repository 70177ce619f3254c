#![forbid(unsafe_code)]

//! Deferred execution port.
//!
//! Signals never flush inline. Every batch is handed to a [`Scheduler`] as a
//! [`Task`] and runs once the current synchronous turn is over. What "over"
//! means is up to the host: an event loop would bind this to its microtask
//! queue, a game or TUI loop to an explicit drain point.
//!
//! [`TaskQueue`] is the bundled binding: a FIFO the host drains with
//! [`TaskQueue::run_until_idle`]. Tasks queued while draining run in the same
//! drain, so a flush that triggers another write settles before control
//! returns to the host.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Something that can run work after the current turn.
pub trait Scheduler {
    /// Queue `task` to run after the caller returns.
    ///
    /// Implementations must not run `task` re-entrantly from inside `defer`.
    fn defer(&self, task: Task);
}

impl<S: Scheduler + ?Sized> Scheduler for Rc<S> {
    fn defer(&self, task: Task) {
        (**self).defer(task);
    }
}

/// Explicit FIFO task queue.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl TaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run tasks until the queue is empty, including tasks queued by the
    /// tasks themselves. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.tasks.borrow_mut().pop_front();
            let Some(task) = next else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Run only the tasks queued before this call. Tasks they queue wait for
    /// the next drain. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Task> = self.tasks.borrow_mut().drain(..).collect();
        let ran = batch.len();
        for task in batch {
            task();
        }
        ran
    }
}

impl Scheduler for TaskQueue {
    fn defer(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}
