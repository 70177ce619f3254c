#![forbid(unsafe_code)]

//! Observer lifecycle abstraction.
//!
//! Signals do not know what a component, widget, or task is. They only need
//! three things from whoever subscribes:
//!
//! - a stable [`SubscriberId`] for the lifetime of the call site,
//! - a [`Notify`] trigger to call when observed state changes,
//! - a detach notification, fired once when the call site goes away.
//!
//! [`ObserverHandle`] is that contract. [`Observer`] is a ready-made adapter
//! for hosts without a component model of their own (and for tests): it
//! counts notifications, optionally forwards them to a callback, and runs
//! detach hooks exactly once on [`Observer::detach`].
//!
//! # Invariants
//!
//! 1. Every `Observer` gets a process-unique id.
//! 2. Detach hooks run exactly once, in registration order.
//! 3. A hook registered after detach runs immediately.
//! 4. Notifiers hold the observer weakly; a dropped observer is never woken.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for subscriber ids.
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one subscribing call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a fresh id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Re-evaluation trigger for a subscriber.
pub type Notify = Rc<dyn Fn()>;

/// Callback run when an observer detaches.
pub type DetachHook = Box<dyn FnOnce()>;

/// What a signal needs from a subscribing call site.
pub trait ObserverHandle {
    /// Stable identity for this call site.
    fn id(&self) -> SubscriberId;

    /// Trigger to call when observed state changes.
    fn notifier(&self) -> Notify;

    /// Register `hook` to run once when this call site is torn down.
    fn on_detach(&self, hook: DetachHook);
}

/// Standalone observer handle.
///
/// Clones share identity, counters, and hooks.
#[derive(Clone)]
pub struct Observer {
    inner: Rc<ObserverInner>,
}

struct ObserverInner {
    id: SubscriberId,
    callback: Option<Box<dyn Fn()>>,
    notifications: Cell<u64>,
    hooks: RefCell<Vec<DetachHook>>,
    detached: Cell<bool>,
}

impl ObserverInner {
    fn fire(&self) {
        if self.detached.get() {
            return;
        }
        self.notifications.set(self.notifications.get() + 1);
        if let Some(callback) = &self.callback {
            callback();
        }
    }
}

impl Observer {
    /// Create an observer that only counts notifications.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an observer that also calls `callback` on every notification.
    #[must_use]
    pub fn with_callback(callback: impl Fn() + 'static) -> Self {
        Self::build(Some(Box::new(callback)))
    }

    fn build(callback: Option<Box<dyn Fn()>>) -> Self {
        Self {
            inner: Rc::new(ObserverInner {
                id: SubscriberId::next(),
                callback,
                notifications: Cell::new(0),
                hooks: RefCell::new(Vec::new()),
                detached: Cell::new(false),
            }),
        }
    }

    /// How many times this observer has been notified.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        self.inner.notifications.get()
    }

    /// Reset the notification counter, returning the previous value.
    pub fn take_notifications(&self) -> u64 {
        self.inner.notifications.replace(0)
    }

    /// Whether [`detach`](Self::detach) has run.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.inner.detached.get()
    }

    /// Tear the call site down, running every detach hook once.
    ///
    /// Calling this again is a no-op.
    pub fn detach(&self) {
        if self.inner.detached.replace(true) {
            return;
        }
        let hooks = std::mem::take(&mut *self.inner.hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverHandle for Observer {
    fn id(&self) -> SubscriberId {
        self.inner.id
    }

    fn notifier(&self) -> Notify {
        let weak: Weak<ObserverInner> = Rc::downgrade(&self.inner);
        Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.fire();
            }
        })
    }

    fn on_detach(&self, hook: DetachHook) {
        if self.inner.detached.get() {
            hook();
        } else {
            self.inner.hooks.borrow_mut().push(hook);
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.inner.id)
            .field("notifications", &self.inner.notifications.get())
            .field("detached", &self.inner.detached.get())
            .finish()
    }
}
