#![forbid(unsafe_code)]

//! Named reactive signals with path subscriptions and batched notification.
//!
//! A [`Signal`] is a named JSON state tree. Observers read it (whole, or at a
//! dotted path) and are registered as subscribers; writes made in the same
//! turn are coalesced and dispatched once, when the [`Scheduler`] runs the
//! flush. A subscriber is not woken by a batch made only of its own writes.
//!
//! # Architecture
//!
//! - [`SignalRegistry`]: name -> [`Signal`], always holding `"global"`.
//! - [`Store`]: lazily built registry for hosts that want one entry point.
//! - [`ObserverHandle`]: what a subscribing call site provides (identity,
//!   wake-up trigger, detach hook). [`Observer`] is the bundled adapter.
//! - [`Scheduler`]: where flushes run. [`TaskQueue`] is the bundled FIFO.
//! - [`Completion`]: settle-once outcome of one write batch.
//!
//! Everything is single-threaded (`Rc`/`RefCell`).
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use signalbox::{Observer, Selector, SignalOptions, Store, TaskQueue};
//!
//! let queue = TaskQueue::new();
//! let store = Store::new(queue.clone());
//! store.create("app", json!({ "count": 0 }), SignalOptions::new(), None);
//!
//! let view = Observer::new();
//! let read = store.read(&view, Some("app"), Selector::Path("count"));
//! assert_eq!(read.value, Some(json!(0)));
//!
//! let other = Observer::new();
//! let _ = store.read(&other, Some("app"), Selector::Path("count"));
//!
//! read.setter.set(json!(1));
//! read.setter.set(json!(2));
//! queue.run_until_idle();
//!
//! assert_eq!(view.notifications(), 0); // its own writes
//! assert_eq!(other.notifications(), 1); // one flush for both writes
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod observer;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod store;

pub use completion::{Completion, Outcome};
#[cfg(feature = "config-file")]
pub use config::ConfigError;
pub use config::{InitialState, StoreConfig};
pub use error::{Diagnostic, SignalError};
pub use observer::{DetachHook, Notify, Observer, ObserverHandle, SubscriberId};
pub use registry::{DIAGNOSTIC_CAPACITY, GLOBAL_SIGNAL, SignalRegistry};
pub use scheduler::{Scheduler, Task, TaskQueue};
pub use signal::{Read, Selector, Setter, Signal, SignalOptions};
pub use store::{Created, Store};

pub use signalbox_path::{Path, PathWriteError, ValueKind};
