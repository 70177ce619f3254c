#![forbid(unsafe_code)]

//! Named reactive state container.
//!
//! A [`Signal`] owns one JSON state tree, the set of subscribers reading it,
//! and two independent write batches:
//!
//! - **Shallow**: top-level patches merged with [`Signal::set_whole`] (or a
//!   whole-state [`Setter`]). Pending until flushed, then merged in one step.
//! - **Deep**: dotted-path writes made with [`Signal::set_path`] (or a path
//!   [`Setter`]). Applied to state immediately, dispatched when flushed.
//!
//! Each batch has at most one flush in flight. The first write of a batch
//! hands a flush task to the [`Scheduler`]; later writes in the same turn join
//! the pending batch and share its [`Completion`].
//!
//! # Dispatch
//!
//! A shallow flush notifies every subscriber that observes the whole state,
//! or a path whose first segment is a changed key. A deep flush notifies the
//! subscribers observing exactly a written path. The two queues are not
//! deduplicated against each other: a subscriber can hear about the same
//! key once from each.
//!
//! # Origin suppression
//!
//! A write made through a [`Setter`] records the reading subscriber as the
//! last writer of each key (shallow) or path (deep). At flush time a
//! subscriber is skipped when it last wrote everything it would be notified
//! about. A subscriber that re-reads a pending deep path after its last write
//! is likewise skipped: it has already seen the value.
//!
//! # Invariants
//!
//! 1. A subscriber registers at most once; later reads never re-register.
//! 2. Each flush notifies a subscriber at most once.
//! 3. No internal borrow is held while notifying, so observers may read or
//!    write from inside a notification (writes start a new batch).
//! 4. A deep write that fails leaves state and the pending batch untouched.
//! 5. `deep_index` entries exist only while at least one subscriber observes
//!    the path.
//!
//! # Failure Modes
//!
//! - Write to a destroyed signal: rejected [`Completion`].
//! - Shallow flush over non-object state: batch rejected with
//!   [`SignalError::StateNotObject`], nobody notified.
//! - [`Signal::with_state`] closure writing to the same signal: panics
//!   (`RefCell` borrow). Compute closures run on a copy of the addressed
//!   value with no borrow held, so they may read or write freely.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::{AHashMap, AHashSet};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use signalbox_path::{Path, PathWriteError, ValueKind};

use crate::completion::Completion;
use crate::error::SignalError;
use crate::observer::{Notify, ObserverHandle, SubscriberId};
use crate::scheduler::Scheduler;

/// Parsed paths kept per signal before the cache is reset.
const PATH_CACHE_LIMIT: usize = 1024;

pub(crate) type Teardown = Box<dyn FnOnce(&Signal)>;

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// Which part of a signal's state a read addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    /// The whole state.
    Whole,
    /// A dotted path into the state.
    Path(&'a str),
}

impl<'a> Selector<'a> {
    /// The raw path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&'a str> {
        match self {
            Self::Whole => None,
            Self::Path(raw) => Some(raw),
        }
    }
}

impl<'a> From<&'a str> for Selector<'a> {
    fn from(raw: &'a str) -> Self {
        if raw.is_empty() {
            Self::Whole
        } else {
            Self::Path(raw)
        }
    }
}

impl<'a> From<Option<&'a str>> for Selector<'a> {
    fn from(raw: Option<&'a str>) -> Self {
        raw.map_or(Self::Whole, Self::from)
    }
}

/// Creation options for a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalOptions {
    /// Debug label.
    pub key: Option<String>,
    /// Destroy the signal when its owning observer detaches.
    pub auto_destroy: bool,
}

impl SignalOptions {
    /// Default options: no key, auto-destroy on.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debug label.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set whether the signal follows its owner's lifecycle.
    #[must_use]
    pub fn auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            key: None,
            auto_destroy: true,
        }
    }
}

/// Result of a subscribing read: the value plus a setter bound to it.
#[derive(Debug, Clone)]
pub struct Read<T> {
    /// The value read (a snapshot, not a live binding).
    pub value: T,
    /// Writes back to whatever was read.
    pub setter: Setter,
    /// The registered identity, or `None` if nothing was registered.
    pub subscriber: Option<SubscriberId>,
}

impl<T> Read<T> {
    /// Transform the value, keeping setter and subscriber.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Read<U> {
        Read {
            value: f(self.value),
            setter: self.setter,
            subscriber: self.subscriber,
        }
    }

    /// Split into `(value, setter)`.
    pub fn into_parts(self) -> (T, Setter) {
        (self.value, self.setter)
    }
}

impl<T> Read<Option<T>> {
    /// The `(None, noop)` pair returned for unknown signals.
    pub(crate) fn unknown() -> Self {
        Self {
            value: None,
            setter: Setter::noop(),
            subscriber: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Setter
// ---------------------------------------------------------------------------

/// Write handle returned by reads.
///
/// Holds its signal weakly. Clones write to the same place with the same
/// origin.
#[derive(Clone)]
pub struct Setter {
    target: Target,
}

#[derive(Clone)]
enum Target {
    Noop,
    Whole {
        signal: Weak<SignalInner>,
        name: Rc<str>,
        origin: Option<SubscriberId>,
    },
    Path {
        signal: Weak<SignalInner>,
        name: Rc<str>,
        path: Path,
        origin: Option<SubscriberId>,
    },
}

impl Setter {
    /// A setter that accepts and discards every write.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            target: Target::Noop,
        }
    }

    fn whole(signal: &Signal, origin: Option<SubscriberId>) -> Self {
        Self {
            target: Target::Whole {
                signal: Rc::downgrade(&signal.inner),
                name: Rc::clone(&signal.inner.name),
                origin,
            },
        }
    }

    fn at_path(signal: &Signal, path: Path, origin: Option<SubscriberId>) -> Self {
        Self {
            target: Target::Path {
                signal: Rc::downgrade(&signal.inner),
                name: Rc::clone(&signal.inner.name),
                path,
                origin,
            },
        }
    }

    /// Whether this is the unknown-signal placeholder.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        matches!(self.target, Target::Noop)
    }

    /// The path this setter writes, if it is path-bound.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::Path { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The subscriber recorded as origin of writes through this setter.
    #[must_use]
    pub fn origin(&self) -> Option<SubscriberId> {
        match &self.target {
            Target::Noop => None,
            Target::Whole { origin, .. } | Target::Path { origin, .. } => *origin,
        }
    }

    /// Write `value`.
    ///
    /// Whole-state setters expect an object and merge its keys; path setters
    /// assign at their path. The returned [`Completion`] settles when the
    /// batch flushes. The noop setter resolves immediately with `null`.
    pub fn set(&self, value: Value) -> Completion {
        match &self.target {
            Target::Noop => Completion::resolved(Value::Null),
            Target::Whole {
                signal,
                name,
                origin,
            } => {
                let Some(inner) = signal.upgrade() else {
                    return Completion::rejected(destroyed(name));
                };
                match value {
                    Value::Object(patch) => Signal { inner }.merge(patch, *origin),
                    other => Completion::rejected(SignalError::PatchNotObject {
                        found: ValueKind::of(&other),
                    }),
                }
            }
            Target::Path {
                signal,
                name,
                path,
                origin,
            } => match signal.upgrade() {
                Some(inner) => Signal { inner }.write(path.clone(), value, *origin),
                None => Completion::rejected(destroyed(name)),
            },
        }
    }
}

impl fmt::Debug for Setter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Noop => f.write_str("Setter::Noop"),
            Target::Whole { name, origin, .. } => f
                .debug_struct("Setter::Whole")
                .field("signal", &&**name)
                .field("origin", origin)
                .finish(),
            Target::Path {
                name, path, origin, ..
            } => f
                .debug_struct("Setter::Path")
                .field("signal", &&**name)
                .field("path", path)
                .field("origin", origin)
                .finish(),
        }
    }
}

fn destroyed(name: &str) -> SignalError {
    SignalError::Destroyed {
        signal: name.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

struct Subscriber {
    observed: Option<Path>,
    notify: Notify,
}

#[derive(Default)]
struct ShallowBatch {
    patch: Map<String, Value>,
    writers: AHashMap<String, Option<SubscriberId>>,
    completion: Option<Completion>,
}

impl ShallowBatch {
    /// Whether `id` should hear about this batch: some changed key it
    /// observes was last written by someone else.
    fn observes_change(&self, id: SubscriberId, observed: Option<&Path>) -> bool {
        self.patch
            .keys()
            .filter(|key| observed.is_none_or(|path| path.root() == key.as_str()))
            .any(|key| self.writers.get(key).copied().flatten() != Some(id))
    }
}

#[derive(Default)]
struct PendingPath {
    writer: Option<SubscriberId>,
    settled: AHashSet<SubscriberId>,
}

impl PendingPath {
    fn suppresses(&self, id: SubscriberId) -> bool {
        self.writer == Some(id) || self.settled.contains(&id)
    }
}

#[derive(Default)]
struct DeepBatch {
    paths: IndexMap<Path, PendingPath>,
    completion: Option<Completion>,
}

#[derive(Clone, Copy)]
enum Queue {
    Shallow,
    Deep,
}

fn join_batch(slot: &mut Option<Completion>) -> (Completion, bool) {
    let fresh = slot.is_none();
    let completion = slot.get_or_insert_with(Completion::pending).clone();
    (completion, fresh)
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

struct SignalCore {
    subscribers: IndexMap<SubscriberId, Subscriber>,
    deep_index: IndexMap<Path, IndexSet<SubscriberId>>,
    paths: AHashMap<String, Path>,
    shallow: ShallowBatch,
    deep: DeepBatch,
    /// Observers whose detach destroys the signal, in adoption order.
    owners: IndexSet<SubscriberId>,
    destroyed: bool,
}

struct SignalInner {
    name: Rc<str>,
    key: Option<String>,
    auto_destroy: bool,
    scheduler: Rc<dyn Scheduler>,
    state: RefCell<Value>,
    core: RefCell<SignalCore>,
    teardown: RefCell<Option<Teardown>>,
}

/// A named, batched, path-addressable state container.
///
/// Cheap to clone; clones share the same signal.
#[derive(Clone)]
pub struct Signal {
    inner: Rc<SignalInner>,
}

impl Signal {
    /// Create a standalone signal that is never auto-destroyed.
    pub fn new(name: impl Into<String>, state: Value, scheduler: Rc<dyn Scheduler>) -> Self {
        Self::with_options(
            name,
            state,
            scheduler,
            &SignalOptions::new().auto_destroy(false),
        )
    }

    /// Create a signal with explicit options.
    pub fn with_options(
        name: impl Into<String>,
        state: Value,
        scheduler: Rc<dyn Scheduler>,
        options: &SignalOptions,
    ) -> Self {
        let name: String = name.into();
        Self {
            inner: Rc::new(SignalInner {
                name: Rc::from(name),
                key: options.key.clone(),
                auto_destroy: options.auto_destroy,
                scheduler,
                state: RefCell::new(state),
                core: RefCell::new(SignalCore {
                    subscribers: IndexMap::new(),
                    deep_index: IndexMap::new(),
                    paths: AHashMap::new(),
                    shallow: ShallowBatch::default(),
                    deep: DeepBatch::default(),
                    owners: IndexSet::new(),
                    destroyed: false,
                }),
                teardown: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn set_teardown(&self, teardown: Teardown) {
        *self.inner.teardown.borrow_mut() = Some(teardown);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.inner.key.as_deref()
    }

    #[must_use]
    pub fn is_auto_destroy(&self) -> bool {
        self.inner.auto_destroy
    }

    /// The options this signal was created with.
    #[must_use]
    pub fn options(&self) -> SignalOptions {
        SignalOptions {
            key: self.inner.key.clone(),
            auto_destroy: self.inner.auto_destroy,
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.core.borrow().destroyed
    }

    /// Whether both handles point at the same signal.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Clone of the current state, without subscribing.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.inner.state.borrow().clone()
    }

    /// Borrow the current state, without subscribing.
    ///
    /// `f` may read this signal but must not write to it.
    pub fn with_state<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.core.borrow().subscribers.len()
    }

    #[must_use]
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.inner.core.borrow().subscribers.contains_key(&id)
    }

    /// Number of subscribers observing exactly `path`.
    #[must_use]
    pub fn observers_of(&self, path: &str) -> usize {
        let Ok(path) = Path::parse(path) else {
            return 0;
        };
        self.inner
            .core
            .borrow()
            .deep_index
            .get(&path)
            .map_or(0, IndexSet::len)
    }

    /// The first observer whose detach destroys this signal, if adopted yet.
    #[must_use]
    pub fn owner(&self) -> Option<SubscriberId> {
        self.inner.core.borrow().owners.first().copied()
    }

    /// Every observer whose detach destroys this signal.
    #[must_use]
    pub fn owners(&self) -> Vec<SubscriberId> {
        self.inner.core.borrow().owners.iter().copied().collect()
    }

    #[must_use]
    pub fn has_pending_shallow(&self) -> bool {
        self.inner.core.borrow().shallow.completion.is_some()
    }

    #[must_use]
    pub fn has_pending_deep(&self) -> bool {
        self.inner.core.borrow().deep.completion.is_some()
    }

    // -- reads --------------------------------------------------------------

    /// Subscribe to the whole state and read it.
    pub fn read(&self, observer: &dyn ObserverHandle) -> Read<Value> {
        self.read_resolved(observer, None, Option::unwrap_or_default)
    }

    /// Subscribe to the whole state and read a projection of it.
    pub fn compute<T>(&self, observer: &dyn ObserverHandle, f: impl FnOnce(&Value) -> T) -> Read<T> {
        self.read_resolved(observer, None, |state| f(&state.unwrap_or_default()))
    }

    /// Subscribe to `path` and read it. An empty path reads the whole state.
    pub fn read_path(&self, observer: &dyn ObserverHandle, path: &str) -> Read<Option<Value>> {
        let path = self.resolve_path(path).ok();
        self.read_resolved(observer, path, |value| value)
    }

    /// Subscribe to `path` and read a projection of it.
    pub fn compute_path<T>(
        &self,
        observer: &dyn ObserverHandle,
        path: &str,
        f: impl FnOnce(Option<&Value>) -> T,
    ) -> Read<T> {
        let path = self.resolve_path(path).ok();
        self.read_resolved(observer, path, |value| f(value.as_ref()))
    }

    /// Register `observer`, copy out the addressed value, then run `f` on it
    /// with no borrow held.
    fn read_resolved<T>(
        &self,
        observer: &dyn ObserverHandle,
        path: Option<Path>,
        f: impl FnOnce(Option<Value>) -> T,
    ) -> Read<T> {
        let subscriber = self.register(observer, path.as_ref());
        let value = {
            let state = self.inner.state.borrow();
            match &path {
                Some(path) => signalbox_path::get(&state, path).cloned(),
                None => Some(state.clone()),
            }
        };
        let origin = Some(observer.id());
        let setter = match path {
            Some(path) => Setter::at_path(self, path, origin),
            None => Setter::whole(self, origin),
        };
        Read {
            value: f(value),
            setter,
            subscriber,
        }
    }

    /// [`read`](Self::read) or [`read_path`](Self::read_path), by selector.
    pub fn select(&self, observer: &dyn ObserverHandle, selector: Selector<'_>) -> Read<Option<Value>> {
        self.compute_selected(observer, selector, |value| value.cloned())
    }

    /// [`compute`](Self::compute) or [`compute_path`](Self::compute_path), by
    /// selector.
    pub fn compute_selected<T>(
        &self,
        observer: &dyn ObserverHandle,
        selector: Selector<'_>,
        f: impl FnOnce(Option<&Value>) -> T,
    ) -> Read<T> {
        match selector {
            Selector::Whole => self.compute(observer, |state| f(Some(state))),
            Selector::Path(raw) => self.compute_path(observer, raw, f),
        }
    }

    // -- writes -------------------------------------------------------------

    /// A whole-state setter with no origin.
    #[must_use]
    pub fn setter(&self) -> Setter {
        Setter::whole(self, None)
    }

    /// A path setter with no origin.
    ///
    /// # Errors
    ///
    /// [`PathWriteError::EmptyPath`] for an empty path.
    pub fn path_setter(&self, path: &str) -> Result<Setter, PathWriteError> {
        let path = self.resolve_path(path)?;
        Ok(Setter::at_path(self, path, None))
    }

    /// Merge `patch` into the pending shallow batch.
    pub fn set_whole(&self, patch: Map<String, Value>) -> Completion {
        self.merge(patch, None)
    }

    /// Write `value` at `path` now and queue its dispatch.
    pub fn set_path(&self, path: &str, value: Value) -> Completion {
        match self.resolve_path(path) {
            Ok(path) => self.write(path, value, None),
            Err(err) => {
                tracing::debug!(signal = %self.inner.name, error = %err, "deep write rejected");
                Completion::rejected(err.into())
            }
        }
    }

    fn merge(&self, patch: Map<String, Value>, origin: Option<SubscriberId>) -> Completion {
        let (completion, fresh) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            if core.destroyed {
                return Completion::rejected(destroyed(&self.inner.name));
            }
            for (key, value) in patch {
                core.shallow.writers.insert(key.clone(), origin);
                core.shallow.patch.insert(key, value);
            }
            join_batch(&mut core.shallow.completion)
        };
        if fresh {
            self.schedule(Queue::Shallow, completion.clone());
        }
        completion
    }

    fn write(&self, path: Path, value: Value, origin: Option<SubscriberId>) -> Completion {
        let (completion, fresh) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            if core.destroyed {
                return Completion::rejected(destroyed(&self.inner.name));
            }
            if let Err(err) = signalbox_path::write(&mut self.inner.state.borrow_mut(), &path, value) {
                tracing::debug!(signal = %self.inner.name, error = %err, "deep write rejected");
                return Completion::rejected(err.into());
            }
            let pending = core.deep.paths.entry(path).or_default();
            pending.writer = origin;
            pending.settled.clear();
            join_batch(&mut core.deep.completion)
        };
        if fresh {
            self.schedule(Queue::Deep, completion.clone());
        }
        completion
    }

    fn schedule(&self, queue: Queue, completion: Completion) {
        let weak = Rc::downgrade(&self.inner);
        let name = Rc::clone(&self.inner.name);
        self.inner.scheduler.defer(Box::new(move || match weak.upgrade() {
            Some(inner) => {
                let signal = Signal { inner };
                match queue {
                    Queue::Shallow => signal.flush_shallow(),
                    Queue::Deep => signal.flush_deep(),
                }
            }
            None => completion.settle(Err(destroyed(&name))),
        }));
    }

    // -- flushes ------------------------------------------------------------

    fn flush_shallow(&self) {
        let (completion, targets, outcome) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            let batch = std::mem::take(&mut core.shallow);
            let Some(completion) = batch.completion.clone() else {
                return;
            };
            let mut state = self.inner.state.borrow_mut();
            if state.is_object() {
                let targets: Vec<Notify> = core
                    .subscribers
                    .iter()
                    .filter(|(id, sub)| batch.observes_change(**id, sub.observed.as_ref()))
                    .map(|(_, sub)| Rc::clone(&sub.notify))
                    .collect();
                if let Value::Object(map) = &mut *state {
                    map.extend(batch.patch);
                }
                (completion, targets, Ok(state.clone()))
            } else {
                let error = SignalError::StateNotObject {
                    signal: self.inner.name.to_string(),
                    found: ValueKind::of(&state),
                };
                (completion, Vec::new(), Err(error))
            }
        };

        match &outcome {
            Ok(_) => tracing::debug!(
                signal = %self.inner.name,
                notified = targets.len(),
                "shallow flush"
            ),
            Err(err) => tracing::debug!(
                signal = %self.inner.name,
                error = %err,
                "shallow flush rejected"
            ),
        }
        for notify in targets {
            notify();
        }
        completion.settle(outcome);
    }

    fn flush_deep(&self) {
        let (completion, targets, state, paths) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            let batch = std::mem::take(&mut core.deep);
            let Some(completion) = batch.completion else {
                return;
            };
            let mut targets = Vec::new();
            for (path, pending) in &batch.paths {
                let Some(ids) = core.deep_index.get(path) else {
                    continue;
                };
                for id in ids {
                    if pending.suppresses(*id) {
                        continue;
                    }
                    if let Some(sub) = core.subscribers.get(id) {
                        targets.push(Rc::clone(&sub.notify));
                    }
                }
            }
            (
                completion,
                targets,
                self.inner.state.borrow().clone(),
                batch.paths.len(),
            )
        };

        tracing::debug!(
            signal = %self.inner.name,
            paths,
            notified = targets.len(),
            "deep flush"
        );
        for notify in targets {
            notify();
        }
        completion.settle(Ok(state));
    }

    // -- lifecycle ----------------------------------------------------------

    fn resolve_path(&self, raw: &str) -> Result<Path, PathWriteError> {
        let mut core = self.inner.core.borrow_mut();
        if let Some(path) = core.paths.get(raw) {
            return Ok(path.clone());
        }
        let path = Path::parse(raw)?;
        if core.paths.len() >= PATH_CACHE_LIMIT {
            core.paths.clear();
        }
        core.paths.insert(raw.to_owned(), path.clone());
        Ok(path)
    }

    fn register(&self, observer: &dyn ObserverHandle, observed: Option<&Path>) -> Option<SubscriberId> {
        let id = observer.id();
        let fresh = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            if core.destroyed {
                tracing::trace!(signal = %self.inner.name, subscriber = %id, "read from destroyed signal");
                return None;
            }
            let fresh = !core.subscribers.contains_key(&id);
            if fresh {
                core.subscribers.insert(
                    id,
                    Subscriber {
                        observed: observed.cloned(),
                        notify: observer.notifier(),
                    },
                );
                if let Some(path) = observed {
                    core.deep_index.entry(path.clone()).or_default().insert(id);
                }
                if self.inner.auto_destroy && core.owners.is_empty() {
                    core.owners.insert(id);
                }
            }
            // A read of a pending path sees the eagerly written value.
            if let Some(path) = core.subscribers.get(&id).and_then(|s| s.observed.as_ref()) {
                if let Some(pending) = core.deep.paths.get_mut(path) {
                    pending.settled.insert(id);
                }
            }
            fresh
        };

        if fresh {
            let weak = Rc::downgrade(&self.inner);
            observer.on_detach(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Signal { inner }.detach(id);
                }
            }));
            tracing::trace!(
                signal = %self.inner.name,
                subscriber = %id,
                path = observed.map(Path::as_str),
                "registered subscriber"
            );
        }
        Some(id)
    }

    /// Add `owner` to the observers whose detach destroys this signal.
    ///
    /// Every creator of a live signal is armed this way, so the first of them
    /// to detach tears it down. Ignored for signals without auto-destroy and
    /// for observers already owning it.
    pub(crate) fn adopt_owner(&self, owner: &dyn ObserverHandle) {
        if !self.inner.auto_destroy {
            return;
        }
        let id = owner.id();
        {
            let mut core = self.inner.core.borrow_mut();
            if core.destroyed || !core.owners.insert(id) {
                return;
            }
        }
        tracing::trace!(signal = %self.inner.name, owner = %id, "owner armed");
        let weak = Rc::downgrade(&self.inner);
        owner.on_detach(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                Signal { inner }.detach(id);
            }
        }));
    }

    /// Remove one subscriber. Returns whether it was registered.
    ///
    /// Detaching the owner of an auto-destroy signal destroys it.
    pub fn detach(&self, id: SubscriberId) -> bool {
        let (removed, owner_left) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            if core.destroyed {
                return false;
            }
            let removed = core.subscribers.shift_remove(&id);
            if let Some(path) = removed.as_ref().and_then(|s| s.observed.as_ref()) {
                if let Some(ids) = core.deep_index.get_mut(path) {
                    ids.shift_remove(&id);
                    if ids.is_empty() {
                        core.deep_index.shift_remove(path);
                    }
                }
            }
            for pending in core.deep.paths.values_mut() {
                pending.settled.remove(&id);
            }
            (
                removed.is_some(),
                self.inner.auto_destroy && core.owners.contains(&id),
            )
        };

        tracing::trace!(signal = %self.inner.name, subscriber = %id, removed, "detached subscriber");
        if owner_left {
            tracing::debug!(signal = %self.inner.name, "owner detached");
            self.destroy();
        }
        removed
    }

    /// Tear the signal down.
    ///
    /// Clears state, subscribers, and both batches, rejects pending
    /// completions, and removes the signal from its registry.
    pub fn destroy(&self) {
        let pending = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            if core.destroyed {
                return;
            }
            core.destroyed = true;
            *self.inner.state.borrow_mut() = Value::Null;
            core.subscribers.clear();
            core.deep_index.clear();
            core.paths.clear();
            core.owners.clear();
            [
                std::mem::take(&mut core.shallow).completion,
                std::mem::take(&mut core.deep).completion,
            ]
        };

        let teardown = self.inner.teardown.borrow_mut().take();
        if let Some(teardown) = teardown {
            teardown(self);
        }
        for completion in pending.into_iter().flatten() {
            completion.settle(Err(destroyed(&self.inner.name)));
        }
        tracing::debug!(signal = %self.inner.name, "signal destroyed");
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Signal");
        s.field("name", &&*self.inner.name)
            .field("key", &self.inner.key)
            .field("auto_destroy", &self.inner.auto_destroy);
        match self.inner.core.try_borrow() {
            Ok(core) => s
                .field("subscribers", &core.subscribers.len())
                .field("destroyed", &core.destroyed)
                .finish(),
            Err(_) => s.finish_non_exhaustive(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Observer;
    use crate::scheduler::TaskQueue;
    use serde_json::json;
    use std::cell::Cell;

    fn signal(state: Value) -> (Signal, TaskQueue) {
        let queue = TaskQueue::new();
        let signal = Signal::new("test", state, Rc::new(queue.clone()));
        (signal, queue)
    }

    fn patch(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("patch must be an object"),
        }
    }

    #[test]
    fn read_whole_registers_once() {
        let (signal, _queue) = signal(json!({ "count": 0 }));
        let observer = Observer::new();
        let first = signal.read(&observer);
        let second = signal.read(&observer);
        assert_eq!(first.value, json!({ "count": 0 }));
        assert_eq!(first.subscriber, Some(observer.id()));
        assert_eq!(second.subscriber, Some(observer.id()));
        assert_eq!(signal.subscriber_count(), 1);
    }

    #[test]
    fn compute_projects_state() {
        let (signal, _queue) = signal(json!({ "items": [1, 2, 3] }));
        let observer = Observer::new();
        let read = signal.compute(&observer, |state| state["items"].as_array().map_or(0, Vec::len));
        assert_eq!(read.value, 3);
        assert!(read.setter.path().is_none());
        assert!(signal.is_subscribed(observer.id()));
    }

    #[test]
    fn compute_may_read_same_signal() {
        let (signal, _queue) = signal(json!({ "a": 1, "b": 2 }));
        let outer = Observer::new();
        let inner = Observer::new();
        let read = signal.compute(&outer, |state| {
            let b = signal.read_path(&inner, "b").value;
            (state["a"].clone(), b)
        });
        assert_eq!(read.value, (json!(1), Some(json!(2))));
        assert_eq!(signal.subscriber_count(), 2);
        assert_eq!(signal.observers_of("b"), 1);
    }

    #[test]
    fn compute_path_may_write_same_signal() {
        let (signal, queue) = signal(json!({ "a": 1, "b": 0 }));
        let reader = Observer::new();
        let watcher = Observer::new();
        let _ = signal.read_path(&watcher, "b");

        let read = signal.compute_path(&reader, "a", |a| {
            let doubled = a.and_then(Value::as_i64).unwrap_or(0) * 2;
            signal.set_path("b", json!(doubled));
            doubled
        });
        assert_eq!(read.value, 2);
        assert_eq!(signal.snapshot(), json!({ "a": 1, "b": 2 }));

        queue.run_until_idle();
        assert_eq!(watcher.notifications(), 1);
    }

    #[test]
    fn with_state_may_read_same_signal() {
        let (signal, _queue) = signal(json!({ "a": { "b": true } }));
        let observer = Observer::new();
        let (whole, nested) = signal.with_state(|state| {
            (state.clone(), signal.read_path(&observer, "a.b").value)
        });
        assert_eq!(whole, json!({ "a": { "b": true } }));
        assert_eq!(nested, Some(json!(true)));
    }

    #[test]
    fn missing_path_reads_none_and_still_registers() {
        let (signal, queue) = signal(json!({ "a": {} }));
        let observer = Observer::new();
        let read = signal.read_path(&observer, "a.b");
        assert_eq!(read.value, None);
        assert_eq!(signal.observers_of("a.b"), 1);

        signal.set_path("a.b", json!(1));
        queue.run_until_idle();
        assert_eq!(observer.notifications(), 1);
    }

    #[test]
    fn empty_path_reads_whole_state() {
        let (signal, _queue) = signal(json!({ "x": 1 }));
        let observer = Observer::new();
        let read = signal.read_path(&observer, "");
        assert_eq!(read.value, Some(json!({ "x": 1 })));
        assert!(read.setter.path().is_none());
        assert_eq!(signal.observers_of("x"), 0);
    }

    #[test]
    fn compute_path_transforms() {
        let (signal, _queue) = signal(json!({ "user": { "name": "ada" } }));
        let observer = Observer::new();
        let read = signal.compute_path(&observer, "user.name", |v| {
            v.and_then(Value::as_str).map(str::to_uppercase)
        });
        assert_eq!(read.value.as_deref(), Some("ADA"));
        assert_eq!(read.setter.path().map(Path::as_str), Some("user.name"));
    }

    #[test]
    fn shallow_writes_coalesce() {
        let (signal, queue) = signal(json!({}));
        let watcher = Observer::new();
        let _ = signal.read(&watcher);

        let a = signal.set_whole(patch(json!({ "count": 1 })));
        let b = signal.set_whole(patch(json!({ "count": 2 })));
        let c = signal.set_whole(patch(json!({ "flag": true })));
        assert!(a.same_batch(&b) && b.same_batch(&c));
        assert_eq!(queue.len(), 1);
        assert_eq!(signal.snapshot(), json!({}), "shallow patch waits for flush");

        assert_eq!(queue.run_until_idle(), 1);
        assert_eq!(watcher.notifications(), 1);
        assert_eq!(signal.snapshot(), json!({ "count": 2, "flag": true }));
        assert_eq!(c.outcome(), Some(Ok(json!({ "count": 2, "flag": true }))));
        assert!(!signal.has_pending_shallow());
    }

    #[test]
    fn shallow_origin_is_suppressed() {
        let (signal, queue) = signal(json!({ "count": 0 }));
        let writer = Observer::new();
        let other = Observer::new();
        let read = signal.read(&writer);
        let _ = signal.read(&other);

        read.setter.set(json!({ "count": 1 }));
        queue.run_until_idle();
        assert_eq!(writer.notifications(), 0);
        assert_eq!(other.notifications(), 1);
    }

    #[test]
    fn shallow_origin_hears_keys_written_by_others() {
        let (signal, queue) = signal(json!({}));
        let a = Observer::new();
        let b = Observer::new();
        let set_a = signal.read(&a).setter;
        let set_b = signal.read(&b).setter;

        set_a.set(json!({ "count": 1 }));
        set_b.set(json!({ "flag": true }));
        queue.run_until_idle();
        assert_eq!(a.notifications(), 1, "a did not write flag");
        assert_eq!(b.notifications(), 1, "b did not write count");
    }

    #[test]
    fn shallow_last_writer_wins_suppression() {
        let (signal, queue) = signal(json!({}));
        let a = Observer::new();
        let b = Observer::new();
        let set_a = signal.read(&a).setter;
        let set_b = signal.read(&b).setter;

        set_b.set(json!({ "count": 1 }));
        set_a.set(json!({ "count": 2 }));
        queue.run_until_idle();
        assert_eq!(a.notifications(), 0);
        assert_eq!(b.notifications(), 1, "b's value was overwritten by a");
    }

    #[test]
    fn shallow_path_observer_matches_root_key() {
        let (signal, queue) = signal(json!({ "app": { "count": 0 }, "deep": { "count": 0 } }));
        let app = Observer::new();
        let whole = Observer::new();
        let _ = signal.read_path(&app, "app.count");
        let _ = signal.read(&whole);

        signal.set_whole(patch(json!({ "deep": { "count": 1 } })));
        queue.run_until_idle();
        assert_eq!(app.notifications(), 0);
        assert_eq!(whole.notifications(), 1);

        signal.set_whole(patch(json!({ "app": { "count": 1 } })));
        queue.run_until_idle();
        assert_eq!(app.notifications(), 1);
        assert_eq!(whole.notifications(), 2);
    }

    #[test]
    fn deep_write_is_visible_before_flush() {
        let (signal, queue) = signal(json!({ "a": { "b": 0 } }));
        let observer = Observer::new();
        signal.set_path("a.b", json!(5));
        assert_eq!(signal.read_path(&observer, "a.b").value, Some(json!(5)));
        assert!(signal.has_pending_deep());
        queue.run_until_idle();
        assert!(!signal.has_pending_deep());
    }

    #[test]
    fn deep_origin_is_suppressed() {
        let (signal, queue) = signal(json!({ "a": { "b": 0 } }));
        let writer = Observer::new();
        let other = Observer::new();
        let read = signal.read_path(&writer, "a.b");
        let _ = signal.read_path(&other, "a.b");

        let done = read.setter.set(json!(1));
        queue.run_until_idle();
        assert_eq!(writer.notifications(), 0);
        assert_eq!(other.notifications(), 1);
        assert_eq!(done.outcome(), Some(Ok(json!({ "a": { "b": 1 } }))));
    }

    #[test]
    fn deep_dispatch_uses_path_equality() {
        let (signal, queue) = signal(json!({ "a": { "b": 0 } }));
        let parent = Observer::new();
        let exact = Observer::new();
        let _ = signal.read_path(&parent, "a");
        let _ = signal.read_path(&exact, "a.b");

        signal.set_path("a.b", json!(1));
        queue.run_until_idle();
        assert_eq!(parent.notifications(), 0);
        assert_eq!(exact.notifications(), 1);
    }

    #[test]
    fn deep_writes_coalesce_per_flush() {
        let (signal, queue) = signal(json!({ "a": 0, "b": 0 }));
        let a = Observer::new();
        let b = Observer::new();
        let _ = signal.read_path(&a, "a");
        let _ = signal.read_path(&b, "b");

        let first = signal.set_path("a", json!(1));
        let second = signal.set_path("a", json!(2));
        let third = signal.set_path("b", json!(3));
        assert!(first.same_batch(&second) && second.same_batch(&third));
        assert_eq!(queue.run_until_idle(), 1);
        assert_eq!(a.notifications(), 1);
        assert_eq!(b.notifications(), 1);
    }

    #[test]
    fn reread_settles_pending_path() {
        let (signal, queue) = signal(json!({ "a": 0 }));
        let reader = Observer::new();
        let _ = signal.read_path(&reader, "a");

        signal.set_path("a", json!(1));
        let again = signal.read_path(&reader, "a");
        assert_eq!(again.value, Some(json!(1)));
        queue.run_until_idle();
        assert_eq!(reader.notifications(), 0);
    }

    #[test]
    fn write_after_reread_unsettles() {
        let (signal, queue) = signal(json!({ "a": 0 }));
        let reader = Observer::new();
        let _ = signal.read_path(&reader, "a");

        signal.set_path("a", json!(1));
        let _ = signal.read_path(&reader, "a");
        signal.set_path("a", json!(2));
        queue.run_until_idle();
        assert_eq!(reader.notifications(), 1);
    }

    #[test]
    fn failed_deep_write_rejects_and_keeps_state() {
        let (signal, queue) = signal(json!({ "a": 1 }));
        let done = signal.set_path("a.b.c", json!(1));
        assert!(matches!(
            done.outcome(),
            Some(Err(SignalError::PathWrite(PathWriteError::NotIndexable { .. })))
        ));
        assert_eq!(signal.snapshot(), json!({ "a": 1 }));
        assert!(queue.is_empty());
        assert!(!signal.has_pending_deep());
    }

    #[test]
    fn empty_write_path_is_rejected() {
        let (signal, queue) = signal(json!({}));
        let done = signal.set_path("", json!(1));
        assert_eq!(
            done.outcome(),
            Some(Err(SignalError::PathWrite(PathWriteError::EmptyPath)))
        );
        assert!(signal.path_setter("").is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn failed_write_does_not_disturb_pending_batch() {
        let (signal, queue) = signal(json!({ "a": 1, "b": 0 }));
        let observer = Observer::new();
        let _ = signal.read_path(&observer, "b");

        let ok = signal.set_path("b", json!(1));
        let bad = signal.set_path("a.x", json!(1));
        assert!(!ok.same_batch(&bad));
        queue.run_until_idle();
        assert_eq!(observer.notifications(), 1);
        assert!(matches!(ok.outcome(), Some(Ok(_))));
    }

    #[test]
    fn whole_setter_rejects_non_object() {
        let (signal, queue) = signal(json!({}));
        let done = signal.setter().set(json!(3));
        assert_eq!(
            done.outcome(),
            Some(Err(SignalError::PatchNotObject {
                found: ValueKind::Number
            }))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn shallow_and_deep_are_independent_batches() {
        let (signal, queue) = signal(json!({ "count": 0 }));
        let whole = Observer::new();
        let path = Observer::new();
        let _ = signal.read(&whole);
        let _ = signal.read_path(&path, "count");

        let shallow = signal.set_whole(patch(json!({ "count": 1 })));
        let deep = signal.set_path("count", json!(2));
        assert!(!shallow.same_batch(&deep));
        assert_eq!(queue.run_until_idle(), 2);

        assert_eq!(whole.notifications(), 1);
        assert_eq!(path.notifications(), 2, "once per queue");
        // the deep write landed first; the shallow merge ran after it
        assert_eq!(signal.snapshot(), json!({ "count": 1 }));
    }

    #[test]
    fn shallow_flush_over_non_object_state_rejects() {
        let (signal, queue) = signal(json!(5));
        let observer = Observer::new();
        let _ = signal.read(&observer);
        let done = signal.set_whole(patch(json!({ "a": 1 })));
        queue.run_until_idle();
        assert!(matches!(
            done.outcome(),
            Some(Err(SignalError::StateNotObject { .. }))
        ));
        assert_eq!(observer.notifications(), 0);
        assert_eq!(signal.snapshot(), json!(5));
    }

    #[test]
    fn notified_observer_can_write_into_next_batch() {
        let queue = TaskQueue::new();
        let signal = Signal::new("test", json!({ "n": 0 }), Rc::new(queue.clone()));

        let echo_signal = signal.clone();
        let fired = Rc::new(Cell::new(0));
        let f = Rc::clone(&fired);
        let echo = Observer::with_callback(move || {
            f.set(f.get() + 1);
            if f.get() == 1 {
                echo_signal.set_path("echo", json!(true));
            }
        });
        let _ = signal.read(&echo);

        signal.set_whole(patch(json!({ "n": 1 })));
        assert_eq!(queue.run_until_idle(), 2);
        assert_eq!(signal.snapshot(), json!({ "n": 1, "echo": true }));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn detach_removes_only_that_subscriber() {
        let (signal, queue) = signal(json!({ "a": 0 }));
        let first = Observer::new();
        let second = Observer::new();
        let _ = signal.read_path(&first, "a");
        let _ = signal.read_path(&second, "a");
        assert_eq!(signal.observers_of("a"), 2);

        first.detach();
        assert_eq!(signal.observers_of("a"), 1);
        assert!(!signal.is_subscribed(first.id()));

        signal.set_path("a", json!(1));
        queue.run_until_idle();
        assert_eq!(second.notifications(), 1);

        second.detach();
        assert_eq!(signal.observers_of("a"), 0);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn destroy_rejects_pending_and_later_writes() {
        let (signal, queue) = signal(json!({ "a": 0 }));
        let shallow = signal.set_whole(patch(json!({ "a": 1 })));
        let deep = signal.set_path("a", json!(2));
        signal.destroy();

        assert!(signal.is_destroyed());
        assert_eq!(signal.snapshot(), Value::Null);
        assert!(matches!(shallow.outcome(), Some(Err(SignalError::Destroyed { .. }))));
        assert!(matches!(deep.outcome(), Some(Err(SignalError::Destroyed { .. }))));

        queue.run_until_idle();
        let late = signal.set_path("a", json!(3));
        assert!(matches!(late.outcome(), Some(Err(SignalError::Destroyed { .. }))));
    }

    #[test]
    fn setter_outliving_signal_rejects() {
        let (signal, _queue) = signal(json!({ "a": 0 }));
        let observer = Observer::new();
        let setter = signal.read_path(&observer, "a").setter;
        drop(signal);
        assert!(matches!(
            setter.set(json!(1)).outcome(),
            Some(Err(SignalError::Destroyed { .. }))
        ));
    }

    #[test]
    fn flush_after_drop_rejects_completion() {
        let (signal, queue) = signal(json!({}));
        let done = signal.set_whole(patch(json!({ "a": 1 })));
        drop(signal);
        queue.run_until_idle();
        assert!(matches!(done.outcome(), Some(Err(SignalError::Destroyed { .. }))));
    }

    #[test]
    fn auto_destroy_adopts_first_subscriber() {
        let queue = TaskQueue::new();
        let signal = Signal::with_options(
            "owned",
            json!({}),
            Rc::new(queue),
            &SignalOptions::new().key("owned"),
        );
        let first = Observer::new();
        let second = Observer::new();
        let _ = signal.read(&first);
        let _ = signal.read(&second);
        assert_eq!(signal.owner(), Some(first.id()));

        second.detach();
        assert!(!signal.is_destroyed());
        first.detach();
        assert!(signal.is_destroyed());
    }

    #[test]
    fn each_adopted_owner_can_tear_down() {
        let signal = Signal::with_options(
            "shared",
            json!({}),
            Rc::new(TaskQueue::new()),
            &SignalOptions::new(),
        );
        let first = Observer::new();
        let second = Observer::new();
        signal.adopt_owner(&first);
        signal.adopt_owner(&second);
        signal.adopt_owner(&second);
        assert_eq!(signal.owners(), vec![first.id(), second.id()]);
        assert_eq!(signal.owner(), Some(first.id()));

        second.detach();
        assert!(signal.is_destroyed());
        assert!(signal.owners().is_empty());
    }

    #[test]
    fn noop_setter_resolves_null() {
        let setter = Setter::noop();
        assert!(setter.is_noop());
        assert_eq!(setter.set(json!(1)).outcome(), Some(Ok(Value::Null)));
    }

    #[test]
    fn selector_from_str() {
        assert_eq!(Selector::from(""), Selector::Whole);
        assert_eq!(Selector::from("a.b"), Selector::Path("a.b"));
        assert_eq!(Selector::from(None), Selector::Whole);
        assert_eq!(Selector::Path("x").path(), Some("x"));
    }

    #[test]
    fn debug_format() {
        let (signal, _queue) = signal(json!({}));
        let debug = format!("{signal:?}");
        assert!(debug.contains("\"test\""));
        assert!(debug.contains("subscribers: 0"));
    }
}
