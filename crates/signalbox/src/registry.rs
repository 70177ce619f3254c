#![forbid(unsafe_code)]

//! Named signal registry.
//!
//! The registry maps names to live [`Signal`]s. It always holds one signal
//! named [`GLOBAL_SIGNAL`], seeded from [`StoreConfig`] when the registry is
//! built.
//!
//! # Invariants
//!
//! 1. At most one live signal per name. `create` on a live name returns the
//!    existing signal unchanged.
//! 2. A destroyed signal is no longer reachable by name; a later `create`
//!    under the same name builds a fresh signal.
//! 3. A signal's teardown removes its own entry only, never a newer signal
//!    registered under the same name.
//! 4. Names iterate in creation order.
//!
//! Non-fatal conditions are reported as [`Diagnostic`]s: logged at `warn`
//! and kept in a bounded log readable through [`SignalRegistry::diagnostics`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use indexmap::IndexMap;
use serde_json::Value;
use signalbox_path::ValueKind;

use crate::config::{InitialState, StoreConfig};
use crate::error::Diagnostic;
use crate::observer::ObserverHandle;
use crate::scheduler::Scheduler;
use crate::signal::{Read, Selector, Signal, SignalOptions};

/// Name of the signal every registry is created with.
pub const GLOBAL_SIGNAL: &str = "global";

/// Diagnostics kept before the oldest is dropped.
pub const DIAGNOSTIC_CAPACITY: usize = 64;

struct RegistryInner {
    signals: RefCell<IndexMap<String, Signal>>,
    /// Initial values of live signals not built by a factory.
    seeds: RefCell<AHashMap<String, Value>>,
    scheduler: Rc<dyn Scheduler>,
    diagnostics: RefCell<VecDeque<Diagnostic>>,
}

/// Name-to-signal map.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SignalRegistry {
    inner: Rc<RegistryInner>,
}

impl SignalRegistry {
    /// Build a registry and its `global` signal.
    pub fn new(config: StoreConfig, scheduler: impl Scheduler + 'static) -> Self {
        Self::with_shared_scheduler(config, Rc::new(scheduler))
    }

    /// Build a registry on a scheduler shared with other owners.
    pub fn with_shared_scheduler(config: StoreConfig, scheduler: Rc<dyn Scheduler>) -> Self {
        let registry = Self {
            inner: Rc::new(RegistryInner {
                signals: RefCell::new(IndexMap::new()),
                seeds: RefCell::new(AHashMap::new()),
                scheduler,
                diagnostics: RefCell::new(VecDeque::new()),
            }),
        };
        let StoreConfig {
            initial_global_state,
            auto_destroy,
        } = config;
        registry.create(
            GLOBAL_SIGNAL,
            initial_global_state,
            SignalOptions::new()
                .key(GLOBAL_SIGNAL)
                .auto_destroy(auto_destroy),
        );
        tracing::debug!(auto_destroy, "signal registry initialized");
        registry
    }

    /// Create `name`, or return the live signal already registered under it.
    ///
    /// Re-creating with different options, or with an initial value that
    /// differs from the one the signal was seeded with, keeps the existing
    /// signal and records [`Diagnostic::RedundantCreate`]. Factories are never
    /// run for a live signal, so they are not compared.
    pub fn create(
        &self,
        name: &str,
        initial: impl Into<InitialState>,
        options: SignalOptions,
    ) -> Signal {
        let initial = initial.into();
        if let Some(existing) = self.signal(name) {
            let reseeded = match initial.as_value() {
                Some(value) => self
                    .inner
                    .seeds
                    .borrow()
                    .get(name)
                    .is_some_and(|seed| seed != value),
                None => false,
            };
            if existing.options() == options && !reseeded {
                tracing::trace!(signal = name, "create on live signal");
            } else {
                self.emit(Diagnostic::RedundantCreate {
                    signal: name.to_owned(),
                });
            }
            return existing;
        }

        let seed = initial.as_value().cloned();
        let state = initial.into_value();
        if !state.is_object() {
            self.emit(Diagnostic::NonObjectState {
                signal: name.to_owned(),
                found: ValueKind::of(&state),
            });
        }

        let signal = Signal::with_options(name, state, Rc::clone(&self.inner.scheduler), &options);
        let registry = Rc::downgrade(&self.inner);
        signal.set_teardown(Box::new(move |signal: &Signal| remove_entry(&registry, signal)));
        self.inner
            .signals
            .borrow_mut()
            .insert(name.to_owned(), signal.clone());
        if let Some(seed) = seed {
            self.inner.seeds.borrow_mut().insert(name.to_owned(), seed);
        }
        tracing::debug!(
            signal = name,
            key = options.key.as_deref(),
            auto_destroy = options.auto_destroy,
            "signal created"
        );
        signal
    }

    /// [`create`](Self::create), then hand lifecycle ownership to `owner`.
    pub fn create_owned(
        &self,
        name: &str,
        initial: impl Into<InitialState>,
        options: SignalOptions,
        owner: &dyn ObserverHandle,
    ) -> Signal {
        let signal = self.create(name, initial, options);
        signal.adopt_owner(owner);
        signal
    }

    /// Subscribe to `name` and read the selected value.
    ///
    /// Unknown names read `None` with a noop setter and record
    /// [`Diagnostic::UnknownSignal`].
    pub fn get(
        &self,
        name: &str,
        observer: &dyn ObserverHandle,
        selector: Selector<'_>,
    ) -> Read<Option<Value>> {
        self.compute(name, observer, selector, |value| value.cloned())
            .map(Option::flatten)
    }

    /// Subscribe to `name` and project the selected value.
    ///
    /// The outer `None` means the signal does not exist.
    pub fn compute<T>(
        &self,
        name: &str,
        observer: &dyn ObserverHandle,
        selector: Selector<'_>,
        f: impl FnOnce(Option<&Value>) -> T,
    ) -> Read<Option<T>> {
        match self.signal(name) {
            Some(signal) => signal.compute_selected(observer, selector, f).map(Some),
            None => {
                self.emit(Diagnostic::UnknownSignal {
                    signal: name.to_owned(),
                });
                Read::unknown()
            }
        }
    }

    /// The live signal registered as `name`, without subscribing.
    #[must_use]
    pub fn signal(&self, name: &str) -> Option<Signal> {
        self.inner.signals.borrow().get(name).cloned()
    }

    /// The `global` signal, if it is still alive.
    #[must_use]
    pub fn global(&self) -> Option<Signal> {
        self.signal(GLOBAL_SIGNAL)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.signals.borrow().contains_key(name)
    }

    /// Live signal names in creation order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.signals.borrow().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.signals.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.signals.borrow().is_empty()
    }

    /// Destroy `name`. Returns whether it existed.
    pub fn destroy(&self, name: &str) -> bool {
        let removed = self.inner.signals.borrow_mut().shift_remove(name);
        if removed.is_some() {
            self.inner.seeds.borrow_mut().remove(name);
        }
        match removed {
            Some(signal) => {
                signal.destroy();
                true
            }
            None => false,
        }
    }

    /// Destroy every signal, `global` included.
    pub fn destroy_all(&self) {
        let signals: Vec<Signal> = self
            .inner
            .signals
            .borrow_mut()
            .drain(..)
            .map(|(_, signal)| signal)
            .collect();
        self.inner.seeds.borrow_mut().clear();
        let count = signals.len();
        for signal in signals {
            signal.destroy();
        }
        tracing::debug!(count, "signal registry destroyed");
    }

    /// Diagnostics recorded so far, oldest first.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.diagnostics.borrow().iter().cloned().collect()
    }

    /// Drain the diagnostic log.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.diagnostics.borrow_mut().drain(..).collect()
    }

    fn emit(&self, diagnostic: Diagnostic) {
        tracing::warn!(signal = diagnostic.signal(), "{diagnostic}");
        let mut log = self.inner.diagnostics.borrow_mut();
        if log.len() >= DIAGNOSTIC_CAPACITY {
            log.pop_front();
        }
        log.push_back(diagnostic);
    }
}

fn remove_entry(registry: &Weak<RegistryInner>, signal: &Signal) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let mut signals = inner.signals.borrow_mut();
    if signals
        .get(signal.name())
        .is_some_and(|current| current.ptr_eq(signal))
    {
        signals.shift_remove(signal.name());
        inner.seeds.borrow_mut().remove(signal.name());
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("signals", &self.names())
            .field("diagnostics", &self.inner.diagnostics.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Observer;
    use crate::scheduler::TaskQueue;
    use serde_json::json;

    fn registry() -> (SignalRegistry, TaskQueue) {
        let queue = TaskQueue::new();
        let registry = SignalRegistry::new(StoreConfig::default(), queue.clone());
        (registry, queue)
    }

    #[test]
    fn global_exists_from_config() {
        let queue = TaskQueue::new();
        let registry = SignalRegistry::new(
            StoreConfig::new()
                .auto_destroy(false)
                .initial_global_state(json!({ "theme": "dark" })),
            queue,
        );
        let global = registry.global().expect("global signal");
        assert_eq!(global.snapshot(), json!({ "theme": "dark" }));
        assert_eq!(global.key(), Some(GLOBAL_SIGNAL));
        assert!(!global.is_auto_destroy());
        assert_eq!(registry.names(), vec![GLOBAL_SIGNAL.to_owned()]);
    }

    #[test]
    fn create_is_idempotent() {
        let (registry, _queue) = registry();
        let first = registry.create("app", json!({ "n": 1 }), SignalOptions::new());
        let second = registry.create("app", json!({ "n": 1 }), SignalOptions::new());
        assert!(first.ptr_eq(&second));
        assert!(registry.diagnostics().is_empty());

        let third = registry.create("app", json!({ "n": 2 }), SignalOptions::new());
        assert!(first.ptr_eq(&third));
        assert_eq!(third.snapshot(), json!({ "n": 1 }));
        assert_eq!(
            registry.diagnostics(),
            vec![Diagnostic::RedundantCreate {
                signal: "app".into()
            }]
        );
    }

    #[test]
    fn recreate_compares_against_seed_not_current_state() {
        let (registry, queue) = registry();
        let signal = registry.create("app", json!({ "count": 0 }), SignalOptions::new());
        signal.set_path("count", json!(5));
        queue.run_until_idle();

        registry.create("app", json!({ "count": 0 }), SignalOptions::new());
        assert!(registry.diagnostics().is_empty());
        registry.create("app", json!({ "count": 99, "other": true }), SignalOptions::new());
        assert_eq!(registry.take_diagnostics().len(), 1);
        assert_eq!(signal.snapshot(), json!({ "count": 5 }));
    }

    #[test]
    fn recreate_after_destroy_takes_new_seed() {
        let (registry, _queue) = registry();
        registry.create("app", json!({ "v": 1 }), SignalOptions::new());
        assert!(registry.destroy("app"));
        let fresh = registry.create("app", json!({ "v": 2 }), SignalOptions::new());
        assert_eq!(fresh.snapshot(), json!({ "v": 2 }));
        registry.create("app", json!({ "v": 2 }), SignalOptions::new());
        assert!(registry.diagnostics().is_empty());
    }

    #[test]
    fn redundant_create_with_new_options_is_diagnosed() {
        let (registry, _queue) = registry();
        registry.create("app", json!({}), SignalOptions::new());
        let again = registry.create("app", json!({}), SignalOptions::new().auto_destroy(false));
        assert!(again.is_auto_destroy());
        assert_eq!(
            registry.take_diagnostics(),
            vec![Diagnostic::RedundantCreate {
                signal: "app".into()
            }]
        );
        assert!(registry.diagnostics().is_empty());
    }

    #[test]
    fn factory_runs_once() {
        let (registry, _queue) = registry();
        let signal = registry.create(
            "lazy",
            InitialState::factory(|| Value::Null),
            SignalOptions::new(),
        );
        assert_eq!(signal.snapshot(), json!({}));
        registry.create(
            "lazy",
            InitialState::factory(|| panic!("factory must not run for a live signal")),
            SignalOptions::new(),
        );
        registry.create("lazy", json!({ "late": 1 }), SignalOptions::new());
        assert!(registry.diagnostics().is_empty());
    }

    #[test]
    fn non_object_state_is_diagnosed_and_kept() {
        let (registry, _queue) = registry();
        let signal = registry.create("count", json!(3), SignalOptions::new());
        assert_eq!(signal.snapshot(), json!(3));
        assert_eq!(
            registry.diagnostics(),
            vec![Diagnostic::NonObjectState {
                signal: "count".into(),
                found: ValueKind::Number,
            }]
        );
    }

    #[test]
    fn get_unknown_returns_noop() {
        let (registry, _queue) = registry();
        let observer = Observer::new();
        let read = registry.get("missing", &observer, Selector::Whole);
        assert_eq!(read.value, None);
        assert!(read.setter.is_noop());
        assert_eq!(read.subscriber, None);
        assert_eq!(registry.diagnostics().len(), 1);
    }

    #[test]
    fn get_subscribes() {
        let (registry, queue) = registry();
        registry.create("app", json!({ "user": { "name": "ada" } }), SignalOptions::new());
        let observer = Observer::new();
        let read = registry.get("app", &observer, Selector::Path("user.name"));
        assert_eq!(read.value, Some(json!("ada")));

        read.setter.set(json!("grace"));
        let other = Observer::new();
        let fresh = registry.get("app", &other, "user.name".into());
        assert_eq!(fresh.value, Some(json!("grace")));
        queue.run_until_idle();
        assert_eq!(observer.notifications(), 0);
    }

    #[test]
    fn compute_distinguishes_missing_signal_from_missing_path() {
        let (registry, _queue) = registry();
        registry.create("app", json!({}), SignalOptions::new());
        let observer = Observer::new();
        let present = registry.compute("app", &observer, "x".into(), |v| v.is_some());
        let absent = registry.compute("nope", &observer, "x".into(), |v| v.is_some());
        assert_eq!(present.value, Some(false));
        assert_eq!(absent.value, None);
    }

    #[test]
    fn destroy_removes_and_allows_recreate() {
        let (registry, _queue) = registry();
        let old = registry.create("app", json!({ "v": 1 }), SignalOptions::new());
        assert!(registry.destroy("app"));
        assert!(!registry.destroy("app"));
        assert!(old.is_destroyed());
        assert!(!registry.contains("app"));

        let new = registry.create("app", json!({ "v": 2 }), SignalOptions::new());
        assert!(!new.ptr_eq(&old));
        assert_eq!(new.snapshot(), json!({ "v": 2 }));
    }

    #[test]
    fn stale_teardown_keeps_newer_signal() {
        let (registry, _queue) = registry();
        let old = registry.create("app", json!({}), SignalOptions::new());
        registry.destroy("app");
        let new = registry.create("app", json!({}), SignalOptions::new());
        old.destroy();
        assert!(registry.signal("app").is_some_and(|s| s.ptr_eq(&new)));
    }

    #[test]
    fn owner_detach_removes_from_registry() {
        let (registry, _queue) = registry();
        let owner = Observer::new();
        let signal = registry.create_owned("session", json!({}), SignalOptions::new(), &owner);
        assert_eq!(signal.owner(), Some(owner.id()));

        let reader = Observer::new();
        let _ = registry.get("session", &reader, Selector::Whole);
        reader.detach();
        assert!(registry.contains("session"));

        owner.detach();
        assert!(signal.is_destroyed());
        assert!(!registry.contains("session"));
    }

    #[test]
    fn non_auto_destroy_ignores_owner() {
        let (registry, _queue) = registry();
        let owner = Observer::new();
        let signal = registry.create_owned(
            "pinned",
            json!({}),
            SignalOptions::new().auto_destroy(false),
            &owner,
        );
        owner.detach();
        assert!(!signal.is_destroyed());
        assert!(registry.contains("pinned"));
    }

    #[test]
    fn destroy_all_empties_registry() {
        let (registry, _queue) = registry();
        let app = registry.create("app", json!({}), SignalOptions::new());
        let pending = app.set_path("a", json!(1));
        registry.destroy_all();
        assert!(registry.is_empty());
        assert!(app.is_destroyed());
        assert!(matches!(
            pending.outcome(),
            Some(Err(crate::SignalError::Destroyed { .. }))
        ));
    }

    #[test]
    fn diagnostics_are_bounded() {
        let (registry, _queue) = registry();
        let observer = Observer::new();
        for i in 0..DIAGNOSTIC_CAPACITY + 5 {
            let _ = registry.get(&format!("missing-{i}"), &observer, Selector::Whole);
        }
        let log = registry.diagnostics();
        assert_eq!(log.len(), DIAGNOSTIC_CAPACITY);
        assert_eq!(log[0].signal(), "missing-5");
    }

    #[test]
    fn names_keep_creation_order() {
        let (registry, _queue) = registry();
        registry.create("b", json!({}), SignalOptions::new());
        registry.create("a", json!({}), SignalOptions::new());
        assert_eq!(registry.names(), vec!["global", "b", "a"]);
        assert_eq!(registry.len(), 3);
    }
}
