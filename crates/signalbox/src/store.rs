#![forbid(unsafe_code)]

//! Process-facing facade over a lazily built [`SignalRegistry`].
//!
//! A [`Store`] owns at most one registry at a time. The first operation that
//! needs it builds it; [`Store::init_registry`] lets the host pick the config
//! up front. After [`Store::destroy_registry`] the next use builds a fresh one.
//!
//! | Operation  | Builds registry with          |
//! |------------|-------------------------------|
//! | `read`     | default config                |
//! | `compute`  | default config                |
//! | `create`   | `auto_destroy` from options   |
//! | `get`      | `auto_destroy = false`        |

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::config::{InitialState, StoreConfig};
use crate::observer::ObserverHandle;
use crate::registry::{GLOBAL_SIGNAL, SignalRegistry};
use crate::scheduler::Scheduler;
use crate::signal::{Read, Selector, Setter, Signal, SignalOptions};

/// Result of [`Store::create`].
#[derive(Debug, Clone)]
pub struct Created {
    /// State right after creation.
    pub state: Value,
    /// Whole-state setter with no origin.
    pub setter: Setter,
    /// The signal itself.
    pub signal: Signal,
}

/// Lazily initialized registry holder.
pub struct Store {
    scheduler: Rc<dyn Scheduler>,
    registry: RefCell<Option<SignalRegistry>>,
}

impl Store {
    /// Create a store. No registry is built yet.
    pub fn new(scheduler: impl Scheduler + 'static) -> Self {
        Self {
            scheduler: Rc::new(scheduler),
            registry: RefCell::new(None),
        }
    }

    /// Build the registry with `config`, unless one already exists.
    ///
    /// The first call wins; later configs are ignored.
    pub fn init_registry(&self, config: StoreConfig) -> SignalRegistry {
        let mut slot = self.registry.borrow_mut();
        if let Some(registry) = slot.as_ref() {
            tracing::trace!("registry already initialized");
            return registry.clone();
        }
        let registry = SignalRegistry::with_shared_scheduler(config, Rc::clone(&self.scheduler));
        *slot = Some(registry.clone());
        registry
    }

    /// The registry, built with the default config if needed.
    pub fn registry(&self) -> SignalRegistry {
        self.init_registry(StoreConfig::default())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.registry.borrow().is_some()
    }

    /// Subscribe and read. `None` as name means the global signal.
    pub fn read(
        &self,
        observer: &dyn ObserverHandle,
        name: Option<&str>,
        selector: Selector<'_>,
    ) -> Read<Option<Value>> {
        self.registry()
            .get(name.unwrap_or(GLOBAL_SIGNAL), observer, selector)
    }

    /// Subscribe and project. `None` as name means the global signal.
    pub fn compute<T>(
        &self,
        observer: &dyn ObserverHandle,
        name: Option<&str>,
        selector: Selector<'_>,
        f: impl FnOnce(Option<&Value>) -> T,
    ) -> Read<Option<T>> {
        self.registry()
            .compute(name.unwrap_or(GLOBAL_SIGNAL), observer, selector, f)
    }

    /// Create (or fetch) `name`.
    ///
    /// With an `owner`, an auto-destroy signal is torn down when that owner
    /// detaches. Every owner passed for a live signal is armed this way.
    pub fn create(
        &self,
        name: &str,
        initial: impl Into<InitialState>,
        options: SignalOptions,
        owner: Option<&dyn ObserverHandle>,
    ) -> Created {
        let registry = self.init_registry(StoreConfig::new().auto_destroy(options.auto_destroy));
        let signal = match owner {
            Some(owner) => registry.create_owned(name, initial, options, owner),
            None => registry.create(name, initial, options),
        };
        Created {
            state: signal.snapshot(),
            setter: signal.setter(),
            signal,
        }
    }

    /// Look up `name` without subscribing.
    pub fn get(&self, name: &str) -> Option<Signal> {
        self.init_registry(StoreConfig::new().auto_destroy(false))
            .signal(name)
    }

    /// Destroy every signal and drop the registry.
    pub fn destroy_registry(&self) {
        let registry = self.registry.borrow_mut().take();
        if let Some(registry) = registry {
            registry.destroy_all();
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("registry", &*self.registry.borrow())
            .finish()
    }
}
