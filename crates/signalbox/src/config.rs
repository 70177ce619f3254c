#![forbid(unsafe_code)]

//! Store configuration.
//!
//! [`StoreConfig`] is read once, when the registry is first built. It seeds
//! the `global` signal and decides whether that signal follows its owner's
//! lifecycle.
//!
//! With the `config-file` feature, configs can also be loaded from TOML or
//! JSON:
//!
//! ```toml
//! auto_destroy = false
//!
//! [initial_global_state]
//! theme = "dark"
//! ```

use std::fmt;

use serde_json::{Map, Value};

/// Initial state for a signal: a value, or a factory run once at creation.
pub enum InitialState {
    Value(Value),
    Factory(Box<dyn FnOnce() -> Value>),
}

impl InitialState {
    /// An empty object.
    #[must_use]
    pub fn empty() -> Self {
        Self::Value(Value::Object(Map::new()))
    }

    /// Defer building the state until the signal is created.
    pub fn factory(f: impl FnOnce() -> Value + 'static) -> Self {
        Self::Factory(Box::new(f))
    }

    /// Resolve to a value. A factory returning a falsy value (`null`,
    /// `false`, zero, or `""`) yields an empty object.
    pub(crate) fn into_value(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Factory(f) => match f() {
                value if is_falsy(&value) => Value::Object(Map::new()),
                value => value,
            },
        }
    }

    /// The seed value, unless it is built lazily.
    pub(crate) fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Factory(_) => None,
        }
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

impl Default for InitialState {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for InitialState {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Map<String, Value>> for InitialState {
    fn from(map: Map<String, Value>) -> Self {
        Self::Value(Value::Object(map))
    }
}

impl fmt::Debug for InitialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// Registry configuration.
#[derive(Debug)]
pub struct StoreConfig {
    /// Seed for the `global` signal.
    pub initial_global_state: InitialState,
    /// Whether `global` is destroyed when its owner detaches.
    pub auto_destroy: bool,
}

impl StoreConfig {
    /// Default config: empty global state, auto-destroy on.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn initial_global_state(mut self, state: impl Into<InitialState>) -> Self {
        self.initial_global_state = state.into();
        self
    }

    #[must_use]
    pub fn auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_global_state: InitialState::default(),
            auto_destroy: true,
        }
    }
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

/// Error loading a [`StoreConfig`] from a file.
#[cfg(feature = "config-file")]
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(std::io::Error),
    /// The file was read but did not parse.
    Parse {
        format: &'static str,
        message: String,
    },
    /// The extension is neither `.toml` nor `.json`.
    UnsupportedFormat(std::path::PathBuf),
}

#[cfg(feature = "config-file")]
impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Parse { format, message } => write!(f, "invalid {format} config: {message}"),
            Self::UnsupportedFormat(path) => {
                write!(f, "unsupported config format: {}", path.display())
            }
        }
    }
}

#[cfg(feature = "config-file")]
impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(feature = "config-file")]
impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(feature = "config-file")]
#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_auto_destroy")]
    auto_destroy: bool,
    #[serde(default)]
    initial_global_state: Option<Value>,
}

#[cfg(feature = "config-file")]
fn default_auto_destroy() -> bool {
    true
}

#[cfg(feature = "config-file")]
impl From<ConfigFile> for StoreConfig {
    fn from(file: ConfigFile) -> Self {
        Self {
            initial_global_state: file
                .initial_global_state
                .map_or_else(InitialState::empty, InitialState::Value),
            auto_destroy: file.auto_destroy,
        }
    }
}

#[cfg(feature = "config-file")]
impl StoreConfig {
    /// Parse a TOML config.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed input or unknown keys.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str::<ConfigFile>(source)
            .map(Self::from)
            .map_err(|err| ConfigError::Parse {
                format: "toml",
                message: err.to_string(),
            })
    }

    /// Parse a JSON config.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed input or unknown keys.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<ConfigFile>(source)
            .map(Self::from)
            .map_err(|err| ConfigError::Parse {
                format: "json",
                message: err.to_string(),
            })
    }

    /// Load a config file, picking the format from its extension.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::UnsupportedFormat`] for unknown extensions, and
    /// [`ConfigError::Parse`] for malformed contents.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = path.extension().and_then(|ext| ext.to_str());
        if !matches!(format, Some("toml" | "json")) {
            return Err(ConfigError::UnsupportedFormat(path.to_path_buf()));
        }
        let source = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loading store config");
        match format {
            Some("toml") => Self::from_toml_str(&source),
            _ => Self::from_json_str(&source),
        }
    }
}
