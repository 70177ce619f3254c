#![forbid(unsafe_code)]

//! Dotted-path addressing over nested JSON state.
//!
//! A [`Path`] is a dotted key string (`"user.address.city"`, `"list.3"`)
//! split into segments once, up front. Reads walk the segments and fail soft;
//! writes walk all but the last segment and assign in place.
//!
//! # Invariants
//!
//! 1. **Reads never fail**: [`get`] returns `None` and [`read`] returns the
//!    fallback for any missing or non-indexable step.
//! 2. **Writes resolve before they assign**: [`write`] locates the parent
//!    container first, so a failed write leaves the root untouched.
//! 3. **No implicit containers**: a write never creates missing intermediate
//!    objects or arrays.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Empty path | `""` passed to [`Path::parse`] | `PathWriteError::EmptyPath` |
//! | Missing intermediate | `a.b.c` with no `a.b` | `PathWriteError::MissingSegment` |
//! | Primitive intermediate | `a.b` with `a == 1` | `PathWriteError::NotIndexable` |
//! | Non-numeric array segment | `list.x` with `list` an array | `PathWriteError::InvalidIndex` |
//! | Array index past end | `list.9` with 3 items | `PathWriteError::IndexOutOfBounds` |
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use signalbox_path::{Path, get, write};
//!
//! let mut state = json!({ "user": { "name": "Ada" } });
//! let path = Path::parse("user.name").unwrap();
//!
//! assert_eq!(get(&state, &path), Some(&json!("Ada")));
//! write(&mut state, &path, json!("Grace")).unwrap();
//! assert_eq!(state["user"]["name"], "Grace");
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

/// Segment separator inside a path string.
pub const SEPARATOR: char = '.';

// ---------------------------------------------------------------------------
// Path
// ---------------------------------------------------------------------------

/// A parsed, non-empty dotted path.
///
/// Cloning is cheap: the raw string and segment list are shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Path {
    raw: Arc<str>,
    segments: Arc<[String]>,
}

impl Path {
    /// Parse a dotted path string.
    ///
    /// Segments are taken verbatim, so `"a..b"` has an empty middle key.
    ///
    /// # Errors
    ///
    /// [`PathWriteError::EmptyPath`] if `raw` is empty.
    pub fn parse(raw: &str) -> Result<Self, PathWriteError> {
        if raw.is_empty() {
            return Err(PathWriteError::EmptyPath);
        }
        Ok(Self {
            raw: Arc::from(raw),
            segments: raw.split(SEPARATOR).map(str::to_owned).collect(),
        })
    }

    /// The path as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The individual keys, outermost first.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The top-level key this path descends from.
    #[must_use]
    pub fn root(&self) -> &str {
        // parse() guarantees at least one segment
        self.segments.first().map_or("", String::as_str)
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl FromStr for Path {
    type Err = PathWriteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Path").field(&&*self.raw).finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Coarse JSON type, used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// Classify a value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// A write path could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathWriteError {
    /// The path string was empty.
    EmptyPath,
    /// An intermediate key does not exist.
    MissingSegment { path: String, segment: String },
    /// An intermediate (or the final parent) is a primitive or null.
    NotIndexable {
        path: String,
        segment: String,
        found: ValueKind,
    },
    /// A segment addressing an array is not a decimal index.
    InvalidIndex { path: String, segment: String },
    /// An array index lies past the end of the array.
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },
}

impl fmt::Display for PathWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPath => write!(f, "cannot write to an empty path"),
            Self::MissingSegment { path, segment } => {
                write!(f, "missing key '{segment}' while writing '{path}'")
            }
            Self::NotIndexable {
                path,
                segment,
                found,
            } => write!(
                f,
                "cannot index {found} with '{segment}' while writing '{path}'"
            ),
            Self::InvalidIndex { path, segment } => {
                write!(f, "'{segment}' is not an array index in '{path}'")
            }
            Self::IndexOutOfBounds { path, index, len } => write!(
                f,
                "index {index} is out of bounds (len {len}) in '{path}'"
            ),
        }
    }
}

impl std::error::Error for PathWriteError {}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

/// Resolve `path` inside `root`.
///
/// Objects are indexed by key and arrays by decimal index. Anything else
/// along the way yields `None`.
#[must_use]
pub fn get<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |current, segment| step(current, segment))
}

/// Resolve an optional path with a fallback.
///
/// `None` addresses the root itself.
#[must_use]
pub fn read<'a>(root: &'a Value, path: Option<&Path>, fallback: &'a Value) -> &'a Value {
    match path {
        None => root,
        Some(path) => get(root, path).unwrap_or(fallback),
    }
}

/// Assign `value` at `path`, mutating `root` in place.
///
/// Returns the value previously stored at that location, if any. Writing
/// index `len` of an array appends.
///
/// # Errors
///
/// Any [`PathWriteError`] other than `EmptyPath` (which [`Path`] rules out).
/// On error `root` is unchanged.
pub fn write(root: &mut Value, path: &Path, value: Value) -> Result<Option<Value>, PathWriteError> {
    let Some((last, parents)) = path.segments().split_last() else {
        return Err(PathWriteError::EmptyPath);
    };

    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(map) => {
                map.get_mut(segment)
                    .ok_or_else(|| PathWriteError::MissingSegment {
                        path: path.to_string(),
                        segment: segment.clone(),
                    })?
            }
            Value::Array(items) => {
                let index = parse_index(path, segment)?;
                let len = items.len();
                items
                    .get_mut(index)
                    .ok_or_else(|| PathWriteError::IndexOutOfBounds {
                        path: path.to_string(),
                        index,
                        len,
                    })?
            }
            other => {
                return Err(PathWriteError::NotIndexable {
                    path: path.to_string(),
                    segment: segment.clone(),
                    found: ValueKind::of(other),
                });
            }
        };
    }

    assign(current, path, last, value)
}

fn step<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn assign(
    target: &mut Value,
    path: &Path,
    segment: &str,
    value: Value,
) -> Result<Option<Value>, PathWriteError> {
    match target {
        Value::Object(map) => Ok(map.insert(segment.to_owned(), value)),
        Value::Array(items) => {
            let index = parse_index(path, segment)?;
            match index.cmp(&items.len()) {
                Ordering::Less => Ok(Some(std::mem::replace(&mut items[index], value))),
                Ordering::Equal => {
                    items.push(value);
                    Ok(None)
                }
                Ordering::Greater => Err(PathWriteError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                    len: items.len(),
                }),
            }
        }
        other => Err(PathWriteError::NotIndexable {
            path: path.to_string(),
            segment: segment.to_owned(),
            found: ValueKind::of(other),
        }),
    }
}

fn parse_index(path: &Path, segment: &str) -> Result<usize, PathWriteError> {
    segment
        .parse::<usize>()
        .map_err(|_| PathWriteError::InvalidIndex {
            path: path.to_string(),
            segment: segment.to_owned(),
        })
}
