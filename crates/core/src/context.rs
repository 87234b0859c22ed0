//! A scratch space shared by the tools of one run.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A value stored in a [`RunContext`].
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Errors raised by [`RunContext`] lookups.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The key has never been set in this run.
    #[error("missing key `{key}` in run context (available: {available:?})")]
    MissingKey {
        /// The requested key.
        key: String,
        /// Keys present at the time of the lookup.
        available: Vec<String>,
    },
    /// The stored value has a different type than requested.
    #[error("value of `{key}` is a {actual}, but a {expected} was expected")]
    TypeMismatch {
        /// The requested key.
        key: String,
        /// The type requested by the caller.
        expected: &'static str,
        /// The type of the stored value.
        actual: &'static str,
    },
}

struct Entry {
    value: ContextValue,
    type_name: &'static str,
    source: String,
}

/// A typed key/value store shared by all tool invocations of one run.
///
/// The context is created when a run starts and dropped when it ends.
/// Cloning it is cheap and yields a handle to the same store, which is how
/// a batch of concurrently running tools shares it. Writes are last writer
/// wins per key.
///
/// The values themselves never reach the model. Only [`summary`] is
/// rendered into the conversation, so a tool can leave large or binary
/// data (embeddings, images, file handles) for a later tool without
/// bloating the prompt.
///
/// [`summary`]: RunContext::summary
#[derive(Clone, Default)]
pub struct RunContext {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl RunContext {
    /// Creates an empty context.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, recording the tool that produced it.
    /// Overwrites silently.
    pub fn set<K, T, S>(&self, key: K, value: T, source: S)
    where
        K: Into<String>,
        T: Any + Send + Sync,
        S: Into<String>,
    {
        let key = key.into();
        let source = source.into();
        trace!("context set: {key} (from {source:?})");
        self.write().insert(
            key,
            Entry {
                value: Arc::new(value),
                type_name: type_name::<T>(),
                source,
            },
        );
    }

    /// Returns the value stored under `key` as a `T`.
    pub fn get<T: Any + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Arc<T>, ContextError> {
        let entries = self.read();
        let Some(entry) = entries.get(key) else {
            return Err(ContextError::MissingKey {
                key: key.to_owned(),
                available: entries.keys().cloned().collect(),
            });
        };
        Arc::clone(&entry.value).downcast::<T>().map_err(|_| {
            ContextError::TypeMismatch {
                key: key.to_owned(),
                expected: type_name::<T>(),
                actual: entry.type_name,
            }
        })
    }

    /// Like [`get`](Self::get), but returns `default` if `key` is missing.
    ///
    /// A type mismatch is still an error.
    pub fn get_or<T: Any + Send + Sync>(
        &self,
        key: &str,
        default: T,
    ) -> Result<Arc<T>, ContextError> {
        match self.get(key) {
            Err(ContextError::MissingKey { .. }) => Ok(Arc::new(default)),
            other => other,
        }
    }

    /// Returns the value stored under `key` without checking its type.
    pub fn get_any(&self, key: &str) -> Result<ContextValue, ContextError> {
        let entries = self.read();
        match entries.get(key) {
            Some(entry) => Ok(Arc::clone(&entry.value)),
            None => Err(ContextError::MissingKey {
                key: key.to_owned(),
                available: entries.keys().cloned().collect(),
            }),
        }
    }

    /// Returns whether `key` is set.
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Returns all keys in order.
    #[inline]
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Returns the number of stored values.
    #[inline]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if nothing has been stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Removes all values.
    #[inline]
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Describes every stored value by its type and producing tool,
    /// without disclosing the value.
    pub fn summary(&self) -> BTreeMap<String, String> {
        self.read()
            .iter()
            .map(|(key, entry)| {
                let mut desc =
                    format!("type={}", short_type_name(entry.type_name));
                if !entry.source.is_empty() {
                    desc.push_str(", source=");
                    desc.push_str(&entry.source);
                }
                (key.clone(), desc)
            })
            .collect()
    }

    /// Renders [`summary`](Self::summary) as a single line suitable for
    /// appending to a tool result.
    pub fn summary_line(&self) -> String {
        let items: Vec<_> = self
            .summary()
            .into_iter()
            .map(|(key, desc)| format!("{key} ({desc})"))
            .collect();
        format!("[Run context: {}]", items.join("; "))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Strips module paths, e.g. `alloc::vec::Vec<f32>` becomes `Vec<f32>`.
fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment_start = 0;
    for (idx, ch) in full.char_indices() {
        if ch.is_alphanumeric() || ch == '_' || ch == ':' {
            continue;
        }
        push_last_segment(&mut out, &full[segment_start..idx]);
        out.push(ch);
        segment_start = idx + ch.len_utf8();
    }
    push_last_segment(&mut out, &full[segment_start..]);
    out
}

#[inline]
fn push_last_segment(out: &mut String, path: &str) {
    out.push_str(path.rsplit("::").next().unwrap_or(path));
}
