//! Named getter/setter registry for experiment state.
//!
//! Registered once at setup, then used by the safe-mutation channel and
//! the variable tracker to reach fields by `target.attribute` name without
//! any runtime introspection.

use super::value::{StateValue, Value};
use crate::error::{Result, SchedulerError};
use std::collections::BTreeMap;
use std::fmt;

type Getter<E> = Box<dyn Fn(&E) -> Value + Send + Sync>;
type Setter<E> = Box<dyn Fn(&mut E, &Value) -> Result<()> + Send + Sync>;

/// `target.attribute` pair naming one accessor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessorKey {
    /// Entity the attribute belongs to (e.g. `"robot0"`).
    pub target: String,
    /// Attribute name (e.g. `"speed"`).
    pub attribute: String,
}

impl AccessorKey {
    /// Build a key.
    pub fn new(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for AccessorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

struct Accessor<E> {
    kind: &'static str,
    get: Getter<E>,
    set: Option<Setter<E>>,
}

/// Registry of typed accessors over an experiment of type `E`.
pub struct Accessors<E> {
    entries: BTreeMap<AccessorKey, Accessor<E>>,
}

impl<E> Accessors<E> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a readable and writable attribute.
    ///
    /// Re-registering a key replaces the previous accessor.
    pub fn register<T, G, S>(
        &mut self,
        target: impl Into<String>,
        attribute: impl Into<String>,
        get: G,
        set: S,
    ) -> &mut Self
    where
        T: StateValue + 'static,
        G: Fn(&E) -> T + Send + Sync + 'static,
        S: Fn(&mut E, T) + Send + Sync + 'static,
    {
        let key = AccessorKey::new(target, attribute);
        let name = key.to_string();
        let setter: Setter<E> = Box::new(move |experiment, value| {
            let typed = T::from_value(value).ok_or_else(|| SchedulerError::TypeMismatch {
                key: name.clone(),
                expected: T::KIND,
                found: value.kind(),
            })?;
            set(experiment, typed);
            Ok(())
        });

        self.entries.insert(
            key,
            Accessor {
                kind: T::KIND,
                get: Box::new(move |experiment| get(experiment).into_value()),
                set: Some(setter),
            },
        );
        self
    }

    /// Register an attribute that can be read and tracked but not set.
    pub fn register_read_only<T, G>(
        &mut self,
        target: impl Into<String>,
        attribute: impl Into<String>,
        get: G,
    ) -> &mut Self
    where
        T: StateValue + 'static,
        G: Fn(&E) -> T + Send + Sync + 'static,
    {
        self.entries.insert(
            AccessorKey::new(target, attribute),
            Accessor {
                kind: T::KIND,
                get: Box::new(move |experiment| get(experiment).into_value()),
                set: None,
            },
        );
        self
    }

    fn entry(&self, target: &str, attribute: &str) -> Result<&Accessor<E>> {
        self.entries
            .get(&AccessorKey::new(target, attribute))
            .ok_or_else(|| SchedulerError::unknown(target, attribute))
    }

    /// Whether `target.attribute` is registered.
    pub fn contains(&self, target: &str, attribute: &str) -> bool {
        self.entries.contains_key(&AccessorKey::new(target, attribute))
    }

    /// Kind name of a registered attribute.
    pub fn kind(&self, target: &str, attribute: &str) -> Result<&'static str> {
        self.entry(target, attribute).map(|a| a.kind)
    }

    /// Read an attribute.
    pub fn get(&self, experiment: &E, target: &str, attribute: &str) -> Result<Value> {
        self.entry(target, attribute).map(|a| (a.get)(experiment))
    }

    /// Read an attribute by key.
    pub(crate) fn get_key(&self, experiment: &E, key: &AccessorKey) -> Option<Value> {
        self.entries.get(key).map(|a| (a.get)(experiment))
    }

    /// Write an attribute.
    pub fn set(&self, experiment: &mut E, target: &str, attribute: &str, value: &Value) -> Result<()> {
        let accessor = self.entry(target, attribute)?;
        let set = accessor
            .set
            .as_ref()
            .ok_or_else(|| SchedulerError::ReadOnly(AccessorKey::new(target, attribute).to_string()))?;
        set(experiment, value)
    }

    /// Registered keys, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &AccessorKey> {
        self.entries.keys()
    }

    /// Number of registered accessors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> Default for Accessors<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Accessors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, a)| (k.to_string(), a.kind)))
            .finish()
    }
}
