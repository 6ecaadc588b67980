//! Shared application state container.
//!
//! A type-safe, thread-safe type map for resources shared across all
//! connections: configuration, database pools, caches, the connection
//! registry itself. Each type is stored separately and retrieved by its
//! exact type.
//!
//! # Examples
//!
//! ```
//! use plexus_core::state::AppState;
//! use std::sync::Arc;
//!
//! struct Config {
//!     motd: String,
//! }
//!
//! let state = AppState::new();
//! state.insert(Arc::new(Config { motd: "hello".into() }));
//!
//! let config = state.get::<Config>().unwrap();
//! assert_eq!(config.motd, "hello");
//! ```

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

/// Type-map of shared application state.
///
/// Cheaply cloneable; all clones share the same underlying map.
#[derive(Clone)]
pub struct AppState {
    map: Arc<DashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl AppState {
    /// Creates an empty state container.
    pub fn new() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }

    /// Stores a value, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.map.insert(TypeId::of::<T>(), value);
    }

    /// Retrieves the stored value of type `T`, if any.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Returns `true` if a value of type `T` is stored.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    /// Removes and returns the stored value of type `T`, if any.
    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|(_, value)| value.downcast::<T>().ok())
    }

    /// Number of distinct state types stored.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if no state is stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let state = AppState::new();
        state.insert(Arc::new(42u32));
        assert_eq!(*state.get::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_missing_type() {
        let state = AppState::new();
        assert!(state.get::<String>().is_none());
        assert!(!state.contains::<String>());
    }

    #[test]
    fn test_distinct_types() {
        let state = AppState::new();
        state.insert(Arc::new(1u32));
        state.insert(Arc::new("hello".to_string()));
        assert_eq!(state.len(), 2);
        assert_eq!(*state.get::<u32>().unwrap(), 1);
        assert_eq!(*state.get::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_remove() {
        let state = AppState::new();
        state.insert(Arc::new(5i64));
        assert_eq!(*state.remove::<i64>().unwrap(), 5);
        assert!(state.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let state = AppState::new();
        let clone = state.clone();
        state.insert(Arc::new(7u8));
        assert_eq!(*clone.get::<u8>().unwrap(), 7);
    }
}
