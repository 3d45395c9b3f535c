//! Slices: named partitions of the root state with their reducer tables.
//!
//! A [`Slice`] owns one key of the root state, its initial value, and a
//! dispatch table from action type to reducer. The table is built explicitly
//! at construction time and rejects a second reducer for the same type.
//!
//! # Example
//!
//! ```ignore
//! use sluice::Slice;
//!
//! let counter = Slice::new("counter", 10i64)
//!     .on("Increment", |count, _| count + 1)
//!     .on("Add", |count, action| count + action.payload_as::<i64>().unwrap_or(0))
//!     .on("Reset", |_, _| 10);
//! ```
//!
//! # Purity
//!
//! Reducers receive the current value by reference and return a new one.
//! They must not dispatch, block or perform I/O. A reducer that panics is
//! caught and reported as [`StoreError::ReducerPanicked`]; the reduction is
//! aborted and no state changes.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::core::Action;
use crate::error::StoreError;
use crate::state::{SliceState, StateValue};

type Reducer<S> = Arc<dyn Fn(&S, &Action) -> anyhow::Result<S> + Send + Sync>;

/// One named partition of the root state.
pub struct Slice<S: SliceState> {
    key: String,
    initial: S,
    reducers: HashMap<String, Reducer<S>>,
}

impl<S: SliceState> Slice<S> {
    /// Create a slice with no reducers.
    pub fn new(key: impl Into<String>, initial: S) -> Self {
        Self {
            key: key.into(),
            initial,
            reducers: HashMap::new(),
        }
    }

    /// Register a total reducer for an action type.
    ///
    /// # Panics
    ///
    /// Panics if a reducer is already registered for `action_type`. Use
    /// [`Slice::try_on`] to handle that case.
    pub fn on<F>(self, action_type: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&S, &Action) -> S + Send + Sync + 'static,
    {
        self.try_on(action_type, reducer)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Register a total reducer, returning an error on duplicate registration.
    pub fn try_on<F>(self, action_type: impl Into<String>, reducer: F) -> Result<Self, StoreError>
    where
        F: Fn(&S, &Action) -> S + Send + Sync + 'static,
    {
        self.try_on_result(action_type, move |state, action| Ok(reducer(state, action)))
    }

    /// Register a fallible reducer.
    ///
    /// An `Err` aborts the whole reduction and surfaces at the dispatch call
    /// site as [`StoreError::ReducerFailed`].
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration.
    pub fn on_result<F>(self, action_type: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&S, &Action) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        self.try_on_result(action_type, reducer)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Register a fallible reducer, returning an error on duplicate registration.
    pub fn try_on_result<F>(
        mut self,
        action_type: impl Into<String>,
        reducer: F,
    ) -> Result<Self, StoreError>
    where
        F: Fn(&S, &Action) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let action_type = action_type.into();
        if self.reducers.contains_key(&action_type) {
            return Err(StoreError::DuplicateReducer {
                slice: self.key,
                action_type,
            });
        }
        self.reducers.insert(action_type, Arc::new(reducer));
        Ok(self)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn initial(&self) -> &S {
        &self.initial
    }

    /// Returns true if a reducer is registered for `action_type`.
    pub fn handles(&self, action_type: &str) -> bool {
        self.reducers.contains_key(action_type)
    }

    /// Registered action types, unordered.
    pub fn action_types(&self) -> impl Iterator<Item = &str> {
        self.reducers.keys().map(String::as_str)
    }

    /// Apply the matching reducer, if any.
    ///
    /// Returns `None` when this slice has no reducer for the action's type,
    /// meaning the current value carries over unchanged.
    pub fn reduce(&self, state: &S, action: &Action) -> Option<Result<S, StoreError>> {
        let reducer = self.reducers.get(action.action_type())?;

        // AssertUnwindSafe: the reducer only sees shared references and its
        // output is discarded on panic.
        let result = catch_unwind(AssertUnwindSafe(|| reducer(state, action)));

        Some(match result {
            Ok(Ok(next)) => Ok(next),
            Ok(Err(e)) => Err(StoreError::reducer_failed(&self.key, action.action_type(), e)),
            Err(panic) => {
                let err = StoreError::reducer_panicked(&self.key, action.action_type(), panic);
                error!(slice = %self.key, error = %err, "reducer panicked");
                Err(err)
            }
        })
    }
}

impl<S: SliceState> fmt::Debug for Slice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut action_types: Vec<&str> = self.action_types().collect();
        action_types.sort_unstable();
        f.debug_struct("Slice")
            .field("key", &self.key)
            .field("initial", &self.initial)
            .field("action_types", &action_types)
            .finish()
    }
}

// =============================================================================
// Type-erased slice
// =============================================================================

/// Type-erased slice so the store can hold slices of different state types.
pub(crate) trait AnySlice: Send + Sync {
    fn key(&self) -> &str;

    fn initial_value(&self) -> StateValue;

    /// Reduce a type-erased value. `None` means no reducer matched.
    fn reduce_any(
        &self,
        state: &StateValue,
        action: &Action,
    ) -> Option<Result<StateValue, StoreError>>;

    /// Decode a hydration payload into a slice value.
    fn hydrate(&self, state: serde_json::Value) -> Result<StateValue, StoreError>;
}

impl<S: SliceState> AnySlice for Slice<S> {
    fn key(&self) -> &str {
        &self.key
    }

    fn initial_value(&self) -> StateValue {
        Arc::new(self.initial.clone())
    }

    fn reduce_any(
        &self,
        state: &StateValue,
        action: &Action,
    ) -> Option<Result<StateValue, StoreError>> {
        if !self.handles(action.action_type()) {
            return None;
        }
        // The store only ever stores values produced by this slice, so a
        // mismatch here means the registry was corrupted. Fall back to the
        // initial value rather than panic.
        let current = match state.as_any().downcast_ref::<S>() {
            Some(current) => current,
            None => {
                error!(slice = %self.key, "slice value has unexpected type, using initial");
                &self.initial
            }
        };
        self.reduce(current, action)
            .map(|result| result.map(|next| Arc::new(next) as StateValue))
    }

    fn hydrate(&self, state: serde_json::Value) -> Result<StateValue, StoreError> {
        let value: S = serde_json::from_value(state).map_err(|source| StoreError::HydrationFailed {
            slice: self.key.clone(),
            source,
        })?;
        Ok(Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    fn counter() -> Slice<i64> {
        Slice::new("counter", 10i64)
            .on("Increment", |count, _| count + 1)
            .on("Add", |count, action| {
                count + action.payload_as::<i64>().unwrap_or(0)
            })
    }

    #[test]
    fn test_reduce_matching_action() {
        let slice = counter();
        let next = slice.reduce(&10, &Action::new("Increment")).unwrap().unwrap();
        assert_eq!(next, 11);

        let add = Action::new("Add").with_payload(&5).unwrap();
        assert_eq!(slice.reduce(&10, &add).unwrap().unwrap(), 15);
    }

    #[test]
    fn test_reduce_unmatched_action_is_none() {
        let slice = counter();
        assert!(slice.reduce(&10, &Action::new("Decrement")).is_none());
        assert!(!slice.handles("Decrement"));
    }

    #[test]
    fn test_try_on_duplicate_reducer() {
        let result = Slice::new("counter", 0i64)
            .on("Increment", |c, _| c + 1)
            .try_on("Increment", |c, _| c + 2);

        match result {
            Err(StoreError::DuplicateReducer { slice, action_type }) => {
                assert_eq!(slice, "counter");
                assert_eq!(action_type, "Increment");
            }
            other => panic!("Expected DuplicateReducer, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    #[should_panic(expected = "already has a reducer")]
    fn test_on_duplicate_reducer_panics() {
        let _ = Slice::new("counter", 0i64)
            .on("Increment", |c, _| c + 1)
            .on("Increment", |c, _| c + 2);
    }

    #[test]
    fn test_fallible_reducer_error() {
        let slice = Slice::new("name", String::new()).on_result("Rename", |_, action| {
            let name: String = action.payload_as()?;
            anyhow::ensure!(!name.is_empty(), "name must not be empty");
            Ok(name)
        });

        let ok = Action::new("Rename").with_payload(&"ada").unwrap();
        assert_eq!(slice.reduce(&String::new(), &ok).unwrap().unwrap(), "ada");

        let bad = Action::new("Rename").with_payload(&"").unwrap();
        let err = slice.reduce(&String::new(), &bad).unwrap().unwrap_err();
        assert!(matches!(err, StoreError::ReducerFailed { .. }));
        assert!(err.to_string().contains("name must not be empty"));
    }

    #[test]
    fn test_panicking_reducer_is_caught() {
        let slice = Slice::new("counter", 0i64).on("Explode", |_, _| panic!("kaboom"));

        let err = slice.reduce(&0, &Action::new("Explode")).unwrap().unwrap_err();
        match err {
            StoreError::ReducerPanicked { slice, message, .. } => {
                assert_eq!(slice, "counter");
                assert_eq!(message, "kaboom");
            }
            other => panic!("Expected ReducerPanicked, got {other:?}"),
        }
    }

    #[test]
    fn test_reducer_does_not_mutate_input() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Todos {
            items: Vec<String>,
        }

        let slice = Slice::new("todos", Todos { items: vec![] }).on("Add", |todos, action| {
            let mut next = todos.clone();
            next.items.push(action.payload_as().unwrap_or_default());
            next
        });

        let before = Todos {
            items: vec!["a".into()],
        };
        let add = Action::new("Add").with_payload(&"b").unwrap();
        let after = slice.reduce(&before, &add).unwrap().unwrap();

        assert_eq!(before.items, vec!["a"]);
        assert_eq!(after.items, vec!["a", "b"]);
    }

    #[test]
    fn test_erased_reduce_and_hydrate() {
        let slice = counter();
        let erased: &dyn AnySlice = &slice;

        let initial = erased.initial_value();
        let next = erased
            .reduce_any(&initial, &Action::new("Increment"))
            .unwrap()
            .unwrap();
        assert_eq!(next.as_any().downcast_ref::<i64>(), Some(&11));

        let hydrated = erased.hydrate(serde_json::json!(99)).unwrap();
        assert_eq!(hydrated.as_any().downcast_ref::<i64>(), Some(&99));

        let err = erased.hydrate(serde_json::json!("nope")).err().unwrap();
        assert!(matches!(err, StoreError::HydrationFailed { .. }));
    }
}
