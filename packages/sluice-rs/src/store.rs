//! The store: slice registry, reduction and state publication.
//!
//! The store owns the only shared mutable resources in the system: the slice
//! registry and the current [`RootState`] reference. Both live behind one
//! lock, so every reduction observes a consistent registry and produces the
//! next root state atomically.
//!
//! # Reduction
//!
//! For each registered slice, in registration order:
//!
//! - a matching reducer computes the slice's next value
//! - no matching reducer carries the current value over (same `Arc`)
//! - any reducer error aborts the whole reduction, nothing is published
//!
//! The pipeline splits this into [`Store::prepare`] and [`Store::commit`] so
//! the after-reduce chain runs before anything becomes observable.
//!
//! A [`HYDRATE`](crate::HYDRATE) action bypasses reducers and replaces one
//! slice's value wholesale.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::new();
//! store.add_slice(Slice::new("counter", 0i64).on("Increment", |c, _| c + 1))?;
//!
//! let next = store.reduce(&ActionContext::new(Action::new("Increment")))?;
//! assert_eq!(next.get::<i64>("counter"), Some(&1));
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::core::{ActionContext, Hydrate, HYDRATE};
use crate::error::StoreError;
use crate::slice::{AnySlice, Slice};
use crate::state::{RootState, SliceState, StateSubscription, StateValue};

/// A slice of any state type, ready for bulk registration.
///
/// Built with `.into()` from any [`Slice`].
pub struct BoxedSlice(Arc<dyn AnySlice>);

impl BoxedSlice {
    pub fn key(&self) -> &str {
        self.0.key()
    }
}

impl<S: SliceState> From<Slice<S>> for BoxedSlice {
    fn from(slice: Slice<S>) -> Self {
        Self(Arc::new(slice))
    }
}

impl fmt::Debug for BoxedSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoxedSlice").field(&self.key()).finish()
    }
}

/// A computed but not yet committed root state.
pub(crate) struct Reduction {
    base: RootState,
    next: RootState,
}

impl Reduction {
    /// The root state this reduction will commit.
    pub(crate) fn next(&self) -> &RootState {
        &self.next
    }
}

struct Registry {
    slices: Vec<Arc<dyn AnySlice>>,
    root: RootState,
}

/// Slice registry plus the current root state.
pub struct Store {
    registry: Mutex<Registry>,
    sender: watch::Sender<RootState>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(RootState::default());
        Self {
            registry: Mutex::new(Registry {
                slices: Vec::new(),
                root: RootState::default(),
            }),
            sender,
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            warn!("store registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register one slice.
    ///
    /// The slice appears in the root state with its initial value, and the
    /// new root state is published. Fails if the key is already taken.
    pub fn add_slice<S: SliceState>(&self, slice: Slice<S>) -> Result<(), StoreError> {
        self.add_slices([BoxedSlice::from(slice)])
    }

    /// Register several slices at once.
    ///
    /// All-or-nothing: a key collision with an existing slice, or between two
    /// of the given slices, registers none of them.
    pub fn add_slices(
        &self,
        slices: impl IntoIterator<Item = BoxedSlice>,
    ) -> Result<(), StoreError> {
        let slices: Vec<Arc<dyn AnySlice>> = slices.into_iter().map(|s| s.0).collect();
        let mut registry = self.lock_registry();

        let mut seen: HashSet<&str> = registry.slices.iter().map(|s| s.key()).collect();
        for slice in &slices {
            if !seen.insert(slice.key()) {
                return Err(StoreError::DuplicateSlice {
                    key: slice.key().to_string(),
                });
            }
        }

        let mut next: BTreeMap<String, StateValue> = registry
            .root
            .entries()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for slice in &slices {
            debug!(slice = %slice.key(), "slice registered");
            next.insert(slice.key().to_string(), slice.initial_value());
        }

        registry.slices.extend(slices);
        registry.root = RootState::from_map(next);
        self.sender.send_replace(registry.root.clone());
        Ok(())
    }

    /// Keys of registered slices, in registration order.
    pub fn slice_keys(&self) -> Vec<String> {
        self.lock_registry()
            .slices
            .iter()
            .map(|s| s.key().to_string())
            .collect()
    }

    /// The current root state.
    pub fn state(&self) -> RootState {
        self.lock_registry().root.clone()
    }

    /// Observe the root state.
    pub fn subscribe(&self) -> StateSubscription {
        StateSubscription::new(self.sender.subscribe())
    }

    /// Reduce one action against every slice and publish the result.
    ///
    /// Exactly one root state is published per successful call. When no
    /// slice changes, the published value is the previous root state itself.
    /// On error nothing is published and the current state is untouched.
    pub fn reduce(&self, ctx: &ActionContext) -> Result<RootState, StoreError> {
        let reduction = self.prepare(ctx)?;
        Ok(self.commit(reduction))
    }

    /// Compute the next root state without committing or publishing it.
    pub(crate) fn prepare(&self, ctx: &ActionContext) -> Result<Reduction, StoreError> {
        let registry = self.lock_registry();

        let next = if ctx.action.is(HYDRATE) {
            Self::hydrate(&registry, ctx)?
        } else {
            Self::apply_reducers(&registry, ctx)?
        };

        Ok(Reduction {
            base: registry.root.clone(),
            next,
        })
    }

    /// Make a prepared reduction current and publish it to subscribers.
    ///
    /// Slices registered since [`Store::prepare`] are kept: only the values
    /// the reduction replaced are applied on top of the current root.
    pub(crate) fn commit(&self, reduction: Reduction) -> RootState {
        let mut registry = self.lock_registry();
        let Reduction { base, next } = reduction;

        let committed = if registry.root.same_as(&base) {
            next
        } else if next.same_as(&base) {
            registry.root.clone()
        } else {
            let mut merged: BTreeMap<String, StateValue> = registry
                .root
                .entries()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            for (key, value) in next.entries() {
                let unchanged = base.raw(key).is_some_and(|old| Arc::ptr_eq(old, value));
                if !unchanged {
                    merged.insert(key.clone(), value.clone());
                }
            }
            RootState::from_map(merged)
        };

        registry.root = committed.clone();
        // Published under the lock so observers see states in commit order.
        self.sender.send_replace(committed.clone());
        committed
    }

    fn apply_reducers(registry: &Registry, ctx: &ActionContext) -> Result<RootState, StoreError> {
        let mut changed: Vec<(String, StateValue)> = Vec::new();

        for slice in &registry.slices {
            let fallback;
            let current = match registry.root.raw(slice.key()) {
                Some(current) => current,
                None => {
                    fallback = slice.initial_value();
                    &fallback
                }
            };
            if let Some(result) = slice.reduce_any(current, &ctx.action) {
                trace!(cid = %ctx.cid, slice = %slice.key(), action_type = %ctx.action_type(), "reduced");
                changed.push((slice.key().to_string(), result?));
            }
        }

        if changed.is_empty() {
            return Ok(registry.root.clone());
        }

        let mut next: BTreeMap<String, StateValue> = registry
            .root
            .entries()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        next.extend(changed);
        Ok(RootState::from_map(next))
    }

    fn hydrate(registry: &Registry, ctx: &ActionContext) -> Result<RootState, StoreError> {
        let request: Hydrate = ctx.action.payload_as()?;

        let Some(slice) = registry
            .slices
            .iter()
            .find(|s| s.key() == request.slice_key)
        else {
            debug!(cid = %ctx.cid, slice = %request.slice_key, "hydrate for unknown slice ignored");
            return Ok(registry.root.clone());
        };

        let value = slice.hydrate(request.state)?;
        debug!(cid = %ctx.cid, slice = %request.slice_key, "slice hydrated");

        let mut next: BTreeMap<String, StateValue> = registry
            .root
            .entries()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        next.insert(request.slice_key, value);
        Ok(RootState::from_map(next))
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("slices", &self.slice_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Action;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Todos {
        items: Vec<String>,
    }

    fn counter() -> Slice<i64> {
        Slice::new("counter", 10i64)
            .on("Increment", |count, _| count + 1)
            .on("Reset", |_, _| 10)
    }

    fn todos() -> Slice<Todos> {
        Slice::new("todos", Todos { items: vec![] }).on("todos/add", |todos, action| {
            let mut next = todos.clone();
            next.items.push(action.payload_as().unwrap_or_default());
            next
        })
    }

    fn ctx(action_type: &str) -> ActionContext {
        ActionContext::new(Action::new(action_type))
    }

    #[test]
    fn test_add_slice_publishes_initial_value() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();

        assert_eq!(store.state().get::<i64>("counter"), Some(&10));
        assert_eq!(store.subscribe().current().get::<i64>("counter"), Some(&10));
    }

    #[test]
    fn test_duplicate_slice_key_is_error() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();

        let err = store.add_slice(Slice::new("counter", 0i64)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSlice { key } if key == "counter"));
        assert_eq!(store.slice_keys(), vec!["counter"]);
    }

    #[test]
    fn test_add_slices_is_all_or_nothing() {
        let store = Store::new();
        let err = store
            .add_slices([
                counter().into(),
                todos().into(),
                Slice::new("todos", 0u8).into(),
            ])
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateSlice { .. }));
        assert!(store.state().is_empty());
        assert!(store.slice_keys().is_empty());
    }

    #[test]
    fn test_root_state_keys_match_registry() {
        let store = Store::new();
        store.add_slices([counter().into(), todos().into()]).unwrap();
        store.reduce(&ctx("Increment")).unwrap();

        let mut keys = store.slice_keys();
        keys.sort();
        assert_eq!(store.state().keys().collect::<Vec<_>>(), keys);
    }

    #[test]
    fn test_reduce_only_touches_matching_slices() {
        let store = Store::new();
        store.add_slices([counter().into(), todos().into()]).unwrap();
        let before = store.state();

        let after = store.reduce(&ctx("Increment")).unwrap();

        assert_eq!(after.get::<i64>("counter"), Some(&11));
        assert!(after.shares_slice(&before, "todos"));
        assert!(!after.shares_slice(&before, "counter"));
    }

    #[test]
    fn test_unknown_action_leaves_state_identical() {
        let store = Store::new();
        store.add_slices([counter().into(), todos().into()]).unwrap();
        let before = store.state();

        let after = store.reduce(&ctx("NoOp")).unwrap();

        assert!(after.same_as(&before));
        assert!(store.state().same_as(&before));
    }

    #[test]
    fn test_reducer_error_aborts_without_publishing() {
        let store = Store::new();
        store
            .add_slices([
                counter().on_result("Fail", |_, _| anyhow::bail!("rejected")).into(),
                todos().into(),
            ])
            .unwrap();
        let before = store.state();

        let err = store.reduce(&ctx("Fail")).unwrap_err();
        assert!(matches!(err, StoreError::ReducerFailed { .. }));
        assert!(store.state().same_as(&before));
    }

    #[test]
    fn test_error_in_one_slice_discards_others() {
        let store = Store::new();
        store
            .add_slices([
                counter().into(),
                Slice::new("guard", ())
                    .on_result("Increment", |_, _| anyhow::bail!("not allowed"))
                    .into(),
            ])
            .unwrap();

        assert!(store.reduce(&ctx("Increment")).is_err());
        assert_eq!(store.state().get::<i64>("counter"), Some(&10));
    }

    #[test]
    fn test_hydrate_replaces_slice_value() {
        let store = Store::new();
        store.add_slices([counter().into(), todos().into()]).unwrap();
        let before = store.state();

        let action = Hydrate::new("todos", json!({ "items": ["restored"] })).into_action();
        let after = store.reduce(&ActionContext::new(action)).unwrap();

        assert_eq!(
            after.get::<Todos>("todos").unwrap().items,
            vec!["restored".to_string()]
        );
        assert!(after.shares_slice(&before, "counter"));
    }

    #[test]
    fn test_hydrate_unknown_slice_is_ignored() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();
        let before = store.state();

        let action = Hydrate::new("missing", json!(1)).into_action();
        let after = store.reduce(&ActionContext::new(action)).unwrap();
        assert!(after.same_as(&before));
    }

    #[test]
    fn test_hydrate_bad_state_is_error() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();

        let action = Hydrate::new("counter", json!("ten")).into_action();
        let err = store.reduce(&ActionContext::new(action)).unwrap_err();
        assert!(matches!(err, StoreError::HydrationFailed { .. }));
        assert_eq!(store.state().get::<i64>("counter"), Some(&10));
    }

    #[test]
    fn test_hydrate_malformed_payload_is_invalid_payload() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();

        let action = Action::new(HYDRATE).with_payload_value(json!(42));
        let err = store.reduce(&ActionContext::new(action)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload { .. }));
    }

    #[test]
    fn test_slice_added_after_reductions() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();
        store.reduce(&ctx("Increment")).unwrap();

        store.add_slice(todos()).unwrap();
        let state = store.state();
        assert_eq!(state.get::<i64>("counter"), Some(&11));
        assert!(state.get::<Todos>("todos").unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_each_reduction() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();
        let mut sub = store.subscribe();

        store.reduce(&ctx("Increment")).unwrap();
        let seen = sub.changed().await.unwrap();
        assert_eq!(seen.get::<i64>("counter"), Some(&11));
    }

    #[tokio::test]
    async fn test_prepared_state_is_not_observable_until_commit() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();
        let sub = store.subscribe();

        let reduction = store.prepare(&ctx("Increment")).unwrap();
        assert_eq!(reduction.next().get::<i64>("counter"), Some(&11));
        assert_eq!(store.state().get::<i64>("counter"), Some(&10));
        assert_eq!(sub.current().get::<i64>("counter"), Some(&10));

        drop(reduction);
        assert_eq!(store.state().get::<i64>("counter"), Some(&10));

        let reduction = store.prepare(&ctx("Increment")).unwrap();
        store.commit(reduction);
        assert_eq!(sub.current().get::<i64>("counter"), Some(&11));
    }

    #[test]
    fn test_commit_keeps_slice_added_after_prepare() {
        let store = Store::new();
        store.add_slice(counter()).unwrap();

        let reduction = store.prepare(&ctx("Increment")).unwrap();
        store.add_slice(todos()).unwrap();
        let committed = store.commit(reduction);

        assert_eq!(committed.get::<i64>("counter"), Some(&11));
        assert!(committed.get::<Todos>("todos").is_some());
        assert!(store.state().same_as(&committed));
    }
}
