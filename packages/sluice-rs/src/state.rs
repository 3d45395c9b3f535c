//! The immutable root state tree and its observation handle.
//!
//! [`RootState`] maps each registered slice key to that slice's current
//! value. Values are stored type-erased behind `Arc`, so producing the next
//! root state clones pointers, not data: slices untouched by an action are
//! shared with the previous snapshot.
//!
//! # Example
//!
//! ```ignore
//! let state = handle.state();
//! let count: &i64 = state.get("counter").unwrap();
//! let snapshot = state.to_json()?; // hand to a persistence collaborator
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::Serialize;
use tokio::sync::watch;

/// Bound for values that can live in a slice.
///
/// Automatically implemented for every cloneable, serializable, thread-safe
/// type. Serialization powers snapshots and hydration.
pub trait SliceState:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> SliceState for T where
    T: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Type-erased slice value.
pub(crate) trait ErasedState: Any + Send + Sync + fmt::Debug + erased_serde::Serialize {
    fn as_any(&self) -> &dyn Any;
}

impl<T: SliceState> ErasedState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Serialize for dyn ErasedState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        erased_serde::serialize(self, serializer)
    }
}

/// Shared, immutable slice value.
pub(crate) type StateValue = Arc<dyn ErasedState>;

/// Immutable snapshot of every slice's current value.
///
/// Cloning is cheap. Two snapshots can be compared for identity with
/// [`RootState::same_as`], which is how observers detect that a dispatch left
/// the tree unchanged.
#[derive(Clone, Default)]
pub struct RootState {
    slices: Arc<BTreeMap<String, StateValue>>,
}

impl RootState {
    pub(crate) fn from_map(slices: BTreeMap<String, StateValue>) -> Self {
        Self {
            slices: Arc::new(slices),
        }
    }

    pub(crate) fn raw(&self, key: &str) -> Option<&StateValue> {
        self.slices.get(key)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.slices.iter()
    }

    /// Typed access to a slice's value.
    ///
    /// Returns `None` if the key is unknown or `S` is not the slice's type.
    pub fn get<S: SliceState>(&self, key: &str) -> Option<&S> {
        self.slices.get(key)?.as_any().downcast_ref::<S>()
    }

    /// Returns true if a slice with this key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.slices.contains_key(key)
    }

    /// Slice keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Returns true if both snapshots are the same allocation.
    pub fn same_as(&self, other: &RootState) -> bool {
        Arc::ptr_eq(&self.slices, &other.slices)
    }

    /// Returns true if both snapshots hold the very same value for `key`.
    pub fn shares_slice(&self, other: &RootState, key: &str) -> bool {
        match (self.slices.get(key), other.slices.get(key)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Serialize the whole tree to a JSON object keyed by slice.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl Serialize for RootState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.slices.len()))?;
        for (key, value) in self.slices.iter() {
            map.serialize_entry(key, value.as_ref())?;
        }
        map.end()
    }
}

impl fmt::Debug for RootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.slices.iter()).finish()
    }
}

/// Observation handle over the store's root state.
///
/// Holds the latest value and wakes on every publish. Values published in
/// quick succession may be coalesced; observers always see the newest one.
#[derive(Clone)]
pub struct StateSubscription {
    receiver: watch::Receiver<RootState>,
}

impl StateSubscription {
    pub(crate) fn new(receiver: watch::Receiver<RootState>) -> Self {
        Self { receiver }
    }

    /// The most recently published root state.
    pub fn current(&self) -> RootState {
        self.receiver.borrow().clone()
    }

    /// Wait for the next publish.
    ///
    /// Returns `None` once the store has been dropped.
    pub async fn changed(&mut self) -> Option<RootState> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Stream yielding the current root state and then every publish.
    pub fn into_stream(self) -> BoxStream<'static, RootState> {
        let mut receiver = self.receiver;
        let first = receiver.borrow_and_update().clone();
        let rest = stream::unfold(receiver, |mut receiver| async move {
            receiver.changed().await.ok()?;
            let state = receiver.borrow_and_update().clone();
            Some((state, receiver))
        });
        stream::once(async move { first }).chain(rest).boxed()
    }
}

impl fmt::Debug for StateSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSubscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Todos {
        items: Vec<String>,
    }

    fn sample() -> RootState {
        let mut map: BTreeMap<String, StateValue> = BTreeMap::new();
        map.insert("counter".into(), Arc::new(10i64));
        map.insert(
            "todos".into(),
            Arc::new(Todos {
                items: vec!["ship".into()],
            }),
        );
        RootState::from_map(map)
    }

    #[test]
    fn test_typed_get() {
        let state = sample();
        assert_eq!(state.get::<i64>("counter"), Some(&10));
        assert_eq!(
            state.get::<Todos>("todos").map(|t| t.items.len()),
            Some(1)
        );
    }

    #[test]
    fn test_get_wrong_type_is_none() {
        let state = sample();
        assert!(state.get::<String>("counter").is_none());
        assert!(state.get::<i64>("missing").is_none());
    }

    #[test]
    fn test_keys_sorted() {
        let state = sample();
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["counter", "todos"]);
        assert_eq!(state.len(), 2);
        assert!(!state.is_empty());
    }

    #[test]
    fn test_to_json() {
        let state = sample();
        assert_eq!(
            state.to_json().unwrap(),
            json!({ "counter": 10, "todos": { "items": ["ship"] } })
        );
    }

    #[test]
    fn test_clone_is_same_snapshot() {
        let state = sample();
        let copy = state.clone();
        assert!(state.same_as(&copy));
        assert!(state.shares_slice(&copy, "counter"));
        assert!(!state.shares_slice(&copy, "missing"));
    }

    #[test]
    fn test_rebuilt_tree_shares_untouched_slices() {
        let before = sample();
        let mut map: BTreeMap<String, StateValue> = before
            .entries()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("counter".into(), Arc::new(11i64));
        let after = RootState::from_map(map);

        assert!(!before.same_as(&after));
        assert!(before.shares_slice(&after, "todos"));
        assert!(!before.shares_slice(&after, "counter"));
    }

    #[tokio::test]
    async fn test_subscription_stream_yields_current_then_updates() {
        let (tx, rx) = watch::channel(RootState::default());
        let mut stream = StateSubscription::new(rx).into_stream();

        let first = stream.next().await.unwrap();
        assert!(first.is_empty());

        tx.send_replace(sample());
        let second = stream.next().await.unwrap();
        assert_eq!(second.get::<i64>("counter"), Some(&10));

        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
