//! Keyed entity collections and conflict-aware merging.
//!
//! Slice state often holds entities by id. [`EntityCollection`] is an ordered,
//! immutable map for that purpose; [`merge`] combines two collections under a
//! declared [`MergeStrategy`] and never mutates its inputs.
//!
//! # Example
//!
//! ```ignore
//! let todos = Slice::new("todos", EntityCollection::<u32, Todo>::new())
//!     .on_result("todos/loaded", |todos, action| {
//!         let incoming = EntityCollection::from_entities(action.payload_as::<Vec<Todo>>()?, |t| t.id, MergeStrategy::Overwrite)?;
//!         Ok(merge(todos, &incoming, MergeStrategy::Overwrite)?)
//!     });
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::MergeError;

/// How incoming entities combine with existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Fail the whole merge if any incoming key already exists.
    FailIfDuplicate,
    /// Incoming values replace existing values with the same key.
    Overwrite,
}

/// Ordered mapping from entity key to entity.
///
/// Serializes as a JSON object (or map) keyed by entity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[serde(bound(
    serialize = "K: Ord + Serialize, V: Serialize",
    deserialize = "K: Ord + Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct EntityCollection<K, V> {
    entities: BTreeMap<K, V>,
}

impl<K, V> Default for EntityCollection<K, V> {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }
}

impl<K, V> EntityCollection<K, V>
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from entities, keyed by `key_fn`.
    ///
    /// Repeated keys within `items` follow `strategy`: `Overwrite` keeps the
    /// last one, `FailIfDuplicate` reports every repeated key.
    pub fn from_entities<I, F>(items: I, key_fn: F, strategy: MergeStrategy) -> Result<Self, MergeError>
    where
        I: IntoIterator<Item = V>,
        F: Fn(&V) -> K,
    {
        let mut entities = BTreeMap::new();
        let mut conflicts = Vec::new();
        for item in items {
            let key = key_fn(&item);
            if strategy == MergeStrategy::FailIfDuplicate && entities.contains_key(&key) {
                conflicts.push(key);
                continue;
            }
            entities.insert(key, item);
        }
        if !conflicts.is_empty() {
            conflicts.sort();
            conflicts.dedup();
            return Err(conflict(conflicts.iter()));
        }
        Ok(Self { entities })
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entities.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entities.contains_key(key)
    }

    /// A copy without `key`. Unknown keys yield an identical copy.
    pub fn remove(&self, key: &K) -> Self {
        let mut entities = self.entities.clone();
        entities.remove(key);
        Self { entities }
    }

    /// A copy with `key` set to `value`, replacing any existing entry.
    pub fn insert(&self, key: K, value: V) -> Self {
        let mut entities = self.entities.clone();
        entities.insert(key, value);
        Self { entities }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entities.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entities.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for EntityCollection<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entities: iter.into_iter().collect(),
        }
    }
}

fn conflict<'a, K: Debug + 'a>(keys: impl Iterator<Item = &'a K>) -> MergeError {
    MergeError::Conflict {
        keys: keys.map(|k| format!("{:?}", k)).collect(),
    }
}

/// Merge `incoming` into `existing`, returning a new collection.
///
/// - `FailIfDuplicate`: fails with [`MergeError::Conflict`] listing every
///   shared key if the key sets intersect. Nothing is merged.
/// - `Overwrite`: incoming entries win; other existing entries are kept.
pub fn merge<K, V>(
    existing: &EntityCollection<K, V>,
    incoming: &EntityCollection<K, V>,
    strategy: MergeStrategy,
) -> Result<EntityCollection<K, V>, MergeError>
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    if strategy == MergeStrategy::FailIfDuplicate {
        let mut shared = incoming.keys().filter(|k| existing.contains_key(k)).peekable();
        if shared.peek().is_some() {
            return Err(conflict(shared));
        }
    }

    let mut entities = existing.entities.clone();
    for (key, value) in incoming.iter() {
        entities.insert(key.clone(), value.clone());
    }
    Ok(EntityCollection { entities })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Todo {
        id: u32,
        title: String,
    }

    fn todo(id: u32, title: &str) -> Todo {
        Todo {
            id,
            title: title.to_string(),
        }
    }

    fn collection(items: &[(u32, &str)]) -> EntityCollection<u32, Todo> {
        items.iter().map(|(id, t)| (*id, todo(*id, t))).collect()
    }

    #[test]
    fn test_overwrite_incoming_wins() {
        let existing = collection(&[(1, "old"), (2, "keep")]);
        let incoming = collection(&[(1, "new"), (3, "added")]);

        let merged = merge(&existing, &incoming, MergeStrategy::Overwrite).unwrap();

        for key in incoming.keys() {
            assert_eq!(merged.get(key), incoming.get(key));
        }
        assert_eq!(merged.get(&2).unwrap().title, "keep");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_fail_if_duplicate_disjoint_succeeds() {
        let existing = collection(&[(1, "a")]);
        let incoming = collection(&[(2, "b")]);

        let merged = merge(&existing, &incoming, MergeStrategy::FailIfDuplicate).unwrap();
        assert_eq!(merged.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_fail_if_duplicate_overlap_fails_and_leaves_existing() {
        let existing = collection(&[(1, "a"), (2, "b"), (3, "c")]);
        let snapshot = existing.clone();
        let incoming = collection(&[(3, "x"), (4, "y"), (1, "z")]);

        let err = merge(&existing, &incoming, MergeStrategy::FailIfDuplicate).unwrap_err();

        assert_eq!(
            err,
            MergeError::Conflict {
                keys: vec!["1".into(), "3".into()]
            }
        );
        assert_eq!(existing, snapshot);
    }

    #[test]
    fn test_merge_fails_iff_keys_intersect() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..200 {
            let existing: EntityCollection<u32, Todo> = (0..rng.usize(0..6))
                .map(|_| {
                    let id = rng.u32(0..10);
                    (id, todo(id, "e"))
                })
                .collect();
            let incoming: EntityCollection<u32, Todo> = (0..rng.usize(0..6))
                .map(|_| {
                    let id = rng.u32(0..10);
                    (id, todo(id, "i"))
                })
                .collect();

            let intersects = incoming.keys().any(|k| existing.contains_key(k));
            let result = merge(&existing, &incoming, MergeStrategy::FailIfDuplicate);
            assert_eq!(result.is_err(), intersects);
            if let Ok(merged) = result {
                assert_eq!(merged.len(), existing.len() + incoming.len());
            }
        }
    }

    #[test]
    fn test_merge_does_not_mutate_inputs() {
        let existing = collection(&[(1, "a")]);
        let incoming = collection(&[(1, "b")]);
        let (e, i) = (existing.clone(), incoming.clone());

        let _ = merge(&existing, &incoming, MergeStrategy::Overwrite).unwrap();

        assert_eq!(existing, e);
        assert_eq!(incoming, i);
    }

    #[test]
    fn test_from_entities() {
        let items = vec![todo(2, "b"), todo(1, "a"), todo(2, "b2")];

        let overwrite =
            EntityCollection::from_entities(items.clone(), |t| t.id, MergeStrategy::Overwrite).unwrap();
        assert_eq!(overwrite.get(&2).unwrap().title, "b2");
        assert_eq!(overwrite.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        let err = EntityCollection::from_entities(items, |t| t.id, MergeStrategy::FailIfDuplicate)
            .unwrap_err();
        assert_eq!(err, MergeError::Conflict { keys: vec!["2".into()] });
    }

    #[test]
    fn test_remove_and_insert_return_new_collections() {
        let original = collection(&[(1, "a"), (2, "b")]);

        let removed = original.remove(&1);
        let inserted = original.insert(3, todo(3, "c"));

        assert_eq!(original.len(), 2);
        assert_eq!(removed.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(inserted.len(), 3);
        assert_eq!(original.remove(&99), original);
    }

    #[test]
    fn test_serde_as_map() {
        let todos = collection(&[(1, "a")]);
        let json = serde_json::to_value(&todos).unwrap();
        assert_eq!(json, serde_json::json!({ "1": { "id": 1, "title": "a" } }));

        let back: EntityCollection<u32, Todo> = serde_json::from_value(json).unwrap();
        assert_eq!(back, todos);
    }
}
