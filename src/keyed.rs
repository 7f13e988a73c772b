//! Keyed and grouped projections of a [`Snapshot`].
//!
//! Both maps consume their whole source snapshot before producing anything,
//! so they are rebuilt from scratch whenever the source changes. Keys are
//! kept in a `BTreeMap`, which makes iteration order and equality independent
//! of the order items arrived in.

use std::collections::BTreeMap;

use crate::core::{Item, Key};
use crate::snapshot::Snapshot;

/// A deterministic key to value projection of a snapshot.
///
/// When two items produce the same key, the one appearing later in the
/// source snapshot wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyedMap<K, V> {
    map: BTreeMap<K, V>,
}

impl<K: Key, V: Item> KeyedMap<K, V> {
    /// Builds the map by walking `source` in order, last occurrence wins.
    pub fn key_by<T, FK, FV>(source: &Snapshot<T>, key: FK, value: FV) -> Self
    where
        FK: Fn(&T) -> K,
        FV: Fn(&T) -> V,
    {
        source.iter().map(|item| (key(item), value(item))).collect()
    }

    pub fn try_get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    /// Replaces every value, keeping the keys. Returning `None` drops the key.
    pub fn map_values<U, F>(&self, mut f: F) -> KeyedMap<K, U>
    where
        U: Item,
        F: FnMut(&K, &V) -> Option<U>,
    {
        self.map
            .iter()
            .filter_map(|(key, value)| f(key, value).map(|value| (key.clone(), value)))
            .collect()
    }

    /// The underlying pairs, in key order.
    pub fn entries(&self) -> Snapshot<(K, V)> {
        self.map
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl<K: Ord, V> Default for KeyedMap<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for KeyedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        // BTreeMap::insert overwrites, which gives last-wins for free.
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

/// A key to group projection of a snapshot.
///
/// Nothing is discarded: every item lands in the group of its key, in the
/// order it appeared in the source snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupingMap<K, V> {
    map: BTreeMap<K, Vec<V>>,
}

impl<K: Key, V: Item> GroupingMap<K, V> {
    pub fn group_by<T, FK, FV>(source: &Snapshot<T>, key: FK, value: FV) -> Self
    where
        FK: Fn(&T) -> K,
        FV: Fn(&T) -> V,
    {
        source.iter().map(|item| (key(item), value(item))).collect()
    }

    /// The group of `key`, empty when the key never occurred.
    pub fn get(&self, key: &K) -> &[V] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &[V])> {
        self.map.iter().map(|(key, group)| (key, group.as_slice()))
    }

    pub fn entries(&self) -> Snapshot<(K, Snapshot<V>)> {
        self.map
            .iter()
            .map(|(key, group)| (key.clone(), Snapshot::new(group.clone())))
            .collect()
    }
}

impl<K: Ord, V> Default for GroupingMap<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for GroupingMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map: BTreeMap<K, Vec<V>> = BTreeMap::new();

        for (key, value) in iter {
            map.entry(key).or_default().push(value);
        }

        Self { map }
    }
}
