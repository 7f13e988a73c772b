use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::core::Hash32;

/// An immutable, ordered sequence of items.
///
/// `Snapshot` is the unit of change propagation: every sequence stage
/// produces one, and a stage is only considered changed when its new snapshot
/// differs from the previous one element by element. Cloning is cheap, the
/// items live behind an `Arc`.
#[derive(Debug)]
pub struct Snapshot<T> {
    items: Arc<[T]>,
}

impl<T> Snapshot<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: Clone> Snapshot<T> {
    /// Returns a new snapshot holding `self` followed by `other`.
    pub fn concat(&self, other: &Snapshot<T>) -> Snapshot<T> {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }

        self.iter().chain(other.iter()).cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.to_vec()
    }
}

impl<T: Hash> Snapshot<T> {
    /// Content fingerprint, stable across allocations.
    pub fn fingerprint(&self) -> Hash32 {
        Hash32::of(self)
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: PartialEq> PartialEq for Snapshot<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.items, &other.items) || self.items[..] == other.items[..]
    }
}

impl<T: Eq> Eq for Snapshot<T> {}

impl<T: Hash> Hash for Snapshot<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.items[..].hash(state);
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl<T> From<Vec<T>> for Snapshot<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

impl<T> FromIterator<T> for Snapshot<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_structural() {
        let a = Snapshot::new(vec![String::from("x"), String::from("y")]);
        let b: Snapshot<String> = ["x", "y"].into_iter().map(String::from).collect();

        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = Snapshot::new(vec![1, 2, 3]);
        let b = Snapshot::new(vec![3, 2, 1]);

        assert_ne!(a, b);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_concat() {
        let a = Snapshot::new(vec![1, 2]);
        let b = Snapshot::new(vec![3]);

        assert_eq!(a.concat(&b).as_slice(), &[1, 2, 3]);
        assert_eq!(b.concat(&a).as_slice(), &[3, 1, 2]);
        assert_eq!(a.concat(&Snapshot::empty()), a);
    }
}
