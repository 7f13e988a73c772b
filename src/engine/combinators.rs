//! Stateless algorithms over providers.
//!
//! Each combinator adds one or more stages to the graph and returns the
//! handle of the last one. Transforms check the cancellation token between
//! items, and lookups that find nothing drop the item instead of failing.

use crate::core::{Item, Key};
use crate::engine::{Engine, Grouped, Handle, Keyed, Provider};
use crate::error::EngineError;
use crate::keyed::{GroupingMap, KeyedMap};
use crate::snapshot::Snapshot;

impl Engine {
    /// Maps every item of `source` one to one.
    pub fn select<T, U, F>(&mut self, source: Provider<T>, f: F) -> Provider<U>
    where
        T: Item,
        U: Item,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.derive("select", source, move |cx, source| {
            let mut items = Vec::with_capacity(source.len());
            for item in source.iter() {
                cx.checkpoint()?;
                items.push(f(item));
            }
            Ok(Snapshot::new(items))
        })
    }

    /// Keeps at most one output per item, dropping the items for which `f`
    /// returns `None`.
    pub fn maybe_select<T, U, F>(&mut self, source: Provider<T>, f: F) -> Provider<U>
    where
        T: Item,
        U: Item,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        self.derive("maybe_select", source, move |cx, source| {
            let mut items = Vec::new();
            for item in source.iter() {
                cx.checkpoint()?;
                items.extend(f(item));
            }
            Ok(Snapshot::new(items))
        })
    }

    /// Like [`maybe_select`](Self::maybe_select), but every item may yield any
    /// number of optional outputs. The result is flattened and absent entries
    /// are dropped.
    pub fn maybe_select_many<T, U, I, F>(&mut self, source: Provider<T>, f: F) -> Provider<U>
    where
        T: Item,
        U: Item,
        I: IntoIterator<Item = Option<U>>,
        F: Fn(&T) -> I + Send + Sync + 'static,
    {
        self.derive("maybe_select_many", source, move |cx, source| {
            let mut items = Vec::new();
            for item in source.iter() {
                cx.checkpoint()?;
                items.extend(f(item).into_iter().flatten());
            }
            Ok(Snapshot::new(items))
        })
    }

    /// Projects `source` into a keyed map; on duplicate keys the last item
    /// wins.
    pub fn key_by<T, K, V, FK, FV>(&mut self, source: Provider<T>, key: FK, value: FV) -> Keyed<K, V>
    where
        T: Item,
        K: Key,
        V: Item,
        FK: Fn(&T) -> K + Send + Sync + 'static,
        FV: Fn(&T) -> V + Send + Sync + 'static,
    {
        let index = self.add_stage("key_by", source, true, move |cx, source| {
            cx.checkpoint()?;
            Ok(KeyedMap::key_by(&source, &key, &value))
        });
        Keyed::new(index)
    }

    /// Projects `source` into groups, keeping every item.
    pub fn group_by<T, K, V, FK, FV>(
        &mut self,
        source: Provider<T>,
        key: FK,
        value: FV,
    ) -> Grouped<K, V>
    where
        T: Item,
        K: Key,
        V: Item,
        FK: Fn(&T) -> K + Send + Sync + 'static,
        FV: Fn(&T) -> V + Send + Sync + 'static,
    {
        let index = self.add_stage("group_by", source, true, move |cx, source| {
            cx.checkpoint()?;
            Ok(GroupingMap::group_by(&source, &key, &value))
        });
        Grouped::new(index)
    }

    /// Replaces the values of a keyed map, dropping keys mapped to `None`.
    pub fn map_values<K, V, U, F>(&mut self, source: Keyed<K, V>, f: F) -> Keyed<K, U>
    where
        K: Key,
        V: Item,
        U: Item,
        F: Fn(&K, &V) -> Option<U> + Send + Sync + 'static,
    {
        let index = self.add_stage("map_values", source, true, move |cx, source| {
            cx.checkpoint()?;
            Ok(source.map_values(&f))
        });
        Keyed::new(index)
    }

    /// Exposes the pairs of a keyed map as a plain sequence provider.
    pub fn entries<K, V>(&mut self, source: Keyed<K, V>) -> Provider<(K, V)>
    where
        K: Key,
        V: Item,
    {
        self.derive("entries", source, |_, source| Ok(source.entries()))
    }

    /// Exposes every group as one `(key, values)` item, in key order.
    pub fn groups<K, V>(&mut self, source: Grouped<K, V>) -> Provider<(K, Snapshot<V>)>
    where
        K: Key,
        V: Item,
    {
        self.derive("groups", source, |_, source| Ok(source.entries()))
    }

    /// Left-driven join of two keyed maps.
    ///
    /// Every key of `left` is visited once. When `right` has no value for it,
    /// `default` is passed instead. The key is kept only if `combine` returns
    /// `Some`, so an inner join is a `combine` that rejects the default.
    /// Keys only present in `right` are never visited.
    pub fn join_by_key<K, A, B, C, F>(
        &mut self,
        left: Keyed<K, A>,
        right: Keyed<K, B>,
        default: B,
        combine: F,
    ) -> Keyed<K, C>
    where
        K: Key,
        A: Item,
        B: Item,
        C: Item,
        F: Fn(&K, &A, &B) -> Option<C> + Send + Sync + 'static,
    {
        let index = self.add_stage("join_by_key", (left, right), true, move |cx, (left, right)| {
            let mut joined = Vec::with_capacity(left.len());
            for (key, value) in left.iter() {
                cx.checkpoint()?;
                let other = right.try_get(key).unwrap_or(&default);
                if let Some(combined) = combine(key, value, other) {
                    joined.push((key.clone(), combined));
                }
            }
            Ok(joined.into_iter().collect::<KeyedMap<K, C>>())
        });
        Keyed::new(index)
    }

    /// Fan-out/fan-in: runs `branch` once per element of `branches` over the
    /// same `source`, then concatenates the results.
    ///
    /// Each branch gets its own stages, so a change confined to one branch
    /// only recomputes that branch and the merge stages above it. The order
    /// of the merged items follows the merge chain (newest branch first) and
    /// should not be relied on.
    ///
    /// Fails with [`EngineError::EmptyBranches`] before adding anything to the
    /// graph when `branches` is empty.
    pub fn for_each<T, U, V, F>(
        &mut self,
        source: Provider<T>,
        branches: &[U],
        mut branch: F,
    ) -> Result<Provider<V>, EngineError>
    where
        T: Item,
        V: Item,
        F: FnMut(&mut Engine, Provider<T>, &U) -> Provider<V>,
    {
        let (first, rest) = branches
            .split_first()
            .ok_or(EngineError::EmptyBranches)?;

        let mut merged = branch(self, source, first);

        for item in rest {
            let next = branch(self, source, item);
            merged = self.derive("for_each", (next, merged), |cx, (next, merged)| {
                cx.checkpoint()?;
                Ok(next.concat(&merged))
            });
        }

        Ok(merged)
    }

    /// Passes `source` through unchanged, but re-runs and reports a change
    /// whenever `other` changes.
    ///
    /// Use it when a downstream transform reads `other` through
    /// [`StageContext::peek`](crate::StageContext::peek) or a task instead
    /// of a declared dependency: the edge makes sure `other` is brought up to
    /// date first and that the reader is re-run when it changes.
    pub fn depends_on<T, H>(&mut self, source: Provider<T>, other: H) -> Provider<T>
    where
        T: Item,
        H: Handle,
    {
        let index = self.add_stage("depends_on", (source, other), false, |_, (source, _)| {
            Ok(Snapshot::clone(&source))
        });
        Provider::new(index)
    }
}
