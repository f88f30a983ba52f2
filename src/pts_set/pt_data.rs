// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use super::abs_addr::{set_covers, AbsAddr, AbsAddrSet};
use super::points_to::PointsToSet;
use super::uiv::{UivId, UivTable};

/// An abstract-address set together with its value at the last snapshot.
/// Convergence of a fixpoint loop is detected by comparing the two.
#[derive(Clone, Default)]
pub struct MappedSet {
    current: AbsAddrSet,
    previous: AbsAddrSet,
}

impl fmt::Debug for MappedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.current.fmt(f)
    }
}

impl MappedSet {
    pub fn new() -> Self {
        MappedSet::default()
    }

    pub fn from_set(set: AbsAddrSet) -> Self {
        MappedSet {
            current: set,
            previous: AbsAddrSet::new(),
        }
    }

    #[inline]
    pub fn get(&self) -> &AbsAddrSet {
        &self.current
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut AbsAddrSet {
        &mut self.current
    }

    pub fn previous(&self) -> &AbsAddrSet {
        &self.previous
    }

    pub fn insert(&mut self, addr: AbsAddr) -> bool {
        self.current.insert(addr)
    }

    pub fn union(&mut self, other: &AbsAddrSet) -> bool {
        self.current.union(other)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn snapshot(&mut self) {
        self.previous = self.current.clone();
    }

    pub fn changed(&self) -> bool {
        self.current != self.previous
    }

    /// Whether nothing held at the last snapshot was lost since.
    pub fn is_monotone(&self, table: &UivTable) -> bool {
        set_covers(table, &self.current, &self.previous)
    }
}

/// Mapped sets keyed by `K`: memory maps (keyed by abstract address) and
/// UIV maps (keyed by UIV).
#[derive(Clone)]
pub struct PtData<K> {
    pts_map: BTreeMap<K, MappedSet>,
}

impl<K> fmt::Debug for PtData<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PtData({} keys)", self.pts_map.len())
    }
}

impl<K> Default for PtData<K> {
    fn default() -> Self {
        PtData { pts_map: BTreeMap::new() }
    }
}

impl<K: Ord + Copy> PtData<K> {
    pub fn new() -> Self {
        PtData::default()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.pts_map.clear();
    }

    pub fn len(&self) -> usize {
        self.pts_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pts_map.is_empty()
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.pts_map.contains_key(&key)
    }

    /// Get the points-to set of a key.
    #[inline]
    pub fn get_pts(&self, key: K) -> Option<&AbsAddrSet> {
        self.pts_map.get(&key).map(MappedSet::get)
    }

    #[inline]
    pub fn get_mapped(&self, key: K) -> Option<&MappedSet> {
        self.pts_map.get(&key)
    }

    #[inline]
    pub fn get_mut_pts(&mut self, key: K) -> Option<&mut AbsAddrSet> {
        self.pts_map.get_mut(&key).map(MappedSet::get_mut)
    }

    /// The mapped set of `key`, created empty if absent.
    pub fn entry(&mut self, key: K) -> &mut MappedSet {
        self.pts_map.entry(key).or_default()
    }

    /// Adds `addr` to the points-to set of `key`.
    pub fn add_pts(&mut self, key: K, addr: AbsAddr) -> bool {
        self.entry(key).insert(addr)
    }

    /// Performs pts(key) = pts(key) U set.
    pub fn union_pts_to(&mut self, key: K, set: &AbsAddrSet) -> bool {
        match self.pts_map.entry(key) {
            btree_map::Entry::Occupied(mut o) => o.get_mut().union(set),
            btree_map::Entry::Vacant(v) => {
                v.insert(MappedSet::from_set(set.clone()));
                true
            }
        }
    }

    pub fn remove(&mut self, key: K) -> Option<MappedSet> {
        self.pts_map.remove(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.pts_map.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &MappedSet)> + '_ {
        self.pts_map.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut MappedSet)> + '_ {
        self.pts_map.iter_mut().map(|(k, v)| (*k, v))
    }

    pub fn snapshot_all(&mut self) {
        for set in self.pts_map.values_mut() {
            set.snapshot();
        }
    }

    pub fn any_changed(&self) -> bool {
        self.pts_map.values().any(MappedSet::changed)
    }

    /// Total number of points-to relations.
    pub fn num_relations(&self) -> usize {
        self.pts_map.values().map(|set| set.get().count()).sum()
    }
}

fn uiv_range(uiv: UivId) -> RangeInclusive<AbsAddr> {
    AbsAddr::new(uiv, i32::MIN)..=AbsAddr::new(uiv, i32::MAX)
}

impl PtData<AbsAddr> {
    /// Memory keys whose address lies in `uiv`, in offset order.
    pub fn keys_of_uiv(&self, uiv: UivId) -> impl Iterator<Item = AbsAddr> + '_ {
        self.pts_map.range(uiv_range(uiv)).map(|(k, _)| *k)
    }

    pub fn has_keys_of_uiv(&self, uiv: UivId) -> bool {
        self.pts_map.range(uiv_range(uiv)).next().is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{MethodId, SymbolId, VarId};
    use crate::pts_set::abs_addr::WHOLE_ARRAY_OFFSET;

    #[test]
    fn snapshot_test() {
        let mut table = UivTable::new(1);
        let g = table.global(SymbolId(0), 0);
        let mut set = MappedSet::new();
        set.insert(AbsAddr::new(g, 8));
        assert!(set.changed());
        set.snapshot();
        assert!(!set.changed());
        assert!(!set.insert(AbsAddr::new(g, 8)));
        assert!(!set.changed());

        // Merging g@8 into g@0 loses nothing.
        set.get_mut().remove(AbsAddr::new(g, 8));
        set.insert(AbsAddr::new(g, 0));
        assert!(set.changed());
        assert!(set.is_monotone(&table));
        set.get_mut().clear();
        assert!(!set.is_monotone(&table));
    }

    #[test]
    fn keys_of_uiv_test() {
        let mut table = UivTable::new(1);
        let a = table.var(MethodId(0), VarId(0));
        let b = table.var(MethodId(0), VarId(1));
        let g = table.global(SymbolId(0), 0);
        let mut mem: PtData<AbsAddr> = PtData::new();
        mem.add_pts(AbsAddr::new(a, 8), AbsAddr::new(g, 0));
        mem.add_pts(AbsAddr::new(a, -4), AbsAddr::new(g, 0));
        mem.add_pts(AbsAddr::new(a, WHOLE_ARRAY_OFFSET), AbsAddr::new(g, 0));
        mem.add_pts(AbsAddr::new(b, 0), AbsAddr::new(g, 4));
        let keys: Vec<AbsAddr> = mem.keys_of_uiv(a).collect();
        assert_eq!(
            keys,
            vec![AbsAddr::new(a, -4), AbsAddr::new(a, 8), AbsAddr::new(a, WHOLE_ARRAY_OFFSET)]
        );
        assert!(mem.has_keys_of_uiv(b));
        assert!(!mem.has_keys_of_uiv(g));
        assert_eq!(mem.num_relations(), 4);
        assert!(mem.any_changed());
        mem.snapshot_all();
        assert!(!mem.any_changed());
    }
}
