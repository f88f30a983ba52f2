// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Abstract addresses and the merge rules between them.
//!
//! An abstract address is a UIV plus a signed byte offset. Sets of abstract
//! addresses are the points-to facts of the analysis. When two addresses of
//! the same base can no longer be told apart, one of them is merged into the
//! other; the helpers here decide which one survives and what the surviving
//! address looks like.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::points_to::{HybridPointsToSet, PointsToSet};
use super::uiv::{UivId, UivTable};
use crate::ir::ProgramIr;

/// Offset standing for "any element" of an array.
pub const WHOLE_ARRAY_OFFSET: i32 = i32::MAX;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AbsAddr {
    pub uiv: UivId,
    pub offset: i32,
}

impl fmt::Debug for AbsAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == WHOLE_ARRAY_OFFSET {
            write!(f, "<{:?},*>", self.uiv)
        } else {
            write!(f, "<{:?},{}>", self.uiv, self.offset)
        }
    }
}

impl AbsAddr {
    #[inline]
    pub fn new(uiv: UivId, offset: i32) -> Self {
        AbsAddr { uiv, offset }
    }

    pub fn is_whole_array(&self) -> bool {
        self.offset == WHOLE_ARRAY_OFFSET
    }

    /// The address `delta` bytes further on. Whole-array addresses stay put.
    pub fn shifted(&self, delta: i64) -> AbsAddr {
        if self.is_whole_array() || delta == 0 {
            return *self;
        }
        let offset = (self.offset as i64 + delta).clamp(i32::MIN as i64, (WHOLE_ARRAY_OFFSET - 1) as i64);
        AbsAddr::new(self.uiv, offset as i32)
    }

    pub fn display(&self, table: &UivTable, ir: &dyn ProgramIr) -> String {
        if self.is_whole_array() {
            format!("<{},*>", table.display(self.uiv, ir))
        } else {
            format!("<{},{}>", table.display(self.uiv, ir), self.offset)
        }
    }
}

pub type AbsAddrSet = HybridPointsToSet<AbsAddr>;

/// Every address of `set` shifted by `delta` bytes.
pub fn shift_set(set: &AbsAddrSet, delta: i64) -> AbsAddrSet {
    set.iter().map(|addr| addr.shifted(delta)).collect()
}

pub fn singleton(addr: AbsAddr) -> AbsAddrSet {
    let mut set = AbsAddrSet::new();
    set.insert(addr);
    set
}

/// A function pointer is the address of a `Func` UIV itself.
pub fn is_function_pointer(table: &UivTable, addr: AbsAddr) -> bool {
    addr.offset == 0 && table.is_func(addr.uiv)
}

/// How a merge target came to be one.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum MergeKind {
    /// Offsets of the same UIV were folded together.
    Offsets,
    /// Different UIVs of the same base were folded together.
    Uivs,
}

/// The UIVs that are the destination of some merge inside a method.
#[derive(Clone, Debug, Default)]
pub struct MergeTargets {
    targets: BTreeMap<UivId, BTreeSet<MergeKind>>,
}

impl MergeTargets {
    pub fn new() -> Self {
        MergeTargets::default()
    }

    pub fn record(&mut self, uiv: UivId, kind: MergeKind) -> bool {
        self.targets.entry(uiv).or_default().insert(kind)
    }

    pub fn contains(&self, uiv: UivId, kind: MergeKind) -> bool {
        self.targets.get(&uiv).map_or(false, |kinds| kinds.contains(&kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = (UivId, MergeKind)> + '_ {
        self.targets
            .iter()
            .flat_map(|(uiv, kinds)| kinds.iter().map(move |kind| (*uiv, *kind)))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum MergeAway {
    First,
    Second,
}

/// Between two distinct offsets, the one to drop. Whole-array offsets
/// swallow the other, then non-negative offsets beat negative ones, then
/// offsets closer to zero win.
fn offset_to_merge_away(first: i32, second: i32) -> MergeAway {
    if first == WHOLE_ARRAY_OFFSET {
        MergeAway::Second
    } else if second == WHOLE_ARRAY_OFFSET {
        MergeAway::First
    } else if first >= 0 {
        if second < 0 || first < second {
            MergeAway::Second
        } else {
            MergeAway::First
        }
    } else if second >= 0 || first <= second {
        MergeAway::First
    } else {
        MergeAway::Second
    }
}

/// If `first` and `second` are merge candidates, the pair `(from, to)` where
/// `from` is the address merged away into `to`.
pub fn address_to_merge(table: &UivTable, first: AbsAddr, second: AbsAddr) -> Option<(AbsAddr, AbsAddr)> {
    let order = |away: MergeAway| match away {
        MergeAway::First => (first, second),
        MergeAway::Second => (second, first),
    };
    if first == second {
        return Some((second, first));
    }
    if first.uiv == second.uiv {
        return Some(order(offset_to_merge_away(first.offset, second.offset)));
    }
    if first.offset != second.offset || table.base(first.uiv) != table.base(second.uiv) {
        return None;
    }
    let (first_level, second_level) = (table.level(first.uiv), table.level(second.uiv));
    if first_level != second_level {
        // Keep the shallower UIV.
        return Some(order(if first_level > second_level { MergeAway::First } else { MergeAway::Second }));
    }
    for level in (1..=first_level).rev() {
        let first_off = table.field_offset_at_level(first.uiv, level);
        let second_off = table.field_offset_at_level(second.uiv, level);
        if first_off != second_off {
            return Some(order(offset_to_merge_away(first_off, second_off)));
        }
    }
    debug_assert!(false, "distinct uivs {:?} and {:?} share base, level and offsets", first, second);
    None
}

/// The address kept after merging `from` into `to`, and the stride of an
/// offset merge (`None` for a UIV merge). Offsets are folded to the smallest
/// non-negative offset congruent to `to` modulo the stride.
pub fn final_from_merge(from: AbsAddr, to: AbsAddr) -> (AbsAddr, Option<u32>) {
    if from.uiv != to.uiv {
        return (to, None);
    }
    if to.is_whole_array() {
        return (to, Some(1));
    }
    let stride = (to.offset as i64 - from.offset as i64).abs();
    debug_assert!(stride > 0);
    let folded = (to.offset as i64).rem_euclid(stride);
    (AbsAddr::new(to.uiv, folded as i32), Some(stride.min(u32::MAX as i64) as u32))
}

/// Merges the addresses of `set` among themselves, recording every merge
/// destination in `targets`. Returns true if the set changed.
pub fn merge_in_set(table: &UivTable, set: &mut AbsAddrSet, targets: &mut MergeTargets) -> bool {
    if set.count() < 2 {
        return false;
    }
    let mut to_remove = BTreeSet::new();
    let mut inserted = false;
    loop {
        let addrs: Vec<AbsAddr> = set.iter().collect();
        let mut to_insert = Vec::new();
        for (idx, first) in addrs.iter().enumerate() {
            for second in &addrs[idx + 1..] {
                let Some((from, to)) = address_to_merge(table, *first, *second) else {
                    continue;
                };
                let (merged, stride) = final_from_merge(from, to);
                match stride {
                    Some(_) => targets.record(merged.uiv, MergeKind::Offsets),
                    None => targets.record(merged.uiv, MergeKind::Uivs),
                };
                if merged != *first {
                    to_remove.insert(*first);
                }
                if merged != *second {
                    to_remove.insert(*second);
                }
                if merged != *first && merged != *second {
                    to_insert.push(merged);
                }
            }
        }
        let mut grew = false;
        for addr in to_insert {
            grew |= set.insert(addr);
        }
        inserted |= grew;
        if !grew {
            break;
        }
    }
    if to_remove.is_empty() {
        return inserted;
    }
    let survivors = set.iter().filter(|addr| !to_remove.contains(addr)).count();
    if survivors == 0 {
        debug_assert!(false, "merging emptied {:?}", set);
        return inserted;
    }
    for addr in to_remove {
        set.remove(addr);
    }
    true
}

/// Which side of an overlap test may act as a prefix of the other.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PrefixCheck {
    None,
    First,
    Second,
    Both,
}

/// Whether the object found at `first` could lie on the access path that
/// leads to `second`.
fn is_addr_prefix(table: &UivTable, first: AbsAddr, second: AbsAddr) -> bool {
    match table.existing_field(first.uiv, first.offset) {
        Some(prefix) => table.is_prefix(prefix, second.uiv),
        None => false,
    }
}

pub fn addrs_overlap(table: &UivTable, first: AbsAddr, second: AbsAddr, check_merge: bool, prefix: PrefixCheck) -> bool {
    if first == second {
        return true;
    }
    if check_merge && address_to_merge(table, first, second).is_some() {
        return true;
    }
    match prefix {
        PrefixCheck::None => false,
        PrefixCheck::First => is_addr_prefix(table, first, second),
        PrefixCheck::Second => is_addr_prefix(table, second, first),
        PrefixCheck::Both => is_addr_prefix(table, first, second) || is_addr_prefix(table, second, first),
    }
}

pub fn sets_overlap(
    table: &UivTable,
    first: &AbsAddrSet,
    second: &AbsAddrSet,
    check_merge: bool,
    prefix: PrefixCheck,
) -> bool {
    if first.iter().any(|addr| second.contains(addr)) {
        return true;
    }
    if !check_merge && prefix == PrefixCheck::None {
        return false;
    }
    first
        .iter()
        .any(|a| second.iter().any(|b| addrs_overlap(table, a, b, check_merge, prefix)))
}

/// Whether every member of `previous` is still represented in `current`,
/// either directly or through an address it was merged into.
pub fn set_covers(table: &UivTable, current: &AbsAddrSet, previous: &AbsAddrSet) -> bool {
    previous.iter().all(|old| {
        current.contains(old)
            || current.iter().any(|new| match address_to_merge(table, old, new) {
                Some((from, _)) => from == old,
                None => false,
            })
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{MethodId, SymbolId, VarId};

    fn table() -> UivTable {
        UivTable::new(2)
    }

    #[test]
    fn shift_test() {
        let mut table = table();
        let g = table.global(SymbolId(0), 0);
        let addr = AbsAddr::new(g, 4);
        assert_eq!(addr.shifted(8).offset, 12);
        assert_eq!(addr.shifted(-8).offset, -4);
        let whole = AbsAddr::new(g, WHOLE_ARRAY_OFFSET);
        assert_eq!(whole.shifted(8), whole);
        let set: AbsAddrSet = vec![addr, whole].into_iter().collect();
        let shifted = shift_set(&set, 4);
        assert!(shifted.contains(AbsAddr::new(g, 8)));
        assert!(shifted.contains(whole));
    }

    #[test]
    fn offset_merge_test() {
        let mut table = table();
        let g = table.global(SymbolId(0), 0);
        let (at4, at12, neg) = (AbsAddr::new(g, 4), AbsAddr::new(g, 12), AbsAddr::new(g, -4));
        assert_eq!(address_to_merge(&table, at4, at12), Some((at12, at4)));
        assert_eq!(address_to_merge(&table, neg, at12), Some((neg, at12)));
        let whole = AbsAddr::new(g, WHOLE_ARRAY_OFFSET);
        assert_eq!(address_to_merge(&table, at4, whole), Some((at4, whole)));

        assert_eq!(final_from_merge(at12, at4), (AbsAddr::new(g, 4), Some(8)));
        assert_eq!(final_from_merge(neg, at12), (AbsAddr::new(g, 12), Some(16)));
        assert_eq!(final_from_merge(at12, AbsAddr::new(g, -6)), (AbsAddr::new(g, 12), Some(18)));
        assert_eq!(final_from_merge(at4, whole), (whole, Some(1)));
    }

    #[test]
    fn uiv_merge_test() {
        let mut table = table();
        let v = table.var(MethodId(0), VarId(0));
        let f8 = table.field(v, 8);
        let f16 = table.field(v, 16);
        let other = table.var(MethodId(0), VarId(1));
        let (a, b) = (AbsAddr::new(v, 0), AbsAddr::new(f8, 0));
        assert_eq!(address_to_merge(&table, a, b), Some((b, a)));
        let (c, d) = (AbsAddr::new(f8, 0), AbsAddr::new(f16, 0));
        assert_eq!(address_to_merge(&table, d, c), Some((d, c)));
        assert_eq!(address_to_merge(&table, AbsAddr::new(f8, 4), d), None);
        assert_eq!(address_to_merge(&table, a, AbsAddr::new(other, 0)), None);
    }

    #[test]
    fn merge_in_set_test() {
        let mut table = table();
        let g = table.global(SymbolId(0), 0);
        let v = table.var(MethodId(0), VarId(0));
        let f = table.field(v, 8);
        let mut set: AbsAddrSet = vec![AbsAddr::new(g, 4), AbsAddr::new(g, 8), AbsAddr::new(v, 0), AbsAddr::new(f, 0)]
            .into_iter()
            .collect();
        let mut targets = MergeTargets::new();
        assert!(merge_in_set(&table, &mut set, &mut targets));
        let expected: AbsAddrSet = vec![AbsAddr::new(g, 0), AbsAddr::new(v, 0)].into_iter().collect();
        assert_eq!(set, expected);
        assert!(targets.contains(g, MergeKind::Offsets));
        assert!(targets.contains(v, MergeKind::Uivs));

        // A second application changes nothing.
        let before = set.clone();
        assert!(!merge_in_set(&table, &mut set, &mut targets));
        assert_eq!(set, before);
    }

    #[test]
    fn overlap_test() {
        let mut table = table();
        let v = table.var(MethodId(0), VarId(0));
        let f = table.field(v, 8);
        let g = table.global(SymbolId(0), 0);
        let a: AbsAddrSet = vec![AbsAddr::new(v, 0)].into_iter().collect();
        let b: AbsAddrSet = vec![AbsAddr::new(v, 4)].into_iter().collect();
        assert!(!sets_overlap(&table, &a, &b, false, PrefixCheck::None));
        assert!(sets_overlap(&table, &a, &b, true, PrefixCheck::None));

        let field: AbsAddrSet = vec![AbsAddr::new(f, 0)].into_iter().collect();
        let slot: AbsAddrSet = vec![AbsAddr::new(v, 8)].into_iter().collect();
        assert!(!sets_overlap(&table, &slot, &field, false, PrefixCheck::None));
        assert!(sets_overlap(&table, &slot, &field, false, PrefixCheck::First));
        assert!(!sets_overlap(&table, &slot, &field, false, PrefixCheck::Second));
        assert!(sets_overlap(&table, &field, &slot, false, PrefixCheck::Both));

        let global: AbsAddrSet = vec![AbsAddr::new(g, 0)].into_iter().collect();
        assert!(!sets_overlap(&table, &global, &a, true, PrefixCheck::Both));
    }

    #[test]
    fn covers_test() {
        let mut table = table();
        let g = table.global(SymbolId(0), 0);
        let previous: AbsAddrSet = vec![AbsAddr::new(g, 8)].into_iter().collect();
        let merged: AbsAddrSet = vec![AbsAddr::new(g, 0)].into_iter().collect();
        assert!(set_covers(&table, &merged, &previous));
        let elsewhere: AbsAddrSet = vec![AbsAddr::new(table.global(SymbolId(1), 0), 0)].into_iter().collect();
        assert!(!set_covers(&table, &elsewhere, &previous));
    }
}
