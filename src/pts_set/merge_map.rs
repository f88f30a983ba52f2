// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Per-method generic merge map.
//!
//! Unlike the in-set merge, which only looks at the members of one set, the
//! generic merge map records widening decisions that must be applied to
//! every address of a method: strides inferred from pointer arithmetic,
//! initialised memory regions, and merges handed up from callees.

use std::collections::{BTreeMap, BTreeSet};

use super::abs_addr::{final_from_merge, AbsAddr, AbsAddrSet};
use super::points_to::PointsToSet;
use super::uiv::{UivId, UivTable};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Merge {
    /// Any offset of the UIV congruent to `to.offset` modulo `stride` is
    /// rewritten to `to`.
    Offsets { to: AbsAddr, stride: u32 },
    /// The UIV is rewritten to `to`, keeping the offset.
    Uivs { to: UivId },
}

#[derive(Clone, Debug, Default)]
pub struct MergeMap {
    merges: BTreeMap<UivId, Vec<Merge>>,
}

impl MergeMap {
    pub fn new() -> Self {
        MergeMap::default()
    }

    pub fn len(&self) -> usize {
        self.merges.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    pub fn merges_of(&self, uiv: UivId) -> &[Merge] {
        self.merges.get(&uiv).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (UivId, &Merge)> + '_ {
        self.merges
            .iter()
            .flat_map(|(uiv, merges)| merges.iter().map(move |merge| (*uiv, merge)))
    }

    /// Returns true if the merge was not known yet.
    pub fn add_offset_merge(&mut self, to: AbsAddr, stride: u32) -> bool {
        debug_assert!(stride > 0);
        let merges = self.merges.entry(to.uiv).or_default();
        let known = merges.iter().any(|merge| match merge {
            Merge::Uivs { .. } => true,
            Merge::Offsets { to: old, stride: old_stride } => *old == to && *old_stride == stride,
        });
        if known {
            return false;
        }
        merges.push(Merge::Offsets { to, stride });
        true
    }

    /// A UIV merge replaces any offset merges of `from`; between two UIV
    /// merges the lesser destination is kept.
    pub fn add_uiv_merge(&mut self, table: &UivTable, from: UivId, to: UivId) -> bool {
        let merges = self.merges.entry(from).or_default();
        match merges.first_mut() {
            Some(Merge::Offsets { .. }) => {
                merges.clear();
                merges.push(Merge::Uivs { to });
                true
            }
            Some(Merge::Uivs { to: old }) => {
                if table.compare(*old, to).is_gt() {
                    *old = to;
                    true
                } else {
                    false
                }
            }
            None => {
                merges.push(Merge::Uivs { to });
                true
            }
        }
    }

    /// Records that `from` is merged into `to` and returns the address kept.
    pub fn add_mapping(&mut self, table: &UivTable, from: AbsAddr, to: AbsAddr) -> AbsAddr {
        let (merged, stride) = final_from_merge(from, to);
        match stride {
            Some(stride) => {
                self.add_offset_merge(merged, stride);
            }
            None => {
                self.add_uiv_merge(table, from.uiv, to.uiv);
            }
        }
        merged
    }

    /// One rewriting step for `addr`.
    fn merge_address(&self, addr: AbsAddr) -> AbsAddr {
        let mut result = addr;
        for merge in self.merges_of(addr.uiv) {
            match merge {
                Merge::Uivs { to } => return AbsAddr::new(*to, addr.offset),
                Merge::Offsets { to, stride } => {
                    if addr.is_whole_array() && !to.is_whole_array() {
                        continue;
                    }
                    let reduced = if to.is_whole_array() {
                        to.offset
                    } else {
                        (addr.offset as i64).rem_euclid(*stride as i64) as i32
                    };
                    if reduced == to.offset && (result == addr || result.offset > to.offset) {
                        result = *to;
                    }
                }
            }
        }
        result
    }

    /// Rewrites `addr` until no merge applies any more.
    pub fn apply_to_addr(&self, addr: AbsAddr) -> AbsAddr {
        let mut seen = BTreeSet::new();
        let mut current = addr;
        while seen.insert(current) {
            let next = self.merge_address(current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    pub fn apply_to_set(&self, set: &AbsAddrSet) -> AbsAddrSet {
        if self.merges.is_empty() {
            return set.clone();
        }
        set.iter().map(|addr| self.apply_to_addr(addr)).collect()
    }
}
