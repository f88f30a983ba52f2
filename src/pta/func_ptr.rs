// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Function pointer identification and propagation.
//!
//! The target operand of an indirect call either already holds function
//! addresses, or holds symbolic addresses that only a caller can resolve.
//! The latter become pending slots of the method. Pending slots travel up
//! the call graph through the callers' UIV maps until they meet a function.

use std::collections::{BTreeMap, BTreeSet};

use log::*;

use crate::ir::{InstRef, MethodId};
use crate::mir::method_info::MethodInfo;
use crate::pta::interproc::map_addr;
use crate::pts_set::abs_addr::{is_function_pointer, AbsAddr};
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::uiv::UivTable;

/// Indirect call -> the functions it may call.
pub type FuncPtrMap = BTreeMap<InstRef, BTreeSet<MethodId>>;

/// Records the functions held by the target operand of every indirect
/// call of `info`, and a pending slot for every other address.
/// Returns true if anything new was learned.
pub fn identify(uivs: &mut UivTable, info: &mut MethodInfo, func_ptrs: &mut FuncPtrMap) -> bool {
    let mut changed = false;
    for (inst, target) in info.icalls() {
        let icall = InstRef::new(info.method, inst);
        let set = info.operand_set(uivs, target);
        for addr in set.iter() {
            if is_function_pointer(uivs, addr) {
                if let Some(func) = uivs.func_method(addr.uiv) {
                    changed |= func_ptrs.entry(icall).or_default().insert(func);
                }
            } else if !info.is_local_uiv(uivs, addr.uiv) {
                changed |= info.pending_slots.entry(addr).or_default().insert(icall);
            }
        }
    }
    changed
}

/// Maps the pending slots of every normal callee of `caller` into the
/// caller. A slot mapped to a function resolves its indirect calls; any
/// other mapped address becomes a pending slot of the caller.
pub fn propagate(
    uivs: &UivTable,
    caller: &mut MethodInfo,
    callee: &MethodInfo,
    func_ptrs: &mut FuncPtrMap,
) -> bool {
    let Some(map) = caller.uiv_maps.get(&callee.method) else {
        return false;
    };
    let mut resolved: Vec<(InstRef, MethodId)> = Vec::new();
    let mut pending: Vec<(AbsAddr, InstRef)> = Vec::new();
    for (slot, icalls) in &callee.pending_slots {
        for mapped in map_addr(map, *slot).iter() {
            if is_function_pointer(uivs, mapped) {
                if let Some(func) = uivs.func_method(mapped.uiv) {
                    resolved.extend(icalls.iter().map(|icall| (*icall, func)));
                }
            } else if !caller.is_local_uiv(uivs, mapped.uiv) {
                pending.extend(icalls.iter().map(|icall| (mapped, *icall)));
            }
        }
    }

    let mut changed = false;
    for (icall, func) in resolved {
        if func_ptrs.entry(icall).or_default().insert(func) {
            debug!("{:?} resolved to {:?} in {:?}", icall, func, caller.method);
            changed = true;
        }
    }
    for (slot, icall) in pending {
        changed |= caller.pending_slots.entry(slot).or_default().insert(icall);
    }
    changed
}
