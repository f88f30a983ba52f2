// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Moving facts across one call site.
//!
//! A callee is analyzed once, in terms of its own UIVs. At every call site
//! the caller maps those UIVs into its own address space: parameters become
//! the actual arguments, fields become whatever the caller's memory holds
//! at the mapped location, and every other UIV stands for itself. The map
//! is then used to pull the callee's returned addresses, memory effects and
//! merges into the caller.

use std::collections::BTreeSet;

use log::*;

use crate::ir::{InstId, Operand, VarId};
use crate::mir::method_info::MethodInfo;
use crate::pts_set::abs_addr::{merge_in_set, singleton, AbsAddr, AbsAddrSet, WHOLE_ARRAY_OFFSET};
use crate::pts_set::merge_map::Merge;
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::pt_data::PtData;
use crate::pts_set::uiv::{Uiv, UivId, UivTable};

/// The caller addresses standing for `addr` of the callee. UIVs missing from
/// the map stand for themselves.
pub fn map_addr(map: &PtData<UivId>, addr: AbsAddr) -> AbsAddrSet {
    let Some(targets) = map.get_pts(addr.uiv) else {
        return singleton(addr);
    };
    if addr.is_whole_array() {
        return targets
            .iter()
            .map(|target| AbsAddr::new(target.uiv, WHOLE_ARRAY_OFFSET))
            .collect();
    }
    targets.iter().map(|target| target.shifted(addr.offset as i64)).collect()
}

pub fn map_set(map: &PtData<UivId>, set: &AbsAddrSet) -> AbsAddrSet {
    let mut result = AbsAddrSet::new();
    for addr in set.iter() {
        result.union(&map_addr(map, addr));
    }
    result
}

/// Extends the caller's map of the callee's UIVs. UIVs are visited in
/// interning order, so the inner UIV of a field is always mapped before
/// the field itself. Returns true if the map changed.
pub fn update_uiv_map(uivs: &mut UivTable, caller: &mut MethodInfo, callee: &MethodInfo, args: &[Operand]) -> bool {
    let callee_id = callee.method;
    let mut map = caller.uiv_maps.remove(&callee_id).unwrap_or_default();
    let mut changed = false;
    for uiv in callee.local_uivs() {
        let kind = *uivs.get(uiv);
        let mapped = match kind {
            Uiv::Var { method, var } if method == callee_id && callee.ssa.is_param(var) => {
                match args.get(var.index()) {
                    Some(arg) => caller.read_operand(uivs, *arg),
                    None => AbsAddrSet::new(),
                }
            }
            Uiv::Field { inner, offset } => {
                let inner_targets: Vec<AbsAddr> = match map.get_pts(inner) {
                    Some(targets) => targets.iter().collect(),
                    None => vec![AbsAddr::new(inner, 0)],
                };
                let mut values = AbsAddrSet::new();
                for target in inner_targets {
                    values.union(&caller.read_memory(uivs, target.shifted(offset as i64)));
                }
                values
            }
            _ => singleton(AbsAddr::new(uiv, 0)),
        };
        changed |= map.union_pts_to(uiv, &mapped);
    }
    caller.uiv_maps.insert(callee_id, map);
    if changed {
        *caller.uiv_map_versions.entry(callee_id).or_insert(0) += 1;
    }
    changed
}

/// The callee memory keys a caller can observe: keys rooted in parameters,
/// globals, functions or streams, plus every key whose UIV is reachable
/// from the returned addresses or from an already observable key.
pub fn observable_keys(uivs: &mut UivTable, callee: &MethodInfo) -> Vec<AbsAddr> {
    let mut reachable: BTreeSet<UivId> = callee.returned_set(uivs).iter().map(|addr| addr.uiv).collect();
    let mut result: BTreeSet<AbsAddr> = BTreeSet::new();
    for key in callee.memory.keys() {
        if callee.is_local_uiv(uivs, key.uiv) {
            continue;
        }
        if callee.initial_transfer_set.contains(&key) || uivs.base_alloc(key.uiv).is_none() {
            result.insert(key);
        }
    }
    for key in &result {
        if let Some(set) = callee.memory.get_pts(*key) {
            reachable.extend(set.iter().map(|addr| addr.uiv));
        }
    }
    loop {
        let mut grew = false;
        for key in callee.memory.keys() {
            if result.contains(&key) || callee.is_local_uiv(uivs, key.uiv) {
                continue;
            }
            if uivs.constituents(key.uiv).iter().any(|uiv| reachable.contains(uiv)) {
                result.insert(key);
                if let Some(set) = callee.memory.get_pts(key) {
                    reachable.extend(set.iter().map(|addr| addr.uiv));
                }
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    result.into_iter().collect()
}

/// Unions the observable memory of `callee` into `caller`. Skipped when
/// neither the callee's memory nor the UIV map changed since the last
/// transfer.
pub fn transfer_memory(uivs: &mut UivTable, caller: &mut MethodInfo, callee: &MethodInfo, inst: InstId) -> bool {
    let callee_id = callee.method;
    for uiv in callee.uiv_def_map.keys() {
        caller.uiv_def_map.entry(*uiv).or_default().insert(inst);
    }

    let map_version = caller.uiv_map_versions.get(&callee_id).copied().unwrap_or(0);
    let version = (callee.mem_version, map_version);
    if caller.transfer_cache.get(&callee_id) == Some(&version) {
        return false;
    }

    let Some(map) = caller.uiv_maps.remove(&callee_id) else {
        return false;
    };
    let mut changed = false;
    for key in observable_keys(uivs, callee) {
        let Some(set) = callee.memory.get_pts(key) else {
            continue;
        };
        let mut values = caller.merge_map.apply_to_set(&map_set(&map, set));
        merge_in_set(uivs, &mut values, &mut caller.merge_targets);
        for target in map_addr(&map, key).iter() {
            changed |= caller.write_memory(target, &values);
        }
    }
    caller.uiv_maps.insert(callee_id, map);
    caller.transfer_cache.insert(callee_id, version);
    if changed {
        debug!("{:?}: memory of {:?} transferred at {:?}", caller.method, callee_id, inst);
    }
    changed
}

/// Maps the callee's generic merges and merge targets into the caller.
pub fn transfer_merges(uivs: &UivTable, caller: &mut MethodInfo, callee: &MethodInfo) {
    let Some(map) = caller.uiv_maps.get(&callee.method) else {
        return;
    };
    let mut uiv_merges = Vec::new();
    let mut offset_merges = Vec::new();
    for (from, merge) in callee.merge_map.iter() {
        if callee.is_local_uiv(uivs, from) {
            continue;
        }
        match merge {
            Merge::Uivs { to } => {
                let froms = map_addr(map, AbsAddr::new(from, 0));
                let tos = map_addr(map, AbsAddr::new(*to, 0));
                for f in froms.iter() {
                    for t in tos.iter() {
                        if f.uiv != t.uiv {
                            uiv_merges.push((f.uiv, t.uiv));
                        }
                    }
                }
            }
            Merge::Offsets { to, stride } => {
                for target in map_addr(map, AbsAddr::new(to.uiv, 0)).iter() {
                    let merged = if to.is_whole_array() {
                        AbsAddr::new(target.uiv, WHOLE_ARRAY_OFFSET)
                    } else {
                        let offset = (target.offset as i64 + to.offset as i64).rem_euclid(*stride as i64);
                        AbsAddr::new(target.uiv, offset as i32)
                    };
                    offset_merges.push((merged, *stride));
                }
            }
        }
    }
    let mut targets = Vec::new();
    for (uiv, kind) in callee.merge_targets.iter() {
        if callee.is_local_uiv(uivs, uiv) {
            continue;
        }
        for target in map_addr(map, AbsAddr::new(uiv, 0)).iter() {
            targets.push((target.uiv, kind));
        }
    }

    for (from, to) in uiv_merges {
        caller.merge_map.add_uiv_merge(uivs, from, to);
    }
    for (to, stride) in offset_merges {
        caller.merge_map.add_offset_merge(to, stride);
    }
    for (uiv, kind) in targets {
        caller.merge_targets.record(uiv, kind);
    }
}

/// The callee's returned addresses in the caller's space.
pub fn returned_to_caller(uivs: &mut UivTable, caller: &MethodInfo, callee: &MethodInfo) -> AbsAddrSet {
    let returned = callee.returned_set(uivs);
    match caller.uiv_maps.get(&callee.method) {
        Some(map) => map_set(map, &returned),
        None => returned,
    }
}

/// Everything the interprocedural step does for one resolved target of the
/// call `inst`. Returns true if the caller learned something.
pub fn process_call(
    uivs: &mut UivTable,
    caller: &mut MethodInfo,
    callee: &MethodInfo,
    inst: InstId,
    dst: Option<VarId>,
    args: &[Operand],
) -> bool {
    let mut changed = update_uiv_map(uivs, caller, callee, args);
    changed |= transfer_memory(uivs, caller, callee, inst);
    transfer_merges(uivs, caller, callee);
    if let Some(dst) = dst {
        let returned = returned_to_caller(uivs, caller, callee);
        changed |= caller.add_to_var(uivs, dst, &returned);
    }
    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::program::Program;
    use crate::ir::{InstKind, ProgramIr, SymbolId};
    use crate::util::options::AnalysisOptions;

    #[test]
    fn map_addr_test() {
        let mut uivs = UivTable::new(1);
        let g = uivs.global(SymbolId(0), 0);
        let h = uivs.global(SymbolId(1), 0);
        let mut map = PtData::new();
        map.union_pts_to(g, &singleton(AbsAddr::new(h, 4)));
        assert_eq!(map_addr(&map, AbsAddr::new(g, 8)), singleton(AbsAddr::new(h, 12)));
        assert_eq!(
            map_addr(&map, AbsAddr::new(g, WHOLE_ARRAY_OFFSET)),
            singleton(AbsAddr::new(h, WHOLE_ARRAY_OFFSET))
        );
        assert_eq!(map_addr(&map, AbsAddr::new(h, 0)), singleton(AbsAddr::new(h, 0)));
    }

    #[test]
    fn parameter_and_field_mapping_test() {
        let mut program = Program::new();
        let g = program.add_symbol("g");
        let callee = program.add_method("callee", 1);
        let main = program.add_method("main", 0);
        let body = program.body_mut(callee);
        let loaded = body.new_var();
        body.push(InstKind::Load { dst: loaded, base: Operand::Var(VarId(0)), offset: 8, bytes: 4 });

        let mut uivs = UivTable::new(1);
        let options = AnalysisOptions::default();
        let mut callee_info = MethodInfo::new(program.ssa_form(callee).unwrap());
        callee_info.initialise(&program, &options, &mut uivs);
        let p0 = uivs.var(callee, VarId(0));
        let field = uivs.field(p0, 8);
        callee_info.add_to_var(&mut uivs, loaded, &singleton(AbsAddr::new(field, 0)));

        let mut main_info = MethodInfo::new(program.ssa_form(main).unwrap());
        main_info.initialise(&program, &options, &mut uivs);
        let global = uivs.global(g, 0);
        let h = uivs.global(SymbolId(5), 0);
        main_info.write_memory(AbsAddr::new(global, 8), &singleton(AbsAddr::new(h, 0)));

        assert!(update_uiv_map(&mut uivs, &mut main_info, &callee_info, &[Operand::Symbol(g)]));
        let map = &main_info.uiv_maps[&callee];
        assert_eq!(map.get_pts(p0).unwrap(), &singleton(AbsAddr::new(global, 0)));
        assert_eq!(map.get_pts(field).unwrap(), &singleton(AbsAddr::new(h, 0)));
        assert_eq!(main_info.uiv_map_versions[&callee], 1);
        assert!(!update_uiv_map(&mut uivs, &mut main_info, &callee_info, &[Operand::Symbol(g)]));
    }
}
