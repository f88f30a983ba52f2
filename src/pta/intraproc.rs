// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! One pass of the intraprocedural points-to transfer functions over the
//! SSA body of a method.

use std::collections::BTreeMap;

use log::*;

use crate::ir::{InstId, InstKind, MethodId, Operand, SsaMethod, VarId};
use crate::mir::call_site::CallType;
use crate::mir::method_info::MethodInfo;
use crate::pta::interproc;
use crate::pta::read_write::MAX_COPY_WORDS;
use crate::pts_set::abs_addr::{merge_in_set, shift_set, AbsAddr, AbsAddrSet, MergeKind};
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::uiv::UivTable;

/// How deep the definers of an offset operand are followed.
const MAX_OFFSET_DEPTH: usize = 8;

/// What the definers of an integer operand tell about its value.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OffsetShape {
    Const(i64),
    /// `base + k * stride` for an unknown `k`.
    Strided { base: i64, stride: u32 },
    Unknown,
}

/// The definer of `var`, looking through copies.
fn value_definer(ssa: &SsaMethod, var: VarId) -> Option<InstId> {
    let mut current = var;
    for _ in 0..MAX_OFFSET_DEPTH {
        let def = ssa.definer_of(current)?;
        match ssa.inst(def) {
            InstKind::Move { src: Operand::Var(src), .. } | InstKind::Conv { src: Operand::Var(src), .. } => {
                current = *src;
            }
            _ => return Some(def),
        }
    }
    None
}

pub fn offset_shape(ssa: &SsaMethod, op: Operand) -> OffsetShape {
    shape_at_depth(ssa, op, 0)
}

fn shape_at_depth(ssa: &SsaMethod, op: Operand, depth: usize) -> OffsetShape {
    let var = match op {
        Operand::Imm(imm) => return OffsetShape::Const(imm),
        Operand::Var(var) => var,
        _ => return OffsetShape::Unknown,
    };
    if depth >= MAX_OFFSET_DEPTH {
        return OffsetShape::Unknown;
    }
    let Some(def) = value_definer(ssa, var) else {
        return OffsetShape::Unknown;
    };
    match ssa.inst(def) {
        InstKind::Move { src: Operand::Imm(imm), .. } | InstKind::Conv { src: Operand::Imm(imm), .. } => {
            OffsetShape::Const(*imm)
        }
        InstKind::Add { lhs, rhs, .. } => {
            let (left, right) = (shape_at_depth(ssa, *lhs, depth + 1), shape_at_depth(ssa, *rhs, depth + 1));
            match (left, right) {
                (OffsetShape::Const(a), OffsetShape::Const(b)) => OffsetShape::Const(a.wrapping_add(b)),
                (OffsetShape::Strided { base, stride }, OffsetShape::Const(c))
                | (OffsetShape::Const(c), OffsetShape::Strided { base, stride }) => OffsetShape::Strided {
                    base: base.wrapping_add(c),
                    stride,
                },
                _ => OffsetShape::Unknown,
            }
        }
        InstKind::Mul { lhs, rhs, .. } => match (lhs, rhs) {
            (Operand::Imm(c), _) | (_, Operand::Imm(c)) if *c != 0 => OffsetShape::Strided {
                base: 0,
                stride: c.unsigned_abs().min(u32::MAX as u64) as u32,
            },
            _ => OffsetShape::Unknown,
        },
        InstKind::Shl { rhs: Operand::Imm(k), .. } if (1..32).contains(k) => OffsetShape::Strided {
            base: 0,
            stride: 2u32 << (*k - 1),
        },
        _ => OffsetShape::Unknown,
    }
}

/// Runs every transfer function of `info` once. `infos` holds the
/// other methods; a method calling itself sees the state it had before
/// this pass.
pub fn process_method(uivs: &mut UivTable, infos: &BTreeMap<MethodId, MethodInfo>, info: &mut MethodInfo) {
    let own_snapshot = if info.normal_callees().iter().any(|(_, callee)| *callee == info.method) {
        Some(info.clone())
    } else {
        None
    };
    let insts: Vec<InstId> = info.ssa.inst_ids().collect();
    for inst in insts {
        let kind = info.ssa.inst(inst).clone();
        process_inst(uivs, infos, own_snapshot.as_ref(), info, inst, &kind);
        if info.debug {
            if let Some(dst) = kind.dest() {
                let set = info.var_set(uivs, dst);
                info!("{:?} {:?}: {:?} = {:?}", info.method, inst, dst, set);
            }
        }
    }
}

fn process_inst(
    uivs: &mut UivTable,
    infos: &BTreeMap<MethodId, MethodInfo>,
    own_snapshot: Option<&MethodInfo>,
    info: &mut MethodInfo,
    inst: InstId,
    kind: &InstKind,
) {
    match kind {
        InstKind::Load { dst, base, offset, bytes } => {
            let addrs = shift_set(&info.read_operand(uivs, *base), *offset as i64);
            let mut result = AbsAddrSet::new();
            for addr in addrs.iter() {
                result.union(&info.read_memory(uivs, addr));
                if addr.is_whole_array() {
                    continue;
                }
                let words = (*bytes as i64 + 3) / 4;
                for word in 1..words.min(MAX_COPY_WORDS) {
                    let next = info.merge_map.apply_to_addr(addr.shifted(4 * word));
                    if let Some(set) = info.memory.get_pts(next) {
                        result.union(set);
                    }
                }
            }
            merge_in_set(uivs, &mut result, &mut info.merge_targets);
            info.add_to_var(uivs, *dst, &result);
        }
        InstKind::Store { base, offset, src, .. } => {
            let value = info.read_operand(uivs, *src);
            if value.is_empty() {
                return;
            }
            let addrs = shift_set(&info.read_operand(uivs, *base), *offset as i64);
            for addr in addrs.iter() {
                info.write_memory(addr, &value);
            }
        }
        InstKind::Add { dst, lhs, rhs } => {
            let result = process_add(uivs, info, *lhs, *rhs);
            info.add_to_var(uivs, *dst, &result);
        }
        InstKind::Sub { dst, lhs, rhs } => {
            let base = info.read_operand(uivs, *lhs);
            if base.is_empty() {
                return;
            }
            let result = match offset_shape(&info.ssa, *rhs) {
                OffsetShape::Const(c) => shift_set(&base, c.wrapping_neg()),
                _ => unknown_offset(info, &base),
            };
            info.add_to_var(uivs, *dst, &result);
        }
        InstKind::Phi { dst, srcs } => {
            let mut result = AbsAddrSet::new();
            for src in srcs {
                result.union(&info.read_operand(uivs, Operand::Var(*src)));
            }
            info.add_to_var(uivs, *dst, &result);
        }
        InstKind::Move { dst, src } | InstKind::Conv { dst, src } => {
            if let Operand::Var(src) = src {
                if info.shares_slot(*dst, *src) {
                    return;
                }
            }
            let set = info.read_operand(uivs, *src);
            info.add_to_var(uivs, *dst, &set);
        }
        InstKind::GetAddress { dst, var } => {
            let cell = info.escaped_cell(uivs, *var);
            let cell = info.merge_map.apply_to_addr(cell);
            info.memory.entry(cell);
            let mut set = AbsAddrSet::new();
            set.insert(cell);
            info.add_to_var(uivs, *dst, &set);
        }
        InstKind::Memcpy { dst, src, size } => {
            process_memcpy(uivs, info, *dst, *src, size.as_imm());
        }
        InstKind::InitMemory { dst, .. } => {
            let addrs = info.read_operand(uivs, *dst);
            for addr in addrs.iter() {
                if addr.is_whole_array() {
                    continue;
                }
                let from = if addr.offset == 0 {
                    AbsAddr::new(addr.uiv, 1)
                } else {
                    AbsAddr::new(addr.uiv, addr.offset.saturating_mul(2))
                };
                info.merge_map.add_mapping(uivs, from, addr);
            }
        }
        InstKind::Call { dst, args, .. } | InstKind::ICall { dst, args, .. } => {
            let sites = info.call_sites.get(&inst).cloned().unwrap_or_default();
            for site in sites {
                if site.call_type != CallType::Normal {
                    continue;
                }
                let callee = if site.callee == info.method {
                    own_snapshot
                } else {
                    infos.get(&site.callee)
                };
                match callee {
                    Some(callee) => {
                        interproc::process_call(uivs, info, callee, inst, *dst, args);
                    }
                    None => trace!("{:?}: no state for callee {:?} yet", info.method, site.callee),
                }
            }
        }
        // Integer arithmetic, comparisons, frees and allocations produce no
        // addresses here; allocation sites are set up once per method.
        InstKind::Mul { .. }
        | InstKind::Shl { .. }
        | InstKind::Arith { .. }
        | InstKind::MemCompare { .. }
        | InstKind::Alloc { .. }
        | InstKind::Free { .. }
        | InstKind::Ret { .. }
        | InstKind::Nop => {}
    }
}

/// Pointer plus integer. With two variables, each side is tried as the
/// pointer in turn.
fn process_add(uivs: &mut UivTable, info: &mut MethodInfo, lhs: Operand, rhs: Operand) -> AbsAddrSet {
    match (lhs, rhs) {
        (Operand::Symbol(symbol), Operand::Imm(imm)) | (Operand::Imm(imm), Operand::Symbol(symbol)) => {
            let offset = imm.clamp(i32::MIN as i64, i32::MAX as i64 - 1) as i32;
            let mut set = AbsAddrSet::new();
            set.insert(AbsAddr::new(uivs.global(symbol, offset), 0));
            return set;
        }
        (base, Operand::Imm(imm)) | (Operand::Imm(imm), base) => {
            return shift_set(&info.read_operand(uivs, base), imm);
        }
        _ => {}
    }
    let mut result = AbsAddrSet::new();
    for (base, offset) in [(lhs, rhs), (rhs, lhs)] {
        let base_set = info.read_operand(uivs, base);
        if base_set.is_empty() {
            continue;
        }
        let shape = offset_shape(&info.ssa, offset);
        let part = match shape {
            OffsetShape::Const(c) => shift_set(&base_set, c),
            OffsetShape::Strided { base: start, stride } => {
                for addr in base_set.iter() {
                    info.apply_stride(addr, stride);
                }
                shift_set(&base_set, start)
            }
            OffsetShape::Unknown => unknown_offset(info, &base_set),
        };
        result.union(&part);
    }
    result
}

/// An unknown offset folds every address to its object and marks the
/// object as a merge target.
fn unknown_offset(info: &mut MethodInfo, base: &AbsAddrSet) -> AbsAddrSet {
    let mut result = AbsAddrSet::new();
    for addr in base.iter() {
        if addr.is_whole_array() {
            result.insert(addr);
        } else {
            result.insert(AbsAddr::new(addr.uiv, 0));
            info.merge_targets.record(addr.uiv, MergeKind::Offsets);
        }
    }
    result
}

/// Copies the memory keys of every source object inside the copied range to
/// the matching offsets of every destination.
fn process_memcpy(uivs: &mut UivTable, info: &mut MethodInfo, dst: Operand, src: Operand, size: Option<i64>) {
    let sources = info.read_operand(uivs, src);
    let destinations = info.read_operand(uivs, dst);
    for source in sources.iter() {
        let keys: Vec<AbsAddr> = info
            .memory
            .keys_of_uiv(source.uiv)
            .filter(|key| match size {
                Some(n) if !source.is_whole_array() && !key.is_whole_array() => {
                    let start = source.offset as i64;
                    (key.offset as i64) >= start && (key.offset as i64) < start + n
                }
                _ => true,
            })
            .collect();
        for key in keys {
            let Some(value) = info.memory.get_pts(key).cloned() else {
                continue;
            };
            for destination in destinations.iter() {
                let target = if destination.is_whole_array() || key.is_whole_array() || source.is_whole_array() {
                    AbsAddr::new(destination.uiv, crate::pts_set::abs_addr::WHOLE_ARRAY_OFFSET)
                } else {
                    destination.shifted(key.offset as i64 - source.offset as i64)
                };
                // Copying an object onto itself must not grow its keys.
                if destination.uiv == source.uiv && !info.memory.contains_key(info.merge_map.apply_to_addr(target)) {
                    continue;
                }
                info.write_memory(target, &value);
            }
        }
    }
}
