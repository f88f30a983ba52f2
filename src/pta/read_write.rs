// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Read and write sets of instructions and methods.
//!
//! Once points-to facts have converged, every memory instruction is
//! summarised by the abstract addresses it may read and write. Calls take
//! the summaries of their callees (mapped into the caller) or the effects
//! of a known library call. Method summaries are the union over all
//! instructions and are computed bottom-up over the SCCs of the call graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{InstId, InstKind, MethodId, Operand};
use crate::mir::call_site::CallType;
use crate::mir::known_names::{Arg, Effect};
use crate::mir::method_info::MethodInfo;
use crate::pta::interproc::map_set;
use crate::pts_set::abs_addr::{merge_in_set, shift_set, AbsAddr, AbsAddrSet, WHOLE_ARRAY_OFFSET};
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::uiv::{SpecialStream, UivId, UivTable};

/// Constant copies longer than this many words are treated like copies of
/// unknown length.
pub(crate) const MAX_COPY_WORDS: i64 = 64;

/// Field UIV -> the addresses the entry method stores at the location the
/// field stands for.
pub type ConcreteValues = BTreeMap<UivId, AbsAddrSet>;

/// Collects the concrete values known to the entry method.
pub fn concrete_values(uivs: &UivTable, entry: &MethodInfo) -> ConcreteValues {
    let mut values = ConcreteValues::new();
    for (key, set) in entry.memory.iter() {
        if key.is_whole_array() || set.is_empty() {
            continue;
        }
        if let Some(field) = uivs.existing_field(key.uiv, key.offset) {
            if field != key.uiv {
                values.entry(field).or_default().union(set.get());
            }
        }
    }
    values
}

fn with_concrete_values(concrete: &ConcreteValues, set: &AbsAddrSet) -> AbsAddrSet {
    let mut result = set.clone();
    if concrete.is_empty() {
        return result;
    }
    for addr in set.iter() {
        if let Some(values) = concrete.get(&addr.uiv) {
            if addr.is_whole_array() {
                result.union(&values.iter().map(|v| AbsAddr::new(v.uiv, WHOLE_ARRAY_OFFSET)).collect());
            } else {
                result.union(&shift_set(values, addr.offset as i64));
            }
        }
    }
    result
}

/// The addresses in `set` together with every memory location reachable
/// from them in `info`.
fn reachable_from(info: &MethodInfo, uivs: &UivTable, set: &AbsAddrSet) -> AbsAddrSet {
    let mut result = set.clone();
    let mut seen: BTreeSet<UivId> = set.iter().map(|addr| addr.uiv).collect();
    let mut worklist: Vec<UivId> = seen.iter().copied().collect();
    while let Some(uiv) = worklist.pop() {
        for (key, values) in info.memory.iter() {
            if !uivs.is_prefix(uiv, key.uiv) {
                continue;
            }
            result.insert(key);
            for value in values.get().iter() {
                if seen.insert(value.uiv) {
                    worklist.push(value.uiv);
                }
            }
        }
    }
    result
}

#[derive(Default)]
struct Access {
    reads: AbsAddrSet,
    writes: AbsAddrSet,
}

/// Callee summaries visible while computing one method.
struct Summaries<'a> {
    infos: &'a BTreeMap<MethodId, MethodInfo>,
    /// The method's own sets before this round, for self-recursive calls.
    own: (AbsAddrSet, AbsAddrSet, bool),
}

fn access_of_memory(info: &MethodInfo, uivs: &mut UivTable, base: Operand, offset: i32) -> AbsAddrSet {
    let addrs = shift_set(&info.operand_set(uivs, base), offset as i64);
    info.merge_map.apply_to_set(&addrs)
}

fn memcpy_access(info: &MethodInfo, uivs: &mut UivTable, dst: Operand, src: Operand, size: Operand) -> Access {
    let mut access = Access::default();
    let sources = info.operand_set(uivs, src);
    let destinations = info.operand_set(uivs, dst);
    for source in sources.iter() {
        let key_offsets: Vec<i64> = info
            .memory
            .keys_of_uiv(source.uiv)
            .filter(|key| !key.is_whole_array())
            .map(|key| key.offset as i64 - source.offset as i64)
            .collect();
        let copied: Vec<i64> = match size.as_imm() {
            Some(n) if !source.is_whole_array() && n > 0 && n <= 4 * MAX_COPY_WORDS => {
                let mut offsets: BTreeSet<i64> = (0..n).step_by(4).collect();
                offsets.extend(key_offsets.into_iter().filter(|off| (0..n).contains(off)));
                offsets.into_iter().collect()
            }
            _ => {
                let mut offsets: BTreeSet<i64> = key_offsets.into_iter().collect();
                offsets.insert(0);
                offsets.into_iter().collect()
            }
        };
        for delta in copied {
            access.reads.insert(source.shifted(delta));
            for destination in destinations.iter() {
                access.writes.insert(destination.shifted(delta));
            }
        }
    }
    access
}

fn args_of(args: &[Operand], arg: Arg) -> (&[Operand], bool) {
    match arg {
        Arg::Accessed(i) => (args.get(i..i + 1).unwrap_or(&[]), false),
        Arg::Reachable(i) => (args.get(i..i + 1).unwrap_or(&[]), true),
        Arg::AccessedFrom(i) => (args.get(i..).unwrap_or(&[]), false),
        Arg::ReachableFrom(i) => (args.get(i..).unwrap_or(&[]), true),
    }
}

fn known_call_access(info: &MethodInfo, uivs: &mut UivTable, effects: &[Effect], args: &[Operand]) -> Access {
    let mut access = Access::default();
    let addresses = |arg: Arg, uivs: &mut UivTable| {
        let (operands, reachable) = args_of(args, arg);
        let mut set = AbsAddrSet::new();
        for op in operands {
            set.union(&info.operand_set(uivs, *op));
        }
        if reachable {
            set = reachable_from(info, uivs, &set);
        }
        set
    };
    for effect in effects {
        match *effect {
            Effect::Read(arg) => {
                let set = addresses(arg, uivs);
                access.reads.union(&set);
            }
            Effect::Write(arg) => {
                let set = addresses(arg, uivs);
                access.writes.union(&set);
            }
            Effect::ReadWrite(arg) => {
                let set = addresses(arg, uivs);
                access.reads.union(&set);
                access.writes.union(&set);
            }
            Effect::Stream(stream) => {
                let addr = AbsAddr::new(uivs.special(stream), 0);
                access.reads.insert(addr);
                access.writes.insert(addr);
            }
            Effect::FdStream(i) => {
                let streams: Vec<SpecialStream> = match args.get(i).and_then(Operand::as_imm) {
                    Some(fd) => SpecialStream::from_fd(fd).into_iter().collect(),
                    None => SpecialStream::ALL.to_vec(),
                };
                for stream in streams {
                    let addr = AbsAddr::new(uivs.special(stream), 0);
                    access.reads.insert(addr);
                    access.writes.insert(addr);
                }
            }
        }
    }
    access
}

fn call_access(
    info: &mut MethodInfo,
    uivs: &mut UivTable,
    summaries: &Summaries,
    inst: InstId,
    args: &[Operand],
) -> Access {
    let mut access = Access::default();
    let sites = info.call_sites.get(&inst).cloned().unwrap_or_default();
    for site in sites {
        match site.call_type {
            CallType::Normal => {
                let (reads, writes, library) = if site.callee == info.method {
                    summaries.own.clone()
                } else {
                    match summaries.infos.get(&site.callee) {
                        Some(callee) => {
                            let table: &UivTable = uivs;
                            let visible = |set: &AbsAddrSet| -> AbsAddrSet {
                                set.iter().filter(|addr| !callee.is_local_uiv(table, addr.uiv)).collect()
                            };
                            (
                                visible(callee.read_set.get()),
                                visible(callee.write_set.get()),
                                callee.contains_library_call,
                            )
                        }
                        None => continue,
                    }
                };
                info.contains_library_call |= library;
                match info.uiv_maps.get(&site.callee) {
                    Some(map) => {
                        access.reads.union(&map_set(map, &reads));
                        access.writes.union(&map_set(map, &writes));
                    }
                    None => {
                        access.reads.union(&reads);
                        access.writes.union(&writes);
                    }
                }
            }
            CallType::Known(known) => {
                let known_access = known_call_access(info, uivs, &known.effects(), args);
                access.reads.union(&known_access.reads);
                access.writes.union(&known_access.writes);
            }
            CallType::Library => {
                info.contains_library_call = true;
            }
        }
    }
    access
}

fn inst_access(info: &mut MethodInfo, uivs: &mut UivTable, summaries: &Summaries, inst: InstId) -> Access {
    let kind = info.ssa.inst(inst).clone();
    let mut access = Access::default();
    match &kind {
        InstKind::Load { base, offset, .. } => {
            access.reads = access_of_memory(info, uivs, *base, *offset);
        }
        InstKind::Store { base, offset, .. } => {
            access.writes = access_of_memory(info, uivs, *base, *offset);
        }
        InstKind::InitMemory { dst, .. } => {
            access.writes = access_of_memory(info, uivs, *dst, 0);
        }
        InstKind::Free { ptr } => {
            access.writes = access_of_memory(info, uivs, *ptr, 0);
        }
        InstKind::Memcpy { dst, src, size } => {
            access = memcpy_access(info, uivs, *dst, *src, *size);
        }
        InstKind::MemCompare { lhs, rhs, .. } => {
            access.reads = access_of_memory(info, uivs, *lhs, 0);
            access.reads.union(&access_of_memory(info, uivs, *rhs, 0));
        }
        InstKind::Call { args, .. } | InstKind::ICall { args, .. } => {
            access = call_access(info, uivs, summaries, inst, args);
        }
        _ if info.ssa.may_access_heap(inst) => {
            for var in kind.operands().iter().filter_map(Operand::as_var) {
                if info.is_escaped(var) {
                    access.reads.insert(info.escaped_cell(uivs, var));
                }
            }
            if let Some(dst) = kind.dest() {
                if info.is_escaped(dst) {
                    access.writes.insert(info.escaped_cell(uivs, dst));
                }
            }
        }
        _ => {}
    }
    access
}

/// Recomputes the read and write sets of every instruction of `info` and
/// grows the method summary. Returns true if the summary changed.
pub fn compute_method(
    uivs: &mut UivTable,
    infos: &BTreeMap<MethodId, MethodInfo>,
    concrete: &ConcreteValues,
    info: &mut MethodInfo,
) -> bool {
    let summaries = Summaries {
        infos,
        own: (
            info.read_set.get().clone(),
            info.write_set.get().clone(),
            info.contains_library_call,
        ),
    };
    let library_before = info.contains_library_call;
    let mut method_reads = AbsAddrSet::new();
    let mut method_writes = AbsAddrSet::new();
    let insts: Vec<InstId> = info.ssa.inst_ids().collect();
    for inst in insts {
        let access = inst_access(info, uivs, &summaries, inst);
        let reads = with_concrete_values(concrete, &access.reads);
        let writes = with_concrete_values(concrete, &access.writes);
        method_reads.union(&reads);
        method_writes.union(&writes);
        if !reads.is_empty() {
            info.inst_reads.insert(inst, reads);
        }
        if !writes.is_empty() {
            info.inst_writes.insert(inst, writes);
        }
    }

    info.read_insts.clear();
    info.write_insts.clear();
    for (inst, set) in &info.inst_reads {
        for addr in set.iter() {
            info.read_insts.entry(addr).or_default().insert(*inst);
        }
    }
    for (inst, set) in &info.inst_writes {
        for addr in set.iter() {
            info.write_insts.entry(addr).or_default().insert(*inst);
        }
    }

    info.read_set.snapshot();
    info.write_set.snapshot();
    let method_reads = info.merge_map.apply_to_set(&method_reads);
    let method_writes = info.merge_map.apply_to_set(&method_writes);
    info.read_set.union(&method_reads);
    info.write_set.union(&method_writes);
    merge_in_set(uivs, info.read_set.get_mut(), &mut info.merge_targets);
    merge_in_set(uivs, info.write_set.get_mut(), &mut info.merge_targets);

    info.read_set.changed() || info.write_set.changed() || library_before != info.contains_library_call
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::program::Program;
    use crate::ir::{ProgramIr, SymbolId};
    use crate::pta::intraproc::process_method;
    use crate::pts_set::abs_addr::singleton;
    use crate::util::options::AnalysisOptions;

    fn info_of(program: &Program, method: MethodId, uivs: &mut UivTable) -> MethodInfo {
        let mut info = MethodInfo::new(program.ssa_form(method).unwrap());
        info.initialise(program, &AnalysisOptions::default(), uivs);
        let infos = BTreeMap::new();
        for _ in 0..3 {
            process_method(uivs, &infos, &mut info);
            info.merge_all_sets(uivs);
        }
        info
    }

    #[test]
    fn memcpy_access_test() {
        let mut program = Program::new();
        let g = program.add_symbol("g");
        let main = program.add_method("main", 0);
        let body = program.body_mut(main);
        let buf = body.new_var();
        body.push(InstKind::Alloc { dst: buf, size: Operand::Imm(16) });
        let copy = body.push(InstKind::Memcpy { dst: Operand::Var(buf), src: Operand::Symbol(g), size: Operand::Imm(16) });

        let mut uivs = UivTable::new(1);
        let mut info = info_of(&program, main, &mut uivs);
        let infos = BTreeMap::new();
        assert!(compute_method(&mut uivs, &infos, &ConcreteValues::new(), &mut info));
        let global = uivs.global(g, 0);
        let reads = &info.inst_reads[&copy];
        for offset in [0, 4, 8, 12] {
            assert!(reads.contains(AbsAddr::new(global, offset)));
        }
        assert!(!reads.contains(AbsAddr::new(global, 16)));
        assert_eq!(info.inst_writes[&copy].count(), 4);
        assert!(!compute_method(&mut uivs, &infos, &ConcreteValues::new(), &mut info));
    }

    #[test]
    fn known_call_access_test() {
        let mut program = Program::new();
        let g = program.add_symbol("g");
        let h = program.add_symbol("h");
        let strcpy = program.add_library("System.SByte* libstd.strcpy(System.SByte* s1,System.SByte* s2)", 2);
        let puts = program.add_library("System.Int32 libstd.puts(System.SByte* s)", 1);
        let main = program.add_method("main", 0);
        let body = program.body_mut(main);
        let copy = body.push(InstKind::Call {
            dst: None,
            callee: strcpy,
            args: vec![Operand::Symbol(g), Operand::Symbol(h)],
        });
        let print = body.push(InstKind::Call { dst: None, callee: puts, args: vec![Operand::Symbol(h)] });

        let mut uivs = UivTable::new(1);
        let mut info = info_of(&program, main, &mut uivs);
        compute_method(&mut uivs, &BTreeMap::new(), &ConcreteValues::new(), &mut info);
        let (global_g, global_h) = (uivs.global(g, 0), uivs.global(h, 0));
        assert_eq!(info.inst_reads[&copy], singleton(AbsAddr::new(global_h, 0)));
        assert_eq!(info.inst_writes[&copy], singleton(AbsAddr::new(global_g, 0)));
        let stdout = AbsAddr::new(uivs.special(SpecialStream::Stdout), 0);
        assert!(info.inst_writes[&print].contains(stdout));
        assert!(info.inst_reads[&print].contains(AbsAddr::new(global_h, 0)));
        assert!(!info.contains_library_call);
    }

    #[test]
    fn concrete_values_test() {
        let mut program = Program::new();
        let main = program.add_method("main", 0);
        let mut uivs = UivTable::new(1);
        let mut info = info_of(&program, main, &mut uivs);
        let g = uivs.global(SymbolId(0), 0);
        let h = uivs.global(SymbolId(1), 0);
        let field = uivs.field(g, 8);
        info.write_memory(AbsAddr::new(g, 8), &singleton(AbsAddr::new(h, 0)));
        let concrete = concrete_values(&uivs, &info);
        assert_eq!(concrete[&field], singleton(AbsAddr::new(h, 0)));
        let widened = with_concrete_values(&concrete, &singleton(AbsAddr::new(field, 4)));
        assert!(widened.contains(AbsAddr::new(h, 4)));
        assert!(widened.contains(AbsAddr::new(field, 4)));
    }
}
