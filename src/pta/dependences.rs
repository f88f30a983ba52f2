// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Memory dependences between the instructions of one method.
//!
//! Two instructions depend on each other when the read or write set of one
//! overlaps the write set of the other. Calls into unknown library code,
//! directly or somewhere below, conflict with every memory instruction of
//! the method.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{DepKind, DependenceSink, InstId, InstKind, InstRef, MethodId, ProgramIr};
use crate::mir::call_site::CallType;
use crate::mir::method_info::MethodInfo;
use crate::pts_set::abs_addr::{sets_overlap, AbsAddrSet, PrefixCheck};
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::uiv::{Uiv, UivTable};
use crate::util::options::AnalysisOptions;

#[derive(Default, Debug, Clone, Copy)]
pub struct DependenceStats {
    pub memory_insts: usize,
    pub library_insts: usize,
    pub pruned_by_type: usize,
    pub raw: usize,
    pub war: usize,
    pub waw: usize,
    pub base_definers: usize,
}

impl DependenceStats {
    pub fn total(&self) -> usize {
        self.raw + self.war + self.waw
    }

    fn count(&mut self, kind: DepKind) {
        if kind.contains(DepKind::MRAW) {
            self.raw += 1;
        }
        if kind.contains(DepKind::MWAR) {
            self.war += 1;
        }
        if kind.contains(DepKind::MWAW) {
            self.waw += 1;
        }
    }
}

/// How a library call conflicts with an instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Class {
    Reads,
    Writes,
    Other,
}

struct MemoryInst<'a> {
    inst: InstId,
    origin: InstId,
    kind: &'a InstKind,
    reads: Option<&'a AbsAddrSet>,
    writes: Option<&'a AbsAddrSet>,
    class: Class,
    library: bool,
    prefix_capable: bool,
    normal_call: bool,
}

fn calls_library(infos: &BTreeMap<MethodId, MethodInfo>, info: &MethodInfo, inst: InstId) -> bool {
    let Some(sites) = info.call_sites.get(&inst) else {
        return false;
    };
    sites.iter().any(|site| match site.call_type {
        CallType::Library => true,
        CallType::Normal if site.callee == info.method => info.contains_library_call,
        CallType::Normal => infos.get(&site.callee).map_or(false, |callee| callee.contains_library_call),
        CallType::Known(_) => false,
    })
}

fn memory_insts<'a>(infos: &BTreeMap<MethodId, MethodInfo>, info: &'a MethodInfo) -> Vec<MemoryInst<'a>> {
    let mut result = Vec::new();
    for inst in info.ssa.inst_ids() {
        let Some(origin) = info.ssa.origin_of(inst) else {
            continue;
        };
        let kind = info.ssa.inst(inst);
        let reads = info.inst_reads.get(&inst);
        let writes = info.inst_writes.get(&inst);
        let library = kind.is_call() && calls_library(infos, info, inst);
        if reads.is_none() && writes.is_none() && !library {
            continue;
        }
        let sites = info.call_sites.get(&inst).map(Vec::as_slice).unwrap_or(&[]);
        let class = match kind {
            InstKind::Load { .. } | InstKind::MemCompare { .. } => Class::Reads,
            InstKind::Store { .. } | InstKind::InitMemory { .. } | InstKind::Free { .. } => Class::Writes,
            _ => Class::Other,
        };
        let prefix_capable = matches!(kind, InstKind::InitMemory { .. } | InstKind::Free { .. })
            || sites.iter().any(|site| matches!(site.call_type, CallType::Known(_)));
        let normal_call = sites.iter().any(|site| site.call_type.is_normal());
        result.push(MemoryInst {
            inst,
            origin,
            kind,
            reads,
            writes,
            class,
            library,
            prefix_capable,
            normal_call,
        });
    }
    result
}

fn library_conflict(lib: &MemoryInst, other: &MemoryInst) -> (DepKind, DepKind) {
    if lib.inst == other.inst || other.library {
        return (DepKind::ALL, DepKind::ALL);
    }
    match other.class {
        Class::Reads => (DepKind::MWAR, DepKind::MRAW),
        Class::Writes => (DepKind::MRAW | DepKind::MWAW, DepKind::MWAR | DepKind::MWAW),
        Class::Other => (DepKind::ALL, DepKind::ALL),
    }
}

fn overlap(uivs: &UivTable, a: Option<&AbsAddrSet>, b: Option<&AbsAddrSet>, check_merge: bool, prefix: PrefixCheck) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => sets_overlap(uivs, a, b, check_merge, prefix),
        _ => false,
    }
}

fn is_load_or_store(kind: &InstKind) -> bool {
    matches!(kind, InstKind::Load { .. } | InstKind::Store { .. })
}

/// Whether static types rule out any aliasing between two loads/stores.
fn types_disjoint(ir: &dyn ProgramIr, method: MethodId, first: &MemoryInst, second: &MemoryInst) -> bool {
    if !is_load_or_store(first.kind) || !is_load_or_store(second.kind) {
        return false;
    }
    match (ir.access_type(method, first.origin), ir.access_type(method, second.origin)) {
        (Some(a), Some(b)) => !ir.types_assignable(a, b) && !ir.types_assignable(b, a),
        _ => false,
    }
}

/// Computes the dependences of `method` and hands them to `sink`.
pub fn compute_dependences(
    ir: &dyn ProgramIr,
    uivs: &UivTable,
    infos: &BTreeMap<MethodId, MethodInfo>,
    method: MethodId,
    options: &AnalysisOptions,
    sink: &mut dyn DependenceSink,
    stats: &mut DependenceStats,
) {
    let Some(info) = infos.get(&method) else {
        return;
    };
    let insts = memory_insts(infos, info);
    stats.memory_insts += insts.len();
    stats.library_insts += insts.iter().filter(|mi| mi.library).count();

    let mut kinds: BTreeMap<(InstId, InstId), DepKind> = BTreeMap::new();
    let mut add = |from: InstId, to: InstId, kind: DepKind| {
        *kinds.entry((from, to)).or_default() |= kind;
    };

    for (i, first) in insts.iter().enumerate() {
        for second in &insts[i..] {
            if first.library || second.library {
                let (lib, other) = if first.library { (first, second) } else { (second, first) };
                let (lib_to_other, other_to_lib) = library_conflict(lib, other);
                add(lib.origin, other.origin, lib_to_other);
                add(other.origin, lib.origin, other_to_lib);
                continue;
            }
            if options.use_type_infos && types_disjoint(ir, method, first, second) {
                stats.pruned_by_type += 1;
                continue;
            }
            let check_merge = !(first.kind.is_field_access() || second.kind.is_field_access());
            let prefix = if first.normal_call || second.normal_call {
                PrefixCheck::Both
            } else {
                match (first.prefix_capable, second.prefix_capable) {
                    (true, true) => PrefixCheck::Both,
                    (true, false) => PrefixCheck::First,
                    (false, true) => PrefixCheck::Second,
                    (false, false) => PrefixCheck::None,
                }
            };
            if overlap(uivs, first.reads, second.writes, check_merge, prefix) {
                add(first.origin, second.origin, DepKind::MRAW);
                add(second.origin, first.origin, DepKind::MWAR);
            }
            if overlap(uivs, first.writes, second.reads, check_merge, prefix) {
                add(first.origin, second.origin, DepKind::MWAR);
                add(second.origin, first.origin, DepKind::MRAW);
            }
            if overlap(uivs, first.writes, second.writes, check_merge, prefix) {
                add(first.origin, second.origin, DepKind::MWAW);
                add(second.origin, first.origin, DepKind::MWAW);
            }
        }
    }

    for ((from, to), kind) in kinds {
        stats.count(kind);
        sink.add_dependence(method, from, to, kind);
    }

    if options.provide_memory_allocators {
        stats.base_definers += add_base_definers(uivs, info, &insts, sink);
    }
}

/// Attaches to every load and store the instructions defining the
/// allocations it may access.
fn add_base_definers(uivs: &UivTable, info: &MethodInfo, insts: &[MemoryInst], sink: &mut dyn DependenceSink) -> usize {
    let mut added = 0;
    for mi in insts.iter().filter(|mi| is_load_or_store(mi.kind)) {
        let accessed = mi.reads.or(mi.writes);
        let Some(accessed) = accessed else {
            continue;
        };
        let mut definers = BTreeSet::new();
        for addr in accessed.iter() {
            if !matches!(uivs.get(addr.uiv), Uiv::Alloc { .. }) {
                continue;
            }
            if let Some(defs) = info.uiv_def_map.get(&addr.uiv) {
                definers.extend(defs.iter().filter_map(|def| info.ssa.origin_of(*def)));
            }
        }
        for definer in definers {
            sink.add_base_definer(info.method, mi.origin, InstRef::new(info.method, definer));
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::program::Program;
    use crate::ir::{Operand, TypeTag};
    use crate::pta::intraproc::process_method;
    use crate::pta::read_write::{compute_method, ConcreteValues};

    fn analyze_single(program: &mut Program, method: MethodId, options: &AnalysisOptions) -> DependenceStats {
        let mut uivs = UivTable::new(1);
        let mut info = MethodInfo::new(program.ssa_form(method).unwrap());
        info.initialise(&*program, options, &mut uivs);
        let mut infos = BTreeMap::new();
        for _ in 0..3 {
            process_method(&mut uivs, &infos, &mut info);
            info.merge_all_sets(&uivs);
        }
        compute_method(&mut uivs, &infos, &ConcreteValues::new(), &mut info);
        infos.insert(method, info);
        let mut stats = DependenceStats::default();
        let ir = program.clone();
        compute_dependences(&ir, &uivs, &infos, method, options, program, &mut stats);
        stats
    }

    #[test]
    fn store_load_test() {
        let mut program = Program::new();
        let g = program.add_symbol("g");
        let main = program.add_method("main", 0);
        let body = program.body_mut(main);
        let x = body.new_var();
        let store = body.push(InstKind::Store { base: Operand::Symbol(g), offset: 0, src: Operand::Imm(1), bytes: 4 });
        let load = body.push(InstKind::Load { dst: x, base: Operand::Symbol(g), offset: 0, bytes: 4 });

        analyze_single(&mut program, main, &AnalysisOptions::default());
        assert!(program.dependence(main, load, store).contains(DepKind::MRAW));
        assert!(program.dependence(main, store, load).contains(DepKind::MWAR));
        assert!(program.dependence(main, store, store).contains(DepKind::MWAW));
        assert!(program.dependence(main, load, load).is_empty());
    }

    #[test]
    fn unassignable_types_test() {
        let mut program = Program::new();
        let g = program.add_symbol("g");
        let main = program.add_method("main", 0);
        let body = program.body_mut(main);
        let first = body.push(InstKind::Store { base: Operand::Symbol(g), offset: 0, src: Operand::Imm(1), bytes: 4 });
        let second = body.push(InstKind::Store { base: Operand::Symbol(g), offset: 0, src: Operand::Imm(2), bytes: 4 });
        program.set_access_type(main, first, TypeTag(1));
        program.set_access_type(main, second, TypeTag(2));

        let stats = analyze_single(&mut program, main, &AnalysisOptions::default());
        assert!(stats.pruned_by_type >= 1);
        assert!(program.dependence(main, first, second).is_empty());
        assert!(program.dependence(main, second, first).is_empty());

        // Without type infos the stores alias.
        let options = AnalysisOptions {
            use_type_infos: false,
            ..AnalysisOptions::default()
        };
        let stats = analyze_single(&mut program, main, &options);
        assert_eq!(stats.pruned_by_type, 0);
        assert!(program.dependence(main, first, second).contains(DepKind::MWAW));
    }

    #[test]
    fn library_call_test() {
        let mut program = Program::new();
        let g = program.add_symbol("g");
        let unknown = program.add_library("System.Void libstd.mystery()", 0);
        let main = program.add_method("main", 0);
        let body = program.body_mut(main);
        let x = body.new_var();
        let load = body.push(InstKind::Load { dst: x, base: Operand::Symbol(g), offset: 0, bytes: 4 });
        let call = body.push(InstKind::Call { dst: None, callee: unknown, args: vec![] });

        let stats = analyze_single(&mut program, main, &AnalysisOptions::default());
        assert_eq!(stats.library_insts, 1);
        assert_eq!(program.dependence(main, call, load), DepKind::MWAR);
        assert_eq!(program.dependence(main, load, call), DepKind::MRAW);
        assert_eq!(program.dependence(main, call, call), DepKind::ALL);
    }

    #[test]
    fn base_definer_test() {
        let mut program = Program::new();
        let main = program.add_method("main", 0);
        let body = program.body_mut(main);
        let p = body.new_var();
        let alloc = body.push(InstKind::Alloc { dst: p, size: Operand::Imm(8) });
        let store = body.push(InstKind::Store { base: Operand::Var(p), offset: 0, src: Operand::Imm(0), bytes: 4 });

        let options = AnalysisOptions {
            provide_memory_allocators: true,
            ..AnalysisOptions::default()
        };
        let stats = analyze_single(&mut program, main, &options);
        assert_eq!(stats.base_definers, 1);
        assert_eq!(program.base_definers(main, store), vec![InstRef::new(main, alloc)]);
    }
}
