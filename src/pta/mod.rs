// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Debug, Formatter, Result};
use std::time::Instant;

use log::*;

use self::func_ptr::FuncPtrMap;
use crate::graph::call_graph::CallGraph;
use crate::ir::{DepKind, DependenceSink, InstId, InstRef, MethodId, ProgramIr, VarId};
use crate::mir::analysis_context::AnalysisContext;
use crate::mir::call_site::{CallSite, CallType};
use crate::mir::method_info::MethodInfo;
use crate::pts_set::abs_addr::AbsAddrSet;
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::uiv::UivTable;
use crate::util::fixpoint::FixpointGuard;
use crate::util::mem_watcher::MemoryWatcher;
use crate::util::options::AnalysisOptions;
use crate::util::pta_statistics::{AnalysisStats, ProgramStats, VllpaStat};
use crate::util::results_dumper;

pub mod dependences;
pub mod func_ptr;
pub mod interproc;
pub mod intraproc;
pub mod read_write;

pub trait PointerAnalysis {
    fn analyze(&mut self);
}

/// Dependences and base definers of one run, held until the program can
/// be borrowed mutably again.
#[derive(Clone, Debug, Default)]
pub struct AnalysisMetadata {
    pub dependences: Vec<(MethodId, InstId, InstId, DepKind)>,
    pub base_definers: Vec<(MethodId, InstId, InstRef)>,
}

impl AnalysisMetadata {
    pub fn flush_into(&self, sink: &mut dyn DependenceSink) {
        for (method, from, to, kind) in &self.dependences {
            sink.add_dependence(*method, *from, *to, *kind);
        }
        for (method, inst, definer) in &self.base_definers {
            sink.add_base_definer(*method, *inst, *definer);
        }
    }
}

impl DependenceSink for AnalysisMetadata {
    fn add_dependence(&mut self, method: MethodId, from: InstId, to: InstId, kind: DepKind) {
        self.dependences.push((method, from, to, kind));
    }

    fn add_base_definer(&mut self, method: MethodId, inst: InstId, definer: InstRef) {
        self.base_definers.push((method, inst, definer));
    }
}

pub struct Vllpa<'pta, 'ir> {
    /// The analysis context
    pub(crate) acx: &'pta mut AnalysisContext<'ir>,
    /// Analysis state of every method reached from the entry
    pub(crate) infos: BTreeMap<MethodId, MethodInfo>,
    /// Call graph over normal call targets
    pub call_graph: CallGraph,
    /// Functions each indirect call may reach
    pub(crate) func_ptrs: FuncPtrMap,
    pub(crate) metadata: AnalysisMetadata,
    pub stats: AnalysisStats,
}

impl<'pta, 'ir> Debug for Vllpa<'pta, 'ir> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        "Vllpa".fmt(f)
    }
}

/// Constructor
impl<'pta, 'ir> Vllpa<'pta, 'ir> {
    pub fn new(acx: &'pta mut AnalysisContext<'ir>) -> Self {
        Vllpa {
            acx,
            infos: BTreeMap::new(),
            call_graph: CallGraph::new(),
            func_ptrs: FuncPtrMap::new(),
            metadata: AnalysisMetadata::default(),
            stats: AnalysisStats::default(),
        }
    }

    #[inline]
    fn ir(&self) -> &'ir dyn ProgramIr {
        self.acx.ir
    }

    #[inline]
    fn options(&self) -> &AnalysisOptions {
        &self.acx.analysis_options
    }

    pub fn method_info(&self, method: MethodId) -> Option<&MethodInfo> {
        self.infos.get(&method)
    }

    pub fn method_infos(&self) -> &BTreeMap<MethodId, MethodInfo> {
        &self.infos
    }

    pub fn uivs(&self) -> &UivTable {
        &self.acx.uivs
    }

    pub fn func_ptrs(&self) -> &FuncPtrMap {
        &self.func_ptrs
    }

    pub fn metadata(&self) -> &AnalysisMetadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> AnalysisMetadata {
        self.metadata
    }

    /// The addresses `var` of `method` may hold.
    pub fn points_to(&mut self, method: MethodId, var: VarId) -> AbsAddrSet {
        match self.infos.get(&method) {
            Some(info) => info.var_set(&mut self.acx.uivs, var),
            None => AbsAddrSet::new(),
        }
    }

    /// Builds the state of the entry method and everything it reaches
    /// through direct calls.
    pub fn initialize(&mut self) {
        let entry = self.acx.entry_point;
        self.build_infos(VecDeque::from([entry]));
    }

    fn build_infos(&mut self, mut worklist: VecDeque<MethodId>) {
        let ir = self.ir();
        while let Some(method) = worklist.pop_front() {
            if self.infos.contains_key(&method) {
                continue;
            }
            let Some(ssa) = ir.ssa_form(method) else {
                warn!("{} has no body to analyze", ir.method_name(method));
                continue;
            };
            let mut info = MethodInfo::new(ssa);
            info.debug = self.acx.is_debug_method(method);
            info.initialise(ir, &self.acx.analysis_options, &mut self.acx.uivs);
            self.call_graph.add_node(method);
            for (inst, callee) in info.normal_callees() {
                self.call_graph.add_edge(InstRef::new(method, inst), method, callee);
                worklist.push_back(callee);
            }
            if !self.options().calculate_function_pointers {
                for (inst, _) in info.icalls() {
                    let targets = ir.possible_callees(method, inst);
                    self.link_targets(&mut info, inst, &targets, &mut worklist);
                }
            }
            debug!("Built analysis state of {}", ir.method_name(method));
            self.infos.insert(method, info);
        }
    }

    /// Adds a call-site record for every target of the indirect call `inst`
    /// not linked yet. Returns the number of new records.
    fn link_targets(
        &mut self,
        info: &mut MethodInfo,
        inst: InstId,
        targets: &[MethodId],
        worklist: &mut VecDeque<MethodId>,
    ) -> usize {
        let ir = self.ir();
        let method = info.method;
        let mut linked = 0;
        for target in targets {
            if info.has_call_target(inst, *target) {
                continue;
            }
            let call_type = CallType::classify(ir, &self.acx.analysis_options, *target);
            match call_type {
                CallType::Normal => {
                    self.call_graph.add_edge(InstRef::new(method, inst), method, *target);
                    worklist.push_back(*target);
                }
                CallType::Library => {
                    info.contains_library_call = true;
                    if info.warned_icalls.insert(inst) {
                        warn!(
                            "Indirect call {:?} in {} may reach {}, which has no body",
                            inst,
                            ir.method_name(method),
                            ir.method_name(*target)
                        );
                    }
                }
                CallType::Known(_) => {}
            }
            info.call_sites
                .entry(inst)
                .or_default()
                .push(CallSite::new(inst, call_type, *target, true));
            linked += 1;
        }
        self.stats.linked_icall_targets += linked;
        linked
    }

    /// Runs the intraprocedural and interprocedural transfer functions of
    /// every method of `scc` until nothing changes.
    fn solve_scc(&mut self, scc: &[MethodId]) {
        let ir = self.ir();
        let mut guard = FixpointGuard::new("points-to", 350 * scc.len());
        loop {
            guard.tick(ir, scc);
            self.stats.points_to_rounds += 1;
            let mut changed = false;
            for method in scc {
                let Some(mut info) = self.infos.remove(method) else {
                    continue;
                };
                let merges = info.merge_map.len();
                info.snapshot();
                intraproc::process_method(&mut self.acx.uivs, &self.infos, &mut info);
                info.merge_all_sets(&self.acx.uivs);
                info.update_whole_arrays();
                info.update_initial_transfer_set(&self.acx.uivs);
                if info.memory_changed() {
                    info.mem_version += 1;
                }
                if cfg!(debug_assertions) && !info.is_monotone(&self.acx.uivs) {
                    warn!("A set of {} shrank outside of a merge", ir.method_name(*method));
                    self.stats.monotonicity_violations += 1;
                }
                changed |= info.changed() || info.merge_map.len() != merges;
                self.infos.insert(*method, info);
            }
            if !changed {
                break;
            }
        }
    }

    /// Identifies the functions reaching the indirect calls of `scc` and
    /// pushes unresolved slots from its callees up into it.
    fn resolve_function_pointers(&mut self, scc: &[MethodId]) {
        if !self.options().calculate_function_pointers {
            return;
        }
        let ir = self.ir();
        let mut guard = FixpointGuard::new("function-pointer", 350 * scc.len());
        loop {
            guard.tick(ir, scc);
            let mut changed = false;
            for method in scc {
                if let Some(info) = self.infos.get_mut(method) {
                    changed |= func_ptr::identify(&mut self.acx.uivs, info, &mut self.func_ptrs);
                }
            }
            for method in scc {
                let Some(mut info) = self.infos.remove(method) else {
                    continue;
                };
                let callees: BTreeSet<MethodId> = info.normal_callees().into_iter().map(|(_, c)| c).collect();
                for callee in callees {
                    if callee == *method {
                        let own = info.clone();
                        changed |= func_ptr::propagate(&self.acx.uivs, &mut info, &own, &mut self.func_ptrs);
                    } else if let Some(callee_info) = self.infos.get(&callee) {
                        changed |= func_ptr::propagate(&self.acx.uivs, &mut info, callee_info, &mut self.func_ptrs);
                    }
                }
                self.infos.insert(*method, info);
            }
            if !changed {
                break;
            }
        }
    }

    /// Links every resolved function that the IR also considers a possible
    /// target. Returns the number of new records and whether methods never
    /// seen before were reached.
    fn link_resolved_targets(&mut self) -> (usize, bool) {
        let ir = self.ir();
        let mut worklist = VecDeque::new();
        let mut linked = 0;
        let methods: Vec<MethodId> = self.infos.keys().copied().collect();
        for method in &methods {
            let Some(mut info) = self.infos.remove(method) else {
                continue;
            };
            for (inst, _) in info.icalls() {
                let Some(funcs) = self.func_ptrs.get(&InstRef::new(*method, inst)) else {
                    continue;
                };
                let possible: BTreeSet<MethodId> = ir.possible_callees(*method, inst).into_iter().collect();
                let targets: Vec<MethodId> = funcs.intersection(&possible).copied().collect();
                linked += self.link_targets(&mut info, inst, &targets, &mut worklist);
            }
            self.infos.insert(*method, info);
        }

        if linked == 0 {
            // Indirect calls nothing was resolved for may call anything
            // the IR allows.
            for method in &methods {
                let Some(mut info) = self.infos.remove(method) else {
                    continue;
                };
                for (inst, _) in info.icalls() {
                    if info.call_sites.get(&inst).map_or(true, Vec::is_empty) {
                        let targets = ir.possible_callees(*method, inst);
                        linked += self.link_targets(&mut info, inst, &targets, &mut worklist);
                    }
                }
                self.infos.insert(*method, info);
            }
        }

        let known = self.infos.len();
        self.build_infos(worklist);
        (linked, self.infos.len() > known)
    }

    /// The outer loop: points-to facts bottom-up over the SCCs, then
    /// function pointers, until no indirect call gains a target.
    pub fn solve(&mut self) {
        let ir = self.ir();
        let entry = self.acx.entry_point;
        let mut guard = FixpointGuard::new("outer", self.options().max_outer_iterations as usize);
        let mut discovered_methods = false;
        loop {
            if guard.iteration() == guard.bound() {
                if discovered_methods {
                    error!(
                        "Outer iteration bound too low: the last iteration still reached new methods (raise --max-outer-iterations)"
                    );
                } else {
                    error!("Outer iteration did not terminate: targets keep changing among known methods");
                }
            }
            guard.tick(ir, &[entry]);
            self.stats.outer_iterations += 1;
            let sccs = self.call_graph.scc_order(entry);
            self.stats.sccs = sccs.len();
            for scc in &sccs {
                self.solve_scc(scc);
                self.resolve_function_pointers(scc);
            }
            let (linked, discovered) = self.link_resolved_targets();
            debug!("Outer iteration {}: {} new call targets", guard.iteration(), linked);
            if linked == 0 {
                break;
            }
            discovered_methods = discovered;
        }
    }

    /// Read and write sets bottom-up over the SCCs. The transfer caches of
    /// a method are dropped once all of its callers are done.
    pub fn compute_read_write_sets(&mut self) {
        let ir = self.ir();
        let entry = self.acx.entry_point;
        let concrete = match self.infos.get(&entry) {
            Some(info) => read_write::concrete_values(&self.acx.uivs, info),
            None => read_write::ConcreteValues::new(),
        };
        let sccs = self.call_graph.scc_order(entry);
        for scc in &sccs {
            for method in scc {
                let callers = self.call_graph.callers_of(*method);
                if let Some(info) = self.infos.get_mut(method) {
                    info.num_callers = callers.iter().filter(|c| !scc.contains(*c)).count();
                }
            }
        }

        for scc in &sccs {
            let mut guard = FixpointGuard::new("read/write", (2 * scc.len()).max(20));
            loop {
                guard.tick(ir, scc);
                let mut changed = false;
                for method in scc {
                    let Some(mut info) = self.infos.remove(method) else {
                        continue;
                    };
                    changed |= read_write::compute_method(&mut self.acx.uivs, &self.infos, &concrete, &mut info);
                    self.infos.insert(*method, info);
                }
                if !changed {
                    break;
                }
            }

            for method in scc {
                if let Some(info) = self.infos.get(method) {
                    if info.debug {
                        info!("{}: reads {:?}", ir.method_name(*method), info.read_set.get());
                        info!("{}: writes {:?}", ir.method_name(*method), info.write_set.get());
                    }
                }
                for callee in self.call_graph.callees_of(*method) {
                    if scc.contains(&callee) {
                        continue;
                    }
                    if let Some(callee_info) = self.infos.get_mut(&callee) {
                        callee_info.callers_processed += 1;
                        if callee_info.callers_processed == callee_info.num_callers {
                            callee_info.release_transfer_state();
                        }
                    }
                }
            }
        }
    }

    pub fn compute_dependences(&mut self) {
        let ir = self.ir();
        let methods: Vec<MethodId> = self.infos.keys().copied().collect();
        for method in methods {
            dependences::compute_dependences(
                ir,
                &self.acx.uivs,
                &self.infos,
                method,
                &self.acx.analysis_options,
                &mut self.metadata,
                &mut self.stats.dependences,
            );
        }
    }

    pub fn finalize(&self) {
        if self.options().print_dependence_stats {
            let deps = &self.stats.dependences;
            println!("Memory instructions: {:4}", deps.memory_insts);
            println!("Library calls: {:4}", deps.library_insts);
            println!("MRAW: {:4}", deps.raw);
            println!("MWAR: {:4}", deps.war);
            println!("MWAW: {:4}", deps.waw);
        }

        // dump call graph, points-to results and read/write sets
        if let Err(e) = results_dumper::dump_results(self) {
            error!("Failed to dump results: {:?}", e);
        }

        if self.options().dump_stats {
            let pta_stat = VllpaStat::new(self);
            pta_stat.dump_stats();
        }
    }
}

impl<'pta, 'ir> PointerAnalysis for Vllpa<'pta, 'ir> {
    fn analyze(&mut self) {
        let now = Instant::now();
        let ir = self.ir();

        if self.options().print_program_stats {
            ProgramStats::collect(ir).print();
        }

        self.initialize();
        self.solve();
        info!(
            "Points-to facts converged after {} outer iterations ({})",
            self.stats.outer_iterations,
            humantime::format_duration(now.elapsed())
        );

        self.compute_read_write_sets();
        self.compute_dependences();

        let elapsed = now.elapsed();
        info!("VLLPA completed.");
        info!("Analysis time: {}", humantime::format_duration(elapsed).to_string());

        self.finalize();
    }
}

/// Analyzes `program` from its entry method and attaches the resulting
/// dependences and base definers to it. Returns `None` if no entry method
/// was found.
pub fn analyze_program<P: ProgramIr + DependenceSink>(program: &mut P, options: AnalysisOptions) -> Option<AnalysisStats> {
    let mut mem_watcher = MemoryWatcher::new();
    mem_watcher.start();

    let result = match AnalysisContext::new(&*program, options) {
        Some(mut acx) => {
            let mut pta = Vllpa::new(&mut acx);
            pta.analyze();
            let stats = pta.stats.clone();
            Some((stats, pta.into_metadata()))
        }
        None => {
            error!("AnalysisContext Initialization Failed");
            None
        }
    };

    mem_watcher.stop();

    let (stats, metadata) = result?;
    metadata.flush_into(program);
    Some(stats)
}
