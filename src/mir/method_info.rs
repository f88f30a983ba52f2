// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The analysis state of one method.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::*;

use crate::ir::{InstId, InstKind, InstRef, MethodId, Operand, ProgramIr, SsaMethod, VarId};
use crate::mir::call_site::{CallSite, CallType};
use crate::mir::known_names::{self, KnownCall};
use crate::pts_set::abs_addr::{merge_in_set, singleton, AbsAddr, AbsAddrSet, MergeKind, MergeTargets};
use crate::pts_set::merge_map::MergeMap;
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::pt_data::{MappedSet, PtData};
use crate::pts_set::uiv::{SpecialStream, Uiv, UivId, UivTable};
use crate::util::options::AnalysisOptions;

#[derive(Clone)]
pub struct MethodInfo {
    pub method: MethodId,
    /// The SSA clone of the method. Its origin map leads back to the
    /// instructions that dependences are attached to.
    pub ssa: SsaMethod,

    /// Variable -> index into `slots`. Unescaped variables defined by a
    /// move or conversion share the slot of their source.
    var_slot: Vec<usize>,
    slots: Vec<MappedSet>,

    /// Abstract address -> what may be stored there. Escaped variables live
    /// here at `(Var(m, v), 0)`.
    pub memory: PtData<AbsAddr>,

    /// Per callee, the callee's UIVs mapped into this method.
    pub uiv_maps: BTreeMap<MethodId, PtData<UivId>>,
    /// Bumped whenever the UIV map of a callee changes.
    pub uiv_map_versions: BTreeMap<MethodId, u64>,

    pub merge_map: MergeMap,
    pub merge_targets: MergeTargets,

    /// The targets linked so far for every call instruction.
    pub call_sites: BTreeMap<InstId, Vec<CallSite>>,

    /// Allocation UIVs and the instructions defining them, including calls
    /// that bring them in from callees.
    pub uiv_def_map: BTreeMap<UivId, BTreeSet<InstId>>,
    /// Memory keys that callers must always receive.
    pub initial_transfer_set: BTreeSet<AbsAddr>,

    pub mem_modified: bool,
    pub mem_version: u64,
    /// Callee -> (callee memory version, UIV map version) of the last
    /// memory transfer.
    pub transfer_cache: HashMap<MethodId, (u64, u64)>,

    /// Addresses that must be resolved to functions in a caller, with the
    /// indirect calls they stand for.
    pub pending_slots: BTreeMap<AbsAddr, BTreeSet<InstRef>>,
    /// Results of library calls returning a pointer. Their UIVs name
    /// memory outside the method, so callers see them.
    pub library_results: BTreeSet<VarId>,

    pub read_set: MappedSet,
    pub write_set: MappedSet,
    pub inst_reads: BTreeMap<InstId, AbsAddrSet>,
    pub inst_writes: BTreeMap<InstId, AbsAddrSet>,
    pub read_insts: BTreeMap<AbsAddr, BTreeSet<InstId>>,
    pub write_insts: BTreeMap<AbsAddr, BTreeSet<InstId>>,

    pub num_callers: usize,
    pub callers_processed: usize,
    pub contains_library_call: bool,
    /// Indirect calls whose possible targets without a body were reported.
    pub warned_icalls: BTreeSet<InstId>,
    /// Print per-instruction details.
    pub debug: bool,
}

impl MethodInfo {
    pub fn new(ssa: SsaMethod) -> Self {
        let num_vars = ssa.num_vars.max(ssa.num_params);
        let mut info = MethodInfo {
            method: ssa.method,
            ssa,
            var_slot: (0..num_vars).collect(),
            slots: vec![MappedSet::new(); num_vars],
            memory: PtData::new(),
            uiv_maps: BTreeMap::new(),
            uiv_map_versions: BTreeMap::new(),
            merge_map: MergeMap::new(),
            merge_targets: MergeTargets::new(),
            call_sites: BTreeMap::new(),
            uiv_def_map: BTreeMap::new(),
            initial_transfer_set: BTreeSet::new(),
            mem_modified: false,
            mem_version: 0,
            transfer_cache: HashMap::new(),
            pending_slots: BTreeMap::new(),
            library_results: BTreeSet::new(),
            read_set: MappedSet::new(),
            write_set: MappedSet::new(),
            inst_reads: BTreeMap::new(),
            inst_writes: BTreeMap::new(),
            read_insts: BTreeMap::new(),
            write_insts: BTreeMap::new(),
            num_callers: 0,
            callers_processed: 0,
            contains_library_call: false,
            warned_icalls: BTreeSet::new(),
            debug: false,
        };
        info.share_move_slots();
        info
    }

    fn share_move_slots(&mut self) {
        // Bounded, as a malformed body may contain move cycles.
        for _ in 0..=self.var_slot.len() {
            let mut changed = false;
            for inst in &self.ssa.insts {
                if let InstKind::Move { dst, src: Operand::Var(src) } | InstKind::Conv { dst, src: Operand::Var(src) } =
                    inst
                {
                    if self.ssa.escaped.contains(dst)
                        || self.ssa.escaped.contains(src)
                        || dst.index() >= self.var_slot.len()
                        || src.index() >= self.var_slot.len()
                    {
                        continue;
                    }
                    let slot = self.var_slot[src.index()];
                    if self.var_slot[dst.index()] != slot {
                        self.var_slot[dst.index()] = slot;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Whether two variables share one set.
    pub fn shares_slot(&self, a: VarId, b: VarId) -> bool {
        match (self.var_slot.get(a.index()), self.var_slot.get(b.index())) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn slot_index(&mut self, var: VarId) -> usize {
        if var.index() >= self.var_slot.len() {
            for idx in self.var_slot.len()..=var.index() {
                self.var_slot.push(idx);
                self.slots.push(MappedSet::new());
            }
        }
        self.var_slot[var.index()]
    }

    /// Sets up the UIVs the method starts from: parameters, allocation
    /// sites, the results of allocating and pointer-returning library calls,
    /// and the call-site records of every call instruction.
    pub fn initialise(&mut self, ir: &dyn ProgramIr, options: &AnalysisOptions, uivs: &mut UivTable) {
        let method = self.method;
        for p in 0..self.ssa.num_params {
            let var = VarId::new(p);
            let uiv = uivs.var(method, var);
            self.add_to_var(uivs, var, &singleton(AbsAddr::new(uiv, 0)));
        }

        for inst in self.ssa.inst_ids() {
            match self.ssa.inst(inst).clone() {
                InstKind::Alloc { dst, .. } => {
                    let uiv = uivs.alloc(method, inst);
                    self.uiv_def_map.entry(uiv).or_default().insert(inst);
                    self.add_to_var(uivs, dst, &singleton(AbsAddr::new(uiv, 0)));
                }
                InstKind::Call { dst, callee, args } => {
                    let call_type = CallType::classify(ir, options, callee);
                    if call_type.is_library() {
                        self.contains_library_call = true;
                    }
                    self.call_sites
                        .insert(inst, vec![CallSite::new(inst, call_type, callee, false)]);
                    if let Some(dst) = dst {
                        self.initialise_call_result(ir, options, uivs, inst, dst, callee, &args);
                    }
                }
                InstKind::ICall { .. } => {
                    self.call_sites.insert(inst, Vec::new());
                }
                _ => {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn initialise_call_result(
        &mut self,
        ir: &dyn ProgramIr,
        options: &AnalysisOptions,
        uivs: &mut UivTable,
        inst: InstId,
        dst: VarId,
        callee: MethodId,
        args: &[Operand],
    ) {
        let method = self.method;
        match CallType::classify_for_init(ir, options, callee) {
            CallType::Normal => {}
            CallType::Known(known) if known.allocates() => {
                let uiv = uivs.alloc(method, inst);
                self.uiv_def_map.entry(uiv).or_default().insert(inst);
                self.add_to_var(uivs, dst, &singleton(AbsAddr::new(uiv, 0)));
            }
            CallType::Known(KnownCall::IoFtableGetEntry) => {
                let streams: Vec<SpecialStream> = match args.first() {
                    Some(Operand::Imm(fd)) => SpecialStream::from_fd(*fd).into_iter().collect(),
                    Some(Operand::Var(_)) => SpecialStream::ALL.to_vec(),
                    _ => Vec::new(),
                };
                let set: AbsAddrSet = streams
                    .into_iter()
                    .map(|stream| AbsAddr::new(uivs.special(stream), 0))
                    .collect();
                self.add_to_var(uivs, dst, &set);
            }
            _ => {
                let signature = ir.signature(callee);
                if !signature.contains('(') || known_names::signature_returns_pointer(signature) {
                    let uiv = uivs.var(method, dst);
                    self.library_results.insert(dst);
                    self.add_to_var(uivs, dst, &singleton(AbsAddr::new(uiv, 0)));
                }
            }
        }
    }

    pub fn is_escaped(&self, var: VarId) -> bool {
        self.ssa.escaped.contains(&var)
    }

    /// The memory cell holding an escaped variable.
    pub fn escaped_cell(&self, uivs: &mut UivTable, var: VarId) -> AbsAddr {
        AbsAddr::new(uivs.var(self.method, var), 0)
    }

    /// The current set of `var`, without materialising anything.
    pub fn var_set(&self, uivs: &mut UivTable, var: VarId) -> AbsAddrSet {
        if self.is_escaped(var) {
            let cell = self.escaped_cell(uivs, var);
            return self.memory.get_pts(cell).cloned().unwrap_or_default();
        }
        match self.var_slot.get(var.index()) {
            Some(slot) => self.slots[*slot].get().clone(),
            None => AbsAddrSet::new(),
        }
    }

    /// Like `var_set`, for callers holding a shared table. An escaped
    /// variable whose cell was never interned holds nothing.
    pub fn known_var_set(&self, uivs: &UivTable, var: VarId) -> AbsAddrSet {
        if self.is_escaped(var) {
            return uivs
                .find(&Uiv::Var { method: self.method, var })
                .and_then(|uiv| self.memory.get_pts(AbsAddr::new(uiv, 0)).cloned())
                .unwrap_or_default();
        }
        match self.var_slot.get(var.index()) {
            Some(slot) => self.slots[*slot].get().clone(),
            None => AbsAddrSet::new(),
        }
    }

    /// The addresses an operand may hold.
    pub fn operand_set(&self, uivs: &mut UivTable, op: Operand) -> AbsAddrSet {
        match op {
            Operand::Var(var) => self.var_set(uivs, var),
            Operand::Symbol(symbol) => singleton(AbsAddr::new(uivs.global(symbol, 0), 0)),
            Operand::Func(func) => singleton(AbsAddr::new(uivs.func(func), 0)),
            Operand::Imm(_) | Operand::None => AbsAddrSet::new(),
        }
    }

    /// Like `operand_set`, but an escaped variable that was never written
    /// is read from memory like any other location.
    pub fn read_operand(&mut self, uivs: &mut UivTable, op: Operand) -> AbsAddrSet {
        match op {
            Operand::Var(var) if self.is_escaped(var) => {
                let cell = self.escaped_cell(uivs, var);
                self.read_memory(uivs, cell)
            }
            _ => self.operand_set(uivs, op),
        }
    }

    pub fn add_to_var(&mut self, uivs: &mut UivTable, var: VarId, set: &AbsAddrSet) -> bool {
        if set.is_empty() {
            return false;
        }
        if self.is_escaped(var) {
            let cell = self.escaped_cell(uivs, var);
            return self.memory.union_pts_to(cell, set);
        }
        let slot = self.slot_index(var);
        self.slots[slot].union(set)
    }

    /// What `addr` holds. A location nobody has written yet holds the
    /// unknown value `Field(addr.uiv, addr.offset)`.
    pub fn read_memory(&mut self, uivs: &mut UivTable, addr: AbsAddr) -> AbsAddrSet {
        let addr = self.merge_map.apply_to_addr(addr);
        if let Some(set) = self.memory.get_pts(addr) {
            if !set.is_empty() {
                return set.clone();
            }
        }
        let field = uivs.field(addr.uiv, addr.offset);
        let value = singleton(AbsAddr::new(field, 0));
        self.memory.union_pts_to(addr, &value);
        value
    }

    pub fn write_memory(&mut self, addr: AbsAddr, set: &AbsAddrSet) -> bool {
        if set.is_empty() {
            return false;
        }
        let addr = self.merge_map.apply_to_addr(addr);
        self.memory.union_pts_to(addr, set)
    }

    /// Union of every returned operand.
    pub fn returned_set(&self, uivs: &mut UivTable) -> AbsAddrSet {
        let mut set = AbsAddrSet::new();
        for inst in &self.ssa.insts {
            if let InstKind::Ret { value: Some(op) } = inst {
                set.union(&self.operand_set(uivs, *op));
            }
        }
        set
    }

    /// Applies the merge map to every variable set, memory key and memory
    /// set, then folds addresses that can no longer be told apart.
    pub fn merge_all_sets(&mut self, uivs: &UivTable) {
        let merge_map = &self.merge_map;
        for slot in &mut self.slots {
            if !merge_map.is_empty() {
                let merged = merge_map.apply_to_set(slot.get());
                *slot.get_mut() = merged;
            }
            merge_in_set(uivs, slot.get_mut(), &mut self.merge_targets);
        }
        if !merge_map.is_empty() {
            let moved: Vec<(AbsAddr, AbsAddr)> = self
                .memory
                .keys()
                .filter_map(|key| {
                    let to = merge_map.apply_to_addr(key);
                    (to != key).then_some((key, to))
                })
                .collect();
            for (from, to) in moved {
                if let Some(set) = self.memory.remove(from) {
                    self.memory.union_pts_to(to, set.get());
                }
            }
        }
        for (_, set) in self.memory.iter_mut() {
            if !merge_map.is_empty() {
                let merged = merge_map.apply_to_set(set.get());
                *set.get_mut() = merged;
            }
            merge_in_set(uivs, set.get_mut(), &mut self.merge_targets);
        }
    }

    /// Global memory is always handed to callers.
    pub fn update_initial_transfer_set(&mut self, uivs: &UivTable) {
        for key in self.memory.keys() {
            if uivs.base_is_global(key.uiv) {
                self.initial_transfer_set.insert(key);
            }
        }
    }

    pub fn snapshot(&mut self) {
        for slot in &mut self.slots {
            slot.snapshot();
        }
        self.memory.snapshot_all();
        for map in self.uiv_maps.values_mut() {
            map.snapshot_all();
        }
    }

    pub fn memory_changed(&self) -> bool {
        self.memory.any_changed()
    }

    pub fn changed(&self) -> bool {
        self.slots.iter().any(MappedSet::changed)
            || self.memory.any_changed()
            || self.uiv_maps.values().any(PtData::any_changed)
    }

    /// Whether no set lost a member since the last snapshot.
    pub fn is_monotone(&self, uivs: &UivTable) -> bool {
        self.slots.iter().all(|slot| slot.is_monotone(uivs))
            && self.memory.iter().all(|(_, set)| set.is_monotone(uivs))
    }

    /// A whole-array key stands for every element of its UIV.
    pub fn update_whole_arrays(&mut self) -> bool {
        let wholes: Vec<AbsAddr> = self.memory.keys().filter(AbsAddr::is_whole_array).collect();
        let mut changed = false;
        for whole in wholes {
            let mut absorbed = AbsAddrSet::new();
            for key in self.memory.keys_of_uiv(whole.uiv) {
                if key != whole {
                    if let Some(set) = self.memory.get_pts(key) {
                        absorbed.union(set);
                    }
                }
            }
            changed |= self.write_memory(whole, &absorbed);
        }
        changed
    }

    /// Folds the memory keys of `base.uiv` beyond `base` onto the elements
    /// of an array of the given stride starting at `base`.
    pub fn apply_stride(&mut self, base: AbsAddr, stride: u32) {
        if base.is_whole_array() || stride == 0 {
            return;
        }
        let step = stride as i64;
        let keys: Vec<AbsAddr> = self
            .memory
            .keys_of_uiv(base.uiv)
            .filter(|key| !key.is_whole_array() && key.offset > base.offset)
            .collect();
        for key in keys {
            let target = base.shifted((key.offset as i64 - base.offset as i64) % step);
            if target == key {
                continue;
            }
            if let Some(set) = self.memory.get_pts(key).cloned() {
                self.memory.union_pts_to(target, &set);
            }
        }
        let congruence = AbsAddr::new(base.uiv, (base.offset as i64).rem_euclid(step) as i32);
        if self.merge_map.add_offset_merge(congruence, stride) {
            debug!("{:?}: stride {} for {:?}", self.method, stride, base);
        }
        self.merge_targets.record(base.uiv, MergeKind::Offsets);
    }

    /// Whether `uiv` stands for a local variable of this method, other than
    /// a parameter or a library call result. Such UIVs mean nothing to
    /// callers.
    pub fn is_local_uiv(&self, uivs: &UivTable, uiv: UivId) -> bool {
        match uivs.base_var(uiv) {
            Some((method, var)) => {
                method == self.method && !self.ssa.is_param(var) && !self.library_results.contains(&var)
            }
            None => false,
        }
    }

    /// Every indirect call instruction with its target operand.
    pub fn icalls(&self) -> Vec<(InstId, Operand)> {
        self.ssa
            .inst_ids()
            .filter_map(|inst| match self.ssa.inst(inst) {
                InstKind::ICall { target, .. } => Some((inst, *target)),
                _ => None,
            })
            .collect()
    }

    /// Every normal call target linked so far, with its call instruction.
    pub fn normal_callees(&self) -> Vec<(InstId, MethodId)> {
        self.call_sites
            .values()
            .flatten()
            .filter(|cs| cs.call_type.is_normal())
            .map(|cs| (cs.inst, cs.callee))
            .collect()
    }

    pub fn has_call_target(&self, inst: InstId, callee: MethodId) -> bool {
        self.call_sites
            .get(&inst)
            .map_or(false, |sites| sites.iter().any(|cs| cs.callee == callee))
    }

    /// The UIVs this method knows about.
    pub fn local_uivs(&self) -> BTreeSet<UivId> {
        let mut result = BTreeSet::new();
        for slot in &self.slots {
            result.extend(slot.get().iter().map(|addr| addr.uiv));
        }
        for (key, set) in self.memory.iter() {
            result.insert(key.uiv);
            result.extend(set.get().iter().map(|addr| addr.uiv));
        }
        result
    }

    pub fn num_memory_keys(&self) -> usize {
        self.memory.len()
    }

    pub fn num_relations(&self) -> usize {
        let vars: usize = self.used_slots().iter().map(|slot| self.slots[*slot].get().count()).sum();
        vars + self.memory.num_relations()
    }

    fn used_slots(&self) -> BTreeSet<usize> {
        self.var_slot.iter().copied().collect()
    }

    /// Drops the transfer caches. Called once every caller has processed
    /// this method; a later round simply transfers again.
    pub fn release_transfer_state(&mut self) {
        trace!("Releasing transfer state of {:?}", self.method);
        self.transfer_cache.clear();
    }
}
