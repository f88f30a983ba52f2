// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::io::{BufWriter, Write};

use log::*;

use crate::ir::{InstKind, ProgramIr};
use crate::pta::dependences::DependenceStats;
use crate::pta::Vllpa;

/// Counts over the whole program, taken before the analysis starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgramStats {
    pub methods: usize,
    pub operations: usize,
    pub indirect_calls: usize,
}

impl ProgramStats {
    pub fn collect(ir: &dyn ProgramIr) -> Self {
        let mut stats = ProgramStats::default();
        for method in ir.methods() {
            let Some(ssa) = ir.ssa_form(method) else {
                continue;
            };
            stats.methods += 1;
            for inst in &ssa.insts {
                match inst {
                    InstKind::Add { .. }
                    | InstKind::Sub { .. }
                    | InstKind::Mul { .. }
                    | InstKind::Shl { .. }
                    | InstKind::Arith { .. }
                    | InstKind::Load { .. }
                    | InstKind::Store { .. }
                    | InstKind::Memcpy { .. }
                    | InstKind::MemCompare { .. } => stats.operations += 1,
                    InstKind::ICall { .. } => stats.indirect_calls += 1,
                    _ => {}
                }
            }
        }
        stats
    }

    pub fn print(&self) {
        println!("Methods: {:4}", self.methods);
        println!("Operations: {:4}", self.operations);
        println!("Indirect calls: {:4}", self.indirect_calls);
    }
}

/// Counters kept while the analysis runs.
#[derive(Clone, Debug, Default)]
pub struct AnalysisStats {
    pub sccs: usize,
    pub outer_iterations: usize,
    pub points_to_rounds: usize,
    pub linked_icall_targets: usize,
    /// Sets that shrank between two rounds outside of a merge. Only
    /// checked in debug builds.
    pub monotonicity_violations: usize,
    pub dependences: DependenceStats,
}

pub struct VllpaStat<'a, 'pta, 'ir> {
    pta: &'a Vllpa<'pta, 'ir>,
}

impl<'a, 'pta, 'ir> VllpaStat<'a, 'pta, 'ir> {
    pub fn new(pta: &'a Vllpa<'pta, 'ir>) -> Self {
        VllpaStat { pta }
    }

    pub fn dump_stats(&self) {
        let mut stat_writer = BufWriter::new(Box::new(std::io::stdout()) as Box<dyn Write>);
        info!("Dumping pta statistics...");
        if let Err(e) = self.write_stats(&mut stat_writer) {
            error!("Unable to write statistics: {}", e);
        }
    }

    pub fn write_stats<W: Write>(&self, stat_writer: &mut BufWriter<W>) -> std::io::Result<()> {
        stat_writer.write_all("##########################################################\n".as_bytes())?;
        self.write_call_graph_stat(stat_writer)?;
        stat_writer.write_all("----------------------------------------------------------\n".as_bytes())?;
        self.write_pts_stat(stat_writer)?;
        stat_writer.write_all("----------------------------------------------------------\n".as_bytes())?;
        self.write_dependence_stat(stat_writer)?;
        stat_writer.write_all("##########################################################\n".as_bytes())?;
        stat_writer.flush()
    }

    fn write_call_graph_stat<W: Write>(&self, stat_writer: &mut BufWriter<W>) -> std::io::Result<()> {
        let stats = &self.pta.stats;
        let call_graph = &self.pta.call_graph;
        writeln!(stat_writer, "Call Graph Statistics: ")?;
        writeln!(stat_writer, "#Reachable methods: {}", call_graph.num_methods())?;
        writeln!(stat_writer, "#Call graph edges: {}", call_graph.num_edges())?;
        writeln!(stat_writer, "#SCCs: {}", stats.sccs)?;
        writeln!(stat_writer, "#Resolved indirect call targets: {}", stats.linked_icall_targets)?;
        writeln!(stat_writer, "#Outer iterations: {}", stats.outer_iterations)?;
        writeln!(stat_writer, "#Points-to rounds: {}", stats.points_to_rounds)
    }

    fn write_pts_stat<W: Write>(&self, stat_writer: &mut BufWriter<W>) -> std::io::Result<()> {
        let infos = self.pta.method_infos();
        let num_keys: usize = infos.values().map(|info| info.num_memory_keys()).sum();
        let num_relations: usize = infos.values().map(|info| info.num_relations()).sum();
        writeln!(stat_writer, "Points-to Statistics: ")?;
        writeln!(stat_writer, "#UIVs: {}", self.pta.uivs().len())?;
        writeln!(stat_writer, "#Memory keys: {}", num_keys)?;
        writeln!(stat_writer, "#Points-to relations: {}", num_relations)?;
        writeln!(
            stat_writer,
            "#Monotonicity violations: {}",
            self.pta.stats.monotonicity_violations
        )
    }

    fn write_dependence_stat<W: Write>(&self, stat_writer: &mut BufWriter<W>) -> std::io::Result<()> {
        let deps = &self.pta.stats.dependences;
        writeln!(stat_writer, "Dependence Statistics: ")?;
        writeln!(stat_writer, "#Memory instructions: {}", deps.memory_insts)?;
        writeln!(stat_writer, "#Library calls: {}", deps.library_insts)?;
        writeln!(stat_writer, "#Pairs pruned by type: {}", deps.pruned_by_type)?;
        writeln!(stat_writer, "#Dependences: {}", deps.total())?;
        writeln!(stat_writer, "#Base definers: {}", deps.base_definers)
    }
}
