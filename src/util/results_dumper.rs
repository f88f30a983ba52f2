// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use log::*;
use serde::Serialize;

use crate::ir::{ProgramIr, VarId};
use crate::mir::method_info::MethodInfo;
use crate::pta::Vllpa;
use crate::pts_set::abs_addr::AbsAddrSet;
use crate::pts_set::points_to::PointsToSet;
use crate::pts_set::uiv::UivTable;

#[derive(Serialize)]
struct MethodPts {
    vars: BTreeMap<String, Vec<String>>,
    memory: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize)]
struct MethodRwSets {
    reads: Vec<String>,
    writes: Vec<String>,
    contains_library_call: bool,
}

pub fn dump_results(pta: &Vllpa) -> Result<()> {
    let options = &pta.acx.analysis_options;
    let ir = pta.acx.ir;

    // dump call graph
    if let Some(cg_output) = &options.call_graph_output {
        info!("Dumping call graph...");
        pta.call_graph.to_dot(ir, std::path::Path::new(cg_output))?;
    }

    // dump points-to results
    if let Some(pts_output) = &options.pts_output {
        info!("Dumping points-to results...");
        let pts: BTreeMap<&str, MethodPts> = pta
            .method_infos()
            .values()
            .map(|info| (ir.method_name(info.method), method_pts(ir, pta.uivs(), info)))
            .collect();
        write_json(pts_output, &pts)?;
    }

    // dump read and write sets
    if let Some(rw_output) = &options.rw_sets_output {
        info!("Dumping read/write sets...");
        let rw_sets: BTreeMap<&str, MethodRwSets> = pta
            .method_infos()
            .values()
            .map(|info| {
                let sets = MethodRwSets {
                    reads: render_set(ir, pta.uivs(), info.read_set.get()),
                    writes: render_set(ir, pta.uivs(), info.write_set.get()),
                    contains_library_call: info.contains_library_call,
                };
                (ir.method_name(info.method), sets)
            })
            .collect();
        write_json(rw_output, &rw_sets)?;
    }
    Ok(())
}

fn render_set(ir: &dyn ProgramIr, uivs: &UivTable, set: &AbsAddrSet) -> Vec<String> {
    set.iter().map(|addr| addr.display(uivs, ir)).collect()
}

fn method_pts(ir: &dyn ProgramIr, uivs: &UivTable, info: &MethodInfo) -> MethodPts {
    let mut vars = BTreeMap::new();
    for var in (0..info.ssa.num_vars).map(VarId::new) {
        let set = info.known_var_set(uivs, var);
        if !set.is_empty() {
            vars.insert(format!("{:?}", var), render_set(ir, uivs, &set));
        }
    }
    let memory = info
        .memory
        .iter()
        .filter(|(_, set)| !set.is_empty())
        .map(|(key, set)| (key.display(uivs, ir), render_set(ir, uivs, set.get())))
        .collect();
    MethodPts { vars, memory }
}

fn write_json<T: Serialize>(path: &str, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(match path {
        "stdout" => Box::new(std::io::stdout()) as Box<dyn Write>,
        _ => Box::new(File::create(path).with_context(|| format!("unable to create {}", path))?) as Box<dyn Write>,
    });
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
