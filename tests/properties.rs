// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vllpa::graph::call_graph::CallGraph;
use vllpa::ir::program::Program;
use vllpa::ir::{InstId, InstKind, InstRef, MethodId, Operand, SymbolId, VarId};
use vllpa::mir::analysis_context::AnalysisContext;
use vllpa::mir::known_names::{classify, signatures_of, KnownCall};
use vllpa::pta::{PointerAnalysis, Vllpa};
use vllpa::pts_set::abs_addr::{AbsAddr, AbsAddrSet};
use vllpa::pts_set::merge_map::MergeMap;
use vllpa::pts_set::points_to::PointsToSet;
use vllpa::pts_set::uiv::{Uiv, UivId, UivTable};
use vllpa::util::options::AnalysisOptions;

fn random_set(rng: &mut StdRng, uivs: &[UivId]) -> AbsAddrSet {
    let len = rng.gen_range(0..24);
    (0..len)
        .map(|_| AbsAddr::new(uivs[rng.gen_range(0..uivs.len())], rng.gen_range(0..8) * 4))
        .collect()
}

fn table_with_globals(count: u32) -> (UivTable, Vec<UivId>) {
    let mut table = UivTable::new(1);
    let uivs = (0..count).map(|idx| table.global(SymbolId(idx), 0)).collect();
    (table, uivs)
}

#[test]
fn union_laws() {
    let mut rng = StdRng::seed_from_u64(7);
    let (_, uivs) = table_with_globals(5);
    for _ in 0..200 {
        let a = random_set(&mut rng, &uivs);
        let b = random_set(&mut rng, &uivs);
        let c = random_set(&mut rng, &uivs);

        let mut ab = a.clone();
        ab.union(&b);
        let mut ba = b.clone();
        ba.union(&a);
        assert_eq!(ab, ba);
        assert!(ab.superset(&a) && ab.superset(&b));

        let mut ab_c = ab.clone();
        ab_c.union(&c);
        let mut bc = b.clone();
        bc.union(&c);
        let mut a_bc = a.clone();
        a_bc.union(&bc);
        assert_eq!(ab_c, a_bc);

        let mut aa = a.clone();
        assert!(!aa.union(&a));
        assert_eq!(aa, a);
    }
}

#[test]
fn merge_application_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(11);
    let (table, mut uivs) = table_with_globals(6);
    uivs.sort_by(|a, b| table.compare(*a, *b));
    for _ in 0..100 {
        let mut merges = MergeMap::new();
        for _ in 0..rng.gen_range(0..6) {
            if rng.gen_bool(0.5) {
                let stride = rng.gen_range(1..4) * 4;
                let to = rng.gen_range(0..stride / 4) * 4;
                merges.add_offset_merge(AbsAddr::new(uivs[rng.gen_range(0..uivs.len())], to), stride as u32);
            } else {
                // Always towards a lesser UIV, so no merge cycles back.
                let to = rng.gen_range(0..uivs.len() - 1);
                let from = rng.gen_range(to + 1..uivs.len());
                merges.add_uiv_merge(&table, uivs[from], uivs[to]);
            }
        }
        let set = random_set(&mut rng, &uivs);
        let once = merges.apply_to_set(&set);
        let twice = merges.apply_to_set(&once);
        assert_eq!(once, twice);
        assert!(once.count() <= set.count());
    }
}

#[test]
fn scc_order_puts_callees_first() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..50 {
        let num_methods = rng.gen_range(2..12);
        let mut graph = CallGraph::new();
        for idx in 0..num_methods {
            graph.add_node(MethodId(idx));
        }
        for site in 0..rng.gen_range(1..30) {
            let caller = MethodId(rng.gen_range(0..num_methods));
            let callee = MethodId(rng.gen_range(0..num_methods));
            graph.add_edge(InstRef::new(caller, InstId(site)), caller, callee);
        }

        let order = graph.scc_order(MethodId(0));
        let position: HashMap<MethodId, usize> = order
            .iter()
            .enumerate()
            .flat_map(|(idx, scc)| scc.iter().map(move |m| (*m, idx)))
            .collect();
        assert_eq!(position.len(), order.iter().map(Vec::len).sum::<usize>());
        assert!(position.contains_key(&MethodId(0)));
        for (method, idx) in &position {
            for callee in graph.callees_of(*method) {
                assert!(position[&callee] <= *idx, "{:?} ordered before its callee {:?}", method, callee);
            }
        }
    }
}

#[test]
fn callee_facts_reach_the_caller() {
    let mut program = Program::new();
    let g = program.add_symbol("g");
    let h = program.add_symbol("h");
    let get = program.add_method("get", 0);
    let set = program.add_method("set", 2);
    let main = program.add_method("main", 0);

    let body = program.body_mut(get);
    let ptr = body.new_var();
    body.push(InstKind::Move { dst: ptr, src: Operand::Symbol(g) });
    body.push(InstKind::Ret { value: Some(Operand::Var(ptr)) });

    let body = program.body_mut(set);
    body.push(InstKind::Store { base: Operand::Var(VarId(0)), offset: 0, src: Operand::Var(VarId(1)), bytes: 4 });
    body.push(InstKind::Ret { value: None });

    let body = program.body_mut(main);
    let (got, loaded) = (body.new_var(), body.new_var());
    body.push(InstKind::Call { dst: Some(got), callee: get, args: vec![] });
    body.push(InstKind::Call { dst: None, callee: set, args: vec![Operand::Var(got), Operand::Symbol(h)] });
    body.push(InstKind::Load { dst: loaded, base: Operand::Symbol(g), offset: 0, bytes: 4 });
    body.push(InstKind::Ret { value: None });

    let mut acx = AnalysisContext::new(&program, AnalysisOptions::default()).unwrap();
    let mut pta = Vllpa::new(&mut acx);
    pta.analyze();
    assert_eq!(pta.stats.monotonicity_violations, 0);

    let g_addr = AbsAddr::new(pta.uivs().find(&Uiv::Global { symbol: g, offset: 0 }).unwrap(), 0);
    let h_addr = AbsAddr::new(pta.uivs().find(&Uiv::Global { symbol: h, offset: 0 }).unwrap(), 0);
    assert!(pta.points_to(main, got).contains(g_addr));
    // The store inside `set` is visible in the caller's memory.
    assert!(pta.points_to(main, loaded).contains(h_addr));

    let main_info = pta.method_info(main).unwrap();
    assert!(main_info.write_set.get().contains(g_addr));
}

#[test]
fn every_known_call_is_classified() {
    for call in KnownCall::ALL {
        let signatures = signatures_of(call);
        assert!(!signatures.is_empty());
        for signature in signatures {
            assert_eq!(classify(signature), Some(call));
        }
        let effects = call.effects();
        assert!(effects.len() <= effects.capacity());
    }
}
