// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::BTreeSet;
use std::path::Path;

use vllpa::ir::program::Program;
use vllpa::ir::{DepKind, InstId, InstKind, InstRef, MethodId, Operand, ProgramIr, VarId};
use vllpa::mir::analysis_context::AnalysisContext;
use vllpa::pta::{analyze_program, PointerAnalysis, Vllpa};
use vllpa::pts_set::abs_addr::{singleton, AbsAddr, WHOLE_ARRAY_OFFSET};
use vllpa::pts_set::points_to::PointsToSet;
use vllpa::pts_set::uiv::Uiv;
use vllpa::util::options::AnalysisOptions;

fn options() -> AnalysisOptions {
    AnalysisOptions::default()
}

#[test]
fn alloc_and_store() {
    let mut program = Program::new();
    let g = program.add_symbol("g");
    let callee = program.add_method("alloc_and_store", 1);
    let main = program.add_method("main", 0);

    let body = program.body_mut(callee);
    let obj = body.new_var();
    body.push(InstKind::Alloc { dst: obj, size: Operand::Imm(8) });
    body.push(InstKind::Store { base: Operand::Var(obj), offset: 0, src: Operand::Var(VarId(0)), bytes: 4 });
    body.push(InstKind::Ret { value: Some(Operand::Var(obj)) });

    let body = program.body_mut(main);
    let (ptr, loaded) = (body.new_var(), body.new_var());
    body.push(InstKind::Call { dst: Some(ptr), callee, args: vec![Operand::Symbol(g)] });
    body.push(InstKind::Load { dst: loaded, base: Operand::Var(ptr), offset: 0, bytes: 4 });
    body.push(InstKind::Ret { value: None });

    let mut acx = AnalysisContext::new(&program, options()).unwrap();
    let mut pta = Vllpa::new(&mut acx);
    pta.analyze();

    let g_uiv = pta.uivs().find(&Uiv::Global { symbol: g, offset: 0 }).unwrap();
    assert_eq!(pta.points_to(main, loaded), singleton(AbsAddr::new(g_uiv, 0)));

    let alloc = pta.uivs().find(&Uiv::Alloc { method: callee, inst: InstId(0) }).unwrap();
    assert_eq!(pta.points_to(main, ptr), singleton(AbsAddr::new(alloc, 0)));
    assert_eq!(pta.points_to(callee, obj), singleton(AbsAddr::new(alloc, 0)));
}

#[test]
fn recursive_list_walk() {
    let mut program = Program::new();
    let sum_list = program.add_method("sum_list", 1);
    let main = program.add_method("main", 0);

    let body = program.body_mut(sum_list);
    let (value, next, rest) = (body.new_var(), body.new_var(), body.new_var());
    body.push(InstKind::Load { dst: value, base: Operand::Var(VarId(0)), offset: 4, bytes: 4 });
    body.push(InstKind::Load { dst: next, base: Operand::Var(VarId(0)), offset: 8, bytes: 4 });
    body.push(InstKind::Call { dst: Some(rest), callee: sum_list, args: vec![Operand::Var(next)] });
    body.push(InstKind::Ret { value: Some(Operand::Var(rest)) });

    let body = program.body_mut(main);
    let node = body.new_var();
    body.push(InstKind::Alloc { dst: node, size: Operand::Imm(12) });
    body.push(InstKind::Store { base: Operand::Var(node), offset: 8, src: Operand::Var(node), bytes: 4 });
    body.push(InstKind::Call { dst: None, callee: sum_list, args: vec![Operand::Var(node)] });
    body.push(InstKind::Ret { value: None });

    let mut acx = AnalysisContext::new(&program, options()).unwrap();
    let max_nesting = acx.uivs.max_nesting();
    let mut pta = Vllpa::new(&mut acx);
    pta.analyze();

    let param = pta.uivs().find(&Uiv::Var { method: sum_list, var: VarId(0) }).unwrap();
    let next_field = pta.uivs().find(&Uiv::Field { inner: param, offset: 8 }).unwrap();
    let next_set = pta.points_to(sum_list, next);
    assert!(!next_set.is_empty());
    for addr in next_set.iter() {
        assert_eq!(pta.uivs().base(addr.uiv), param);
        assert!(pta.uivs().level(addr.uiv) <= max_nesting);
    }
    // The field chain of the parameter is cut at the nesting bound.
    assert_eq!(pta.uivs().find(&Uiv::Field { inner: next_field, offset: 8 }), None);
    assert_eq!(pta.uivs().existing_field(next_field, 8), Some(next_field));
    assert_eq!(pta.stats.monotonicity_violations, 0);
}

#[test]
fn indirect_call_through_parameter() {
    let mut program = Program::new();
    let f1 = program.add_method("f1", 0);
    let f2 = program.add_method("f2", 0);
    let apply = program.add_method("apply", 1);
    let main = program.add_method("main", 0);
    program.body_mut(f1).push(InstKind::Ret { value: None });
    program.body_mut(f2).push(InstKind::Ret { value: None });

    let icall = program
        .body_mut(apply)
        .push(InstKind::ICall { dst: None, target: Operand::Var(VarId(0)), args: vec![] });
    program.body_mut(apply).push(InstKind::Ret { value: None });

    let body = program.body_mut(main);
    body.push(InstKind::Call { dst: None, callee: apply, args: vec![Operand::Func(f1)] });
    body.push(InstKind::Call { dst: None, callee: apply, args: vec![Operand::Func(f2)] });
    body.push(InstKind::Ret { value: None });

    let mut acx = AnalysisContext::new(&program, options()).unwrap();
    let mut pta = Vllpa::new(&mut acx);
    pta.analyze();

    let resolved = &pta.func_ptrs()[&InstRef::new(apply, icall)];
    assert_eq!(resolved, &BTreeSet::from([f1, f2]));

    let sites = &pta.method_info(apply).unwrap().call_sites[&icall];
    assert_eq!(sites.len(), 2);
    let callees: BTreeSet<MethodId> = sites.iter().map(|site| site.callee).collect();
    assert_eq!(callees, BTreeSet::from([f1, f2]));
    assert!(sites.iter().all(|site| site.indirect && site.call_type.is_normal()));

    assert_eq!(pta.call_graph.callees_of(apply), BTreeSet::from([f1, f2]));
    assert!(pta.method_info(f1).is_some());
    assert!(pta.method_info(f2).is_some());
}

#[test]
#[should_panic(expected = "outer loop exceeded its bound of 1 iterations")]
fn outer_bound_too_low_for_indirect_call() {
    let mut program = Program::new();
    let target = program.add_method("target", 0);
    let apply = program.add_method("apply", 1);
    let main = program.add_method("main", 0);
    program.body_mut(target).push(InstKind::Ret { value: None });
    let body = program.body_mut(apply);
    body.push(InstKind::ICall { dst: None, target: Operand::Var(VarId(0)), args: vec![] });
    body.push(InstKind::Ret { value: None });
    let body = program.body_mut(main);
    body.push(InstKind::Call { dst: None, callee: apply, args: vec![Operand::Func(target)] });
    body.push(InstKind::Ret { value: None });

    let options = AnalysisOptions {
        max_outer_iterations: 1,
        ..options()
    };
    let mut acx = AnalysisContext::new(&program, options).unwrap();
    let mut pta = Vllpa::new(&mut acx);
    pta.analyze();
}

#[test]
fn library_returned_pointer_reaches_caller() {
    let mut program = Program::new();
    let h = program.add_symbol("h");
    let getenv = program.add_library("System.SByte* libstd.getenv(System.SByte* name)", 1);
    let make = program.add_method("make", 0);
    let main = program.add_method("main", 0);

    let body = program.body_mut(make);
    let env = body.new_var();
    body.push(InstKind::Call { dst: Some(env), callee: getenv, args: vec![Operand::Imm(0)] });
    body.push(InstKind::Store { base: Operand::Var(env), offset: 0, src: Operand::Symbol(h), bytes: 4 });
    body.push(InstKind::Ret { value: Some(Operand::Var(env)) });

    let body = program.body_mut(main);
    let (ptr, loaded) = (body.new_var(), body.new_var());
    let call = body.push(InstKind::Call { dst: Some(ptr), callee: make, args: vec![] });
    let load = body.push(InstKind::Load { dst: loaded, base: Operand::Var(ptr), offset: 0, bytes: 4 });
    let store = body.push(InstKind::Store { base: Operand::Var(ptr), offset: 0, src: Operand::Imm(0), bytes: 4 });
    body.push(InstKind::Ret { value: None });

    {
        let mut acx = AnalysisContext::new(&program, options()).unwrap();
        let mut pta = Vllpa::new(&mut acx);
        pta.analyze();
        let h_uiv = pta.uivs().find(&Uiv::Global { symbol: h, offset: 0 }).unwrap();
        let result = pta.uivs().find(&Uiv::Var { method: make, var: env }).unwrap();
        assert!(pta.points_to(main, ptr).contains(AbsAddr::new(result, 0)));
        // The callee stored through memory the library handed out.
        assert!(pta.points_to(main, loaded).contains(AbsAddr::new(h_uiv, 0)));
    }

    analyze_program(&mut program, options()).unwrap();
    assert!(program.dependence(main, load, call).contains(DepKind::MRAW));
    assert!(!program.dependence(main, store, call).is_empty());
}

#[test]
fn memcpy_reads_each_word() {
    let mut program = Program::new();
    let g = program.add_symbol("g");
    let main = program.add_method("main", 0);
    let body = program.body_mut(main);
    let buf = body.new_var();
    body.push(InstKind::Alloc { dst: buf, size: Operand::Imm(16) });
    let copy = body.push(InstKind::Memcpy {
        dst: Operand::Var(buf),
        src: Operand::Symbol(g),
        size: Operand::Imm(16),
    });
    body.push(InstKind::Ret { value: None });

    let mut acx = AnalysisContext::new(&program, options()).unwrap();
    let mut pta = Vllpa::new(&mut acx);
    pta.analyze();

    let g_uiv = pta.uivs().find(&Uiv::Global { symbol: g, offset: 0 }).unwrap();
    let alloc = pta.uivs().find(&Uiv::Alloc { method: main, inst: InstId(0) }).unwrap();
    let info = pta.method_info(main).unwrap();
    let reads = &info.inst_reads[&copy];
    for offset in [0, 4, 8, 12] {
        assert!(reads.contains(AbsAddr::new(g_uiv, offset)), "g@{} not read", offset);
    }
    assert!(!reads.contains(AbsAddr::new(g_uiv, 16)));
    assert!(!reads.contains(AbsAddr::new(g_uiv, WHOLE_ARRAY_OFFSET)));

    let writes = &info.inst_writes[&copy];
    for offset in [0, 4, 8, 12] {
        assert!(writes.contains(AbsAddr::new(alloc, offset)));
    }
}

#[test]
fn stores_through_merged_aliases() {
    let mut program = Program::new();
    let g = program.add_symbol("g");
    let main = program.add_method("main", 0);
    let body = program.body_mut(main);
    let (base, index, first, second) = (body.new_var(), body.new_var(), body.new_var(), body.new_var());
    body.push(InstKind::Move { dst: base, src: Operand::Symbol(g) });
    body.push(InstKind::Arith { dst: index, srcs: vec![] });
    body.push(InstKind::Add { dst: first, lhs: Operand::Var(base), rhs: Operand::Var(index) });
    body.push(InstKind::Add { dst: second, lhs: Operand::Var(base), rhs: Operand::Imm(8) });
    let store1 = body.push(InstKind::Store { base: Operand::Var(first), offset: 0, src: Operand::Imm(1), bytes: 4 });
    let store2 = body.push(InstKind::Store { base: Operand::Var(second), offset: 0, src: Operand::Imm(2), bytes: 4 });
    body.push(InstKind::Ret { value: None });

    let stats = analyze_program(&mut program, options()).unwrap();
    assert!(program.dependence(main, store1, store2).contains(DepKind::MWAW));
    assert!(program.dependence(main, store2, store1).contains(DepKind::MWAW));
    assert!(!program.dependence(main, store1, store2).contains(DepKind::MRAW));
    assert!(stats.dependences.waw >= 2);
}

#[test]
fn program_from_json() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/programs/linked_list.json");
    let mut program = Program::from_json_file(&path).unwrap();
    let main = program
        .methods()
        .into_iter()
        .find(|m| program.method_name(*m) == "main")
        .unwrap();

    analyze_program(&mut program, options()).unwrap();
    // The load of the head's next pointer reads what the store wrote.
    assert!(program.dependence(main, InstId(3), InstId(2)).contains(DepKind::MRAW));
    assert!(program.dependence(main, InstId(2), InstId(3)).contains(DepKind::MWAR));
}

#[test]
fn malformed_program_is_rejected() {
    let json = r#"{ "methods": [ { "name": "main", "body": { "insts": [
        { "Call": { "dst": null, "callee": 7, "args": [] } }
    ] } } ] }"#;
    assert!(Program::from_json_str(json).is_err());
}
