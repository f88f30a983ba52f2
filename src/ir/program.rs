// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! An in-memory program, loadable from JSON.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::*;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Body {
    pub insts: Vec<InstKind>,
    /// Variables whose address escapes.
    #[serde(default)]
    pub escaped: Vec<VarId>,
    #[serde(default)]
    next_var: u32,
}

impl Body {
    fn with_params(params: u32) -> Self {
        Body {
            insts: Vec::new(),
            escaped: Vec::new(),
            next_var: params,
        }
    }

    /// Appends an instruction and returns its position.
    pub fn push(&mut self, kind: InstKind) -> InstId {
        self.insts.push(kind);
        InstId::new(self.insts.len() - 1)
    }

    /// Allocates a fresh variable.
    pub fn new_var(&mut self) -> VarId {
        let var = VarId(self.next_var);
        self.next_var += 1;
        var
    }

    pub fn mark_escaped(&mut self, var: VarId) {
        if !self.escaped.contains(&var) {
            self.escaped.push(var);
        }
    }

    fn num_vars(&self, params: u32) -> usize {
        let mut max = self.next_var.max(params) as usize;
        for inst in &self.insts {
            let vars = inst
                .operands()
                .into_iter()
                .filter_map(|op| op.as_var())
                .chain(inst.dest());
            for var in vars {
                max = max.max(var.index() + 1);
            }
        }
        max
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MethodDecl {
    pub name: String,
    /// Defaults to the name.
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub library: bool,
    #[serde(default)]
    pub params: u32,
    #[serde(default)]
    pub body: Option<Body>,
    /// Explicit targets for indirect calls, keyed by instruction position.
    #[serde(default)]
    pub icall_targets: BTreeMap<u32, Vec<MethodId>>,
    /// Static types of load/store memory operands, keyed by instruction position.
    #[serde(default)]
    pub access_types: BTreeMap<u32, TypeTag>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub symbols: Vec<String>,
    pub methods: Vec<MethodDecl>,
    /// Pairs of distinct types that may be assigned to each other.
    #[serde(default)]
    pub assignable: Vec<(TypeTag, TypeTag)>,
    #[serde(skip)]
    dependences: BTreeMap<(MethodId, InstId, InstId), DepKind>,
    #[serde(skip)]
    base_definers: BTreeMap<(MethodId, InstId), BTreeSet<InstRef>>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let program: Program = serde_json::from_str(json)?;
        program.validate()?;
        Ok(program)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read program file {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("malformed program {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        for (idx, decl) in self.methods.iter().enumerate() {
            let Some(body) = &decl.body else { continue };
            if decl.library {
                bail!("library method {} cannot have a body", decl.name);
            }
            for inst in &body.insts {
                let callee = match inst {
                    InstKind::Call { callee, .. } => Some(*callee),
                    _ => None,
                };
                let func = inst.operands().into_iter().find_map(|op| match op {
                    Operand::Func(m) => Some(m),
                    _ => None,
                });
                for target in callee.into_iter().chain(func) {
                    if target.index() >= self.methods.len() {
                        bail!("method {} (m{}) refers to unknown method {:?}", decl.name, idx, target);
                    }
                }
                for op in inst.operands() {
                    if let Operand::Symbol(sym) = op {
                        if sym.index() >= self.symbols.len() {
                            bail!("method {} refers to unknown symbol {:?}", decl.name, sym);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn add_symbol(&mut self, name: &str) -> SymbolId {
        self.symbols.push(name.to_string());
        SymbolId::new(self.symbols.len() - 1)
    }

    /// Adds a method of the analyzed program with an empty body.
    pub fn add_method(&mut self, name: &str, params: u32) -> MethodId {
        self.methods.push(MethodDecl {
            name: name.to_string(),
            params,
            body: Some(Body::with_params(params)),
            ..MethodDecl::default()
        });
        MethodId::new(self.methods.len() - 1)
    }

    /// Adds a library method identified by its full signature.
    pub fn add_library(&mut self, signature: &str, params: u32) -> MethodId {
        let name = signature
            .split('(')
            .next()
            .and_then(|head| head.rsplit(' ').next())
            .unwrap_or(signature);
        self.methods.push(MethodDecl {
            name: name.to_string(),
            signature: Some(signature.to_string()),
            library: true,
            params,
            ..MethodDecl::default()
        });
        MethodId::new(self.methods.len() - 1)
    }

    pub fn body_mut(&mut self, method: MethodId) -> &mut Body {
        self.methods[method.index()]
            .body
            .as_mut()
            .expect("library methods have no body")
    }

    pub fn set_icall_targets(&mut self, method: MethodId, inst: InstId, targets: Vec<MethodId>) {
        self.methods[method.index()].icall_targets.insert(inst.0, targets);
    }

    pub fn set_access_type(&mut self, method: MethodId, inst: InstId, ty: TypeTag) {
        self.methods[method.index()].access_types.insert(inst.0, ty);
    }

    /// The dependence kinds recorded from `from` to `to`.
    pub fn dependence(&self, method: MethodId, from: InstId, to: InstId) -> DepKind {
        self.dependences
            .get(&(method, from, to))
            .copied()
            .unwrap_or(DepKind::NONE)
    }

    pub fn dependences(&self) -> impl Iterator<Item = (MethodId, InstId, InstId, DepKind)> + '_ {
        self.dependences
            .iter()
            .map(|((m, from, to), kind)| (*m, *from, *to, *kind))
    }

    pub fn base_definers(&self, method: MethodId, inst: InstId) -> Vec<InstRef> {
        self.base_definers
            .get(&(method, inst))
            .map(|defs| defs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear_results(&mut self) {
        self.dependences.clear();
        self.base_definers.clear();
    }

    fn decl(&self, method: MethodId) -> &MethodDecl {
        &self.methods[method.index()]
    }
}

impl ProgramIr for Program {
    fn methods(&self) -> Vec<MethodId> {
        (0..self.methods.len()).map(MethodId::new).collect()
    }

    fn method_name(&self, method: MethodId) -> &str {
        &self.decl(method).name
    }

    fn signature(&self, method: MethodId) -> &str {
        let decl = self.decl(method);
        decl.signature.as_deref().unwrap_or(&decl.name)
    }

    fn is_library(&self, method: MethodId) -> bool {
        self.decl(method).library
    }

    fn has_body(&self, method: MethodId) -> bool {
        self.decl(method).body.is_some()
    }

    fn param_count(&self, method: MethodId) -> usize {
        self.decl(method).params as usize
    }

    fn symbol_name(&self, symbol: SymbolId) -> &str {
        &self.symbols[symbol.index()]
    }

    fn ssa_form(&self, method: MethodId) -> Option<SsaMethod> {
        let decl = self.decl(method);
        let body = decl.body.as_ref()?;
        Some(SsaMethod {
            method,
            insts: body.insts.clone(),
            origin: (0..body.insts.len()).map(|i| Some(InstId::new(i))).collect(),
            num_params: decl.params as usize,
            num_vars: body.num_vars(decl.params),
            escaped: body.escaped.iter().copied().collect::<HashSet<_>>(),
        })
    }

    fn possible_callees(&self, method: MethodId, inst: InstId) -> Vec<MethodId> {
        let decl = self.decl(method);
        if let Some(targets) = decl.icall_targets.get(&inst.0) {
            return targets.clone();
        }
        let num_args = match decl.body.as_ref().and_then(|b| b.insts.get(inst.index())) {
            Some(InstKind::ICall { args, .. }) => args.len(),
            _ => return Vec::new(),
        };
        // Without explicit targets, every method of matching arity.
        self.methods()
            .into_iter()
            .filter(|m| self.param_count(*m) == num_args)
            .collect()
    }

    fn access_type(&self, method: MethodId, inst: InstId) -> Option<TypeTag> {
        self.decl(method).access_types.get(&inst.0).copied()
    }

    fn types_assignable(&self, from: TypeTag, to: TypeTag) -> bool {
        from == to
            || self
                .assignable
                .iter()
                .any(|(a, b)| (*a == from && *b == to) || (*a == to && *b == from))
    }
}

impl DependenceSink for Program {
    fn add_dependence(&mut self, method: MethodId, from: InstId, to: InstId, kind: DepKind) {
        *self.dependences.entry((method, from, to)).or_default() |= kind;
    }

    fn add_base_definer(&mut self, method: MethodId, inst: InstId, definer: InstRef) {
        self.base_definers
            .entry((method, inst))
            .or_default()
            .insert(definer);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn program_json_test() {
        let json = r#"{
            "symbols": ["g"],
            "methods": [
                { "name": "main", "params": 0, "body": { "insts": [
                    { "Move": { "dst": 0, "src": { "Symbol": 0 } } },
                    { "Call": { "dst": null, "callee": 1, "args": [ { "Var": 0 } ] } },
                    { "Ret": { "value": null } }
                ] } },
                { "name": "System.Int32 libstd.puts(System.SByte* s)", "library": true, "params": 1 }
            ]
        }"#;
        let program = Program::from_json_str(json).unwrap();
        assert_eq!(program.methods().len(), 2);
        assert!(program.is_library(MethodId(1)));
        assert!(!program.has_body(MethodId(1)));
        let ssa = program.ssa_form(MethodId(0)).unwrap();
        assert_eq!(ssa.insts.len(), 3);
        assert_eq!(ssa.num_vars, 1);
        assert_eq!(ssa.origin_of(InstId(2)), Some(InstId(2)));
    }

    #[test]
    fn unknown_callee_rejected_test() {
        let json = r#"{ "methods": [
            { "name": "main", "body": { "insts": [
                { "Call": { "dst": null, "callee": 7, "args": [] } }
            ] } }
        ] }"#;
        assert!(Program::from_json_str(json).is_err());
    }

    #[test]
    fn default_possible_callees_test() {
        let mut program = Program::new();
        let main = program.add_method("main", 0);
        let one = program.add_method("one", 1);
        let _two = program.add_method("two", 2);
        let body = program.body_mut(main);
        let fp = body.new_var();
        let icall = body.push(InstKind::ICall {
            dst: None,
            target: Operand::Var(fp),
            args: vec![Operand::Imm(1)],
        });
        assert_eq!(program.possible_callees(main, icall), vec![one]);
    }
}
