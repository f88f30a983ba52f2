// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The boundary between the analysis and the IR it runs on.
//!
//! The analysis never owns the program. It reads methods through the
//! [`ProgramIr`] trait and hands its results back through a
//! [`DependenceSink`]. [`program::Program`] is an in-memory implementation
//! of both, used by the command-line driver and the tests.

use std::collections::HashSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

pub mod program;

macro_rules! ir_index {
    ($(#[$attr:meta])* $name:ident, $fmt:literal) => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn new(idx: usize) -> Self {
                assert!(idx <= u32::MAX as usize);
                $name(idx as u32)
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $fmt, self.0)
            }
        }
    };
}

ir_index!(
    /// A method of the analyzed program.
    MethodId, "m{}"
);
ir_index!(
    /// A variable (SSA register) local to one method. The formal parameters
    /// of a method are always the variables `0..param_count`.
    VarId, "v{}"
);
ir_index!(
    /// The position of an instruction inside its method.
    InstId, "i{}"
);
ir_index!(
    /// A global or static symbol.
    SymbolId, "s{}"
);
ir_index!(
    /// An opaque static type, used to prune aliasing between accesses whose
    /// types can never be assigned to each other.
    TypeTag, "t{}"
);

/// An instruction named program-wide.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct InstRef {
    pub method: MethodId,
    pub inst: InstId,
}

impl InstRef {
    pub fn new(method: MethodId, inst: InstId) -> Self {
        InstRef { method, inst }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Operand {
    Var(VarId),
    Imm(i64),
    /// The address of a global symbol.
    Symbol(SymbolId),
    /// The address of a method.
    Func(MethodId),
    None,
}

impl Operand {
    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Operand::Var(var) => Some(*var),
            _ => None,
        }
    }

    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(imm) => Some(*imm),
            _ => None,
        }
    }

    pub fn is_nonzero_imm(&self) -> bool {
        matches!(self, Operand::Imm(imm) if *imm != 0)
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum InstKind {
    /// `dst = *(base + offset)`, reading `bytes` bytes.
    Load { dst: VarId, base: Operand, offset: i32, bytes: u32 },
    /// `*(base + offset) = src`
    Store { base: Operand, offset: i32, src: Operand, bytes: u32 },
    Add { dst: VarId, lhs: Operand, rhs: Operand },
    Sub { dst: VarId, lhs: Operand, rhs: Operand },
    Mul { dst: VarId, lhs: Operand, rhs: Operand },
    Shl { dst: VarId, lhs: Operand, rhs: Operand },
    /// Any other arithmetic, comparison or math operation.
    Arith { dst: VarId, srcs: Vec<Operand> },
    Phi { dst: VarId, srcs: Vec<VarId> },
    Move { dst: VarId, src: Operand },
    Conv { dst: VarId, src: Operand },
    /// `dst = &var`
    GetAddress { dst: VarId, var: VarId },
    Memcpy { dst: Operand, src: Operand, size: Operand },
    InitMemory { dst: Operand, value: Operand, size: Operand },
    /// memcmp, strcmp and friends.
    MemCompare { dst: VarId, lhs: Operand, rhs: Operand },
    /// A stack or heap allocation site.
    Alloc { dst: VarId, size: Operand },
    Free { ptr: Operand },
    Call { dst: Option<VarId>, callee: MethodId, args: Vec<Operand> },
    ICall { dst: Option<VarId>, target: Operand, args: Vec<Operand> },
    Ret { value: Option<Operand> },
    Nop,
}

impl InstKind {
    /// The variable defined by this instruction, if any.
    pub fn dest(&self) -> Option<VarId> {
        match self {
            InstKind::Load { dst, .. }
            | InstKind::Add { dst, .. }
            | InstKind::Sub { dst, .. }
            | InstKind::Mul { dst, .. }
            | InstKind::Shl { dst, .. }
            | InstKind::Arith { dst, .. }
            | InstKind::Phi { dst, .. }
            | InstKind::Move { dst, .. }
            | InstKind::Conv { dst, .. }
            | InstKind::GetAddress { dst, .. }
            | InstKind::MemCompare { dst, .. }
            | InstKind::Alloc { dst, .. } => Some(*dst),
            InstKind::Call { dst, .. } | InstKind::ICall { dst, .. } => *dst,
            _ => None,
        }
    }

    /// Every operand read by this instruction.
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            InstKind::Load { base, .. } => vec![*base],
            InstKind::Store { base, src, .. } => vec![*base, *src],
            InstKind::Add { lhs, rhs, .. }
            | InstKind::Sub { lhs, rhs, .. }
            | InstKind::Mul { lhs, rhs, .. }
            | InstKind::Shl { lhs, rhs, .. }
            | InstKind::MemCompare { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Arith { srcs, .. } => srcs.clone(),
            InstKind::Phi { srcs, .. } => srcs.iter().map(|v| Operand::Var(*v)).collect(),
            InstKind::Move { src, .. } | InstKind::Conv { src, .. } => vec![*src],
            InstKind::GetAddress { var, .. } => vec![Operand::Var(*var)],
            InstKind::Memcpy { dst, src, size } => vec![*dst, *src, *size],
            InstKind::InitMemory { dst, value, size } => vec![*dst, *value, *size],
            InstKind::Alloc { size, .. } => vec![*size],
            InstKind::Free { ptr } => vec![*ptr],
            InstKind::Call { args, .. } => args.clone(),
            InstKind::ICall { target, args, .. } => {
                let mut ops = vec![*target];
                ops.extend(args.iter().copied());
                ops
            }
            InstKind::Ret { value } => value.iter().copied().collect(),
            InstKind::Nop => vec![],
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, InstKind::Call { .. } | InstKind::ICall { .. })
    }

    /// Loads and stores with a constant, non-zero offset. Array accesses add
    /// their index to the base in a separate instruction instead.
    pub fn is_field_access(&self) -> bool {
        match self {
            InstKind::Load { offset, .. } | InstKind::Store { offset, .. } => *offset != 0,
            _ => false,
        }
    }

    pub fn is_arith(&self) -> bool {
        matches!(
            self,
            InstKind::Add { .. }
                | InstKind::Sub { .. }
                | InstKind::Mul { .. }
                | InstKind::Shl { .. }
                | InstKind::Arith { .. }
                | InstKind::Move { .. }
                | InstKind::Conv { .. }
        )
    }
}

/// The SSA clone of a method handed to the analysis, together with the
/// results of the escapes analysis run on it.
#[derive(Clone, Debug)]
pub struct SsaMethod {
    pub method: MethodId,
    pub insts: Vec<InstKind>,
    /// For every SSA instruction, the original instruction it stems from.
    /// Instructions introduced by the SSA conversion have no origin.
    pub origin: Vec<Option<InstId>>,
    pub num_params: usize,
    pub num_vars: usize,
    /// Variables whose address is taken; their values live in memory.
    pub escaped: HashSet<VarId>,
}

impl SsaMethod {
    pub fn inst(&self, inst: InstId) -> &InstKind {
        &self.insts[inst.index()]
    }

    pub fn inst_ids(&self) -> impl Iterator<Item = InstId> {
        (0..self.insts.len()).map(InstId::new)
    }

    pub fn origin_of(&self, inst: InstId) -> Option<InstId> {
        self.origin.get(inst.index()).copied().flatten()
    }

    pub fn is_param(&self, var: VarId) -> bool {
        var.index() < self.num_params
    }

    /// The single SSA definition of `var`.
    pub fn definer_of(&self, var: VarId) -> Option<InstId> {
        self.insts
            .iter()
            .position(|inst| inst.dest() == Some(var))
            .map(InstId::new)
    }

    /// Whether an arithmetic instruction reads or writes an escaped variable.
    pub fn may_access_heap(&self, inst: InstId) -> bool {
        let kind = self.inst(inst);
        if !kind.is_arith() {
            return false;
        }
        kind.dest().map_or(false, |d| self.escaped.contains(&d))
            || kind
                .operands()
                .iter()
                .filter_map(Operand::as_var)
                .any(|v| self.escaped.contains(&v))
    }
}

/// Read-only access to the analyzed program.
pub trait ProgramIr {
    fn methods(&self) -> Vec<MethodId>;
    fn method_name(&self, method: MethodId) -> &str;
    /// The fully qualified signature, used to recognise known library calls.
    fn signature(&self, method: MethodId) -> &str;
    fn is_library(&self, method: MethodId) -> bool;
    fn has_body(&self, method: MethodId) -> bool;
    fn param_count(&self, method: MethodId) -> usize;
    fn symbol_name(&self, symbol: SymbolId) -> &str;
    /// Clones the method, converts the clone to SSA and runs the escapes
    /// analysis on it. Returns `None` for methods without a body.
    fn ssa_form(&self, method: MethodId) -> Option<SsaMethod>;
    /// A conservative set of targets for the indirect call `inst`.
    fn possible_callees(&self, method: MethodId, inst: InstId) -> Vec<MethodId>;
    /// The static type of the memory operand of a load or store, if known.
    fn access_type(&self, method: MethodId, inst: InstId) -> Option<TypeTag>;
    fn types_assignable(&self, from: TypeTag, to: TypeTag) -> bool;
}

/// Kinds of memory data dependence, combinable as a bit mask.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepKind(u8);

impl DepKind {
    pub const NONE: DepKind = DepKind(0);
    /// Read after write.
    pub const MRAW: DepKind = DepKind(1);
    /// Write after read.
    pub const MWAR: DepKind = DepKind(2);
    /// Write after write.
    pub const MWAW: DepKind = DepKind(4);
    pub const ALL: DepKind = DepKind(7);

    pub fn contains(self, other: DepKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DepKind {
    type Output = DepKind;

    fn bitor(self, rhs: DepKind) -> DepKind {
        DepKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for DepKind {
    fn bitor_assign(&mut self, rhs: DepKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(DepKind::MRAW) {
            names.push("MRAW");
        }
        if self.contains(DepKind::MWAR) {
            names.push("MWAR");
        }
        if self.contains(DepKind::MWAW) {
            names.push("MWAW");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Receives the metadata produced by the analysis.
pub trait DependenceSink {
    /// `from` depends on `to` through memory.
    fn add_dependence(&mut self, method: MethodId, from: InstId, to: InstId, kind: DepKind);
    /// `definer` defines the memory that the load or store `inst` accesses.
    fn add_base_definer(&mut self, method: MethodId, inst: InstId, definer: InstRef);
}
