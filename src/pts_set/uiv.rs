// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Unknown initial values.
//!
//! A UIV names a memory location whose concrete address is unknown while
//! analyzing a method: the value a parameter held on entry, an allocation
//! site, a global, a function, one of the standard streams, or the value
//! found at a constant offset inside another UIV. UIVs are interned in a
//! [`UivTable`] and referred to by [`UivId`] handles, so equality and
//! hashing are handle comparisons.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::{InstId, MethodId, ProgramIr, SymbolId, VarId};

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UivId(u32);

impl UivId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for UivId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uiv{}", self.0)
    }
}

/// The standard streams used by library-call summaries.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum SpecialStream {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl SpecialStream {
    pub const ALL: [SpecialStream; 3] = [SpecialStream::Stdin, SpecialStream::Stdout, SpecialStream::Stderr];

    pub fn from_fd(fd: i64) -> Option<SpecialStream> {
        match fd {
            0 => Some(SpecialStream::Stdin),
            1 => Some(SpecialStream::Stdout),
            2 => Some(SpecialStream::Stderr),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Uiv {
    /// The value held by a variable on entry to its method.
    Var { method: MethodId, var: VarId },
    /// The object created by an allocation site.
    Alloc { method: MethodId, inst: InstId },
    Global { symbol: SymbolId, offset: i32 },
    Func(MethodId),
    Special(SpecialStream),
    /// The value stored at `offset` inside the object `inner`.
    Field { inner: UivId, offset: i32 },
}

impl Uiv {
    /// Rank of the base kind in the total order over UIVs.
    fn kind_rank(&self) -> u8 {
        match self {
            Uiv::Var { .. } => 0,
            Uiv::Global { .. } => 1,
            Uiv::Alloc { .. } => 2,
            Uiv::Func(_) => 3,
            Uiv::Special(_) => 4,
            Uiv::Field { .. } => 5,
        }
    }
}

struct UivData {
    uiv: Uiv,
    base: UivId,
    level: u32,
}

/// Interning arena for UIVs, shared by every method of one analysis run.
pub struct UivTable {
    uivs: Vec<UivData>,
    lookup: HashMap<Uiv, UivId>,
    /// Field UIVs are never nested deeper than this.
    max_nesting: u32,
}

impl fmt::Debug for UivTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UivTable({} uivs)", self.uivs.len())
    }
}

impl UivTable {
    pub fn new(max_nesting: u32) -> Self {
        UivTable {
            uivs: Vec::new(),
            lookup: HashMap::new(),
            max_nesting,
        }
    }

    pub fn len(&self) -> usize {
        self.uivs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uivs.is_empty()
    }

    pub fn max_nesting(&self) -> u32 {
        self.max_nesting
    }

    fn intern(&mut self, uiv: Uiv) -> UivId {
        if let Some(id) = self.lookup.get(&uiv) {
            return *id;
        }
        let id = UivId(self.uivs.len() as u32);
        let (base, level) = match uiv {
            Uiv::Field { inner, .. } => (self.base(inner), self.level(inner) + 1),
            _ => (id, 0),
        };
        self.uivs.push(UivData { uiv, base, level });
        self.lookup.insert(uiv, id);
        id
    }

    pub fn var(&mut self, method: MethodId, var: VarId) -> UivId {
        self.intern(Uiv::Var { method, var })
    }

    pub fn alloc(&mut self, method: MethodId, inst: InstId) -> UivId {
        self.intern(Uiv::Alloc { method, inst })
    }

    pub fn global(&mut self, symbol: SymbolId, offset: i32) -> UivId {
        self.intern(Uiv::Global { symbol, offset })
    }

    pub fn func(&mut self, method: MethodId) -> UivId {
        self.intern(Uiv::Func(method))
    }

    pub fn special(&mut self, stream: SpecialStream) -> UivId {
        self.intern(Uiv::Special(stream))
    }

    /// The UIV for the value at `offset` inside `inner`. Once `inner` sits at
    /// the nesting bound, `inner` itself stands for all deeper fields.
    pub fn field(&mut self, inner: UivId, offset: i32) -> UivId {
        if self.level(inner) >= self.max_nesting {
            return inner;
        }
        self.intern(Uiv::Field { inner, offset })
    }

    /// Like [`UivTable::field`], but never creates a new UIV.
    pub fn existing_field(&self, inner: UivId, offset: i32) -> Option<UivId> {
        if self.level(inner) >= self.max_nesting {
            return Some(inner);
        }
        self.lookup.get(&Uiv::Field { inner, offset }).copied()
    }

    /// Looks up an already interned UIV.
    pub fn find(&self, uiv: &Uiv) -> Option<UivId> {
        self.lookup.get(uiv).copied()
    }

    #[inline]
    pub fn get(&self, id: UivId) -> &Uiv {
        &self.uivs[id.index()].uiv
    }

    #[inline]
    pub fn base(&self, id: UivId) -> UivId {
        self.uivs[id.index()].base
    }

    /// Number of field wrappers around the base.
    #[inline]
    pub fn level(&self, id: UivId) -> u32 {
        self.uivs[id.index()].level
    }

    pub fn inner(&self, id: UivId) -> Option<(UivId, i32)> {
        match self.get(id) {
            Uiv::Field { inner, offset } => Some((*inner, *offset)),
            _ => None,
        }
    }

    pub fn is_field(&self, id: UivId) -> bool {
        matches!(self.get(id), Uiv::Field { .. })
    }

    pub fn is_func(&self, id: UivId) -> bool {
        matches!(self.get(id), Uiv::Func(_))
    }

    pub fn base_is_var(&self, id: UivId) -> bool {
        matches!(self.get(self.base(id)), Uiv::Var { .. })
    }

    pub fn base_is_global(&self, id: UivId) -> bool {
        matches!(self.get(self.base(id)), Uiv::Global { .. })
    }

    pub fn base_is_func(&self, id: UivId) -> bool {
        matches!(self.get(self.base(id)), Uiv::Func(_))
    }

    /// The variable a `Var`-based UIV originates from.
    pub fn base_var(&self, id: UivId) -> Option<(MethodId, VarId)> {
        match self.get(self.base(id)) {
            Uiv::Var { method, var } => Some((*method, *var)),
            _ => None,
        }
    }

    pub fn base_alloc(&self, id: UivId) -> Option<(MethodId, InstId)> {
        match self.get(self.base(id)) {
            Uiv::Alloc { method, inst } => Some((*method, *inst)),
            _ => None,
        }
    }

    pub fn func_method(&self, id: UivId) -> Option<MethodId> {
        match self.get(id) {
            Uiv::Func(method) => Some(*method),
            _ => None,
        }
    }

    /// The UIV `level` wrappers above the base (level 0 is the base).
    pub fn uiv_at_level(&self, id: UivId, level: u32) -> UivId {
        let mut current = id;
        while self.level(current) > level {
            match self.inner(current) {
                Some((inner, _)) => current = inner,
                None => break,
            }
        }
        current
    }

    /// The field offset applied at nesting `level` (1-based), or 0.
    pub fn field_offset_at_level(&self, id: UivId, level: u32) -> i32 {
        let uiv = self.uiv_at_level(id, level);
        match self.get(uiv) {
            Uiv::Field { offset, .. } if self.level(uiv) == level => *offset,
            _ => 0,
        }
    }

    /// The UIV itself and every UIV it is built from, down to the base.
    pub fn constituents(&self, id: UivId) -> Vec<UivId> {
        let mut uivs = vec![id];
        let mut current = id;
        while let Some((inner, _)) = self.inner(current) {
            uivs.push(inner);
            current = inner;
        }
        uivs
    }

    /// Whether `uiv` is `prefix` or built from `prefix` through field wrappers.
    pub fn is_prefix(&self, prefix: UivId, uiv: UivId) -> bool {
        if prefix == uiv {
            return true;
        }
        if self.base(prefix) != self.base(uiv) || self.level(prefix) >= self.level(uiv) {
            return false;
        }
        self.uiv_at_level(uiv, self.level(prefix)) == prefix
    }

    /// Total order over UIVs: base kind (variables, globals, allocations,
    /// functions, specials), then base key, then level, then field offsets.
    pub fn compare(&self, first: UivId, second: UivId) -> Ordering {
        if first == second {
            return Ordering::Equal;
        }
        let first_base = self.get(self.base(first));
        let second_base = self.get(self.base(second));
        let by_base = first_base
            .kind_rank()
            .cmp(&second_base.kind_rank())
            .then_with(|| match (first_base, second_base) {
                (Uiv::Var { method: m1, var: v1 }, Uiv::Var { method: m2, var: v2 }) => {
                    m1.cmp(m2).then(v1.cmp(v2))
                }
                (Uiv::Global { symbol: s1, offset: o1 }, Uiv::Global { symbol: s2, offset: o2 }) => {
                    s1.cmp(s2).then(o1.cmp(o2))
                }
                (Uiv::Alloc { method: m1, inst: i1 }, Uiv::Alloc { method: m2, inst: i2 }) => {
                    m1.cmp(m2).then(i1.cmp(i2))
                }
                (Uiv::Func(m1), Uiv::Func(m2)) => m1.cmp(m2),
                (Uiv::Special(s1), Uiv::Special(s2)) => s1.cmp(s2),
                _ => Ordering::Equal,
            });
        if by_base != Ordering::Equal {
            return by_base;
        }
        let by_level = self.level(first).cmp(&self.level(second));
        if by_level != Ordering::Equal {
            return by_level;
        }
        for level in 1..=self.level(first) {
            let by_offset = self
                .field_offset_at_level(first, level)
                .cmp(&self.field_offset_at_level(second, level));
            if by_offset != Ordering::Equal {
                return by_offset;
            }
        }
        first.cmp(&second)
    }

    /// A human readable rendering, e.g. `main:v3@8@16` or `g+4`.
    pub fn display(&self, id: UivId, ir: &dyn ProgramIr) -> String {
        match self.get(id) {
            Uiv::Var { method, var } => format!("{}:{:?}", ir.method_name(*method), var),
            Uiv::Alloc { method, inst } => format!("{}:alloc{}", ir.method_name(*method), inst.0),
            Uiv::Global { symbol, offset } if *offset == 0 => ir.symbol_name(*symbol).to_string(),
            Uiv::Global { symbol, offset } => format!("{}+{}", ir.symbol_name(*symbol), offset),
            Uiv::Func(method) => format!("&{}", ir.method_name(*method)),
            Uiv::Special(stream) => format!("{:?}", stream).to_lowercase(),
            Uiv::Field { inner, offset } => format!("[{}]@{}", self.display(*inner, ir), offset),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_test() {
        let mut table = UivTable::new(2);
        let a = table.var(MethodId(0), VarId(1));
        let b = table.var(MethodId(0), VarId(1));
        let c = table.var(MethodId(1), VarId(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        let f = table.field(a, 8);
        assert_eq!(table.field(a, 8), f);
        assert_eq!(table.base(f), a);
        assert_eq!(table.level(f), 1);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn nesting_bound_test() {
        let mut table = UivTable::new(1);
        let g = table.global(SymbolId(0), 0);
        let f1 = table.field(g, 8);
        let f2 = table.field(f1, 8);
        assert_ne!(f1, g);
        assert_eq!(f2, f1);

        let mut flat = UivTable::new(0);
        let g = flat.global(SymbolId(0), 0);
        assert_eq!(flat.field(g, 8), g);
    }

    #[test]
    fn prefix_test() {
        let mut table = UivTable::new(3);
        let v = table.var(MethodId(0), VarId(0));
        let f1 = table.field(v, 8);
        let f2 = table.field(f1, 4);
        let other = table.field(v, 4);
        assert!(table.is_prefix(v, f2));
        assert!(table.is_prefix(f1, f2));
        assert!(table.is_prefix(f2, f2));
        assert!(!table.is_prefix(other, f2));
        assert!(!table.is_prefix(f2, f1));
        assert_eq!(table.constituents(f2), vec![f2, f1, v]);
        assert_eq!(table.uiv_at_level(f2, 1), f1);
        assert_eq!(table.field_offset_at_level(f2, 1), 8);
        assert_eq!(table.field_offset_at_level(f2, 2), 4);
    }

    #[test]
    fn ordering_test() {
        let mut table = UivTable::new(2);
        let special = table.special(SpecialStream::Stdout);
        let func = table.func(MethodId(3));
        let alloc = table.alloc(MethodId(0), InstId(2));
        let global = table.global(SymbolId(1), 0);
        let var = table.var(MethodId(5), VarId(0));
        let field = table.field(var, 0);
        let mut uivs = vec![special, field, func, alloc, global, var];
        uivs.sort_by(|a, b| table.compare(*a, *b));
        assert_eq!(uivs, vec![var, field, global, alloc, func, special]);
    }
}
