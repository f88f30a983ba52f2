// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Very low-level pointer analysis (VLLPA).
//!
//! A whole-program, field-sensitive pointer analysis over a low-level,
//! SSA-form IR. Pointer values are described symbolically through
//! unknown initial values (UIVs), propagated bottom-up over the strongly
//! connected components of the call graph, and finally summarised as
//! per-method read/write sets and memory dependences between instructions.

#![allow(
    clippy::single_match,
    clippy::needless_return,
    clippy::len_zero,
    clippy::new_without_default
)]

pub mod graph;
pub mod ir;
pub mod mir;
pub mod pta;
pub mod pts_set;
pub mod util;
