// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Iteration bounds for the fixpoint loops of the analysis.
//!
//! Every loop converges on a correct implementation, so running past its
//! bound is an internal error. The guard aborts with enough context to find
//! the loop and the methods involved.

use itertools::Itertools;
use log::*;

use crate::ir::{MethodId, ProgramIr};

pub struct FixpointGuard {
    name: &'static str,
    bound: usize,
    iteration: usize,
}

impl FixpointGuard {
    pub fn new(name: &'static str, bound: usize) -> Self {
        FixpointGuard {
            name,
            bound: bound.max(1),
            iteration: 0,
        }
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Counts one more iteration. Panics once the bound is exceeded.
    pub fn tick(&mut self, ir: &dyn ProgramIr, methods: &[MethodId]) {
        self.iteration += 1;
        if self.iteration > self.bound {
            error!(
                "The {} loop did not converge after {} iterations",
                self.name, self.bound
            );
            panic!(
                "{} loop exceeded its bound of {} iterations (methods: {})",
                self.name,
                self.bound,
                methods.iter().map(|m| ir.method_name(*m)).join(", ")
            );
        }
    }
}
