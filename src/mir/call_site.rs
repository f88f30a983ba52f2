// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use serde::{Deserialize, Serialize};

use crate::ir::{InstId, MethodId, ProgramIr};
use crate::mir::known_names::{self, KnownCall};
use crate::util::options::AnalysisOptions;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
/// The classification of one call target
pub enum CallType {
    // Calls to a method whose body is analyzed
    Normal,
    // Calls to a library method with unknown effects
    Library,
    // Calls whose effects are summarised by hand
    Known(KnownCall),
}

impl CallType {
    /// Classifies a call to `callee`. Known summaries are only used when
    /// enabled; a known signature wins over an analyzable body.
    pub fn classify(ir: &dyn ProgramIr, options: &AnalysisOptions, callee: MethodId) -> CallType {
        let known = if options.use_known_calls {
            known_names::classify(ir.signature(callee))
        } else {
            None
        };
        match known {
            Some(known) => CallType::Known(known),
            None if ir.is_library(callee) || !ir.has_body(callee) => CallType::Library,
            None => CallType::Normal,
        }
    }

    /// The classification used when setting up UIVs: allocation functions
    /// and the stream table are recognised even without known summaries.
    pub fn classify_for_init(ir: &dyn ProgramIr, options: &AnalysisOptions, callee: MethodId) -> CallType {
        match CallType::classify(ir, options, callee) {
            CallType::Known(known) => CallType::Known(known),
            other => match known_names::classify(ir.signature(callee)) {
                Some(known @ (KnownCall::Malloc | KnownCall::Calloc | KnownCall::IoFtableGetEntry)) => {
                    CallType::Known(known)
                }
                _ => other,
            },
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, CallType::Normal)
    }

    pub fn is_library(&self) -> bool {
        matches!(self, CallType::Library)
    }
}

/// One resolved target of a call instruction. An indirect call has one
/// record per target linked so far.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct CallSite {
    pub inst: InstId,
    pub call_type: CallType,
    pub callee: MethodId,
    pub indirect: bool,
}

impl CallSite {
    pub fn new(inst: InstId, call_type: CallType, callee: MethodId, indirect: bool) -> Self {
        CallSite {
            inst,
            call_type,
            callee,
            indirect,
        }
    }
}
