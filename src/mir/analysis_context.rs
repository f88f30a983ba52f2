// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use log::*;
use regex::Regex;

use crate::ir::{MethodId, ProgramIr};
use crate::pts_set::uiv::UivTable;
use crate::util::options::AnalysisOptions;

/// Global information of one analysis run.
pub struct AnalysisContext<'ir> {
    /// The analyzed program.
    pub ir: &'ir dyn ProgramIr,

    /// The entry method of the analysis.
    pub entry_point: MethodId,

    /// Options of the analysis.
    pub analysis_options: AnalysisOptions,

    /// Every UIV created during the run.
    pub uivs: UivTable,

    debug_filter: Option<Regex>,
}

impl<'ir> AnalysisContext<'ir> {
    /// Finds the entry method, by name if one is configured, otherwise
    /// `main` or the first method with a body.
    pub fn new(ir: &'ir dyn ProgramIr, analysis_options: AnalysisOptions) -> Option<Self> {
        info!("Initializing AnalysisContext");
        let methods = ir.methods();
        let by_name = |name: &str| {
            methods
                .iter()
                .copied()
                .find(|m| ir.has_body(*m) && ir.method_name(*m) == name)
        };
        let entry_point = match &analysis_options.entry {
            Some(name) => by_name(name),
            None => by_name("main").or_else(|| methods.iter().copied().find(|m| ir.has_body(*m))),
        };
        let Some(entry_point) = entry_point else {
            error!("Entry method not found");
            return None;
        };
        debug!("Entry method: {}", ir.method_name(entry_point));

        let debug_filter = analysis_options.debug_method.as_ref().map(|pattern| {
            Regex::new(&format!("^(?:{})$", pattern)).unwrap_or_else(|e| {
                warn!("Invalid debug method pattern {:?} ({}), matching it literally", pattern, e);
                // An escaped pattern always compiles.
                Regex::new(&format!("^{}$", regex::escape(pattern))).expect("escaped pattern")
            })
        });

        Some(AnalysisContext {
            ir,
            entry_point,
            uivs: UivTable::new(analysis_options.max_uiv_nesting),
            analysis_options,
            debug_filter,
        })
    }

    /// Whether per-instruction details are printed for `method`.
    pub fn is_debug_method(&self, method: MethodId) -> bool {
        match &self.debug_filter {
            Some(filter) => filter.is_match(self.ir.method_name(method)),
            None => false,
        }
    }

    pub fn method_name(&self, method: MethodId) -> &str {
        self.ir.method_name(method)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::program::Program;

    #[test]
    fn entry_point_test() {
        let mut program = Program::new();
        program.add_library("System.Int32 libstd.rand()", 0);
        let helper = program.add_method("helper", 0);
        let main = program.add_method("main", 0);
        let acx = AnalysisContext::new(&program, AnalysisOptions::default()).unwrap();
        assert_eq!(acx.entry_point, main);

        let options = AnalysisOptions {
            entry: Some("helper".to_string()),
            debug_method: Some("hel.*".to_string()),
            ..AnalysisOptions::default()
        };
        let acx = AnalysisContext::new(&program, options).unwrap();
        assert_eq!(acx.entry_point, helper);
        assert!(acx.is_debug_method(helper));
        assert!(!acx.is_debug_method(main));

        let options = AnalysisOptions {
            entry: Some("missing".to_string()),
            ..AnalysisOptions::default()
        };
        assert!(AnalysisContext::new(&program, options).is_none());
    }

    #[test]
    fn literal_debug_pattern_test() {
        let mut program = Program::new();
        let odd = program.add_method("f(", 0);
        let options = AnalysisOptions {
            debug_method: Some("f(".to_string()),
            ..AnalysisOptions::default()
        };
        let acx = AnalysisContext::new(&program, options).unwrap();
        assert!(acx.is_debug_method(odd));
    }
}
