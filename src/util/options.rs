// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Analysis options.

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};

const VLLPA_USAGE: &str = r#"vllpa [OPTIONS] PROGRAM.json"#;

/// Creates the clap::Command metadata for argument parsing.
fn make_options_parser() -> Command<'static> {
    let parser = Command::new("vllpa")
        .no_binary_name(true)
        .override_usage(VLLPA_USAGE)
        .version(env!("CARGO_PKG_VERSION"))
        .arg(Arg::new("entry")
            .long("entry")
            .takes_value(true)
            .help("The name of the entry method from which the analysis begins.")
            .long_help("Defaults to `main`, or to the first method with a body if there is none."))
        .arg(Arg::new("no-function-pointers")
            .long("no-function-pointers")
            .takes_value(false)
            .help("Link every possible callee of indirect calls instead of resolving function pointers."))
        .arg(Arg::new("no-known-calls")
            .long("no-known-calls")
            .takes_value(false)
            .help("Treat known library calls like any other library call."))
        .arg(Arg::new("no-type-infos")
            .long("no-type-infos")
            .takes_value(false)
            .help("Do not use static types to prune memory dependences."))
        .arg(Arg::new("program-stats")
            .long("program-stats")
            .takes_value(false)
            .help("Print the number of methods, operations and indirect calls before the analysis."))
        .arg(Arg::new("dependence-stats")
            .long("dependence-stats")
            .takes_value(false)
            .help("Print statistics about the memory dependences found."))
        .arg(Arg::new("memory-allocators")
            .long("memory-allocators")
            .takes_value(false)
            .help("Attach to every load and store the instructions defining the memory it accesses."))
        .arg(Arg::new("debug-method")
            .long("debug-method")
            .takes_value(true)
            .help("Print per-instruction details for the methods whose name matches this pattern."))
        .arg(Arg::new("max-outer-iterations")
            .long("max-outer-iterations")
            .takes_value(true)
            .value_parser(clap::value_parser!(u32))
            .help("Bound of the loop that links resolved function pointers."))
        .arg(Arg::new("max-uiv-nesting")
            .long("max-uiv-nesting")
            .takes_value(true)
            .value_parser(clap::value_parser!(u32))
            .help("The deepest nesting of field UIVs."))
        .arg(Arg::new("dump-stats")
            .long("dump-stats")
            .takes_value(false)
            .help("Dump the statistics of the analysis results."))
        .arg(Arg::new("call-graph-output")
            .long("dump-call-graph")
            .takes_value(true)
            .help("Dump the call graph in DOT format to the output file."))
        .arg(Arg::new("pts-output")
            .long("dump-pts")
            .takes_value(true)
            .help("Dump points-to results to the output file."))
        .arg(Arg::new("rw-sets-output")
            .long("dump-rw-sets")
            .takes_value(true)
            .help("Dump the read and write sets of every method to the output file."))
        .arg(Arg::new("INPUT")
            .help("The JSON program to be analyzed."));
    parser
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    pub entry: Option<String>,
    pub calculate_function_pointers: bool,
    pub use_known_calls: bool,
    pub use_type_infos: bool,
    pub print_program_stats: bool,
    pub print_dependence_stats: bool,
    pub provide_memory_allocators: bool,
    /// Methods whose name matches get per-instruction output.
    pub debug_method: Option<String>,
    pub max_outer_iterations: u32,
    pub max_uiv_nesting: u32,

    pub dump_stats: bool,
    pub call_graph_output: Option<String>,
    pub pts_output: Option<String>,
    pub rw_sets_output: Option<String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            entry: None,
            calculate_function_pointers: true,
            use_known_calls: true,
            use_type_infos: true,
            print_program_stats: false,
            print_dependence_stats: false,
            provide_memory_allocators: false,
            debug_method: None,
            max_outer_iterations: 10,
            max_uiv_nesting: 1,
            dump_stats: false,
            call_graph_output: None,
            pts_output: None,
            rw_sets_output: None,
        }
    }
}

/// A numeric environment flag is set when it parses to a non-zero number.
fn env_flag(value: &str) -> bool {
    value.trim().parse::<i64>().map_or(false, |v| v != 0)
}

impl AnalysisOptions {
    /// Applies the `DDG_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(v) = lookup("DDG_IP_CALCULATE_FUNCTION_POINTERS") {
            self.calculate_function_pointers = env_flag(&v);
        }
        if let Some(v) = lookup("DDG_IP_USE_KNOWN_CALLS") {
            self.use_known_calls = env_flag(&v);
        }
        if let Some(v) = lookup("DDG_IP_USE_TYPE_INFOS") {
            self.use_type_infos = env_flag(&v);
        }
        if let Some(v) = lookup("DDG_PRINT_PROGRAM_STATS") {
            self.print_program_stats = env_flag(&v);
        }
        if let Some(v) = lookup("DDG_PROVIDE_MEMORY_ALLOCATORS") {
            self.provide_memory_allocators = env_flag(&v);
        }
        if let Some(v) = lookup("DDG_IP_PRINT_MEMORY_DEPENDENCE_STATS") {
            self.print_dependence_stats = env_flag(&v);
        }
        if let Some(v) = lookup("DDG_IP_EXTENDED_PRINTDEBUG") {
            if !v.is_empty() {
                self.debug_method = Some(v);
            }
        }
    }

    /// Parses options from a list of strings and returns the input program
    /// path, if one was given. Help and version requests exit the process.
    pub fn parse_from_args(&mut self, args: &[String]) -> Result<Option<String>> {
        let matches = match make_options_parser().try_get_matches_from(args.iter()) {
            Ok(matches) => matches,
            Err(e) => match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
                _ => return Err(e.into()),
            },
        };
        self.apply_matches(&matches);
        Ok(matches.get_one::<String>("INPUT").cloned())
    }

    fn apply_matches(&mut self, matches: &ArgMatches) {
        if let Some(entry) = matches.get_one::<String>("entry") {
            self.entry = Some(entry.clone());
        }
        if matches.contains_id("no-function-pointers") {
            self.calculate_function_pointers = false;
        }
        if matches.contains_id("no-known-calls") {
            self.use_known_calls = false;
        }
        if matches.contains_id("no-type-infos") {
            self.use_type_infos = false;
        }
        if matches.contains_id("program-stats") {
            self.print_program_stats = true;
        }
        if matches.contains_id("dependence-stats") {
            self.print_dependence_stats = true;
        }
        if matches.contains_id("memory-allocators") {
            self.provide_memory_allocators = true;
        }
        if let Some(pattern) = matches.get_one::<String>("debug-method") {
            self.debug_method = Some(pattern.clone());
        }
        if let Some(bound) = matches.get_one::<u32>("max-outer-iterations") {
            self.max_outer_iterations = (*bound).max(1);
        }
        if let Some(nesting) = matches.get_one::<u32>("max-uiv-nesting") {
            self.max_uiv_nesting = (*nesting).max(1);
        }
        if matches.contains_id("dump-stats") {
            self.dump_stats = true;
        }
        if let Some(path) = matches.get_one::<String>("call-graph-output") {
            self.call_graph_output = Some(path.clone());
        }
        if let Some(path) = matches.get_one::<String>("pts-output") {
            self.pts_output = Some(path.clone());
        }
        if let Some(path) = matches.get_one::<String>("rw-sets-output") {
            self.rw_sets_output = Some(path.clone());
        }
    }
}
