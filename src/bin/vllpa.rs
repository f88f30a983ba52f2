// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The main routine of `vllpa`.
//!
//! Loads a program in JSON form, analyzes it from its entry method and
//! prints the memory dependences found.

use std::env;
use std::path::Path;

use anyhow::{bail, Result};
use log::*;

use vllpa::ir::program::Program;
use vllpa::ir::ProgramIr;
use vllpa::pta::analyze_program;
use vllpa::util::options::AnalysisOptions;

fn main() -> Result<()> {
    // Initialize loggers.
    if env::var("VLLPA_LOG").is_ok() {
        let e = env_logger::Env::new()
            .filter("VLLPA_LOG")
            .write_style("VLLPA_LOG_STYLE");
        env_logger::init_from_env(e);
    }

    // Options from the environment first, then VLLPA_FLAGS, then the
    // command line.
    let mut options = AnalysisOptions::default();
    options.apply_env();
    let vllpa_flags = env::var("VLLPA_FLAGS").unwrap_or_default();
    if !vllpa_flags.is_empty() {
        let flag_args: Vec<String> = serde_json::from_str(&vllpa_flags)?;
        options.parse_from_args(&flag_args)?;
    }
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(input) = options.parse_from_args(&args)? else {
        bail!("no input program given");
    };
    info!("VLLPA Options: {:?}", options);

    let mut program = Program::from_json_file(Path::new(&input))?;
    if analyze_program(&mut program, options).is_none() {
        bail!("no entry method found in {}", input);
    }

    for (method, from, to, kind) in program.dependences() {
        println!("{}: {} -> {} {:?}", program.method_name(method), from.0, to.0, kind);
    }
    Ok(())
}
