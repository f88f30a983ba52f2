// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Memory usage monitoring. Currently only supported on Linux.

use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::*;
use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::map_res;
use nom::multi::count;
use nom::sequence::{terminated, tuple};
use nom::IResult;

/// Memory usage information processed from `/proc/[pid]/statm`.
///
/// All values are in units of pages.
///
/// See `man 5 proc` and `Linux/fs/proc/array.c`.
#[derive(Debug, Default, PartialEq, Eq, Hash)]
pub struct Statm {
    /// Total virtual memory size.
    pub size: usize,
    /// Resident non-swapped memory.
    pub resident: usize,
    /// Shared memory.
    pub share: usize,
    /// Resident executable memory.
    pub text: usize,
    /// Resident data and stack memory.
    pub data: usize,
}

/// Tracks the resident memory at the start of an analysis run and its peak
/// while the run lasts. A background thread samples `statm` until stopped.
pub struct MemoryWatcher {
    init_resident: usize,
    max_resident: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Default for MemoryWatcher {
    fn default() -> Self {
        MemoryWatcher {
            init_resident: 0,
            max_resident: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl MemoryWatcher {
    pub fn new() -> Self {
        match statm_self() {
            Ok(statm) => MemoryWatcher {
                init_resident: statm.resident,
                ..MemoryWatcher::default()
            },
            Err(e) => {
                debug!("Unable to read the statm file: {}", e);
                MemoryWatcher::default()
            }
        }
    }

    pub fn start(&mut self) {
        let max_resident = self.max_resident.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        self.handle = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                if let Ok(statm) = statm_self() {
                    max_resident.fetch_max(statm.resident, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(100));
            }
        }));
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("The memory watcher thread panicked");
            }
        }

        let max_rss = self.max_resident.load(Ordering::SeqCst);
        info!("Used Memory Before Analysis: {} MB", rss_in_megabytes(self.init_resident));
        info!("Max Memory in Analysis: {} MB", rss_in_megabytes(max_rss));
    }

    pub fn max_resident_pages(&self) -> usize {
        self.max_resident.load(Ordering::SeqCst)
    }
}

fn rss_in_megabytes(rss_pages: usize) -> usize {
    rss_pages * 4 / 1024
}

/// Transforms a `nom` parse result into an io result.
/// The parser must completely consume the input.
pub fn map_result<T>(result: IResult<&str, T>) -> Result<T> {
    match result {
        IResult::Ok((remaining, val)) => {
            if remaining.is_empty() {
                Ok(val)
            } else {
                Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unable to parse whole input, remaining: {:?}", remaining),
                ))
            }
        }
        IResult::Err(err) => Err(Error::new(
            ErrorKind::InvalidInput,
            format!("unable to parse input: {:?}", err),
        )),
    }
}

fn parse_usize(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

/// Parses the statm file format.
///
/// The columns in the statm file include: size resident shared text lib data dt
fn parse_statm(input: &str) -> IResult<&str, Statm> {
    tuple((count(terminated(parse_usize, tag(" ")), 6), parse_usize))(input).map(|(next_input, res)| {
        let statm = Statm {
            size: res.0[0],
            resident: res.0[1],
            share: res.0[2],
            text: res.0[3],
            data: res.0[5],
        };
        (next_input, statm)
    })
}

/// Returns memory status information for the current process.
pub fn statm_self() -> Result<Statm> {
    let buf = fs::read_to_string("/proc/self/statm")?;
    map_result(parse_statm(buf.trim()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_statm_test() {
        let statm = map_result(parse_statm("2200 800 300 50 0 600 0")).unwrap();
        assert_eq!(
            statm,
            Statm {
                size: 2200,
                resident: 800,
                share: 300,
                text: 50,
                data: 600,
            }
        );
        assert!(map_result(parse_statm("2200 800")).is_err());
        assert!(map_result(parse_statm("1 2 3 4 5 6 7 8")).is_err());
    }
}
