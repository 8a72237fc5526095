// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Line coverage for native Windows binaries.
//!
//! A target is run as a debugged child process. For every loaded module that
//! passes the configured filters, the PDB line tables are turned into
//! software breakpoints; servicing those breakpoints records which source
//! lines executed. The result is an in-memory run/module/file/line tree with
//! computed coverage rates, which callers can render as text or Cobertura
//! XML.

pub mod filter;
pub mod model;
pub mod record;
pub mod report;
pub mod resolve;
pub mod sink;

#[cfg(windows)]
pub mod pdb;

#[doc(inline)]
pub use crate::{
    filter::{CoverageFilter, PatternSet, SelectionPatterns},
    model::{CoverageRate, LineCoverage, ModuleCoverage, RunCoverage, SourceFileCoverage},
    record::{CoverageError, RunSettings, StartInfo, UNHANDLED_EXCEPTION_ERROR},
    resolve::{LineResolver, LineSite, ResolveError},
    sink::{CoverageSink, LogSink},
};

#[cfg(windows)]
#[doc(inline)]
pub use crate::record::{run_coverage, run_coverage_cancelable};

#[cfg(windows)]
pub use debugger::CancelHandle;
