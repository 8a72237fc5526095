// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives a coverage run from Win32 debug events.

use std::collections::BTreeMap;

use debugger::{
    BreakpointId, CancelHandle, DebugEventHandler, Debugger, ExceptionEvent, ModuleLoadInfo,
    DBG_EXCEPTION_NOT_HANDLED,
};
use log::{debug, warn};

use crate::filter::{CoverageFilter, PatternSet};
use crate::model::RunCoverage;
use crate::pdb::PdbLineResolver;
use crate::record::{
    add_planned_line, mark_line, plan_module, CoverageError, LineRef, RunSettings, StartInfo,
    UNHANDLED_EXCEPTION_ERROR,
};
use crate::resolve::LineResolver;
use crate::sink::CoverageSink;

/// Measure line coverage of `start_info`'s target, restricted by the
/// patterns in `settings`, and return the populated run.
pub fn run_coverage(
    start_info: &StartInfo,
    settings: &RunSettings,
    sink: &mut dyn CoverageSink,
) -> Result<RunCoverage, CoverageError> {
    run_coverage_cancelable(start_info, settings, sink, &CancelHandle::new())
}

/// Like [`run_coverage`], but `cancel` can abort the run from another
/// thread by terminating the target tree. The pump observes the resulting
/// exit events and the populated run is still returned, carrying whatever
/// exit code the OS supplied.
pub fn run_coverage_cancelable(
    start_info: &StartInfo,
    settings: &RunSettings,
    sink: &mut dyn CoverageSink,
    cancel: &CancelHandle,
) -> Result<RunCoverage, CoverageError> {
    let filter = CoverageFilter::new(
        PatternSet::compile(&settings.module_patterns)?,
        PatternSet::compile(&settings.source_patterns)?,
    );

    let mut recorder = CoverageRecorder::new(
        start_info.display_name(),
        filter,
        Box::new(PdbLineResolver),
        sink,
    );

    let (mut dbg, mut child) = Debugger::launch(start_info.command(), &mut recorder, cancel.clone())
        .map_err(CoverageError::DebugEventProtocolFailure)?;
    dbg.run(&mut recorder)
        .map_err(CoverageError::DebugEventProtocolFailure)?;

    // The target has exited once the pump returns; this only reaps it.
    let _ = child.wait();

    let mut run = recorder.run;
    if let Some(exit_code) = dbg.exit_code() {
        run.set_exit_code(exit_code as i32);
    }
    run.compute_rates();

    Ok(run)
}

struct CoverageRecorder<'s> {
    run: RunCoverage,
    filter: CoverageFilter,
    resolver: Box<dyn LineResolver>,
    sink: &'s mut dyn CoverageSink,

    // Installed breakpoints back-reference their lines; several lines can
    // share one address when the compiler folds them together.
    breakpoints: BTreeMap<BreakpointId, Vec<LineRef>>,

    unhandled_exception_seen: bool,
}

impl<'s> CoverageRecorder<'s> {
    fn new(
        name: String,
        filter: CoverageFilter,
        resolver: Box<dyn LineResolver>,
        sink: &'s mut dyn CoverageSink,
    ) -> Self {
        Self {
            run: RunCoverage::new(name),
            filter,
            resolver,
            sink,
            breakpoints: BTreeMap::new(),
            unhandled_exception_seen: false,
        }
    }

    fn insert_module(&mut self, dbg: &mut Debugger, module: &ModuleLoadInfo) {
        let path = dunce::canonicalize(module.path())
            .unwrap_or_else(|_| module.path().to_path_buf());

        let plan = plan_module(
            &mut self.run,
            &self.filter,
            self.resolver.as_mut(),
            self.sink,
            &path,
            module.base_address(),
        );

        let Some(plan) = plan else {
            debug!("module not selected: {}", path.display());
            return;
        };

        for planned in plan {
            match dbg.set_coverage_breakpoint(planned.address) {
                Ok(id) => {
                    add_planned_line(&mut self.run, &planned.line);
                    self.breakpoints.entry(id).or_default().push(planned.line);
                }
                Err(err) => {
                    // The line is omitted from the run; coverage continues.
                    self.sink.warning(&format!(
                        "failed to install breakpoint at 0x{:x} in {}: {}",
                        planned.address,
                        path.display(),
                        err
                    ));
                }
            }
        }
    }
}

impl DebugEventHandler for CoverageRecorder<'_> {
    fn on_create_process(&mut self, dbg: &mut Debugger, module: &ModuleLoadInfo) {
        self.insert_module(dbg, module);
    }

    fn on_load_dll(&mut self, dbg: &mut Debugger, module: &ModuleLoadInfo) {
        self.insert_module(dbg, module);
    }

    fn on_breakpoint(&mut self, _dbg: &mut Debugger, id: BreakpointId) {
        if let Some(lines) = self.breakpoints.get(&id) {
            for line in lines {
                mark_line(&mut self.run, line);
            }
        } else {
            warn!("hit unregistered breakpoint {:?}", id);
        }
    }

    fn on_exception(&mut self, _dbg: &mut Debugger, event: &ExceptionEvent) -> u32 {
        if !event.first_chance && !self.unhandled_exception_seen {
            self.unhandled_exception_seen = true;
            self.sink.error(UNHANDLED_EXCEPTION_ERROR);
        }

        // Always let the debuggee's own handling run its course.
        DBG_EXCEPTION_NOT_HANDLED
    }

    fn on_output_debug_string(&mut self, _dbg: &mut Debugger, message: String) {
        self.sink.info(message.trim_end());
    }
}
