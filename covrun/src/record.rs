// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration and the measuring side of a coverage run.
//!
//! The platform-independent part lives here: validated start info, run
//! settings, and the planning step that turns a loaded module into model
//! entries plus breakpoint requests. The Windows recorder drives it from
//! debug events.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::filter::{CoverageFilter, SelectionPatterns};
use crate::model::RunCoverage;
use crate::resolve::LineResolver;
use crate::sink::CoverageSink;

#[cfg(windows)]
pub mod windows;

#[cfg(windows)]
#[doc(inline)]
pub use windows::{run_coverage, run_coverage_cancelable};

/// User-visible error line emitted when the debuggee dies of an exception
/// its own handlers declined.
pub const UNHANDLED_EXCEPTION_ERROR: &str = "Unhandled exception occurred";

#[derive(Debug, Error)]
pub enum CoverageError {
    /// The target path or working directory is empty or missing. Nothing
    /// was spawned.
    #[error("invalid start info: {0}")]
    InvalidStartInfo(String),

    /// The OS debug-event wait/continue protocol failed; the run aborted.
    #[error("debug event protocol failure: {0}")]
    DebugEventProtocolFailure(anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How to start the target process.
#[derive(Clone, Debug)]
pub struct StartInfo {
    path: PathBuf,
    working_dir: Option<PathBuf>,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
}

impl StartInfo {
    /// The target must exist; validated here, before anything is spawned.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CoverageError> {
        let path = path.as_ref();

        if path.as_os_str().is_empty() {
            return Err(CoverageError::InvalidStartInfo(
                "target path is empty".into(),
            ));
        }

        let path = dunce::canonicalize(path).map_err(|e| {
            CoverageError::InvalidStartInfo(format!("target {}: {}", path.display(), e))
        })?;

        if !path.is_file() {
            return Err(CoverageError::InvalidStartInfo(format!(
                "target {} is not a file",
                path.display()
            )));
        }

        Ok(Self {
            path,
            working_dir: None,
            args: Vec::new(),
            env: BTreeMap::new(),
        })
    }

    /// The working directory must exist when assigned.
    pub fn set_working_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), CoverageError> {
        let dir = dir.as_ref();

        if !dir.is_dir() {
            return Err(CoverageError::InvalidStartInfo(format!(
                "working directory {} does not exist",
                dir.display()
            )));
        }

        self.working_dir = Some(dir.to_path_buf());
        Ok(())
    }

    pub fn arg(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// The name the run is reported under, e.g. `target.exe`.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Build the `Command` this start info describes.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.path);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// What to measure: glob patterns per dimension.
#[derive(Clone, Debug, Default)]
pub struct RunSettings {
    pub module_patterns: SelectionPatterns,
    pub source_patterns: SelectionPatterns,
}

/// Back-reference from an installed breakpoint into the coverage tree.
///
/// Breakpoints reference lines but do not own them; the indices stay valid
/// because model entries are never removed during a run.
#[derive(Clone, Copy, Debug)]
pub struct LineRef {
    pub module: usize,
    pub file: usize,
    pub line: u32,
}

/// A breakpoint the recorder wants installed for one line site.
#[derive(Clone, Copy, Debug)]
pub struct PlannedBreakpoint {
    pub address: u64,
    pub line: LineRef,
}

/// Add a loaded module to the run and work out the breakpoints it needs.
///
/// Returns `None` when the module is not selected at all. A module whose
/// lines cannot be resolved stays in the run with zero lines and an empty
/// plan; a warning goes to the sink. Lines themselves are added to the model
/// only once their breakpoint is actually installed.
pub fn plan_module(
    run: &mut RunCoverage,
    filter: &CoverageFilter,
    resolver: &mut dyn LineResolver,
    sink: &mut dyn CoverageSink,
    module_path: &Path,
    base_address: u64,
) -> Option<Vec<PlannedBreakpoint>> {
    if !filter.is_module_selected(module_path) {
        return None;
    }

    let module = run.add_module(module_path);

    let sites = match resolver.module_lines(module_path, base_address) {
        Ok(sites) => sites,
        Err(err) => {
            sink.warning(&format!(
                "cannot resolve lines for {}: {}",
                module_path.display(),
                err
            ));
            return Some(Vec::new());
        }
    };

    let mut plan = Vec::new();
    for site in sites {
        if !filter.is_source_selected(&site.source) {
            continue;
        }

        let file = run.module_at_mut(module).add_file(&site.source);
        plan.push(PlannedBreakpoint {
            address: site.address,
            line: LineRef {
                module,
                file,
                line: site.line,
            },
        });
    }

    Some(plan)
}

/// Record an installed breakpoint's line in the model, not yet executed.
pub fn add_planned_line(run: &mut RunCoverage, line: &LineRef) {
    run.module_at_mut(line.module)
        .file_at_mut(line.file)
        .add_line(line.line, false);
}

/// Mark a line executed on breakpoint hit.
pub fn mark_line(run: &mut RunCoverage, line: &LineRef) {
    run.module_at_mut(line.module)
        .file_at_mut(line.file)
        .add_line(line.line, true);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::filter::PatternSet;
    use crate::resolve::{LineSite, ResolveError};

    #[derive(Default)]
    struct StubResolver {
        tables: BTreeMap<PathBuf, Vec<LineSite>>,
    }

    impl StubResolver {
        fn with_module(mut self, module: &str, sites: Vec<LineSite>) -> Self {
            self.tables.insert(PathBuf::from(module), sites);
            self
        }
    }

    impl LineResolver for StubResolver {
        fn module_lines(
            &mut self,
            module: &Path,
            _base_address: u64,
        ) -> Result<Vec<LineSite>, ResolveError> {
            self.tables
                .get(module)
                .cloned()
                .ok_or_else(|| ResolveError::SymbolInfoUnavailable(module.to_path_buf()))
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        warnings: Vec<String>,
        errors: Vec<String>,
    }

    impl CoverageSink for CapturingSink {
        fn info(&mut self, _message: &str) {}

        fn warning(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }

        fn error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
    }

    fn filter(modules: &[&str], sources: &[&str]) -> Result<CoverageFilter> {
        let modules = SelectionPatterns {
            selected: modules.iter().map(|s| s.to_string()).collect(),
            excluded: Vec::new(),
        };
        let sources = SelectionPatterns {
            selected: sources.iter().map(|s| s.to_string()).collect(),
            excluded: Vec::new(),
        };
        Ok(CoverageFilter::new(
            PatternSet::compile(&modules)?,
            PatternSet::compile(&sources)?,
        ))
    }

    #[test]
    fn test_start_info_empty_path() {
        let result = StartInfo::new("");
        assert!(matches!(result, Err(CoverageError::InvalidStartInfo(_))));
    }

    #[test]
    fn test_start_info_missing_path() {
        let result = StartInfo::new("does/not/exist/target.exe");
        assert!(matches!(result, Err(CoverageError::InvalidStartInfo(_))));
    }

    #[test]
    fn test_start_info_valid_path() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;

        let start_info = StartInfo::new(file.path());
        assert!(start_info.is_ok());

        Ok(())
    }

    #[test]
    fn test_start_info_working_dir_validation() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let mut start_info = StartInfo::new(file.path()).unwrap();

        let missing = start_info.set_working_dir("");
        assert!(matches!(missing, Err(CoverageError::InvalidStartInfo(_))));

        let missing = start_info.set_working_dir("does/not/exist");
        assert!(matches!(missing, Err(CoverageError::InvalidStartInfo(_))));

        let dir = tempfile::tempdir()?;
        start_info.set_working_dir(dir.path()).unwrap();
        assert_eq!(start_info.working_dir(), Some(dir.path()));

        Ok(())
    }

    #[test]
    fn test_start_info_display_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("target.exe");
        std::fs::write(&target, b"")?;

        let start_info = StartInfo::new(&target).unwrap();
        assert_eq!(start_info.display_name(), "target.exe");

        Ok(())
    }

    #[test]
    fn test_plan_skips_unselected_modules() -> Result<()> {
        let mut run = RunCoverage::new("test");
        let filter = filter(&[r"*\a.exe"], &["*"])?;
        let mut resolver = StubResolver::default()
            .with_module(r"c:\bin\a.exe", vec![LineSite::new(r"c:\src\a.cpp", 1, 0x1000)])
            .with_module(r"c:\bin\b.dll", vec![LineSite::new(r"c:\src\b.cpp", 1, 0x2000)]);
        let mut sink = CapturingSink::default();

        let plan = plan_module(
            &mut run,
            &filter,
            &mut resolver,
            &mut sink,
            Path::new(r"c:\bin\a.exe"),
            0x0040_0000,
        );
        assert_eq!(plan.map(|p| p.len()), Some(1));

        let plan = plan_module(
            &mut run,
            &filter,
            &mut resolver,
            &mut sink,
            Path::new(r"c:\bin\b.dll"),
            0x1000_0000,
        );
        assert!(plan.is_none());

        // Only the selected module appears in the run.
        let paths: Vec<&Path> = run.modules().iter().map(|m| m.path()).collect();
        assert_eq!(paths, vec![Path::new(r"c:\bin\a.exe")]);

        Ok(())
    }

    #[test]
    fn test_plan_module_without_symbols_keeps_module() -> Result<()> {
        let mut run = RunCoverage::new("test");
        let filter = filter(&["*"], &["*"])?;
        let mut resolver = StubResolver::default();
        let mut sink = CapturingSink::default();

        let plan = plan_module(
            &mut run,
            &filter,
            &mut resolver,
            &mut sink,
            Path::new(r"c:\bin\nosyms.exe"),
            0x0040_0000,
        );

        assert_eq!(plan.map(|p| p.len()), Some(0));
        assert_eq!(run.modules().len(), 1);
        assert!(run.modules()[0].files().is_empty());
        assert_eq!(sink.warnings.len(), 1);
        assert!(sink.warnings[0].contains("nosyms.exe"));

        Ok(())
    }

    #[test]
    fn test_plan_filters_sources_and_marks_lines() -> Result<()> {
        let mut run = RunCoverage::new("test");
        let filter = filter(&["*"], &["*.cpp"])?;
        let mut resolver = StubResolver::default().with_module(
            r"c:\bin\a.exe",
            vec![
                LineSite::new(r"c:\src\main.cpp", 43, 0x1000),
                LineSite::new(r"c:\src\main.cpp", 44, 0x1004),
                LineSite::new(r"c:\src\main.cpp", 46, 0x1010),
                LineSite::new(r"c:\inc\main.h", 7, 0x1020),
            ],
        );
        let mut sink = CapturingSink::default();

        let plan = plan_module(
            &mut run,
            &filter,
            &mut resolver,
            &mut sink,
            Path::new(r"c:\bin\a.exe"),
            0x0040_0000,
        )
        .unwrap();

        // The header line is filtered out by the source patterns.
        assert_eq!(plan.len(), 3);

        // Simulate installs, then hits on lines 43 and 44 only.
        for planned in &plan {
            add_planned_line(&mut run, &planned.line);
        }
        for planned in &plan {
            if planned.line.line != 46 {
                mark_line(&mut run, &planned.line);
            }
        }

        run.compute_rates();

        let module = run.module(Path::new(r"c:\bin\a.exe")).unwrap();
        assert_eq!(module.files().len(), 1);

        let file = module.file(Path::new(r"c:\src\main.cpp")).unwrap();
        assert!(file.line(43).unwrap().executed);
        assert!(file.line(44).unwrap().executed);
        assert!(file.line(45).is_none());
        assert!(!file.line(46).unwrap().executed);

        assert_eq!(
            run.rate(),
            crate::model::CoverageRate {
                covered: 2,
                total: 3
            }
        );

        Ok(())
    }

    #[test]
    fn test_unhandled_exception_error_line() {
        let mut sink = CapturingSink::default();
        sink.error(UNHANDLED_EXCEPTION_ERROR);

        assert!(sink.errors.iter().any(|e| e.contains("Unhandled exception")));
        assert_eq!(sink.errors[0], "Unhandled exception occurred");
    }
}
