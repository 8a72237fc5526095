// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The in-memory coverage tree: a run holds modules, modules hold source
//! files, files hold lines. Rates are computed bottom-up once, after the
//! target has exited.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Executed vs known-executable line counts at some scope.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CoverageRate {
    pub covered: u64,
    pub total: u64,
}

impl CoverageRate {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.covered as f64 / self.total as f64
        }
    }

    fn add(&mut self, rhs: CoverageRate) {
        self.covered += rhs.covered;
        self.total += rhs.total;
    }
}

/// One source line known to have code.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LineCoverage {
    /// 1-indexed line number.
    pub number: u32,

    pub executed: bool,
}

/// One source file contributing code to a module.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SourceFileCoverage {
    path: PathBuf,
    lines: BTreeMap<u32, LineCoverage>,
    rate: CoverageRate,
}

impl SourceFileCoverage {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lines: BTreeMap::new(),
            rate: CoverageRate::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert the line if absent. A line already marked executed stays
    /// executed, whatever `executed` says.
    pub fn add_line(&mut self, number: u32, executed: bool) {
        let line = self.lines.entry(number).or_insert(LineCoverage {
            number,
            executed: false,
        });
        line.executed |= executed;
    }

    pub fn line(&self, number: u32) -> Option<&LineCoverage> {
        self.lines.get(&number)
    }

    /// Lines in ascending line-number order.
    pub fn lines(&self) -> impl Iterator<Item = &LineCoverage> {
        self.lines.values()
    }

    pub fn rate(&self) -> CoverageRate {
        self.rate
    }

    fn compute_rate(&mut self) {
        self.rate = CoverageRate {
            covered: self.lines.values().filter(|line| line.executed).count() as u64,
            total: self.lines.len() as u64,
        };
    }
}

/// One loaded executable image (main EXE or DLL). Stays in the run for its
/// whole lifetime, even if the image is unloaded mid-run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ModuleCoverage {
    path: PathBuf,
    files: Vec<SourceFileCoverage>,
    rate: CoverageRate,
}

impl ModuleCoverage {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            files: Vec::new(),
            rate: CoverageRate::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index of the file entry for `path`, inserting if absent. Files keep
    /// insertion order.
    pub fn add_file(&mut self, path: &Path) -> usize {
        if let Some(index) = self.files.iter().position(|file| file.path == path) {
            return index;
        }

        self.files.push(SourceFileCoverage::new(path.to_path_buf()));
        self.files.len() - 1
    }

    pub fn file(&self, path: &Path) -> Option<&SourceFileCoverage> {
        self.files.iter().find(|file| file.path == path)
    }

    /// Panics if `index` was not returned by `add_file`.
    pub fn file_at_mut(&mut self, index: usize) -> &mut SourceFileCoverage {
        &mut self.files[index]
    }

    pub fn files(&self) -> &[SourceFileCoverage] {
        &self.files
    }

    pub fn rate(&self) -> CoverageRate {
        self.rate
    }

    fn compute_rate(&mut self) {
        let mut rate = CoverageRate::default();
        for file in &mut self.files {
            file.compute_rate();
            rate.add(file.rate);
        }
        self.rate = rate;
    }
}

/// Top-level result of a single coverage run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RunCoverage {
    name: String,
    exit_code: i32,
    modules: Vec<ModuleCoverage>,
    rate: CoverageRate,
}

impl RunCoverage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit_code: 0,
            modules: Vec::new(),
            rate: CoverageRate::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, exit_code: i32) {
        self.exit_code = exit_code;
    }

    /// Index of the module entry for `path`, inserting if absent. Modules
    /// keep insertion order.
    pub fn add_module(&mut self, path: &Path) -> usize {
        if let Some(index) = self.modules.iter().position(|module| module.path == path) {
            return index;
        }

        self.modules.push(ModuleCoverage::new(path.to_path_buf()));
        self.modules.len() - 1
    }

    pub fn module(&self, path: &Path) -> Option<&ModuleCoverage> {
        self.modules.iter().find(|module| module.path == path)
    }

    /// Panics if `index` was not returned by `add_module`.
    pub fn module_at_mut(&mut self, index: usize) -> &mut ModuleCoverage {
        &mut self.modules[index]
    }

    pub fn modules(&self) -> &[ModuleCoverage] {
        &self.modules
    }

    pub fn rate(&self) -> CoverageRate {
        self.rate
    }

    /// Walk the tree bottom-up exactly once, at the end of the run.
    pub fn compute_rates(&mut self) {
        let mut rate = CoverageRate::default();
        for module in &mut self.modules {
            module.compute_rate();
            rate.add(module.rate);
        }
        self.rate = rate;
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_add_line_or_combines() {
        let mut run = RunCoverage::new("test");
        let module = run.add_module(Path::new("a.exe"));
        let file = run.module_at_mut(module).add_file(Path::new("a.cpp"));

        let file = run.module_at_mut(module).file_at_mut(file);
        file.add_line(10, false);
        file.add_line(10, true);
        file.add_line(10, false);

        let line = file.line(10).unwrap();
        assert!(line.executed);
        assert_eq!(line.number, 10);
    }

    #[test]
    fn test_lines_iterate_in_ascending_order() {
        let mut run = RunCoverage::new("test");
        let module = run.add_module(Path::new("a.exe"));
        let file = run.module_at_mut(module).add_file(Path::new("a.cpp"));

        let file = run.module_at_mut(module).file_at_mut(file);
        file.add_line(44, true);
        file.add_line(7, false);
        file.add_line(100, false);

        let numbers: Vec<u32> = file.lines().map(|line| line.number).collect();
        assert_eq!(numbers, vec![7, 44, 100]);
    }

    #[test]
    fn test_missing_line_lookup() {
        let mut run = RunCoverage::new("test");
        let module = run.add_module(Path::new("a.exe"));
        let file = run.module_at_mut(module).add_file(Path::new("a.cpp"));

        let file = run.module_at_mut(module).file_at_mut(file);
        file.add_line(43, true);

        assert!(file.line(45).is_none());
    }

    #[test]
    fn test_modules_and_files_keep_insertion_order() {
        let mut run = RunCoverage::new("test");
        run.add_module(Path::new("b.dll"));
        run.add_module(Path::new("a.exe"));
        run.add_module(Path::new("b.dll"));

        let paths: Vec<&Path> = run.modules().iter().map(|m| m.path()).collect();
        assert_eq!(paths, vec![Path::new("b.dll"), Path::new("a.exe")]);

        let module = run.add_module(Path::new("b.dll"));
        assert_eq!(module, 0);

        run.module_at_mut(module).add_file(Path::new("z.cpp"));
        run.module_at_mut(module).add_file(Path::new("a.cpp"));
        run.module_at_mut(module).add_file(Path::new("z.cpp"));

        let files: Vec<&Path> = run
            .module_at_mut(module)
            .files()
            .iter()
            .map(|f| f.path())
            .collect();
        assert_eq!(files, vec![Path::new("z.cpp"), Path::new("a.cpp")]);
    }

    #[test]
    fn test_rates_sum_bottom_up() -> Result<()> {
        let mut run = RunCoverage::new("test");

        let module = run.add_module(Path::new("a.exe"));
        let file = run.module_at_mut(module).add_file(Path::new("a.cpp"));
        {
            let file = run.module_at_mut(module).file_at_mut(file);
            file.add_line(1, true);
            file.add_line(2, true);
            file.add_line(3, false);
        }

        let module = run.add_module(Path::new("b.dll"));
        let file = run.module_at_mut(module).add_file(Path::new("b.cpp"));
        {
            let file = run.module_at_mut(module).file_at_mut(file);
            file.add_line(5, false);
        }

        run.compute_rates();

        assert_eq!(
            run.rate(),
            CoverageRate {
                covered: 2,
                total: 4
            }
        );

        let total: u64 = run.modules().iter().map(|m| m.rate().total).sum();
        assert_eq!(run.rate().total, total);
        assert!(run.rate().covered <= run.rate().total);

        let a = run.module(Path::new("a.exe")).unwrap();
        assert_eq!(
            a.rate(),
            CoverageRate {
                covered: 2,
                total: 3
            }
        );
        assert!((a.rate().ratio() - 2.0 / 3.0).abs() < 1e-9);

        Ok(())
    }

    #[test]
    fn test_empty_rate_ratio() {
        let mut run = RunCoverage::new("test");
        run.compute_rates();
        assert_eq!(run.rate(), CoverageRate::default());
        assert_eq!(run.rate().ratio(), 0.0);
    }

    #[test]
    fn test_model_serializes() -> Result<()> {
        let mut run = RunCoverage::new("test");
        run.set_exit_code(3);
        let module = run.add_module(Path::new("a.exe"));
        let file = run.module_at_mut(module).add_file(Path::new("a.cpp"));
        run.module_at_mut(module)
            .file_at_mut(file)
            .add_line(43, true);
        run.compute_rates();

        let text = serde_json::to_string(&run)?;
        let de: RunCoverage = serde_json::from_str(&text)?;
        assert_eq!(de, run);

        Ok(())
    }
}
