// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decides which module and source paths a run measures, from shell-style
//! glob patterns matched case-insensitively against full paths.

use std::path::Path;

use anyhow::Result;
use regex::Regex;

/// Raw glob patterns for one path dimension, as carried by run settings.
///
/// Globs support `*` (any run of characters) and `?` (one character).
/// There are no `**` semantics; patterns apply to full paths as flat
/// strings, separators included.
#[derive(Clone, Debug, Default)]
pub struct SelectionPatterns {
    pub selected: Vec<String>,
    pub excluded: Vec<String>,
}

impl SelectionPatterns {
    pub fn select(mut self, glob: impl Into<String>) -> Self {
        self.selected.push(glob.into());
        self
    }

    pub fn exclude(mut self, glob: impl Into<String>) -> Self {
        self.excluded.push(glob.into());
        self
    }
}

/// Compiled patterns for one path dimension.
#[derive(Clone, Debug, Default)]
pub struct PatternSet {
    selected: Vec<Regex>,
    excluded: Vec<Regex>,
}

impl PatternSet {
    pub fn compile(patterns: &SelectionPatterns) -> Result<Self> {
        let selected = patterns
            .selected
            .iter()
            .map(|glob| glob_to_regex(glob))
            .collect::<Result<_>>()?;
        let excluded = patterns
            .excluded
            .iter()
            .map(|glob| glob_to_regex(glob))
            .collect::<Result<_>>()?;

        Ok(Self { selected, excluded })
    }

    /// A path matches iff it matches at least one selected pattern and no
    /// excluded pattern. An empty selected set matches nothing.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.to_lowercase();

        if !self.selected.iter().any(|re| re.is_match(&path)) {
            return false;
        }

        !self.excluded.iter().any(|re| re.is_match(&path))
    }
}

/// The two filter dimensions of a run: which loaded modules to measure, and
/// which source files within them.
#[derive(Clone, Debug, Default)]
pub struct CoverageFilter {
    modules: PatternSet,
    sources: PatternSet,
}

impl CoverageFilter {
    pub fn new(modules: PatternSet, sources: PatternSet) -> Self {
        Self { modules, sources }
    }

    pub fn is_module_selected(&self, path: &Path) -> bool {
        self.modules.matches(&path.to_string_lossy())
    }

    pub fn is_source_selected(&self, path: &Path) -> bool {
        self.sources.matches(&path.to_string_lossy())
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    // Patterns are case-folded once here; `matches` lowercases its inputs.
    let mut expr = String::from("^");
    let mut literal = String::new();

    for c in glob.to_lowercase().chars() {
        match c {
            '*' | '?' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }

    expr.push_str(&regex::escape(&literal));
    expr.push('$');

    Ok(Regex::new(&expr)?)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::Result;

    use super::*;

    fn set(selected: &[&str], excluded: &[&str]) -> Result<PatternSet> {
        let patterns = SelectionPatterns {
            selected: selected.iter().map(|s| s.to_string()).collect(),
            excluded: excluded.iter().map(|s| s.to_string()).collect(),
        };
        PatternSet::compile(&patterns)
    }

    #[test]
    fn test_empty_selected_matches_nothing() -> Result<()> {
        let patterns = set(&[], &[])?;

        assert!(!patterns.matches(r"c:\src\a.cpp"));
        assert!(!patterns.matches(""));

        Ok(())
    }

    #[test]
    fn test_star_matches_everything() -> Result<()> {
        let patterns = set(&["*"], &[])?;

        assert!(patterns.matches(r"c:\src\a.cpp"));
        assert!(patterns.matches(""));

        Ok(())
    }

    #[test]
    fn test_full_path_match_only() -> Result<()> {
        let patterns = set(&[r"c:\src\a.cpp"], &[])?;

        assert!(patterns.matches(r"c:\src\a.cpp"));
        assert!(!patterns.matches(r"c:\src\a.cpp.bak"));
        assert!(!patterns.matches(r"d:\c:\src\a.cpp"));

        Ok(())
    }

    #[test]
    fn test_glob_wildcards() -> Result<()> {
        let patterns = set(&[r"*\targets\*.exe"], &[])?;

        assert!(patterns.matches(r"c:\out\targets\hello.exe"));
        assert!(!patterns.matches(r"c:\out\targets\hello.dll"));

        let patterns = set(&["a?c"], &[])?;
        assert!(patterns.matches("abc"));
        assert!(patterns.matches("axc"));
        assert!(!patterns.matches("ac"));
        assert!(!patterns.matches("abbc"));

        Ok(())
    }

    #[test]
    fn test_regex_metacharacters_are_literal() -> Result<()> {
        let patterns = set(&[r"c:\src\a+b(1).cpp"], &[])?;

        assert!(patterns.matches(r"c:\src\a+b(1).cpp"));
        assert!(!patterns.matches(r"c:\src\aab(1)xcpp"));

        Ok(())
    }

    #[test]
    fn test_excluded_wins_over_selected() -> Result<()> {
        let patterns = set(&["*"], &["*.dll"])?;

        assert!(patterns.matches(r"c:\bin\a.exe"));
        assert!(!patterns.matches(r"c:\bin\a.dll"));

        Ok(())
    }

    #[test]
    fn test_empty_excluded_excludes_nothing() -> Result<()> {
        let patterns = set(&["*.exe"], &[])?;

        assert!(patterns.matches(r"a.exe"));

        Ok(())
    }

    #[test]
    fn test_matching_is_case_insensitive() -> Result<()> {
        let patterns = set(&[r"C:\Src\*.CPP"], &[])?;

        assert!(patterns.matches(r"c:\src\main.cpp"));
        assert!(patterns.matches(r"C:\SRC\MAIN.CPP"));

        Ok(())
    }

    #[test]
    fn test_case_fold_round_trip() -> Result<()> {
        // Acceptance for a lowercased pattern set equals acceptance for the
        // original set with case-folded inputs.
        let mixed = set(&[r"C:\Out\*.Exe"], &[r"*Setup*"])?;
        let folded = set(&[r"c:\out\*.exe"], &[r"*setup*"])?;

        for path in [
            r"C:\Out\App.Exe",
            r"c:\out\app.exe",
            r"C:\Out\Setup.Exe",
            r"c:\other\app.exe",
        ] {
            assert_eq!(mixed.matches(path), folded.matches(&path.to_lowercase()));
            assert_eq!(mixed.matches(path), mixed.matches(&path.to_lowercase()));
        }

        Ok(())
    }

    #[test]
    fn test_filter_dimensions() -> Result<()> {
        let filter = CoverageFilter::new(set(&["*.exe"], &[])?, set(&["*.cpp"], &[])?);

        assert!(filter.is_module_selected(Path::new(r"c:\bin\a.exe")));
        assert!(!filter.is_module_selected(Path::new(r"c:\bin\a.dll")));
        assert!(filter.is_source_selected(Path::new(r"c:\src\a.cpp")));
        assert!(!filter.is_source_selected(Path::new(r"c:\src\a.h")));

        Ok(())
    }
}
