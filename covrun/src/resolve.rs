// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The line-resolution seam between the runner and a module's debug info.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// One source line with executable code, anchored at the first machine
/// address emitted for it in the module.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineSite {
    pub source: PathBuf,

    /// 1-indexed line number.
    pub line: u32,

    /// Absolute address in the debuggee (load base + RVA).
    pub address: u64,
}

impl LineSite {
    pub fn new(source: impl Into<PathBuf>, line: u32, address: u64) -> Self {
        Self {
            source: source.into(),
            line,
            address,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The module has no debug information. The runner keeps the module in
    /// the run with zero lines.
    #[error("no debug information found for {}", .0.display())]
    SymbolInfoUnavailable(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Source of line tables for loaded modules.
///
/// The runner needs only this one capability, so tests can substitute
/// synthetic line tables for a real debug-info reader.
pub trait LineResolver {
    /// Enumerate the line sites of the module mapped at `base_address`,
    /// already coalesced so each (source, line) pair appears once.
    fn module_lines(
        &mut self,
        module: &Path,
        base_address: u64,
    ) -> Result<Vec<LineSite>, ResolveError>;
}

// Line-number markers used in CodeView line tables for compiler-generated
// code with no source position.
const NO_SOURCE_MARKERS: [u32; 2] = [0xfeefee, 0xf00f00];

pub fn has_source_position(line: u32) -> bool {
    line != 0 && !NO_SOURCE_MARKERS.contains(&line)
}

/// Drop entries without a source position and coalesce duplicate
/// (source, line) pairs, keeping the first address encountered as the
/// breakpoint site.
pub fn coalesce(sites: impl IntoIterator<Item = LineSite>) -> Vec<LineSite> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    for site in sites {
        if !has_source_position(site.line) {
            continue;
        }

        if seen.insert((site.source.clone(), site.line)) {
            result.push(site);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_compiler_generated_markers() {
        assert!(has_source_position(1));
        assert!(has_source_position(100_000));

        assert!(!has_source_position(0));
        assert!(!has_source_position(0xfeefee));
        assert!(!has_source_position(0xf00f00));
    }

    #[test]
    fn test_coalesce_keeps_first_address() {
        let sites = vec![
            LineSite::new("a.cpp", 10, 0x1000),
            LineSite::new("a.cpp", 10, 0x2000),
            LineSite::new("a.cpp", 11, 0x1008),
            LineSite::new("b.cpp", 10, 0x3000),
            LineSite::new("a.cpp", 10, 0x4000),
        ];

        let coalesced = coalesce(sites);

        assert_eq!(
            coalesced,
            vec![
                LineSite::new("a.cpp", 10, 0x1000),
                LineSite::new("a.cpp", 11, 0x1008),
                LineSite::new("b.cpp", 10, 0x3000),
            ]
        );
    }

    #[test]
    fn test_coalesce_drops_markers() {
        let sites = vec![
            LineSite::new("a.cpp", 0xfeefee, 0x1000),
            LineSite::new("a.cpp", 0, 0x1004),
            LineSite::new("a.cpp", 12, 0x1008),
        ];

        let coalesced = coalesce(sites);

        assert_eq!(coalesced, vec![LineSite::new("a.cpp", 12, 0x1008)]);
    }
}
