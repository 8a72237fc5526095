// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Line resolution from PDB debug info, out-of-process: the debuggee's
//! images are parsed from disk, never loaded into the debugger.

use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use goblin::pe::{debug::DebugData, PE};
use pdb::FallibleIterator;

use crate::resolve::{coalesce, has_source_position, LineResolver, LineSite, ResolveError};

/// Reads the line tables of the PDB referenced by a module's CodeView debug
/// directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct PdbLineResolver;

impl LineResolver for PdbLineResolver {
    fn module_lines(
        &mut self,
        module: &Path,
        base_address: u64,
    ) -> Result<Vec<LineSite>, ResolveError> {
        let pdb_path = find_pdb_path(module)
            .map_err(ResolveError::Other)?
            .ok_or_else(|| ResolveError::SymbolInfoUnavailable(module.to_path_buf()))?;

        read_line_sites(&pdb_path, base_address).map_err(ResolveError::Other)
    }
}

/// Locate the PDB for a PE image: the linker-embedded path if it still
/// exists on disk, otherwise a file of the same name next to the image.
fn find_pdb_path(pe_path: &Path) -> Result<Option<PathBuf>> {
    let file = fs::File::open(pe_path)
        .with_context(|| format!("opening PE image {}", pe_path.display()))?;
    let data = unsafe { memmap2::Mmap::map(&file)? };
    let pe = PE::parse(&data)?;

    let Some(DebugData {
        codeview_pdb70_debug_info: Some(cv),
        ..
    }) = pe.debug_data
    else {
        return Ok(None);
    };

    // This field is named `filename`, but linkers usually embed an absolute
    // path.
    let cv_filename = CStr::from_bytes_with_nul(cv.filename)?.to_str()?;
    let embedded = Path::new(cv_filename);

    if embedded.is_file() {
        return Ok(Some(embedded.to_owned()));
    }

    if let (Some(dir), Some(name)) = (pe_path.parent(), embedded.file_name()) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

fn read_line_sites(pdb_path: &Path, base_address: u64) -> Result<Vec<LineSite>> {
    let file = fs::File::open(pdb_path)
        .with_context(|| format!("opening PDB {}", pdb_path.display()))?;
    let mut pdb = pdb::PDB::open(file)?;

    let address_map = pdb.address_map()?;
    let string_table = pdb.string_table()?;
    let debug_info = pdb.debug_information()?;

    let mut raw = Vec::new();

    let mut modules = debug_info.modules()?;
    while let Some(module) = modules.next()? {
        let Some(info) = pdb.module_info(&module)? else {
            continue;
        };

        let program = info.line_program()?;
        let mut lines = program.lines();

        while let Some(line) = lines.next()? {
            if !has_source_position(line.line_start) {
                continue;
            }

            let Some(rva) = line.offset.to_rva(&address_map) else {
                continue;
            };

            let file_info = program.get_file_info(line.file_index)?;
            let name = file_info.name.to_string_lossy(&string_table)?;

            raw.push(LineSite {
                source: PathBuf::from(name.into_owned()),
                line: line.line_start,
                address: base_address + u64::from(rva.0),
            });
        }
    }

    Ok(coalesce(raw))
}
