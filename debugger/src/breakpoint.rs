// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use win_util::process;
use winapi::um::winnt::HANDLE;

use crate::debugger::BreakpointId;

const TRAP_OPCODE: u8 = 0xcc;

/// A software breakpoint installed in the debuggee.
///
/// The displaced code byte is remembered so the original instruction can be
/// restored when the breakpoint is hit and re-armed after stepping over it.
pub struct Breakpoint {
    id: BreakpointId,

    address: u64,

    // We use a counter to handle multiple threads hitting the breakpoint at
    // the same time. Each thread increments the disable count and the trap
    // byte is not restored until an equivalent number of threads re-enable
    // the breakpoint.
    disabled: u32,

    hit_count: u64,

    original_byte: Option<u8>,
}

impl Breakpoint {
    pub fn new(id: BreakpointId, address: u64) -> Self {
        Breakpoint {
            id,
            address,
            disabled: 0,
            hit_count: 0,
            original_byte: None,
        }
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    #[allow(unused)]
    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn increment_hit_count(&mut self) {
        self.hit_count = self.hit_count.saturating_add(1);
    }

    #[allow(unused)]
    pub fn original_byte(&self) -> Option<u8> {
        self.original_byte
    }

    /// Write the trap opcode at the breakpoint address, remembering the
    /// displaced byte.
    pub fn enable(&mut self, process_handle: HANDLE) -> Result<()> {
        self.disabled = self.disabled.saturating_sub(1);

        if self.original_byte.is_none() {
            let original_byte = process::read_memory(process_handle, self.address as _)?;
            write_instruction_byte(process_handle, self.address, TRAP_OPCODE)?;
            self.original_byte = Some(original_byte);
        }

        Ok(())
    }

    /// Restore the displaced byte so the original instruction can execute.
    pub fn disable(&mut self, process_handle: HANDLE) -> Result<()> {
        self.disabled = self.disabled.saturating_add(1);

        if let Some(original_byte) = self.original_byte.take() {
            write_instruction_byte(process_handle, self.address, original_byte)?;
        }

        Ok(())
    }
}

fn write_instruction_byte(process_handle: HANDLE, ip: u64, b: u8) -> Result<()> {
    let byte = [b; 1];
    let remote_address = ip as _;
    process::write_memory_slice(process_handle, remote_address, &byte)?;
    process::flush_instruction_cache(process_handle, remote_address, byte.len())?;
    Ok(())
}
