// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thread-context access for rewinding the instruction pointer and driving
//! single-step execution after a breakpoint hit.
use std::mem::MaybeUninit;

use anyhow::{Context, Result};
use win_util::check_winapi;
use winapi::um::{
    processthreadsapi::{GetThreadContext, SetThreadContext},
    winnt::{CONTEXT, CONTEXT_ALL, HANDLE},
};

// Trap flag in EFlags: raise EXCEPTION_SINGLE_STEP after the next instruction.
const TRAP_FLAG: u32 = 1 << 8;

// GetThreadContext requires a 16 byte aligned CONTEXT on x64.
#[repr(align(16))]
struct Aligned16<T>(T);

pub struct ThreadContext(Aligned16<CONTEXT>);

impl ThreadContext {
    pub fn capture(thread_handle: HANDLE) -> Result<Self> {
        let mut ctx: Aligned16<CONTEXT> = unsafe { MaybeUninit::zeroed().assume_init() };
        ctx.0.ContextFlags = CONTEXT_ALL;

        check_winapi(|| unsafe { GetThreadContext(thread_handle, &mut ctx.0) })
            .context("GetThreadContext")?;

        Ok(ThreadContext(ctx))
    }

    #[allow(unused)]
    pub fn program_counter(&self) -> u64 {
        self.0 .0.Rip
    }

    pub fn set_program_counter(&mut self, ip: u64) {
        self.0 .0.Rip = ip;
    }

    pub fn set_single_step(&mut self, enable: bool) {
        if enable {
            self.0 .0.EFlags |= TRAP_FLAG;
        } else {
            self.0 .0.EFlags &= !TRAP_FLAG;
        }
    }

    pub fn apply(&self, thread_handle: HANDLE) -> Result<()> {
        check_winapi(|| unsafe { SetThreadContext(thread_handle, &self.0 .0) })
            .context("SetThreadContext")?;
        Ok(())
    }
}
