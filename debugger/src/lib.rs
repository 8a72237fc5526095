// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(windows)]

// Allow safe functions that take `HANDLE` arguments.
//
// Though they type alias raw pointers, they are opaque. We only pass handles
// obtained from win32 API calls back into other win32 API calls.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

mod breakpoint;
mod context;
mod debug_event;
mod debugger;
mod target;

pub use self::{
    debug_event::DebugEvent,
    debugger::{
        BreakpointId, CancelHandle, DebugEventHandler, Debugger, ExceptionEvent, ModuleLoadInfo,
        DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED,
    },
};
