// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(windows)]

// Allow safe functions that take `HANDLE` arguments.
//
// Though they type alias raw pointers, they are opaque. We only pass handles
// obtained from win32 API calls back into other win32 API calls.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

pub mod handle;
pub mod process;

use anyhow::Result;
use winapi::shared::minwindef::{BOOL, FALSE};

pub fn last_os_error() -> anyhow::Error {
    std::io::Error::last_os_error().into()
}

/// Run a win32 API function that reports failure by returning `FALSE`,
/// converting failure to the calling thread's last OS error.
pub fn check_winapi(f: impl FnOnce() -> BOOL) -> Result<()> {
    if f() == FALSE {
        Err(last_os_error())
    } else {
        Ok(())
    }
}
