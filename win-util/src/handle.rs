// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{ffi::OsString, os::windows::ffi::OsStringExt, path::PathBuf};

use anyhow::Result;
use winapi::{
    shared::minwindef::{DWORD, MAX_PATH},
    um::{
        fileapi::GetFinalPathNameByHandleW,
        handleapi::{CloseHandle, DuplicateHandle, INVALID_HANDLE_VALUE},
        processthreadsapi::GetCurrentProcess,
        winnt::{DUPLICATE_SAME_ACCESS, HANDLE},
    },
};

use crate::last_os_error;

/// An owned `HANDLE`, closed on drop.
pub struct Handle(pub HANDLE);

impl Handle {
    /// Duplicate a raw handle we do not own into an owned one, e.g. to keep
    /// using a process handle beyond the lifetime the debug API gives it.
    pub fn duplicate_from(handle: HANDLE) -> Self {
        let mut duplicate = INVALID_HANDLE_VALUE;
        unsafe {
            let current_process = GetCurrentProcess();
            DuplicateHandle(
                current_process,
                handle,
                current_process,
                &mut duplicate,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            );
        }

        Self(duplicate)
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        Self::duplicate_from(self.0)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

unsafe impl Send for Handle {}

unsafe impl Sync for Handle {}

/// Resolve the final, drive-letter form of the path behind a file handle.
pub fn path_from_handle(handle: HANDLE) -> Result<PathBuf> {
    let mut buf = vec![0u16; MAX_PATH];

    loop {
        let len = unsafe {
            GetFinalPathNameByHandleW(
                handle,
                buf.as_mut_ptr(),
                buf.len() as DWORD,
                0, // normalized, with drive letter
            )
        } as usize;

        if len == 0 {
            return Err(last_os_error());
        }

        if len <= buf.len() {
            buf.truncate(len);
            return Ok(PathBuf::from(OsString::from_wide(&buf)));
        }

        // Too small; the call reported the length it needs.
        buf.resize(len, 0);
    }
}
