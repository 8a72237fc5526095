// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    ffi::OsString,
    mem::{size_of, MaybeUninit},
    os::windows::ffi::OsStringExt,
    ptr,
};

use anyhow::{Context, Result};
use log::error;
use winapi::{
    shared::{
        basetsd::SIZE_T,
        minwindef::{DWORD, LPCVOID, LPVOID},
    },
    um::{
        handleapi::INVALID_HANDLE_VALUE,
        memoryapi::{ReadProcessMemory, WriteProcessMemory},
        processthreadsapi::{FlushInstructionCache, GetProcessId, TerminateProcess},
    },
};
use winapi::um::winnt::HANDLE;

use crate::check_winapi;

pub fn read_memory<T: Copy>(process_handle: HANDLE, remote_address: LPCVOID) -> Result<T> {
    let mut buf: MaybeUninit<T> = MaybeUninit::uninit();
    check_winapi(|| unsafe {
        ReadProcessMemory(
            process_handle,
            remote_address,
            buf.as_mut_ptr() as LPVOID,
            size_of::<T>(),
            ptr::null_mut(),
        )
    })
    .context("Reading process memory")?;

    let buf = unsafe { buf.assume_init() };
    Ok(buf)
}

pub fn read_memory_array<T: Copy>(
    process_handle: HANDLE,
    remote_address: LPCVOID,
    buf: &mut [T],
) -> Result<()> {
    check_winapi(|| unsafe {
        ReadProcessMemory(
            process_handle,
            remote_address,
            buf.as_mut_ptr() as LPVOID,
            buf.len() * size_of::<T>(),
            ptr::null_mut(),
        )
    })
    .context("Reading process memory")?;
    Ok(())
}

pub fn read_narrow_string(
    process_handle: HANDLE,
    remote_address: LPCVOID,
    len: usize,
) -> Result<String> {
    let mut buf = vec![0u8; len];
    read_memory_array::<u8>(process_handle, remote_address, &mut buf[..])?;
    Ok(String::from_utf8_lossy(&buf).into())
}

pub fn read_wide_string(
    process_handle: HANDLE,
    remote_address: LPCVOID,
    len: usize,
) -> Result<OsString> {
    let mut buf = vec![0u16; len];
    read_memory_array::<u16>(process_handle, remote_address, &mut buf[..])?;
    Ok(OsString::from_wide(&buf))
}

pub fn write_memory_slice(
    process_handle: HANDLE,
    remote_address: LPVOID,
    buffer: &[u8],
) -> Result<()> {
    let mut bytes_written: SIZE_T = 0;
    check_winapi(|| unsafe {
        WriteProcessMemory(
            process_handle,
            remote_address,
            buffer.as_ptr() as LPCVOID,
            buffer.len(),
            &mut bytes_written,
        )
    })
    .context("writing process memory")?;

    Ok(())
}

pub fn flush_instruction_cache(
    process_handle: HANDLE,
    remote_address: LPCVOID,
    len: usize,
) -> Result<()> {
    check_winapi(|| unsafe { FlushInstructionCache(process_handle, remote_address, len) })
}

pub fn id(process_handle: HANDLE) -> DWORD {
    unsafe { GetProcessId(process_handle) }
}

pub fn terminate(process_handle: HANDLE) {
    fn terminate_impl(process_handle: HANDLE) -> Result<()> {
        check_winapi(|| unsafe { TerminateProcess(process_handle, 0) })
            .context("TerminateProcess")?;
        Ok(())
    }

    if process_handle != INVALID_HANDLE_VALUE && !process_handle.is_null() {
        if let Err(err) = terminate_impl(process_handle) {
            error!("Error terminating process: {}", err);
        }
    }
}
