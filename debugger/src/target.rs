// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use fnv::FnvHashMap;
use log::{error, trace};
use win_util::handle::{self, Handle};
use winapi::{shared::minwindef::DWORD, um::winnt::HANDLE};

use crate::{
    breakpoint::Breakpoint,
    context::ThreadContext,
    debugger::{BreakpointId, ModuleLoadInfo},
};

/// One executable image mapped into the debuggee.
pub struct Module {
    path: PathBuf,
    base_address: u64,
    image_size: u32,

    // Owns the file handle delivered with the load event; closed on drop.
    _file_handle: Handle,
}

impl Module {
    pub fn new(module_handle: HANDLE, base_address: u64) -> Result<Self> {
        let path = handle::path_from_handle(module_handle).unwrap_or_else(|e| {
            error!("Error getting path from file handle: {}", e);
            "???".into()
        });

        let image_size = get_image_size(&path)?;

        Ok(Module {
            path,
            base_address,
            image_size,
            _file_handle: Handle(module_handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn load_info(&self) -> ModuleLoadInfo {
        ModuleLoadInfo::new(&self.path, self.base_address)
    }
}

/// Debugger-side state for a single process in the debugged tree.
pub struct Target {
    process_id: DWORD,
    process_handle: HANDLE,
    current_thread_id: DWORD,
    current_thread_handle: HANDLE,

    // The first EXCEPTION_BREAKPOINT in a process is the attach notification
    // from the OS loader, not one of ours.
    saw_initial_bp: bool,

    exited: bool,

    threads: FnvHashMap<DWORD, HANDLE>,

    // Key is base address.
    modules: FnvHashMap<u64, Module>,

    // Key is the address the trap byte is written at.
    breakpoints: FnvHashMap<u64, Breakpoint>,

    // Thread id -> breakpoint address to re-arm once the thread finishes
    // single-stepping over the displaced instruction.
    single_step: FnvHashMap<DWORD, u64>,
}

impl Target {
    pub fn new(
        process_id: DWORD,
        thread_id: DWORD,
        process_handle: HANDLE,
        thread_handle: HANDLE,
    ) -> Self {
        let mut threads = FnvHashMap::default();
        threads.insert(thread_id, thread_handle);

        Self {
            process_id,
            process_handle,
            current_thread_id: thread_id,
            current_thread_handle: thread_handle,
            saw_initial_bp: false,
            exited: false,
            threads,
            modules: FnvHashMap::default(),
            breakpoints: FnvHashMap::default(),
            single_step: FnvHashMap::default(),
        }
    }

    #[allow(unused)]
    pub fn process_id(&self) -> DWORD {
        self.process_id
    }

    pub fn process_handle(&self) -> HANDLE {
        self.process_handle
    }

    pub fn current_thread_id(&self) -> DWORD {
        self.current_thread_id
    }

    pub fn create_new_thread(&mut self, thread_handle: HANDLE, thread_id: DWORD) {
        self.current_thread_id = thread_id;
        self.current_thread_handle = thread_handle;
        self.threads.insert(thread_id, thread_handle);
    }

    pub fn set_current_thread(&mut self, thread_id: DWORD) {
        if let Some(&handle) = self.threads.get(&thread_id) {
            self.current_thread_id = thread_id;
            self.current_thread_handle = handle;
        }
    }

    pub fn exit_thread(&mut self, thread_id: DWORD) {
        self.threads.remove(&thread_id);
        self.single_step.remove(&thread_id);
    }

    pub fn saw_initial_bp(&self) -> bool {
        self.saw_initial_bp
    }

    pub fn set_saw_initial_bp(&mut self) {
        self.saw_initial_bp = true;
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn set_exited(&mut self) {
        self.exited = true;
    }

    /// Register the module mapped at `base_address`.
    pub fn load_module(
        &mut self,
        module_handle: HANDLE,
        base_address: u64,
    ) -> Result<ModuleLoadInfo> {
        let module = Module::new(module_handle, base_address)?;

        trace!(
            "pid={} loading module {} at 0x{:016x}",
            self.process_id,
            module.path().display(),
            base_address
        );

        let load_info = module.load_info();
        if let Some(old_value) = self.modules.insert(base_address, module) {
            error!(
                "Existing module {} replaced at base address 0x{:016x}",
                old_value.path().display(),
                base_address
            );
        }

        Ok(load_info)
    }

    /// Drop the module and any breakpoints inside its image range.
    pub fn unload_module(&mut self, base_address: u64) {
        if let Some(module) = self.modules.remove(&base_address) {
            let image_size = u64::from(module.image_size());
            self.breakpoints
                .retain(|&ip, _| ip < base_address || ip >= base_address + image_size);
        }
    }

    pub fn breakpoint_set_at_addr(&self, address: u64) -> bool {
        self.breakpoints.contains_key(&address)
    }

    pub fn expecting_single_step(&self, thread_id: DWORD) -> bool {
        self.single_step.contains_key(&thread_id)
    }

    /// Install a breakpoint, or return the id of the one already present at
    /// the address.
    pub fn ensure_breakpoint(&mut self, id: BreakpointId, address: u64) -> Result<BreakpointId> {
        if let Some(existing) = self.breakpoints.get(&address) {
            return Ok(existing.id());
        }

        let mut breakpoint = Breakpoint::new(id, address);
        breakpoint.enable(self.process_handle)?;
        self.breakpoints.insert(address, breakpoint);

        Ok(id)
    }

    /// Handle a breakpoint that we set (as opposed to a breakpoint in user
    /// code, e.g. an assertion).
    ///
    /// The displaced instruction must still execute, so restore the original
    /// byte, rewind the instruction pointer to the trap address, and resume
    /// the thread in single-step mode. The trap byte is re-armed when the
    /// step completes.
    pub fn handle_breakpoint(&mut self, pc: u64) -> Result<BreakpointId> {
        let process_handle = self.process_handle;

        // Unwrap guaranteed: only called for addresses in the map.
        let breakpoint = self.breakpoints.get_mut(&pc).unwrap();
        breakpoint.increment_hit_count();
        breakpoint.disable(process_handle)?;
        let id = breakpoint.id();

        let mut context = ThreadContext::capture(self.current_thread_handle)?;
        context.set_program_counter(pc);
        context.set_single_step(true);
        context.apply(self.current_thread_handle)?;

        self.single_step.insert(self.current_thread_id, pc);

        Ok(id)
    }

    /// Re-arm the breakpoint the thread just stepped over.
    pub fn complete_single_step(&mut self, thread_id: DWORD) -> Result<()> {
        if let Some(address) = self.single_step.remove(&thread_id) {
            if let Some(breakpoint) = self.breakpoints.get_mut(&address) {
                breakpoint.enable(self.process_handle)?;
            }
        }

        Ok(())
    }
}

fn get_image_size(path: &Path) -> Result<u32> {
    let file = fs::File::open(path)?;
    let map = unsafe { memmap2::Mmap::map(&file)? };

    let header = goblin::pe::header::Header::parse(&map)?;
    header
        .optional_header
        .map(|h| h.windows_fields.size_of_image)
        .ok_or_else(|| anyhow::anyhow!("Missing optional header in PE image"))
}
