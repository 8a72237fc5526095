// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    mem::MaybeUninit,
    os::windows::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{Context, Result};
use fnv::FnvHashMap;
use log::{error, trace, warn};
use win_util::{check_winapi, handle::Handle, last_os_error, process};
use winapi::{
    shared::minwindef::{DWORD, FALSE, LPCVOID, TRUE},
    um::{
        debugapi::{ContinueDebugEvent, WaitForDebugEvent},
        minwinbase::{EXCEPTION_BREAKPOINT, EXCEPTION_DEBUG_INFO, EXCEPTION_SINGLE_STEP},
        winbase::{DebugSetProcessKillOnExit, DEBUG_PROCESS, INFINITE},
        winnt::HANDLE,
    },
};

pub use winapi::um::winnt::{DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED};

use crate::{
    debug_event::{DebugEvent, DebugEventInfo},
    target::Target,
};

/// Uniquely identify a breakpoint.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BreakpointId(pub u64);

/// An exception the debugger does not own, reported to the event handler.
#[derive(Copy, Clone, Debug)]
pub struct ExceptionEvent {
    pub code: u32,
    pub address: u64,

    /// False once the debuggee's own handlers have declined the exception;
    /// the process is about to die from it.
    pub first_chance: bool,
}

pub struct ModuleLoadInfo {
    path: PathBuf,
    base_address: u64,
}

impl ModuleLoadInfo {
    pub fn new(path: impl AsRef<Path>, base_address: u64) -> Self {
        ModuleLoadInfo {
            path: path.as_ref().into(),
            base_address,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }
}

/// Cancels a running debug session from another thread.
///
/// Cancellation is delivered by terminating every process in the debugged
/// tree. The event pump then observes ordinary exit events and returns
/// normally, with whatever exit code the OS supplied for the initial
/// process.
#[derive(Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    canceled: AtomicBool,

    // Duplicated process handles for every live process in the tree.
    processes: Mutex<Vec<(DWORD, Handle)>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminate every debugged process now. A process still attaching in a
    /// race with cancellation is terminated as it registers.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);

        let processes = self.state.processes.lock().unwrap();
        for (process_id, handle) in processes.iter() {
            trace!("cancellation - terminating pid: {}", process_id);
            process::terminate(handle.0);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    fn register(&self, process_id: DWORD, process_handle: HANDLE) {
        let duplicate = Handle::duplicate_from(process_handle);

        let mut processes = self.state.processes.lock().unwrap();
        processes.push((process_id, duplicate));

        if self.is_canceled() {
            // Lost the race against cancel; stop this process too.
            let (_, handle) = processes.last().unwrap();
            process::terminate(handle.0);
        }
    }

    fn deregister(&self, process_id: DWORD) {
        let mut processes = self.state.processes.lock().unwrap();
        processes.retain(|(id, _)| *id != process_id);
    }
}

#[rustfmt::skip]
pub trait DebugEventHandler {
    fn on_create_process(&mut self, _debugger: &mut Debugger, _module: &ModuleLoadInfo) {}
    fn on_load_dll(&mut self, _debugger: &mut Debugger, _module: &ModuleLoadInfo) {}
    fn on_unload_dll(&mut self, _debugger: &mut Debugger, _base_address: u64) {}
    fn on_create_thread(&mut self, _debugger: &mut Debugger) {}
    fn on_exit_thread(&mut self, _debugger: &mut Debugger, _exit_code: u32) {}
    fn on_breakpoint(&mut self, _debugger: &mut Debugger, _id: BreakpointId) {}
    fn on_exception(&mut self, _debugger: &mut Debugger, _event: &ExceptionEvent) -> DWORD {
        // Continue normal exception handling processing.
        DBG_EXCEPTION_NOT_HANDLED
    }
    fn on_output_debug_string(&mut self, _debugger: &mut Debugger, _message: String) {}
    fn on_exit_process(&mut self, _debugger: &mut Debugger, _exit_code: u32) {}
}

#[derive(Default)]
struct ContinueDebugEventArguments {
    process_id: u32,
    thread_id: u32,
    continue_status: u32,
}

pub struct Debugger {
    // Every process in the debugged tree, keyed by process id. The pump
    // follows children spawned by the target.
    targets: FnvHashMap<DWORD, Target>,

    initial_process_id: DWORD,
    current_process_id: DWORD,
    exit_code: Option<u32>,
    continue_args: Option<ContinueDebugEventArguments>,
    breakpoint_count: u64,
    cancel: CancelHandle,
}

impl Debugger {
    pub fn launch(
        mut command: Command,
        callbacks: &mut impl DebugEventHandler,
        cancel: CancelHandle,
    ) -> Result<(Self, Child)> {
        let child = command
            .creation_flags(DEBUG_PROCESS)
            .spawn()
            .context("debuggee failed to start")?;

        check_winapi(|| unsafe { DebugSetProcessKillOnExit(TRUE) })
            .context("Setting DebugSetProcessKillOnExit to TRUE")?;

        // Call once to get our initial CreateProcess event.
        //
        // The kernel blocks the process from starting until the CreateProcess
        // event is processed, so we must wait forever.
        let mut de = MaybeUninit::uninit();
        if unsafe { WaitForDebugEvent(de.as_mut_ptr(), INFINITE) } == FALSE {
            return Err(last_os_error()).context("WaitForDebugEvent");
        }

        let de = unsafe { de.assume_init() };
        let de = DebugEvent::new(&de);
        if let DebugEventInfo::CreateProcess(info) = de.info() {
            trace!("{}", de);

            let mut target =
                Target::new(de.process_id(), de.thread_id(), info.hProcess, info.hThread);

            let module = target
                .load_module(info.hFile, info.lpBaseOfImage as u64)
                .context("Loading process module")?;

            let mut debugger = Debugger {
                targets: FnvHashMap::default(),
                initial_process_id: de.process_id(),
                current_process_id: de.process_id(),
                exit_code: None,
                continue_args: None,
                breakpoint_count: 0,
                cancel,
            };
            debugger.targets.insert(de.process_id(), target);
            debugger.cancel.register(de.process_id(), info.hProcess);

            callbacks.on_create_process(&mut debugger, &module);

            if unsafe { ContinueDebugEvent(de.process_id(), de.thread_id(), DBG_CONTINUE) } == FALSE
            {
                return Err(last_os_error()).context("ContinueDebugEvent");
            }

            Ok((debugger, child))
        } else {
            anyhow::bail!("Unexpected event: {}", de)
        }
    }

    /// Pump debug events until every process in the debugged tree has exited.
    pub fn run(&mut self, callbacks: &mut impl DebugEventHandler) -> Result<()> {
        while self.targets.values().any(|target| !target.exited()) {
            self.process_event(callbacks)?;
            self.continue_debugging()?;
        }

        Ok(())
    }

    /// Exit code of the initial process, once it has exited.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Install a coverage breakpoint at `address` in the process the current
    /// debug event belongs to. If a breakpoint is already installed at the
    /// address, its id is returned instead of installing a second one.
    pub fn set_coverage_breakpoint(&mut self, address: u64) -> Result<BreakpointId> {
        let id = BreakpointId(self.breakpoint_count);

        let target = self
            .targets
            .get_mut(&self.current_process_id)
            .ok_or_else(|| anyhow::anyhow!("no debug target for current process"))?;

        let actual = target.ensure_breakpoint(id, address)?;
        if actual == id {
            self.breakpoint_count += 1;
        }

        Ok(actual)
    }

    fn process_event(&mut self, callbacks: &mut impl DebugEventHandler) -> Result<()> {
        let mut de = MaybeUninit::uninit();
        if unsafe { WaitForDebugEvent(de.as_mut_ptr(), INFINITE) } == FALSE {
            return Err(last_os_error()).context("WaitForDebugEvent");
        }

        let de = unsafe { de.assume_init() };
        let de = DebugEvent::new(&de);
        trace!("{}", de);

        let continue_status = self.dispatch_event(&de, callbacks);
        self.continue_args = Some(ContinueDebugEventArguments {
            continue_status,
            process_id: de.process_id(),
            thread_id: de.thread_id(),
        });

        Ok(())
    }

    fn continue_debugging(&mut self) -> Result<()> {
        if let Some(continue_args) = self.continue_args.take() {
            if unsafe {
                ContinueDebugEvent(
                    continue_args.process_id,
                    continue_args.thread_id,
                    continue_args.continue_status,
                )
            } == FALSE
            {
                return Err(last_os_error()).context("ContinueDebugEvent");
            }
        }

        Ok(())
    }

    fn dispatch_event(&mut self, de: &DebugEvent, callbacks: &mut impl DebugEventHandler) -> u32 {
        let mut continue_status = DBG_CONTINUE;
        let process_id = de.process_id();
        self.current_process_id = process_id;

        if let DebugEventInfo::CreateProcess(info) = de.info() {
            // A child process spawned somewhere under the initial target.
            let mut target =
                Target::new(process_id, de.thread_id(), info.hProcess, info.hThread);

            let module = target.load_module(info.hFile, info.lpBaseOfImage as u64);
            self.targets.insert(process_id, target);
            self.cancel.register(process_id, info.hProcess);

            match module {
                Ok(module) => {
                    callbacks.on_create_process(self, &module);
                }
                Err(e) => {
                    error!("Error loading child process module: {}", e);
                }
            }

            return continue_status;
        }

        if !self.targets.contains_key(&process_id) {
            warn!("debug event for unknown process: {}", de);
            return continue_status;
        }

        {
            // Unwrap guaranteed by the membership check above.
            let target = self.targets.get_mut(&process_id).unwrap();
            if let DebugEventInfo::CreateThread(info) = de.info() {
                target.create_new_thread(info.hThread, de.thread_id());
            } else {
                target.set_current_thread(de.thread_id());
            }
        }

        match de.info() {
            DebugEventInfo::LoadDll(info) => {
                let loaded = self
                    .targets
                    .get_mut(&process_id)
                    .unwrap()
                    .load_module(info.hFile, info.lpBaseOfDll as u64);

                match loaded {
                    Ok(module) => {
                        callbacks.on_load_dll(self, &module);
                    }
                    Err(e) => {
                        error!("Error loading module: {}", e);
                    }
                }
            }

            DebugEventInfo::UnloadDll(info) => {
                let base_address = info.lpBaseOfDll as u64;
                self.targets
                    .get_mut(&process_id)
                    .unwrap()
                    .unload_module(base_address);

                callbacks.on_unload_dll(self, base_address);
            }

            DebugEventInfo::Exception(info) => {
                continue_status = match self.dispatch_exception_event(de, info, callbacks) {
                    Ok(status) => status,
                    Err(e) => {
                        error!("Error processing exception: {}", e);
                        DBG_EXCEPTION_NOT_HANDLED
                    }
                }
            }

            DebugEventInfo::CreateThread(_info) => {
                callbacks.on_create_thread(self);
            }

            DebugEventInfo::ExitThread(info) => {
                callbacks.on_exit_thread(self, info.dwExitCode);
                self.targets
                    .get_mut(&process_id)
                    .unwrap()
                    .exit_thread(de.thread_id());
            }

            DebugEventInfo::ExitProcess(info) => {
                self.targets.get_mut(&process_id).unwrap().set_exited();
                self.cancel.deregister(process_id);
                if process_id == self.initial_process_id {
                    self.exit_code = Some(info.dwExitCode);
                }
                callbacks.on_exit_process(self, info.dwExitCode);
            }

            DebugEventInfo::OutputDebugString(info) => {
                // Remove the terminating NUL as it's not needed in a Rust string.
                let length = info.nDebugStringLength.saturating_sub(1) as usize;
                let process_handle = self.targets.get(&process_id).unwrap().process_handle();
                let data = info.lpDebugStringData as LPCVOID;

                let message = if info.fUnicode != 0 {
                    process::read_wide_string(process_handle, data, length)
                        .map(|s| s.to_string_lossy().into_owned())
                } else {
                    process::read_narrow_string(process_handle, data, length)
                };

                if let Ok(message) = message {
                    callbacks.on_output_debug_string(self, message);
                }
            }

            DebugEventInfo::CreateProcess(_) => {
                // Handled before thread bookkeeping.
                unreachable!();
            }

            DebugEventInfo::Unknown => {}
        }

        continue_status
    }

    fn dispatch_exception_event(
        &mut self,
        de: &DebugEvent,
        info: &EXCEPTION_DEBUG_INFO,
        callbacks: &mut impl DebugEventHandler,
    ) -> Result<u32> {
        let process_id = de.process_id();
        let code = info.ExceptionRecord.ExceptionCode;
        let address = info.ExceptionRecord.ExceptionAddress as u64;
        let first_chance = info.dwFirstChance != 0;

        // Unwraps guaranteed: the dispatcher only routes events for known pids.
        let notification = {
            let target = self.targets.get(&process_id).unwrap();
            classify_exception(code, address, target)
        };

        match notification {
            DebuggerNotification::InitialBreak => {
                self.targets.get_mut(&process_id).unwrap().set_saw_initial_bp();
                Ok(DBG_CONTINUE)
            }
            DebuggerNotification::Breakpoint { pc } => {
                let id = self.targets.get_mut(&process_id).unwrap().handle_breakpoint(pc)?;
                callbacks.on_breakpoint(self, id);
                Ok(DBG_CONTINUE)
            }
            DebuggerNotification::SingleStep { thread_id } => {
                self.targets
                    .get_mut(&process_id)
                    .unwrap()
                    .complete_single_step(thread_id)?;
                Ok(DBG_CONTINUE)
            }
            DebuggerNotification::TargetException => {
                let event = ExceptionEvent {
                    code,
                    address,
                    first_chance,
                };
                Ok(callbacks.on_exception(self, &event))
            }
        }
    }
}

enum DebuggerNotification {
    InitialBreak,
    Breakpoint { pc: u64 },
    SingleStep { thread_id: DWORD },
    TargetException,
}

fn classify_exception(code: u32, address: u64, target: &Target) -> DebuggerNotification {
    match code {
        // The first EXCEPTION_BREAKPOINT in each process is the attach
        // notification from the OS loader.
        EXCEPTION_BREAKPOINT => {
            if target.saw_initial_bp() {
                if target.breakpoint_set_at_addr(address) {
                    DebuggerNotification::Breakpoint { pc: address }
                } else {
                    DebuggerNotification::TargetException
                }
            } else {
                DebuggerNotification::InitialBreak
            }
        }

        EXCEPTION_SINGLE_STEP => {
            let thread_id = target.current_thread_id();
            if target.expecting_single_step(thread_id) {
                DebuggerNotification::SingleStep { thread_id }
            } else {
                // Unexpected single step - possibly an intentional exception
                // in the debug target. Report it to the callbacks.
                DebuggerNotification::TargetException
            }
        }

        _ => DebuggerNotification::TargetException,
    }
}
