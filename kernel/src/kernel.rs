// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Tock's main kernel state and system call dispatcher.
//!
//! The [`Kernel`] owns the table of processes and hands out grants. It is the
//! only code that translates system calls from a process into operations on
//! grants, allowed buffers and upcalls, validating every pointer a process
//! passes before a buffer or upcall is built from it.

use core::cell::Cell;
use core::iter::FilterMap;
use core::ptr::NonNull;
use core::slice;

use tock_cells::numeric_cell_ext::NumericCellExt;

use crate::capabilities;
use crate::config;
use crate::errorcode::ErrorCode;
use crate::grant::{self, AllowRoSize, AllowRwSize, Grant, UpcallSize};
use crate::platform::platform::SyscallDriverLookup;
use crate::process::{self, FunctionCall, Process, ProcessId, State, Task};
use crate::syscall::{self, Syscall, SyscallReturn, YieldCall};
use crate::upcall::{Upcall, UpcallId};

/// One entry of the kernel's process table.
pub struct ProcessSlot {
    proc: Cell<Option<&'static dyn Process>>,
}

impl ProcessSlot {
    pub const fn empty() -> ProcessSlot {
        ProcessSlot {
            proc: Cell::new(None),
        }
    }

    /// The process installed in this slot, if any.
    pub fn get(&self) -> Option<&'static dyn Process> {
        self.proc.get()
    }
}

impl Default for ProcessSlot {
    fn default() -> Self {
        ProcessSlot::empty()
    }
}

/// Iterator over the installed processes.
pub(crate) type ProcessIter<'a> =
    FilterMap<slice::Iter<'a, ProcessSlot>, fn(&ProcessSlot) -> Option<&'static dyn Process>>;

/// Main object for the kernel. Each board will need to create one.
pub struct Kernel {
    /// This holds a pointer to the static array of Process pointers.
    processes: &'static [ProcessSlot],

    /// A counter which keeps track of how many process identifiers have been
    /// created. This is used to create new unique identifiers for processes.
    process_identifier_max: Cell<usize>,

    /// How many grant regions have been setup. This is incremented on every
    /// call to `create_grant()`. We need to explicitly track this so that when
    /// processes are created they can be allocated pointers for each grant.
    grant_counter: Cell<usize>,

    /// Flag to mark that grants have been finalized. This means that the kernel
    /// cannot support creating new grants because processes have already been
    /// created and the data structures for grants have already been
    /// established.
    grants_finalized: Cell<bool>,
}

impl Kernel {
    pub fn new(processes: &'static [ProcessSlot]) -> Kernel {
        Kernel {
            processes,
            process_identifier_max: Cell::new(0),
            grant_counter: Cell::new(0),
            grants_finalized: Cell::new(false),
        }
    }

    /// Put `process` into the slot its `ProcessId` names.
    ///
    /// Fails with `INVAL` if the slot does not exist and `BUSY` if it is
    /// already occupied.
    pub fn install_process(
        &self,
        process: &'static dyn Process,
        _capability: &dyn capabilities::ProcessManagementCapability,
    ) -> Result<(), ErrorCode> {
        let slot = self
            .processes
            .get(process.processid().index)
            .ok_or(ErrorCode::INVAL)?;
        if slot.proc.get().is_some() {
            return Err(ErrorCode::BUSY);
        }
        slot.proc.set(Some(process));
        Ok(())
    }

    /// Index of the first slot without a process.
    pub fn first_free_slot(&self) -> Option<usize> {
        self.processes
            .iter()
            .position(|slot| slot.proc.get().is_none())
    }

    /// Look up the process `processid` refers to.
    ///
    /// Returns `None` if the slot is empty or holds a different (restarted)
    /// instance than the one `processid` was issued for.
    pub(crate) fn get_process(&self, processid: ProcessId) -> Option<&'static dyn Process> {
        // We use the index in the `processid` so we can do a direct lookup.
        // However, we are not guaranteed that the app still exists at that
        // index in the processes array.
        match self.processes.get(processid.index).and_then(ProcessSlot::get) {
            Some(process) if process.processid() == processid => Some(process),
            _ => None,
        }
    }

    /// Run a closure on a specific process if it exists. If the process with a
    /// matching `ProcessId` does not exist at the index specified within the
    /// `ProcessId`, then `default` will be returned.
    ///
    /// A match will not be found if the process was removed, or if the process
    /// changed its identifier (likely after being restarted). Note that a match
    /// _will_ be found if the process still exists in the correct location in
    /// the array but is in any "stopped" state.
    pub(crate) fn process_map_or<F, R>(&self, default: R, processid: ProcessId, closure: F) -> R
    where
        F: FnOnce(&dyn Process) -> R,
    {
        match self.get_process(processid) {
            Some(process) => closure(process),
            None => default,
        }
    }

    /// Run a closure on every installed process.
    pub fn process_each<F>(
        &self,
        _capability: &dyn capabilities::ProcessManagementCapability,
        mut closure: F,
    ) where
        F: FnMut(&dyn Process),
    {
        for process in self.get_process_iter() {
            closure(process);
        }
    }

    /// Returns an iterator over all processes loaded by the kernel.
    pub(crate) fn get_process_iter(&self) -> ProcessIter<'_> {
        fn keep_some(slot: &ProcessSlot) -> Option<&'static dyn Process> {
            slot.proc.get()
        }
        self.processes
            .iter()
            .filter_map(keep_some as fn(&ProcessSlot) -> Option<&'static dyn Process>)
    }

    /// Create a new grant. This is used in board initialization to setup grants
    /// that capsules use to interact with processes.
    ///
    /// Grants **must** only be created _before_ processes are initialized.
    /// Processes use the number of grants that have been allocated to correctly
    /// initialize the process's memory with a pointer for each grant. If a
    /// grant is created after processes are initialized this will panic.
    ///
    /// Calling this function is restricted to only certain users, and to
    /// enforce this calling this function requires the
    /// `MemoryAllocationCapability` capability.
    pub fn create_grant<T, Upcalls: UpcallSize, AllowROs: AllowRoSize, AllowRWs: AllowRwSize>(
        &'static self,
        driver_num: usize,
        _capability: &dyn capabilities::MemoryAllocationCapability,
    ) -> Grant<T, Upcalls, AllowROs, AllowRWs> {
        if self.grants_finalized.get() {
            panic!("Grants finalized. Cannot create a new grant.");
        }

        // Create and return a new grant.
        let grant_index = self.grant_counter.get_and_increment();
        Grant::new(self, driver_num, grant_index)
    }

    /// Returns the number of grants that have been setup in the system and
    /// marks the grants as "finalized". This means that no more grants can
    /// be created because data structures have been setup based on the number
    /// of grants when this function is called.
    ///
    /// In practice, this is called when processes are created, and the process
    /// memory is setup based on the number of current grants.
    pub(crate) fn get_grant_count_and_finalize(&self) -> usize {
        self.grants_finalized.set(true);
        self.grant_counter.get()
    }

    /// Create a new unique identifier for a process and return the identifier.
    ///
    /// Typically we just choose a larger number than we have used for any process
    /// before which ensures that the identifier is unique.
    pub(crate) fn create_process_identifier(&self) -> usize {
        self.process_identifier_max.get_and_increment()
    }

    /// Terminate the process `processid` refers to, releasing its grants,
    /// allowed buffers and pending upcalls.
    pub fn terminate_process(
        &self,
        processid: ProcessId,
        completion_code: Option<u32>,
        _capability: &dyn capabilities::ProcessManagementCapability,
    ) -> Result<(), ErrorCode> {
        let process = self.get_process(processid).ok_or(ErrorCode::INVAL)?;
        process.terminate(completion_code);
        Ok(())
    }

    /// Terminate and restart the process `processid` refers to.
    ///
    /// The restarted process has a new `ProcessId`, which is returned.
    pub fn restart_process(
        &self,
        processid: ProcessId,
        completion_code: Option<u32>,
        _capability: &dyn capabilities::ProcessManagementCapability,
    ) -> Result<ProcessId, ErrorCode> {
        let process = self.get_process(processid).ok_or(ErrorCode::INVAL)?;
        process.try_restart(completion_code);
        Ok(process.processid())
    }

    /// Cause all apps to fault.
    ///
    /// Only callers with the `ProcessManagementCapability` can call this
    /// function. This restricts general capsules from being able to call this
    /// function, since capsules should not be able to arbitrarily restart all
    /// apps.
    pub fn hardfault_all_apps(&self, _capability: &dyn capabilities::ProcessManagementCapability) {
        for process in self.get_process_iter() {
            process.set_fault_state();
        }
    }

    /// Hand the next queued task of `process` to it.
    ///
    /// Only a yielded process receives upcalls. The delivered function call is
    /// returned so the caller can switch to it.
    pub fn deliver_upcall(
        &self,
        process: &dyn Process,
        _capability: &dyn capabilities::MainLoopCapability,
    ) -> Option<FunctionCall> {
        if process.get_state() != State::Yielded {
            return None;
        }

        let Task::FunctionCall(ccb) = process.dequeue_task()?;
        if config::CONFIG.trace_syscalls {
            debug!(
                "[{:?}] function_call @{:#x}({:#x}, {:#x}, {:#x}, {:#x})",
                process.processid(),
                ccb.pc,
                ccb.argument0,
                ccb.argument1,
                ccb.argument2,
                ccb.argument3,
            );
        }
        process.set_process_function(ccb);
        Some(ccb)
    }

    /// Handle a system call from `process`.
    ///
    /// The result is stored in the process with `set_syscall_return_value`,
    /// except for calls that do not return (`yield`, `exit`).
    pub fn handle_syscall<D: SyscallDriverLookup>(
        &self,
        drivers: &D,
        process: &dyn Process,
        syscall: Syscall,
        _capability: &dyn capabilities::MainLoopCapability,
    ) {
        // Hook for process debugging.
        process.debug_syscall_called(syscall);

        match syscall {
            Syscall::Memop { operand, arg0 } => {
                let rval = memop(process, operand, arg0);
                if config::CONFIG.trace_syscalls {
                    debug!(
                        "[{:?}] memop({}, {:#x}) = {:?}",
                        process.processid(),
                        operand,
                        arg0,
                        rval
                    );
                }
                process.set_syscall_return_value(rval);
            }
            Syscall::Yield { which, address } => {
                if config::CONFIG.trace_syscalls {
                    debug!("[{:?}] yield. which: {}", process.processid(), which);
                }
                if which > (YieldCall::Wait as usize) {
                    // Only 0 and 1 are valid, so this is not a valid yield
                    // system call, Yield does not have a return value because
                    // it can push a function call onto the stack; just return
                    // control to the process.
                    return;
                }
                let wait = which == (YieldCall::Wait as usize);
                // If this is a yield-no-wait AND there are no pending tasks,
                // then return immediately. Otherwise, go into the yielded
                // state and execute tasks now or when they arrive.
                if !wait && !process.has_tasks() {
                    // Set the "did I trigger upcalls" flag to be 0, return
                    // immediately. If address is invalid does nothing.
                    process.set_byte(address, 0);
                } else {
                    process.set_byte(address, 1);
                    process.set_yielded_state();
                }
            }
            Syscall::Subscribe {
                driver_number,
                subdriver_number,
                upcall_ptr,
                appdata,
            } => {
                // A upcall is identified as a tuple of the driver number and
                // the subdriver number.
                let upcall_id = UpcallId {
                    driver_num: driver_number,
                    subscribe_num: subdriver_number,
                };

                // A null `upcall_ptr` is the special "unsubscribe" operation.
                let ptr = NonNull::new(upcall_ptr);
                let upcall = Upcall::new(process.processid(), upcall_id, appdata, ptr);

                let rval = if ptr.is_some_and(|p| !process.is_valid_upcall_function_pointer(p)) {
                    upcall.into_subscribe_failure(ErrorCode::INVAL)
                } else {
                    // The upcalls are stored by the core kernel in the grant
                    // region so we can guarantee a correct upcall swap.
                    match with_grant_retry(drivers, process, driver_number, upcall, |upcall| {
                        grant::subscribe(process, upcall)
                    }) {
                        Ok(old_upcall) => old_upcall.into_subscribe_success(),
                        Err((new_upcall, err)) => new_upcall.into_subscribe_failure(err),
                    }
                };

                // We only clear upcalls if the subscribe will return success.
                // Only one upcall should exist per tuple, so pending upcalls
                // with the old function pointer are dropped now.
                if rval.is_success() {
                    process.remove_pending_upcalls(upcall_id);
                }

                if config::CONFIG.trace_syscalls {
                    debug!(
                        "[{:?}] subscribe({:#x}, {}, @{:#x}, {:#x}) = {:?}",
                        process.processid(),
                        driver_number,
                        subdriver_number,
                        upcall_ptr as usize,
                        appdata,
                        rval
                    );
                }

                process.set_syscall_return_value(rval);
            }
            Syscall::Command {
                driver_number,
                subdriver_number,
                arg0,
                arg1,
            } => {
                let cres = drivers.with_driver(driver_number, |driver| match driver {
                    Some(d) => d
                        .command(subdriver_number, arg0, arg1, process.processid())
                        .into_inner(),
                    None => SyscallReturn::Failure(ErrorCode::NODEVICE),
                });

                if config::CONFIG.trace_syscalls {
                    debug!(
                        "[{:?}] cmd({:#x}, {}, {:#x}, {:#x}) = {:?}",
                        process.processid(),
                        driver_number,
                        subdriver_number,
                        arg0,
                        arg1,
                        cres,
                    );
                }

                process.set_syscall_return_value(cres);
            }
            Syscall::ReadWriteAllow {
                driver_number,
                subdriver_number,
                allow_address,
                allow_size,
            } => {
                // Try to create an appropriate [`ReadWriteProcessBuffer`]. This
                // method will ensure that the memory in question is located in
                // the process-accessible memory space.
                let res = match process.build_readwrite_process_buffer(allow_address, allow_size)
                {
                    Ok(rw_pbuf) => {
                        match with_grant_retry(drivers, process, driver_number, rw_pbuf, |buf| {
                            grant::allow_rw(process, driver_number, subdriver_number, buf)
                        }) {
                            Ok(returned_pbuf) => {
                                // Pass the previous buffer information back to
                                // the process.
                                let (ptr, len) = returned_pbuf.consume();
                                SyscallReturn::AllowReadWriteSuccess(ptr, len)
                            }
                            Err((rejected_pbuf, err)) => {
                                // Pass the new buffer information back to the
                                // process.
                                let (ptr, len) = rejected_pbuf.consume();
                                SyscallReturn::AllowReadWriteFailure(err, ptr, len)
                            }
                        }
                    }
                    Err(allow_error) => {
                        SyscallReturn::AllowReadWriteFailure(allow_error, allow_address, allow_size)
                    }
                };

                if config::CONFIG.trace_syscalls {
                    debug!(
                        "[{:?}] read-write allow({:#x}, {}, @{:#x}, {:#x}) = {:?}",
                        process.processid(),
                        driver_number,
                        subdriver_number,
                        allow_address as usize,
                        allow_size,
                        res
                    );
                }

                process.set_syscall_return_value(res);
            }
            Syscall::ReadOnlyAllow {
                driver_number,
                subdriver_number,
                allow_address,
                allow_size,
            } => {
                let res = match process.build_readonly_process_buffer(allow_address, allow_size) {
                    Ok(ro_pbuf) => {
                        match with_grant_retry(drivers, process, driver_number, ro_pbuf, |buf| {
                            grant::allow_ro(process, driver_number, subdriver_number, buf)
                        }) {
                            Ok(returned_pbuf) => {
                                let (ptr, len) = returned_pbuf.consume();
                                SyscallReturn::AllowReadOnlySuccess(ptr, len)
                            }
                            Err((rejected_pbuf, err)) => {
                                let (ptr, len) = rejected_pbuf.consume();
                                SyscallReturn::AllowReadOnlyFailure(err, ptr, len)
                            }
                        }
                    }
                    Err(allow_error) => {
                        SyscallReturn::AllowReadOnlyFailure(allow_error, allow_address, allow_size)
                    }
                };

                if config::CONFIG.trace_syscalls {
                    debug!(
                        "[{:?}] read-only allow({:#x}, {}, @{:#x}, {:#x}) = {:?}",
                        process.processid(),
                        driver_number,
                        subdriver_number,
                        allow_address as usize,
                        allow_size,
                        res
                    );
                }

                process.set_syscall_return_value(res);
            }
            Syscall::Exit {
                which,
                completion_code,
            } => match which {
                // The process called the `exit-terminate` system call.
                syscall::EXIT_TERMINATE => process.terminate(Some(completion_code as u32)),
                // The process called the `exit-restart` system call.
                syscall::EXIT_RESTART => process.try_restart(Some(completion_code as u32)),
                // The process called an invalid variant of the Exit system
                // call class.
                _ => process.set_syscall_return_value(SyscallReturn::Failure(ErrorCode::NOSUPPORT)),
            },
        }
    }
}

/// Run `attempt` against the driver's grant, asking the driver to allocate its
/// grant and trying once more if the process does not have it yet.
///
/// `value` is handed back with the error if the operation does not happen.
fn with_grant_retry<D, V, R, F>(
    drivers: &D,
    process: &dyn Process,
    driver_number: usize,
    value: V,
    mut attempt: F,
) -> Result<R, (V, ErrorCode)>
where
    D: SyscallDriverLookup,
    F: FnMut(V) -> Result<R, (V, process::Error)>,
{
    drivers.with_driver(driver_number, |driver| {
        let Some(d) = driver else {
            return Err((value, ErrorCode::NODEVICE));
        };

        let value = match attempt(value) {
            Ok(r) => return Ok(r),
            Err((value, process::Error::NoGrant)) => value,
            Err((value, err)) => return Err((value, err.into())),
        };

        // Used to tell apart a driver that allocated the wrong grant from one
        // that allocated nothing.
        let allocated_grants_count = process.grant_allocated_count().unwrap_or(0);

        if d.allocate_grant(process.processid()).is_err() {
            // If the capsule errors on allocation we assume it is because the
            // grant could not be created.
            return Err((value, ErrorCode::NOMEM));
        }

        match attempt(value) {
            Ok(r) => Ok(r),
            Err((value, process::Error::NoGrant)) => {
                if config::CONFIG.trace_syscalls {
                    let now = process.grant_allocated_count().unwrap_or(0);
                    if now > allocated_grants_count {
                        debug!(
                            "[{:?}] ERROR driver {:#x} allocated wrong grant",
                            process.processid(),
                            driver_number
                        );
                    } else {
                        debug!(
                            "[{:?}] WARN driver {:#x} did not allocate grant",
                            process.processid(),
                            driver_number
                        );
                    }
                }
                Err((value, ErrorCode::NOMEM))
            }
            Err((value, err)) => Err((value, err.into())),
        }
    })
}

/// Handle the memop system call class.
///
/// | operand | meaning                                     |
/// |---------|---------------------------------------------|
/// | 0       | `brk`: set the process break to `arg0`      |
/// | 1       | `sbrk`: move the process break by `arg0`    |
/// | 2       | start of process RAM                        |
/// | 3       | end of process RAM                          |
/// | 4       | start of process flash                      |
/// | 5       | end of process flash                        |
/// | 6       | lowest address of the grant region          |
fn memop(process: &dyn Process, op_type: usize, r1: usize) -> SyscallReturn {
    match op_type {
        0 => process
            .brk(r1 as *const u8)
            .map(|_| SyscallReturn::Success)
            .unwrap_or(SyscallReturn::Failure(ErrorCode::NOMEM)),
        1 => process
            .sbrk(r1 as isize)
            .map(SyscallReturn::SuccessPtr)
            .unwrap_or(SyscallReturn::Failure(ErrorCode::NOMEM)),
        2 => SyscallReturn::SuccessPtr(process.mem_start()),
        3 => SyscallReturn::SuccessPtr(process.mem_end()),
        4 => SyscallReturn::SuccessPtr(process.flash_start()),
        5 => SyscallReturn::SuccessPtr(process.flash_end()),
        6 => SyscallReturn::SuccessPtr(process.kernel_memory_break()),
        _ => SyscallReturn::Failure(ErrorCode::NOSUPPORT),
    }
}
