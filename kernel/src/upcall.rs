// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Data structure for storing an upcall from the kernel to a process.
//!
//! Upcalls a process subscribed are stored in the kernel-managed part of the
//! driver's grant, never in capsule memory. Capsules schedule them either
//! from inside a grant entry (`GrantKernelData::schedule_upcall`) or, from
//! outside one, through an [`UpcallHandle`]. A handle only names the upcall;
//! the function pointer is looked up at scheduling time, so a capsule can never
//! invoke an upcall the process has since replaced or unsubscribed.

use core::ptr::NonNull;

use crate::config;
use crate::errorcode::ErrorCode;
use crate::grant;
use crate::process::{self, Process, ProcessId};
use crate::syscall::SyscallReturn;

/// Type to uniquely identify an upcall subscription across all drivers.
///
/// This contains the driver number and the subscribe number within the driver.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct UpcallId {
    pub driver_num: usize,
    pub subscribe_num: usize,
}

/// Errors which can occur when scheduling a process Upcall.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpcallError {
    /// The passed `subscribe_num` exceeds the number of Upcalls available for
    /// this capsule.
    InvalidSubscribeNum,
    /// The process's task queue is full. This likely indicates a bug in the
    /// process or a capsule scheduling upcalls faster than they are handled.
    QueueFull,
    /// The driver's grant for this process is currently entered. Use
    /// `GrantKernelData::schedule_upcall` from inside the grant instead.
    GrantEntered,
    /// The process is gone, no longer alive, or has never set up the driver's
    /// grant.
    KernelError,
}

/// Type for calling an upcall in a process.
///
/// This is essentially a wrapper around a function pointer with
/// associated process data. It is only ever built by the kernel: from a
/// subscribe system call, or from the entry saved in a grant.
pub(crate) struct Upcall {
    pub(crate) process_id: ProcessId,
    pub(crate) upcall_id: UpcallId,
    pub(crate) appdata: usize,
    pub(crate) fn_ptr: Option<NonNull<()>>,
}

impl Upcall {
    pub(crate) fn new(
        process_id: ProcessId,
        upcall_id: UpcallId,
        appdata: usize,
        fn_ptr: Option<NonNull<()>>,
    ) -> Upcall {
        Upcall {
            process_id,
            upcall_id,
            appdata,
            fn_ptr,
        }
    }

    /// Schedule the upcall.
    ///
    /// This will queue the [`Upcall`] for the given process. Scheduling a null
    /// upcall does nothing and succeeds.
    ///
    /// The arguments (`r0-r2`) are the values passed back to the process and
    /// are specific to the individual `SyscallDriver` interfaces.
    pub(crate) fn schedule(
        &self,
        process: &dyn Process,
        r0: usize,
        r1: usize,
        r2: usize,
    ) -> Result<(), UpcallError> {
        let res = self.fn_ptr.map_or(Ok(()), |fp| {
            process
                .enqueue_task(process::Task::FunctionCall(process::FunctionCall {
                    source: process::FunctionCallSource::Driver(self.upcall_id),
                    argument0: r0,
                    argument1: r1,
                    argument2: r2,
                    argument3: self.appdata,
                    pc: fp.as_ptr() as usize,
                }))
                .map_err(|err| match err {
                    ErrorCode::NOMEM => UpcallError::QueueFull,
                    _ => UpcallError::KernelError,
                })
        });

        if config::CONFIG.trace_syscalls {
            debug!(
                "[{:?}] schedule[{:#x}:{}] @{:#x}({:#x}, {:#x}, {:#x}, {:#x}) = {:?}",
                self.process_id,
                self.upcall_id.driver_num,
                self.upcall_id.subscribe_num,
                self.fn_ptr.map_or(core::ptr::null_mut::<()>(), |fp| fp.as_ptr()) as usize,
                r0,
                r1,
                r2,
                self.appdata,
                res
            );
        }
        res
    }

    fn raw_fn_ptr(&self) -> *const () {
        self.fn_ptr
            .map_or(core::ptr::null::<()>(), |fp| fp.as_ptr().cast_const())
    }

    /// Create a successful syscall return type suitable for returning to
    /// userspace.
    ///
    /// This function is intended to be called on the "old upcall" that is
    /// being returned to userspace after a successful subscribe call and
    /// upcall swap.
    pub(crate) fn into_subscribe_success(self) -> SyscallReturn {
        SyscallReturn::SubscribeSuccess(self.raw_fn_ptr(), self.appdata)
    }

    /// Create a failure case syscall return type suitable for returning to
    /// userspace.
    ///
    /// This is intended to be used when a subscribe call cannot be handled and
    /// the function pointer passed from userspace must be returned back to
    /// userspace.
    pub(crate) fn into_subscribe_failure(self, err: ErrorCode) -> SyscallReturn {
        SyscallReturn::SubscribeFailure(err, self.raw_fn_ptr(), self.appdata)
    }
}

/// Opaque name of one upcall of one process.
///
/// Capsules keep these in place of the upcall itself. Scheduling through a
/// handle always invokes whatever the process has subscribed at that moment,
/// and does nothing observable if it has unsubscribed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpcallHandle {
    processid: ProcessId,
    driver_num: usize,
    subscribe_num: usize,
}

impl UpcallHandle {
    pub(crate) fn new(processid: ProcessId, driver_num: usize, subscribe_num: usize) -> Self {
        UpcallHandle {
            processid,
            driver_num,
            subscribe_num,
        }
    }

    pub fn processid(&self) -> ProcessId {
        self.processid
    }

    pub fn upcall_id(&self) -> UpcallId {
        UpcallId {
            driver_num: self.driver_num,
            subscribe_num: self.subscribe_num,
        }
    }

    /// Schedule the currently subscribed upcall with `r` as its first three
    /// arguments.
    ///
    /// Fails with `UpcallError::GrantEntered` if called while the driver's
    /// grant for this process is entered, and with `UpcallError::KernelError`
    /// if the process no longer exists or is not alive.
    pub fn schedule(&self, r: (usize, usize, usize)) -> Result<(), UpcallError> {
        self.processid.kernel.process_map_or(
            Err(UpcallError::KernelError),
            self.processid,
            |process| grant::schedule_saved_upcall(process, self.upcall_id(), r),
        )
    }
}
