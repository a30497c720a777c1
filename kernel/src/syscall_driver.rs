// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! System call interface for userspace processes implemented by capsules.
//!
//! Drivers implement these interfaces to expose operations to processes.
//!
//! # Mapping system calls to drivers
//!
//! `subscribe`, `command` and both `allow` classes take at least two
//! parameters. The first is a _driver identifier_ and tells the kernel which
//! driver the system call is for. The second is a _syscall identifier_ and is
//! used by the driver to differentiate instances of the call with different
//! driver-specific meanings (e.g. `subscribe` for "data received" vs
//! `subscribe` for "send completed"). The mapping between _driver
//! identifiers_ and drivers is determined by the board through
//! [`SyscallDriverLookup`](crate::platform::SyscallDriverLookup).
//!
//! Only `command` reaches the driver directly. Upcalls and allowed buffers are
//! stored by the kernel in the driver's grant, which is why every driver must
//! be able to allocate its grant on request.
//!
//! One convention in Tock is that _driver minor number_ 0 for the `command`
//! syscall can always be used to determine if the driver is supported by the
//! running kernel by checking the return code.

use crate::errorcode::ErrorCode;
use crate::process;
use crate::process::ProcessId;
use crate::syscall::SyscallReturn;

/// Possible return values of a `command` driver method, as specified in
/// TRD104.
///
/// This is just a wrapper around [`SyscallReturn`] since a `command` driver
/// method may only return primitive integer types as payload.
///
/// It is important for this wrapper to only be constructable over variants of
/// [`SyscallReturn`] that are deemed safe for a capsule to construct and
/// return to an application (e.g. not
/// [`SubscribeSuccess`](crate::syscall::SyscallReturn::SubscribeSuccess)).
/// This means that the inner value **must** remain private.
#[derive(Debug, PartialEq)]
pub struct CommandReturn(SyscallReturn);

impl CommandReturn {
    pub(crate) fn into_inner(self) -> SyscallReturn {
        self.0
    }

    /// Command error
    pub fn failure(rc: ErrorCode) -> Self {
        CommandReturn(SyscallReturn::Failure(rc))
    }

    /// Command error with an additional 32-bit data field
    pub fn failure_u32(rc: ErrorCode, data0: u32) -> Self {
        CommandReturn(SyscallReturn::FailureU32(rc, data0))
    }

    /// Command error with two additional 32-bit data fields
    pub fn failure_u32_u32(rc: ErrorCode, data0: u32, data1: u32) -> Self {
        CommandReturn(SyscallReturn::FailureU32U32(rc, data0, data1))
    }

    /// Command error with an additional 64-bit data field
    pub fn failure_u64(rc: ErrorCode, data0: u64) -> Self {
        CommandReturn(SyscallReturn::FailureU64(rc, data0))
    }

    /// Successful command
    pub fn success() -> Self {
        CommandReturn(SyscallReturn::Success)
    }

    /// Successful command with an additional 32-bit data field
    pub fn success_u32(data0: u32) -> Self {
        CommandReturn(SyscallReturn::SuccessU32(data0))
    }

    /// Successful command with two additional 32-bit data fields
    pub fn success_u32_u32(data0: u32, data1: u32) -> Self {
        CommandReturn(SyscallReturn::SuccessU32U32(data0, data1))
    }

    /// Successful command with three additional 32-bit data fields
    pub fn success_u32_u32_u32(data0: u32, data1: u32, data2: u32) -> Self {
        CommandReturn(SyscallReturn::SuccessU32U32U32(data0, data1, data2))
    }

    /// Successful command with an additional 64-bit data field
    pub fn success_u64(data0: u64) -> Self {
        CommandReturn(SyscallReturn::SuccessU64(data0))
    }

    /// Successful command with an additional 64-bit and 32-bit data field
    pub fn success_u64_u32(data0: u64, data1: u32) -> Self {
        CommandReturn(SyscallReturn::SuccessU64U32(data0, data1))
    }

    /// Returns true if this CommandReturn is of type Success.
    pub fn is_success(&self) -> bool {
        matches!(self.0, SyscallReturn::Success)
    }

    /// Returns the error code if this CommandReturn is any failure type.
    pub fn get_failure(&self) -> Option<ErrorCode> {
        match self.0 {
            SyscallReturn::Failure(rc)
            | SyscallReturn::FailureU32(rc, _)
            | SyscallReturn::FailureU32U32(rc, _, _)
            | SyscallReturn::FailureU64(rc, _) => Some(rc),
            _ => None,
        }
    }
}

impl From<Result<(), ErrorCode>> for CommandReturn {
    fn from(rc: Result<(), ErrorCode>) -> Self {
        match rc {
            Ok(()) => CommandReturn::success(),
            Err(e) => CommandReturn::failure(e),
        }
    }
}

impl From<process::Error> for CommandReturn {
    fn from(perr: process::Error) -> Self {
        CommandReturn::failure(perr.into())
    }
}

/// Trait for capsules implementing peripheral driver system calls specified in
/// TRD104. The kernel translates the values passed from userspace into Rust
/// types and includes which process is making the call. All of these system
/// calls perform very little synchronous work; long running computations or
/// I/O should be split-phase, with an upcall indicating their completion.
///
/// The exact instances of each of these methods (which identifiers are valid
/// and what they represents) are specific to the peripheral system call
/// driver.
///
/// Note about subscribe and allow: upcalls and buffers are handled entirely by
/// the core kernel, and therefore there are no subscribe or allow functions
/// for capsules to implement. Capsules read them back through
/// [`GrantKernelData`](crate::grant::GrantKernelData).
#[allow(unused_variables)]
pub trait SyscallDriver {
    /// System call for a process to perform a short synchronous operation or
    /// start a long-running split-phase operation (whose completion is
    /// signaled with an upcall). Command 0 is a reserved command to detect if
    /// a peripheral system call driver is installed and must always return a
    /// `CommandReturn::success`.
    fn command(
        &self,
        command_num: usize,
        r2: usize,
        r3: usize,
        processid: ProcessId,
    ) -> CommandReturn {
        CommandReturn::failure(ErrorCode::NOSUPPORT)
    }

    /// Request to allocate a capsule's grant for a specific process.
    ///
    /// The core kernel uses this function to instruct a capsule to ensure its
    /// grant (if it has one) is allocated for a specific process. The core
    /// kernel needs the capsule to initiate the allocation because only the
    /// capsule knows the type T (and therefore the size of T) that will be
    /// stored in the grant.
    ///
    /// The typical implementation will look like:
    /// ```rust, ignore
    /// fn allocate_grant(&self, processid: ProcessId) -> Result<(), process::Error> {
    ///     self.apps.allocate_or_get(processid, Default::default).map(|_| ())
    /// }
    /// ```
    ///
    /// No default implementation is provided to help prevent accidentally
    /// forgetting to implement this function.
    ///
    /// If a capsule fails to successfully implement this function, subscribe
    /// and allow calls from userspace for the driver fail with `NOMEM`.
    //
    // Upcalls and allowed buffers live in the kernel-managed header of the
    // driver's grant, and only the capsule knows the size of its grant type.
    // A subscribe or allow that arrives before the capsule has touched its
    // grant therefore has to ask the capsule to allocate it.
    fn allocate_grant(&self, processid: ProcessId) -> Result<(), process::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_result() {
        assert!(CommandReturn::from(Ok(())).is_success());
        assert_eq!(
            CommandReturn::from(Err(ErrorCode::BUSY)).get_failure(),
            Some(ErrorCode::BUSY)
        );
        assert_eq!(
            CommandReturn::from(process::Error::OutOfMemory).get_failure(),
            Some(ErrorCode::NOMEM)
        );
    }

    #[test]
    fn payload_preserved() {
        assert_eq!(
            CommandReturn::success_u32_u32(4, 5).into_inner(),
            SyscallReturn::SuccessU32U32(4, 5)
        );
        assert_eq!(CommandReturn::success_u64(7).get_failure(), None);
    }
}
