// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Mechanisms for handling and defining system calls.
//!
//! # System Call Overview
//!
//! Tock supports six system call classes besides `exit`. The `yield`, `memop`
//! and `exit` classes are handled by the core kernel. `subscribe` and both
//! `allow` classes are also handled by the core kernel, which stores upcalls
//! and shared buffers in the driver's grant so that swaps are always correct.
//! Only `command` is forwarded to the driver itself.
//!
//! The architecture layer decodes the trap registers with
//! [`Syscall::from_register_arguments`] and encodes the [`SyscallReturn`] the
//! kernel stores with `Process::set_syscall_return_value`.

use core::fmt::Write;

use crate::errorcode::ErrorCode;

/// Helper function to split a u64 into a higher and lower u32.
///
/// Used in encoding 64-bit wide system call return values on 32-bit
/// platforms.
#[inline]
pub fn u64_to_be_u32s(src: u64) -> (u32, u32) {
    let src_hi = (src >> 32) as u32;
    let src_lo = (src & 0xFFFFFFFF) as u32;
    (src_hi, src_lo)
}

/// Enumeration of the system call classes based on the identifiers
/// specified in the Tock ABI.
///
/// These are encoded as 8 bit values as on some architectures the value can
/// be encoded in the instruction itself.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallClass {
    Yield = 0,
    Subscribe = 1,
    Command = 2,
    ReadWriteAllow = 3,
    ReadOnlyAllow = 4,
    Memop = 5,
    Exit = 6,
}

/// Enumeration of the yield system calls based on the Yield identifier
/// values specified in the Tock ABI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum YieldCall {
    NoWait = 0,
    Wait = 1,
}

/// Exit identifiers: terminate the process, or ask for it to be restarted.
pub const EXIT_TERMINATE: usize = 0;
pub const EXIT_RESTART: usize = 1;

impl TryFrom<u8> for SyscallClass {
    type Error = u8;

    fn try_from(syscall_class_id: u8) -> Result<SyscallClass, u8> {
        match syscall_class_id {
            0 => Ok(SyscallClass::Yield),
            1 => Ok(SyscallClass::Subscribe),
            2 => Ok(SyscallClass::Command),
            3 => Ok(SyscallClass::ReadWriteAllow),
            4 => Ok(SyscallClass::ReadOnlyAllow),
            5 => Ok(SyscallClass::Memop),
            6 => Ok(SyscallClass::Exit),
            i => Err(i),
        }
    }
}

/// Decoded system calls as defined in the Tock ABI.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Syscall {
    /// Structure representing an invocation of the [`SyscallClass::Yield`]
    /// system call class. `which` is the Yield identifier value and `address`
    /// is the address where the kernel reports whether an upcall was run
    /// (1) or not (0) for a no-wait yield.
    Yield { which: usize, address: *mut u8 },

    /// Structure representing an invocation of the Subscribe system call
    /// class.
    Subscribe {
        /// The driver identifier.
        driver_number: usize,
        /// The subscribe identifier.
        subdriver_number: usize,
        /// Upcall pointer to the upcall function. Null unsubscribes.
        upcall_ptr: *mut (),
        /// Userspace application data.
        appdata: usize,
    },

    /// Structure representing an invocation of the Command system call class.
    Command {
        /// The driver identifier.
        driver_number: usize,
        /// The command identifier.
        subdriver_number: usize,
        /// Value passed to the `Command` implementation.
        arg0: usize,
        /// Value passed to the `Command` implementation.
        arg1: usize,
    },

    /// Structure representing an invocation of the ReadWriteAllow system call
    /// class.
    ReadWriteAllow {
        /// The driver identifier.
        driver_number: usize,
        /// The buffer identifier.
        subdriver_number: usize,
        /// The address where the buffer starts.
        allow_address: *mut u8,
        /// The size of the buffer in bytes. Zero releases the buffer.
        allow_size: usize,
    },

    /// Structure representing an invocation of the ReadOnlyAllow system call
    /// class.
    ReadOnlyAllow {
        /// The driver identifier.
        driver_number: usize,
        /// The buffer identifier.
        subdriver_number: usize,
        /// The address where the buffer starts.
        allow_address: *const u8,
        /// The size of the buffer in bytes. Zero releases the buffer.
        allow_size: usize,
    },

    /// Structure representing an invocation of the Memop system call class.
    Memop {
        /// The operation.
        operand: usize,
        /// The operation argument.
        arg0: usize,
    },

    /// Structure representing an invocation of the Exit system call class.
    Exit {
        /// The exit identifier.
        which: usize,
        /// The completion code passed into the kernel.
        completion_code: usize,
    },
}

impl Syscall {
    /// Helper function for converting raw values passed back from an
    /// application into a `Syscall` type in Tock, representing an typed
    /// version of a system call invocation. The method returns None if the
    /// values do not specify a valid system call.
    ///
    /// Different architectures have different ABIs for a process and the
    /// kernel to exchange data. The 32-bit ABI for CortexM and RISCV
    /// microcontrollers is specified in TRD104.
    pub fn from_register_arguments(
        syscall_number: u8,
        r0: usize,
        r1: usize,
        r2: usize,
        r3: usize,
    ) -> Option<Syscall> {
        match SyscallClass::try_from(syscall_number) {
            Ok(SyscallClass::Yield) => Some(Syscall::Yield {
                which: r0,
                address: r1 as *mut u8,
            }),
            Ok(SyscallClass::Subscribe) => Some(Syscall::Subscribe {
                driver_number: r0,
                subdriver_number: r1,
                upcall_ptr: r2 as *mut (),
                appdata: r3,
            }),
            Ok(SyscallClass::Command) => Some(Syscall::Command {
                driver_number: r0,
                subdriver_number: r1,
                arg0: r2,
                arg1: r3,
            }),
            Ok(SyscallClass::ReadWriteAllow) => Some(Syscall::ReadWriteAllow {
                driver_number: r0,
                subdriver_number: r1,
                allow_address: r2 as *mut u8,
                allow_size: r3,
            }),
            Ok(SyscallClass::ReadOnlyAllow) => Some(Syscall::ReadOnlyAllow {
                driver_number: r0,
                subdriver_number: r1,
                allow_address: r2 as *const u8,
                allow_size: r3,
            }),
            Ok(SyscallClass::Memop) => Some(Syscall::Memop {
                operand: r0,
                arg0: r1,
            }),
            Ok(SyscallClass::Exit) => Some(Syscall::Exit {
                which: r0,
                completion_code: r1,
            }),
            Err(_) => None,
        }
    }

    /// The class this system call belongs to.
    pub fn class(&self) -> SyscallClass {
        match self {
            Syscall::Yield { .. } => SyscallClass::Yield,
            Syscall::Subscribe { .. } => SyscallClass::Subscribe,
            Syscall::Command { .. } => SyscallClass::Command,
            Syscall::ReadWriteAllow { .. } => SyscallClass::ReadWriteAllow,
            Syscall::ReadOnlyAllow { .. } => SyscallClass::ReadOnlyAllow,
            Syscall::Memop { .. } => SyscallClass::Memop,
            Syscall::Exit { .. } => SyscallClass::Exit,
        }
    }

    /// The driver this system call is addressed to, for the classes that
    /// address one.
    pub fn driver_number(&self) -> Option<usize> {
        match *self {
            Syscall::Subscribe { driver_number, .. }
            | Syscall::Command { driver_number, .. }
            | Syscall::ReadWriteAllow { driver_number, .. }
            | Syscall::ReadOnlyAllow { driver_number, .. } => Some(driver_number),
            _ => None,
        }
    }
}

/// Enumeration of the system call return type variant identifiers described
/// in TRD104.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SyscallReturnVariant {
    Failure = 0,
    FailureU32 = 1,
    FailureU32U32 = 2,
    FailureU64 = 3,
    Success = 128,
    SuccessU32 = 129,
    SuccessU32U32 = 130,
    SuccessU64 = 131,
    SuccessU32U32U32 = 132,
    SuccessU64U32 = 133,
}

/// Enumeration of the possible system call return variants.
///
/// This struct operates over primitive types such as integers of fixed length
/// and pointers. It is constructed by the scheduler and passed down to the
/// architecture to be encoded into registers. Capsules only build it through
/// [`CommandReturn`](crate::syscall_driver::CommandReturn).
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SyscallReturn {
    /// Generic error case
    Failure(ErrorCode),
    /// Generic error case, with an additional 32-bit data field
    FailureU32(ErrorCode, u32),
    /// Generic error case, with two additional 32-bit data fields
    FailureU32U32(ErrorCode, u32, u32),
    /// Generic error case, with an additional 64-bit data field
    FailureU64(ErrorCode, u64),
    /// Generic success case
    Success,
    /// Generic success case, with an additional 32-bit data field
    SuccessU32(u32),
    /// Generic success case, with two additional 32-bit data fields
    SuccessU32U32(u32, u32),
    /// Generic success case, with three additional 32-bit data fields
    SuccessU32U32U32(u32, u32, u32),
    /// Generic success case, with an additional 64-bit data field
    SuccessU64(u64),
    /// Generic success case, with an additional 32-bit and 64-bit data field
    SuccessU64U32(u64, u32),
    /// Generic success case, with an address-sized payload
    SuccessAddr(usize),
    /// Generic success case, with a pointer payload
    SuccessPtr(*const u8),

    /// Read/Write allow success case, returns the previous allowed buffer and
    /// size to the process.
    AllowReadWriteSuccess(*mut u8, usize),
    /// Read/Write allow failure case, returns the passed allowed buffer and
    /// size to the process.
    AllowReadWriteFailure(ErrorCode, *mut u8, usize),

    /// Read only allow success case, returns the previous allowed buffer and
    /// size to the process.
    AllowReadOnlySuccess(*const u8, usize),
    /// Read only allow failure case, returns the passed allowed buffer and
    /// size to the process.
    AllowReadOnlyFailure(ErrorCode, *const u8, usize),

    /// Subscribe success case, returns the previous upcall function pointer
    /// and application data.
    SubscribeSuccess(*const (), usize),
    /// Subscribe failure case, returns the passed upcall function pointer and
    /// application data.
    SubscribeFailure(ErrorCode, *const (), usize),
}

impl SyscallReturn {
    /// Returns true if the `SyscallReturn` is any success type.
    pub(crate) fn is_success(&self) -> bool {
        match self {
            SyscallReturn::Success => true,
            SyscallReturn::SuccessU32(_) => true,
            SyscallReturn::SuccessU32U32(_, _) => true,
            SyscallReturn::SuccessU32U32U32(_, _, _) => true,
            SyscallReturn::SuccessU64(_) => true,
            SyscallReturn::SuccessU64U32(_, _) => true,
            SyscallReturn::SuccessAddr(_) => true,
            SyscallReturn::SuccessPtr(_) => true,
            SyscallReturn::AllowReadWriteSuccess(_, _) => true,
            SyscallReturn::AllowReadOnlySuccess(_, _) => true,
            SyscallReturn::SubscribeSuccess(_, _) => true,
            SyscallReturn::Failure(_) => false,
            SyscallReturn::FailureU32(_, _) => false,
            SyscallReturn::FailureU32U32(_, _, _) => false,
            SyscallReturn::FailureU64(_, _) => false,
            SyscallReturn::AllowReadWriteFailure(_, _, _) => false,
            SyscallReturn::AllowReadOnlyFailure(_, _, _) => false,
            SyscallReturn::SubscribeFailure(_, _, _) => false,
        }
    }

    /// Encode the system call return value into 4 registers, following the
    /// 32-bit ABI of TRD104. Pointers and addresses are truncated to the
    /// register width of the caller.
    pub fn encode_syscall_return(&self, a0: &mut u32, a1: &mut u32, a2: &mut u32, a3: &mut u32) {
        let err = |e: ErrorCode| usize::from(e) as u32;
        match *self {
            SyscallReturn::Failure(e) => {
                *a0 = SyscallReturnVariant::Failure as u32;
                *a1 = err(e);
            }
            SyscallReturn::FailureU32(e, data0) => {
                *a0 = SyscallReturnVariant::FailureU32 as u32;
                *a1 = err(e);
                *a2 = data0;
            }
            SyscallReturn::FailureU32U32(e, data0, data1) => {
                *a0 = SyscallReturnVariant::FailureU32U32 as u32;
                *a1 = err(e);
                *a2 = data0;
                *a3 = data1;
            }
            SyscallReturn::FailureU64(e, data0) => {
                let (data0_msb, data0_lsb) = u64_to_be_u32s(data0);
                *a0 = SyscallReturnVariant::FailureU64 as u32;
                *a1 = err(e);
                *a2 = data0_lsb;
                *a3 = data0_msb;
            }
            SyscallReturn::Success => {
                *a0 = SyscallReturnVariant::Success as u32;
            }
            SyscallReturn::SuccessU32(data0) => {
                *a0 = SyscallReturnVariant::SuccessU32 as u32;
                *a1 = data0;
            }
            SyscallReturn::SuccessU32U32(data0, data1) => {
                *a0 = SyscallReturnVariant::SuccessU32U32 as u32;
                *a1 = data0;
                *a2 = data1;
            }
            SyscallReturn::SuccessU32U32U32(data0, data1, data2) => {
                *a0 = SyscallReturnVariant::SuccessU32U32U32 as u32;
                *a1 = data0;
                *a2 = data1;
                *a3 = data2;
            }
            SyscallReturn::SuccessU64(data0) => {
                let (data0_msb, data0_lsb) = u64_to_be_u32s(data0);
                *a0 = SyscallReturnVariant::SuccessU64 as u32;
                *a1 = data0_lsb;
                *a2 = data0_msb;
            }
            SyscallReturn::SuccessU64U32(data0, data1) => {
                let (data0_msb, data0_lsb) = u64_to_be_u32s(data0);
                *a0 = SyscallReturnVariant::SuccessU64U32 as u32;
                *a1 = data0_lsb;
                *a2 = data0_msb;
                *a3 = data1;
            }
            SyscallReturn::SuccessAddr(addr) => {
                *a0 = SyscallReturnVariant::SuccessU32 as u32;
                *a1 = addr as u32;
            }
            SyscallReturn::SuccessPtr(ptr) => {
                *a0 = SyscallReturnVariant::SuccessU32 as u32;
                *a1 = ptr as usize as u32;
            }
            SyscallReturn::AllowReadWriteSuccess(ptr, len) => {
                *a0 = SyscallReturnVariant::SuccessU32U32 as u32;
                *a1 = ptr as usize as u32;
                *a2 = len as u32;
            }
            SyscallReturn::AllowReadWriteFailure(e, ptr, len) => {
                *a0 = SyscallReturnVariant::FailureU32U32 as u32;
                *a1 = err(e);
                *a2 = ptr as usize as u32;
                *a3 = len as u32;
            }
            SyscallReturn::AllowReadOnlySuccess(ptr, len) => {
                *a0 = SyscallReturnVariant::SuccessU32U32 as u32;
                *a1 = ptr as usize as u32;
                *a2 = len as u32;
            }
            SyscallReturn::AllowReadOnlyFailure(e, ptr, len) => {
                *a0 = SyscallReturnVariant::FailureU32U32 as u32;
                *a1 = err(e);
                *a2 = ptr as usize as u32;
                *a3 = len as u32;
            }
            SyscallReturn::SubscribeSuccess(ptr, data) => {
                *a0 = SyscallReturnVariant::SuccessU32U32 as u32;
                *a1 = ptr as usize as u32;
                *a2 = data as u32;
            }
            SyscallReturn::SubscribeFailure(e, ptr, data) => {
                *a0 = SyscallReturnVariant::FailureU32U32 as u32;
                *a1 = err(e);
                *a2 = ptr as usize as u32;
                *a3 = data as u32;
            }
        }
    }
}

/// Formats a system call for tracing, in the same shape the kernel prints
/// them with `trace_syscalls` enabled.
pub(crate) fn write_syscall(w: &mut dyn Write, syscall: &Syscall) -> core::fmt::Result {
    match *syscall {
        Syscall::Yield { which, address } => {
            write!(w, "yield({}, {:#x})", which, address as usize)
        }
        Syscall::Subscribe {
            driver_number,
            subdriver_number,
            upcall_ptr,
            appdata,
        } => write!(
            w,
            "subscribe({:#x}, {}, @{:#x}, {:#x})",
            driver_number, subdriver_number, upcall_ptr as usize, appdata
        ),
        Syscall::Command {
            driver_number,
            subdriver_number,
            arg0,
            arg1,
        } => write!(
            w,
            "cmd({:#x}, {}, {:#x}, {:#x})",
            driver_number, subdriver_number, arg0, arg1
        ),
        Syscall::ReadWriteAllow {
            driver_number,
            subdriver_number,
            allow_address,
            allow_size,
        } => write!(
            w,
            "read-write allow({:#x}, {}, @{:#x}, {:#x})",
            driver_number, subdriver_number, allow_address as usize, allow_size
        ),
        Syscall::ReadOnlyAllow {
            driver_number,
            subdriver_number,
            allow_address,
            allow_size,
        } => write!(
            w,
            "read-only allow({:#x}, {}, @{:#x}, {:#x})",
            driver_number, subdriver_number, allow_address as usize, allow_size
        ),
        Syscall::Memop { operand, arg0 } => write!(w, "memop({}, {:#x})", operand, arg0),
        Syscall::Exit {
            which,
            completion_code,
        } => write!(w, "exit({}, {})", which, completion_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_register_arguments() {
        assert_eq!(
            Syscall::from_register_arguments(2, 0x40001, 3, 7, 9),
            Some(Syscall::Command {
                driver_number: 0x40001,
                subdriver_number: 3,
                arg0: 7,
                arg1: 9,
            })
        );
        assert_eq!(
            Syscall::from_register_arguments(6, 1, 42, 0, 0),
            Some(Syscall::Exit {
                which: EXIT_RESTART,
                completion_code: 42,
            })
        );
        assert_eq!(Syscall::from_register_arguments(7, 0, 0, 0, 0), None);
    }

    #[test]
    fn class_numbers() {
        assert_eq!(SyscallClass::try_from(4), Ok(SyscallClass::ReadOnlyAllow));
        assert_eq!(SyscallClass::try_from(9), Err(9));
        let allow = Syscall::from_register_arguments(3, 1, 2, 0x2000, 16);
        assert_eq!(allow.map(|s| s.class()), Some(SyscallClass::ReadWriteAllow));
        assert_eq!(allow.and_then(|s| s.driver_number()), Some(1));
    }

    #[test]
    fn success_classification() {
        assert!(SyscallReturn::SubscribeSuccess(core::ptr::null(), 0).is_success());
        assert!(!SyscallReturn::AllowReadOnlyFailure(ErrorCode::INVAL, core::ptr::null(), 4)
            .is_success());
    }

    #[test]
    fn encode_allow_failure() {
        let (mut a0, mut a1, mut a2, mut a3) = (0, 0, 0, 0);
        SyscallReturn::AllowReadWriteFailure(ErrorCode::ALREADY, 0x2010 as *mut u8, 32)
            .encode_syscall_return(&mut a0, &mut a1, &mut a2, &mut a3);
        assert_eq!(
            (a0, a1, a2, a3),
            (
                SyscallReturnVariant::FailureU32U32 as u32,
                usize::from(ErrorCode::ALREADY) as u32,
                0x2010,
                32
            )
        );
    }
}
