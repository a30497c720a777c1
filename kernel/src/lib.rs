// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Core Tock Kernel
//!
//! This crate holds the part of the kernel that lets untrusted capsules keep
//! per-process state without a heap or an MMU:
//!
//! - [`grant`]: typed per-process storage carved from the top of each
//!   process's RAM, with exclusive entry.
//! - [`processbuffer`] and [`allow_registry`]: buffers processes share with
//!   the kernel, with overlap checking between live buffers.
//! - [`upcall`]: upcalls stored in grants and scheduled through opaque
//!   handles.
//! - [`kernel`]: the process table and the system call dispatcher.
//!
//! Most `unsafe` code is in this kernel crate.

#![warn(unreachable_pub)]
#![no_std]

pub mod allow_registry;
pub mod capabilities;
pub mod collections;
#[macro_use]
pub mod debug;
pub mod errorcode;
pub mod grant;
pub mod kernel;
pub mod platform;
pub mod process;
pub mod process_standard;
pub mod processbuffer;
pub mod syscall;
pub mod syscall_driver;
pub mod upcall;

mod config;

#[cfg(test)]
mod test_util;

// Core resources exposed as `kernel::Type`.
pub use crate::errorcode::ErrorCode;
pub use crate::kernel::{Kernel, ProcessSlot};
pub use crate::process::ProcessId;
