// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Data structure for storing compile-time configuration options in the kernel.
//!
//! Configuration lives in a typed `const` object rather than in `#[cfg]`
//! blocks so that every code path is type-checked by the compiler, including
//! those that end up disabled. After type-checking the compiler folds the
//! constants, so a disabled `if config::CONFIG.trace_syscalls { .. }` block
//! costs nothing in the resulting binary.
//!
//! Boards toggle the booleans through the kernel crate's cargo features.

/// Data structure holding compile-time configuration options.
///
/// To change the configuration, enable the matching cargo feature of the
/// kernel crate from the board crate.
pub(crate) struct Config {
    /// Whether the kernel should trace syscalls to the debug output.
    ///
    /// If enabled, the kernel will print a message in the debug output for each
    /// system call and upcall, with details including the process ID, and
    /// system call or upcall parameters.
    pub(crate) trace_syscalls: bool,

    /// Whether the kernel should trace grant region activity.
    ///
    /// If enabled, every grant allocation is printed with its driver number,
    /// size and address, together with upcalls that were coalesced into an
    /// already pending upcall.
    pub(crate) trace_grant_allocation: bool,
}

/// A unique instance of `Config` where compile-time configuration options are
/// defined.
pub(crate) const CONFIG: Config = Config {
    trace_syscalls: cfg!(feature = "trace_syscalls"),
    trace_grant_allocation: cfg!(feature = "trace_grant_allocation"),
};
