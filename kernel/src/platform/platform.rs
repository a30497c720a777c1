// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interfaces a board provides to the core kernel.

use crate::syscall_driver::SyscallDriver;

/// Platform-specific mapping of syscall numbers to objects that implement the
/// `SyscallDriver` methods for that syscall.
///
/// The set of drivers is fixed when the board is built. Implementations are
/// normally a `match` over the driver numbers the board exposes:
///
/// ```ignore
/// impl SyscallDriverLookup for Board {
///     fn with_driver<F, R>(&self, driver_num: usize, f: F) -> R
///     where
///         F: FnOnce(Option<&dyn SyscallDriver>) -> R,
///     {
///         match driver_num {
///             capsules::console::DRIVER_NUM => f(Some(self.console)),
///             _ => f(None),
///         }
///     }
/// }
/// ```
pub trait SyscallDriverLookup {
    /// Call `f` with the driver registered for `driver_num`, or with `None`
    /// if the board has no such driver.
    fn with_driver<F, R>(&self, driver_num: usize, f: F) -> R
    where
        F: FnOnce(Option<&dyn SyscallDriver>) -> R;
}
