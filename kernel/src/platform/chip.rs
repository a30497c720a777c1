// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interfaces for implementing microcontrollers in Tock.

/// Interface for individual MCUs.
///
/// The trait defines chip-specific properties of Tock's operation. The core
/// kernel only needs one of them: a way to run a short section of code without
/// being interrupted.
pub trait Chip {
    /// Run a function in an atomic state w.r.t. to the current core. This
    /// means that interrupts are disabled so that an interrupt will not fire
    /// during the passed in function's execution.
    ///
    /// # Safety
    ///
    /// Interrupts are disabled for the whole of `f`, so it must be short and
    /// must not rely on interrupts being delivered.
    unsafe fn atomic<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}
