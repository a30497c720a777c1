// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Support for the `debug!` macro.
//!
//! `debug!` formats its arguments like `println!` and hands the resulting
//! line to a writer registered by the board:
//!
//! ```ignore
//! debug!("Yes the code gets here with value {}", i);
//! ```
//!
//! Boards register the writer once during setup with [`set_debug_writer`].
//! The writer is handed the formatted bytes synchronously and decides what to
//! do with them (buffer them for a UART, copy them into RAM, ...). Output
//! produced before a writer is registered, or that the writer does not
//! accept, is counted and discarded. Printing never blocks and never panics.

use core::fmt::{self, Write};
use core::ptr::{addr_of, addr_of_mut};

use crate::capabilities::SetDebugWriterCapability;

/// Sink for kernel debug output.
pub trait DebugWriter {
    /// Accept up to `buf.len()` bytes, returning how many were taken.
    fn write(&self, buf: &[u8]) -> usize;
}

struct DebugState {
    writer: Option<&'static dyn DebugWriter>,
    dropped_bytes: usize,
}

static mut DEBUG_STATE: DebugState = DebugState {
    writer: None,
    dropped_bytes: 0,
};

/// Register the board's debug writer.
///
/// # Safety
///
/// Must be called during board setup, before any code that may print runs
/// concurrently (e.g. before interrupts are enabled).
pub unsafe fn set_debug_writer(
    writer: &'static dyn DebugWriter,
    _capability: &dyn SetDebugWriterCapability,
) {
    (*addr_of_mut!(DEBUG_STATE)).writer = Some(writer);
}

/// Number of bytes of debug output that could not be written.
pub fn debug_dropped_bytes() -> usize {
    // Safety: the kernel is single threaded; this is a plain read of a
    // counter only ever updated from kernel context.
    unsafe { (*addr_of!(DEBUG_STATE)).dropped_bytes }
}

/// Adapter feeding `core::fmt` output into a [`DebugWriter`].
struct LineWriter<'a> {
    writer: &'a dyn DebugWriter,
    dropped: usize,
}

impl Write for LineWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let taken = self.writer.write(s.as_bytes());
        self.dropped += s.len().saturating_sub(taken);
        Ok(())
    }
}

/// Format `args` followed by a line ending into `writer`. Returns the number
/// of bytes the writer refused.
fn write_line(writer: &dyn DebugWriter, args: fmt::Arguments) -> usize {
    let mut line = LineWriter { writer, dropped: 0 };
    let _ = line.write_fmt(args);
    let _ = line.write_str("\r\n");
    line.dropped
}

/// Formatted output with a trailing newline. Used by the `debug!` macro.
pub fn debug_println(args: fmt::Arguments) {
    // Safety: see `debug_dropped_bytes`. The state is not borrowed while the
    // writer runs, so a writer may print itself.
    let writer = unsafe { (*addr_of!(DEBUG_STATE)).writer };
    let dropped = print_line(writer, args);
    unsafe { (*addr_of_mut!(DEBUG_STATE)).dropped_bytes += dropped };
}

/// Print a line to `writer`, or count it as dropped if there is none.
fn print_line(writer: Option<&dyn DebugWriter>, args: fmt::Arguments) -> usize {
    match writer {
        Some(writer) => write_line(writer, args),
        None => {
            let mut counter = ByteCounter(0);
            let _ = counter.write_fmt(args);
            counter.0 + 2
        }
    }
}

struct ByteCounter(usize);

impl Write for ByteCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

/// In-kernel `println()` debugging.
#[macro_export]
macro_rules! debug {
    () => ({
        // Allow an empty debug!() to print the location when hit
        $crate::debug!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_println(format_args!($msg));
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_println(format_args!($fmt, $($arg)+));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};

    extern crate std;
    use std::vec::Vec;

    struct Capture {
        limit: usize,
        bytes: RefCell<Vec<u8>>,
    }

    impl DebugWriter for Capture {
        fn write(&self, buf: &[u8]) -> usize {
            let mut bytes = self.bytes.borrow_mut();
            let room = self.limit.saturating_sub(bytes.len());
            let taken = core::cmp::min(room, buf.len());
            bytes.extend_from_slice(&buf[..taken]);
            taken
        }
    }

    #[test]
    fn line_is_terminated() {
        let capture = Capture {
            limit: 64,
            bytes: RefCell::new(Vec::new()),
        };
        let dropped = write_line(&capture, format_args!("grant {} at {:#x}", 3, 0x2000));
        assert_eq!(dropped, 0);
        assert_eq!(capture.bytes.borrow().as_slice(), b"grant 3 at 0x2000\r\n");
    }

    #[test]
    fn lines_without_a_writer_are_dropped() {
        assert_eq!(print_line(None, format_args!("pid {}", 12)), 8);
    }

    /// Writer that reports its first write by printing to itself.
    struct Echo {
        bytes: RefCell<Vec<u8>>,
        echoed: Cell<bool>,
        nested_drops: Cell<usize>,
    }

    impl DebugWriter for Echo {
        fn write(&self, buf: &[u8]) -> usize {
            self.bytes.borrow_mut().extend_from_slice(buf);
            if !self.echoed.replace(true) {
                let writer: &dyn DebugWriter = self;
                let dropped = print_line(Some(writer), format_args!("+{}", buf.len()));
                self.nested_drops.set(dropped);
            }
            buf.len()
        }
    }

    #[test]
    fn writer_may_print_itself() {
        let echo = Echo {
            bytes: RefCell::new(Vec::new()),
            echoed: Cell::new(false),
            nested_drops: Cell::new(0),
        };
        let writer: &dyn DebugWriter = &echo;
        assert_eq!(print_line(Some(writer), format_args!("abc")), 0);
        assert_eq!(echo.bytes.borrow().as_slice(), b"abc+3\r\n\r\n");
        assert_eq!(echo.nested_drops.get(), 0);
    }

    #[test]
    fn refused_bytes_are_counted() {
        let capture = Capture {
            limit: 4,
            bytes: RefCell::new(Vec::new()),
        };
        let dropped = write_line(&capture, format_args!("abcdef"));
        assert_eq!(capture.bytes.borrow().as_slice(), b"abcd");
        assert_eq!(dropped, 4);
    }
}
