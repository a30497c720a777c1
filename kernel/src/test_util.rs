// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Host-side board for unit tests: a kernel with a few simulated processes
//! and sample drivers using grants, allowed buffers and upcalls.

extern crate std;

use core::cell::Cell;
use core::mem::size_of;
use core::slice;

use std::boxed::Box;
use std::vec::Vec;

use crate::allow_registry::FlatAllowRegistry;
use crate::capabilities::{MainLoopCapability, MemoryAllocationCapability};
use crate::capabilities::ProcessManagementCapability;
use crate::errorcode::ErrorCode;
use crate::grant::{AllowRoCount, AllowRwCount, Grant, UpcallCount};
use crate::kernel::{Kernel, ProcessSlot};
use crate::platform::chip::Chip;
use crate::platform::platform::SyscallDriverLookup;
use crate::process::{self, Process, ProcessId};
use crate::process_standard::ProcessStandard;
use crate::processbuffer::{ReadableProcessBuffer, WriteableProcessBuffer};
use crate::syscall::{Syscall, SyscallReturn};
use crate::syscall_driver::{CommandReturn, SyscallDriver};

pub(crate) const COUNTER_DRIVER: usize = 0x10;
pub(crate) const SECOND_DRIVER: usize = 0x11;
pub(crate) const LARGE_DRIVER: usize = 0x20;
pub(crate) const LAZY_DRIVER: usize = 0x30;
pub(crate) const NO_DRIVER: usize = 0x99;

pub(crate) const MEMORY_SIZE: usize = 2048;
pub(crate) const INITIAL_APP_RAM: usize = 512;
pub(crate) const FLASH_SIZE: usize = 256;
/// Larger than a whole process.
pub(crate) const LARGE_GRANT: usize = 2 * MEMORY_SIZE;
pub(crate) const ALLOW_SLOTS: usize = 4;
const MAX_PROCESSES: usize = 4;

/// Chip whose atomic sections only count themselves.
#[derive(Default)]
pub(crate) struct TestChip {
    pub(crate) atomic_sections: Cell<usize>,
}

impl Chip for TestChip {
    unsafe fn atomic<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.atomic_sections.set(self.atomic_sections.get() + 1);
        f()
    }
}

#[derive(Default)]
pub(crate) struct Counter {
    pub(crate) value: usize,
}

pub(crate) type CounterGrant = Grant<Counter, UpcallCount<2>, AllowRoCount<2>, AllowRwCount<3>>;

/// Driver keeping a counter per process.
///
/// - command 1: add `r2` to the counter and schedule upcall 0 with the new
///   value.
/// - command 2: copy the read-only buffer 0 into read-write buffer 0 and
///   return the number of bytes copied.
/// - command 3: return the counter.
pub(crate) struct CounterDriver {
    pub(crate) grant: CounterGrant,
}

impl SyscallDriver for CounterDriver {
    fn command(
        &self,
        command_num: usize,
        r2: usize,
        _r3: usize,
        processid: ProcessId,
    ) -> CommandReturn {
        match command_num {
            0 => CommandReturn::success(),
            1 => self
                .grant
                .enter(processid, |counter, kernel_data| {
                    counter.value += r2;
                    match kernel_data.schedule_upcall(0, (counter.value, 0, 0)) {
                        Ok(()) => CommandReturn::success_u32(counter.value as u32),
                        Err(_) => CommandReturn::failure(ErrorCode::FAIL),
                    }
                })
                .unwrap_or_else(CommandReturn::from),
            2 => self
                .grant
                .enter(processid, |_, kernel_data| {
                    let src = kernel_data.get_readonly_processbuffer(0)?;
                    let dst = kernel_data.get_readwrite_processbuffer(0)?;
                    src.enter(|src| {
                        dst.mut_enter(|dst| {
                            let mut copied = 0;
                            for (d, s) in dst.iter().zip(src.iter()) {
                                d.set(s.get());
                                copied += 1;
                            }
                            copied
                        })
                    })?
                })
                .and_then(|copied| copied)
                .map_or_else(CommandReturn::from, |copied: usize| {
                    CommandReturn::success_u32(copied as u32)
                }),
            3 => self
                .grant
                .enter(processid, |counter, _| CommandReturn::success_u32(counter.value as u32))
                .unwrap_or_else(CommandReturn::from),
            _ => CommandReturn::failure(ErrorCode::NOSUPPORT),
        }
    }

    fn allocate_grant(&self, processid: ProcessId) -> Result<(), process::Error> {
        self.grant
            .allocate_or_get(processid, Counter::default)
            .map(|_| ())
    }
}

pub(crate) type LargeGrant = Grant<[u8; LARGE_GRANT], UpcallCount<1>, AllowRoCount<0>, AllowRwCount<0>>;

/// Driver whose grant never fits in a process.
pub(crate) struct LargeDriver {
    pub(crate) grant: LargeGrant,
}

impl SyscallDriver for LargeDriver {
    fn allocate_grant(&self, processid: ProcessId) -> Result<(), process::Error> {
        self.grant
            .allocate_or_get(processid, || [0; LARGE_GRANT])
            .map(|_| ())
    }
}

pub(crate) type LazyGrant = Grant<Counter, UpcallCount<1>, AllowRoCount<0>, AllowRwCount<0>>;

/// Driver that reports success for `allocate_grant` without allocating.
pub(crate) struct LazyDriver {
    pub(crate) grant: LazyGrant,
}

impl SyscallDriver for LazyDriver {
    fn allocate_grant(&self, _processid: ProcessId) -> Result<(), process::Error> {
        Ok(())
    }
}

/// Board mapping driver numbers to the test drivers.
#[derive(Clone, Copy)]
pub(crate) struct TestDrivers {
    counter: &'static CounterDriver,
    second: &'static CounterDriver,
    large: &'static LargeDriver,
    lazy: &'static LazyDriver,
}

impl SyscallDriverLookup for TestDrivers {
    fn with_driver<F, R>(&self, driver_num: usize, f: F) -> R
    where
        F: FnOnce(Option<&dyn SyscallDriver>) -> R,
    {
        match driver_num {
            COUNTER_DRIVER => f(Some(self.counter)),
            SECOND_DRIVER => f(Some(self.second)),
            LARGE_DRIVER => f(Some(self.large)),
            LAZY_DRIVER => f(Some(self.lazy)),
            _ => f(None),
        }
    }
}

/// Holds every capability the tests need.
pub(crate) struct TestCapability;
unsafe impl ProcessManagementCapability for TestCapability {}
unsafe impl MainLoopCapability for TestCapability {}
unsafe impl MemoryAllocationCapability for TestCapability {}

pub(crate) struct Env {
    pub(crate) kernel: &'static Kernel,
    pub(crate) chip: &'static TestChip,
    pub(crate) counter: &'static CounterDriver,
    pub(crate) second: &'static CounterDriver,
    pub(crate) large: &'static LargeDriver,
    pub(crate) lazy: &'static LazyDriver,
    processes: Vec<&'static ProcessStandard<'static, TestChip>>,
}

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Word aligned, zeroed process RAM.
pub(crate) fn leak_memory(len: usize) -> &'static mut [u8] {
    let words: &'static mut [usize] =
        Box::leak(std::vec![0usize; len / size_of::<usize>()].into_boxed_slice());
    // Safety: the words are initialized and exclusively owned, and every byte
    // pattern is a valid `u8`.
    unsafe { slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) }
}

pub(crate) fn leak_flash() -> &'static [u8] {
    Box::leak(std::vec![0u8; FLASH_SIZE].into_boxed_slice())
}

pub(crate) fn leak_registry() -> &'static FlatAllowRegistry<ALLOW_SLOTS> {
    leak(FlatAllowRegistry::new())
}

/// Build a kernel with `num_processes` started processes.
///
/// All grants are created first, since creating the first process finalizes
/// them.
pub(crate) fn env(num_processes: usize) -> Env {
    let cap = TestCapability;
    let slots: &'static [ProcessSlot] = Box::leak(
        (0..MAX_PROCESSES)
            .map(|_| ProcessSlot::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    let kernel: &'static Kernel = leak(Kernel::new(slots));
    let chip: &'static TestChip = leak(TestChip::default());

    let counter = leak(CounterDriver {
        grant: kernel.create_grant(COUNTER_DRIVER, &cap),
    });
    let second = leak(CounterDriver {
        grant: kernel.create_grant(SECOND_DRIVER, &cap),
    });
    let large = leak(LargeDriver {
        grant: kernel.create_grant(LARGE_DRIVER, &cap),
    });
    let lazy = leak(LazyDriver {
        grant: kernel.create_grant(LAZY_DRIVER, &cap),
    });

    let mut processes = Vec::new();
    for index in 0..num_processes {
        let flash = leak_flash();
        let allowed = leak_registry();
        let process = ProcessStandard::create(
            kernel,
            chip,
            "test",
            leak_memory(MEMORY_SIZE),
            INITIAL_APP_RAM,
            flash,
            flash.as_ptr() as usize,
            allowed,
            index,
        );
        let process: &'static ProcessStandard<'static, TestChip> = match process {
            Ok(process) => leak(process),
            Err(err) => panic!("cannot create test process: {:?}", err),
        };
        assert_eq!(kernel.install_process(process, &cap), Ok(()));
        process.start(&cap);
        processes.push(process);
    }

    Env {
        kernel,
        chip,
        counter,
        second,
        large,
        lazy,
        processes,
    }
}

impl Env {
    pub(crate) fn process(&self, index: usize) -> &'static ProcessStandard<'static, TestChip> {
        self.processes[index]
    }

    pub(crate) fn drivers(&self) -> TestDrivers {
        TestDrivers {
            counter: self.counter,
            second: self.second,
            large: self.large,
            lazy: self.lazy,
        }
    }

    /// Run `syscall` for process `index` and return what it stored.
    pub(crate) fn syscall(&self, index: usize, syscall: Syscall) -> Option<SyscallReturn> {
        let process = self.process(index);
        self.kernel
            .handle_syscall(&self.drivers(), process, syscall, &TestCapability);
        process.get_stored_syscall_return()
    }

    /// Deliver the next upcall of process `index`, if it is waiting for one.
    pub(crate) fn deliver(&self, index: usize) -> Option<process::FunctionCall> {
        let process = self.process(index);
        let delivered = self.kernel.deliver_upcall(process, &TestCapability);
        // Back to waiting, as if the upcall returned into `yield`.
        process.set_yielded_state();
        delivered
    }

    pub(crate) fn terminate(&self, index: usize, completion_code: Option<u32>) {
        let pid = self.process(index).processid();
        assert_eq!(
            self.kernel.terminate_process(pid, completion_code, &TestCapability),
            Ok(())
        );
    }

    pub(crate) fn restart(&self, index: usize) -> ProcessId {
        let pid = self.process(index).processid();
        match self.kernel.restart_process(pid, None, &TestCapability) {
            Ok(new_pid) => new_pid,
            Err(err) => panic!("restart failed: {:?}", err),
        }
    }

    /// Address `offset` bytes into the process RAM.
    pub(crate) fn ram(&self, index: usize, offset: usize) -> *mut u8 {
        self.process(index).mem_start().wrapping_add(offset).cast_mut()
    }

    /// Address `offset` bytes into the process flash.
    pub(crate) fn flash(&self, index: usize, offset: usize) -> *mut () {
        self.process(index)
            .flash_start()
            .wrapping_add(offset)
            .cast_mut()
            .cast::<()>()
    }

    pub(crate) fn capability(&self) -> &'static TestCapability {
        &TestCapability
    }
}

/// `allow` for process memory at `offset` of `len` bytes.
pub(crate) fn rw_allow(driver: usize, allow_num: usize, address: *mut u8, len: usize) -> Syscall {
    Syscall::ReadWriteAllow {
        driver_number: driver,
        subdriver_number: allow_num,
        allow_address: address,
        allow_size: len,
    }
}

pub(crate) fn ro_allow(driver: usize, allow_num: usize, address: *const u8, len: usize) -> Syscall {
    Syscall::ReadOnlyAllow {
        driver_number: driver,
        subdriver_number: allow_num,
        allow_address: address,
        allow_size: len,
    }
}

pub(crate) fn subscribe(driver: usize, subscribe_num: usize, upcall: *mut (), appdata: usize) -> Syscall {
    Syscall::Subscribe {
        driver_number: driver,
        subdriver_number: subscribe_num,
        upcall_ptr: upcall,
        appdata,
    }
}

pub(crate) fn command(driver: usize, command_num: usize, arg0: usize) -> Syscall {
    Syscall::Command {
        driver_number: driver,
        subdriver_number: command_num,
        arg0,
        arg1: 0,
    }
}
