// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Tock default Process implementation.
//!
//! `ProcessStandard` is an implementation for a userspace process running on
//! the Tock kernel. Its RAM is one contiguous block laid out as:
//!
//! ```text
//!     ╒════════ ← memory_start + memory_len
//!  ╔═ │ Grant Pointers
//!  ║  │ ──────
//!  ║  │ Upcall Queue
//!  ║  │ ──────        ← initial kernel_memory_break
//!  K  │ Grant
//!  E  │   ↓
//!  R  │ ──────        ← kernel_memory_break
//!  N  │
//!  E  │ (unused)
//!  L  │
//!  ║  │ ──────        ← app_break
//!  ║  │ Heap and stack
//!  ║  │ (process accessible)
//!  ╚═ ╘════════ ← memory_start
//! ```
//!
//! The grant region grows down from the top and only ever shrinks back when
//! the process restarts.

use core::cell::Cell;
use core::cmp;
use core::fmt::Write;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::slice;

use tock_cells::map_cell::MapCell;
use tock_cells::numeric_cell_ext::NumericCellExt;
use tock_cells::optional_cell::OptionalCell;

use crate::allow_registry::{AllowRegistry, AllowSlot};
use crate::capabilities;
use crate::collections::queue::Queue;
use crate::collections::ring_buffer::RingBuffer;
use crate::config;
use crate::errorcode::ErrorCode;
use crate::kernel::Kernel;
use crate::platform::chip::Chip;
use crate::process::{Error, FunctionCall, FunctionCallSource, Process, ProcessId};
use crate::process::{GrantAllocation, ProcessCustomGrantIdentifier, ProcessLoadError, State, Task};
use crate::processbuffer::{ReadOnlyProcessBuffer, ReadWriteProcessBuffer};
use crate::syscall::{self, Syscall, SyscallReturn};
use crate::upcall::UpcallId;

/// State for helping with debugging apps.
///
/// These pointers and counters are not strictly required for kernel operation,
/// but provide helpful information when an app crashes.
#[derive(Default)]
struct ProcessStandardDebug {
    /// How many syscalls have occurred since the process started.
    syscall_count: usize,

    /// What was the most recent syscall.
    last_syscall: Option<Syscall>,

    /// How many upcalls were dropped because the queue was insufficiently
    /// long.
    dropped_upcall_count: usize,
}

/// Entry that is stored in the grant pointer table at the top of process
/// memory.
///
/// One copy of this entry struct is stored per grant region defined in the
/// kernel. This type allows the core kernel to lookup a grant based on the
/// driver_num associated with the grant, and also holds the pointer to the
/// memory allocated for the particular grant.
#[repr(C)]
struct GrantPointerEntry {
    /// The syscall driver number associated with the allocated grant.
    ///
    /// This defaults to 0 if the grant has not been allocated. Note, however,
    /// that 0 is a valid driver_num, and therefore cannot be used to check if a
    /// grant is allocated or not.
    driver_num: usize,

    /// The start of the memory location where the grant has been allocated, or
    /// null if the grant has not been allocated.
    ///
    /// The lowest bit is set while the grant is entered.
    grant_ptr: *mut u8,
}

/// A type for userspace processes in Tock.
pub struct ProcessStandard<'a, C: 'static + Chip> {
    /// Identifier of this process and the index of the process in the process
    /// table.
    process_id: Cell<ProcessId>,

    /// Pointer to the main Kernel struct.
    kernel: &'static Kernel,

    /// Pointer to the struct that defines the actual chip the kernel is running
    /// on. This is used because processes have subtle hardware-based
    /// differences.
    chip: &'static C,

    /// Name of the app.
    process_name: &'static str,

    /// First byte of the RAM block belonging to this process.
    memory_start: *const u8,

    /// Number of bytes of memory allocated to this process.
    memory_len: usize,

    /// Application code this process executes from.
    flash: &'static [u8],

    /// Table keeping one pointer per grant defined in the kernel.
    grant_pointers: MapCell<&'static mut [GrantPointerEntry]>,

    /// Pointer to the end of the allocated (and MPU protected) grant region.
    kernel_memory_break: Cell<*const u8>,

    /// `kernel_memory_break` right after creation, restored on restart.
    initial_kernel_memory_break: *const u8,

    /// Pointer to the end of process RAM that has been sbrk'd to the process.
    app_break: Cell<*const u8>,

    /// Process RAM initially handed to the process, restored on restart.
    initial_app_ram: usize,

    /// Pointer to high water mark for process buffers shared through `allow`.
    allow_high_water_mark: Cell<*const u8>,

    /// Buffers currently shared with the kernel.
    allowed: &'a dyn AllowRegistry,

    /// Essentially a list of upcalls that want to call functions in the
    /// process.
    tasks: MapCell<RingBuffer<'a, Task>>,

    /// Address of the entry point in flash.
    init_fn: usize,

    /// Count of how many times this process has entered the fault condition
    /// and been restarted.
    restart_count: Cell<usize>,

    /// The completion code set by the process when it last exited, restarted,
    /// or was terminated.
    completion_code: OptionalCell<Option<u32>>,

    /// Tracks the current state of the process.
    state: Cell<State>,

    /// Return value of the last system call, handed back when the process
    /// resumes.
    stored_return: OptionalCell<SyscallReturn>,

    /// Function the process executes next when it resumes.
    pending_function: OptionalCell<FunctionCall>,

    /// Values kept so that we can print useful debug messages when apps fault.
    debug: MapCell<ProcessStandardDebug>,
}

impl<'a, C: 'static + Chip> ProcessStandard<'a, C> {
    /// Length of the upcall queue carved from the top of process memory.
    pub const TASK_QUEUE_LEN: usize = 10;

    /// Create a process over `memory`, executing `flash` from `init_fn`.
    ///
    /// The grant pointer table and task queue are placed at the top of
    /// `memory`, the process initially owns the bottom `initial_app_ram`
    /// bytes. The process must later be installed at `index` of the kernel's
    /// process table. Creating the first process finalizes the kernel's
    /// grants.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        kernel: &'static Kernel,
        chip: &'static C,
        process_name: &'static str,
        memory: &'static mut [u8],
        initial_app_ram: usize,
        flash: &'static [u8],
        init_fn: usize,
        allowed: &'a dyn AllowRegistry,
        index: usize,
    ) -> Result<ProcessStandard<'a, C>, ProcessLoadError> {
        let align = cmp::max(align_of::<GrantPointerEntry>(), align_of::<Task>());
        if memory.as_ptr() as usize % align != 0 || memory.len() % align != 0 {
            return Err(ProcessLoadError::MisalignedMemory);
        }

        let flash_start = flash.as_ptr() as usize;
        if init_fn < flash_start || init_fn >= flash_start + flash.len() {
            return Err(ProcessLoadError::InvalidEntryPoint);
        }

        let grant_ptrs_num = kernel.get_grant_count_and_finalize();
        let grant_ptrs_size = grant_ptrs_num * size_of::<GrantPointerEntry>();
        let tasks_size = Self::TASK_QUEUE_LEN * size_of::<Task>();
        let kernel_owned = grant_ptrs_size + tasks_size;

        let memory_len = memory.len();
        if kernel_owned > memory_len || initial_app_ram > memory_len - kernel_owned {
            return Err(ProcessLoadError::NotEnoughMemory);
        }

        let memory_start = memory.as_mut_ptr();

        // Safety: both tables lie at the top of `memory`, do not overlap, and
        // are aligned since `memory` and each table size are. Every element is
        // written before the slices are formed.
        let (grant_pointers, tasks) = unsafe {
            let grant_ptrs = memory_start
                .add(memory_len - grant_ptrs_size)
                .cast::<GrantPointerEntry>();
            for i in 0..grant_ptrs_num {
                ptr::write(
                    grant_ptrs.add(i),
                    GrantPointerEntry {
                        driver_num: 0,
                        grant_ptr: ptr::null_mut(),
                    },
                );
            }

            let task_ptr = memory_start.add(memory_len - kernel_owned).cast::<Task>();
            for i in 0..Self::TASK_QUEUE_LEN {
                ptr::write(
                    task_ptr.add(i),
                    Task::FunctionCall(FunctionCall {
                        source: FunctionCallSource::Kernel,
                        argument0: 0,
                        argument1: 0,
                        argument2: 0,
                        argument3: 0,
                        pc: 0,
                    }),
                );
            }

            (
                slice::from_raw_parts_mut(grant_ptrs, grant_ptrs_num),
                slice::from_raw_parts_mut(task_ptr, Self::TASK_QUEUE_LEN),
            )
        };

        let kernel_memory_break = memory_start.wrapping_add(memory_len - kernel_owned) as *const u8;
        let memory_start = memory_start as *const u8;
        let identifier = kernel.create_process_identifier();

        Ok(ProcessStandard {
            process_id: Cell::new(ProcessId::new(kernel, identifier, index)),
            kernel,
            chip,
            process_name,
            memory_start,
            memory_len,
            flash,
            grant_pointers: MapCell::new(grant_pointers),
            kernel_memory_break: Cell::new(kernel_memory_break),
            initial_kernel_memory_break: kernel_memory_break,
            app_break: Cell::new(memory_start.wrapping_add(initial_app_ram)),
            initial_app_ram,
            allow_high_water_mark: Cell::new(memory_start),
            allowed,
            tasks: MapCell::new(RingBuffer::new(tasks)),
            init_fn,
            restart_count: Cell::new(0),
            completion_code: OptionalCell::empty(),
            state: Cell::new(State::Unstarted),
            stored_return: OptionalCell::empty(),
            pending_function: OptionalCell::empty(),
            debug: MapCell::new(ProcessStandardDebug::default()),
        })
    }

    /// Checks if the buffer represented by the passed in base pointer and size
    /// is within the RAM bounds currently exposed to the processes (i.e. ending
    /// at `app_break`).
    fn in_app_owned_memory(&self, buf_start_addr: *const u8, size: usize) -> bool {
        let buf_start = buf_start_addr as usize;
        match buf_start.checked_add(size) {
            Some(buf_end) => {
                buf_end >= buf_start
                    && buf_start >= self.mem_start() as usize
                    && buf_end <= self.app_memory_break() as usize
            }
            None => false,
        }
    }

    /// Checks if the buffer represented by the passed in base pointer and size
    /// are within the readable region of an application's flash memory.
    fn in_app_flash_memory(&self, buf_start_addr: *const u8, size: usize) -> bool {
        let buf_start = buf_start_addr as usize;
        match buf_start.checked_add(size) {
            Some(buf_end) => {
                buf_start >= self.flash_start() as usize && buf_end <= self.flash_end() as usize
            }
            None => false,
        }
    }

    fn is_active(&self) -> bool {
        self.state.get().is_alive()
    }

    /// Reset all `grant_ptr`s to NULL.
    fn grant_ptrs_reset(&self) {
        self.grant_pointers.map(|grant_pointers| {
            for grant_entry in grant_pointers.iter_mut() {
                grant_entry.driver_num = 0;
                grant_entry.grant_ptr = ptr::null_mut();
            }
        });
    }

    /// Allocate memory in a process's grant region.
    ///
    /// Ensures that the allocation is of `size` bytes and aligned to `align`
    /// bytes, and at least to 2 bytes so the low bit of the address is free.
    /// Returns `None` if the allocation would collide with process accessible
    /// memory or wrap around.
    fn allocate_in_grant_region_internal(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let align = cmp::max(align, 2);
        if !align.is_power_of_two() {
            return None;
        }

        let kernel_break = self.kernel_memory_break.get() as usize;
        let new_break = kernel_break.checked_sub(size)? & !(align - 1);
        if new_break < self.app_break.get() as usize {
            return None;
        }

        let new_break_ptr = self
            .memory_start
            .wrapping_add(new_break - self.memory_start as usize);
        self.kernel_memory_break.set(new_break_ptr);
        NonNull::new(new_break_ptr.cast_mut())
    }

    /// Create the identifier for a custom grant that grant.rs uses to access
    /// the custom grant.
    ///
    /// The identifier is the distance from the top of process memory, which
    /// survives as long as the grant region is not reset.
    fn create_custom_grant_identifier(&self, ptr: NonNull<u8>) -> ProcessCustomGrantIdentifier {
        let custom_grant_address = ptr.as_ptr() as usize;
        let process_memory_end = self.mem_end() as usize;

        ProcessCustomGrantIdentifier {
            offset: process_memory_end - custom_grant_address,
        }
    }

    /// Use a `ProcessCustomGrantIdentifier` to find the address of the custom
    /// grant.
    fn get_custom_grant_address(&self, identifier: ProcessCustomGrantIdentifier) -> usize {
        let process_memory_end = self.mem_end() as usize;
        process_memory_end - identifier.offset
    }

    /// Queue the entry point of the process and make it runnable.
    fn launch(&self) {
        let flash_start = self.flash_start() as usize;
        let app_start = self.mem_start() as usize;
        let app_break = self.app_memory_break() as usize;
        let init_fn = FunctionCall {
            source: FunctionCallSource::Kernel,
            pc: self.init_fn,
            argument0: flash_start,
            argument1: app_start,
            argument2: self.memory_len,
            argument3: app_break,
        };
        self.tasks.map(|tasks| {
            tasks.enqueue(Task::FunctionCall(init_fn));
        });
        self.state.set(State::Yielded);
    }

    /// Give the process a fresh identity and a pristine memory layout, then
    /// queue its entry point.
    fn restart(&self) {
        let old_id = self.process_id.get();
        self.process_id.set(ProcessId::new(
            self.kernel,
            self.kernel.create_process_identifier(),
            old_id.index,
        ));

        self.debug.map(|debug| *debug = ProcessStandardDebug::default());
        self.kernel_memory_break
            .set(self.initial_kernel_memory_break);
        self.app_break
            .set(self.memory_start.wrapping_add(self.initial_app_ram));
        self.allow_high_water_mark.set(self.memory_start);
        self.restart_count.increment();

        self.launch();

        if config::CONFIG.trace_syscalls {
            debug!(
                "[{:?}] restarted as [{:?}]",
                old_id,
                self.process_id.get()
            );
        }
    }
}

impl<C: Chip> Process for ProcessStandard<'_, C> {
    fn processid(&self) -> ProcessId {
        self.process_id.get()
    }

    fn get_process_name(&self) -> &'static str {
        self.process_name
    }

    fn enqueue_task(&self, task: Task) -> Result<(), ErrorCode> {
        // If this app is in a `Fault` state then we shouldn't schedule
        // any work for it.
        if !self.is_active() {
            return Err(ErrorCode::NODEVICE);
        }

        let Task::FunctionCall(call) = task;
        let ret = self.tasks.map_or(Err(ErrorCode::FAIL), |tasks| {
            if let FunctionCallSource::Driver(upcall_id) = call.source {
                let merged = tasks.update_first_matching(|queued| match queued {
                    Task::FunctionCall(pending) if pending.source == call.source => {
                        *pending = call;
                        true
                    }
                    _ => false,
                });
                if merged {
                    if config::CONFIG.trace_grant_allocation {
                        debug!(
                            "[{:?}] coalesced upcall {:#x}:{}",
                            self.processid(),
                            upcall_id.driver_num,
                            upcall_id.subscribe_num
                        );
                    }
                    return Ok(());
                }
            }

            if tasks.enqueue(task) {
                Ok(())
            } else {
                Err(ErrorCode::NOMEM)
            }
        });

        if ret == Err(ErrorCode::NOMEM) {
            // The task could not be scheduled because the queue is full. We
            // record this in the debug information.
            self.debug.map(|debug| {
                debug.dropped_upcall_count += 1;
            });
        }

        ret
    }

    fn ready(&self) -> bool {
        self.has_tasks() || self.state.get() == State::Running
    }

    fn has_tasks(&self) -> bool {
        self.tasks.map_or(false, |tasks| tasks.has_elements())
    }

    fn dequeue_task(&self) -> Option<Task> {
        self.tasks.map_or(None, |tasks| tasks.dequeue())
    }

    fn pending_tasks(&self) -> usize {
        self.tasks.map_or(0, |tasks| tasks.len())
    }

    fn remove_pending_upcalls(&self, upcall_id: UpcallId) -> usize {
        let removed = self.tasks.map_or(0, |tasks| {
            let before = tasks.len();
            tasks.retain(|task| match task {
                // Remove only tasks that are function calls with an id equal
                // to `upcall_id`.
                Task::FunctionCall(function_call) => match function_call.source {
                    FunctionCallSource::Kernel => true,
                    FunctionCallSource::Driver(id) => id != upcall_id,
                },
            });
            before - tasks.len()
        });

        if config::CONFIG.trace_syscalls && removed > 0 {
            debug!(
                "[{:?}] remove_pending_upcalls[{:#x}:{}] = {} upcall(s) removed",
                self.processid(),
                upcall_id.driver_num,
                upcall_id.subscribe_num,
                removed,
            );
        }
        removed
    }

    fn get_state(&self) -> State {
        self.state.get()
    }

    fn is_running(&self) -> bool {
        self.is_active()
    }

    fn set_yielded_state(&self) {
        if self.state.get() == State::Running {
            self.state.set(State::Yielded);
        }
    }

    fn stop(&self) {
        match self.state.get() {
            State::Running => self.state.set(State::StoppedRunning),
            State::Yielded => self.state.set(State::StoppedYielded),
            _ => {} // Do nothing
        }
    }

    fn resume(&self) {
        match self.state.get() {
            State::StoppedRunning => self.state.set(State::Running),
            State::StoppedYielded => self.state.set(State::Yielded),
            _ => {} // Do nothing
        }
    }

    fn set_fault_state(&self) {
        // An app that already exited keeps its completion code.
        if self.state.get() == State::Terminated {
            return;
        }
        if config::CONFIG.trace_syscalls {
            debug!("[{:?}] faulted", self.processid());
        }
        self.terminate(None);
        self.state.set(State::Faulted);
    }

    fn start(&self, _capability: &dyn capabilities::ProcessManagementCapability) {
        if self.state.get() == State::Unstarted {
            self.launch();
        }
    }

    fn try_restart(&self, completion_code: Option<u32>) {
        self.terminate(completion_code);
        self.restart();
    }

    fn terminate(&self, completion_code: Option<u32>) {
        if matches!(self.state.get(), State::Terminated | State::Faulted) {
            return;
        }

        // Safety: the closure only updates bookkeeping of this process and
        // does not wait on interrupts.
        unsafe {
            self.chip.atomic(|| {
                // Remove the tasks that were scheduled for the app from the
                // amount of work queue.
                self.tasks.map(|tasks| tasks.empty());

                // Clear any grant regions this app has setup with any capsules.
                // Upcalls and allowed buffers live there, so they go too.
                self.grant_ptrs_reset();
                self.allowed.reset();

                self.stored_return.clear();
                self.pending_function.clear();
                self.completion_code.set(completion_code);
                self.state.set(State::Terminated);
            });
        }

        if config::CONFIG.trace_syscalls {
            debug!(
                "[{:?}] terminated with {:?}",
                self.processid(),
                completion_code
            );
        }
    }

    fn get_restart_count(&self) -> usize {
        self.restart_count.get()
    }

    fn get_completion_code(&self) -> Option<Option<u32>> {
        self.completion_code.get()
    }

    fn brk(&self, new_break: *const u8) -> Result<*const u8, Error> {
        if !self.is_active() {
            return Err(Error::InactiveApp);
        }

        if new_break < self.allow_high_water_mark.get() || new_break < self.mem_start() {
            Err(Error::AddressOutOfBounds)
        } else if new_break > self.kernel_memory_break() {
            Err(Error::OutOfMemory)
        } else {
            let old_break = self.app_break.get();
            let offset = new_break as usize - self.memory_start as usize;
            self.app_break.set(self.memory_start.wrapping_add(offset));
            Ok(old_break)
        }
    }

    fn sbrk(&self, increment: isize) -> Result<*const u8, Error> {
        let new_break = (self.app_memory_break() as usize).wrapping_add_signed(increment);
        self.brk(new_break as *const u8)
    }

    fn mem_start(&self) -> *const u8 {
        self.memory_start
    }

    fn mem_end(&self) -> *const u8 {
        self.memory_start.wrapping_add(self.memory_len)
    }

    fn kernel_memory_break(&self) -> *const u8 {
        self.kernel_memory_break.get()
    }

    fn app_memory_break(&self) -> *const u8 {
        self.app_break.get()
    }

    fn flash_start(&self) -> *const u8 {
        self.flash.as_ptr()
    }

    fn flash_end(&self) -> *const u8 {
        self.flash.as_ptr().wrapping_add(self.flash.len())
    }

    fn build_readwrite_process_buffer(
        &self,
        buf_start_addr: *mut u8,
        size: usize,
    ) -> Result<ReadWriteProcessBuffer, ErrorCode> {
        if !self.is_active() {
            // Do not operate on an inactive process
            return Err(ErrorCode::FAIL);
        }

        // A process is allowed to pass any pointer if the buffer length is 0,
        // as to revoke kernel access to a memory region without granting access
        // to another one
        if size == 0 {
            // Safety: we specify a zero-length buffer, so the implementation of
            // `ReadWriteProcessBuffer` will handle any safety issues.
            // Therefore, we can encapsulate the unsafe.
            Ok(unsafe { ReadWriteProcessBuffer::new(buf_start_addr, 0, self.processid()) })
        } else if self.in_app_owned_memory(buf_start_addr, size) {
            // Safety: the region lies in RAM owned by this process, and the
            // buffer checks that the process is alive before each access.
            Ok(unsafe { ReadWriteProcessBuffer::new(buf_start_addr, size, self.processid()) })
        } else {
            Err(ErrorCode::INVAL)
        }
    }

    fn build_readonly_process_buffer(
        &self,
        buf_start_addr: *const u8,
        size: usize,
    ) -> Result<ReadOnlyProcessBuffer, ErrorCode> {
        if !self.is_active() {
            // Do not operate on an inactive process
            return Err(ErrorCode::FAIL);
        }

        if size == 0 {
            // Safety: zero-length buffers are never dereferenced.
            Ok(unsafe { ReadOnlyProcessBuffer::new(buf_start_addr, 0, self.processid()) })
        } else if self.in_app_owned_memory(buf_start_addr, size)
            || self.in_app_flash_memory(buf_start_addr, size)
        {
            // Safety: the region lies in RAM or flash owned by this process,
            // and the buffer checks that the process is alive before each
            // access.
            Ok(unsafe { ReadOnlyProcessBuffer::new(buf_start_addr, size, self.processid()) })
        } else {
            Err(ErrorCode::INVAL)
        }
    }

    fn track_allow(&self, slot: AllowSlot, start: usize, len: usize) -> Result<(), Error> {
        if !self.is_active() {
            return Err(Error::InactiveApp);
        }

        self.allowed.register(slot, start, len)?;

        // Only RAM buffers constrain `brk`.
        let mem_start = self.memory_start as usize;
        if len > 0 && start >= mem_start && start < self.mem_end() as usize {
            let end = start + len;
            if end > self.allow_high_water_mark.get() as usize {
                self.allow_high_water_mark
                    .set(self.memory_start.wrapping_add(end - mem_start));
            }
        }
        Ok(())
    }

    fn allowed_buffer_count(&self) -> usize {
        self.allowed.live_count()
    }

    fn allocate_grant(
        &self,
        grant_num: usize,
        driver_num: usize,
        size: usize,
        align: usize,
    ) -> Result<GrantAllocation, Error> {
        // Do not modify an inactive process.
        if !self.is_active() {
            return Err(Error::InactiveApp);
        }

        let existing = self.grant_pointers.map_or(Err(Error::KernelError), |grant_pointers| {
            let entry = grant_pointers.get(grant_num).ok_or(Error::KernelError)?;
            if !entry.grant_ptr.is_null() {
                return Ok(true);
            }
            // A driver owns at most one grant.
            let taken = grant_pointers
                .iter()
                .any(|other| !other.grant_ptr.is_null() && other.driver_num == driver_num);
            if taken {
                Err(Error::KernelError)
            } else {
                Ok(false)
            }
        })?;

        if existing {
            return Ok(GrantAllocation::Existing);
        }

        let new_grant = self
            .allocate_in_grant_region_internal(size, align)
            .ok_or(Error::OutOfMemory)?;

        self.grant_pointers
            .map_or(Err(Error::KernelError), |grant_pointers| {
                // Bounds were checked above and the table never changes size.
                let entry = grant_pointers.get_mut(grant_num).ok_or(Error::KernelError)?;
                entry.driver_num = driver_num;
                entry.grant_ptr = new_grant.as_ptr();
                Ok(GrantAllocation::Fresh(new_grant))
            })
    }

    fn grant_is_allocated(&self, grant_num: usize) -> Option<bool> {
        // Update checks that the process is active.
        if !self.is_active() {
            return None;
        }

        self.grant_pointers.and_then(|grant_pointers| {
            grant_pointers
                .get(grant_num)
                .map(|grant_entry| !grant_entry.grant_ptr.is_null())
        })
    }

    fn allocate_custom_grant(
        &self,
        size: usize,
        align: usize,
    ) -> Option<(ProcessCustomGrantIdentifier, NonNull<u8>)> {
        // Do not modify an inactive process.
        if !self.is_active() {
            return None;
        }

        let ptr = self.allocate_in_grant_region_internal(size, align)?;
        let custom_grant_identifier = self.create_custom_grant_identifier(ptr);
        Some((custom_grant_identifier, ptr))
    }

    fn enter_grant(&self, grant_num: usize) -> Result<NonNull<u8>, Error> {
        // Do not try to access the grant region of an inactive process.
        if !self.is_active() {
            return Err(Error::InactiveApp);
        }

        // Safety: the closure only touches the grant pointer table and does
        // not wait on interrupts.
        unsafe {
            self.chip.atomic(|| {
                self.grant_pointers.map_or(Err(Error::KernelError), |grant_pointers| {
                    let grant_entry = grant_pointers
                        .get_mut(grant_num)
                        .ok_or(Error::AddressOutOfBounds)?;
                    let grant_ptr = grant_entry.grant_ptr;

                    if grant_ptr.is_null() {
                        // The grant has not been allocated.
                        Err(Error::NoGrant)
                    } else if (grant_ptr as usize) & 0x1 == 0x1 {
                        // Lowest bit is one, meaning this grant has been
                        // entered.
                        Err(Error::AlreadyEntered)
                    } else {
                        // Lowest bit is zero, so the grant is free. Mark it as
                        // entered by setting the lowest bit.
                        grant_entry.grant_ptr = grant_ptr.wrapping_add(1);
                        NonNull::new(grant_ptr).ok_or(Error::KernelError)
                    }
                })
            })
        }
    }

    fn enter_custom_grant(
        &self,
        identifier: ProcessCustomGrantIdentifier,
    ) -> Result<NonNull<u8>, Error> {
        // Do not try to access the grant region of an inactive process.
        if !self.is_active() {
            return Err(Error::InactiveApp);
        }

        let custom_grant_address = self.get_custom_grant_address(identifier);
        if custom_grant_address < self.kernel_memory_break() as usize
            || custom_grant_address >= self.mem_end() as usize
        {
            return Err(Error::AddressOutOfBounds);
        }

        let ptr = self
            .memory_start
            .wrapping_add(custom_grant_address - self.memory_start as usize);
        NonNull::new(ptr.cast_mut()).ok_or(Error::KernelError)
    }

    unsafe fn leave_grant(&self, grant_num: usize) {
        // Do not modify an inactive process.
        if !self.is_active() {
            return;
        }

        self.grant_pointers.map(|grant_pointers| {
            if let Some(grant_entry) = grant_pointers.get_mut(grant_num) {
                let grant_ptr = grant_entry.grant_ptr;
                if grant_ptr.is_null() {
                    // Reset while entered; nothing is left to leave.
                    return;
                }
                if (grant_ptr as usize) & 0x1 == 0 {
                    panic!("leaving grant {} which is not entered", grant_num);
                }
                // Clear the lowest bit to mark the grant as not entered.
                grant_entry.grant_ptr = grant_ptr.wrapping_sub(1);
            }
        });
    }

    fn grant_allocated_count(&self) -> Option<usize> {
        // Do not modify an inactive process.
        if !self.is_active() {
            return None;
        }

        self.grant_pointers.map(|grant_pointers| {
            // Filter our list of grant pointers into just the non-null ones,
            // and count those. A grant is allocated if its grant pointer is
            // non-null.
            grant_pointers
                .iter()
                .filter(|grant_entry| !grant_entry.grant_ptr.is_null())
                .count()
        })
    }

    fn lookup_grant_from_driver_num(&self, driver_num: usize) -> Result<usize, Error> {
        if !self.is_active() {
            return Err(Error::InactiveApp);
        }

        self.grant_pointers
            .map_or(Err(Error::KernelError), |grant_pointers| {
                // Filter our list of grant pointers into just the non null
                // ones, and count those. A grant is allocated if its grant
                // pointer is non-null.
                grant_pointers
                    .iter()
                    .position(|grant_entry| {
                        !grant_entry.grant_ptr.is_null() && grant_entry.driver_num == driver_num
                    })
                    .ok_or(Error::NoGrant)
            })
    }

    fn grant_region_size(&self) -> usize {
        self.mem_end() as usize - self.kernel_memory_break() as usize
    }

    fn is_valid_upcall_function_pointer(&self, upcall_fn: NonNull<()>) -> bool {
        let ptr = upcall_fn.as_ptr() as *const u8;
        let size = size_of::<*const u8>();

        // It is okay if this function is in flash.
        self.in_app_flash_memory(ptr, size)
    }

    fn set_syscall_return_value(&self, return_value: SyscallReturn) {
        if self.is_active() {
            self.stored_return.set(return_value);
        }
    }

    fn set_process_function(&self, callback: FunctionCall) {
        if !self.is_active() {
            return;
        }
        self.pending_function.set(callback);
        self.stored_return.clear();
        self.state.set(State::Running);
    }

    fn get_stored_syscall_return(&self) -> Option<SyscallReturn> {
        self.stored_return.get()
    }

    fn set_byte(&self, addr: *mut u8, value: u8) -> bool {
        if self.in_app_owned_memory(addr, 1) {
            // Safety: the byte lies in process accessible RAM, which the
            // kernel holds no references into.
            unsafe {
                let offset = addr as usize - self.memory_start as usize;
                self.memory_start.cast_mut().add(offset).write_volatile(value);
            }
            true
        } else {
            false
        }
    }

    fn debug_syscall_count(&self) -> usize {
        self.debug.map_or(0, |debug| debug.syscall_count)
    }

    fn debug_dropped_upcall_count(&self) -> usize {
        self.debug.map_or(0, |debug| debug.dropped_upcall_count)
    }

    fn debug_syscall_last(&self) -> Option<Syscall> {
        self.debug.map_or(None, |debug| debug.last_syscall)
    }

    fn debug_syscall_called(&self, last_syscall: Syscall) {
        self.debug.map(|debug| {
            debug.syscall_count += 1;
            debug.last_syscall = Some(last_syscall);
        });
    }
}

impl<C: Chip> ProcessStandard<'_, C> {
    /// Write a one line summary of the process memory and bookkeeping.
    pub fn print_summary(&self, writer: &mut dyn Write) -> core::fmt::Result {
        writeln!(
            writer,
            "{} [{:?}] {:?}: ram {:#x}..{:#x} app_break {:#x} kernel_break {:#x} \
             grants {} allows {} tasks {} restarts {} syscalls {}",
            self.process_name,
            self.processid(),
            self.state.get(),
            self.mem_start() as usize,
            self.mem_end() as usize,
            self.app_memory_break() as usize,
            self.kernel_memory_break() as usize,
            self.grant_allocated_count().unwrap_or(0),
            self.allowed_buffer_count(),
            self.pending_tasks(),
            self.restart_count.get(),
            self.debug_syscall_count(),
        )?;
        if let Some(last) = self.debug_syscall_last() {
            write!(writer, "  last syscall: ")?;
            syscall::write_syscall(writer, &last)?;
            writeln!(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allow_registry::AllowKind;
    use crate::test_util::{self, Counter, Env, TestChip};

    extern crate std;
    use std::string::String;

    fn driver_call(subscribe_num: usize, argument0: usize) -> Task {
        Task::FunctionCall(FunctionCall {
            source: FunctionCallSource::Driver(UpcallId {
                driver_num: test_util::COUNTER_DRIVER,
                subscribe_num,
            }),
            argument0,
            argument1: 0,
            argument2: 0,
            argument3: 0,
            pc: 0x40,
        })
    }

    fn try_create(
        env: &Env,
        memory: &'static mut [u8],
        initial_app_ram: usize,
        init_offset: usize,
    ) -> Result<(), ProcessLoadError> {
        let flash = test_util::leak_flash();
        ProcessStandard::create(
            env.kernel,
            env.chip,
            "bad",
            memory,
            initial_app_ram,
            flash,
            flash.as_ptr() as usize + init_offset,
            test_util::leak_registry(),
            0,
        )
        .map(|_| ())
    }

    fn counter_grant_num(env: &Env, index: usize) -> usize {
        let p = env.process(index);
        assert!(env
            .counter
            .grant
            .allocate_or_get(p.processid(), Counter::default)
            .is_ok());
        p.lookup_grant_from_driver_num(test_util::COUNTER_DRIVER)
            .unwrap()
    }

    #[test]
    fn kernel_memory_sits_at_the_top() {
        let env = test_util::env(1);
        let p = env.process(0);
        let table = 4 * size_of::<GrantPointerEntry>();
        let queue = ProcessStandard::<TestChip>::TASK_QUEUE_LEN * size_of::<Task>();

        assert_eq!(p.grant_region_size(), table + queue);
        assert_eq!(
            p.app_memory_break() as usize - p.mem_start() as usize,
            test_util::INITIAL_APP_RAM
        );
        assert_eq!(p.get_state(), State::Yielded);
        // The entry point is queued by `start`.
        assert_eq!(p.pending_tasks(), 1);
    }

    #[test]
    fn create_rejects_bad_layouts() {
        let env = test_util::env(0);

        let memory = test_util::leak_memory(256);
        assert_eq!(
            try_create(&env, &mut memory[1..], 0, 0),
            Err(ProcessLoadError::MisalignedMemory)
        );
        assert_eq!(
            try_create(&env, test_util::leak_memory(64), 0, 0),
            Err(ProcessLoadError::NotEnoughMemory)
        );
        assert_eq!(
            try_create(
                &env,
                test_util::leak_memory(test_util::MEMORY_SIZE),
                test_util::MEMORY_SIZE,
                0
            ),
            Err(ProcessLoadError::NotEnoughMemory)
        );
        assert_eq!(
            try_create(
                &env,
                test_util::leak_memory(test_util::MEMORY_SIZE),
                0,
                test_util::FLASH_SIZE
            ),
            Err(ProcessLoadError::InvalidEntryPoint)
        );
    }

    #[test]
    fn brk_stays_above_shared_buffers() {
        let env = test_util::env(1);
        let p = env.process(0);
        let start = p.mem_start() as usize;
        let slot = AllowSlot::new(test_util::COUNTER_DRIVER, 0, AllowKind::ReadWrite);

        assert_eq!(p.track_allow(slot, start + 256, 64), Ok(()));
        assert_eq!(
            p.brk(p.mem_start().wrapping_add(300)),
            Err(Error::AddressOutOfBounds)
        );
        assert_eq!(
            p.brk(p.mem_start().wrapping_add(320)).map(|old| old as usize),
            Ok(start + test_util::INITIAL_APP_RAM)
        );
        assert_eq!(
            p.brk(p.kernel_memory_break().wrapping_add(1)),
            Err(Error::OutOfMemory)
        );

        // Releasing the buffer does not lower the mark.
        assert_eq!(p.track_allow(slot, 0, 0), Ok(()));
        assert_eq!(
            p.brk(p.mem_start().wrapping_add(300)),
            Err(Error::AddressOutOfBounds)
        );
        assert_eq!(p.sbrk(16).map(|old| old as usize), Ok(start + 320));
        assert_eq!(p.app_memory_break() as usize, start + 336);
    }

    #[test]
    fn buffer_bounds() {
        let env = test_util::env(1);
        let p = env.process(0);
        let app_break = p.app_memory_break();

        assert!(p.build_readonly_process_buffer(p.flash_start(), 16).is_ok());
        assert_eq!(
            p.build_readwrite_process_buffer(p.flash_start().cast_mut(), 16)
                .err(),
            Some(ErrorCode::INVAL)
        );
        assert_eq!(
            p.build_readwrite_process_buffer(app_break.wrapping_sub(8).cast_mut(), 16)
                .err(),
            Some(ErrorCode::INVAL)
        );
        assert_eq!(
            p.build_readwrite_process_buffer(usize::MAX as *mut u8, 2)
                .err(),
            Some(ErrorCode::INVAL)
        );
        assert!(p
            .build_readwrite_process_buffer(ptr::null_mut(), 0)
            .is_ok());
    }

    #[test]
    fn upcalls_must_point_into_flash() {
        let env = test_util::env(1);
        let p = env.process(0);
        let in_flash = NonNull::new(env.flash(0, 8)).unwrap();
        let in_ram = NonNull::new(env.ram(0, 8).cast::<()>()).unwrap();

        assert!(p.is_valid_upcall_function_pointer(in_flash));
        assert!(!p.is_valid_upcall_function_pointer(in_ram));
    }

    #[test]
    fn driver_upcalls_coalesce() {
        let env = test_util::env(1);
        let p = env.process(0);
        let queued = p.pending_tasks();

        assert_eq!(p.enqueue_task(driver_call(0, 1)), Ok(()));
        assert_eq!(p.enqueue_task(driver_call(0, 2)), Ok(()));
        assert_eq!(p.enqueue_task(driver_call(1, 3)), Ok(()));
        assert_eq!(p.pending_tasks(), queued + 2);

        // The entry point first, then the latest arguments for upcall 0.
        assert!(matches!(
            p.dequeue_task(),
            Some(Task::FunctionCall(FunctionCall {
                source: FunctionCallSource::Kernel,
                ..
            }))
        ));
        assert_eq!(p.dequeue_task(), Some(driver_call(0, 2)));
        assert_eq!(p.dequeue_task(), Some(driver_call(1, 3)));
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let env = test_util::env(1);
        let p = env.process(0);
        let room = ProcessStandard::<TestChip>::TASK_QUEUE_LEN - p.pending_tasks();

        for subscribe_num in 0..room {
            assert_eq!(p.enqueue_task(driver_call(subscribe_num, 0)), Ok(()));
        }
        assert_eq!(
            p.enqueue_task(driver_call(room, 0)),
            Err(ErrorCode::NOMEM)
        );
        // Still merges into a queued upcall.
        assert_eq!(p.enqueue_task(driver_call(0, 9)), Ok(()));
        assert_eq!(p.debug_dropped_upcall_count(), 1);
    }

    #[test]
    fn remove_pending_upcalls_keeps_others() {
        let env = test_util::env(1);
        let p = env.process(0);
        let queued = p.pending_tasks();
        assert_eq!(p.enqueue_task(driver_call(0, 1)), Ok(()));
        assert_eq!(p.enqueue_task(driver_call(1, 1)), Ok(()));

        let removed = p.remove_pending_upcalls(UpcallId {
            driver_num: test_util::COUNTER_DRIVER,
            subscribe_num: 0,
        });
        assert_eq!(removed, 1);
        assert_eq!(p.pending_tasks(), queued + 1);
    }

    #[test]
    fn entered_bit_is_set_atomically() {
        let env = test_util::env(1);
        let p = env.process(0);
        let grant_num = counter_grant_num(&env, 0);
        let sections = env.chip.atomic_sections.get();

        let base = p.enter_grant(grant_num).unwrap();
        assert_eq!(p.enter_grant(grant_num), Err(Error::AlreadyEntered));
        assert_eq!(env.chip.atomic_sections.get(), sections + 2);

        unsafe { p.leave_grant(grant_num) };
        assert_eq!(p.enter_grant(grant_num), Ok(base));
        unsafe { p.leave_grant(grant_num) };
        assert_eq!(base.as_ptr() as usize & 0x1, 0);
    }

    #[test]
    fn enter_unknown_grants() {
        let env = test_util::env(1);
        let p = env.process(0);
        assert_eq!(p.enter_grant(0), Err(Error::NoGrant));
        assert_eq!(p.enter_grant(64), Err(Error::AddressOutOfBounds));
        assert_eq!(
            p.lookup_grant_from_driver_num(test_util::COUNTER_DRIVER),
            Err(Error::NoGrant)
        );
    }

    #[test]
    #[should_panic(expected = "which is not entered")]
    fn leaving_a_grant_twice_panics() {
        let env = test_util::env(1);
        let p = env.process(0);
        let grant_num = counter_grant_num(&env, 0);
        unsafe { p.leave_grant(grant_num) };
    }

    #[test]
    fn custom_grants_are_bounded() {
        let env = test_util::env(1);
        let p = env.process(0);
        let (identifier, ptr) = p.allocate_custom_grant(16, 8).unwrap();

        assert_eq!(p.enter_custom_grant(identifier), Ok(ptr));
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        assert_eq!(
            p.enter_custom_grant(ProcessCustomGrantIdentifier {
                offset: test_util::MEMORY_SIZE
            }),
            Err(Error::AddressOutOfBounds)
        );
        assert!(p.allocate_custom_grant(test_util::MEMORY_SIZE, 8).is_none());
    }

    #[test]
    fn terminate_releases_everything_once() {
        let env = test_util::env(1);
        let p = env.process(0);
        let grant_num = counter_grant_num(&env, 0);
        let slot = AllowSlot::new(test_util::COUNTER_DRIVER, 0, AllowKind::ReadOnly);
        assert_eq!(p.track_allow(slot, p.mem_start() as usize, 8), Ok(()));

        p.terminate(Some(3));
        assert_eq!(p.get_state(), State::Terminated);
        assert_eq!(p.grant_is_allocated(grant_num), None);
        assert_eq!(p.enter_grant(grant_num), Err(Error::InactiveApp));
        assert_eq!(p.allowed_buffer_count(), 0);
        assert_eq!(p.pending_tasks(), 0);
        assert_eq!(p.enqueue_task(driver_call(0, 0)), Err(ErrorCode::NODEVICE));
        assert_eq!(p.get_completion_code(), Some(Some(3)));

        p.terminate(Some(4));
        assert_eq!(p.get_completion_code(), Some(Some(3)));
    }

    #[test]
    fn restart_gives_a_new_identity() {
        let env = test_util::env(1);
        let p = env.process(0);
        let old = p.processid();
        let initial_size = p.grant_region_size();
        counter_grant_num(&env, 0);
        assert!(p.grant_region_size() > initial_size);

        p.try_restart(None);
        assert_ne!(p.processid(), old);
        assert_eq!(p.get_restart_count(), 1);
        assert!(env.kernel.get_process(old).is_none());
        assert!(env.kernel.get_process(p.processid()).is_some());
        assert_eq!(p.grant_region_size(), initial_size);
        assert_eq!(p.grant_allocated_count(), Some(0));
        assert_eq!(p.get_state(), State::Yielded);
        assert_eq!(p.pending_tasks(), 1);
    }

    #[test]
    fn fault_stops_the_process() {
        let env = test_util::env(1);
        let p = env.process(0);
        p.set_fault_state();
        assert_eq!(p.get_state(), State::Faulted);
        assert_eq!(p.get_completion_code(), Some(None));
        assert!(!p.ready());
        // A faulted process has nothing left to terminate.
        p.terminate(Some(1));
        assert_eq!(p.get_state(), State::Faulted);
    }

    #[test]
    fn fault_leaves_an_exited_process_alone() {
        let env = test_util::env(1);
        let p = env.process(0);
        p.terminate(Some(3));
        p.set_fault_state();
        assert_eq!(p.get_state(), State::Terminated);
        assert_eq!(p.get_completion_code(), Some(Some(3)));
    }

    #[test]
    fn stop_and_resume() {
        let env = test_util::env(1);
        let p = env.process(0);
        p.stop();
        assert_eq!(p.get_state(), State::StoppedYielded);
        assert!(p.is_running());
        p.resume();
        assert_eq!(p.get_state(), State::Yielded);
    }

    #[test]
    fn summary_names_the_process() {
        let env = test_util::env(1);
        let p = env.process(0);
        p.debug_syscall_called(Syscall::Memop {
            operand: 2,
            arg0: 0,
        });

        let mut out = String::new();
        assert!(p.print_summary(&mut out).is_ok());
        assert!(out.starts_with("test ["));
        assert!(out.contains("Yielded"));
        assert!(out.contains("syscalls 1"));
        assert!(out.contains("memop(2, 0x0)"));
    }
}
