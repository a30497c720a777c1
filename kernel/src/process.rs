// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Types for Tock-compatible processes.

use core::fmt;
use core::ptr::NonNull;

use crate::allow_registry::AllowSlot;
use crate::capabilities;
use crate::errorcode::ErrorCode;
use crate::kernel::Kernel;
use crate::processbuffer::{ReadOnlyProcessBuffer, ReadWriteProcessBuffer};
use crate::syscall::{Syscall, SyscallReturn};
use crate::upcall::UpcallId;

pub use crate::process_standard::ProcessStandard;

/// Userspace process identifier.
///
/// This should be treated as an opaque type that can be used to represent a
/// process on the board without requiring an actual reference to a `Process`
/// object. Capsules keep `ProcessId`s in their grant regions and timers to
/// know which application to notify later.
///
/// Since `ProcessId` implements `Copy`, having a `ProcessId` does _not_ ensure
/// that the process it refers to is still valid. The process may have been
/// terminated, or restarted as a new process. All uses of `ProcessId` in the
/// kernel therefore look the process up with `Kernel::get_process`, which
/// returns `None` once the identifier no longer matches the slot.
///
/// Outside of the kernel crate, holders of a `ProcessId` may use `.id()` to
/// retrieve a simple number for the process, for example to send it over the
/// syscall interface. This does not check that the application still exists.
#[derive(Clone, Copy)]
pub struct ProcessId {
    /// Reference to the main kernel struct, needed to check that the index is
    /// still valid.
    pub(crate) kernel: &'static Kernel,

    /// The index in the kernel's process slot array where this app's state is
    /// stored.
    pub(crate) index: usize,

    /// The unique identifier for this process.
    ///
    /// The combination of (index, identifier) is used to check if the app this
    /// `ProcessId` refers to is still valid. If the identifier stored in the
    /// process at the given index does not match the value saved here, then the
    /// process ended or restarted and this `ProcessId` is stale.
    identifier: usize,
}

impl PartialEq for ProcessId {
    fn eq(&self, other: &ProcessId) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for ProcessId {}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.identifier)
    }
}

impl ProcessId {
    /// Create a new `ProcessId` object based on the app identifier and its
    /// index in the processes array.
    pub(crate) fn new(kernel: &'static Kernel, identifier: usize, index: usize) -> ProcessId {
        ProcessId {
            kernel,
            identifier,
            index,
        }
    }

    /// Create a new `ProcessId` object from outside of the kernel crate.
    ///
    /// This is needed by `Process` implementations that live outside of the
    /// kernel crate and must hand out their own identifiers.
    pub fn new_external(
        kernel: &'static Kernel,
        identifier: usize,
        index: usize,
        _capability: &dyn capabilities::ExternalProcessCapability,
    ) -> ProcessId {
        ProcessId::new(kernel, identifier, index)
    }

    /// Get a `usize` unique identifier for the app this `ProcessId` refers to.
    ///
    /// This function should not be used by the kernel to look up processes;
    /// use `Kernel::get_process` for that. It is meant for capsules that need an unique
    /// number, for example to report it to an application.
    pub fn id(&self) -> usize {
        self.identifier
    }
}

/// Outcome of asking a process to allocate a grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantAllocation {
    /// The grant region was freshly carved out. The pointer refers to
    /// uninitialized memory of the requested size, and the owner must
    /// initialize it before the grant is entered.
    Fresh(NonNull<u8>),
    /// The grant for this number already exists. Nothing was allocated.
    Existing,
}

/// Opaque identifier for custom grants allocated dynamically from a process's
/// grant region.
///
/// This type allows Process to provide a handle to a custom grant within a
/// process's memory that `ProcessGrant` can use to access the custom grant
/// memory later.
///
/// The identifier is only meaningful to the `Process` that created it;
/// other implementations are free to interpret the offset differently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessCustomGrantIdentifier {
    pub(crate) offset: usize,
}

/// Errors that can occur when creating a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessLoadError {
    /// The memory handed to the process is too small to hold its grant
    /// pointer table and task queue.
    NotEnoughMemory,
    /// The memory handed to the process is not word aligned.
    MisalignedMemory,
    /// The initial function is not within the process's flash.
    InvalidEntryPoint,
}

impl fmt::Display for ProcessLoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessLoadError::NotEnoughMemory => write!(f, "Not able to provide RAM requested"),
            ProcessLoadError::MisalignedMemory => write!(f, "Process RAM is not word aligned"),
            ProcessLoadError::InvalidEntryPoint => write!(f, "Entry point outside of flash"),
        }
    }
}

/// This trait represents a generic process that the Tock scheduler can
/// schedule.
pub trait Process {
    /// Returns the process's identifier.
    fn processid(&self) -> ProcessId;

    /// Returns the name this process was created with.
    fn get_process_name(&self) -> &'static str;

    /// Queue a `Task` for the process. This will be added to a per-process
    /// buffer and executed by the scheduler. `Task`s are some function the
    /// process should run, for example an upcall to run after a capsule
    /// completed an operation.
    ///
    /// A `Task::FunctionCall` coming from a driver replaces an already pending
    /// task with the same `UpcallId`, so the process only ever sees the latest
    /// arguments for a given upcall.
    ///
    /// This function returns:
    /// - `Ok(())` if the `Task` was queued (or merged into a pending one).
    /// - `Err(ErrorCode::NODEVICE)` if the process is not alive, as no new
    ///   tasks may be scheduled for an inactive process.
    /// - `Err(ErrorCode::NOMEM)` if the task queue for the process is full.
    fn enqueue_task(&self, task: Task) -> Result<(), ErrorCode>;

    /// Returns whether this process is ready to execute.
    fn ready(&self) -> bool;

    /// Return if there are any Tasks (upcalls) queued for this process.
    fn has_tasks(&self) -> bool;

    /// Remove the scheduled operation from the front of the queue and return it
    /// to be handled by the scheduler.
    ///
    /// If there are no `Task`s in the queue for this process this will return
    /// `None`.
    fn dequeue_task(&self) -> Option<Task>;

    /// Returns the number of pending tasks.
    fn pending_tasks(&self) -> usize;

    /// Remove all scheduled upcalls for a given upcall id from the task queue,
    /// returning how many were removed.
    fn remove_pending_upcalls(&self, upcall_id: UpcallId) -> usize;

    /// Returns the current state the process is in.
    fn get_state(&self) -> State;

    /// Returns whether the process is alive, which for the purposes of the
    /// kernel means it is running or yielded (possibly stopped).
    fn is_running(&self) -> bool;

    /// Move this process from the running state to the yielded state.
    ///
    /// This will fail (i.e. not do anything) if the process was not previously
    /// running.
    fn set_yielded_state(&self);

    /// Move this process from running or yielded state into the stopped state.
    ///
    /// This will fail (i.e. not do anything) if the process was not either
    /// running or yielded.
    fn stop(&self);

    /// Move this stopped process back into its original state.
    ///
    /// This transitions a process from `StoppedRunning` -> `Running` or
    /// `StoppedYielded` -> `Yielded`.
    fn resume(&self);

    /// Put this process in the fault state. The process stops running and all
    /// of its kernel-held resources are released.
    fn set_fault_state(&self);

    /// Start the process by queuing its entry point.
    ///
    /// Does nothing unless the process is `Unstarted`.
    fn start(&self, capability: &dyn capabilities::ProcessManagementCapability);

    /// Terminates and attempts to restart the process. The process and current
    /// application always terminate. The kernel may, based on its own policy,
    /// restart the application using the same process, reuse the process for
    /// another application, or simply terminate the process and application.
    ///
    /// A restarted process gets a fresh `ProcessId`, so identifiers held by
    /// capsules for the previous instance no longer resolve.
    fn try_restart(&self, completion_code: Option<u32>);

    /// Stop and clear a process's state, putting it into the `Terminated`
    /// state.
    ///
    /// This will end the process, but does not reset it such that it could be
    /// restarted and run again. All of the process's grant regions are freed,
    /// its registered buffers are released and its pending tasks are dropped.
    ///
    /// Terminating an already terminated process does nothing.
    fn terminate(&self, completion_code: Option<u32>);

    /// Returns how many times this process has been restarted.
    fn get_restart_count(&self) -> usize;

    /// Get the completion code if the process has previously terminated.
    ///
    /// If the process has never terminated then there has been no opportunity
    /// for a completion code to be set, and this will return `None`.
    ///
    /// If the process has previously terminated this will return `Some()`. If
    /// the last time the process terminated it did not provide a completion
    /// code (e.g. the process faulted), then this will return `Some(None)`. If
    /// the last time the process terminated it did provide a completion code,
    /// this will return `Some(Some(completion_code))`.
    fn get_completion_code(&self) -> Option<Option<u32>>;

    // memop operations

    /// Change the location of the program break and reallocate the MPU region
    /// covering program memory.
    ///
    /// This will fail with an error if the process is no longer active, if the
    /// new break would fall below memory already shared with the kernel, or if
    /// it would collide with the kernel-owned grant region.
    fn brk(&self, new_break: *const u8) -> Result<*const u8, Error>;

    /// Change the location of the program break, reallocate the MPU region
    /// covering program memory, and return the previous break address.
    ///
    /// This will fail with the same errors as `brk`.
    fn sbrk(&self, increment: isize) -> Result<*const u8, Error>;

    /// The start address of allocated RAM for this process.
    fn mem_start(&self) -> *const u8;

    /// The first address after the end of the allocated RAM for this process.
    fn mem_end(&self) -> *const u8;

    /// The lowest address of the grant region for the process.
    fn kernel_memory_break(&self) -> *const u8;

    /// The first address after process-accessible RAM.
    fn app_memory_break(&self) -> *const u8;

    /// The start address of the flash region holding this process's code.
    fn flash_start(&self) -> *const u8;

    /// The first address after the end of the process's flash region.
    fn flash_end(&self) -> *const u8;

    // buffer sharing

    /// Creates a [`ReadWriteProcessBuffer`] from the given offset and size in
    /// process memory.
    ///
    /// ## Returns
    ///
    /// In case of success, this method returns the created
    /// [`ReadWriteProcessBuffer`].
    ///
    /// In case of an error, an appropriate ErrorCode is returned:
    ///
    /// - If the memory is not contained in the process-accessible memory space
    ///   / `buf_start_addr` and `size` are not a valid read-write buffer (any
    ///   byte in the range is not read/write accessible to the process),
    ///   [`ErrorCode::INVAL`].
    /// - If the process is not active: [`ErrorCode::FAIL`].
    /// - For all other errors: [`ErrorCode::FAIL`].
    fn build_readwrite_process_buffer(
        &self,
        buf_start_addr: *mut u8,
        size: usize,
    ) -> Result<ReadWriteProcessBuffer, ErrorCode>;

    /// Creates a [`ReadOnlyProcessBuffer`] from the given offset and size in
    /// process memory.
    ///
    /// The buffer may also lie within the process's flash.
    ///
    /// ## Returns
    ///
    /// In case of success, this method returns the created
    /// [`ReadOnlyProcessBuffer`].
    ///
    /// In case of an error, an appropriate ErrorCode is returned:
    ///
    /// - If the memory is not contained in the process-accessible memory space
    ///   / `buf_start_addr` and `size` are not a valid read-only buffer (any
    ///   byte in the range is not readable by the process),
    ///   [`ErrorCode::INVAL`].
    /// - If the process is not active: [`ErrorCode::FAIL`].
    /// - For all other errors: [`ErrorCode::FAIL`].
    fn build_readonly_process_buffer(
        &self,
        buf_start_addr: *const u8,
        size: usize,
    ) -> Result<ReadOnlyProcessBuffer, ErrorCode>;

    /// Record that the region `[start, start + len)` is now shared through
    /// `slot`, replacing whatever that slot shared before.
    ///
    /// A `len` of zero releases the slot. Returns `Error::Overlap` if the
    /// region conflicts with a buffer shared through another slot and
    /// `Error::OutOfMemory` if the process cannot track more buffers. On error
    /// the previous registration of `slot` stays in place.
    fn track_allow(&self, slot: AllowSlot, start: usize, len: usize) -> Result<(), Error>;

    /// Number of buffers currently shared with the kernel.
    fn allowed_buffer_count(&self) -> usize;

    // grants

    /// Allocate memory from the grant region and store the reference in the
    /// proper grant pointer index.
    ///
    /// This function must check that doing the allocation does not cause the
    /// kernel memory break to go below the top of the process accessible memory
    /// region allowed by the MPU. Note, this can be different from the actual
    /// app_brk, as MPU alignment and size constraints may result in the MPU
    /// enforced region differing from the app_brk.
    ///
    /// If the grant is already allocated `Ok(GrantAllocation::Existing)` is
    /// returned and no memory is consumed. Otherwise:
    /// - `Error::InactiveApp` if the process is not running.
    /// - `Error::KernelError` if the grant number is outside the grant table.
    /// - `Error::OutOfMemory` if the grant region cannot fit `size` bytes.
    fn allocate_grant(
        &self,
        grant_num: usize,
        driver_num: usize,
        size: usize,
        align: usize,
    ) -> Result<GrantAllocation, Error>;

    /// Check if a given grant for this process has been allocated.
    ///
    /// Returns `None` if the process is not active. Otherwise, returns `true`
    /// if the grant has been allocated, `false` otherwise.
    fn grant_is_allocated(&self, grant_num: usize) -> Option<bool>;

    /// Allocate memory from the grant region that is `size` bytes long and
    /// aligned to `align` bytes. This is used for creating custom grants which
    /// are not recorded in the grant pointer array, but are useful for capsules
    /// which need additional process-specific dynamically allocated memory.
    ///
    /// If successful, return a Some() with an identifier that can be used with
    /// `enter_custom_grant()` to get access to the memory and the pointer to
    /// the memory which must be used to initialize the memory.
    fn allocate_custom_grant(
        &self,
        size: usize,
        align: usize,
    ) -> Option<(ProcessCustomGrantIdentifier, NonNull<u8>)>;

    /// Enter the grant based on `grant_num` for this process.
    ///
    /// Entering a grant means getting access to the actual memory for the
    /// object stored as the grant.
    ///
    /// This will return an `Err` if the process is inactive or the `grant_num`
    /// is invalid, if the grant has not been allocated, or if the grant is
    /// already entered. If this returns `Ok()` then the pointer points to the
    /// previously allocated memory for this grant.
    fn enter_grant(&self, grant_num: usize) -> Result<NonNull<u8>, Error>;

    /// Enter a custom grant based on the `identifier`.
    ///
    /// This retrieves a pointer to the previously allocated custom grant based
    /// on the identifier returned when the custom grant was allocated.
    ///
    /// This returns an error if the custom grant is no longer accessible, or
    /// if the process is inactive.
    fn enter_custom_grant(&self, identifier: ProcessCustomGrantIdentifier)
        -> Result<NonNull<u8>, Error>;

    /// Opposite of `enter_grant()`. Used to signal that the grant is no longer
    /// entered.
    ///
    /// If `grant_num` is valid, this function cannot fail. If `grant_num` is
    /// invalid, this function will do nothing. If the process is inactive then
    /// grants are invalid and are not entered or not entered, and this function
    /// will do nothing.
    ///
    /// ### Safety
    ///
    /// The caller must ensure that no references to the memory inside the
    /// grant exist after calling `leave_grant()`. Otherwise, it would be
    /// possible to effectively enter the grant twice (once using the existing
    /// reference, once with a new call to `enter_grant()`) which breaks the
    /// memory safety requirements of grants.
    unsafe fn leave_grant(&self, grant_num: usize);

    /// Return the count of the number of allocated grant pointers if the
    /// process is active. This does not count custom grants. This is used to
    /// determine if a new grant has been allocated after a call to
    /// `SyscallDriver::allocate_grant()`.
    ///
    /// Useful for debugging/inspecting the system.
    fn grant_allocated_count(&self) -> Option<usize>;

    /// Get the grant number (grant_num) associated with a given driver number.
    /// This function searches the grant pointer array for grant_ptrs that
    /// have been allocated for the given driver number.
    ///
    /// Returns `Error::NoGrant` if no grant is allocated for that driver and
    /// `Error::InactiveApp` if the process is not active.
    fn lookup_grant_from_driver_num(&self, driver_num: usize) -> Result<usize, Error>;

    /// Number of bytes of the grant region currently in use, including the
    /// grant pointer table and task queue.
    fn grant_region_size(&self) -> usize;

    // subscribe

    /// Verify that an upcall function pointer is within process-accessible
    /// memory.
    ///
    /// Returns `true` if the upcall function pointer is valid for this
    /// process, and `false` otherwise.
    fn is_valid_upcall_function_pointer(&self, upcall_fn: NonNull<()>) -> bool;

    // context switch

    /// Set the return value the process should see when it begins executing
    /// again after the syscall.
    ///
    /// It is not valid to call this function when the process is inactive
    /// (i.e. the process will not run again).
    fn set_syscall_return_value(&self, return_value: SyscallReturn);

    /// Set the function that is to be executed when the process is resumed.
    ///
    /// This also moves the process into the `Running` state.
    fn set_process_function(&self, callback: FunctionCall);

    /// The return value most recently handed to the process, if it has not
    /// resumed since.
    fn get_stored_syscall_return(&self) -> Option<SyscallReturn>;

    /// Write a single byte to process memory at `addr`.
    ///
    /// Returns `false` and writes nothing if `addr` is not in process
    /// accessible RAM.
    fn set_byte(&self, addr: *mut u8, value: u8) -> bool;

    // debug

    /// Returns how many syscalls this app has called.
    fn debug_syscall_count(&self) -> usize;

    /// Returns how many upcalls for this process have been dropped.
    fn debug_dropped_upcall_count(&self) -> usize;

    /// Returns the last syscall the process called. Returns `None` if the
    /// process has not called any syscalls or the information is unknown.
    fn debug_syscall_last(&self) -> Option<Syscall>;

    /// Increment the number of syscalls the process has called and record the
    /// most recent one.
    fn debug_syscall_called(&self, last_syscall: Syscall);
}

/// Generic return type for many process-related functions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    NoSuchApp,
    OutOfMemory,
    AddressOutOfBounds,
    /// The process is inactive (likely in a fault or exit state) and the
    /// attempted operation is therefore invalid.
    InactiveApp,
    /// This likely indicates a bug in the kernel and that some state is
    /// inconsistent in the kernel.
    KernelError,
    /// The grant is already entered. Grants cannot be entered twice at once.
    AlreadyEntered,
    /// A buffer conflicts with a buffer already shared with the kernel.
    Overlap,
    /// No grant region has been allocated for the requested driver.
    NoGrant,
}

impl From<Error> for ErrorCode {
    fn from(err: Error) -> ErrorCode {
        match err {
            Error::OutOfMemory => ErrorCode::NOMEM,
            Error::AddressOutOfBounds => ErrorCode::INVAL,
            Error::NoSuchApp => ErrorCode::INVAL,
            Error::InactiveApp => ErrorCode::FAIL,
            Error::KernelError => ErrorCode::FAIL,
            Error::AlreadyEntered => ErrorCode::BUSY,
            Error::Overlap => ErrorCode::ALREADY,
            Error::NoGrant => ErrorCode::NOMEM,
        }
    }
}

/// Various states a process can be in.
///
/// This is made public in case external implementations of `Process` want
/// to re-use these process states in the external implementation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    /// Process expects to be running code. The process may not be currently
    /// scheduled by the scheduler, but the process has work to do if it is
    /// scheduled.
    Running,

    /// Process stopped executing and returned to the kernel because it called
    /// the `yield` syscall. It waits for an upcall to be delivered.
    Yielded,

    /// The process is stopped, and its previous state was Running.
    StoppedRunning,

    /// The process is stopped, and it was stopped while it was yielded.
    StoppedYielded,

    /// The process faulted and cannot be run.
    Faulted,

    /// The process exited with the `exit-terminate` system call and
    /// cannot be run.
    Terminated,

    /// The process has never actually been executed, or it was reset and its
    /// entry point has not been queued yet.
    Unstarted,
}

impl State {
    /// Whether a process in this state still owns kernel resources.
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            State::Running | State::Yielded | State::StoppedRunning | State::StoppedYielded
        )
    }
}

/// Tasks that can be queued for a process.
///
/// This is public for external implementations of `Process`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Task {
    /// Function pointer in the process to execute. Generally this is a upcall
    /// from a capsule.
    FunctionCall(FunctionCall),
}

/// Enumeration to identify whether a function call for a process comes directly
/// from the kernel or from a upcall subscribed through a `SyscallDriver`
/// implementation.
///
/// An example of a kernel function is the application entry point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FunctionCallSource {
    /// For functions coming directly from the kernel, such as `init_fn`.
    Kernel,
    /// For functions coming from capsules or any implementation of
    /// `SyscallDriver`.
    Driver(UpcallId),
}

/// Struct that defines a upcall that can be passed to a process. The upcall
/// takes four arguments that are `SyscallDriver` and upcall specific, so they
/// are represented generically here.
///
/// A `FunctionCall` also identifies the upcall that scheduled it, if any, so
/// that it can be unscheduled when the process unsubscribes from this upcall.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCall {
    pub source: FunctionCallSource,
    pub argument0: usize,
    pub argument1: usize,
    pub argument2: usize,
    pub argument3: usize,
    pub pc: usize,
}
