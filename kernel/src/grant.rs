// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Support for processes granting memory from their allocations to the kernel.
//!
//! ## Grant Overview
//!
//! Grants allow capsules to dynamically allocate memory from a process to hold
//! state on the process's behalf.
//!
//! Each capsule that wishes to do this needs to have a [`Grant`]. `Grant`s are
//! created at boot, and each have a unique grant number, the driver number of
//! the capsule they belong to, and a type `T`. A `Grant` does not initially
//! represent any allocated memory.
//!
//! A capsule asks for its memory in a specific process with
//! [`Grant::allocate_or_get`]. The first call for a process carves the object
//! out of the "grant region" at the top of that process's memory and
//! initializes it with the closure the capsule passed; later calls hand back
//! the same object and consume nothing. [`Grant::enter`] never allocates: it
//! fails with [`Error::NoGrant`] until the grant exists.
//!
//! If a `Grant` has never been allocated for a process, the object `T` will
//! _not_ exist in that process's grant region, even if the `Grant` has been
//! allocated for other processes.
//!
//! Upcalls and allowed buffer references are stored in the dynamically
//! allocated grant for a particular driver as well, but outside of the `T`
//! object. Only the kernel ever writes them, which is how subscribe and allow
//! are always correct swaps. Capsules read buffers and schedule upcalls through
//! [`GrantKernelData`] while the grant is entered, or through an
//! [`UpcallHandle`] otherwise.
//!
//! ```text,ignore
//!  Process Memory
//! ┌────────────────────────┐
//! │ Grant       ptr 0      │ ◄── one entry per grant number, holding the
//! │ Pointers    ptr 1 ───┐ │     driver number and the allocation. The low
//! │             ...      │ │     bit of the pointer marks "entered".
//! ├──────────────────────┼─┤
//! │ Upcall queue         │ │
//! ├──────────────────────┼─┤
//! │ Grant Region         │ │
//! │ ┌─────────────────┐  │ │
//! │ │ [ SizeOf<T> ]   │  │ │
//! │ │ Padding         │  │ │
//! │ │ Saved allows    │  │ │
//! │ │ Saved upcalls   │  │ │
//! │ │ Counters        │  │ │
//! │ └─────────────────┘◄─┘ │
//! │ ┌─────────────────┐    │
//! │ │ Custom Grant    │    │ ◄── extra memory from a GrantRegionAllocator
//! │ └─────────────────┘    │
//! ├─kernel_brk─────────────┤
//! │ ...                    │
//! ├─app_brk────────────────┤
//! │ Process heap and stack │
//! └────────────────────────┘
//! ```
//!
//! ## Entering
//!
//! A grant may be entered once at a time. Entering it again while a closure
//! holds it, from any path, fails with [`Error::AlreadyEntered`] instead of
//! creating a second `&mut T`. [`Grant::each`] reports such grants in its
//! [`EachSummary`] rather than skipping them silently.

use core::cmp;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::{write, NonNull};
use core::slice;

use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::allow_registry::{AllowKind, AllowSlot};
use crate::config;
use crate::kernel::{Kernel, ProcessIter};
use crate::process::{Error, GrantAllocation, Process, ProcessCustomGrantIdentifier, ProcessId};
use crate::processbuffer::{ReadOnlyProcessBuffer, ReadWriteProcessBuffer};
use crate::processbuffer::{ReadOnlyProcessBufferRef, ReadWriteProcessBufferRef};
use crate::upcall::{Upcall, UpcallError, UpcallHandle, UpcallId};

/// Tracks how many upcalls a grant instance supports automatically.
pub trait UpcallSize {
    /// The number of upcalls the grant supports.
    const COUNT: u8;
}

/// Specify the number of upcalls a grant instance supports.
pub struct UpcallCount<const NUM: u8>;
impl<const NUM: u8> UpcallSize for UpcallCount<NUM> {
    const COUNT: u8 = NUM;
}

/// Tracks how many read-only allows a grant instance supports automatically.
pub trait AllowRoSize {
    /// The number of read-only allows the grant supports.
    const COUNT: u8;
}

/// Specify the number of read-only allows a grant instance supports.
pub struct AllowRoCount<const NUM: u8>;
impl<const NUM: u8> AllowRoSize for AllowRoCount<NUM> {
    const COUNT: u8 = NUM;
}

/// Tracks how many read-write allows a grant instance supports automatically.
pub trait AllowRwSize {
    /// The number of read-write allows the grant supports.
    const COUNT: u8;
}

/// Specify the number of read-write allows a grant instance supports.
pub struct AllowRwCount<const NUM: u8>;
impl<const NUM: u8> AllowRwSize for AllowRwCount<NUM> {
    const COUNT: u8 = NUM;
}

register_bitfields![
    usize,
    GrantCounters [
        UPCALLS OFFSET(0) NUMBITS(8) [],
        ALLOW_RO OFFSET(8) NUMBITS(8) [],
        ALLOW_RW OFFSET(16) NUMBITS(8) []
    ]
];

/// View of the kernel-managed header at the base of every grant allocation.
///
/// ```text,ignore
/// base ──► counters: usize (UPCALLS | ALLOW_RO << 8 | ALLOW_RW << 16)
///          [SavedUpcall; UPCALLS]
///          [SavedAllowRo; ALLOW_RO]
///          [SavedAllowRw; ALLOW_RW]
///          padding up to align_of::<T>()
///          T
/// ```
///
/// The counters are stored in the header itself so the kernel can walk it
/// without knowing the capsule's `Upcalls`/`AllowROs`/`AllowRWs` types.
struct KernelManagedLayout {
    counters_ptr: *mut usize,
    upcalls_array: *mut SavedUpcall,
    allow_ro_array: *mut SavedAllowRo,
    allow_rw_array: *mut SavedAllowRw,
}

// Newtypes so the many `usize`/`u8` arguments below cannot be swapped.
#[derive(Copy, Clone)]
struct UpcallItems(u8);
#[derive(Copy, Clone)]
struct AllowRoItems(u8);
#[derive(Copy, Clone)]
struct AllowRwItems(u8);
#[derive(Copy, Clone)]
struct GrantDataSize(usize);
#[derive(Copy, Clone)]
struct GrantDataAlign(usize);

impl KernelManagedLayout {
    fn counters(&self) -> LocalRegisterCopy<usize, GrantCounters::Register> {
        // Safety: `counters_ptr` was written by `initialize_from_counts`.
        LocalRegisterCopy::new(unsafe { self.counters_ptr.read() })
    }

    /// Reads the header of an already initialized grant.
    ///
    /// # Safety
    ///
    /// `base_ptr` must point to a grant allocation that was set up by
    /// `initialize_from_counts` and that is entered for as long as the layout
    /// is used.
    unsafe fn read_from_base(base_ptr: NonNull<u8>) -> Self {
        let counters_ptr = base_ptr.as_ptr().cast::<usize>();
        let counters: LocalRegisterCopy<usize, GrantCounters::Register> =
            LocalRegisterCopy::new(counters_ptr.read());

        let upcalls_num = counters.read(GrantCounters::UPCALLS);
        let allow_ro_num = counters.read(GrantCounters::ALLOW_RO);

        let upcalls_array = counters_ptr.add(1).cast::<SavedUpcall>();
        let allow_ro_array = upcalls_array.add(upcalls_num).cast::<SavedAllowRo>();
        let allow_rw_array = allow_ro_array.add(allow_ro_num).cast::<SavedAllowRw>();

        Self {
            counters_ptr,
            upcalls_array,
            allow_ro_array,
            allow_rw_array,
        }
    }

    /// Writes a fresh header: the counters, then empty upcalls and buffers.
    ///
    /// # Safety
    ///
    /// `base_ptr` must point to a fresh allocation of at least `grant_size`
    /// bytes aligned to `grant_align`.
    unsafe fn initialize_from_counts(
        base_ptr: NonNull<u8>,
        upcalls_num_val: UpcallItems,
        allow_ro_num_val: AllowRoItems,
        allow_rw_num_val: AllowRwItems,
    ) -> Self {
        let counters_ptr = base_ptr.as_ptr().cast::<usize>();

        let mut counters: LocalRegisterCopy<usize, GrantCounters::Register> =
            LocalRegisterCopy::new(0);
        counters.write(
            GrantCounters::UPCALLS.val(upcalls_num_val.0 as usize)
                + GrantCounters::ALLOW_RO.val(allow_ro_num_val.0 as usize)
                + GrantCounters::ALLOW_RW.val(allow_rw_num_val.0 as usize),
        );

        let upcalls_array = counters_ptr.add(1).cast::<SavedUpcall>();
        let allow_ro_array = upcalls_array
            .add(upcalls_num_val.0.into())
            .cast::<SavedAllowRo>();
        let allow_rw_array = allow_ro_array
            .add(allow_ro_num_val.0.into())
            .cast::<SavedAllowRw>();

        counters_ptr.write(counters.get());
        write_default_array(upcalls_array, upcalls_num_val.0.into());
        write_default_array(allow_ro_array, allow_ro_num_val.0.into());
        write_default_array(allow_rw_array, allow_rw_num_val.0.into());

        Self {
            counters_ptr,
            upcalls_array,
            allow_ro_array,
            allow_rw_array,
        }
    }

    /// Total bytes for one grant, kernel-managed header and `T` included.
    fn grant_size(
        upcalls_num: UpcallItems,
        allow_ro_num: AllowRoItems,
        allow_rw_num: AllowRwItems,
        grant_t_size: GrantDataSize,
        grant_t_align: GrantDataAlign,
    ) -> usize {
        let kernel_managed_size = size_of::<usize>()
            + upcalls_num.0 as usize * size_of::<SavedUpcall>()
            + allow_ro_num.0 as usize * size_of::<SavedAllowRo>()
            + allow_rw_num.0 as usize * size_of::<SavedAllowRw>();
        // Alignments are powers of two, so the padding can be masked.
        let grant_t_align_mask = grant_t_align.0 - 1;
        let padding =
            (grant_t_align.0 - (kernel_managed_size & grant_t_align_mask)) & grant_t_align_mask;
        kernel_managed_size + padding + grant_t_size.0
    }

    /// The header is made of `usize`-aligned items, and `T` needs its own
    /// alignment.
    fn grant_align(grant_t_align: GrantDataAlign) -> usize {
        cmp::max(align_of::<usize>(), grant_t_align.0)
    }

    /// # Safety
    ///
    /// `base_ptr` must be the base of an allocation of `grant_size` bytes.
    unsafe fn offset_of_grant_data_t(
        base_ptr: NonNull<u8>,
        grant_size: usize,
        grant_t_size: GrantDataSize,
    ) -> NonNull<u8> {
        // `T` sits at the very end of the allocation.
        NonNull::new_unchecked(base_ptr.as_ptr().add(grant_size - grant_t_size.0))
    }

    fn get_upcalls_slice(&mut self) -> &mut [SavedUpcall] {
        let num = self.counters().read(GrantCounters::UPCALLS);
        unsafe { slice::from_raw_parts_mut(self.upcalls_array, num) }
    }

    fn get_allow_ro_slice(&mut self) -> &mut [SavedAllowRo] {
        let num = self.counters().read(GrantCounters::ALLOW_RO);
        unsafe { slice::from_raw_parts_mut(self.allow_ro_array, num) }
    }

    fn get_allow_rw_slice(&mut self) -> &mut [SavedAllowRw] {
        let num = self.counters().read(GrantCounters::ALLOW_RW);
        unsafe { slice::from_raw_parts_mut(self.allow_rw_array, num) }
    }

    fn get_resource_slices(&self) -> (&[SavedUpcall], &[SavedAllowRo], &[SavedAllowRw]) {
        let counters = self.counters();
        // Safety: the header holds exactly this many initialized items, and
        // only the kernel writes them, never while a capsule holds the grant.
        unsafe {
            (
                slice::from_raw_parts(self.upcalls_array, counters.read(GrantCounters::UPCALLS)),
                slice::from_raw_parts(self.allow_ro_array, counters.read(GrantCounters::ALLOW_RO)),
                slice::from_raw_parts(self.allow_rw_array, counters.read(GrantCounters::ALLOW_RW)),
            )
        }
    }
}

/// This GrantData object provides access to the memory allocated for a grant
/// for a specific process.
///
/// The GrantData type is templated on T, the actual type of the object in the
/// grant. GrantData holds a mutable reference to the type, allowing users
/// access to the object in process memory.
///
/// Capsules gain access to a GrantData object by calling `Grant::enter()`.
pub struct GrantData<'a, T: 'a + ?Sized> {
    data: &'a mut T,
}

impl<'a, T: 'a + ?Sized> GrantData<'a, T> {
    fn new(data: &'a mut T) -> GrantData<'a, T> {
        GrantData { data }
    }
}

impl<'a, T: 'a + ?Sized> Deref for GrantData<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T: 'a + ?Sized> DerefMut for GrantData<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

/// This GrantKernelData object provides a handle to access upcalls and process
/// buffers stored on behalf of a particular grant/driver.
///
/// Capsules gain access to a GrantKernelData object by calling
/// `Grant::enter()`. From there, they can schedule upcalls or access process
/// buffers.
///
/// The slices are only ever read by capsules; subscribe and allow write them
/// and both need the grant entered, which is impossible while this exists.
pub struct GrantKernelData<'a> {
    upcalls: &'a [SavedUpcall],
    allow_ro: &'a [SavedAllowRo],
    allow_rw: &'a [SavedAllowRw],
    driver_num: usize,
    process: &'a dyn Process,
}

impl<'a> GrantKernelData<'a> {
    fn new(
        upcalls: &'a [SavedUpcall],
        allow_ro: &'a [SavedAllowRo],
        allow_rw: &'a [SavedAllowRw],
        driver_num: usize,
        process: &'a dyn Process,
    ) -> GrantKernelData<'a> {
        Self {
            upcalls,
            allow_ro,
            allow_rw,
            driver_num,
            process,
        }
    }

    /// Schedule the specified upcall for the process with r0, r1, r2 as
    /// provided values.
    ///
    /// Capsules call this function to schedule upcalls, and upcalls are
    /// identified by the `subscribe_num`, which must match the subscribe
    /// number used when the upcall was originally subscribed by a process.
    /// `subscribe_num`s are indexed starting at zero.
    pub fn schedule_upcall(
        &self,
        subscribe_num: usize,
        r: (usize, usize, usize),
    ) -> Result<(), UpcallError> {
        self.upcalls.get(subscribe_num).map_or(
            Err(UpcallError::InvalidSubscribeNum),
            |saved_upcall| {
                let upcall = Upcall::new(
                    self.process.processid(),
                    UpcallId {
                        subscribe_num,
                        driver_num: self.driver_num,
                    },
                    saved_upcall.appdata,
                    saved_upcall.fn_ptr,
                );
                upcall.schedule(self.process, r.0, r.1, r.2)
            },
        )
    }

    /// A handle to schedule upcall `subscribe_num` after the grant is left.
    pub fn upcall_handle(&self, subscribe_num: usize) -> Result<UpcallHandle, UpcallError> {
        if subscribe_num < self.upcalls.len() {
            Ok(UpcallHandle::new(
                self.process.processid(),
                self.driver_num,
                subscribe_num,
            ))
        } else {
            Err(UpcallError::InvalidSubscribeNum)
        }
    }

    /// Returns a lifetime limited reference to the requested
    /// `ReadOnlyProcessBuffer`.
    ///
    /// The len of the returned `ReadOnlyProcessBuffer` must be checked by the
    /// caller to ensure that a buffer has in fact been allocated. An
    /// unallocated buffer will be returned as a `ReadOnlyProcessBuffer` of
    /// length 0.
    ///
    /// The `ReadOnlyProcessBuffer` is only valid for as long as this object
    /// is valid, i.e. the lifetime of the app enter closure.
    ///
    /// If the specified allow number is invalid, then a
    /// `Error::AddressOutOfBounds` will be returned.
    pub fn get_readonly_processbuffer(
        &self,
        allow_ro_num: usize,
    ) -> Result<ReadOnlyProcessBufferRef<'_>, Error> {
        self.allow_ro
            .get(allow_ro_num)
            .map_or(Err(Error::AddressOutOfBounds), |saved_ro| {
                // Safety: the buffer was validated by the process when it was
                // allowed, and cannot be replaced while the grant is entered.
                unsafe {
                    Ok(ReadOnlyProcessBufferRef::new(
                        saved_ro.ptr,
                        saved_ro.len,
                        self.process.processid(),
                    ))
                }
            })
    }

    /// Returns a lifetime limited reference to the requested
    /// `ReadWriteProcessBuffer`.
    ///
    /// The same rules as for [`GrantKernelData::get_readonly_processbuffer`]
    /// apply.
    pub fn get_readwrite_processbuffer(
        &self,
        allow_rw_num: usize,
    ) -> Result<ReadWriteProcessBufferRef<'_>, Error> {
        self.allow_rw
            .get(allow_rw_num)
            .map_or(Err(Error::AddressOutOfBounds), |saved_rw| {
                // Safety: as for read-only buffers.
                unsafe {
                    Ok(ReadWriteProcessBufferRef::new(
                        saved_rw.ptr,
                        saved_rw.len,
                        self.process.processid(),
                    ))
                }
            })
    }
}

/// A minimal representation of an upcall, used for storing an upcall in a
/// process' grant table without wasting memory duplicating information such
/// as process ID.
#[repr(C)]
#[derive(Default)]
struct SavedUpcall {
    appdata: usize,
    fn_ptr: Option<NonNull<()>>,
}

/// A minimal representation of a read-only allow from app, used for storing a
/// read-only allow in a process' kernel managed grant space without wasting
/// memory duplicating information such as process ID.
#[repr(C)]
struct SavedAllowRo {
    ptr: *const u8,
    len: usize,
}

impl Default for SavedAllowRo {
    fn default() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }
}

/// A minimal representation of a read-write allow from app.
#[repr(C)]
struct SavedAllowRw {
    ptr: *mut u8,
    len: usize,
}

impl Default for SavedAllowRw {
    fn default() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            len: 0,
        }
    }
}

/// Write the default value of T to every element of the array.
///
/// # Safety
///
/// `base` must be valid for writes of `num` items of `T`.
unsafe fn write_default_array<T: Default>(base: *mut T, num: usize) {
    for i in 0..num {
        base.add(i).write(T::default());
    }
}

/// Leaves the grant when dropped, on every exit path of the code holding it.
struct GrantEnterLifetimeGuard<'a> {
    process: &'a dyn Process,
    grant_num: usize,
}

impl Drop for GrantEnterLifetimeGuard<'_> {
    fn drop(&mut self) {
        // Safety: the guard outlives every reference derived from the grant
        // pointer it was created with.
        unsafe { self.process.leave_grant(self.grant_num) };
    }
}

/// Enter the driver's grant to reach the kernel-managed header.
///
/// Fails with `Error::NoGrant` if the driver has no grant in this process and
/// with `Error::AlreadyEntered` if a capsule currently holds it.
fn enter_grant_kernel_managed(
    process: &dyn Process,
    driver_num: usize,
) -> Result<(GrantEnterLifetimeGuard<'_>, KernelManagedLayout), Error> {
    let grant_num = process.lookup_grant_from_driver_num(driver_num)?;
    let grant_base_ptr = process.enter_grant(grant_num)?;
    let guard = GrantEnterLifetimeGuard { process, grant_num };

    // Safety: `lookup_grant_from_driver_num` only finds initialized grants,
    // and the guard keeps it entered.
    let layout = unsafe { KernelManagedLayout::read_from_base(grant_base_ptr) };
    Ok((guard, layout))
}

/// Subscribe to an upcall by saving the upcall in the grant region for the
/// process and returning the existing upcall for the same UpcallId.
pub(crate) fn subscribe(process: &dyn Process, upcall: Upcall) -> Result<Upcall, (Upcall, Error)> {
    let (_grant_open, mut layout) =
        match enter_grant_kernel_managed(process, upcall.upcall_id.driver_num) {
            Ok(val) => val,
            Err(e) => return Err((upcall, e)),
        };

    let saved_upcalls_slice = layout.get_upcalls_slice();

    match saved_upcalls_slice.get_mut(upcall.upcall_id.subscribe_num) {
        Some(saved_upcall) => {
            let old_upcall = Upcall::new(
                process.processid(),
                upcall.upcall_id,
                saved_upcall.appdata,
                saved_upcall.fn_ptr,
            );

            saved_upcall.appdata = upcall.appdata;
            saved_upcall.fn_ptr = upcall.fn_ptr;

            Ok(old_upcall)
        }
        None => Err((upcall, Error::AddressOutOfBounds)),
    }
}

/// Stores a read-only process buffer in the driver's grant and returns the
/// buffer it replaces.
///
/// The new region is registered with the process first. If it conflicts with
/// a live read-write buffer the old buffer stays in place and
/// `Error::Overlap` is returned along with the rejected buffer.
pub(crate) fn allow_ro(
    process: &dyn Process,
    driver_num: usize,
    allow_num: usize,
    buffer: ReadOnlyProcessBuffer,
) -> Result<ReadOnlyProcessBuffer, (ReadOnlyProcessBuffer, Error)> {
    let (_grant_open, mut layout) = match enter_grant_kernel_managed(process, driver_num) {
        Ok(val) => val,
        Err(e) => return Err((buffer, e)),
    };

    let saved_allow_ro_slice = layout.get_allow_ro_slice();

    match saved_allow_ro_slice.get_mut(allow_num) {
        Some(saved) => {
            let (start, len) = buffer.region();
            let slot = AllowSlot::new(driver_num, allow_num, AllowKind::ReadOnly);
            if let Err(e) = process.track_allow(slot, start, len) {
                return Err((buffer, e));
            }

            // Safety: the saved buffer was valid when it was allowed.
            let old_allow =
                unsafe { ReadOnlyProcessBuffer::new(saved.ptr, saved.len, process.processid()) };

            let (ptr, len) = buffer.consume();
            saved.ptr = ptr;
            saved.len = len;

            Ok(old_allow)
        }
        None => Err((buffer, Error::AddressOutOfBounds)),
    }
}

/// Stores a read-write process buffer in the driver's grant and returns the
/// buffer it replaces.
///
/// Same rules as [`allow_ro`]; a read-write buffer conflicts with any other
/// live buffer it overlaps.
pub(crate) fn allow_rw(
    process: &dyn Process,
    driver_num: usize,
    allow_num: usize,
    buffer: ReadWriteProcessBuffer,
) -> Result<ReadWriteProcessBuffer, (ReadWriteProcessBuffer, Error)> {
    let (_grant_open, mut layout) = match enter_grant_kernel_managed(process, driver_num) {
        Ok(val) => val,
        Err(e) => return Err((buffer, e)),
    };

    let saved_allow_rw_slice = layout.get_allow_rw_slice();

    match saved_allow_rw_slice.get_mut(allow_num) {
        Some(saved) => {
            let (start, len) = buffer.region();
            let slot = AllowSlot::new(driver_num, allow_num, AllowKind::ReadWrite);
            if let Err(e) = process.track_allow(slot, start, len) {
                return Err((buffer, e));
            }

            // Safety: the saved buffer was valid when it was allowed.
            let old_allow =
                unsafe { ReadWriteProcessBuffer::new(saved.ptr, saved.len, process.processid()) };

            let (ptr, len) = buffer.consume();
            saved.ptr = ptr;
            saved.len = len;

            Ok(old_allow)
        }
        None => Err((buffer, Error::AddressOutOfBounds)),
    }
}

/// Schedule the upcall currently subscribed for `upcall_id`.
///
/// This is how an [`UpcallHandle`] reaches the saved upcall. It enters the
/// grant, so it fails with `UpcallError::GrantEntered` from inside a
/// `Grant::enter` closure for the same process and driver.
pub(crate) fn schedule_saved_upcall(
    process: &dyn Process,
    upcall_id: UpcallId,
    r: (usize, usize, usize),
) -> Result<(), UpcallError> {
    let (_grant_open, layout) = enter_grant_kernel_managed(process, upcall_id.driver_num)
        .map_err(|err| match err {
            Error::AlreadyEntered => UpcallError::GrantEntered,
            _ => UpcallError::KernelError,
        })?;

    let (saved_upcalls, _, _) = layout.get_resource_slices();
    let saved = saved_upcalls
        .get(upcall_id.subscribe_num)
        .ok_or(UpcallError::InvalidSubscribeNum)?;

    Upcall::new(process.processid(), upcall_id, saved.appdata, saved.fn_ptr)
        .schedule(process, r.0, r.1, r.2)
}

/// Outcome of [`Grant::each`].
///
/// `entered + already_entered` is the number of processes that have the grant
/// allocated. A grant that fails to enter for another reason is in neither.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EachSummary {
    /// Grants the closure was run on.
    pub entered: usize,
    /// Grants that exist but could not be entered, because they were already
    /// entered further up the call stack.
    pub already_entered: usize,
}

impl EachSummary {
    fn record(&mut self, entered: Result<(), Error>) {
        match entered {
            Ok(()) => self.entered += 1,
            Err(Error::AlreadyEntered) => self.already_entered += 1,
            Err(_) => {}
        }
    }
}

/// An instance of a grant allocated for a particular process.
///
/// `ProcessGrant` is a handle to an instance of a grant that has been
/// allocated in a specific process's grant region. A `ProcessGrant` guarantees
/// that the memory for the grant has been allocated in the process's memory.
///
/// This is created from a `Grant` when that grant is entered for a specific
/// process.
pub struct ProcessGrant<
    'a,
    T: 'a,
    Upcalls: UpcallSize,
    AllowROs: AllowRoSize,
    AllowRWs: AllowRwSize,
> {
    /// The process the grant is applied to.
    ///
    /// We use a reference here because instances of `ProcessGrant` are very
    /// short lived. They only exist while a `Grant` is being entered, so we
    /// can be sure the process still exists while a `ProcessGrant` exists. No
    /// `ProcessGrant` can be stored.
    process: &'a dyn Process,

    /// The syscall driver number this grant is associated with.
    driver_num: usize,

    /// The identifier of the Grant this is applied for.
    grant_num: usize,

    /// Used to store Rust types for grant.
    _phantom: PhantomData<(T, Upcalls, AllowROs, AllowRWs)>,
}

/// Allocates and lays out a grant, without touching `T`.
///
/// Returns the location where `T` must be written if the memory is fresh.
/// Kept free of generics so that it is only instantiated once.
fn allocate_grant_inner(
    process: &dyn Process,
    grant_num: usize,
    driver_num: usize,
    grant_t_size: GrantDataSize,
    grant_t_align: GrantDataAlign,
    num_upcalls: UpcallItems,
    num_allow_ros: AllowRoItems,
    num_allow_rws: AllowRwItems,
) -> Result<Option<NonNull<u8>>, Error> {
    let alloc_align = KernelManagedLayout::grant_align(grant_t_align);
    let alloc_size = KernelManagedLayout::grant_size(
        num_upcalls,
        num_allow_ros,
        num_allow_rws,
        grant_t_size,
        grant_t_align,
    );

    match process.allocate_grant(grant_num, driver_num, alloc_size, alloc_align)? {
        GrantAllocation::Existing => Ok(None),
        GrantAllocation::Fresh(grant_ptr) => {
            if config::CONFIG.trace_grant_allocation {
                debug!(
                    "[{:?}] grant {} for driver {:#x}: {} bytes at {:#x}",
                    process.processid(),
                    grant_num,
                    driver_num,
                    alloc_size,
                    grant_ptr.as_ptr() as usize
                );
            }

            // Safety: `allocate_grant` returned `alloc_size` fresh bytes aligned
            // to `alloc_align`.
            unsafe {
                let _layout = KernelManagedLayout::initialize_from_counts(
                    grant_ptr,
                    num_upcalls,
                    num_allow_ros,
                    num_allow_rws,
                );
                Ok(Some(KernelManagedLayout::offset_of_grant_data_t(
                    grant_ptr,
                    alloc_size,
                    grant_t_size,
                )))
            }
        }
    }
}

impl<'a, T, Upcalls: UpcallSize, AllowROs: AllowRoSize, AllowRWs: AllowRwSize>
    ProcessGrant<'a, T, Upcalls, AllowROs, AllowRWs>
{
    /// Get the grant for `process`, allocating and initializing it with
    /// `init` if it does not exist yet.
    fn allocate_or_get<F>(
        grant: &Grant<T, Upcalls, AllowROs, AllowRWs>,
        process: &'a dyn Process,
        init: F,
    ) -> Result<Self, Error>
    where
        F: FnOnce() -> T,
    {
        match process.grant_is_allocated(grant.grant_num) {
            None => return Err(Error::InactiveApp),
            Some(true) => {}
            Some(false) => {
                // Built before the memory exists, so no path can observe an
                // uninitialized `T`.
                let value = init();
                let fresh = allocate_grant_inner(
                    process,
                    grant.grant_num,
                    grant.driver_num,
                    GrantDataSize(size_of::<T>()),
                    GrantDataAlign(align_of::<T>()),
                    UpcallItems(Upcalls::COUNT),
                    AllowRoItems(AllowROs::COUNT),
                    AllowRwItems(AllowRWs::COUNT),
                )?;
                if let Some(data_ptr) = fresh {
                    // Safety: `data_ptr` is sized and aligned for `T` and
                    // nothing refers to it yet.
                    unsafe { write(data_ptr.cast::<T>().as_ptr(), value) };
                }
            }
        }

        Ok(Self::from_parts(grant, process))
    }

    /// Get the grant for `process` only if it is already allocated.
    fn new_if_allocated(
        grant: &Grant<T, Upcalls, AllowROs, AllowRWs>,
        process: &'a dyn Process,
    ) -> Result<Self, Error> {
        match process.grant_is_allocated(grant.grant_num) {
            Some(true) => Ok(Self::from_parts(grant, process)),
            Some(false) => Err(Error::NoGrant),
            None => Err(Error::InactiveApp),
        }
    }

    fn from_parts(grant: &Grant<T, Upcalls, AllowROs, AllowRWs>, process: &'a dyn Process) -> Self {
        ProcessGrant {
            process,
            driver_num: grant.driver_num,
            grant_num: grant.grant_num,
            _phantom: PhantomData,
        }
    }

    /// Return an [`ProcessId`] for the process this grant is allocated in.
    pub fn processid(&self) -> ProcessId {
        self.process.processid()
    }

    /// Run a function with access to the memory in the related process for the
    /// related Grant. This also provides access to any associated Upcalls and
    /// allowed buffers stored with the grant.
    ///
    /// Returns `Error::AlreadyEntered` without running `fun` if the grant is
    /// already entered, for example from an enclosing `Grant::each` or
    /// `Grant::enter`.
    pub fn enter<F, R>(self, fun: F) -> Result<R, Error>
    where
        F: FnOnce(&mut GrantData<T>, &GrantKernelData) -> R,
    {
        self.enter_with_allocator(|grant_data, kernel_data, _allocator| {
            fun(grant_data, kernel_data)
        })
    }

    /// Run a function with access to the data in the related process for the
    /// related Grant, along with a [`GrantRegionAllocator`] to create
    /// additional memory in that process's grant region.
    pub fn enter_with_allocator<F, R>(self, fun: F) -> Result<R, Error>
    where
        F: FnOnce(&mut GrantData<T>, &GrantKernelData, &mut GrantRegionAllocator) -> R,
    {
        // Setting the entered bit is done by the process, atomically.
        let grant_ptr = self.process.enter_grant(self.grant_num)?;

        // Leave the grant on every path out of this function, panics included.
        let _grant_open = GrantEnterLifetimeGuard {
            process: self.process,
            grant_num: self.grant_num,
        };

        let grant_t_size = GrantDataSize(size_of::<T>());
        let alloc_size = KernelManagedLayout::grant_size(
            UpcallItems(Upcalls::COUNT),
            AllowRoItems(AllowROs::COUNT),
            AllowRwItems(AllowRWs::COUNT),
            grant_t_size,
            GrantDataAlign(align_of::<T>()),
        );

        // Safety: the grant is allocated, initialized and entered, so this is
        // the only live view of it.
        let layout = unsafe { KernelManagedLayout::read_from_base(grant_ptr) };
        let (saved_upcalls_slice, saved_allow_ro_slice, saved_allow_rw_slice) =
            layout.get_resource_slices();
        let grant_data = unsafe {
            KernelManagedLayout::offset_of_grant_data_t(grant_ptr, alloc_size, grant_t_size)
                .cast::<T>()
                .as_mut()
        };

        let mut grant_data = GrantData::new(grant_data);
        let kernel_data = GrantKernelData::new(
            saved_upcalls_slice,
            saved_allow_ro_slice,
            saved_allow_rw_slice,
            self.driver_num,
            self.process,
        );
        let mut allocator = GrantRegionAllocator {
            processid: self.process.processid(),
        };

        Ok(fun(&mut grant_data, &kernel_data, &mut allocator))
    }
}

/// Grant which was dynamically allocated in a particular app's memory.
pub struct CustomGrant<T> {
    /// An identifier for this custom grant within a process's grant region.
    ///
    /// Here, this is an opaque reference that Process uses to access the
    /// custom grant allocation. This setup ensures that Process owns the grant
    /// memory.
    identifier: ProcessCustomGrantIdentifier,

    /// Identifier for the process where this custom grant is allocated.
    processid: ProcessId,

    /// Used to keep the Rust type of the grant.
    _phantom: PhantomData<T>,
}

impl<T> CustomGrant<T> {
    fn new(identifier: ProcessCustomGrantIdentifier, processid: ProcessId) -> Self {
        CustomGrant {
            identifier,
            processid,
            _phantom: PhantomData,
        }
    }

    /// Helper function to get the [`ProcessId`] from the custom grant.
    pub fn processid(&self) -> ProcessId {
        self.processid
    }

    /// Gives access to inner data within the given closure.
    ///
    /// If the process has since been terminated or restarted this returns an
    /// error and `fun` is not run.
    ///
    /// Because this function requires `&mut self`, it should be impossible to
    /// access the inner data of a given `CustomGrant` reentrantly. Thus the
    /// reentrance detection we use for non-custom grants is not needed here.
    pub fn enter<F, R>(&mut self, fun: F) -> Result<R, Error>
    where
        F: FnOnce(GrantData<'_, T>) -> R,
    {
        self.processid
            .kernel
            .process_map_or(Err(Error::NoSuchApp), self.processid, |process| {
                let grant_ptr = process.enter_custom_grant(self.identifier)?;

                // Safety: the memory was written with a valid `T` by the
                // allocator, and `&mut self` keeps this the only reference.
                let custom_grant = unsafe { grant_ptr.cast::<T>().as_mut() };
                Ok(fun(GrantData::new(custom_grant)))
            })
    }
}

/// Tool for allocating additional memory regions in a process's grant region.
///
/// This is optionally provided along with a grant so that if a capsule needs
/// per-process dynamic allocation it can allocate additional memory.
pub struct GrantRegionAllocator {
    /// The process the allocator will allocate memory from.
    processid: ProcessId,
}

impl GrantRegionAllocator {
    /// Allocates a new [`CustomGrant`] initialized using the given closure.
    ///
    /// The closure will be called exactly once, and the result will be used to
    /// initialize the owned value.
    pub fn alloc_with<T, F>(&mut self, init: F) -> Result<CustomGrant<T>, Error>
    where
        F: FnOnce() -> T,
    {
        let (custom_grant_identifier, typed_ptr) = self.alloc_n_raw::<T>(1)?;

        // Safety: the allocation is sized and aligned for `T` and unused.
        unsafe {
            write(typed_ptr.as_ptr(), init());
        }

        Ok(CustomGrant::new(custom_grant_identifier, self.processid))
    }

    /// Allocates a slice of n instances of a given type. Each instance is
    /// initialized using the provided function.
    ///
    /// The provided function will be called exactly `n` times, and will be
    /// passed the index it's initializing, from `0` through `NUM_ITEMS - 1`.
    pub fn alloc_n_with<T, F, const NUM_ITEMS: usize>(
        &mut self,
        mut init: F,
    ) -> Result<CustomGrant<[T; NUM_ITEMS]>, Error>
    where
        F: FnMut(usize) -> T,
    {
        let (custom_grant_identifier, typed_ptr) = self.alloc_n_raw::<T>(NUM_ITEMS)?;

        for i in 0..NUM_ITEMS {
            // Safety: the allocation holds `NUM_ITEMS` items of `T`.
            unsafe {
                write(typed_ptr.as_ptr().add(i), init(i));
            }
        }

        Ok(CustomGrant::new(custom_grant_identifier, self.processid))
    }

    fn alloc_n_raw<T>(
        &mut self,
        num_items: usize,
    ) -> Result<(ProcessCustomGrantIdentifier, NonNull<T>), Error> {
        let (custom_grant_identifier, raw_ptr) =
            self.alloc_n_raw_inner(num_items, size_of::<T>(), align_of::<T>())?;
        Ok((custom_grant_identifier, raw_ptr.cast::<T>()))
    }

    fn alloc_n_raw_inner(
        &mut self,
        num_items: usize,
        single_alloc_size: usize,
        alloc_align: usize,
    ) -> Result<(ProcessCustomGrantIdentifier, NonNull<u8>), Error> {
        let alloc_size = single_alloc_size
            .checked_mul(num_items)
            .ok_or(Error::OutOfMemory)?;
        self.processid
            .kernel
            .process_map_or(Err(Error::NoSuchApp), self.processid, |process| {
                process
                    .allocate_custom_grant(alloc_size, alloc_align)
                    .ok_or(Error::OutOfMemory)
            })
    }
}

/// Type for storing an object of type T in process memory that is only
/// accessible by the kernel.
///
/// A single `Grant` can allocate space for one object of type T for each
/// process on the board. Each allocated object will reside in the grant
/// region belonging to the process that the object is allocated for. The
/// `Grant` type is used to get access to `ProcessGrant`s, which are tied to a
/// specific process and provide access to the memory object allocated for
/// that process.
pub struct Grant<T, Upcalls: UpcallSize, AllowROs: AllowRoSize, AllowRWs: AllowRwSize> {
    /// Hold a reference to the core kernel so we can iterate processes.
    pub(crate) kernel: &'static Kernel,

    /// Keep track of the syscall driver number assigned to the capsule that is
    /// using this grant. This allows us to uniquely identify upcalls stored in
    /// this grant.
    driver_num: usize,

    /// The identifier for this grant. Having an identifier allows the Process
    /// implementation to lookup the memory for this grant in the specific
    /// process.
    grant_num: usize,

    /// Used to store the Rust types for grant.
    ptr: PhantomData<(T, Upcalls, AllowROs, AllowRWs)>,
}

impl<T, Upcalls: UpcallSize, AllowROs: AllowRoSize, AllowRWs: AllowRwSize>
    Grant<T, Upcalls, AllowROs, AllowRWs>
{
    /// Create a new `Grant` type which allows a capsule to store
    /// process-specific data for each process in the process's memory region.
    ///
    /// This must only be called from the main kernel so that it can ensure
    /// that `grant_index` is a valid index.
    pub(crate) fn new(kernel: &'static Kernel, driver_num: usize, grant_index: usize) -> Self {
        Self {
            kernel,
            driver_num,
            grant_num: grant_index,
            ptr: PhantomData,
        }
    }

    /// The driver number this grant stores upcalls and buffers for.
    pub fn driver_num(&self) -> usize {
        self.driver_num
    }

    /// Get this grant's memory in `processid`, allocating it first if the
    /// process does not have it yet. `init` produces the initial value and is
    /// only called when new memory is needed.
    ///
    /// Calling this again for the same process returns the same memory and
    /// does not grow the grant region.
    ///
    /// Fails with `Error::NoSuchApp` if `processid` is stale,
    /// `Error::InactiveApp` if the process is not alive and
    /// `Error::OutOfMemory` if the grant region cannot grow enough.
    pub fn allocate_or_get<F>(
        &self,
        processid: ProcessId,
        init: F,
    ) -> Result<ProcessGrant<'_, T, Upcalls, AllowROs, AllowRWs>, Error>
    where
        F: FnOnce() -> T,
    {
        let process = self
            .kernel
            .get_process(processid)
            .ok_or(Error::NoSuchApp)?;
        ProcessGrant::allocate_or_get(self, process, init)
    }

    /// Enter the grant for a specific process.
    ///
    /// This does not allocate: if the grant does not exist in the process
    /// `Error::NoGrant` is returned. If the grant is already entered,
    /// `Error::AlreadyEntered` is returned and `fun` does not run.
    pub fn enter<F, R>(&self, processid: ProcessId, fun: F) -> Result<R, Error>
    where
        F: FnOnce(&mut GrantData<T>, &GrantKernelData) -> R,
    {
        let process = self
            .kernel
            .get_process(processid)
            .ok_or(Error::NoSuchApp)?;
        ProcessGrant::new_if_allocated(self, process)?.enter(fun)
    }

    /// Enter the grant for a specific process with access to an allocator.
    ///
    /// This follows the same rules as [`Grant::enter`].
    pub fn enter_with_allocator<F, R>(&self, processid: ProcessId, fun: F) -> Result<R, Error>
    where
        F: FnOnce(&mut GrantData<T>, &GrantKernelData, &mut GrantRegionAllocator) -> R,
    {
        let process = self
            .kernel
            .get_process(processid)
            .ok_or(Error::NoSuchApp)?;
        ProcessGrant::new_if_allocated(self, process)?.enter_with_allocator(fun)
    }

    /// Handle for scheduling upcall `subscribe_num` of `processid` from
    /// outside of a grant entry.
    pub fn upcall_handle(
        &self,
        processid: ProcessId,
        subscribe_num: usize,
    ) -> Result<UpcallHandle, UpcallError> {
        if subscribe_num < Upcalls::COUNT as usize {
            Ok(UpcallHandle::new(processid, self.driver_num, subscribe_num))
        } else {
            Err(UpcallError::InvalidSubscribeNum)
        }
    }

    /// Call a function on every active process that has this grant
    /// allocated.
    ///
    /// Grants that are already entered further up the call stack are not
    /// passed to `fun` but counted in the returned summary.
    pub fn each<F>(&self, mut fun: F) -> EachSummary
    where
        F: FnMut(ProcessId, &mut GrantData<T>, &GrantKernelData),
    {
        let mut summary = EachSummary::default();
        for pg in self.iter() {
            let processid = pg.processid();
            summary.record(pg.enter(|data, kernel_data| fun(processid, data, kernel_data)));
        }
        summary
    }

    /// Get an iterator over all processes and their active grant regions for
    /// this particular grant.
    ///
    /// Calling this function when an [`Iter`] for a grant is currently in use
    /// is allowed; entering the same process's grant from both is what
    /// fails.
    pub fn iter(&self) -> Iter<'_, T, Upcalls, AllowROs, AllowRWs> {
        Iter {
            grant: self,
            subiter: self.kernel.get_process_iter(),
        }
    }
}

/// Type to iterate `ProcessGrant`s across processes.
pub struct Iter<'a, T: 'a, Upcalls: UpcallSize, AllowROs: AllowRoSize, AllowRWs: AllowRwSize> {
    /// The grant type to use.
    grant: &'a Grant<T, Upcalls, AllowROs, AllowRWs>,

    /// Iterator over valid processes.
    subiter: ProcessIter<'a>,
}

impl<'a, T, Upcalls: UpcallSize, AllowROs: AllowRoSize, AllowRWs: AllowRwSize> Iterator
    for Iter<'a, T, Upcalls, AllowROs, AllowRWs>
{
    type Item = ProcessGrant<'a, T, Upcalls, AllowROs, AllowRWs>;

    fn next(&mut self) -> Option<Self::Item> {
        let grant = self.grant;
        // Get the next `ProcessId` from the kernel processes array that is
        // setup to use this grant. Since the iterator itself is saved calling
        // this function again will start where we left off.
        self.subiter
            .find_map(|process| ProcessGrant::new_if_allocated(grant, process).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::processbuffer::ReadableProcessBuffer;
    use crate::test_util::{self, subscribe, Counter, COUNTER_DRIVER};

    use core::ptr;

    #[test]
    fn layout_pads_grant_data() {
        // Counter word plus one upcall on a 64-bit host, then a u64.
        let size = KernelManagedLayout::grant_size(
            UpcallItems(1),
            AllowRoItems(0),
            AllowRwItems(0),
            GrantDataSize(size_of::<u64>()),
            GrantDataAlign(align_of::<u64>()),
        );
        assert_eq!(size, 3 * size_of::<usize>() + size_of::<u64>());
        assert_eq!(
            KernelManagedLayout::grant_align(GrantDataAlign(1)),
            align_of::<usize>()
        );
    }

    #[test]
    fn allocate_or_get_is_idempotent() {
        let env = test_util::env(1);
        let p = env.process(0);
        let grant = &env.counter.grant;

        let before = p.grant_region_size();
        let first = grant
            .allocate_or_get(p.processid(), || Counter { value: 7 })
            .map(|pg| pg.enter(|c, _| (&**c as *const Counter) as usize));
        let after_first = p.grant_region_size();
        let second = grant
            .allocate_or_get(p.processid(), || Counter { value: 99 })
            .map(|pg| pg.enter(|c, _| (c.value, (&**c as *const Counter) as usize)));

        assert!(after_first > before);
        assert_eq!(p.grant_region_size(), after_first);
        let first_addr = first.unwrap().unwrap();
        assert_eq!(second.unwrap().unwrap(), (7, first_addr));
    }

    #[test]
    fn enter_does_not_allocate() {
        let env = test_util::env(1);
        let p = env.process(0);
        let grant = &env.counter.grant;

        assert_eq!(grant.enter(p.processid(), |_, _| ()), Err(Error::NoGrant));
        assert_eq!(p.grant_allocated_count(), Some(0));
    }

    #[test]
    fn reenter_reports_already_entered() {
        let env = test_util::env(1);
        let p = env.process(0);
        let grant = &env.counter.grant;
        let pid = p.processid();
        assert!(grant.allocate_or_get(pid, Counter::default).is_ok());

        let inner = grant.enter(pid, |outer, _| {
            outer.value = 1;
            grant.enter(pid, |c, _| c.value += 1)
        });
        assert_eq!(inner, Ok(Err(Error::AlreadyEntered)));
        assert_eq!(grant.enter(pid, |c, _| c.value), Ok(1));
    }

    #[test]
    fn two_drivers_get_disjoint_slots() {
        let env = test_util::env(1);
        let p = env.process(0);
        let a = &env.counter.grant;
        let b = &env.second.grant;
        let pid = p.processid();

        let addr_a = a
            .allocate_or_get(pid, Counter::default)
            .and_then(|pg| pg.enter(|c, _| (&**c as *const Counter) as usize))
            .unwrap();
        let addr_b = b
            .allocate_or_get(pid, Counter::default)
            .and_then(|pg| pg.enter(|c, _| (&**c as *const Counter) as usize))
            .unwrap();
        let size = size_of::<Counter>();

        assert!(addr_a + size <= addr_b || addr_b + size <= addr_a);
        for addr in [addr_a, addr_b] {
            assert!(addr >= p.kernel_memory_break() as usize);
            assert!(addr + size <= p.mem_end() as usize);
        }
        assert!(p.app_memory_break() <= p.kernel_memory_break());
        assert_eq!(p.grant_allocated_count(), Some(2));
    }

    #[test]
    fn allocation_fails_cleanly_when_region_full() {
        let env = test_util::env(1);
        let p = env.process(0);
        let big = &env.large.grant;
        let before = p.grant_region_size();

        assert_eq!(
            big.allocate_or_get(p.processid(), || [0u8; test_util::LARGE_GRANT])
                .map(|_| ()),
            Err(Error::OutOfMemory)
        );
        assert_eq!(p.grant_is_allocated(big.grant_num), Some(false));
        assert_eq!(p.grant_region_size(), before);
    }

    #[test]
    fn each_counts_entered_and_skipped() {
        let env = test_util::env(3);
        let grant = &env.counter.grant;
        let p0 = env.process(0).processid();
        let p1 = env.process(1).processid();
        assert!(grant.allocate_or_get(p0, Counter::default).is_ok());
        assert!(grant.allocate_or_get(p1, Counter::default).is_ok());

        let summary = grant.each(|_, c, _| c.value += 1);
        assert_eq!(
            summary,
            EachSummary {
                entered: 2,
                already_entered: 0
            }
        );

        let nested = grant.enter(p0, |_, _| grant.each(|_, c, _| c.value += 10));
        assert_eq!(
            nested,
            Ok(EachSummary {
                entered: 1,
                already_entered: 1
            })
        );
        assert_eq!(grant.enter(p0, |c, _| c.value), Ok(1));
        assert_eq!(grant.enter(p1, |c, _| c.value), Ok(11));
    }

    #[test]
    fn each_counts_only_reentry_as_skipped() {
        let mut summary = EachSummary::default();
        summary.record(Ok(()));
        summary.record(Err(Error::AlreadyEntered));
        summary.record(Err(Error::InactiveApp));
        summary.record(Err(Error::NoGrant));
        assert_eq!(
            summary,
            EachSummary {
                entered: 1,
                already_entered: 1
            }
        );
    }

    #[test]
    fn upcall_handle_bounds() {
        let env = test_util::env(1);
        let grant = &env.counter.grant;
        let pid = env.process(0).processid();
        assert!(grant.upcall_handle(pid, 0).is_ok());
        assert_eq!(
            grant.upcall_handle(pid, 2),
            Err(UpcallError::InvalidSubscribeNum)
        );
    }

    #[test]
    fn handle_follows_the_current_subscription() {
        let env = test_util::env(1);
        assert!(env.deliver(0).is_some());
        let grant = &env.counter.grant;
        let pid = env.process(0).processid();
        let first = env.flash(0, 0x10);
        let second = env.flash(0, 0x20);

        env.syscall(0, subscribe(COUNTER_DRIVER, 0, first, 1));
        let handle = grant.upcall_handle(pid, 0).unwrap();
        env.syscall(0, subscribe(COUNTER_DRIVER, 0, second, 2));

        assert_eq!(handle.schedule((4, 5, 6)), Ok(()));
        let call = env.deliver(0).unwrap();
        assert_eq!(call.pc, second as usize);
        assert_eq!(call.argument0, 4);
        assert_eq!(call.argument3, 2);

        // Unsubscribed: the handle schedules nothing.
        env.syscall(0, subscribe(COUNTER_DRIVER, 0, ptr::null_mut(), 0));
        assert_eq!(handle.schedule((1, 2, 3)), Ok(()));
        assert_eq!(env.process(0).pending_tasks(), 0);

        // The handle belongs to the old instance.
        env.restart(0);
        assert_eq!(
            handle.schedule((1, 2, 3)),
            Err(UpcallError::KernelError)
        );
    }

    #[test]
    fn handle_schedule_while_entered_fails() {
        let env = test_util::env(1);
        let grant = &env.counter.grant;
        let pid = env.process(0).processid();
        assert!(grant.allocate_or_get(pid, Counter::default).is_ok());
        let handle = grant.upcall_handle(pid, 0).unwrap();
        let queued = env.process(0).pending_tasks();

        assert_eq!(
            grant.enter(pid, |_, _| handle.schedule((1, 2, 3))),
            Ok(Err(UpcallError::GrantEntered))
        );
        // Nothing subscribed, so scheduling from outside is a silent success.
        assert_eq!(handle.schedule((1, 2, 3)), Ok(()));
        assert_eq!(env.process(0).pending_tasks(), queued);
    }

    #[test]
    fn kernel_data_buffers_default_empty() {
        let env = test_util::env(1);
        let grant = &env.counter.grant;
        let pid = env.process(0).processid();
        assert!(grant.allocate_or_get(pid, Counter::default).is_ok());

        let lens = grant.enter(pid, |_, kernel_data| {
            let ro = kernel_data.get_readonly_processbuffer(0).map(|b| b.len());
            let rw = kernel_data.get_readwrite_processbuffer(0).map(|b| b.len());
            let missing = kernel_data.get_readwrite_processbuffer(5).map(|b| b.len());
            (ro, rw, missing)
        });
        assert_eq!(lens, Ok((Ok(0), Ok(0), Err(Error::AddressOutOfBounds))));
    }

    #[test]
    fn custom_grant_lives_in_grant_region() {
        let env = test_util::env(1);
        let p = env.process(0);
        let grant = &env.counter.grant;
        let pid = p.processid();
        assert!(grant.allocate_or_get(pid, Counter::default).is_ok());

        let mut custom = grant
            .enter_with_allocator(pid, |_, _, allocator| {
                allocator.alloc_n_with::<u32, _, 4>(|i| i as u32 * 3)
            })
            .unwrap()
            .unwrap();
        assert_eq!(custom.enter(|items| items[3]), Ok(9));
        assert_eq!(custom.processid(), pid);
    }
}
