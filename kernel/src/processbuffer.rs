// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Data structures for passing application memory to the kernel.
//!
//! A process shares read-write or read-only buffers with the kernel through
//! the allow system calls. The kernel checks that read-write buffers lie within
//! the process's RAM, and that read-only buffers lie within its RAM or flash,
//! before a [`ReadWriteProcessBuffer`] or [`ReadOnlyProcessBuffer`] is ever
//! constructed.
//!
//! Buffers carry the [`ProcessId`] of their owner. Every access goes through a
//! closure ([`ReadableProcessBuffer::enter`], [`WriteableProcessBuffer::mut_enter`])
//! which first checks that the owner still exists and is still alive, so an
//! extension that kept a buffer after its process terminated or restarted gets
//! an error instead of a view of reclaimed memory. Inside the closure the
//! memory is presented as a [`ReadableProcessSlice`] or
//! [`WriteableProcessSlice`], slices of [`Cell`]s, so overlapping views never
//! produce aliased Rust references.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ops::{Deref, Index, Range, RangeFrom, RangeTo};

use crate::capabilities;
use crate::process::{self, ProcessId};
use crate::ErrorCode;

/// Build a [`ReadableProcessSlice`] over `[ptr, ptr + len)`.
///
/// A zero-length buffer yields an empty slice over a dangling pointer, whatever
/// `ptr` holds, since processes may pass any address with length zero.
///
/// # Safety
///
/// If `len != 0`, `[ptr, ptr + len)` must be readable process memory that
/// stays allocated to the process for `'a` and is not backing any Rust
/// allocation other than process slices. Nothing outside this kernel may write
/// to it during `'a`.
unsafe fn raw_processbuf_to_roprocessslice<'a>(
    ptr: *const u8,
    len: usize,
) -> &'a ReadableProcessSlice {
    let bytes: &[ReadableProcessByte] = if len == 0 {
        core::slice::from_raw_parts(core::ptr::NonNull::dangling().as_ptr(), 0)
    } else {
        core::slice::from_raw_parts(ptr.cast::<ReadableProcessByte>(), len)
    };
    // `ReadableProcessSlice` is a `#[repr(transparent)]` wrapper.
    core::mem::transmute::<&[ReadableProcessByte], &ReadableProcessSlice>(bytes)
}

/// Build a [`WriteableProcessSlice`] over `[ptr, ptr + len)`.
///
/// # Safety
///
/// Same as [`raw_processbuf_to_roprocessslice`], and the memory must also be
/// writable.
unsafe fn raw_processbuf_to_rwprocessslice<'a>(
    ptr: *mut u8,
    len: usize,
) -> &'a WriteableProcessSlice {
    let cells: &[Cell<u8>] = if len == 0 {
        core::slice::from_raw_parts(core::ptr::NonNull::dangling().as_ptr(), 0)
    } else {
        core::slice::from_raw_parts(ptr.cast::<Cell<u8>>(), len)
    };
    core::mem::transmute::<&[Cell<u8>], &WriteableProcessSlice>(cells)
}

/// Run `fun` if the process owning a buffer is still present and alive.
fn with_live_owner<R>(
    process_id: Option<ProcessId>,
    fun: impl FnOnce() -> R,
) -> Result<R, process::Error> {
    let pid = process_id.ok_or(process::Error::NoSuchApp)?;
    pid.kernel
        .process_map_or(Err(process::Error::NoSuchApp), pid, |process| {
            if process.is_running() {
                Ok(fun())
            } else {
                Err(process::Error::InactiveApp)
            }
        })
}

/// A readable region of userspace process memory.
///
/// Implemented by both [`ReadOnlyProcessBuffer`] and
/// [`ReadWriteProcessBuffer`].
///
/// # Safety
///
/// Users of this trait trust that [`ReadableProcessBuffer::ptr`] follows the
/// semantics documented on it.
pub unsafe trait ReadableProcessBuffer {
    /// Length of the memory region.
    ///
    /// Returns 0 if the owning process is gone or no longer alive, and for a
    /// default buffer.
    fn len(&self) -> usize;

    /// Pointer to the first byte of the region, or null if the region was
    /// shared with length zero.
    ///
    /// The memory must not be written through this pointer, and callers must
    /// not create references from it while the buffer is entered.
    fn ptr(&self) -> *const u8;

    /// Applies a function to the (read only) process slice reference
    /// pointed to by the process buffer.
    ///
    /// Returns `Err(process::Error::NoSuchApp)` if the owning process no
    /// longer exists (or this is a default buffer) and
    /// `Err(process::Error::InactiveApp)` if it exists but is not alive. The
    /// closure is not run in either case.
    fn enter<F, R>(&self, fun: F) -> Result<R, process::Error>
    where
        F: FnOnce(&ReadableProcessSlice) -> R;
}

/// A readable and writeable region of userspace process memory.
///
/// # Safety
///
/// Implementors guarantee that [`WriteableProcessBuffer::mut_ptr`] points to
/// the same read-write shared region described by
/// [`ReadableProcessBuffer::ptr`] and [`ReadableProcessBuffer::len`].
pub unsafe trait WriteableProcessBuffer: ReadableProcessBuffer {
    /// Mutable pointer to the first byte of the region, or null for a
    /// zero-length region.
    fn mut_ptr(&self) -> *mut u8 {
        ReadableProcessBuffer::ptr(self).cast_mut()
    }

    /// Applies a function to the mutable process slice reference
    /// pointed to by the [`ReadWriteProcessBuffer`].
    ///
    /// Fails like [`ReadableProcessBuffer::enter`].
    fn mut_enter<F, R>(&self, fun: F) -> Result<R, process::Error>
    where
        F: FnOnce(&WriteableProcessSlice) -> R;
}

/// Read-only buffer shared by a userspace process.
///
/// Userspace may share overlapping read-only regions under different allow
/// numbers, so access is through [`ReadableProcessSlice`], a slice of cells.
/// A memory barrier before switching to userspace is still required, as the
/// compiler may reorder accesses even through [`Cell`]s.
pub struct ReadOnlyProcessBuffer {
    ptr: *const u8,
    len: usize,
    process_id: Option<ProcessId>,
}

impl ReadOnlyProcessBuffer {
    /// # Safety
    ///
    /// See [`ReadOnlyProcessBuffer::new_external`].
    pub(crate) unsafe fn new(ptr: *const u8, len: usize, process_id: ProcessId) -> Self {
        ReadOnlyProcessBuffer {
            ptr,
            len,
            process_id: Some(process_id),
        }
    }

    /// Construct a new [`ReadOnlyProcessBuffer`] over a given pointer
    /// and length.
    ///
    /// Publicly accessible constructor, which requires the
    /// [`capabilities::ExternalProcessCapability`] capability. This
    /// is provided to allow implementations of the
    /// [`Process`](crate::process::Process) trait outside of the
    /// `kernel` crate.
    ///
    /// # Safety requirements
    ///
    /// If the length is `0`, an arbitrary pointer may be passed into `ptr`.
    ///
    /// If the length is not `0`, `[ptr, ptr + len)` must be memory of the
    /// process identified by `process_id`, readable by it, and stay allocated
    /// to it for the entire lifetime of the buffer. It must not overlap kernel
    /// memory or the memory of other processes.
    pub unsafe fn new_external(
        ptr: *const u8,
        len: usize,
        process_id: ProcessId,
        _cap: &dyn capabilities::ExternalProcessCapability,
    ) -> Self {
        Self::new(ptr, len, process_id)
    }

    /// Consumes the buffer, returning its constituent pointer and size, for
    /// handing the values back across the kernel-to-user boundary.
    pub(crate) fn consume(self) -> (*const u8, usize) {
        (self.ptr, self.len)
    }

    /// The address and length as shared, without a liveness check.
    pub(crate) fn region(&self) -> (usize, usize) {
        (self.ptr as usize, self.len)
    }
}

unsafe impl ReadableProcessBuffer for ReadOnlyProcessBuffer {
    fn len(&self) -> usize {
        with_live_owner(self.process_id, || self.len).unwrap_or(0)
    }

    fn ptr(&self) -> *const u8 {
        if self.len == 0 {
            core::ptr::null::<u8>()
        } else {
            self.ptr
        }
    }

    fn enter<F, R>(&self, fun: F) -> Result<R, process::Error>
    where
        F: FnOnce(&ReadableProcessSlice) -> R,
    {
        // Safety: the process is alive, so its memory still belongs to it.
        // `Process` never lets the break drop below memory that was once
        // allowed, so the whole range is still process memory.
        with_live_owner(self.process_id, || {
            fun(unsafe { raw_processbuf_to_roprocessslice(self.ptr, self.len) })
        })
    }
}

impl Default for ReadOnlyProcessBuffer {
    fn default() -> Self {
        ReadOnlyProcessBuffer {
            ptr: core::ptr::null::<u8>(),
            len: 0,
            process_id: None,
        }
    }
}

/// Provides access to a [`ReadOnlyProcessBuffer`] with a restricted lifetime.
/// This automatically dereferences into a ReadOnlyProcessBuffer
pub struct ReadOnlyProcessBufferRef<'a> {
    buf: ReadOnlyProcessBuffer,
    _phantom: PhantomData<&'a ()>,
}

impl ReadOnlyProcessBufferRef<'_> {
    /// # Safety
    ///
    /// See [`ReadOnlyProcessBuffer::new_external`]. The buffer must stay valid
    /// for the lifetime chosen by the caller.
    pub(crate) unsafe fn new(ptr: *const u8, len: usize, process_id: ProcessId) -> Self {
        Self {
            buf: ReadOnlyProcessBuffer::new(ptr, len, process_id),
            _phantom: PhantomData,
        }
    }
}

impl Deref for ReadOnlyProcessBufferRef<'_> {
    type Target = ReadOnlyProcessBuffer;
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

/// Read-writable buffer shared by a userspace process.
///
/// Access is through [`WriteableProcessSlice`], a slice of cells, as userspace
/// may have shared the same memory read-only under another allow number.
pub struct ReadWriteProcessBuffer {
    ptr: *mut u8,
    len: usize,
    process_id: Option<ProcessId>,
}

impl ReadWriteProcessBuffer {
    /// # Safety
    ///
    /// See [`ReadWriteProcessBuffer::new_external`].
    pub(crate) unsafe fn new(ptr: *mut u8, len: usize, process_id: ProcessId) -> Self {
        ReadWriteProcessBuffer {
            ptr,
            len,
            process_id: Some(process_id),
        }
    }

    /// Construct a new [`ReadWriteProcessBuffer`] over a given pointer and
    /// length, for [`Process`](crate::process::Process) implementations
    /// outside of the kernel crate.
    ///
    /// # Safety requirements
    ///
    /// As for [`ReadOnlyProcessBuffer::new_external`], and the memory must
    /// be writable by the process.
    pub unsafe fn new_external(
        ptr: *mut u8,
        len: usize,
        process_id: ProcessId,
        _cap: &dyn capabilities::ExternalProcessCapability,
    ) -> Self {
        Self::new(ptr, len, process_id)
    }

    /// Consumes the buffer, returning its constituent pointer and size.
    pub(crate) fn consume(self) -> (*mut u8, usize) {
        (self.ptr, self.len)
    }

    /// The address and length as shared, without a liveness check.
    pub(crate) fn region(&self) -> (usize, usize) {
        (self.ptr as usize, self.len)
    }

    /// This is a `const` version of `Default::default` with the same
    /// semantics.
    ///
    /// Having a const initializer allows initializing a fixed-size array with
    /// default values without the struct being marked `Copy` as such:
    ///
    /// ```
    /// use kernel::processbuffer::ReadWriteProcessBuffer;
    /// const DEFAULT_RWPROCBUF_VAL: ReadWriteProcessBuffer
    ///     = ReadWriteProcessBuffer::const_default();
    /// let my_array = [DEFAULT_RWPROCBUF_VAL; 12];
    /// ```
    pub const fn const_default() -> Self {
        Self {
            ptr: core::ptr::null_mut::<u8>(),
            len: 0,
            process_id: None,
        }
    }
}

unsafe impl ReadableProcessBuffer for ReadWriteProcessBuffer {
    fn len(&self) -> usize {
        with_live_owner(self.process_id, || self.len).unwrap_or(0)
    }

    fn ptr(&self) -> *const u8 {
        if self.len == 0 {
            core::ptr::null::<u8>()
        } else {
            self.ptr
        }
    }

    fn enter<F, R>(&self, fun: F) -> Result<R, process::Error>
    where
        F: FnOnce(&ReadableProcessSlice) -> R,
    {
        // Safety: as for `ReadOnlyProcessBuffer::enter`.
        with_live_owner(self.process_id, || {
            fun(unsafe { raw_processbuf_to_roprocessslice(self.ptr, self.len) })
        })
    }
}

unsafe impl WriteableProcessBuffer for ReadWriteProcessBuffer {
    fn mut_enter<F, R>(&self, fun: F) -> Result<R, process::Error>
    where
        F: FnOnce(&WriteableProcessSlice) -> R,
    {
        // Safety: the owner is alive and the range was validated as writable
        // process memory when the buffer was built.
        with_live_owner(self.process_id, || {
            fun(unsafe { raw_processbuf_to_rwprocessslice(self.ptr, self.len) })
        })
    }
}

impl Default for ReadWriteProcessBuffer {
    fn default() -> Self {
        Self::const_default()
    }
}

/// Provides access to a [`ReadWriteProcessBuffer`] with a restricted lifetime.
/// This automatically dereferences into a ReadWriteProcessBuffer
pub struct ReadWriteProcessBufferRef<'a> {
    buf: ReadWriteProcessBuffer,
    _phantom: PhantomData<&'a ()>,
}

impl ReadWriteProcessBufferRef<'_> {
    /// # Safety
    ///
    /// See [`ReadWriteProcessBuffer::new_external`].
    pub(crate) unsafe fn new(ptr: *mut u8, len: usize, process_id: ProcessId) -> Self {
        Self {
            buf: ReadWriteProcessBuffer::new(ptr, len, process_id),
            _phantom: PhantomData,
        }
    }
}

impl Deref for ReadWriteProcessBufferRef<'_> {
    type Target = ReadWriteProcessBuffer;
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

/// Indexing into process slices, mirroring `core::slice::SliceIndex`.
pub trait ProcessSliceIndex<PB: ?Sized>: private_process_slice_index::Sealed {
    type Output: ?Sized;
    fn get(self, slice: &PB) -> Option<&Self::Output>;
    fn index(self, slice: &PB) -> &Self::Output;
}

mod private_process_slice_index {
    use core::ops::{Range, RangeFrom, RangeTo};

    pub trait Sealed {}

    impl Sealed for usize {}
    impl Sealed for Range<usize> {}
    impl Sealed for RangeFrom<usize> {}
    impl Sealed for RangeTo<usize> {}
}

/// Read-only wrapper around a [`Cell`], exposing only reads.
#[repr(transparent)]
pub struct ReadableProcessByte {
    cell: Cell<u8>,
}

impl ReadableProcessByte {
    #[inline]
    pub fn get(&self) -> u8 {
        self.cell.get()
    }
}

/// Readable slice of process memory.
///
/// Only obtainable through [`ReadableProcessBuffer::enter`], which bounds its
/// lifetime to the closure.
#[repr(transparent)]
pub struct ReadableProcessSlice {
    slice: [ReadableProcessByte],
}

fn cast_byte_slice_to_process_slice(byte_slice: &[ReadableProcessByte]) -> &ReadableProcessSlice {
    // Safety: `ReadableProcessSlice` is a transparent wrapper around the
    // slice type.
    unsafe { core::mem::transmute::<&[ReadableProcessByte], &ReadableProcessSlice>(byte_slice) }
}

// Lets code written against process slices also accept kernel buffers.
impl<'a> From<&'a [u8]> for &'a ReadableProcessSlice {
    fn from(val: &'a [u8]) -> Self {
        // Safety: `u8` and `ReadableProcessByte` share a layout, and the
        // shared borrow is carried over unchanged.
        unsafe { core::mem::transmute::<&'a [u8], &'a ReadableProcessSlice>(val) }
    }
}

#[inline(never)]
#[cold]
#[track_caller]
fn len_mismatch_fail(dst_len: usize, src_len: usize) -> ! {
    panic!(
        "source slice length ({}) does not match destination slice length ({})",
        src_len, dst_len,
    );
}

impl ReadableProcessSlice {
    /// Copy the contents into `dest`.
    ///
    /// # Panics
    ///
    /// If `self.len() != dest.len()`.
    pub fn copy_to_slice(&self, dest: &mut [u8]) {
        if self.copy_to_slice_or_err(dest).is_err() {
            len_mismatch_fail(dest.len(), self.len());
        }
    }

    /// Copy the contents into `dest`, or `Err(ErrorCode::SIZE)` if the lengths
    /// differ.
    pub fn copy_to_slice_or_err(&self, dest: &mut [u8]) -> Result<(), ErrorCode> {
        if self.len() != dest.len() {
            return Err(ErrorCode::SIZE);
        }
        for (d, s) in dest.iter_mut().zip(self.slice.iter()) {
            *d = s.get();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, ReadableProcessByte> {
        self.slice.iter()
    }

    pub fn chunks(
        &self,
        chunk_size: usize,
    ) -> impl core::iter::Iterator<Item = &ReadableProcessSlice> {
        self.slice
            .chunks(chunk_size)
            .map(cast_byte_slice_to_process_slice)
    }

    /// Bounds-checked access to a byte or subslice.
    pub fn get<I: ProcessSliceIndex<Self>>(
        &self,
        index: I,
    ) -> Option<&<I as ProcessSliceIndex<Self>>::Output> {
        index.get(self)
    }
}

/// Read-write slice of process memory.
///
/// Only obtainable through [`WriteableProcessBuffer::mut_enter`].
#[repr(transparent)]
pub struct WriteableProcessSlice {
    slice: [Cell<u8>],
}

fn cast_cell_slice_to_process_slice(cell_slice: &[Cell<u8>]) -> &WriteableProcessSlice {
    // Safety: `WriteableProcessSlice` is a transparent wrapper around the
    // slice type.
    unsafe { core::mem::transmute::<&[Cell<u8>], &WriteableProcessSlice>(cell_slice) }
}

// Lets code written against process slices also accept kernel buffers.
impl<'a> From<&'a mut [u8]> for &'a WriteableProcessSlice {
    fn from(val: &'a mut [u8]) -> Self {
        cast_cell_slice_to_process_slice(Cell::from_mut(val).as_slice_of_cells())
    }
}

impl WriteableProcessSlice {
    /// Copy the contents into `dest`.
    ///
    /// # Panics
    ///
    /// If `self.len() != dest.len()`.
    pub fn copy_to_slice(&self, dest: &mut [u8]) {
        if self.copy_to_slice_or_err(dest).is_err() {
            len_mismatch_fail(dest.len(), self.len());
        }
    }

    /// Copy the contents into `dest`, or `Err(ErrorCode::SIZE)` if the lengths
    /// differ.
    pub fn copy_to_slice_or_err(&self, dest: &mut [u8]) -> Result<(), ErrorCode> {
        if self.len() != dest.len() {
            return Err(ErrorCode::SIZE);
        }
        for (d, s) in dest.iter_mut().zip(self.slice.iter()) {
            *d = s.get();
        }
        Ok(())
    }

    /// Overwrite the contents with `src`.
    ///
    /// # Panics
    ///
    /// If `self.len() != src.len()`.
    pub fn copy_from_slice(&self, src: &[u8]) {
        if self.copy_from_slice_or_err(src).is_err() {
            len_mismatch_fail(self.len(), src.len());
        }
    }

    /// Overwrite the contents with `src`, or `Err(ErrorCode::SIZE)` if the
    /// lengths differ.
    pub fn copy_from_slice_or_err(&self, src: &[u8]) -> Result<(), ErrorCode> {
        if self.len() != src.len() {
            return Err(ErrorCode::SIZE);
        }
        for (d, s) in self.slice.iter().zip(src.iter()) {
            d.set(*s);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Cell<u8>> {
        self.slice.iter()
    }

    pub fn chunks(
        &self,
        chunk_size: usize,
    ) -> impl core::iter::Iterator<Item = &WriteableProcessSlice> {
        self.slice
            .chunks(chunk_size)
            .map(cast_cell_slice_to_process_slice)
    }

    /// Bounds-checked access to a byte or subslice.
    pub fn get<I: ProcessSliceIndex<Self>>(
        &self,
        index: I,
    ) -> Option<&<I as ProcessSliceIndex<Self>>::Output> {
        index.get(self)
    }
}

macro_rules! process_slice_indexing {
    ($slice:ty, $byte:ty, $cast:ident) => {
        impl ProcessSliceIndex<$slice> for usize {
            type Output = $byte;

            fn get(self, slice: &$slice) -> Option<&Self::Output> {
                slice.slice.get(self)
            }

            fn index(self, slice: &$slice) -> &Self::Output {
                &slice.slice[self]
            }
        }

        impl ProcessSliceIndex<$slice> for Range<usize> {
            type Output = $slice;

            fn get(self, slice: &$slice) -> Option<&Self::Output> {
                slice.slice.get(self).map($cast)
            }

            fn index(self, slice: &$slice) -> &Self::Output {
                $cast(&slice.slice[self])
            }
        }

        impl ProcessSliceIndex<$slice> for RangeFrom<usize> {
            type Output = $slice;

            fn get(self, slice: &$slice) -> Option<&Self::Output> {
                slice.slice.get(self).map($cast)
            }

            fn index(self, slice: &$slice) -> &Self::Output {
                $cast(&slice.slice[self])
            }
        }

        impl ProcessSliceIndex<$slice> for RangeTo<usize> {
            type Output = $slice;

            fn get(self, slice: &$slice) -> Option<&Self::Output> {
                slice.slice.get(self).map($cast)
            }

            fn index(self, slice: &$slice) -> &Self::Output {
                $cast(&slice.slice[self])
            }
        }

        impl<I: ProcessSliceIndex<$slice>> Index<I> for $slice {
            type Output = I::Output;

            fn index(&self, index: I) -> &Self::Output {
                index.index(self)
            }
        }
    };
}

process_slice_indexing!(
    ReadableProcessSlice,
    ReadableProcessByte,
    cast_byte_slice_to_process_slice
);
process_slice_indexing!(
    WriteableProcessSlice,
    Cell<u8>,
    cast_cell_slice_to_process_slice
);

#[cfg(test)]
mod miri_tests {
    use super::*;
    use core::cell::UnsafeCell;

    // Backing memory built of `UnsafeCell`s, suitable for process slices.
    fn backing_ptr<const N: usize>(mem: &[UnsafeCell<u8>; N]) -> *mut u8 {
        mem as *const _ as *mut u8
    }

    #[test]
    fn read_write_through_slice() {
        let memory = [const { UnsafeCell::new(0u8) }; 16];
        let slice = unsafe { raw_processbuf_to_rwprocessslice(backing_ptr(&memory), 16) };

        slice[0].set(42);
        slice[5].set(100);
        assert_eq!(slice[0].get(), 42);
        assert_eq!(slice[5].get(), 100);
        assert_eq!(unsafe { *memory[0].get() }, 42);
    }

    #[test]
    fn overlapping_ro_and_rw_slices() {
        let memory = [const { UnsafeCell::new(0u8) }; 16];
        let ptr = backing_ptr(&memory);
        let ro = unsafe { raw_processbuf_to_roprocessslice(ptr, 16) };
        let rw = unsafe { raw_processbuf_to_rwprocessslice(ptr, 16) };

        let rw_sub = rw.get(2..6).unwrap();
        rw_sub[0].set(55);
        assert_eq!(ro[2].get(), 55);
        assert_eq!(ro.get(..4).unwrap()[2].get(), 55);
    }

    #[test]
    fn zero_length_null_pointer() {
        let ro = unsafe { raw_processbuf_to_roprocessslice(core::ptr::null(), 0) };
        let rw = unsafe { raw_processbuf_to_rwprocessslice(core::ptr::null_mut(), 0) };
        assert_eq!(ro.len(), 0);
        assert_eq!(rw.len(), 0);
        assert!(ro.get(0).is_none());
        assert!(rw.get(0..0).is_some());
    }

    #[test]
    fn out_of_bounds_get() {
        let memory = [const { UnsafeCell::new(0u8) }; 8];
        let slice = unsafe { raw_processbuf_to_roprocessslice(backing_ptr(&memory), 8) };
        assert!(slice.get(8).is_none());
        assert!(slice.get(4..9).is_none());
        assert!(slice.get(8..).is_some());
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_index_panics() {
        let memory = [const { UnsafeCell::new(0u8) }; 8];
        let slice = unsafe { raw_processbuf_to_rwprocessslice(backing_ptr(&memory), 8) };
        let _ = slice[8].get();
    }

    #[test]
    fn copy_in_and_out() {
        let memory = [const { UnsafeCell::new(0u8) }; 4];
        let slice = unsafe { raw_processbuf_to_rwprocessslice(backing_ptr(&memory), 4) };

        slice.copy_from_slice(&[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        slice.copy_to_slice(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(slice.copy_from_slice_or_err(&[1, 2]), Err(ErrorCode::SIZE));
        assert_eq!(
            slice.copy_to_slice_or_err(&mut [0u8; 5]),
            Err(ErrorCode::SIZE)
        );
    }

    #[test]
    #[should_panic(expected = "does not match destination slice length")]
    fn copy_length_mismatch_panics() {
        let memory = [const { UnsafeCell::new(0u8) }; 4];
        let slice = unsafe { raw_processbuf_to_roprocessslice(backing_ptr(&memory), 4) };
        slice.copy_to_slice(&mut [0u8; 3]);
    }

    #[test]
    fn chunks_cover_slice() {
        let mut data = [1u8, 2, 3, 4, 5];
        let slice: &WriteableProcessSlice = (&mut data[..]).into();
        let lens: [usize; 3] = {
            let mut it = slice.chunks(2).map(|c| c.len());
            [it.next().unwrap(), it.next().unwrap(), it.next().unwrap()]
        };
        assert_eq!(lens, [2, 2, 1]);
    }

    #[test]
    fn default_buffers_are_empty() {
        let ro = ReadOnlyProcessBuffer::default();
        let rw = ReadWriteProcessBuffer::default();
        assert_eq!(ro.len(), 0);
        assert!(ro.ptr().is_null());
        assert_eq!(rw.len(), 0);
        assert_eq!(ro.enter(|_| ()), Err(process::Error::NoSuchApp));
        assert_eq!(rw.mut_enter(|_| ()), Err(process::Error::NoSuchApp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::test_util;

    #[test]
    fn buffers_follow_the_owning_process() {
        let env = test_util::env(1);
        let p = env.process(0);
        let rw = p
            .build_readwrite_process_buffer(env.ram(0, 0x20), 4)
            .unwrap();
        let ro = p
            .build_readonly_process_buffer(env.ram(0, 0x20), 4)
            .unwrap();

        assert_eq!(rw.mut_enter(|slice| slice.copy_from_slice(&[9, 8, 7, 6])), Ok(()));
        assert_eq!(ro.enter(|slice| slice[3].get()), Ok(6));
        assert_eq!(ro.len(), 4);

        p.stop();
        assert_eq!(ro.len(), 4);

        env.terminate(0, None);
        assert_eq!(rw.len(), 0);
        assert_eq!(rw.mut_enter(|_| ()), Err(process::Error::InactiveApp));
    }

    #[test]
    fn buffers_die_with_a_restart() {
        let env = test_util::env(1);
        let p = env.process(0);
        let ro = p
            .build_readonly_process_buffer(p.flash_start(), 8)
            .unwrap();

        env.restart(0);
        assert_eq!(ro.len(), 0);
        assert_eq!(ro.enter(|_| ()), Err(process::Error::NoSuchApp));
        // The pointer is still reported for handing back to the process.
        assert_eq!(ro.ptr(), p.flash_start());
    }
}
