// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Tock specific `MapCell` type for sharing references.

use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::ptr::drop_in_place;

#[derive(Clone, Copy, PartialEq)]
enum MapCellState {
    Uninit,
    Init,
    Borrowed,
}

/// A mutable memory location that enforces borrow rules at runtime without
/// possible panics.
///
/// A `MapCell` is a potential reference to mutable memory. Borrow rules are
/// enforced by forcing clients to either move the memory out of the cell or
/// operate on a borrow within a closure. You can think of a `MapCell` as an
/// `Option` wrapped in a `RefCell`: attempts to take the value from inside a
/// `MapCell` may fail by returning `None`.
pub struct MapCell<T> {
    // Only `Init` guarantees that `val` holds a valid `T`.
    val: UnsafeCell<MaybeUninit<T>>,
    occupied: Cell<MapCellState>,
}

impl<T> Drop for MapCell<T> {
    fn drop(&mut self) {
        if self.occupied.get() == MapCellState::Init {
            // Safety: the state says there is a valid `T` in `val`, and with
            // `&mut self` nobody else can be using it.
            unsafe { drop_in_place(self.val.get_mut().as_mut_ptr()) }
        }
    }
}

impl<T> MapCell<T> {
    /// Creates an empty `MapCell`.
    pub const fn empty() -> MapCell<T> {
        MapCell {
            val: UnsafeCell::new(MaybeUninit::uninit()),
            occupied: Cell::new(MapCellState::Uninit),
        }
    }

    /// Creates a new `MapCell` containing `value`.
    pub const fn new(value: T) -> MapCell<T> {
        MapCell {
            val: UnsafeCell::new(MaybeUninit::new(value)),
            occupied: Cell::new(MapCellState::Init),
        }
    }

    /// Returns `true` if the `MapCell` contains no value, including while the
    /// value is borrowed by `map`.
    pub fn is_none(&self) -> bool {
        !self.is_some()
    }

    /// Returns `true` if the `MapCell` contains a value that can be accessed.
    pub fn is_some(&self) -> bool {
        self.occupied.get() == MapCellState::Init
    }

    /// Takes the value out of the `MapCell` leaving it empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use tock_cells::map_cell::MapCell;
    /// let cell = MapCell::new(1234);
    /// let x = &cell;
    /// let y = &cell;
    ///
    /// assert_eq!(x.take(), Some(1234));
    /// assert_eq!(y.take(), None);
    /// ```
    pub fn take(&self) -> Option<T> {
        match self.occupied.get() {
            MapCellState::Init => {
                self.occupied.set(MapCellState::Uninit);
                // Safety: the state was `Init`, and is now `Uninit` so the
                // value will not be read again.
                Some(unsafe { self.val.get().read().assume_init() })
            }
            MapCellState::Uninit | MapCellState::Borrowed => None,
        }
    }

    /// Puts a value into the `MapCell`, dropping any previous value.
    ///
    /// If the cell is currently borrowed the new value is dropped instead and
    /// the borrow is left untouched.
    pub fn put(&self, val: T) {
        let _ = self.replace(val);
    }

    /// Replaces the contents of the `MapCell`, returning the old value if
    /// available.
    ///
    /// While the cell is borrowed by `map` the cell is left untouched and
    /// `Some(val)` is handed back.
    pub fn replace(&self, val: T) -> Option<T> {
        match self.occupied.get() {
            MapCellState::Borrowed => Some(val),
            _ => {
                let prev = self.take();
                // Safety: the cell is `Uninit` at this point, so nothing valid
                // is overwritten and nobody holds a reference into `val`.
                unsafe { self.val.get().write(MaybeUninit::new(val)) };
                self.occupied.set(MapCellState::Init);
                prev
            }
        }
    }

    /// Calls `closure` with a mutable reference to the value, if the value is
    /// present and not already borrowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use tock_cells::map_cell::MapCell;
    /// let cell = MapCell::new(1234);
    /// let x = &cell;
    /// let y = &cell;
    ///
    /// x.map(|value| {
    ///     // We have mutable access to the value while in the closure
    ///     *value += 1;
    /// });
    ///
    /// // After the closure completes, the mutable memory is still in the cell,
    /// // but potentially changed.
    /// assert_eq!(y.take(), Some(1235));
    /// ```
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        if self.is_some() {
            self.occupied.set(MapCellState::Borrowed);
            // Safety: the state was `Init` and is now `Borrowed`, so this is
            // the only reference into `val` until the state is restored.
            let valref = unsafe { &mut *(*self.val.get()).as_mut_ptr() };
            let res = closure(valref);
            self.occupied.set(MapCellState::Init);
            Some(res)
        } else {
            None
        }
    }

    /// Like `map`, but returns `default` if the value is absent or borrowed.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.map(closure).unwrap_or(default)
    }

    /// Behaves like `map`, but flattens a closure returning an `Option`.
    pub fn and_then<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> Option<R>,
    {
        self.map(closure).flatten()
    }

    /// Calls `modify` on the value if present, otherwise stores the value
    /// produced by `mkval`.
    pub fn modify_or_replace<F, G>(&self, modify: F, mkval: G)
    where
        F: FnOnce(&mut T),
        G: FnOnce() -> T,
    {
        if self.map(modify).is_none() {
            self.put(mkval());
        }
    }
}
