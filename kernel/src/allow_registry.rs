// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Bookkeeping of the buffers a process has shared with the kernel.
//!
//! Every successful allow system call records the region it shares in an
//! [`AllowRegistry`] owned by the process. The registry rejects a region that
//! overlaps a buffer shared through a different allow slot when either of the
//! two is read-write, so an extension can never observe the same byte through
//! a mutable and a second view at once. Read-only buffers may overlap each
//! other freely.
//!
//! Allow is a swap: registering a region for a slot replaces the region that
//! slot shared before, and the replaced region does not take part in the
//! overlap check. Registering a zero-length region releases the slot.
//!
//! Two strategies are provided and boards pick one by type:
//!
//! - [`FlatAllowRegistry`] keeps entries unordered and scans all of them.
//! - [`SortedAllowRegistry`] keeps entries ordered by start address and only
//!   looks at the entries that can reach the new region.

use tock_cells::map_cell::MapCell;
use tock_cells::optional_cell::OptionalCell;

use crate::process::Error;

/// Access a process granted to a shared buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllowKind {
    ReadOnly,
    ReadWrite,
}

/// One allow slot of one driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllowSlot {
    pub driver_num: usize,
    pub allow_num: usize,
    pub kind: AllowKind,
}

impl AllowSlot {
    pub const fn new(driver_num: usize, allow_num: usize, kind: AllowKind) -> AllowSlot {
        AllowSlot {
            driver_num,
            allow_num,
            kind,
        }
    }
}

/// A live shared region.
///
/// Regions are validated against the process memory before they get here, so
/// `start + len` does not overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllowedRegion {
    pub slot: AllowSlot,
    pub start: usize,
    pub len: usize,
}

impl AllowedRegion {
    fn end(&self) -> usize {
        self.start.saturating_add(self.len)
    }

    fn conflicts_with(&self, other: &AllowedRegion) -> bool {
        self.slot != other.slot
            && (self.slot.kind == AllowKind::ReadWrite || other.slot.kind == AllowKind::ReadWrite)
            && self.start < other.end()
            && other.start < self.end()
    }
}

/// Per-process record of shared buffers.
///
/// All methods take `&self`; implementations use interior mutability since a
/// process is only ever reached through shared references.
pub trait AllowRegistry {
    /// Record `[start, start + len)` as shared through `slot`.
    ///
    /// On error nothing changes:
    /// - `Error::Overlap` if the region conflicts with another live region.
    /// - `Error::OutOfMemory` if no entry is left for a new slot.
    fn register(&self, slot: AllowSlot, start: usize, len: usize) -> Result<(), Error>;

    /// Forget the region shared through `slot`, if any.
    fn release(&self, slot: AllowSlot);

    /// Number of live regions.
    fn live_count(&self) -> usize;

    /// Forget every region. Used when the process terminates.
    fn reset(&self);
}

/// Unordered table of `N` entries with a linear overlap scan.
pub struct FlatAllowRegistry<const N: usize> {
    entries: [OptionalCell<AllowedRegion>; N],
}

impl<const N: usize> FlatAllowRegistry<N> {
    pub const fn new() -> FlatAllowRegistry<N> {
        FlatAllowRegistry {
            entries: [const { OptionalCell::empty() }; N],
        }
    }

    fn find(&self, slot: AllowSlot) -> Option<&OptionalCell<AllowedRegion>> {
        self.entries
            .iter()
            .find(|entry| entry.map_or(false, |region| region.slot == slot))
    }
}

impl<const N: usize> Default for FlatAllowRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AllowRegistry for FlatAllowRegistry<N> {
    fn register(&self, slot: AllowSlot, start: usize, len: usize) -> Result<(), Error> {
        if len == 0 {
            self.release(slot);
            return Ok(());
        }

        let new = AllowedRegion { slot, start, len };
        let conflict = self
            .entries
            .iter()
            .any(|entry| entry.map_or(false, |region| region.conflicts_with(&new)));
        if conflict {
            return Err(Error::Overlap);
        }

        self.find(slot)
            .or_else(|| self.entries.iter().find(|entry| entry.is_none()))
            .map_or(Err(Error::OutOfMemory), |entry| {
                entry.set(new);
                Ok(())
            })
    }

    fn release(&self, slot: AllowSlot) {
        if let Some(entry) = self.find(slot) {
            entry.clear();
        }
    }

    fn live_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    fn reset(&self) {
        self.entries.iter().for_each(|entry| entry.clear());
    }
}

const VACANT: AllowedRegion = AllowedRegion {
    slot: AllowSlot::new(0, 0, AllowKind::ReadOnly),
    start: 0,
    len: 0,
};

struct SortedTable<const N: usize> {
    /// The first `live` entries are in use, ordered by `start`.
    regions: [AllowedRegion; N],
    live: usize,
    /// Length of the longest live region. Any region overlapping `[s, e)`
    /// starts within `(s - max_len, e)`.
    max_len: usize,
}

impl<const N: usize> SortedTable<N> {
    fn live(&self) -> &[AllowedRegion] {
        &self.regions[..self.live]
    }

    fn position(&self, slot: AllowSlot) -> Option<usize> {
        self.live().iter().position(|region| region.slot == slot)
    }

    fn conflicts(&self, new: &AllowedRegion) -> bool {
        let floor = new.start.saturating_sub(self.max_len);
        let first = self.live().partition_point(|region| region.start < floor);
        self.live()[first..]
            .iter()
            .take_while(|region| region.start < new.end())
            .any(|region| region.conflicts_with(new))
    }

    fn remove(&mut self, index: usize) {
        self.regions[index..self.live].rotate_left(1);
        self.live -= 1;
        self.max_len = self.live().iter().map(|region| region.len).max().unwrap_or(0);
    }

    fn insert(&mut self, new: AllowedRegion) -> Result<(), Error> {
        if self.live == N {
            return Err(Error::OutOfMemory);
        }
        let index = self.live().partition_point(|region| region.start <= new.start);
        self.regions[index..=self.live].rotate_right(1);
        self.regions[index] = new;
        self.live += 1;
        self.max_len = self.max_len.max(new.len);
        Ok(())
    }

    fn register(&mut self, slot: AllowSlot, start: usize, len: usize) -> Result<(), Error> {
        if len == 0 {
            self.release(slot);
            return Ok(());
        }

        let new = AllowedRegion { slot, start, len };
        if self.conflicts(&new) {
            return Err(Error::Overlap);
        }
        match self.position(slot) {
            Some(index) => {
                // Freeing the old entry first guarantees room for the new one.
                self.remove(index);
                self.insert(new)
            }
            None => self.insert(new),
        }
    }

    fn release(&mut self, slot: AllowSlot) {
        if let Some(index) = self.position(slot) {
            self.remove(index);
        }
    }
}

/// Table of `N` entries kept sorted by start address.
///
/// The overlap check binary searches for the first entry that could reach the
/// new region and stops at the first entry starting past its end.
pub struct SortedAllowRegistry<const N: usize> {
    table: MapCell<SortedTable<N>>,
}

impl<const N: usize> SortedAllowRegistry<N> {
    pub const fn new() -> SortedAllowRegistry<N> {
        SortedAllowRegistry {
            table: MapCell::new(SortedTable {
                regions: [VACANT; N],
                live: 0,
                max_len: 0,
            }),
        }
    }
}

impl<const N: usize> Default for SortedAllowRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AllowRegistry for SortedAllowRegistry<N> {
    fn register(&self, slot: AllowSlot, start: usize, len: usize) -> Result<(), Error> {
        self.table
            .map(|table| table.register(slot, start, len))
            .unwrap_or(Err(Error::KernelError))
    }

    fn release(&self, slot: AllowSlot) {
        self.table.map(|table| table.release(slot));
    }

    fn live_count(&self) -> usize {
        self.table.map_or(0, |table| table.live)
    }

    fn reset(&self) {
        self.table.map(|table| {
            table.live = 0;
            table.max_len = 0;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW1: AllowSlot = AllowSlot::new(0x40001, 1, AllowKind::ReadWrite);
    const RW2: AllowSlot = AllowSlot::new(0x40001, 2, AllowKind::ReadWrite);
    const RO1: AllowSlot = AllowSlot::new(0x40001, 1, AllowKind::ReadOnly);
    const RO2: AllowSlot = AllowSlot::new(0x40001, 2, AllowKind::ReadOnly);
    const OTHER_RW1: AllowSlot = AllowSlot::new(0x40002, 1, AllowKind::ReadWrite);

    fn overlapping_mutable_rejected(registry: &dyn AllowRegistry) {
        assert_eq!(registry.register(RW1, 0x2000, 64), Ok(()));
        assert_eq!(registry.register(RW2, 0x2010, 32), Err(Error::Overlap));
        assert_eq!(registry.live_count(), 1);
        // The first buffer is still registered and still blocks the range.
        assert_eq!(registry.register(OTHER_RW1, 0x203f, 1), Err(Error::Overlap));
        assert_eq!(registry.register(RW2, 0x2040, 32), Ok(()));
        assert_eq!(registry.live_count(), 2);
    }

    fn readonly_overlap_allowed(registry: &dyn AllowRegistry) {
        assert_eq!(registry.register(RO1, 0x1000, 16), Ok(()));
        assert_eq!(registry.register(RO2, 0x1008, 16), Ok(()));
        assert_eq!(registry.register(RW1, 0x1010, 4), Err(Error::Overlap));
        assert_eq!(registry.register(RW1, 0x1018, 4), Ok(()));
    }

    fn swap_excludes_own_region(registry: &dyn AllowRegistry) {
        assert_eq!(registry.register(RW1, 0x3000, 32), Ok(()));
        assert_eq!(registry.register(RW1, 0x3010, 32), Ok(()));
        assert_eq!(registry.live_count(), 1);
        // The old range was released by the swap.
        assert_eq!(registry.register(RW2, 0x3000, 16), Ok(()));
    }

    fn release_and_double_release(registry: &dyn AllowRegistry) {
        assert_eq!(registry.register(RW1, 0x3000, 32), Ok(()));
        assert_eq!(registry.register(RW1, 0x3000, 0), Ok(()));
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.register(RW1, 0x3000, 0), Ok(()));
        registry.release(RW1);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.register(RW2, 0x3000, 32), Ok(()));
    }

    fn full_table(registry: &dyn AllowRegistry) {
        assert_eq!(registry.register(RW1, 0x100, 4), Ok(()));
        assert_eq!(registry.register(RW2, 0x200, 4), Ok(()));
        assert_eq!(registry.register(OTHER_RW1, 0x300, 4), Err(Error::OutOfMemory));
        // Swapping an existing slot still works when full.
        assert_eq!(registry.register(RW2, 0x400, 4), Ok(()));
        registry.reset();
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.register(OTHER_RW1, 0x100, 4), Ok(()));
    }

    #[test]
    fn flat_overlapping_mutable_rejected() {
        overlapping_mutable_rejected(&FlatAllowRegistry::<4>::new());
    }

    #[test]
    fn sorted_overlapping_mutable_rejected() {
        overlapping_mutable_rejected(&SortedAllowRegistry::<4>::new());
    }

    #[test]
    fn flat_readonly_overlap_allowed() {
        readonly_overlap_allowed(&FlatAllowRegistry::<4>::new());
    }

    #[test]
    fn sorted_readonly_overlap_allowed() {
        readonly_overlap_allowed(&SortedAllowRegistry::<4>::new());
    }

    #[test]
    fn flat_swap_excludes_own_region() {
        swap_excludes_own_region(&FlatAllowRegistry::<4>::new());
    }

    #[test]
    fn sorted_swap_excludes_own_region() {
        swap_excludes_own_region(&SortedAllowRegistry::<4>::new());
    }

    #[test]
    fn flat_release() {
        release_and_double_release(&FlatAllowRegistry::<4>::new());
    }

    #[test]
    fn sorted_release() {
        release_and_double_release(&SortedAllowRegistry::<4>::new());
    }

    #[test]
    fn flat_full_table() {
        full_table(&FlatAllowRegistry::<2>::new());
    }

    #[test]
    fn sorted_full_table() {
        full_table(&SortedAllowRegistry::<2>::new());
    }

    #[test]
    fn sorted_window_reaches_long_region() {
        let registry = SortedAllowRegistry::<8>::new();
        let slots = [
            AllowSlot::new(1, 0, AllowKind::ReadWrite),
            AllowSlot::new(1, 1, AllowKind::ReadWrite),
            AllowSlot::new(1, 2, AllowKind::ReadWrite),
        ];
        // One long region followed by short ones that start inside it would
        // conflict, so place the short ones after it.
        assert_eq!(registry.register(slots[0], 0x1000, 0x1000), Ok(()));
        assert_eq!(registry.register(slots[1], 0x2000, 4), Ok(()));
        assert_eq!(registry.register(slots[2], 0x2010, 4), Ok(()));
        // Ends just before the short regions but lies inside the long one.
        let candidate = AllowSlot::new(2, 0, AllowKind::ReadWrite);
        assert_eq!(registry.register(candidate, 0x1ff0, 8), Err(Error::Overlap));
        // Releasing the long region shrinks the window.
        registry.release(slots[0]);
        assert_eq!(registry.register(candidate, 0x1ff0, 8), Ok(()));
    }

    #[test]
    fn sorted_keeps_address_order() {
        let registry = SortedAllowRegistry::<4>::new();
        let a = AllowSlot::new(1, 0, AllowKind::ReadOnly);
        let b = AllowSlot::new(1, 1, AllowKind::ReadOnly);
        let c = AllowSlot::new(1, 2, AllowKind::ReadOnly);
        assert_eq!(registry.register(a, 0x300, 4), Ok(()));
        assert_eq!(registry.register(b, 0x100, 4), Ok(()));
        assert_eq!(registry.register(c, 0x200, 4), Ok(()));
        let starts = registry
            .table
            .map(|table| [table.regions[0].start, table.regions[1].start, table.regions[2].start]);
        assert_eq!(starts, Some([0x100, 0x200, 0x300]));
    }

    fn assert_no_conflicts<'a>(live: impl Iterator<Item = &'a AllowedRegion> + Clone) {
        for (i, a) in live.clone().enumerate() {
            for b in live.clone().skip(i + 1) {
                assert!(!a.conflicts_with(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn flat_and_sorted_agree() {
        let slots = [
            RW1,
            RW2,
            RO1,
            RO2,
            OTHER_RW1,
            AllowSlot::new(0x40002, 1, AllowKind::ReadOnly),
        ];
        let flat = FlatAllowRegistry::<3>::new();
        let sorted = SortedAllowRegistry::<3>::new();

        // Small linear congruential generator over a 256 byte window.
        let mut seed: u32 = 0x1234_5678;
        let mut next = |bound: u32| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            ((seed >> 16) % bound) as usize
        };

        for _ in 0..2000 {
            let slot = slots[next(slots.len() as u32)];
            let start = 0x1000 + next(256);
            let len = next(48);
            if next(8) == 0 {
                flat.release(slot);
                sorted.release(slot);
            } else {
                assert_eq!(
                    flat.register(slot, start, len),
                    sorted.register(slot, start, len)
                );
            }
            assert_eq!(flat.live_count(), sorted.live_count());

            let flat_live: [Option<AllowedRegion>; 3] =
                core::array::from_fn(|i| flat.entries[i].get());
            assert_no_conflicts(flat_live.iter().flatten());
            assert!(sorted
                .table
                .map(|table| assert_no_conflicts(table.live().iter()))
                .is_some());
        }
    }
}
