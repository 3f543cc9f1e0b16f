//! Swap table.
//!
//! The swap area is a [`BlockDevice`] carved into page-sized slots of
//! [`SECTORS_PER_SLOT`] consecutive sectors. A bitmap records which slots
//! hold the content of a swapped-out page.
//!
//! A slot is allocated when a page is evicted to swap and freed the instant
//! its content is read back. [`SwapTable::read_and_free`] performs both steps
//! under the table lock, so no other party can claim the slot in between.
//!
//! The swap table lock is a leaf lock: no other lock is acquired while it is
//! held.

use crate::{
    KernelError,
    addressing::PAGE_SIZE,
    fs::{BlockDevice, Sector},
    sync::SpinLock,
};
use log::debug;

/// Number of sectors that make up one slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / Sector::SIZE;

/// Index of a slot in the swap area.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    /// The first sector of this slot.
    #[inline]
    pub fn first_sector(self) -> Sector {
        Sector(self.0 * SECTORS_PER_SLOT)
    }
}

struct SlotBitmap {
    // 0: used, 1: unused
    bitmap: Vec<u64>,
    used: usize,
}

impl SlotBitmap {
    fn new(slots: usize) -> Self {
        let mut bitmap = vec![u64::MAX; slots.div_ceil(64)];
        // Bits past the last slot are permanently used.
        if slots % 64 != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = (1u64 << (slots % 64)) - 1;
            }
        }
        Self { bitmap, used: 0 }
    }

    fn set_used(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] &= !(1 << ofs);
        self.used += 1;
    }

    fn set_unused(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_eq!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] |= 1 << ofs;
        self.used -= 1;
    }

    fn is_used(&self, index: usize) -> bool {
        let (pos, ofs) = (index / 64, index % 64);
        self.bitmap
            .get(pos)
            .map(|w| w & (1 << ofs) == 0)
            .unwrap_or(true)
    }

    fn alloc(&mut self) -> Option<usize> {
        // search first qword that contains one.
        let pos = self.bitmap.iter().position(|w| *w != 0)?;
        let index = pos * 64 + self.bitmap[pos].trailing_zeros() as usize;
        self.set_used(index);
        Some(index)
    }
}

/// The swap area and its slot bitmap.
pub struct SwapTable {
    disk: Box<dyn BlockDevice>,
    slots: usize,
    bitmap: SpinLock<SlotBitmap>,
}

impl SwapTable {
    /// Creates a swap table covering the whole of `disk`. The slot count is
    /// fixed from here on.
    pub fn new(disk: Box<dyn BlockDevice>) -> Self {
        let slots = disk.sector_count() / SECTORS_PER_SLOT;
        Self {
            disk,
            slots,
            bitmap: SpinLock::new(SlotBitmap::new(slots)),
        }
    }

    /// Total number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Number of slots currently holding a page.
    pub fn used_count(&self) -> usize {
        self.bitmap.lock().used
    }

    /// Whether `slot` is currently allocated.
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        slot.0 < self.slots && self.bitmap.lock().is_used(slot.0)
    }

    /// Allocates the first free slot.
    ///
    /// # Returns
    /// The slot, or [`KernelError::NoSpace`] if every slot is in use.
    pub fn alloc_slot(&self) -> Result<SwapSlot, KernelError> {
        self.bitmap
            .lock()
            .alloc()
            .map(SwapSlot)
            .ok_or(KernelError::NoSpace)
    }

    /// Writes `page` into `slot`.
    pub fn write(&self, slot: SwapSlot, page: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let bitmap = self.bitmap.lock();
        debug_assert!(bitmap.is_used(slot.0), "write to free slot {:?}", slot);
        let first = slot.first_sector();
        for (i, chunk) in page.chunks_exact(Sector::SIZE).enumerate() {
            let mut sector = [0; Sector::SIZE];
            sector.copy_from_slice(chunk);
            self.disk.write(first + i, &sector)?;
        }
        bitmap.unlock();
        Ok(())
    }

    /// Allocates a slot and writes `page` to it. The slot is released again
    /// if the write fails.
    pub fn swap_out(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot, KernelError> {
        let slot = self.alloc_slot()?;
        if let Err(e) = self.write(slot, page) {
            self.free(slot);
            return Err(e);
        }
        debug!("swap out -> {:?}", slot);
        Ok(slot)
    }

    /// Reads the content of `slot` into `page` and frees the slot.
    ///
    /// The slot is only freed when the read succeeds.
    pub fn read_and_free(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut bitmap = self.bitmap.lock();
        if slot.0 >= self.slots || !bitmap.is_used(slot.0) {
            return Err(KernelError::InvalidArgument);
        }
        let first = slot.first_sector();
        for (i, chunk) in page.chunks_exact_mut(Sector::SIZE).enumerate() {
            let mut sector = [0; Sector::SIZE];
            self.disk.read(first + i, &mut sector)?;
            chunk.copy_from_slice(&sector);
        }
        bitmap.set_unused(slot.0);
        bitmap.unlock();
        debug!("swap in <- {:?}", slot);
        Ok(())
    }

    /// Releases `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        self.bitmap.lock().set_unused(slot.0);
    }
}
