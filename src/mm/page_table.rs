//! Per-process page table.
//!
//! The memory manager never walks real x86_64 paging structures; the
//! hardware-facing side of translation is modelled by this table, which maps
//! each page-aligned user [`Va`] to a page table entry ([`Pte`]) naming the
//! physical frame and its permission bits.
//!
//! The simulated MMU in [`Vm`] consults this table on every user access,
//! raises a page fault for a missing or insufficient entry, and records the
//! accessed and dirty bits exactly where the hardware would. The dirty bit is
//! what drives writeback of mapped files and the swap-or-discard decision on
//! eviction.
//!
//! [`Vm`]: crate::Vm

use crate::addressing::{FrameNumber, Va};
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
    }
}

/// Page Table Entry (PTE).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pte {
    frame: FrameNumber,
    flags: PteFlags,
}

impl Pte {
    /// The frame this entry translates to.
    #[inline]
    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// The permission and status bits of this entry.
    #[inline]
    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    /// Whether the mapped page has been written since it was installed or
    /// since the dirty bit was last cleared.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PteFlags::D)
    }

    /// Whether writes through this entry are permitted.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::RW)
    }

    /// Sets the given status bits.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) {
        self.flags |= flags;
    }

    /// Clears the given status bits.
    #[inline]
    pub fn clear_flags(&mut self, flags: PteFlags) {
        self.flags -= flags;
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when working with page table
/// mappings.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not a multiple of the page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not
    /// exist.
    NotExist,

    /// Duplicated mapping.
    ///
    /// This error is returned when attempting to map an address that is
    /// already mapped.
    Duplicated,
}

/// Page table of a single process.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<Va, Pte>,
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a virtual address (`va`) to a physical frame (`frame`).
    ///
    /// # Arguments
    /// - `va`: The page-aligned virtual address to map.
    /// - `frame`: The frame backing the page.
    /// - `writable`: Whether user writes are permitted.
    ///
    /// # Returns
    /// `Ok(())` on success, [`PageTableMappingError::Unaligned`] if `va` is
    /// not page aligned, or [`PageTableMappingError::Duplicated`] if `va` is
    /// already mapped.
    pub fn map(
        &mut self,
        va: Va,
        frame: FrameNumber,
        writable: bool,
    ) -> Result<(), PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        if self.entries.contains_key(&va) {
            return Err(PageTableMappingError::Duplicated);
        }
        let mut flags = PteFlags::P | PteFlags::US;
        if writable {
            flags |= PteFlags::RW;
        }
        self.entries.insert(va, Pte { frame, flags });
        Ok(())
    }

    /// Unmap the given virtual address (`va`) and return the entry that was
    /// mapped to it.
    pub fn unmap(&mut self, va: Va) -> Result<Pte, PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        self.entries
            .remove(&va)
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Find the page table entry for the page containing `va`.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        self.entries
            .get(&va.page_down())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Find the page table entry for the page containing `va`, mutably.
    pub fn walk_mut(&mut self, va: Va) -> Result<&mut Pte, PageTableMappingError> {
        self.entries
            .get_mut(&va.page_down())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Returns true if the page containing `va` is mapped and dirty.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.walk(va).map(Pte::is_dirty).unwrap_or(false)
    }

    /// Returns true if the page containing `va` is mapped.
    pub fn is_mapped(&self, va: Va) -> bool {
        self.walk(va).is_ok()
    }

    /// Number of installed translations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no translation is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every translation, returning them.
    pub fn clear(&mut self) -> Vec<(Va, Pte)> {
        core::mem::take(&mut self.entries).into_iter().collect()
    }
}
