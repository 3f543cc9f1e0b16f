//! Memory-mapped files.
//!
//! A mapping binds a contiguous range of user pages to a privately reopened
//! file handle. The mapping table of a process is indexed by [`MapId`] for
//! unmapping, with a secondary index on the start address for the fault
//! path's "which mapping covers this address" question.
//!
//! Pages are never populated when the mapping is created. The first touch of
//! each page faults it in from the file, and dirty pages are written back when
//! the mapping is torn down (or when they are evicted).

use crate::{
    addressing::{PAGE_SIZE, Va},
    fs::File,
};
use std::collections::BTreeMap;

/// Identifier of a mapping, unique within its process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MapId(pub i32);

/// An active mapping.
#[derive(Debug)]
pub struct Mapping {
    /// Identifier returned to user space.
    pub id: MapId,
    /// Private handle to the mapped file.
    pub file: File,
    /// First mapped page.
    pub base: Va,
    /// Length of the file at map time, in bytes.
    pub length: usize,
}

impl Mapping {
    /// Number of pages covered.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.length.div_ceil(PAGE_SIZE)
    }

    /// One past the last mapped byte, rounded up to the page.
    #[inline]
    pub fn end(&self) -> Va {
        self.base + self.page_count() * PAGE_SIZE
    }

    /// Whether the page containing `va` belongs to this mapping.
    #[inline]
    pub fn contains(&self, va: Va) -> bool {
        self.base <= va && va < self.end()
    }

    /// Offset in the file of the page containing `va`.
    #[inline]
    pub fn offset_of(&self, va: Va) -> usize {
        va.page_down() - self.base
    }

    /// Number of file bytes backing the page at file offset `offset`.
    #[inline]
    pub fn bytes_at(&self, offset: usize) -> usize {
        self.length.saturating_sub(offset).min(PAGE_SIZE)
    }

    /// Iterates over the page addresses of the mapping.
    pub fn pages(&self) -> impl Iterator<Item = Va> + '_ {
        (0..self.page_count()).map(move |i| self.base + i * PAGE_SIZE)
    }
}

/// The mapping table of a process.
pub struct MmapTable {
    by_id: BTreeMap<MapId, Mapping>,
    by_base: BTreeMap<Va, MapId>,
    next_id: i32,
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_base: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// The mapping covering `va`, if any.
    pub fn find(&self, va: Va) -> Option<&Mapping> {
        let (_, id) = self.by_base.range(..=va).next_back()?;
        self.by_id.get(id).filter(|m| m.contains(va))
    }

    /// Whether any page of `[base, base + pages * PAGE_SIZE)` is mapped.
    pub fn overlaps(&self, base: Va, pages: usize) -> bool {
        let end = base + pages * PAGE_SIZE;
        if self.find(base).is_some() {
            return true;
        }
        self.by_base.range(base..end).next().is_some()
    }

    /// Look up a mapping by identifier.
    pub fn get(&self, id: MapId) -> Option<&Mapping> {
        self.by_id.get(&id)
    }

    /// Records a mapping of `file` (of `length` bytes) at `base`.
    ///
    /// The caller must have checked that the range is free.
    pub fn insert(&mut self, file: File, base: Va, length: usize) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        debug_assert!(!self.overlaps(base, length.div_ceil(PAGE_SIZE)));
        self.by_base.insert(base, id);
        self.by_id.insert(
            id,
            Mapping {
                id,
                file,
                base,
                length,
            },
        );
        id
    }

    /// Removes the mapping `id`.
    pub fn remove(&mut self, id: MapId) -> Option<Mapping> {
        let mapping = self.by_id.remove(&id)?;
        self.by_base.remove(&mapping.base);
        Some(mapping)
    }

    /// Identifiers of every live mapping.
    pub fn ids(&self) -> Vec<MapId> {
        self.by_id.keys().copied().collect()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if there is no live mapping.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
