//! Supplemental page table.
//!
//! The hardware page table only knows about pages that currently have a frame.
//! The supplemental page table remembers, for every virtual page a process
//! knows about, where its content comes from when it is *not* resident.
//!
//! Each page is described by exactly one [`PageKind`]:
//!
//! | Kind                   | Content lives in                            |
//! |------------------------|---------------------------------------------|
//! | [`PageKind::FileBacked`] | a segment of an executable or data file   |
//! | [`PageKind::Swapped`]    | a swap slot                               |
//! | [`PageKind::ZeroFill`]   | nowhere; the page reads as zeros          |
//! | [`PageKind::Mapped`]     | a page of a memory-mapped file            |
//! | [`PageKind::Resident`]   | a frame installed in the page table       |
//!
//! A resident page remembers its [`Origin`], which decides what eviction
//! has to do with its content (see [`Origin::writeout`]). Whether a page is
//! resident is a property of its kind, so a page can never be both loaded
//! and swapped at once.
//!
//! ```text
//!  FileBacked ─┐                         ┌─► FileBacked / ZeroFill (clean)
//!  ZeroFill  ──┼─► fault ─► Resident ────┼─► Swapped               (dirty or anonymous)
//!  Swapped   ──┤                         └─► Mapped                (written back)
//!  Mapped    ──┘
//! ```

use crate::{
    addressing::{FrameNumber, Va},
    fs::RegularFile,
    mm::PageTableMappingError,
    mmap::MapId,
    swap::SwapSlot,
};
use std::collections::BTreeMap;

/// A page-sized window of a file: `read_bytes` bytes read at `offset`,
/// followed by `zero_bytes` zeros.
#[derive(Clone, Debug)]
pub struct FileSegment {
    /// File to read from.
    pub file: RegularFile,
    /// Offset of the first byte in the file.
    pub offset: usize,
    /// Number of bytes to read.
    pub read_bytes: usize,
    /// Number of trailing zero bytes.
    pub zero_bytes: usize,
}

/// A page of a memory mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MappedPage {
    /// The mapping this page belongs to.
    pub id: MapId,
    /// Offset of the page in the mapped file.
    pub offset: usize,
}

/// Where a non-resident page's content comes from, or the frame of a
/// resident one.
#[derive(Clone, Debug)]
pub enum PageKind {
    /// Not loaded yet; read from a file segment.
    FileBacked(FileSegment),
    /// Evicted to a swap slot.
    Swapped(SwapSlot),
    /// Not loaded yet; zero filled.
    ZeroFill,
    /// A mapped-file page not currently loaded.
    Mapped(MappedPage),
    /// Backed by `frame`.
    Resident {
        /// The installed frame.
        frame: FrameNumber,
        /// Where the content came from.
        origin: Origin,
    },
}

/// The source a resident page was loaded from.
#[derive(Clone, Debug)]
pub enum Origin {
    /// Loaded from a file segment.
    File(FileSegment),
    /// Zero filled; either declared so or synthesized by stack growth.
    ZeroFill,
    /// Swapped in. The content exists nowhere else.
    Anonymous,
    /// Loaded from a memory-mapped file.
    Mapped(MappedPage),
}

/// What eviction must do with a victim's content.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Writeout {
    /// Drop the content; it can be reproduced from its origin.
    Discard,
    /// Move the content to a fresh swap slot.
    Swap,
    /// Write the content back to the mapped file.
    WriteBack(MappedPage),
}

impl Origin {
    /// Decides how to preserve a victim loaded from this origin.
    pub fn writeout(&self, dirty: bool) -> Writeout {
        match self {
            Origin::Mapped(m) if dirty => Writeout::WriteBack(*m),
            Origin::Mapped(_) => Writeout::Discard,
            Origin::File(_) | Origin::ZeroFill if !dirty => Writeout::Discard,
            _ => Writeout::Swap,
        }
    }

    /// The non-resident kind that reproduces this origin, if any.
    ///
    /// An anonymous page has no source but its frame, and yields `None`.
    pub fn unloaded(self) -> Option<PageKind> {
        match self {
            Origin::File(seg) => Some(PageKind::FileBacked(seg)),
            Origin::ZeroFill => Some(PageKind::ZeroFill),
            Origin::Mapped(m) => Some(PageKind::Mapped(m)),
            Origin::Anonymous => None,
        }
    }
}

impl PageKind {
    /// The origin a page of this kind has once loaded. `None` for a page that
    /// is already resident.
    pub fn origin(&self) -> Option<Origin> {
        match self {
            PageKind::FileBacked(seg) => Some(Origin::File(seg.clone())),
            PageKind::Swapped(_) => Some(Origin::Anonymous),
            PageKind::ZeroFill => Some(Origin::ZeroFill),
            PageKind::Mapped(m) => Some(Origin::Mapped(*m)),
            PageKind::Resident { .. } => None,
        }
    }

    /// Whether `self` and `other` load the same content from the same
    /// backing store. Resident pages never match.
    pub fn same_backing(&self, other: &PageKind) -> bool {
        match (self, other) {
            (PageKind::FileBacked(a), PageKind::FileBacked(b)) => {
                a.offset == b.offset && a.read_bytes == b.read_bytes && a.file.same_file(&b.file)
            }
            (PageKind::Swapped(a), PageKind::Swapped(b)) => a == b,
            (PageKind::ZeroFill, PageKind::ZeroFill) => true,
            (PageKind::Mapped(a), PageKind::Mapped(b)) => a == b,
            _ => false,
        }
    }
}

/// Supplemental page table entry.
#[derive(Clone, Debug)]
pub struct SupPage {
    /// Page-aligned user address.
    pub va: Va,
    /// Whether user writes are permitted.
    pub writable: bool,
    /// Backing description.
    pub kind: PageKind,
}

impl SupPage {
    /// Whether a frame is installed for this page right now.
    #[inline]
    pub fn is_resident(&self) -> bool {
        matches!(self.kind, PageKind::Resident { .. })
    }

    /// The installed frame, if resident.
    #[inline]
    pub fn frame(&self) -> Option<FrameNumber> {
        match self.kind {
            PageKind::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }
}

/// Per-process map from virtual page to [`SupPage`].
#[derive(Default)]
pub struct SupPageTable {
    pages: BTreeMap<Va, SupPage>,
}

impl SupPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `page`.
    ///
    /// # Returns
    /// [`PageTableMappingError::Unaligned`] if the address is not page
    /// aligned, [`PageTableMappingError::Duplicated`] if the page already has
    /// an entry.
    pub fn insert(&mut self, page: SupPage) -> Result<(), PageTableMappingError> {
        if !page.va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        if self.pages.contains_key(&page.va) {
            return Err(PageTableMappingError::Duplicated);
        }
        self.pages.insert(page.va, page);
        Ok(())
    }

    /// Entry for the page containing `va`.
    pub fn get(&self, va: Va) -> Option<&SupPage> {
        self.pages.get(&va.page_down())
    }

    /// Mutable entry for the page containing `va`.
    pub fn get_mut(&mut self, va: Va) -> Option<&mut SupPage> {
        self.pages.get_mut(&va.page_down())
    }

    /// Removes the entry for the page containing `va`.
    pub fn remove(&mut self, va: Va) -> Option<SupPage> {
        self.pages.remove(&va.page_down())
    }

    /// Returns true if the page containing `va` has an entry.
    pub fn contains(&self, va: Va) -> bool {
        self.pages.contains_key(&va.page_down())
    }

    /// Iterates over every entry in address order.
    pub fn iter(&self) -> impl Iterator<Item = &SupPage> {
        self.pages.values()
    }

    /// Removes and returns every entry.
    pub fn drain(&mut self) -> Vec<SupPage> {
        core::mem::take(&mut self.pages).into_values().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Number of resident entries.
    pub fn resident_count(&self) -> usize {
        self.pages.values().filter(|p| p.is_resident()).count()
    }
}
