//! Virtual addresses and physical frames.
//!
//! This module provides the two address types the memory manager traffics
//! in: [`Va`], a user virtual address, and [`FrameNumber`], the index of a
//! physical frame in the user frame pool.
//!
//! Both are thin wrappers over `usize` so that a frame number can never be
//! confused with an address, and the arithmetic on them stays explicit.
//!
//! ## Example Usage:
//!
//! ```
//! use keos_vm::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x8048_123);
//! assert_eq!(va.page_down(), Va::new(0x8048_000));
//! assert_eq!(va.page_down() + PAGE_SIZE, Va::new(0x8049_000));
//! ```

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB
/// (kilobytes). Pages, frames and swap slots all share this size.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
///
/// ## Example:
/// ```
/// # let address = 0x1234usize;
/// # use keos_vm::addressing::PAGE_MASK;
/// let offset_within_page = address & PAGE_MASK;  // Get the byte offset within the page
/// ```
pub const PAGE_MASK: usize = 0xfff;

/// Represents a user virtual address.
///
/// The `Va` struct is a wrapper around the `usize` type. Whether an address
/// is a *legal* user address depends on the configured top of user address
/// space, see [`VmConfig::user_top`].
///
/// [`VmConfig::user_top`]: crate::config::VmConfig::user_top
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Va(usize);

impl Va {
    /// The virtual address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Cast the virtual address into raw usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up the address to the page boundary.
    ///
    /// Returns `None` if rounding up overflows the address space.
    #[inline]
    pub const fn page_up(self) -> Option<Self> {
        match self.0.checked_add(PAGE_MASK) {
            Some(v) => Some(Self(v & !PAGE_MASK)),
            None => None,
        }
    }

    /// Get the offset of the address within its page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether this address sits on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// Adds `rhs` bytes to this address, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

impl core::ops::AddAssign<usize> for Va {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl core::ops::Sub<usize> for Va {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self {
        Self(self.0 - rhs)
    }
}

impl core::ops::Sub<Va> for Va {
    type Output = usize;

    fn sub(self, rhs: Va) -> usize {
        self.0 - rhs.0
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}

impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a physical frame in the user frame pool.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Debug)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}
