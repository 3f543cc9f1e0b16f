//! Memory management building blocks.
//!
//! - [`page_table`]: per-process translations with hardware-style accessed
//!   and dirty bits.
//! - [`frame`]: the user frame pool, its pinning discipline and the victim
//!   selection.

pub mod frame;
pub mod page_table;

pub use frame::{Evictor, FrameData, FrameState, FrameTable};
pub use page_table::{PageTable, PageTableMappingError, Pte, PteFlags};
