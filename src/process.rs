//! User processes.
//!
//! A [`Process`] carries the state the memory manager needs about a user
//! program: its identity and its address space. The address space is an
//! [`MmStruct`], which bundles the page table, the supplemental page table
//! and the mapping table behind a single lock. Every transition of a page
//! (installation on a fault, demotion on eviction, removal on unmap or exit)
//! happens with this lock held.

use crate::{
    mm::PageTable,
    mmap::MmapTable,
    spt::SupPageTable,
    sync::{SpinLock, SpinLockGuard},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Process identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The address space of a process.
#[derive(Default)]
pub struct MmStruct {
    /// Installed translations.
    pub page_table: PageTable,
    /// Backing description of every known page.
    pub spt: SupPageTable,
    /// Memory-mapped files.
    pub mappings: MmapTable,
}

/// A user process.
pub struct Process {
    pid: Pid,
    name: String,
    mm: SpinLock<MmStruct>,
    stack_pointer: AtomicUsize,
    exiting: AtomicBool,
}

impl Process {
    pub(crate) fn new(pid: Pid, name: &str, stack_pointer: usize) -> Self {
        Self {
            pid,
            name: name.to_string(),
            mm: SpinLock::new(MmStruct::default()),
            stack_pointer: AtomicUsize::new(stack_pointer),
            exiting: AtomicBool::new(false),
        }
    }

    /// Identifier of this process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Name printed on exit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the address space.
    #[track_caller]
    pub fn mm(&self) -> SpinLockGuard<'_, MmStruct> {
        self.mm.lock()
    }

    /// The user stack pointer: the current one while running user code, or
    /// the one saved at system call entry while the kernel works on the
    /// process's behalf.
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer.load(Ordering::Relaxed)
    }

    /// Records the user stack pointer.
    pub fn set_stack_pointer(&self, sp: usize) {
        self.stack_pointer.store(sp, Ordering::Relaxed);
    }

    /// Whether the process is being torn down.
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Claims the right to tear this process down. Returns false if the
    /// process is already exiting.
    pub(crate) fn begin_exit(&self) -> bool {
        self.exiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
