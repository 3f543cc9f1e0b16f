//! # Page-fault dispatcher.
//!
//! A page fault is not an error by itself. Under demand paging it is how the
//! kernel learns that a process needs a page that has been declared but not
//! yet brought into memory, or that has been evicted since. The dispatcher
//! decides which of these cases a fault belongs to, and terminates the process
//! when it belongs to none.
//!
//! The policy, in order:
//!
//! 1. A fault in kernel privilege is a kernel bug and panics.
//! 2. A protection violation (the page is present but the access is not
//!    allowed) terminates the process.
//! 3. A fault on the null page or at/above the user boundary terminates the
//!    process.
//! 4. A page with a non-resident supplemental page table entry is loaded from
//!    its backing store: a file segment, a swap slot, zeros or a mapped file.
//! 5. A page without an entry is either a stack access close enough to the
//!    stack pointer (and within the stack limit), which grows the stack by a
//!    zeroed page, or a page of an active file mapping, which is read from the
//!    mapped file.
//! 6. Anything else terminates the process.
//!
//! ## Filling a frame
//!
//! The faulting process's address-space lock is never held while allocating
//! a frame, since the allocation may need to evict a page of this very
//! process. The dispatcher therefore decides what to do under the lock,
//! allocates a pinned frame without it, and takes the lock again to install
//! the frame. The entry may have changed while the lock was dropped: another
//! thread may have loaded the page, and an evictor may have sent it back out
//! to a different swap slot. The frame is only installed if the entry still
//! has the backing the plan was made for; otherwise the frame is released and
//! the access retried.
//!
//! Content is read after that check, with the lock held: file content under
//! the filesystem lock, swap content straight from the slot, which is
//! consumed exactly once.

use crate::{
    KernelError,
    addressing::{FrameNumber, PAGE_SIZE, Va},
    fs::RegularFile,
    interrupt::{PFErrorCode, TrapContext},
    process::{MmStruct, Pid, Process},
    spt::{MappedPage, Origin, PageKind, SupPage},
    swap::SwapSlot,
    vm::Vm,
};
use log::{debug, warn};
use std::sync::atomic::Ordering;

/// Represents the reason for a page fault.
///
/// This struct is the decoded form of the error code and the fault address
/// register, extracted once from the [`TrapContext`] when the fault is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    ///
    /// This is the virtual address that the process attempted to access.
    pub fault_addr: Va,

    /// Indicates whether the fault was caused by a write access.
    ///
    /// - `true`: The process attempted to write to the memory location.
    /// - `false`: The process attempted to read from the memory location.
    pub is_write_access: bool,

    /// Indicates whether the faulting address was mapped in the page table.
    ///
    /// - `true`: The address was present, the fault is a permission
    ///   violation.
    /// - `false`: The address was not mapped at all.
    pub is_present: bool,

    /// Indicates whether the fault happened while running in user mode.
    pub is_user: bool,
}

impl PageFaultReason {
    /// Decodes the error code and fault address.
    pub fn new(ec: PFErrorCode, cr2: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
        }
    }

    /// Whether this fault may be resolved by bringing a page in.
    ///
    /// Only faults on non-present pages are. A present page that rejects the
    /// access stays rejected no matter what is loaded.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }
}

impl core::fmt::Display for PageFaultReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} error {} page in {} context",
            if self.is_present {
                "rights violation"
            } else {
                "not present"
            },
            if self.is_write_access {
                "writing"
            } else {
                "reading"
            },
            if self.is_user { "user" } else { "kernel" },
        )
    }
}

/// How a fresh frame gets its content.
enum Fill {
    Zero,
    File {
        file: RegularFile,
        offset: usize,
        len: usize,
    },
    Swap(SwapSlot),
}

/// Resolution decided for a fault under the address-space lock.
struct Plan {
    page: Va,
    writable: bool,
    fill: Fill,
    origin: Origin,
    /// The entry the plan was made for. `None` if the page has no entry yet;
    /// one is created on install.
    expected: Option<PageKind>,
}

impl Vm {
    /// Handles a page fault of process `pid`.
    ///
    /// The fault address is read from `trap` exactly once, with interrupts
    /// still disabled, and interrupts are re-enabled before anything else
    /// happens.
    ///
    /// # Returns
    /// `Ok(())` if the faulting access can be retried. Otherwise the process
    /// has been terminated with status -1 and the error that killed it is
    /// returned.
    ///
    /// # Panics
    /// Panics if the fault was raised in kernel privilege.
    pub fn page_fault(&self, pid: Pid, trap: &mut dyn TrapContext) -> Result<(), KernelError> {
        let ec = trap.error_code();
        let cr2 = Va::new(trap.read_fault_address());
        trap.enable_interrupts();
        self.faults.fetch_add(1, Ordering::Relaxed);

        let reason = PageFaultReason::new(ec, cr2);
        if !reason.is_user {
            panic!(
                "Unexpected page fault in Kernel at {:?} because of {:?}",
                reason.fault_addr, ec
            );
        }

        match self.handle_page_fault(pid, &reason, trap.user_stack_pointer()) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "Page fault at {}: {} ({}); killing process {}.",
                    reason.fault_addr, reason, e, pid
                );
                self.exit(pid, -1);
                Err(e)
            }
        }
    }

    fn handle_page_fault(
        &self,
        pid: Pid,
        reason: &PageFaultReason,
        sp: usize,
    ) -> Result<(), KernelError> {
        if !reason.is_demand_paging_fault() {
            return Err(KernelError::InvalidAccess);
        }
        let va = reason.fault_addr;
        let page = va.page_down();
        if page == Va::ZERO || !self.config.is_user_vaddr(va) {
            return Err(KernelError::BadAddress);
        }
        let process = self.process(pid).ok_or(KernelError::BadAddress)?;

        let mm = process.mm();
        let plan = match self.plan(&mm, va, sp)? {
            Some(plan) => plan,
            // Resolved by someone else already.
            None => return Ok(()),
        };
        mm.unlock();

        let frame = self
            .frames
            .allocate(pid, plan.page, matches!(plan.fill, Fill::Zero), self)?;
        self.fill_and_install(&process, frame, plan)
    }

    /// Decides how to resolve a fault at `va`.
    fn plan(&self, mm: &MmStruct, va: Va, sp: usize) -> Result<Option<Plan>, KernelError> {
        let page = va.page_down();
        if let Some(entry) = mm.spt.get(page) {
            let fill = match &entry.kind {
                PageKind::Resident { .. } => return Ok(None),
                PageKind::FileBacked(seg) => Fill::File {
                    file: seg.file.clone(),
                    offset: seg.offset,
                    len: seg.read_bytes,
                },
                PageKind::Swapped(slot) => Fill::Swap(*slot),
                PageKind::ZeroFill => Fill::Zero,
                PageKind::Mapped(m) => self.mapped_fill(mm, *m)?,
            };
            return Ok(Some(Plan {
                page,
                writable: entry.writable,
                fill,
                origin: entry.kind.origin().ok_or(KernelError::InvalidArgument)?,
                expected: Some(entry.kind.clone()),
            }));
        }

        if self.is_stack_access(va, sp) {
            debug!("grow stack to {}", page);
            return Ok(Some(Plan {
                page,
                writable: true,
                fill: Fill::Zero,
                origin: Origin::ZeroFill,
                expected: None,
            }));
        }

        if let Some(mapping) = mm.mappings.find(va) {
            let m = MappedPage {
                id: mapping.id,
                offset: mapping.offset_of(va),
            };
            return Ok(Some(Plan {
                page,
                writable: true,
                fill: self.mapped_fill(mm, m)?,
                origin: Origin::Mapped(m),
                expected: None,
            }));
        }

        Err(KernelError::BadAddress)
    }

    fn mapped_fill(&self, mm: &MmStruct, m: MappedPage) -> Result<Fill, KernelError> {
        let mapping = mm.mappings.get(m.id).ok_or(KernelError::BadAddress)?;
        Ok(Fill::File {
            file: mapping.file.regular_file().clone(),
            offset: m.offset,
            len: mapping.bytes_at(m.offset),
        })
    }

    /// Whether a fault at `va` with stack pointer `sp` is a legitimate stack
    /// access: no further than the heuristic distance below `sp`, and inside
    /// the maximum stack span.
    pub(crate) fn is_stack_access(&self, va: Va, sp: usize) -> bool {
        va.into_usize().saturating_add(self.config.stack_heuristic) >= sp
            && self.config.user_top - va.page_down() <= self.config.max_stack_size
    }

    /// Fills the pinned `frame` according to `plan` and installs it. The
    /// frame is unpinned once installed, or released if the page turned out
    /// not to need it.
    fn fill_and_install(
        &self,
        process: &Process,
        frame: FrameNumber,
        plan: Plan,
    ) -> Result<(), KernelError> {
        let mut mm = process.mm();
        if !self.still_needed(process, &mm, &plan)
            || mm.page_table.map(plan.page, frame, plan.writable).is_err()
        {
            debug!("{}: fault at {} resolved meanwhile", process.pid(), plan.page);
            self.frames.free(frame);
            return Ok(());
        }

        if let Err(e) = self.fill(frame, &plan.fill) {
            let _ = mm.page_table.unmap(plan.page);
            self.frames.free(frame);
            return Err(e);
        }

        let kind = PageKind::Resident {
            frame,
            origin: plan.origin,
        };
        match mm.spt.get_mut(plan.page) {
            Some(entry) => entry.kind = kind,
            None => {
                let _ = mm.spt.insert(SupPage {
                    va: plan.page,
                    writable: plan.writable,
                    kind,
                });
            }
        }
        self.frames.unpin(frame);
        Ok(())
    }

    /// Whether the page `plan` was made for is still waiting for it.
    fn still_needed(&self, process: &Process, mm: &MmStruct, plan: &Plan) -> bool {
        if process.is_exiting() {
            return false;
        }
        match &plan.expected {
            Some(kind) => mm
                .spt
                .get(plan.page)
                .is_some_and(|p| p.kind.same_backing(kind)),
            None => {
                !mm.spt.contains(plan.page)
                    && match &plan.origin {
                        Origin::Mapped(m) => mm.mappings.get(m.id).is_some(),
                        _ => true,
                    }
            }
        }
    }

    /// Brings the content of a pinned, mapped `frame` in. Zero pages were
    /// cleared by the allocator.
    fn fill(&self, frame: FrameNumber, fill: &Fill) -> Result<(), KernelError> {
        match fill {
            Fill::Zero => Ok(()),
            Fill::File { file, offset, len } => {
                let mut buf = Box::new([0u8; PAGE_SIZE]);
                let fs = self.fs_lock();
                let read = file.read(*offset, &mut buf[..*len]);
                fs.unlock();
                match read? {
                    n if n == *len => {
                        **self.frames.contents(frame) = *buf;
                        Ok(())
                    }
                    _ => Err(KernelError::IOError),
                }
            }
            Fill::Swap(slot) => {
                let mut data = self.frames.contents(frame);
                let result = self.swap.read_and_free(*slot, &mut data);
                data.unlock();
                result
            }
        }
    }
}
