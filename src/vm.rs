//! The kernel-wide state of the memory manager.
//!
//! [`Vm`] owns everything that is shared between processes: the user frame
//! pool, the swap area, the descriptor table, the filesystem lock, the console
//! and the table of live processes. It is created once at boot, before the
//! first user process, and lives until the kernel shuts down.
//!
//! Besides process bookkeeping, this module hosts the two pieces of the
//! memory manager that cut across processes:
//!
//! - Eviction ([`Evictor`] for [`Vm`]). The frame table picks a victim frame
//!   and calls back into the kernel, which looks the victim up in its owner's
//!   supplemental page table and persists its content where it belongs.
//! - The simulated MMU ([`Vm::user_read`], [`Vm::user_write`]). Every user
//!   access is translated through the process's page table; a missing or
//!   insufficient translation raises a page fault through
//!   [`Vm::page_fault`], exactly like the hardware would, and the access is
//!   retried once the fault is resolved.

use crate::{
    KernelError,
    addressing::{FrameNumber, PAGE_SIZE, Va},
    config::VmConfig,
    file_struct::FdTable,
    fs::{BlockDevice, Console, RegularFile, mem::MemDisk, traits::FileSystem},
    interrupt::{PFErrorCode, SoftTrap},
    mm::{Evictor, FrameTable, PteFlags},
    mmap::MapId,
    process::{Pid, Process},
    spt::{FileSegment, Origin, PageKind, SupPage, Writeout},
    swap::{SECTORS_PER_SLOT, SwapSlot, SwapTable},
    sync::{ReentrantLock, ReentrantLockGuard, SpinLock},
};
use log::{debug, info, warn};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

/// The memory manager.
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapTable,
    pub(crate) fds: SpinLock<FdTable>,
    pub(crate) console: Arc<dyn Console>,
    fs: ReentrantLock<Box<dyn FileSystem>>,
    processes: SpinLock<BTreeMap<Pid, Arc<Process>>>,
    exit_statuses: SpinLock<BTreeMap<Pid, i32>>,
    next_pid: AtomicU32,
    pub(crate) faults: AtomicUsize,
}

impl Vm {
    /// Creates the memory manager with an in-memory swap disk sized for
    /// `config.swap_slots` slots.
    pub fn new(config: VmConfig, fs: impl FileSystem + 'static, console: Arc<dyn Console>) -> Self {
        let disk = MemDisk::new(config.swap_slots * SECTORS_PER_SLOT);
        Self::with_swap_disk(config, fs, console, Box::new(disk))
    }

    /// Creates the memory manager swapping to `disk`. The number of swap
    /// slots is derived from the size of the disk.
    pub fn with_swap_disk(
        mut config: VmConfig,
        fs: impl FileSystem + 'static,
        console: Arc<dyn Console>,
        disk: Box<dyn BlockDevice>,
    ) -> Self {
        let swap = SwapTable::new(disk);
        config.swap_slots = swap.slot_count();
        info!(
            "vm: {} user frames, {} swap slots",
            config.user_frames, config.swap_slots
        );
        Self {
            frames: FrameTable::new(config.user_frames),
            swap,
            fds: SpinLock::new(FdTable::new()),
            console,
            fs: ReentrantLock::new(Box::new(fs)),
            processes: SpinLock::new(BTreeMap::new()),
            exit_statuses: SpinLock::new(BTreeMap::new()),
            next_pid: AtomicU32::new(1),
            faults: AtomicUsize::new(0),
            config,
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The user frame pool.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The swap area.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Acquires the filesystem lock. Every call into the file system driver
    /// is made under this lock. The lock is reentrant: a thread that already
    /// holds it gets a nested guard.
    #[track_caller]
    pub fn fs_lock(&self) -> ReentrantLockGuard<'_, Box<dyn FileSystem>> {
        self.fs.lock()
    }

    /// Number of descriptors currently open, across all processes.
    pub fn open_file_count(&self) -> usize {
        self.fds.lock().len()
    }

    /// Number of page faults taken since boot.
    pub fn page_fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    /// Creates a process named `name` with an empty address space.
    ///
    /// The stack pointer starts at the top of user space, and the topmost
    /// stack page is declared zero-filled so the first push needs no growth.
    pub fn spawn(&self, name: &str) -> Pid {
        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let top = self.config.user_top;
        let process = Arc::new(Process::new(pid, name, top.into_usize()));
        let _ = process.mm().spt.insert(SupPage {
            va: top - PAGE_SIZE,
            writable: true,
            kind: PageKind::ZeroFill,
        });
        self.processes.lock().insert(pid, process);
        debug!("spawn {} ({})", pid, name);
        pid
    }

    /// Looks up a live process.
    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// The exit status of `pid`, once it has exited.
    pub fn exit_status(&self, pid: Pid) -> Option<i32> {
        self.exit_statuses.lock().get(&pid).copied()
    }

    /// Declares a segment of `file` to be loaded lazily at `upage`.
    ///
    /// Starting at `offset` in the file, `read_bytes` bytes are read and
    /// `zero_bytes` zeros follow them. Each page gets its own supplemental
    /// page table entry: pages with file content become
    /// [`PageKind::FileBacked`], pages past the file content become
    /// [`PageKind::ZeroFill`]. Nothing is read until the pages fault.
    ///
    /// # Returns
    /// [`KernelError::InvalidArgument`] if `upage` or `offset` is not page
    /// aligned, the segment is not a whole number of pages, it leaves user
    /// space, or any of its pages is already declared or mapped. A rejected
    /// segment declares no page at all.
    #[allow(clippy::too_many_arguments)]
    pub fn declare_segment(
        &self,
        pid: Pid,
        file: &RegularFile,
        mut offset: usize,
        mut upage: Va,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        if !upage.is_page_aligned()
            || offset % PAGE_SIZE != 0
            || (read_bytes + zero_bytes) % PAGE_SIZE != 0
        {
            return Err(KernelError::InvalidArgument);
        }
        let end = upage
            .checked_add(read_bytes + zero_bytes)
            .ok_or(KernelError::InvalidArgument)?;
        if upage == Va::ZERO || end > self.config.user_top {
            return Err(KernelError::InvalidArgument);
        }
        let process = self.process(pid).ok_or(KernelError::InvalidArgument)?;
        let mut mm = process.mm();
        let pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        if (0..pages).any(|i| mm.spt.contains(upage + i * PAGE_SIZE))
            || mm.mappings.overlaps(upage, pages)
        {
            return Err(KernelError::InvalidArgument);
        }

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;
            let kind = if page_read_bytes == 0 {
                PageKind::ZeroFill
            } else {
                PageKind::FileBacked(FileSegment {
                    file: file.clone(),
                    offset,
                    read_bytes: page_read_bytes,
                    zero_bytes: page_zero_bytes,
                })
            };
            mm.spt
                .insert(SupPage {
                    va: upage,
                    writable,
                    kind,
                })
                .map_err(|_| KernelError::InvalidArgument)?;

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += page_read_bytes;
            upage += PAGE_SIZE;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes of user memory at `va`, as process `pid`.
    ///
    /// Faults are raised and resolved as the accesses go. If one of them
    /// cannot be resolved, the process is terminated and the error returned.
    pub fn user_read(&self, pid: Pid, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = self.user_offset(pid, va, done)?;
            let ofs = addr.offset();
            let n = (PAGE_SIZE - ofs).min(buf.len() - done);
            let dst = &mut buf[done..done + n];
            self.access(pid, addr, false, |page| {
                dst.copy_from_slice(&page[ofs..ofs + n])
            })?;
            done += n;
        }
        Ok(())
    }

    /// Writes `buf` to user memory at `va`, as process `pid`.
    ///
    /// See [`Vm::user_read`].
    pub fn user_write(&self, pid: Pid, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = self.user_offset(pid, va, done)?;
            let ofs = addr.offset();
            let n = (PAGE_SIZE - ofs).min(buf.len() - done);
            let src = &buf[done..done + n];
            self.access(pid, addr, true, |page| {
                page[ofs..ofs + n].copy_from_slice(src)
            })?;
            done += n;
        }
        Ok(())
    }

    fn user_offset(&self, pid: Pid, va: Va, offset: usize) -> Result<Va, KernelError> {
        va.checked_add(offset).ok_or_else(|| {
            self.exit(pid, -1);
            KernelError::BadAddress
        })
    }

    /// Runs `f` on the frame backing `va`, faulting it in first if needed.
    fn access<R>(
        &self,
        pid: Pid,
        va: Va,
        write: bool,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Result<R, KernelError> {
        let process = self.process(pid).ok_or(KernelError::BadAddress)?;
        loop {
            let mut mm = process.mm();
            let mut ec = PFErrorCode::USER;
            if write {
                ec |= PFErrorCode::WRITE_ACCESS;
            }
            match mm.page_table.walk_mut(va) {
                Ok(pte) if write && !pte.is_writable() => ec |= PFErrorCode::PRESENT,
                Ok(pte) => {
                    pte.set_flags(if write {
                        PteFlags::A | PteFlags::D
                    } else {
                        PteFlags::A
                    });
                    let mut data = self.frames.contents(pte.frame());
                    return Ok(f(&mut **data));
                }
                Err(_) => (),
            }
            mm.unlock();

            let mut trap = SoftTrap::new(ec, va.into_usize(), process.stack_pointer());
            self.page_fault(pid, &mut trap)?;
        }
    }

    /// Terminates process `pid` with `status`.
    ///
    /// Every descriptor of the process is closed, every mapping is unmapped
    /// with writeback, and every frame and swap slot it holds is released
    /// before the process disappears from the process table. The exit line
    /// `name: exit(status)` is printed to the console.
    ///
    /// Exiting a process that is already gone, or already exiting, does
    /// nothing.
    pub fn exit(&self, pid: Pid, status: i32) {
        let Some(process) = self.process(pid) else {
            return;
        };
        if !process.begin_exit() {
            return;
        }

        let fs = self.fs_lock();
        let fds = self.fds.lock().fds_of(pid);
        for fd in fds {
            let _ = self.close_fd(pid, fd);
        }
        fs.unlock();

        let ids = process.mm().mappings.ids();
        for id in ids {
            if let Err(e) = self.unmap(&process, id) {
                warn!("{}: writeback of {:?} failed: {}", process.name(), id, e);
            }
        }

        let mut mm = process.mm();
        for page in mm.spt.drain() {
            match page.kind {
                PageKind::Resident { frame, .. } => self.frames.free(frame),
                PageKind::Swapped(slot) => self.swap.free(slot),
                _ => (),
            }
        }
        mm.page_table.clear();
        mm.unlock();

        self.processes.lock().remove(&pid);
        self.exit_statuses.lock().insert(pid, status);
        info!("{}: exit({})", process.name(), status);
        self.console
            .putbuf(format!("{}: exit({})\n", process.name(), status).as_bytes());
    }

    /// Removes mapping `id` of `process`, writing its dirty pages back.
    ///
    /// # Returns
    /// [`KernelError::BadFileDescriptor`] if `id` is not a live mapping of
    /// the process.
    pub(crate) fn unmap(&self, process: &Process, id: MapId) -> Result<(), KernelError> {
        let mut mm = process.mm();
        let mapping = mm
            .mappings
            .remove(id)
            .ok_or(KernelError::BadFileDescriptor)?;

        let mut dirty = Vec::new();
        for va in mapping.pages() {
            let owned = match mm.spt.get(va).map(|p| &p.kind) {
                Some(PageKind::Mapped(m)) => m.id == id,
                Some(PageKind::Resident {
                    origin: Origin::Mapped(m),
                    ..
                }) => m.id == id,
                _ => false,
            };
            if !owned {
                continue;
            }
            let frame = mm.spt.remove(va).and_then(|p| p.frame());
            if let Some(frame) = frame {
                if mm.page_table.unmap(va).is_ok_and(|pte| pte.is_dirty()) {
                    dirty.push((mapping.offset_of(va), self.frames.contents(frame).clone()));
                }
                self.frames.free(frame);
            }
        }
        mm.unlock();

        let fs = self.fs_lock();
        for (offset, data) in dirty {
            mapping
                .file
                .write_at(offset, &data[..mapping.bytes_at(offset)])?;
        }
        fs.unlock();
        debug!("{}: munmap {:?} at {}", process.name(), id, mapping.base);
        Ok(())
    }

    fn swap_out_frame(&self, frame: FrameNumber) -> Result<SwapSlot, KernelError> {
        let data = self.frames.contents(frame);
        self.swap.swap_out(&data)
    }
}

impl Evictor for Vm {
    fn evict(&self, frame: FrameNumber, owner: Pid, va: Va) -> Result<(), KernelError> {
        let Some(process) = self.process(owner) else {
            return Ok(());
        };
        let mut mm = process.mm();
        let origin = match mm.spt.get(va) {
            Some(SupPage {
                kind: PageKind::Resident { frame: f, origin },
                ..
            }) if *f == frame => origin.clone(),
            _ => return Ok(()),
        };

        let dirty = mm.page_table.is_dirty(va);
        let kind = match origin.writeout(dirty) {
            Writeout::Discard => match origin.unloaded() {
                Some(kind) => kind,
                None => PageKind::Swapped(self.swap_out_frame(frame)?),
            },
            Writeout::Swap => PageKind::Swapped(self.swap_out_frame(frame)?),
            Writeout::WriteBack(m) => {
                if let Some(mapping) = mm.mappings.get(m.id) {
                    let data = self.frames.contents(frame).clone();
                    let fs = self.fs_lock();
                    mapping
                        .file
                        .write_at(m.offset, &data[..mapping.bytes_at(m.offset)])?;
                    fs.unlock();
                }
                PageKind::Mapped(m)
            }
        };
        debug!("{}: {} evicted to {:?}", owner, va, kind);

        let _ = mm.page_table.unmap(va);
        if let Some(entry) = mm.spt.get_mut(va) {
            entry.kind = kind;
        }
        Ok(())
    }
}
