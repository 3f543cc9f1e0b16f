//! # keos-vm: Demand Paging for KeOS User Processes
//!
//! This crate implements the virtual-memory manager that sits underneath the
//! user-process support layer of KeOS. User programs share a small pool of
//! physical frames; the kernel hands frames out only when a page is actually
//! touched, and reclaims them from other pages when the pool runs dry.
//!
//! The manager is built out of a handful of cooperating components, listed
//! leaf-first:
//!
//! - [`swap`]: A bitmap of page-sized slots on a block device. Evicted
//!   anonymous pages live here until they are touched again.
//! - [`mm::frame`]: The frame table. Hands out frames, pins them while their
//!   content is being filled, and selects victims with a clock hand when the
//!   pool is exhausted.
//! - [`spt`]: The per-process supplemental page table, which records for each
//!   virtual page where its content can be found when it is not resident.
//! - [`mmap`]: The per-process table of memory-mapped files.
//! - [`page_fault`]: The page-fault dispatcher, the single entry point for
//!   the hardware page-fault trap.
//! - [`file_struct`] and [`sync::ReentrantLock`]: The kernel-wide descriptor
//!   table and the reentrant filesystem lock that both the system calls and
//!   the fault path serialize through.
//!
//! All the kernel-wide state is owned by a single [`Vm`] object; each user
//! process is described by a [`Process`] whose address space is guarded by
//! one lock.
//!
//! ## Page Fault Flow
//!
//! ```text
//!  user access ──► #PF ──► Vm::page_fault ──► SPT lookup
//!                                   │              │
//!                                   │      ┌───────┴────────┐
//!                                   │   declared         unknown
//!                                   │      │                │
//!                                   │  frame alloc    stack growth?
//!                                   │  (may evict)    mapped file?
//!                                   │      │                │
//!                                   └── install ◄───────────┘
//! ```
//!
//! Anything that does not fit one of these paths terminates the faulting
//! process. A fault raised while running in kernel privilege is a kernel bug
//! and panics.
//!
//! ## Lock Ordering
//!
//! Locks are always acquired in the order: process [`MmStruct`] lock,
//! filesystem lock, descriptor table. The frame table, the swap table, the
//! process table and individual frame contents are leaves. The frame
//! allocator is never entered with an address-space lock held, because
//! evicting a victim takes the victim owner's address-space lock.
//!
//! [`MmStruct`]: process::MmStruct

#![deny(rustdoc::broken_intra_doc_links)]

pub mod addressing;
pub mod config;
pub mod file_struct;
pub mod fs;
pub mod interrupt;
pub mod mm;
pub mod mmap;
pub mod page_fault;
pub mod process;
pub mod spt;
pub mod swap;
pub mod sync;
pub mod syscall;
pub mod vm;

pub use process::{Pid, Process};
pub use vm::Vm;

/// Represents errors that can occur in the virtual memory subsystem.
///
/// This enum provides a set of error codes that can be returned by system
/// calls and by the fault path. Each variant corresponds to a specific error
/// condition, and is converted to the negative errno value returned to user
/// space through [`KernelError::into_usize`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::NoSuchEntry => -2isize,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NoSuchSyscall => -38,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }

    /// Whether a system call failing with this error takes the caller down
    /// with it.
    ///
    /// Invalid handles, invalid user pointers and resource exhaustion are
    /// not reported back to user space; the process is terminated instead.
    /// Every other error is returned as an errno value.
    pub fn terminates_process(&self) -> bool {
        matches!(
            self,
            KernelError::BadFileDescriptor
                | KernelError::BadAddress
                | KernelError::InvalidAccess
                | KernelError::NoMemory
                | KernelError::NoSpace
        )
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            KernelError::NoSuchEntry => "no such file or directory",
            KernelError::IOError => "i/o error",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::NoMemory => "out of memory",
            KernelError::InvalidAccess => "permission denied",
            KernelError::BadAddress => "bad address",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NoSpace => "no space left on device",
            KernelError::NoSuchSyscall => "invalid system call number",
            KernelError::NotSupportedOperation => "operation not supported",
        };
        f.write_str(s)
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -9 => Ok(Self::BadFileDescriptor),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -22 => Ok(Self::InvalidArgument),
            -28 => Ok(Self::NoSpace),
            -38 => Ok(Self::NoSuchSyscall),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}
