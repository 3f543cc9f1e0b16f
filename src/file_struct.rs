//! # Descriptor table.
//!
//! Processes interact with files through **file descriptors**, small integers
//! that serve as opaque handles to open file objects living in kernel space.
//!
//! Descriptors 0 and 1 are reserved for the console input and output. Every
//! other descriptor is handed out from a single, kernel-wide table: values
//! start at 2 and increase monotonically, so a live value is unique across
//! the whole system and is never reused while the kernel runs.
//!
//! Each entry of the table records the process that opened it. Looking up a
//! descriptor that does not exist, or that belongs to another process, fails
//! with [`KernelError::BadFileDescriptor`]; the system call layer terminates
//! the caller on that error. Since [`FdTable::remove`] takes the entry out of
//! the table, the second close of the same value fails the lookup and the
//! node is never released twice.

use crate::{KernelError, fs::File, process::Pid};
use std::collections::BTreeMap;

/// Represents an index into the descriptor table.
///
/// A [`FileDescriptor`] is a wrapper around an `i32` that provides stronger
/// type safety when handling these indices in the kernel.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct FileDescriptor(pub i32);

impl FileDescriptor {
    /// Console input.
    pub const STDIN: Self = Self(0);
    /// Console output.
    pub const STDOUT: Self = Self(1);
    /// First value handed out by [`FdTable::install`].
    pub const FIRST: Self = Self(2);

    /// Whether this descriptor names the console.
    #[inline]
    pub fn is_console(self) -> bool {
        self == Self::STDIN || self == Self::STDOUT
    }
}

struct FdNode {
    owner: Pid,
    file: File,
}

/// The kernel-wide table of open files.
pub struct FdTable {
    nodes: BTreeMap<FileDescriptor, FdNode>,
    next_fd: i32,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            next_fd: FileDescriptor::FIRST.0,
        }
    }

    /// Installs `file` on behalf of `owner`, returning its new descriptor.
    pub fn install(&mut self, owner: Pid, file: File) -> FileDescriptor {
        let fd = FileDescriptor(self.next_fd);
        self.next_fd += 1;
        self.nodes.insert(fd, FdNode { owner, file });
        fd
    }

    /// Looks up `fd` on behalf of `owner`.
    ///
    /// # Returns
    /// The open file, or [`KernelError::BadFileDescriptor`] if `fd` is not
    /// open or is owned by another process.
    pub fn get(&self, owner: Pid, fd: FileDescriptor) -> Result<&File, KernelError> {
        match self.nodes.get(&fd) {
            Some(node) if node.owner == owner => Ok(&node.file),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Mutable version of [`FdTable::get`].
    pub fn get_mut(&mut self, owner: Pid, fd: FileDescriptor) -> Result<&mut File, KernelError> {
        match self.nodes.get_mut(&fd) {
            Some(node) if node.owner == owner => Ok(&mut node.file),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Removes `fd` from the table, returning the file it referred to.
    pub fn remove(&mut self, owner: Pid, fd: FileDescriptor) -> Result<File, KernelError> {
        self.get(owner, fd)?;
        self.nodes
            .remove(&fd)
            .map(|node| node.file)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Every descriptor currently owned by `owner`, in ascending order.
    pub fn fds_of(&self, owner: Pid) -> Vec<FileDescriptor> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.owner == owner)
            .map(|(fd, _)| *fd)
            .collect()
    }

    /// Number of open descriptors across all processes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no descriptor is open.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
