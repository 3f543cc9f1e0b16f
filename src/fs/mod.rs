//! Filesystem abstraction.
//!
//! The memory manager treats the file system driver as an external
//! collaborator. This module defines the seam: the driver implements
//! [`traits::FileSystem`] and [`traits::RegularFile`], which work at the
//! granularity of 4 KiB file blocks, and the kernel accesses files through
//! the byte-oriented [`RegularFile`] handle and the positioned [`File`].
//!
//! Every call into the driver must be made while holding the kernel's
//! filesystem lock (see [`Vm::fs_lock`]).
//!
//! The swap area sits on a [`BlockDevice`], addressed in 512-byte
//! [`Sector`]s, and the console handles are served by a [`Console`].
//!
//! In-memory implementations of all of these live in [`mem`].
//!
//! [`Vm::fs_lock`]: crate::Vm::fs_lock

pub mod mem;

use crate::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE},
};
use std::sync::Arc;

/// Defines traits for file system operations.
pub mod traits {
    use super::FileBlockNumber;
    use crate::{KernelError, addressing::PAGE_SIZE};

    /// Trait representing a filesystem.
    pub trait FileSystem
    where
        Self: Sync + Send,
    {
        /// Opens the file called `name`.
        ///
        /// # Returns
        /// - `Ok(RegularFile)`: A fresh handle to the file.
        /// - `Err(KernelError::NoSuchEntry)`: If no such file exists.
        fn open(&self, name: &str) -> Result<super::RegularFile, KernelError>;
    }

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports basic read and write
    /// operations at the granularity of file blocks.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file into the provided buffer.
        ///
        /// Bytes of the block past the end of the file read as zero.
        ///
        /// # Parameters
        /// - `fba`: The `FileBlockNumber` which to read.
        /// - `buf`: A mutable array where the file content will be stored.
        ///
        /// # Returns
        /// - `Ok(true)`: If the block lies (at least partially) in the file.
        /// - `Ok(false)`: If the block lies past the end of the file.
        /// - `Err(Error)`: An error occured while the read operation.
        fn read(&self, fba: FileBlockNumber, buf: &mut [u8; PAGE_SIZE])
        -> Result<bool, KernelError>;

        /// Writes a 4096-byte page of data into the specified file block.
        ///
        /// If the target block lies beyond the current end of the file, the
        /// file is extended up to `min_size` bytes. Bytes of `buf` that fall
        /// past the resulting file size are not stored.
        ///
        /// # Parameters
        /// - `fba`: The `FileBlockNumber` indicating the block to write to.
        /// - `buf`: A buffer containing exactly 4096 bytes of data to write.
        /// - `min_size`: The desired minimum file size (in bytes) after the
        ///   write. If this value is less than or equal to the current file
        ///   size, no growth occurs.
        ///
        /// # Returns
        /// - `Ok(())` if the write is successful.
        /// - `Err(KernelError)` if the operation fails (e.g., out-of-bounds
        ///   write, I/O error).
        fn write(
            &self,
            fba: FileBlockNumber,
            buf: &[u8; PAGE_SIZE],
            min_size: usize,
        ) -> Result<(), KernelError>;
    }
}

/// This struct provides a reference-counted handle to a file that supports
/// byte-granular reading and writing at the kernel level.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data at `position` into `buf`.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read. Short when the end of the
    ///   file is reached.
    /// - `Err(Error)`: An error if the read operation fails.
    pub fn read(&self, mut position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; PAGE_SIZE]);
        let max_read = self
            .size()
            .min(position.saturating_add(buf.len()))
            .saturating_sub(position);
        let mut read_bytes = 0;
        while read_bytes < max_read {
            let ofs = position & PAGE_MASK;
            let chunk = (PAGE_SIZE - ofs).min(max_read - read_bytes);
            self.0
                .read(FileBlockNumber::from_offset(position), &mut bounce_buffer)?;
            buf[read_bytes..read_bytes + chunk].copy_from_slice(&bounce_buffer[ofs..ofs + chunk]);
            position += chunk;
            read_bytes += chunk;
        }
        Ok(read_bytes)
    }

    /// Writes `buf` into the file at `position`.
    ///
    /// Files never grow through this interface: bytes that would land past
    /// the end of the file are not written.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes written.
    /// - `Err(Error)`: An error if the write operation fails.
    pub fn write(&self, mut position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; PAGE_SIZE]);
        let max_write = self
            .size()
            .min(position.saturating_add(buf.len()))
            .saturating_sub(position);
        let mut write_bytes = 0;
        while write_bytes < max_write {
            let ofs = position & PAGE_MASK;
            let chunk = (PAGE_SIZE - ofs).min(max_write - write_bytes);
            let fba = FileBlockNumber::from_offset(position);
            if chunk != PAGE_SIZE {
                self.0.read(fba, &mut bounce_buffer)?;
            }
            bounce_buffer[ofs..ofs + chunk]
                .copy_from_slice(&buf[write_bytes..write_bytes + chunk]);
            self.0.write(fba, &bounce_buffer, position + chunk)?;
            position += chunk;
            write_bytes += chunk;
        }
        Ok(write_bytes)
    }

    /// Returns true if both handles refer to the same underlying file.
    pub fn same_file(&self, other: &RegularFile) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for RegularFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegularFile")
            .field("size", &self.size())
            .finish()
    }
}

/// An open file: a [`RegularFile`] together with a file position.
#[derive(Debug)]
pub struct File {
    file: RegularFile,
    position: usize,
}

impl File {
    /// Open `file` with the position at its start.
    pub fn new(file: RegularFile) -> Self {
        Self { file, position: 0 }
    }

    /// Reads from the current position, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let n = self.file.read(self.position, buf)?;
        self.position += n;
        Ok(n)
    }

    /// Writes at the current position, advancing it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, KernelError> {
        let n = self.file.write(self.position, buf)?;
        self.position += n;
        Ok(n)
    }

    /// Reads at `position` without touching the file position.
    pub fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.file.read(position, buf)
    }

    /// Writes at `position` without touching the file position.
    pub fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        self.file.write(position, buf)
    }

    /// Moves the file position. Seeking past the end is allowed; reads
    /// there return 0 bytes.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Current file position.
    pub fn tell(&self) -> usize {
        self.position
    }

    /// Length of the file in bytes.
    pub fn length(&self) -> usize {
        self.file.size()
    }

    /// Opens a new, independent handle to the same file.
    pub fn reopen(&self) -> File {
        File::new(self.file.clone())
    }

    /// The underlying file.
    pub fn regular_file(&self) -> &RegularFile {
        &self.file
    }
}

/// Console device serving descriptors 0 and 1.
pub trait Console: Send + Sync {
    /// Waits for a key press and returns it.
    fn getc(&self) -> u8;

    /// Writes `buf` to the console in one piece.
    fn putbuf(&self, buf: &[u8]);
}

/// Sector, an access granuality for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// Size of a sector in bytes.
    pub const SIZE: usize = 512;

    /// Get offset that represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * Self::SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// Represents a file block number within a file.
///
/// Each block contains 4096 bytes of contents.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FileBlockNumber(pub usize);

impl FileBlockNumber {
    /// Computes the file block number from a byte offset within a file.
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset >> PAGE_SHIFT)
    }

    /// Byte offset of the first byte of this block.
    pub const fn into_offset(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

/// A device addressed in [`Sector`]s.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;

    /// Read 512 bytes from disk starting from sector.
    fn read(&self, sector: Sector, buf: &mut [u8; Sector::SIZE]) -> Result<(), KernelError>;

    /// Write 512 bytes to disk starting from sector.
    fn write(&self, sector: Sector, buf: &[u8; Sector::SIZE]) -> Result<(), KernelError>;
}
