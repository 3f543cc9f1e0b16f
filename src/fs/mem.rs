//! In-memory devices.
//!
//! [`MemFs`], [`MemFile`], [`MemDisk`] and [`BufferConsole`] implement the
//! driver interfaces of the parent module on top of plain memory, so that the
//! memory manager can run without real hardware.

use super::{BlockDevice, Console, FileBlockNumber, RegularFile, Sector, traits};
use crate::{KernelError, addressing::PAGE_SIZE, sync::SpinLock};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

/// A file whose content lives in memory.
pub struct MemFile {
    data: SpinLock<Vec<u8>>,
}

impl MemFile {
    /// Creates a file holding `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: SpinLock::new(data),
        }
    }

    /// Snapshot of the file content.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl traits::RegularFile for MemFile {
    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, KernelError> {
        let data = self.data.lock();
        let start = fba.into_offset();
        buf.fill(0);
        if start >= data.len() {
            return Ok(false);
        }
        let end = data.len().min(start + PAGE_SIZE);
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(true)
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; PAGE_SIZE],
        min_size: usize,
    ) -> Result<(), KernelError> {
        let mut data = self.data.lock();
        let start = fba.into_offset();
        let size = data.len().max(min_size);
        if start >= size {
            return Err(KernelError::InvalidArgument);
        }
        data.resize(size, 0);
        let end = size.min(start + PAGE_SIZE);
        data[start..end].copy_from_slice(&buf[..end - start]);
        Ok(())
    }
}

/// A flat namespace of [`MemFile`]s.
#[derive(Default)]
pub struct MemFs {
    files: SpinLock<BTreeMap<String, Arc<MemFile>>>,
}

impl MemFs {
    /// Creates an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the file `name` with `data`. The returned handle
    /// observes every later write to the file.
    pub fn add(&self, name: &str, data: impl Into<Vec<u8>>) -> Arc<MemFile> {
        let file = Arc::new(MemFile::new(data.into()));
        self.files.lock().insert(name.to_string(), file.clone());
        file
    }
}

impl traits::FileSystem for MemFs {
    fn open(&self, name: &str) -> Result<RegularFile, KernelError> {
        let files = self.files.lock();
        let file: Arc<dyn traits::RegularFile> =
            files.get(name).ok_or(KernelError::NoSuchEntry)?.clone();
        Ok(RegularFile(file))
    }
}

// The type for disk hooking.
#[doc(hidden)]
pub type Hook =
    Arc<dyn Fn(Sector, &[u8; Sector::SIZE], bool) -> Result<(), KernelError> + Send + Sync>;

/// A disk backed by memory.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; Sector::SIZE]>>,
    hook: Option<Hook>,
}

impl MemDisk {
    /// Creates a zero-filled disk of `sector_count` sectors.
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0; Sector::SIZE]; sector_count]),
            hook: None,
        }
    }

    /// Add a hook for the disk. The hook sees every access before it is
    /// performed, with `true` for writes, and may fail it.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            sectors: self.sectors,
            hook: Some(hook),
        }
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().len()
    }

    fn read(&self, sector: Sector, buf: &mut [u8; Sector::SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        let sectors = self.sectors.lock();
        *buf = *sectors.get(sector.into_usize()).ok_or(KernelError::IOError)?;
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; Sector::SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, true)?;
        }
        let mut sectors = self.sectors.lock();
        *sectors
            .get_mut(sector.into_usize())
            .ok_or(KernelError::IOError)? = *buf;
        Ok(())
    }
}

/// A console that reads from a queue and records what is written.
#[derive(Default)]
pub struct BufferConsole {
    input: SpinLock<VecDeque<u8>>,
    output: SpinLock<Vec<u8>>,
    chunks: SpinLock<Vec<usize>>,
}

impl BufferConsole {
    /// Creates a console with no pending input.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `bytes` as keyboard input.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    /// Sizes of the individual `putbuf` calls so far.
    pub fn chunks(&self) -> Vec<usize> {
        self.chunks.lock().clone()
    }
}

impl Console for BufferConsole {
    /// Returns 0 once the queued input is exhausted.
    fn getc(&self) -> u8 {
        self.input.lock().pop_front().unwrap_or(0)
    }

    fn putbuf(&self, buf: &[u8]) {
        self.output.lock().extend_from_slice(buf);
        self.chunks.lock().push(buf.len());
    }
}
