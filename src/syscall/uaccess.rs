//! The `uaccess` module provides abstractions for interacting with user-space
//! memory in a kernel context.
//!
//! - [`UserU8SliceRO`]: A one-time, read-only pointer to a slice of `u8` in
//!   user-space.
//! - [`UserU8SliceWO`]: A one-time, write-only pointer to a slice of `u8` in
//!   user-space.
//! - [`UserCString`]: A pointer to a C-style null-terminated string in
//!   user-space.
//!
//! The kernel touches user memory on behalf of the process that issued the
//! system call. The accesses go through the process's page table like any
//! other user access: a page that is not resident yet is faulted in, using the
//! stack pointer saved at system call entry for the stack growth check. A
//! range that reaches out of user space, or a fault that cannot be resolved,
//! fails with [`KernelError::BadAddress`] and the process does not survive it.
use crate::{KernelError, Pid, Vm, addressing::Va};

/// Checks that `[addr, addr + len)` lies in user space.
pub(crate) fn access_ok(vm: &Vm, addr: usize, len: usize) -> Result<Va, KernelError> {
    let start = Va::new(addr);
    let end = start.checked_add(len).ok_or(KernelError::BadAddress)?;
    if start == Va::ZERO || end > vm.config().user_top {
        return Err(KernelError::BadAddress);
    }
    Ok(start)
}

/// A one-time, read-only pointer to a slice of `u8` in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceRO {
    addr: usize,
    len: usize,
}

impl UserU8SliceRO {
    /// Creates a new `UserU8SliceRO` instance with the given user-space address
    /// and length.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceRO { addr, len }
    }

    /// Reads the user buffer into a `Vec<u8>`.
    ///
    /// Takes ownership of `self` to prevent TOCTOU attacks.
    pub fn get(self, vm: &Vm, pid: Pid) -> Result<Vec<u8>, KernelError> {
        let start = access_ok(vm, self.addr, self.len)?;
        let mut result = vec![0; self.len];
        vm.user_read(pid, start, &mut result)?;
        Ok(result)
    }
}

/// A one-time, write-only pointer to a slice of `u8` in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceWO {
    addr: usize,
    len: usize,
}

impl UserU8SliceWO {
    /// Creates a new `UserU8SliceWO` instance with the given user-space address
    /// and length.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceWO { addr, len }
    }

    /// Writes data from a slice to the user-space buffer.
    ///
    /// Takes ownership of `self` to prevent TOCTOU attacks.
    ///
    /// Returns `Ok(usize)` indicating the number of bytes written.
    pub fn put(self, vm: &Vm, pid: Pid, other: &[u8]) -> Result<usize, KernelError> {
        let size = self.len.min(other.len());
        let start = access_ok(vm, self.addr, self.len)?;
        vm.user_write(pid, start, &other[..size])?;
        Ok(size)
    }
}

/// A pointer to a null-terminated C-style string in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserCString {
    addr: usize,
}

impl UserCString {
    /// Creates a new `UserCString` instance with the given user-space address.
    pub fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// Reads a null-terminated string from the user-space address.
    ///
    /// Fails with [`KernelError::InvalidArgument`] if the bytes are not
    /// valid UTF-8.
    pub fn read(self, vm: &Vm, pid: Pid) -> Result<String, KernelError> {
        let mut ptr = self.addr;
        let mut result = Vec::new();
        loop {
            let mut byte = [0];
            let va = access_ok(vm, ptr, 1)?;
            vm.user_read(pid, va, &mut byte)?;
            if byte[0] == 0 {
                return String::from_utf8(result).map_err(|_| KernelError::InvalidArgument);
            }
            result.push(byte[0]);
            ptr += 1;
        }
    }
}
