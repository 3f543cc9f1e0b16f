//! # System calls.
//!
//! A user program requests a kernel service with the `syscall` instruction.
//! The system call number is passed in `%rax`, the arguments in `%rdi`,
//! `%rsi`, `%rdx`, `%r10`, `%r8` and `%r9`, and the return value comes back in
//! `%rax`. [`SyscallAbi`] decodes a [`Registers`] snapshot along these lines
//! and [`Vm::syscall`] dispatches the request.
//!
//! | Number | Call       | Arguments           | Returns                 |
//! |--------|------------|---------------------|-------------------------|
//! | 1      | `exit`     | status              | does not return         |
//! | 6      | `open`     | name                | descriptor              |
//! | 7      | `filesize` | fd                  | length in bytes         |
//! | 8      | `read`     | fd, buffer, size    | bytes read              |
//! | 9      | `write`    | fd, buffer, size    | bytes written           |
//! | 10     | `seek`     | fd, position        | 0                       |
//! | 11     | `tell`     | fd                  | position                |
//! | 12     | `close`    | fd                  | 0                       |
//! | 13     | `mmap`     | fd, address         | mapping id              |
//! | 14     | `munmap`   | mapping id          | 0                       |
//!
//! ## Errors
//!
//! Handlers return `Result<usize, KernelError>`. Most errors are reported to
//! user space as a negative errno value in `%rax`. The exceptions are the
//! errors for which [`KernelError::terminates_process`] holds: an invalid
//! descriptor or mapping id, a bad user pointer, and running out of frames or
//! swap slots. The process does not get to see those; it is terminated with
//! exit status -1 instead.
//!
//! The public per-call methods ([`Vm::open`], [`Vm::read`], ...) apply the
//! same policy, so kernel code calling them directly observes the same
//! outcome as a user program would.

pub mod uaccess;

use crate::{
    KernelError, Pid, Vm,
    addressing::{PAGE_SIZE, Va},
    file_struct::FileDescriptor,
    fs::File,
    mmap::MapId,
};
use log::{debug, warn};
use num_enum::TryFromPrimitive;
use uaccess::{UserCString, UserU8SliceRO, UserU8SliceWO, access_ok};

/// Largest chunk handed to the console in one `putbuf` call.
pub const MAX_PUTBUF: usize = 512;

/// User registers captured at system call entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    /// System call number on entry, return value on exit.
    pub rax: usize,
    /// First argument.
    pub rdi: usize,
    /// Second argument.
    pub rsi: usize,
    /// Third argument.
    pub rdx: usize,
    /// Fourth argument.
    pub r10: usize,
    /// Fifth argument.
    pub r8: usize,
    /// Sixth argument.
    pub r9: usize,
    /// User stack pointer.
    pub rsp: usize,
}

/// A struct representing the system call ABI (Application Binary Interface).
///
/// It stores the system call number and up to six arguments, as well as a
/// mutable reference to the CPU registers ([`Registers`]) through which the
/// return value is delivered.
pub struct SyscallAbi<'a> {
    /// The system call number that identifies the requested system service.
    pub sysno: usize,
    /// First argument for the system call.
    pub arg1: usize,
    /// Second argument for the system call.
    pub arg2: usize,
    /// Third argument for the system call.
    pub arg3: usize,
    /// Fourth argument for the system call.
    pub arg4: usize,
    /// Fifth argument for the system call.
    pub arg5: usize,
    /// Sixth argument for the system call.
    pub arg6: usize,
    /// The captured registers.
    pub regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Constructs a [`SyscallAbi`] instance from the provided registers.
    pub fn from_registers(regs: &'a mut Registers) -> Self {
        Self {
            sysno: regs.rax,
            arg1: regs.rdi,
            arg2: regs.rsi,
            arg3: regs.rdx,
            arg4: regs.r10,
            arg5: regs.r8,
            arg6: regs.r9,
            regs,
        }
    }

    /// Sets the return value for the system call.
    ///
    /// On success `%rax` holds the returned value, on failure the errno of
    /// the error (see [`KernelError::into_usize`]).
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        self.regs.rax = match return_val {
            Ok(v) => v,
            Err(e) => e.into_usize(),
        };
    }
}

/// System call numbers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Terminates the calling process.
    Exit = 1,
    /// Opens a file by name.
    Open = 6,
    /// Size of an open file.
    Filesize = 7,
    /// Reads from a descriptor.
    Read = 8,
    /// Writes to a descriptor.
    Write = 9,
    /// Moves a descriptor's position.
    Seek = 10,
    /// Reports a descriptor's position.
    Tell = 11,
    /// Closes a descriptor.
    Close = 12,
    /// Maps an open file into memory.
    Mmap = 13,
    /// Removes a mapping.
    Munmap = 14,
}

/// Decodes a descriptor argument. A value that does not fit a descriptor
/// names no open file.
fn fd_arg(arg: usize) -> Result<FileDescriptor, KernelError> {
    i32::try_from(arg)
        .map(FileDescriptor)
        .map_err(|_| KernelError::BadFileDescriptor)
}

fn map_id_arg(arg: usize) -> Result<MapId, KernelError> {
    i32::try_from(arg)
        .map(MapId)
        .map_err(|_| KernelError::BadFileDescriptor)
}

impl Vm {
    /// Handles a system call of process `pid`.
    ///
    /// The user stack pointer in `regs` is recorded first: faults taken while
    /// the kernel touches user buffers are checked for stack growth against
    /// it.
    pub fn syscall(&self, pid: Pid, regs: &mut Registers) {
        let Some(process) = self.process(pid) else {
            return;
        };
        process.set_stack_pointer(regs.rsp);

        let abi = SyscallAbi::from_registers(regs);
        let result = match SyscallNumber::try_from(abi.sysno) {
            Ok(SyscallNumber::Exit) => {
                self.exit(pid, abi.arg1 as i32);
                return;
            }
            Ok(SyscallNumber::Open) => UserCString::new(abi.arg1)
                .read(self, pid)
                .and_then(|name| self.do_open(pid, &name))
                .map(|fd| fd.0 as usize),
            Ok(SyscallNumber::Filesize) => {
                fd_arg(abi.arg1).and_then(|fd| self.do_filesize(pid, fd))
            }
            Ok(SyscallNumber::Read) => {
                fd_arg(abi.arg1).and_then(|fd| self.do_read(pid, fd, abi.arg2, abi.arg3))
            }
            Ok(SyscallNumber::Write) => {
                fd_arg(abi.arg1).and_then(|fd| self.do_write(pid, fd, abi.arg2, abi.arg3))
            }
            Ok(SyscallNumber::Seek) => fd_arg(abi.arg1)
                .and_then(|fd| self.do_seek(pid, fd, abi.arg2))
                .map(|_| 0),
            Ok(SyscallNumber::Tell) => fd_arg(abi.arg1).and_then(|fd| self.do_tell(pid, fd)),
            Ok(SyscallNumber::Close) => fd_arg(abi.arg1)
                .and_then(|fd| self.do_close(pid, fd))
                .map(|_| 0),
            Ok(SyscallNumber::Mmap) => fd_arg(abi.arg1)
                .and_then(|fd| self.do_mmap(pid, fd, Va::new(abi.arg2)))
                .map(|id| id.0 as usize),
            Ok(SyscallNumber::Munmap) => map_id_arg(abi.arg1)
                .and_then(|id| self.do_munmap(pid, id))
                .map(|_| 0),
            Err(_) => Err(KernelError::NoSuchSyscall),
        };
        let result = self.check(pid, result);
        abi.set_return_value(result);
    }

    /// Terminates `pid` if `result` carries an error that is fatal to the
    /// caller.
    fn check<T>(&self, pid: Pid, result: Result<T, KernelError>) -> Result<T, KernelError> {
        if let Err(e) = &result {
            if e.terminates_process() && self.process(pid).is_some() {
                warn!("process {} killed: {}", pid, e);
                self.exit(pid, -1);
            }
        }
        result
    }

    /// Runs `f` on the open file `fd` of `pid`, under the filesystem lock.
    fn with_file<R>(
        &self,
        pid: Pid,
        fd: FileDescriptor,
        f: impl FnOnce(&mut File) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        let fs = self.fs_lock();
        let mut fds = self.fds.lock();
        let result = f(fds.get_mut(pid, fd)?);
        fds.unlock();
        fs.unlock();
        result
    }

    /// Opens the file `name`.
    pub fn open(&self, pid: Pid, name: &str) -> Result<FileDescriptor, KernelError> {
        self.check(pid, self.do_open(pid, name))
    }

    fn do_open(&self, pid: Pid, name: &str) -> Result<FileDescriptor, KernelError> {
        self.process(pid).ok_or(KernelError::InvalidArgument)?;
        let fs = self.fs_lock();
        let file = fs.open(name)?;
        let fd = self.fds.lock().install(pid, File::new(file));
        fs.unlock();
        Ok(fd)
    }

    /// Size of the open file `fd`, in bytes.
    pub fn filesize(&self, pid: Pid, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.check(pid, self.do_filesize(pid, fd))
    }

    fn do_filesize(&self, pid: Pid, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.with_file(pid, fd, |file| Ok(file.length()))
    }

    /// Reads up to `size` bytes from `fd` into the user buffer at `buf`.
    ///
    /// Reading from the console takes `size` key presses. The whole buffer
    /// is checked before the first key is taken. Reading from descriptor 1 is
    /// an invalid-handle error.
    pub fn read(
        &self,
        pid: Pid,
        fd: FileDescriptor,
        buf: usize,
        size: usize,
    ) -> Result<usize, KernelError> {
        self.check(pid, self.do_read(pid, fd, buf, size))
    }

    fn do_read(
        &self,
        pid: Pid,
        fd: FileDescriptor,
        buf: usize,
        size: usize,
    ) -> Result<usize, KernelError> {
        match fd {
            FileDescriptor::STDOUT => Err(KernelError::BadFileDescriptor),
            FileDescriptor::STDIN => {
                access_ok(self, buf, size)?;
                let mut bounce = [0; PAGE_SIZE];
                let mut done = 0;
                while done < size {
                    let n = (size - done).min(PAGE_SIZE);
                    bounce[..n].fill_with(|| self.console.getc());
                    UserU8SliceWO::new(buf + done, n).put(self, pid, &bounce[..n])?;
                    done += n;
                }
                Ok(size)
            }
            fd => {
                let mut bounce = vec![0; size.min(PAGE_SIZE)];
                let mut done = 0;
                loop {
                    let n = (size - done).min(PAGE_SIZE);
                    let read = self.with_file(pid, fd, |file| file.read(&mut bounce[..n]))?;
                    UserU8SliceWO::new(buf.saturating_add(done), read).put(self, pid, &bounce[..read])?;
                    done += read;
                    if read < n || done == size {
                        return Ok(done);
                    }
                }
            }
        }
    }

    /// Writes `size` bytes from the user buffer at `buf` to `fd`.
    ///
    /// Console output is handed to the console in pieces of at most
    /// [`MAX_PUTBUF`] bytes. Writing to descriptor 0 is an invalid-handle
    /// error. Files do not grow: the write stops at the end of the file.
    pub fn write(
        &self,
        pid: Pid,
        fd: FileDescriptor,
        buf: usize,
        size: usize,
    ) -> Result<usize, KernelError> {
        self.check(pid, self.do_write(pid, fd, buf, size))
    }

    fn do_write(
        &self,
        pid: Pid,
        fd: FileDescriptor,
        buf: usize,
        size: usize,
    ) -> Result<usize, KernelError> {
        match fd {
            FileDescriptor::STDIN => Err(KernelError::BadFileDescriptor),
            FileDescriptor::STDOUT => {
                let mut done = 0;
                while done < size {
                    let n = (size - done).min(MAX_PUTBUF);
                    let chunk = UserU8SliceRO::new(buf.saturating_add(done), n).get(self, pid)?;
                    self.console.putbuf(&chunk);
                    done += n;
                }
                Ok(size)
            }
            fd => {
                let mut done = 0;
                loop {
                    let n = (size - done).min(PAGE_SIZE);
                    let chunk = UserU8SliceRO::new(buf.saturating_add(done), n).get(self, pid)?;
                    let written = self.with_file(pid, fd, |file| file.write(&chunk))?;
                    done += written;
                    if written < n || done == size {
                        return Ok(done);
                    }
                }
            }
        }
    }

    /// Moves the position of `fd` to `position`.
    pub fn seek(&self, pid: Pid, fd: FileDescriptor, position: usize) -> Result<(), KernelError> {
        self.check(pid, self.do_seek(pid, fd, position))
    }

    fn do_seek(&self, pid: Pid, fd: FileDescriptor, position: usize) -> Result<(), KernelError> {
        self.with_file(pid, fd, |file| {
            file.seek(position);
            Ok(())
        })
    }

    /// Position of `fd`.
    pub fn tell(&self, pid: Pid, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.check(pid, self.do_tell(pid, fd))
    }

    fn do_tell(&self, pid: Pid, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.with_file(pid, fd, |file| Ok(file.tell()))
    }

    /// Closes `fd`. Closing a descriptor that is not open, including a second
    /// close of the same value, terminates the process.
    pub fn close(&self, pid: Pid, fd: FileDescriptor) -> Result<(), KernelError> {
        self.check(pid, self.do_close(pid, fd))
    }

    fn do_close(&self, pid: Pid, fd: FileDescriptor) -> Result<(), KernelError> {
        self.close_fd(pid, fd)
    }

    pub(crate) fn close_fd(&self, pid: Pid, fd: FileDescriptor) -> Result<(), KernelError> {
        let fs = self.fs_lock();
        let file = self.fds.lock().remove(pid, fd)?;
        drop(file);
        fs.unlock();
        Ok(())
    }

    /// Maps the file open as `fd` at `addr`.
    ///
    /// The file is reopened, so the mapping outlives `fd`. No page is read
    /// until it is touched.
    ///
    /// # Returns
    /// The mapping id, or [`KernelError::InvalidArgument`] (leaving the
    /// process alone) if `fd` is a console descriptor, `addr` is null,
    /// unaligned or not a user address, the file is empty, or the range
    /// overlaps a page the process already has or leaves user space.
    pub fn mmap(&self, pid: Pid, fd: FileDescriptor, addr: Va) -> Result<MapId, KernelError> {
        self.check(pid, self.do_mmap(pid, fd, addr))
    }

    fn do_mmap(&self, pid: Pid, fd: FileDescriptor, addr: Va) -> Result<MapId, KernelError> {
        if fd.is_console()
            || addr == Va::ZERO
            || !addr.is_page_aligned()
            || !self.config.is_user_vaddr(addr)
        {
            return Err(KernelError::InvalidArgument);
        }
        let process = self.process(pid).ok_or(KernelError::InvalidArgument)?;

        let fs = self.fs_lock();
        let length = self.do_filesize(pid, fd)?;
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let file = self.with_file(pid, fd, |file| Ok(file.reopen()))?;
        fs.unlock();

        let pages = length.div_ceil(PAGE_SIZE);
        let end = addr
            .checked_add(pages * PAGE_SIZE)
            .ok_or(KernelError::InvalidArgument)?;
        if end > self.config.user_top {
            return Err(KernelError::InvalidArgument);
        }

        let mut mm = process.mm();
        let occupied = (0..pages)
            .map(|i| addr + i * PAGE_SIZE)
            .any(|va| mm.spt.contains(va) || mm.page_table.is_mapped(va));
        if occupied || mm.mappings.overlaps(addr, pages) {
            return Err(KernelError::InvalidArgument);
        }
        let id = mm.mappings.insert(file, addr, length);
        mm.unlock();
        debug!("{}: mmap {:?} at {} ({} bytes)", pid, id, addr, length);
        Ok(id)
    }

    /// Removes mapping `id`, writing its dirty pages back to the file. An
    /// unknown id terminates the process.
    pub fn munmap(&self, pid: Pid, id: MapId) -> Result<(), KernelError> {
        self.check(pid, self.do_munmap(pid, id))
    }

    fn do_munmap(&self, pid: Pid, id: MapId) -> Result<(), KernelError> {
        let process = self.process(pid).ok_or(KernelError::InvalidArgument)?;
        self.unmap(&process, id)
    }
}
