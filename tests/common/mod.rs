//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use keos_vm::{
    Pid, Vm,
    addressing::{PAGE_SIZE, Va},
    config::{VmConfig, VmConfigBuilder},
    fs::{
        RegularFile,
        mem::{BufferConsole, MemFile, MemFs},
    },
    spt::PageKind,
    syscall::Registers,
};
use std::{collections::BTreeMap, sync::Arc};

/// Top of user space in every fixture.
pub const USER_TOP: usize = 0xC000_0000;

/// A booted kernel with its devices.
pub struct Kernel {
    pub vm: Vm,
    pub console: Arc<BufferConsole>,
    pub files: BTreeMap<String, Arc<MemFile>>,
}

impl Kernel {
    /// A handle on the file `name`, shared with the file system.
    pub fn file(&self, name: &str) -> RegularFile {
        RegularFile(self.files[name].clone())
    }

    /// Current content of the file `name`.
    pub fn contents(&self, name: &str) -> Vec<u8> {
        self.files[name].contents()
    }

    /// Everything written to the console so far.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.console.output()).into_owned()
    }

    /// Whether the page containing `va` of `pid` is resident.
    pub fn is_resident(&self, pid: Pid, va: usize) -> bool {
        let process = self.vm.process(pid).expect("process is alive");
        let mm = process.mm();
        mm.spt
            .get(Va::new(va))
            .is_some_and(|p| p.is_resident())
    }

    /// The kind of the page containing `va` of `pid`.
    pub fn kind(&self, pid: Pid, va: usize) -> Option<PageKind> {
        let process = self.vm.process(pid)?;
        let mm = process.mm();
        mm.spt.get(Va::new(va)).map(|p| p.kind.clone())
    }

    /// Reads `len` bytes of user memory.
    pub fn peek(&self, pid: Pid, va: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.vm
            .user_read(pid, Va::new(va), &mut buf)
            .expect("user read failed");
        buf
    }

    /// Writes `data` to user memory.
    pub fn poke(&self, pid: Pid, va: usize, data: &[u8]) {
        self.vm
            .user_write(pid, Va::new(va), data)
            .expect("user write failed");
    }

    /// Issues system call `sysno` as `pid` with stack pointer `rsp`.
    pub fn syscall(&self, pid: Pid, rsp: usize, sysno: usize, args: &[usize]) -> isize {
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        let mut regs = Registers {
            rax: sysno,
            rdi: arg(0),
            rsi: arg(1),
            rdx: arg(2),
            r10: arg(3),
            r8: arg(4),
            r9: arg(5),
            rsp,
        };
        self.vm.syscall(pid, &mut regs);
        regs.rax as isize
    }
}

/// Boots a kernel with `frames` user frames, `slots` swap slots and the
/// given files.
pub fn boot(frames: usize, slots: usize, files: &[(&str, &[u8])]) -> Kernel {
    let config = VmConfigBuilder::new()
        .user_frames(frames)
        .swap_slots(slots)
        .build();
    boot_with(config, files)
}

/// Boots a kernel with `config` and the given files.
pub fn boot_with(config: VmConfig, files: &[(&str, &[u8])]) -> Kernel {
    let fs = MemFs::new();
    let files = files
        .iter()
        .map(|(name, data)| (name.to_string(), fs.add(name, data.to_vec())))
        .collect();
    let console = Arc::new(BufferConsole::new());
    let vm = Vm::new(config, fs, console.clone());
    Kernel { vm, console, files }
}

/// `len` bytes of a recognizable pattern seeded by `seed`.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8))
        .collect()
}

/// A page of `seed` bytes.
pub fn page_of(seed: u8) -> Vec<u8> {
    vec![seed; PAGE_SIZE]
}
