use keos_vm::{
    KernelError, Pid, Vm,
    addressing::{PAGE_SIZE, Va},
    config::VmConfigBuilder,
    fs::{
        FileBlockNumber, RegularFile,
        mem::{BufferConsole, MemFile},
        traits::{self, RegularFile as _},
    },
    spt::PageKind,
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

const HEAP: usize = 0x1000_0000;
const MAP: usize = 0x2000_0000;

/// A file whose block writes stall on `gate` once armed.
struct GatedFile {
    inner: MemFile,
    armed: AtomicBool,
    entered: AtomicBool,
    gate: Mutex<()>,
}

impl traits::RegularFile for GatedFile {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, KernelError> {
        self.inner.read(fba, buf)
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; PAGE_SIZE],
        min_size: usize,
    ) -> Result<(), KernelError> {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.store(true, Ordering::SeqCst);
            drop(self.gate.lock().unwrap());
        }
        self.inner.write(fba, buf, min_size)
    }
}

struct GatedFs(RegularFile);

impl traits::FileSystem for GatedFs {
    fn open(&self, name: &str) -> Result<RegularFile, KernelError> {
        match name {
            "gated" => Ok(self.0.clone()),
            _ => Err(KernelError::NoSuchEntry),
        }
    }
}

fn poke(vm: &Vm, pid: Pid, addr: usize, bytes: &[u8]) {
    vm.user_write(pid, Va::new(addr), bytes).unwrap();
}

fn peek(vm: &Vm, pid: Pid, addr: usize, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    vm.user_read(pid, Va::new(addr), &mut buf).unwrap();
    buf
}

/// A fault that planned to swap a page in from one slot, and stalled in
/// eviction while the page was loaded, dirtied and evicted to another slot,
/// must not touch the old slot. It retries and reads the current content.
#[test]
fn stale_swap_fault_retries() {
    let file = Arc::new(GatedFile {
        inner: MemFile::new(vec![b'.'; 100]),
        armed: AtomicBool::new(false),
        entered: AtomicBool::new(false),
        gate: Mutex::new(()),
    });
    let shared: Arc<dyn traits::RegularFile> = file.clone();
    let handle = RegularFile(shared);
    let config = VmConfigBuilder::new().user_frames(3).swap_slots(8).build();
    let vm = Vm::new(
        config,
        GatedFs(handle.clone()),
        Arc::new(BufferConsole::new()),
    );

    let p = vm.spawn("victim");
    let q = vm.spawn("mapper");
    vm.declare_segment(p, &handle, 0, Va::new(HEAP), 0, 4 * PAGE_SIZE, true)
        .unwrap();
    let fd = vm.open(q, "gated").unwrap();
    vm.mmap(q, fd, Va::new(MAP)).unwrap();

    let (a, b, c) = (HEAP, HEAP + PAGE_SIZE, HEAP + 2 * PAGE_SIZE);
    // Frames 0, 1, 2 in order: A of P, the mapped page of Q, B of P.
    poke(&vm, p, a, b"A0");
    poke(&vm, q, MAP, b"q");
    poke(&vm, p, b, b"B0");
    // C evicts A to swap.
    poke(&vm, p, c, b"C0");
    assert!(matches!(
        vm.process(p).unwrap().mm().spt.get(Va::new(a)).map(|e| &e.kind),
        Some(PageKind::Swapped(_))
    ));

    let held = file.gate.lock().unwrap();
    file.armed.store(true, Ordering::SeqCst);
    thread::scope(|s| {
        // Plans a swap-in of A, then stalls writing Q's dirty page back.
        let stalled = s.spawn(|| {
            let mut buf = [0; 5];
            vm.user_read(p, Va::new(a), &mut buf).map(|_| buf)
        });
        while !file.entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        // A comes back, is dirtied and leaves again through another slot.
        poke(&vm, p, a, b"dirty");
        poke(&vm, p, b, b"B1");
        poke(&vm, p, c, b"C1");
        assert!(matches!(
            vm.process(p).unwrap().mm().spt.get(Va::new(a)).map(|e| &e.kind),
            Some(PageKind::Swapped(_))
        ));

        drop(held);
        assert_eq!(stalled.join().unwrap(), Ok(*b"dirty"));
    });

    assert_eq!(vm.exit_status(p), None, "stale fault killed the process");
    assert_eq!(peek(&vm, p, b, 2), b"B1");
    assert_eq!(peek(&vm, p, c, 2), b"C1");
    assert_eq!(peek(&vm, p, a, 5), b"dirty");
    assert_eq!(&file.inner.contents()[..2], b"q.");
    assert_eq!(vm.swap().used_count(), 0, "swap slot leaked");
}
