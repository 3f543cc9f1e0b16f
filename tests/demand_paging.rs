mod common;

use common::{USER_TOP, boot, pattern};
use keos_vm::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    interrupt::{PFErrorCode, SoftTrap},
    mm::FrameState,
    spt::{Origin, PageKind},
};

const CODE: usize = 0x0804_8000;

/// A code page backed by 400 bytes of a file and a 3696-byte zero tail.
///
/// It ensures that:
/// - Nothing is read before the page is touched.
/// - The first 400 bytes of the frame equal the file bytes [0, 400).
/// - The remaining 3696 bytes are zero, even though the file has more bytes.
/// - The entry becomes resident.
#[test]
fn file_backed_page_with_zero_tail() {
    let data = pattern(3, 1000);
    let k = boot(4, 8, &[("code", &data)]);
    let pid = k.vm.spawn("scenario-a");
    k.vm
        .declare_segment(pid, &k.file("code"), 0, Va::new(CODE), 400, 3696, false)
        .unwrap();
    assert!(!k.is_resident(pid, CODE), "page loaded eagerly");
    assert_eq!(k.vm.frames().free_count(), 4);

    let page = k.peek(pid, CODE, PAGE_SIZE);
    assert_eq!(&page[..400], &data[..400], "file bytes mismatch");
    assert!(page[400..].iter().all(|b| *b == 0), "tail is not zeroed");
    assert!(k.is_resident(pid, CODE));
    assert!(matches!(
        k.kind(pid, CODE),
        Some(PageKind::Resident {
            origin: Origin::File(_),
            ..
        })
    ));
    assert_eq!(k.vm.frames().free_count(), 3);
}

/// Every page of a multi-page segment loads the right window of the file.
#[test]
fn segment_pages_load_their_own_offsets() {
    let data = pattern(9, 2 * PAGE_SIZE + 100);
    let k = boot(4, 8, &[("prog", &data)]);
    let pid = k.vm.spawn("loader");
    k.vm
        .declare_segment(
            pid,
            &k.file("prog"),
            0,
            Va::new(CODE),
            data.len(),
            4 * PAGE_SIZE - data.len(),
            true,
        )
        .unwrap();

    // Touch the pages out of order.
    assert_eq!(k.peek(pid, CODE + 2 * PAGE_SIZE, 100), &data[2 * PAGE_SIZE..]);
    assert_eq!(k.peek(pid, CODE, 10), &data[..10]);
    assert_eq!(
        k.peek(pid, CODE + PAGE_SIZE + 5, 20),
        &data[PAGE_SIZE + 5..PAGE_SIZE + 25]
    );
    assert_eq!(k.peek(pid, CODE + 3 * PAGE_SIZE, 8), vec![0; 8]);
    assert!(matches!(
        k.kind(pid, CODE + 3 * PAGE_SIZE),
        Some(PageKind::Resident {
            origin: Origin::ZeroFill,
            ..
        })
    ));
}

/// An access spanning two pages faults both in.
#[test]
fn access_across_page_boundary() {
    let data = pattern(1, 2 * PAGE_SIZE);
    let k = boot(4, 8, &[("prog", &data)]);
    let pid = k.vm.spawn("span");
    k.vm
        .declare_segment(pid, &k.file("prog"), 0, Va::new(CODE), 2 * PAGE_SIZE, 0, true)
        .unwrap();
    let got = k.peek(pid, CODE + PAGE_SIZE - 8, 16);
    assert_eq!(got, &data[PAGE_SIZE - 8..PAGE_SIZE + 8]);
    assert!(k.is_resident(pid, CODE));
    assert!(k.is_resident(pid, CODE + PAGE_SIZE));
}

/// A resident page does not fault again, and the frame belongs to its page.
#[test]
fn resident_page_is_installed_once() {
    let k = boot(4, 8, &[("prog", &pattern(2, PAGE_SIZE))]);
    let pid = k.vm.spawn("once");
    k.vm
        .declare_segment(pid, &k.file("prog"), 0, Va::new(CODE), PAGE_SIZE, 0, true)
        .unwrap();
    k.peek(pid, CODE, 1);
    let faults = k.vm.page_fault_count();
    k.poke(pid, CODE + 100, b"again");
    k.peek(pid, CODE + 200, 16);
    assert_eq!(k.vm.page_fault_count(), faults, "resident page faulted");

    let process = k.vm.process(pid).unwrap();
    let mm = process.mm();
    let frame = mm.spt.get(Va::new(CODE)).and_then(|p| p.frame()).unwrap();
    assert_eq!(mm.page_table.walk(Va::new(CODE)).unwrap().frame(), frame);
    assert!(mm.page_table.is_dirty(Va::new(CODE)));
    drop(mm);
    assert_eq!(
        k.vm.frames().state(frame),
        FrameState::Used {
            owner: pid,
            va: Va::new(CODE),
            pinned: false
        }
    );
}

/// Writing a read-only page is a protection violation and kills the process.
#[test]
fn write_to_read_only_page_terminates() {
    let k = boot(4, 8, &[("code", &pattern(5, 100))]);
    let pid = k.vm.spawn("rodata");
    k.vm
        .declare_segment(pid, &k.file("code"), 0, Va::new(CODE), 100, PAGE_SIZE - 100, false)
        .unwrap();

    assert_eq!(
        k.vm.user_write(pid, Va::new(CODE), b"x"),
        Err(KernelError::InvalidAccess)
    );
    assert_eq!(k.vm.exit_status(pid), Some(-1));
    assert!(k.vm.process(pid).is_none());
    assert_eq!(k.output(), "rodata: exit(-1)\n");
    assert_eq!(k.vm.frames().free_count(), 4, "frames leaked");
}

/// Null and kernel addresses are never legitimate.
#[test]
fn invalid_addresses_terminate() {
    let k = boot(4, 8, &[]);
    let a = k.vm.spawn("null");
    let mut byte = [0];
    assert_eq!(
        k.vm.user_read(a, Va::new(0x10), &mut byte),
        Err(KernelError::BadAddress)
    );
    assert_eq!(k.vm.exit_status(a), Some(-1));

    let b = k.vm.spawn("kernel");
    assert_eq!(
        k.vm.user_read(b, Va::new(USER_TOP + 0x100), &mut byte),
        Err(KernelError::BadAddress)
    );
    assert_eq!(k.vm.exit_status(b), Some(-1));

    let c = k.vm.spawn("wild");
    assert_eq!(
        k.vm.user_write(c, Va::new(0x2000_0000), b"?"),
        Err(KernelError::BadAddress),
        "undeclared page far from the stack"
    );
    assert_eq!(k.vm.exit_status(c), Some(-1));
}

/// The dispatcher reads the fault address with interrupts off and turns them
/// back on.
#[test]
fn dispatcher_reenables_interrupts() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("irq");
    let mut trap = SoftTrap::new(
        PFErrorCode::USER | PFErrorCode::WRITE_ACCESS,
        USER_TOP - 8,
        USER_TOP - 16,
    );
    assert!(!trap.interrupts_enabled());
    assert_eq!(k.vm.page_fault(pid, &mut trap), Ok(()));
    assert!(trap.interrupts_enabled());
    assert!(k.is_resident(pid, USER_TOP - 8));
}

/// A fault raised by kernel code is a kernel bug.
#[test]
#[should_panic(expected = "Unexpected page fault in Kernel")]
fn kernel_fault_panics() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("victim");
    let mut trap = SoftTrap::new(PFErrorCode::empty(), USER_TOP - 8, USER_TOP);
    let _ = k.vm.page_fault(pid, &mut trap);
}
