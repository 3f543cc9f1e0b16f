mod common;

use common::{USER_TOP, boot, boot_with, pattern};
use keos_vm::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    config::VmConfigBuilder,
    spt::{Origin, PageKind},
};

/// A push just below the stack pointer grows the stack by one zeroed page.
#[test]
fn push_grows_stack() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("grow");
    let process = k.vm.process(pid).unwrap();
    let sp = USER_TOP - PAGE_SIZE - 16;
    process.set_stack_pointer(sp);

    // `PUSHA` may touch 32 bytes below the stack pointer.
    k.poke(pid, sp - 32, b"pusha");
    let page = (sp - 32) & !(PAGE_SIZE - 1);
    assert!(matches!(
        k.kind(pid, page),
        Some(PageKind::Resident {
            origin: Origin::ZeroFill,
            ..
        })
    ));
    assert_eq!(k.peek(pid, sp - 32, 5), b"pusha");
    assert_eq!(k.peek(pid, page, 8), vec![0; 8], "grown page is not zeroed");
}

/// Refaulting a grown page is an ordinary access, not another growth.
#[test]
fn growth_is_idempotent() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("idem");
    let sp = USER_TOP - 3 * PAGE_SIZE;
    k.vm.process(pid).unwrap().set_stack_pointer(sp);

    k.poke(pid, sp - 4, b"abcd");
    let entries = k.vm.process(pid).unwrap().mm().spt.len();
    let faults = k.vm.page_fault_count();

    k.poke(pid, sp - 4, b"efgh");
    assert_eq!(k.peek(pid, sp - 4, 4), b"efgh");
    assert_eq!(k.vm.page_fault_count(), faults, "resident stack page faulted");
    assert_eq!(k.vm.process(pid).unwrap().mm().spt.len(), entries);
}

/// A grown stack page is swapped like any other anonymous page.
#[test]
fn grown_page_survives_eviction() {
    let k = boot(1, 8, &[]);
    let pid = k.vm.spawn("deep");
    let data = pattern(8, 64);
    let sp = USER_TOP - 4 * PAGE_SIZE;
    k.vm.process(pid).unwrap().set_stack_pointer(sp);
    k.poke(pid, sp - 64, &data);

    // Touching the top page evicts the grown one.
    k.poke(pid, USER_TOP - 8, b"top");
    assert!(matches!(
        k.kind(pid, sp - 64),
        Some(PageKind::Swapped(_))
    ));
    assert_eq!(k.peek(pid, sp - 64, 64), data);
}

/// An access far below the stack pointer is not a stack access.
#[test]
fn far_below_stack_pointer_terminates() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("far");
    let sp = USER_TOP - PAGE_SIZE;
    k.vm.process(pid).unwrap().set_stack_pointer(sp);
    assert_eq!(
        k.vm.user_write(pid, Va::new(sp - 33), b"x"),
        Err(KernelError::BadAddress)
    );
    assert_eq!(k.vm.exit_status(pid), Some(-1));
}

/// The stack never grows past its maximum size.
#[test]
fn growth_beyond_limit_terminates() {
    let config = VmConfigBuilder::new()
        .user_frames(4)
        .swap_slots(8)
        .max_stack_size(4 * PAGE_SIZE)
        .build();
    let k = boot_with(config, &[]);

    let ok = k.vm.spawn("within");
    let sp = USER_TOP - 3 * PAGE_SIZE;
    k.vm.process(ok).unwrap().set_stack_pointer(sp);
    // Lands in the fourth page from the top.
    k.poke(ok, sp - 8, b"edge");

    let bad = k.vm.spawn("beyond");
    let sp = USER_TOP - 4 * PAGE_SIZE;
    k.vm.process(bad).unwrap().set_stack_pointer(sp);
    // Would be the fifth page.
    assert_eq!(
        k.vm.user_write(bad, Va::new(sp - 8), b"over"),
        Err(KernelError::BadAddress)
    );
    assert_eq!(k.vm.exit_status(bad), Some(-1));
    assert_eq!(k.vm.exit_status(ok), None);
}

/// A `read` into a buffer just below the saved stack pointer grows the stack
/// while the kernel copies into it.
#[test]
fn read_into_unmapped_stack_buffer() {
    let data = pattern(6, 100);
    let k = boot(4, 8, &[("input", &data)]);
    let pid = k.vm.spawn("reader");

    // The file name lives in the initial stack page.
    let name = USER_TOP - 64;
    k.poke(pid, name, b"input\0");
    let rsp = USER_TOP - 2 * PAGE_SIZE;
    let fd = k.syscall(pid, rsp, 6, &[name]);
    assert_eq!(fd, 2);

    let buf = rsp - 16;
    assert_eq!(k.syscall(pid, rsp, 8, &[fd as usize, buf, 32]), 32);
    assert!(k.is_resident(pid, buf));
    assert!(k.is_resident(pid, rsp));
    assert_eq!(k.peek(pid, buf, 32), &data[..32]);
    assert_eq!(k.vm.exit_status(pid), None);
}
