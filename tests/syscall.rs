mod common;

use common::{Kernel, USER_TOP, boot, pattern};
use keos_vm::{
    KernelError, Pid,
    addressing::PAGE_SIZE,
    file_struct::FileDescriptor,
};

const SYS_EXIT: usize = 1;
const SYS_OPEN: usize = 6;
const SYS_FILESIZE: usize = 7;
const SYS_READ: usize = 8;
const SYS_WRITE: usize = 9;
const SYS_SEEK: usize = 10;
const SYS_TELL: usize = 11;
const SYS_CLOSE: usize = 12;

/// Stack pointer used by the register-driven tests. Everything they touch
/// lives in the initial stack page.
const RSP: usize = USER_TOP - 2048;

/// Places `name` as a C string in user memory and opens it.
fn open(k: &Kernel, pid: Pid, name: &str) -> isize {
    let addr = USER_TOP - 64;
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    k.poke(pid, addr, &bytes);
    k.syscall(pid, RSP, SYS_OPEN, &[addr])
}

/// Walks a file with `open`, `filesize`, `read`, `seek`, `tell` and `close`
/// issued through registers.
#[test]
fn file_calls_through_registers() {
    let data = pattern(1, 300);
    let k = boot(4, 8, &[("data", &data)]);
    let pid = k.vm.spawn("files");
    let buf = USER_TOP - 1024;

    let fd = open(&k, pid, "data");
    assert_eq!(fd, 2, "first descriptor after the console");
    let fd = fd as usize;
    assert_eq!(k.syscall(pid, RSP, SYS_FILESIZE, &[fd]), 300);

    assert_eq!(k.syscall(pid, RSP, SYS_READ, &[fd, buf, 100]), 100);
    assert_eq!(k.peek(pid, buf, 100), &data[..100]);
    assert_eq!(k.syscall(pid, RSP, SYS_TELL, &[fd]), 100);

    assert_eq!(k.syscall(pid, RSP, SYS_SEEK, &[fd, 290]), 0);
    assert_eq!(k.syscall(pid, RSP, SYS_READ, &[fd, buf, 100]), 10, "short read at end");
    assert_eq!(k.peek(pid, buf, 10), &data[290..]);
    assert_eq!(k.syscall(pid, RSP, SYS_READ, &[fd, buf, 100]), 0);
    assert_eq!(k.syscall(pid, RSP, SYS_TELL, &[fd]), 300);

    assert_eq!(k.syscall(pid, RSP, SYS_CLOSE, &[fd]), 0);
    assert_eq!(k.vm.open_file_count(), 0);
    assert_eq!(k.vm.exit_status(pid), None);
}

/// Descriptor values are unique across processes.
#[test]
fn descriptors_are_kernel_wide() {
    let k = boot(4, 8, &[("f", b"x")]);
    let a = k.vm.spawn("a");
    let b = k.vm.spawn("b");
    assert_eq!(k.vm.open(a, "f"), Ok(FileDescriptor(2)));
    assert_eq!(k.vm.open(b, "f"), Ok(FileDescriptor(3)));
    assert_eq!(k.vm.open(a, "f"), Ok(FileDescriptor(4)));
    assert_eq!(k.vm.open_file_count(), 3);
}

/// Closing a descriptor twice terminates the process.
#[test]
fn double_close_terminates() {
    let k = boot(4, 8, &[("f", b"x")]);
    let pid = k.vm.spawn("twice");
    let fd = k.vm.open(pid, "f").unwrap();
    assert_eq!(k.vm.close(pid, fd), Ok(()));
    assert_eq!(k.vm.close(pid, fd), Err(KernelError::BadFileDescriptor));
    assert_eq!(k.vm.exit_status(pid), Some(-1));
    assert_eq!(k.output(), "twice: exit(-1)\n");
}

/// Using another process's descriptor kills the caller, not the owner.
#[test]
fn foreign_descriptor_kills_only_caller() {
    let k = boot(4, 8, &[("f", &pattern(2, 42))]);
    let owner = k.vm.spawn("owner");
    let thief = k.vm.spawn("thief");
    let fd = k.vm.open(owner, "f").unwrap();

    assert_eq!(
        k.vm.filesize(thief, fd),
        Err(KernelError::BadFileDescriptor)
    );
    assert_eq!(k.vm.exit_status(thief), Some(-1));
    assert_eq!(k.vm.filesize(owner, fd), Ok(42));
    assert_eq!(k.vm.exit_status(owner), None);
    assert_eq!(k.vm.open_file_count(), 1);
}

/// Console output is handed over in pieces of at most 512 bytes.
#[test]
fn console_write_in_chunks() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("chatty");
    let text: Vec<u8> = (0..1200).map(|i| b'a' + (i % 26) as u8).collect();
    let buf = USER_TOP - 2048;
    k.poke(pid, buf, &text);

    assert_eq!(k.syscall(pid, RSP, SYS_WRITE, &[1, buf, text.len()]), 1200);
    assert_eq!(k.console.chunks(), vec![512, 512, 176]);
    assert_eq!(k.console.output(), text);
}

/// Reading descriptor 0 takes key presses from the console.
#[test]
fn console_read() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("typist");
    k.console.push_input(b"hey");
    let buf = USER_TOP - 512;

    assert_eq!(k.syscall(pid, RSP, SYS_READ, &[0, buf, 3]), 3);
    assert_eq!(k.peek(pid, buf, 3), b"hey");
    k.poke(pid, buf, b"zz");
    assert_eq!(k.syscall(pid, RSP, SYS_READ, &[0, buf, 2]), 2);
    assert_eq!(k.peek(pid, buf, 2), vec![0, 0], "no input left");
}

/// Reading the console output or writing the console input is an invalid
/// handle.
#[test]
fn wrong_console_direction_terminates() {
    let k = boot(4, 8, &[]);
    let reader = k.vm.spawn("reader");
    let writer = k.vm.spawn("writer");
    let buf = USER_TOP - 512;

    assert_eq!(
        k.syscall(reader, RSP, SYS_READ, &[1, buf, 4]),
        KernelError::BadFileDescriptor.into_usize() as isize
    );
    assert_eq!(k.vm.exit_status(reader), Some(-1));
    k.syscall(writer, RSP, SYS_WRITE, &[0, buf, 4]);
    assert_eq!(k.vm.exit_status(writer), Some(-1));
}

/// An unknown system call number fails with `ENOSYS` and is not fatal.
#[test]
fn unknown_syscall() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("curious");
    assert_eq!(k.syscall(pid, RSP, 99, &[]), -38);
    assert_eq!(k.syscall(pid, RSP, 0, &[]), -38);
    assert_eq!(k.vm.exit_status(pid), None);
}

/// Opening a file that does not exist is an ordinary failure.
#[test]
fn open_missing_file() {
    let k = boot(4, 8, &[("present", b"1")]);
    let pid = k.vm.spawn("lost");
    assert_eq!(open(&k, pid, "absent"), -2);
    assert_eq!(k.vm.open(pid, "absent"), Err(KernelError::NoSuchEntry));
    assert_eq!(k.vm.exit_status(pid), None);
    assert_eq!(k.vm.open_file_count(), 0);
}

/// `exit` records the status and prints the exit line.
#[test]
fn exit_through_registers() {
    let k = boot(4, 8, &[("f", b"abc")]);
    let pid = k.vm.spawn("prog");
    k.vm.open(pid, "f").unwrap();
    k.syscall(pid, RSP, SYS_EXIT, &[-5isize as usize]);
    assert_eq!(k.vm.exit_status(pid), Some(-5));
    assert_eq!(k.output(), "prog: exit(-5)\n");
    assert_eq!(k.vm.open_file_count(), 0, "descriptors left open");
    assert!(k.vm.process(pid).is_none());
}

/// Writes stop at the end of the file.
#[test]
fn write_does_not_grow_file() {
    let k = boot(4, 8, &[("small", &[0; 10])]);
    let pid = k.vm.spawn("writer");
    let fd = k.vm.open(pid, "small").unwrap();
    let buf = USER_TOP - 512;
    k.poke(pid, buf, &[9; 20]);

    assert_eq!(k.vm.write(pid, fd, buf, 20), Ok(10));
    assert_eq!(k.contents("small"), vec![9; 10]);
    assert_eq!(k.vm.write(pid, fd, buf, 20), Ok(0));
}

/// Passing a pointer the process cannot use kills it.
#[test]
fn bad_user_buffer_terminates() {
    let k = boot(4, 8, &[("f", &pattern(3, 64))]);

    let a = k.vm.spawn("null");
    let fd = k.vm.open(a, "f").unwrap();
    assert_eq!(k.vm.read(a, fd, 0, 10), Err(KernelError::BadAddress));
    assert_eq!(k.vm.exit_status(a), Some(-1));
    assert_eq!(k.vm.open_file_count(), 0);

    let b = k.vm.spawn("kernel");
    assert_eq!(
        k.vm.write(b, FileDescriptor::STDOUT, USER_TOP - 4, 8),
        Err(KernelError::BadAddress)
    );
    assert_eq!(k.vm.exit_status(b), Some(-1));

    let c = k.vm.spawn("unmapped");
    assert_eq!(
        k.syscall(c, RSP, SYS_OPEN, &[0x2000_0000]),
        KernelError::BadAddress.into_usize() as isize
    );
    assert_eq!(k.vm.exit_status(c), Some(-1));
}

/// A read larger than a page lands in a buffer spanning grown stack pages.
#[test]
fn multi_page_read() {
    let data = pattern(4, 2 * PAGE_SIZE + 10);
    let k = boot(4, 8, &[("big", &data)]);
    let pid = k.vm.spawn("bulk");
    let fd = open(&k, pid, "big") as usize;

    let rsp = USER_TOP - 3 * PAGE_SIZE;
    assert_eq!(
        k.syscall(pid, rsp, SYS_READ, &[fd, rsp, data.len()]),
        data.len() as isize
    );
    assert_eq!(k.peek(pid, rsp, data.len()), data);
}

/// The filesystem lock nests on the thread that holds it.
#[test]
fn filesystem_lock_is_reentrant() {
    let k = boot(4, 8, &[("f", &pattern(5, 77))]);
    let pid = k.vm.spawn("nested");
    let fd = k.vm.open(pid, "f").unwrap();

    let outer = k.vm.fs_lock();
    assert_eq!(k.vm.filesize(pid, fd), Ok(77));
    assert_eq!(k.vm.tell(pid, fd), Ok(0));
    drop(outer);

    // Released: another thread can take it.
    std::thread::scope(|s| {
        s.spawn(|| assert_eq!(k.vm.filesize(pid, fd), Ok(77)));
    });
}

/// A console read into a range that leaves user space kills the caller
/// before any key is taken.
#[test]
fn console_read_checks_buffer_first() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("greedy");
    k.console.push_input(b"keys");

    assert_eq!(
        k.vm.read(pid, FileDescriptor::STDIN, USER_TOP - 16, usize::MAX),
        Err(KernelError::BadAddress)
    );
    assert_eq!(k.vm.exit_status(pid), Some(-1));
    assert_eq!(
        k.syscall(k.vm.spawn("huge"), RSP, SYS_READ, &[0, USER_TOP - 16, 1 << 40]),
        KernelError::BadAddress.into_usize() as isize
    );

    let next = k.vm.spawn("patient");
    let buf = USER_TOP - 512;
    assert_eq!(k.syscall(next, RSP, SYS_READ, &[0, buf, 4]), 4);
    assert_eq!(k.peek(next, buf, 4), b"keys", "input consumed by a failed read");
}

/// A console read longer than a page lands in full.
#[test]
fn console_read_across_pages() {
    let k = boot(4, 8, &[]);
    let pid = k.vm.spawn("typist");
    let input = pattern(6, PAGE_SIZE + 100);
    k.console.push_input(&input);

    let rsp = USER_TOP - 2 * PAGE_SIZE;
    assert_eq!(
        k.syscall(pid, rsp, SYS_READ, &[0, rsp, input.len()]),
        input.len() as isize
    );
    assert_eq!(k.peek(pid, rsp, input.len()), input);
}

/// A descriptor register whose upper half is set names no open file, even
/// when its low 32 bits match one.
#[test]
fn wide_descriptor_register_terminates() {
    let k = boot(4, 8, &[("f", &pattern(7, 20))]);
    let pid = k.vm.spawn("wide");
    let fd = open(&k, pid, "f");
    assert_eq!(fd, 2);

    assert_eq!(
        k.syscall(pid, RSP, SYS_CLOSE, &[0x1_0000_0002]),
        KernelError::BadFileDescriptor.into_usize() as isize
    );
    assert_eq!(k.vm.exit_status(pid), Some(-1));
    assert_eq!(k.output(), "wide: exit(-1)\n");
    assert_eq!(k.vm.open_file_count(), 0);

    let other = k.vm.spawn("negative");
    k.syscall(other, RSP, SYS_FILESIZE, &[-1isize as usize]);
    assert_eq!(k.vm.exit_status(other), Some(-1));
}
