//! Page-fault trap context.
//!
//! When the CPU raises a page fault it pushes an error code describing the
//! access and latches the faulting address in `%cr2`. The fault address
//! register is volatile: a second fault would overwrite it. It must therefore
//! be read while interrupts are still disabled, after which interrupts are
//! turned back on for the rest of the handling.
//!
//! [`TrapContext`] is the one place the dispatcher touches that state, so
//! the rest of the fault path has no idea whether it runs on a CPU or under a
//! test harness.

bitflags::bitflags! {
    /// Page fault error code pushed by the CPU.
    pub struct PFErrorCode: usize {
        /// 0: The fault was caused by a non-present page.
        /// 1: The fault was caused by a page-level protection violation.
        const PRESENT = 1 << 0;
        /// 0: The access causing the fault was a read.
        /// 1: The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// 0: A supervisor-mode access caused the fault.
        /// 1: A user-mode access caused the fault.
        const USER = 1 << 2;
    }
}

/// Access to the faulting CPU state.
pub trait TrapContext {
    /// The error code pushed with the fault.
    fn error_code(&self) -> PFErrorCode;

    /// Reads the fault address register. Called exactly once per fault, with
    /// interrupts disabled.
    fn read_fault_address(&mut self) -> usize;

    /// The user stack pointer at the time of the fault.
    fn user_stack_pointer(&self) -> usize;

    /// Turns interrupts back on.
    fn enable_interrupts(&mut self);
}

/// A [`TrapContext`] synthesized by software.
///
/// Used by the simulated MMU and by the kernel's own user-memory accessors.
#[derive(Clone, Debug)]
pub struct SoftTrap {
    error_code: PFErrorCode,
    fault_address: usize,
    stack_pointer: usize,
    interrupts_enabled: bool,
}

impl SoftTrap {
    /// Builds a trap for a fault at `fault_address` with the given error code
    /// and user stack pointer. Interrupts start disabled, as on trap entry.
    pub fn new(error_code: PFErrorCode, fault_address: usize, stack_pointer: usize) -> Self {
        Self {
            error_code,
            fault_address,
            stack_pointer,
            interrupts_enabled: false,
        }
    }

    /// Whether the handler re-enabled interrupts.
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }
}

impl TrapContext for SoftTrap {
    fn error_code(&self) -> PFErrorCode {
        self.error_code
    }

    fn read_fault_address(&mut self) -> usize {
        debug_assert!(
            !self.interrupts_enabled,
            "fault address read with interrupts on"
        );
        self.fault_address
    }

    fn user_stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    fn enable_interrupts(&mut self) {
        self.interrupts_enabled = true;
    }
}
