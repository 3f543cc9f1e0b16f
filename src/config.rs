//! Configuration of the virtual memory subsystem.
//!
//! The [`VmConfigBuilder`] provides an interface for configuring the memory
//! manager before the kernel state is created. Every knob has a default
//! suitable for the teaching workloads, so a plain
//! `VmConfigBuilder::new().build()` is enough for most uses.

use crate::addressing::{PAGE_SIZE, Va};

/// Tunables of the memory manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmConfig {
    /// Number of physical frames reserved for user pages.
    pub user_frames: usize,
    /// Number of page-sized swap slots. Fixed for the lifetime of the kernel.
    pub swap_slots: usize,
    /// The boundary between user and kernel address space. Addresses at or
    /// above this value are never legal user addresses.
    pub user_top: Va,
    /// How far below the stack pointer a fault may land and still count as
    /// stack growth. `PUSHA` touches 32 bytes below `%esp`.
    pub stack_heuristic: usize,
    /// Upper bound on the stack span, measured down from [`Self::user_top`].
    pub max_stack_size: usize,
}

impl VmConfig {
    /// Whether `va` lies inside the user half of the address space.
    #[inline]
    pub fn is_user_vaddr(&self, va: Va) -> bool {
        va < self.user_top
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfigBuilder::new().build()
    }
}

/// A builder for [`VmConfig`].
///
/// # Example
/// ```
/// use keos_vm::config::VmConfigBuilder;
///
/// let config = VmConfigBuilder::new()
///     .user_frames(4)
///     .swap_slots(16)
///     .build();
/// assert_eq!(config.user_frames, 4);
/// ```
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl Default for VmConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfigBuilder {
    /// Creates a builder populated with the default configuration.
    pub fn new() -> Self {
        Self {
            config: VmConfig {
                user_frames: 64,
                swap_slots: 256,
                user_top: Va::new(0xC000_0000),
                stack_heuristic: 32,
                max_stack_size: 2048 * PAGE_SIZE,
            },
        }
    }

    /// Sets the size of the user frame pool.
    pub fn user_frames(mut self, n: usize) -> Self {
        self.config.user_frames = n;
        self
    }

    /// Sets the number of swap slots.
    pub fn swap_slots(mut self, n: usize) -> Self {
        self.config.swap_slots = n;
        self
    }

    /// Sets the top of the user address space.
    ///
    /// # Panics
    /// Panics if `top` is not page aligned.
    pub fn user_top(mut self, top: Va) -> Self {
        assert!(top.is_page_aligned(), "user_top must be page aligned");
        self.config.user_top = top;
        self
    }

    /// Sets the stack growth heuristic distance, in bytes.
    pub fn stack_heuristic(mut self, bytes: usize) -> Self {
        self.config.stack_heuristic = bytes;
        self
    }

    /// Sets the maximum stack size, in bytes.
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.config.max_stack_size = bytes;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> VmConfig {
        self.config
    }
}
