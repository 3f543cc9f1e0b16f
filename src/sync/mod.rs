//! Synchronization primitives.
//!
//! - [`SpinLock`]: guards the kernel-wide tables and each process's address
//!   space.
//! - [`ReentrantLock`]: guards the filesystem driver, which the owning thread
//!   may enter again from the fault path.

pub mod reentrant;
pub mod spinlock;

pub use reentrant::{ReentrantLock, ReentrantLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
