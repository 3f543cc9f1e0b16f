//! Reentrant lock.
//!
//! A [`ReentrantLock`] may be acquired again by the thread that already holds
//! it. The lock remembers its owner and counts how many times the owner has
//! acquired it; the lock is only released when every guard has been dropped.
//!
//! The filesystem lock is the motivating user. A system call handler holding
//! the filesystem lock may call into a helper that acquires it again (for
//! example, process exit closing every descriptor), and the fault path must
//! be able to read a file whether or not the interrupted code already holds
//! the lock.
//!
//! Since the lock can be held several times by the same thread, the guard
//! only hands out shared references to the protected data.

use core::{
    cell::Cell,
    marker::PhantomData,
    ops::Deref,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use crossbeam_utils::{Backoff, CachePadded};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// A depth-counted lock that its owning thread may acquire repeatedly.
pub struct ReentrantLock<T: ?Sized> {
    locked: CachePadded<AtomicBool>,
    // 0 when nobody owns the lock.
    owner: AtomicU64,
    // Only touched by the owner.
    depth: Cell<usize>,
    data: T,
}

unsafe impl<T: ?Sized + Send> Send for ReentrantLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    /// Creates a new, unlocked reentrant lock.
    pub const fn new(data: T) -> Self {
        Self {
            locked: CachePadded::new(AtomicBool::new(false)),
            owner: AtomicU64::new(0),
            depth: Cell::new(0),
            data,
        }
    }
}

impl<T: ?Sized> ReentrantLock<T> {
    /// Acquires the lock.
    ///
    /// If the current thread already holds the lock, the depth counter is
    /// bumped and this returns immediately. Otherwise, blocks until the lock
    /// is free.
    pub fn lock(&self) -> ReentrantLockGuard<'_, T> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Relaxed) != me {
            let backoff = Backoff::new();
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                backoff.snooze();
            }
            self.owner.store(me, Ordering::Relaxed);
        }
        self.depth.set(self.depth.get() + 1);
        ReentrantLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Returns true if the current thread holds this lock.
    pub fn held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_token()
    }

    /// Number of outstanding acquisitions by the owner, or 0 when the lock is
    /// free or owned by another thread.
    pub fn depth(&self) -> usize {
        if self.held_by_current_thread() {
            self.depth.get()
        } else {
            0
        }
    }
}

/// Guard of a [`ReentrantLock`]. Releases one level of acquisition on drop.
pub struct ReentrantLockGuard<'a, T: ?Sized> {
    lock: &'a ReentrantLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> ReentrantLockGuard<'_, T> {
    /// Releases this level of the lock.
    #[inline]
    pub fn unlock(self) {
        drop(self)
    }
}

impl<T: ?Sized> Deref for ReentrantLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T: ?Sized> Drop for ReentrantLockGuard<'_, T> {
    fn drop(&mut self) {
        let depth = self.lock.depth.get() - 1;
        self.lock.depth.set(depth);
        if depth == 0 {
            self.lock.owner.store(0, Ordering::Relaxed);
            self.lock.locked.store(false, Ordering::Release);
        }
    }
}
