//! Frame table: allocation, pinning and eviction of user frames.
//!
//! The user frame pool is a fixed array of page-sized frames, reserved at
//! kernel initialization. Each frame is described by a [`FrameState`]:
//!
//! ```text
//!            allocate              evict_one picks it
//!   Free ───────────────► Used ───────────────────────► Evicting
//!    ▲                    │  ▲                              │
//!    │       free         │  │   write-out failed           │ written out,
//!    └────────────────────┘  └──────────────────────────────┤ handed to the
//!                                                           │ new owner
//!                                                           ▼
//!                                                         Used
//! ```
//!
//! A `Used` frame names its owner as a ([`Pid`], [`Va`]) pair. This is a
//! plain back-reference used to find the page to demote on eviction; it
//! never keeps the owner alive.
//!
//! ## Pinning
//!
//! [`FrameTable::allocate`] always returns the frame *pinned*. A pinned frame
//! is never chosen as a victim, so the caller can fill the frame with file or
//! swap content without racing the evictor. Once the content is complete and
//! the translation installed, the caller calls [`FrameTable::unpin`].
//!
//! ## Eviction
//!
//! When the free list is empty, a clock hand sweeps the table once, starting
//! after the previous victim, and picks the first unpinned `Used` frame. The
//! frame is moved to `Evicting` under the table lock and the lock is dropped
//! before the content is written out through the [`Evictor`], since writing
//! out takes the owner's address-space lock and may sleep on I/O. If no
//! candidate exists, allocation fails with [`KernelError::NoMemory`].

use crate::{
    KernelError,
    addressing::{FrameNumber, PAGE_SIZE, Va},
    process::Pid,
    sync::{SpinLock, SpinLockGuard},
};
use crossbeam_queue::ArrayQueue;
use log::{debug, trace};

/// Content of a single frame.
pub type FrameData = Box<[u8; PAGE_SIZE]>;

/// Writes a victim frame's content to its backing store.
///
/// Implemented by the kernel state, which knows how to find the owner's
/// supplemental page table entry for the victim and where its content must
/// go (swap or file).
pub trait Evictor {
    /// Persist the page `va` of `owner` currently held in `frame`, demote its
    /// supplemental page table entry and remove its translation.
    ///
    /// If the page no longer exists (its owner unmapped it or exited while
    /// the frame was being claimed), this succeeds without doing anything.
    fn evict(&self, frame: FrameNumber, owner: Pid, va: Va) -> Result<(), KernelError>;
}

/// State of a frame table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameState {
    /// On the free list.
    Free,
    /// Backing page `va` of process `owner`.
    Used { owner: Pid, va: Va, pinned: bool },
    /// Claimed by the evictor. `released` records that the owner freed the
    /// frame while its content was being written out.
    Evicting { owner: Pid, va: Va, released: bool },
}

struct FrameTableInner {
    states: Vec<FrameState>,
    hand: usize,
}

/// The frame table of the user frame pool.
pub struct FrameTable {
    contents: Box<[SpinLock<FrameData>]>,
    inner: SpinLock<FrameTableInner>,
    free: ArrayQueue<FrameNumber>,
}

impl FrameTable {
    /// Creates a pool of `frames` zeroed frames, all free.
    ///
    /// # Panics
    /// Panics if `frames` is zero.
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "user frame pool must not be empty");
        let free = ArrayQueue::new(frames);
        for i in 0..frames {
            // Capacity matches the frame count.
            let _ = free.push(FrameNumber(i));
        }
        Self {
            contents: (0..frames)
                .map(|_| SpinLock::new(Box::new([0u8; PAGE_SIZE])))
                .collect(),
            inner: SpinLock::new(FrameTableInner {
                states: vec![FrameState::Free; frames],
                hand: 0,
            }),
            free,
        }
    }

    /// Number of frames currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Get the state of `frame`.
    pub fn state(&self, frame: FrameNumber) -> FrameState {
        self.inner.lock().states[frame.0]
    }

    /// Lock the content of `frame`.
    pub fn contents(&self, frame: FrameNumber) -> SpinLockGuard<'_, FrameData> {
        self.contents[frame.0].lock()
    }

    /// Allocate a frame for page `va` of `owner`.
    ///
    /// Takes a frame from the free list, or evicts one if the list is empty.
    /// The returned frame is pinned; see the module documentation.
    ///
    /// # Parameters
    /// - `owner`, `va`: The page the frame will back.
    /// - `zeroed`: Whether the frame must be filled with zeros.
    /// - `evictor`: Writes a victim's content out when eviction is required.
    ///
    /// # Returns
    /// The frame, or [`KernelError::NoMemory`] if every frame is pinned or
    /// already being evicted. Errors from writing the victim out are
    /// propagated as is.
    pub fn allocate(
        &self,
        owner: Pid,
        va: Va,
        zeroed: bool,
        evictor: &dyn Evictor,
    ) -> Result<FrameNumber, KernelError> {
        let frame = match self.free.pop() {
            Some(frame) => frame,
            None => self.evict_one(evictor)?,
        };

        let mut inner = self.inner.lock();
        debug_assert!(!matches!(inner.states[frame.0], FrameState::Used { .. }));
        inner.states[frame.0] = FrameState::Used {
            owner,
            va,
            pinned: true,
        };
        inner.unlock();

        if zeroed {
            self.contents(frame).fill(0);
        }
        trace!("frame {:?} -> {:?}@{}", frame, va, owner);
        Ok(frame)
    }

    fn evict_one(&self, evictor: &dyn Evictor) -> Result<FrameNumber, KernelError> {
        let mut inner = self.inner.lock();
        let n = inner.states.len();
        let (victim, owner, va) = (0..n)
            .map(|i| (inner.hand + i) % n)
            .find_map(|idx| match inner.states[idx] {
                FrameState::Used {
                    owner,
                    va,
                    pinned: false,
                } => Some((idx, owner, va)),
                _ => None,
            })
            .ok_or(KernelError::NoMemory)?;
        inner.hand = (victim + 1) % n;
        inner.states[victim] = FrameState::Evicting {
            owner,
            va,
            released: false,
        };
        inner.unlock();

        let victim = FrameNumber(victim);
        debug!("evict frame {:?} ({:?}@{})", victim, va, owner);
        if let Err(e) = evictor.evict(victim, owner, va) {
            let mut inner = self.inner.lock();
            let released = matches!(
                inner.states[victim.0],
                FrameState::Evicting { released: true, .. }
            );
            if released {
                inner.states[victim.0] = FrameState::Free;
                inner.unlock();
                let _ = self.free.push(victim);
            } else {
                inner.states[victim.0] = FrameState::Used {
                    owner,
                    va,
                    pinned: false,
                };
            }
            return Err(e);
        }
        Ok(victim)
    }

    /// Return `frame` to the pool.
    ///
    /// A frame that the evictor has already claimed stays with the evictor,
    /// which hands it to its next owner.
    pub fn free(&self, frame: FrameNumber) {
        let mut inner = self.inner.lock();
        let state = &mut inner.states[frame.0];
        match *state {
            FrameState::Used { .. } => *state = FrameState::Free,
            FrameState::Evicting {
                ref mut released, ..
            } => {
                *released = true;
                return;
            }
            FrameState::Free => {
                debug_assert!(false, "double free of {:?}", frame);
                return;
            }
        }
        inner.unlock();
        let _ = self.free.push(frame);
    }

    /// Exempt `frame` from victim selection.
    pub fn pin(&self, frame: FrameNumber) {
        if let FrameState::Used { pinned, .. } = &mut self.inner.lock().states[frame.0] {
            *pinned = true;
        }
    }

    /// Make `frame` a candidate for eviction again.
    pub fn unpin(&self, frame: FrameNumber) {
        if let FrameState::Used { pinned, .. } = &mut self.inner.lock().states[frame.0] {
            *pinned = false;
        }
    }

    /// Whether `frame` is currently pinned.
    pub fn is_pinned(&self, frame: FrameNumber) -> bool {
        matches!(self.state(frame), FrameState::Used { pinned: true, .. })
    }
}
