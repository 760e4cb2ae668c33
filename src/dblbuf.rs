//! The ref/upd double buffer guarding every per-lcore plan.
//!
//! Two slots and two atomic indices. The owning lcore reads `slot[ref]`;
//! the master fills `slot[upd]`, publishes by storing `upd := ref`, and
//! busy-waits until the reader flips `ref := (upd + 1) % 2`. While the
//! indices differ the two sides touch disjoint slots, so no lock is needed.
//!
//! Contract: exactly one reader thread (the owning lcore) and one writer
//! thread (the master) per cell. `active_mut` and `check_swap` belong to the
//! reader; `staging_mut`, `publish`, `wait_applied` and `sync` to the writer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};
use crate::CHANGE_UPDATE_INTERVAL_US;
use crate::INFO_AREA_MAX;

pub struct DoubleBuffered<T> {
    slots: [UnsafeCell<T>; INFO_AREA_MAX],
    ref_index: AtomicUsize,
    upd_index: AtomicUsize,
}

unsafe impl<T: Send> Sync for DoubleBuffered<T> {}

impl<T: Default> Default for DoubleBuffered<T> {
    fn default() -> Self {
        DoubleBuffered::new(T::default(), T::default())
    }
}

impl<T> DoubleBuffered<T> {
    pub fn new(ref_slot: T, upd_slot: T) -> Self {
        DoubleBuffered {
            slots: [UnsafeCell::new(ref_slot), UnsafeCell::new(upd_slot)],
            ref_index: AtomicUsize::new(0),
            upd_index: AtomicUsize::new(1),
        }
    }

    /// True while an update is published but not yet taken by the reader.
    #[inline]
    pub fn changed(&self) -> bool {
        self.ref_index.load(Ordering::Acquire) == self.upd_index.load(Ordering::Acquire)
    }

    /// Reader side: take a published update if there is one. Returns true
    /// if the reference slot moved.
    #[inline]
    pub fn check_swap(&self) -> bool {
        let upd = self.upd_index.load(Ordering::Acquire);
        if self.ref_index.load(Ordering::Relaxed) == upd {
            self.ref_index
                .store((upd + 1) % INFO_AREA_MAX, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Reader side: the active plan.
    #[inline]
    pub fn active(&self) -> &T {
        unsafe { &*self.slots[self.ref_index.load(Ordering::Acquire)].get() }
    }

    /// Writer side: read the slot being prepared. Since slots match after
    /// every `sync`, this doubles as the master's racy-free view of the
    /// current plan for status reporting.
    #[inline]
    pub fn staging(&self) -> &T {
        unsafe { &*self.slots[self.upd_index.load(Ordering::Acquire)].get() }
    }

    /// Writer side: the slot being prepared for the next publish.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn staging_mut(&self) -> &mut T {
        unsafe { &mut *self.slots[self.upd_index.load(Ordering::Acquire)].get() }
    }

    /// Writer side: make the staged slot visible to the reader.
    #[inline]
    pub fn publish(&self) {
        let refi = self.ref_index.load(Ordering::Acquire);
        self.upd_index.store(refi, Ordering::Release);
    }

    /// Writer side: poll until the reader picked up the published slot.
    pub fn wait_applied(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.changed() {
            if Instant::now() >= deadline {
                return Err(Error::StatusWaitTimeout("plan swap"));
            }
            thread::sleep(Duration::from_micros(CHANGE_UPDATE_INTERVAL_US));
        }
        Ok(())
    }

    /// Writer side, after `wait_applied`: copy the now-active plan back into
    /// the staging slot so the next edit starts from current state.
    pub fn sync(&self)
    where
        T: Clone,
    {
        if !self.changed() {
            let active: &T = self.active();
            *self.staging_mut() = active.clone();
        }
    }
}
