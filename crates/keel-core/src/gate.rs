use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_utils::CachePadded;

/// Counting gate with a saturation ceiling.
///
/// Pool workers park here while idle: [`acquire`](Gate::acquire) takes one
/// permit, blocking while the count is zero, and [`release`](Gate::release)
/// adds permits but never beyond `max`. The ceiling makes the shutdown wake
/// unconditional: `release(max)` brings the count to `max` no matter what
/// the workers are doing and unparks every waiter, and the gate stays
/// saturated so any straggling release is a no-op.
///
/// The count is never observable below zero or above `max`.
pub struct Gate {
    permits: CachePadded<AtomicU32>,
    sleepers: CachePadded<AtomicUsize>,
    max: u32,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Gate {
    /// Creates a gate with zero permits and the given ceiling.
    pub fn new(max: u32) -> Self {
        assert!(max >= 1, "gate ceiling must be at least 1");
        Self {
            permits: CachePadded::new(AtomicU32::new(0)),
            sleepers: CachePadded::new(AtomicUsize::new(0)),
            max,
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Current permit count. Advisory: it may change before the caller acts.
    pub fn permits(&self) -> u32 {
        self.permits.load(Ordering::Relaxed)
    }

    /// Takes one permit without blocking; `false` when none are available.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |p| p.checked_sub(1))
            .is_ok()
    }

    /// Takes one permit, parking the calling thread until one is available.
    pub fn acquire(&self) {
        if self.try_acquire() {
            return;
        }
        let mut guard = self.lock.lock().expect("gate mutex poisoned");
        self.sleepers.fetch_add(1, Ordering::Relaxed);
        loop {
            if self.try_acquire() {
                self.sleepers.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            guard = self.cv.wait(guard).expect("gate condvar poisoned");
        }
    }

    /// Adds `n` permits, clamped at the ceiling, and wakes parked threads.
    ///
    /// When the count already sits at the ceiling only the wakeup happens;
    /// a saturated gate already covers every worker with a permit.
    pub fn release(&self, n: u32) {
        debug_assert!(n >= 1);
        let mut cur = self.permits.load(Ordering::Relaxed);
        while cur != self.max {
            let new = cur.saturating_add(n).min(self.max);
            match self
                .permits
                .compare_exchange(cur, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        if self.sleepers.load(Ordering::Relaxed) > 0 {
            // Taking the lock orders this wakeup after any sleeper's
            // recheck-then-wait, so the notification cannot be lost.
            drop(self.lock.lock().expect("gate mutex poisoned"));
            if n == 1 {
                self.cv.notify_one();
            } else {
                self.cv.notify_all();
            }
        }
    }
}
