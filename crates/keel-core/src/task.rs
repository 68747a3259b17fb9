use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// A unit of work executed by the [`WorkPool`](crate::WorkPool).
///
/// Implementations embed a [`TaskLink`] and expose it through
/// [`pool_link`](PoolTask::pool_link); the pool threads the task through its
/// run queues by that link alone and never allocates on the submit path.
///
/// `run_in_pool` executes on an arbitrary worker thread. It may submit
/// further work back to the pool but must not block the worker.
pub trait PoolTask: Send + Sync {
    fn run_in_pool(&self);

    /// The intrusive link the pool queues this task by.
    fn pool_link(&self) -> &TaskLink;
}

/// Intrusive run-queue link embedded in every [`PoolTask`].
///
/// `next` is null whenever the task is not linked in a queue; submitting a
/// task whose link is still in use by a queue is a contract violation. While
/// the task is queued, `owner` parks the strong reference that
/// [`WorkPool::submit`](crate::WorkPool::submit) transferred, so a queued
/// task cannot be dropped out from under the pool.
pub struct TaskLink {
    next: AtomicPtr<TaskLink>,
    owner: UnsafeCell<Option<NonNull<dyn PoolTask>>>,
}

// SAFETY: `owner` is written by the submitting thread before the enqueue and
// read by exactly one worker after the dequeue; the queue's release/acquire
// pair on `next`/`head` orders the two accesses.
unsafe impl Send for TaskLink {}
unsafe impl Sync for TaskLink {}

impl TaskLink {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            owner: UnsafeCell::new(None),
        }
    }

    pub(crate) fn next(&self) -> &AtomicPtr<TaskLink> {
        &self.next
    }

    pub(crate) fn is_linked(&self) -> bool {
        !self.next.load(Ordering::Relaxed).is_null()
    }

    /// Parks the owning reference for the duration of a queue stay.
    ///
    /// # Safety
    ///
    /// Only the submitting thread may call this, and only while the task is
    /// not queued.
    pub(crate) unsafe fn put_owner(&self, task: NonNull<dyn PoolTask>) {
        unsafe {
            debug_assert!((*self.owner.get()).is_none(), "task submitted twice");
            *self.owner.get() = Some(task);
        }
    }

    /// Takes the owning reference back out after a dequeue.
    ///
    /// # Safety
    ///
    /// Only the dequeuing worker may call this.
    pub(crate) unsafe fn take_owner(&self) -> Option<NonNull<dyn PoolTask>> {
        unsafe { (*self.owner.get()).take() }
    }
}

impl Default for TaskLink {
    fn default() -> Self {
        Self::new()
    }
}
