use std::hint;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::task::TaskLink;

/// Lock-free intrusive FIFO of pool tasks.
///
/// Producers enqueue by swapping the tail and linking the predecessor
/// afterwards, so a dequeuer that lands in that window waits out the
/// producer with a short spin on `next`. Dequeues CAS the head.
///
/// The pool drains each queue from one worker at a time; concurrent
/// dequeuers are tolerated but are not the design point, and the queue does
/// not defend against pointer reuse races between them.
pub(crate) struct RunQueue {
    head: CachePadded<AtomicPtr<TaskLink>>,
    tail: CachePadded<AtomicPtr<TaskLink>>,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Appends `link`. The task behind it must stay alive until dequeued.
    pub(crate) fn enqueue(&self, link: NonNull<TaskLink>) {
        let prev = self.tail.swap(link.as_ptr(), Ordering::AcqRel);
        if prev.is_null() {
            self.head.store(link.as_ptr(), Ordering::Release);
        } else {
            unsafe { (*prev).next().store(link.as_ptr(), Ordering::Release) };
        }
    }

    /// Pops the oldest link, or `None` when the queue is (transiently) empty.
    ///
    /// The returned link has its `next` reset to null.
    pub(crate) fn dequeue(&self) -> Option<NonNull<TaskLink>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let h = NonNull::new(head)?;
            let next = unsafe { h.as_ref().next().load(Ordering::Acquire) };
            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next.is_null() {
                        // Tail boundary: either detach the tail, or a
                        // producer has already swapped it and is about to
                        // link its node; wait that single store out.
                        if self
                            .tail
                            .compare_exchange(
                                head,
                                ptr::null_mut(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                        {
                            let succ = loop {
                                let succ = unsafe { h.as_ref().next().load(Ordering::Acquire) };
                                if !succ.is_null() {
                                    break succ;
                                }
                                hint::spin_loop();
                            };
                            self.head.store(succ, Ordering::Release);
                        }
                    }
                    unsafe { h.as_ref().next().store(ptr::null_mut(), Ordering::Release) };
                    return Some(h);
                }
                Err(cur) => head = cur,
            }
        }
    }
}
