use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rand::Rng;
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::gate::Gate;
use crate::run_queue::RunQueue;
use crate::task::{PoolTask, TaskLink};

thread_local! {
    // Per-submitter rotation across the queue bank. Shared between pools on
    // the same thread, which is harmless: it is only a spreading hint.
    static SUBMIT_CURSOR: Cell<usize> = const { Cell::new(0) };
}

/// Multi-worker executor for cheap units of work.
///
/// Submissions are spread over `contention_factor` lock-free run queues by a
/// per-submitter rotating counter; idle workers park on a [`Gate`] whose
/// ceiling equals the worker count. A woken worker probes the whole bank
/// before parking again, so a permit released against any queue is never a
/// lost wakeup.
pub struct WorkPool {
    shared: Arc<Shared>,
    threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    name: String,
    queues: Box<[RunQueue]>,
    gate: Gate,
    run: AtomicBool,
}

impl WorkPool {
    /// Creates a stopped pool; call [`start`](WorkPool::start) to spawn the
    /// workers. `threads` and `contention_factor` must both be at least 1.
    pub fn new(name: &str, threads: usize, contention_factor: usize) -> Self {
        assert!(threads >= 1, "pool needs at least one worker thread");
        assert!(contention_factor >= 1, "contention factor must be at least 1");
        let queues: Vec<RunQueue> = (0..contention_factor).map(|_| RunQueue::new()).collect();
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                queues: queues.into_boxed_slice(),
                gate: Gate::new(threads as u32),
                run: AtomicBool::new(true),
            }),
            threads,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// `new` with `threads` and `contention_factor` taken from `config`.
    pub fn with_config(name: &str, config: &Config) -> Self {
        Self::new(name, config.threads, config.contention_factor)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawns the worker threads, named `"{pool}-{idx}"`.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("pool mutex poisoned");
        assert!(workers.is_empty(), "pool already started");
        for idx in 0..self.threads {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.shared.name, idx))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
    }

    /// Enqueues `task` and releases one worker permit. Never fails while the
    /// pool is running; calling it after [`stop_and_wait`] is a contract
    /// violation, as is submitting a task whose link is still queued.
    ///
    /// [`stop_and_wait`]: WorkPool::stop_and_wait
    pub fn submit(&self, task: Arc<dyn PoolTask>) {
        debug_assert!(
            self.shared.run.load(Ordering::Relaxed),
            "submit on a stopped pool"
        );
        let link = NonNull::from(task.pool_link());
        debug_assert!(
            !unsafe { link.as_ref() }.is_linked(),
            "task is still linked in a run queue"
        );
        let raw = Arc::into_raw(task);
        // The queue holds this reference until a worker (or the shutdown
        // sweep) takes it back out.
        unsafe {
            link.as_ref()
                .put_owner(NonNull::new_unchecked(raw as *mut dyn PoolTask));
        }

        let idx = SUBMIT_CURSOR.with(|cursor| {
            let next = cursor.get().wrapping_add(1);
            cursor.set(next);
            next
        }) % self.shared.queues.len();
        self.shared.queues[idx].enqueue(link);
        self.shared.gate.release(1);
    }

    /// Stops the pool and joins every worker.
    ///
    /// Workers drain the whole queue bank on their way out, so every task
    /// whose submission completed before this call runs exactly once. The
    /// gate is left saturated at its ceiling. Stopping twice is a contract
    /// violation.
    pub fn stop_and_wait(&self) {
        let was_running = self.shared.run.swap(false, Ordering::AcqRel);
        assert!(was_running, "pool stopped twice");
        self.shared.gate.release(self.threads as u32);

        let workers = {
            let mut guard = self.workers.lock().expect("pool mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            handle.join().expect("pool worker panicked");
        }

        // Only submissions that raced the stop illegally can still be
        // queued here; reclaim their references rather than leak them.
        let mut dropped = 0usize;
        for queue in self.shared.queues.iter() {
            while let Some(link) = queue.dequeue() {
                unsafe {
                    if let Some(raw) = link.as_ref().take_owner() {
                        drop(Arc::from_raw(raw.as_ptr() as *const dyn PoolTask));
                    }
                }
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(pool = %self.shared.name, dropped, "dropped tasks submitted during stop");
        }

        self.shared.gate.release(self.threads as u32);
    }

    #[cfg(test)]
    pub(crate) fn gate(&self) -> &Gate {
        &self.shared.gate
    }
}

fn worker_loop(shared: &Shared) {
    trace!(pool = %shared.name, "worker started");
    let bank = shared.queues.len();
    let mut queue_idx = rand::thread_rng().gen_range(0..bank);

    while shared.run.load(Ordering::Acquire) {
        shared.gate.acquire();
        // One permit may correspond to work in any queue, so probe the whole
        // bank before parking again; running a task restarts the credit so a
        // busy worker does not park while its bank still has work.
        let mut credit = bank;
        loop {
            match shared.queues[queue_idx].dequeue() {
                Some(link) => {
                    run_task(link);
                    credit = bank;
                }
                None => {
                    credit -= 1;
                    if credit == 0 {
                        break;
                    }
                }
            }
            queue_idx += 1;
            if queue_idx == bank {
                queue_idx = 0;
            }
        }
    }
    trace!(pool = %shared.name, "worker finished");
}

fn run_task(link: NonNull<TaskLink>) {
    let task = unsafe {
        let raw = link
            .as_ref()
            .take_owner()
            .expect("dequeued a task without an owner reference");
        Arc::from_raw(raw.as_ptr() as *const dyn PoolTask)
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run_in_pool())) {
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        error!(reason, "pool task panicked; worker continues");
    }
}
