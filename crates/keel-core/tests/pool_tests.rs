use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use keel_core::{PoolTask, TaskLink, WorkPool};

struct CountTask {
    link: TaskLink,
    hits: Arc<AtomicUsize>,
}

impl CountTask {
    fn new(hits: &Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            link: TaskLink::new(),
            hits: Arc::clone(hits),
        })
    }
}

impl PoolTask for CountTask {
    fn run_in_pool(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    fn pool_link(&self) -> &TaskLink {
        &self.link
    }
}

#[test]
fn ten_thousand_tasks_from_four_producers_run_exactly_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 2_500;

    let pool = Arc::new(WorkPool::new("burst", 2, 4));
    pool.start();

    let hits = Arc::new(AtomicUsize::new(0));
    let go = Arc::new(Barrier::new(PRODUCERS));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let hits = Arc::clone(&hits);
            let go = Arc::clone(&go);
            thread::spawn(move || {
                go.wait();
                for _ in 0..PER_PRODUCER {
                    pool.submit(CountTask::new(&hits));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    pool.stop_and_wait();
    assert_eq!(hits.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
}

struct PanickingTask {
    link: TaskLink,
}

impl PoolTask for PanickingTask {
    fn run_in_pool(&self) {
        panic!("intentional task failure");
    }
    fn pool_link(&self) -> &TaskLink {
        &self.link
    }
}

#[test]
fn a_panicking_task_does_not_take_the_worker_down() {
    let pool = WorkPool::new("isolated", 1, 2);
    pool.start();

    let hits = Arc::new(AtomicUsize::new(0));
    pool.submit(Arc::new(PanickingTask {
        link: TaskLink::new(),
    }));
    for _ in 0..100 {
        pool.submit(CountTask::new(&hits));
    }

    pool.stop_and_wait();
    assert_eq!(hits.load(Ordering::Relaxed), 100);
}

struct ResubmitTask {
    link: TaskLink,
    pool: Arc<WorkPool>,
    hits: Arc<AtomicUsize>,
}

impl PoolTask for ResubmitTask {
    fn run_in_pool(&self) {
        // A task may feed the pool it runs on, as listeners do.
        self.pool.submit(CountTask::new(&self.hits));
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    fn pool_link(&self) -> &TaskLink {
        &self.link
    }
}

#[test]
fn tasks_may_submit_back_into_the_pool() {
    let pool = Arc::new(WorkPool::new("reentrant", 2, 4));
    pool.start();

    let hits = Arc::new(AtomicUsize::new(0));
    pool.submit(Arc::new(ResubmitTask {
        link: TaskLink::new(),
        pool: Arc::clone(&pool),
        hits: Arc::clone(&hits),
    }));

    while hits.load(Ordering::Relaxed) < 2 {
        thread::yield_now();
    }
    pool.stop_and_wait();
    assert_eq!(hits.load(Ordering::Relaxed), 2);
}
