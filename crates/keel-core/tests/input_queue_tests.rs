use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use keel_core::{
    InputQueue, PoolTask, SelectorBridge, SelectorTask, SessionListener, SessionSocket, WorkPool,
};

enum Step {
    Data(Vec<u8>),
    Eof,
}

/// Socket replaying a script, with partial consumption when the destination
/// is smaller than the scripted chunk.
struct ScriptSocket {
    script: Mutex<VecDeque<Step>>,
    armed: AtomicBool,
}

impl ScriptSocket {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            armed: AtomicBool::new(false),
        })
    }

    fn pending(&self) -> bool {
        !self.script.lock().unwrap().is_empty()
    }
}

impl SessionSocket for ScriptSocket {
    fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.lock().unwrap();
        match script.front_mut() {
            Some(Step::Data(bytes)) => {
                let n = bytes.len().min(dst.len());
                dst[..n].copy_from_slice(&bytes[..n]);
                bytes.drain(..n);
                if bytes.is_empty() {
                    script.pop_front();
                }
                Ok(n)
            }
            Some(Step::Eof) => {
                script.pop_front();
                Ok(0)
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn enable_read_interest(&self) {
        self.armed.store(true, Ordering::Release);
    }
}

/// Bridge that runs the arming callback inline; the test's driver thread
/// plays the selector loop by turning "armed and readable" into a pool
/// submission.
struct InlineBridge;

impl SelectorBridge for InlineBridge {
    fn execute_in_selector_thread(&self, task: Arc<dyn SelectorTask>) {
        task.run_in_selector_thread();
    }
}

struct RecordingListener {
    data: Mutex<Vec<u8>>,
    closed: AtomicUsize,
    delay: Duration,
}

impl RecordingListener {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
            delay,
        })
    }
}

impl SessionListener for RecordingListener {
    fn on_data_received(&self, data: &[u8]) {
        if !self.delay.is_zero() {
            // Slow consumer: lets further reads append while we deliver.
            thread::sleep(self.delay);
        }
        self.data.lock().unwrap().extend_from_slice(data);
    }

    fn on_connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs a scripted session through a real pool until it closes, returning
/// the delivered stream and the close count.
fn run_session(
    steps: Vec<Step>,
    block_size: usize,
    delivery_delay: Duration,
) -> (Vec<u8>, usize) {
    let pool = Arc::new(WorkPool::new("rx", 2, 4));
    pool.start();

    let socket = ScriptSocket::new(steps);
    let listener = RecordingListener::new(delivery_delay);
    let queue = InputQueue::new(Arc::new(InlineBridge), socket.clone(), false, block_size);
    queue.set_listener_and_start(listener.clone());

    // Selector stand-in: readiness fires whenever the session is armed and
    // the script still has something to say.
    while listener.closed.load(Ordering::Relaxed) == 0 {
        if socket.armed.swap(false, Ordering::AcqRel) {
            assert!(socket.pending(), "armed with nothing left to read");
            let task: Arc<dyn PoolTask> = queue.clone();
            pool.submit(task);
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }
    pool.stop_and_wait();

    let data = listener.data.lock().unwrap().clone();
    (data, listener.closed.load(Ordering::Relaxed))
}

#[test]
fn twenty_bytes_then_eof_deliver_and_close_once() {
    let (data, closed) = run_session(
        vec![
            Step::Data(vec![b'a'; 10]),
            Step::Data(vec![b'b'; 10]),
            Step::Eof,
        ],
        4096,
        Duration::ZERO,
    );
    assert_eq!(data.len(), 20);
    assert_eq!(&data[..10], &[b'a'; 10]);
    assert_eq!(&data[10..], &[b'b'; 10]);
    assert_eq!(closed, 1);
}

#[test]
fn arrival_order_survives_chaining_and_slow_delivery() {
    // 150 sequential bytes in 15 reads over 16-byte blocks: every read
    // crosses or lands on a block boundary somewhere, and the slowed
    // listener forces reads to append while delivery is in flight.
    let payload: Vec<u8> = (0u8..150).collect();
    let steps: Vec<Step> = payload
        .chunks(10)
        .map(|chunk| Step::Data(chunk.to_vec()))
        .chain(std::iter::once(Step::Eof))
        .collect();

    let (data, closed) = run_session(steps, 16, Duration::from_millis(2));
    assert_eq!(data, payload);
    assert_eq!(closed, 1);
}

#[test]
fn block_sized_reads_recycle_on_the_boundary() {
    let payload: Vec<u8> = (0u8..64).collect();
    let steps: Vec<Step> = payload
        .chunks(8)
        .map(|chunk| Step::Data(chunk.to_vec()))
        .chain(std::iter::once(Step::Eof))
        .collect();

    let (data, closed) = run_session(steps, 8, Duration::ZERO);
    assert_eq!(data, payload);
    assert_eq!(closed, 1);
}

#[test]
fn eof_after_backlog_still_closes_exactly_once() {
    // A burst bigger than one block followed directly by EOF: the close
    // must wait for the backlog to drain and still fire only once.
    let payload: Vec<u8> = (0u8..48).collect();
    let (data, closed) = run_session(
        vec![Step::Data(payload.clone()), Step::Eof],
        16,
        Duration::from_millis(1),
    );
    assert_eq!(data, payload);
    assert_eq!(closed, 1);
}
