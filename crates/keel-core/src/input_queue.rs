use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::block::{self, DataBlock};
use crate::config::Config;
use crate::session::{SelectorBridge, SelectorTask, SessionListener, SessionSocket};
use crate::task::{PoolTask, TaskLink};

// Low 30 bits count buffered-but-undelivered bytes; bit 30 marks the socket
// as closed. The word is the only coordination between the appending worker
// and the delivering worker.
const LENGTH_MASK: u32 = 0x3FFF_FFFF;
const CLOSED: u32 = 0x4000_0000;

/// Single-reader receive pipeline for one session.
///
/// Two roles cooperate through the packed length word. The *selector role*
/// ([`SelectorTask`]) arms read-readiness; when the socket becomes readable
/// the framework submits this queue to the work pool, where the *worker
/// role* ([`PoolTask`]) performs the read, chains the bytes into data
/// blocks, re-arms the selector, and, when its read started a fresh cohort,
/// delivers buffered bytes to the listener in arrival order.
///
/// At most one worker-role entry is in flight at a time (readiness is armed
/// again only from inside the previous entry), and at most one thread
/// delivers at a time (the length word hands delivery ownership to whichever
/// read raises it from zero). The terminal close event fires exactly once.
pub struct InputQueue {
    me: Weak<InputQueue>,
    bridge: Arc<dyn SelectorBridge>,
    socket: Arc<dyn SessionSocket>,
    listener: OnceLock<Arc<dyn SessionListener>>,
    use_direct: bool,
    block_size: usize,
    state: CachePadded<AtomicU32>,
    // Tail of the block chain; owned by the worker role.
    tail: AtomicPtr<DataBlock>,
    link: TaskLink,
}

impl InputQueue {
    pub fn new(
        bridge: Arc<dyn SelectorBridge>,
        socket: Arc<dyn SessionSocket>,
        use_direct: bool,
        block_size: usize,
    ) -> Arc<Self> {
        assert!(block_size >= 1, "block size must be at least 1");
        assert!(
            block_size <= LENGTH_MASK as usize,
            "block size exceeds the length counter"
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bridge,
            socket,
            listener: OnceLock::new(),
            use_direct,
            block_size,
            state: CachePadded::new(AtomicU32::new(0)),
            tail: AtomicPtr::new(ptr::null_mut()),
            link: TaskLink::new(),
        })
    }

    /// `new` with buffer settings taken from `config`.
    pub fn with_config(
        bridge: Arc<dyn SelectorBridge>,
        socket: Arc<dyn SessionSocket>,
        config: &Config,
    ) -> Arc<Self> {
        Self::new(
            bridge,
            socket,
            config.use_direct_buffers,
            config.input_queue_block_size(),
        )
    }

    /// Installs the listener and schedules the first readiness arming.
    /// Calling it twice is a contract violation.
    pub fn set_listener_and_start(&self, listener: Arc<dyn SessionListener>) {
        assert!(
            self.listener.set(listener).is_ok(),
            "listener already installed"
        );
        self.bridge.execute_in_selector_thread(self.strong());
    }

    /// Present for API symmetry with the session lifecycle; tearing down
    /// readiness interest is the owning framework's job, so this does
    /// nothing.
    pub fn stop(&self) {}

    fn strong(&self) -> Arc<InputQueue> {
        self.me.upgrade().expect("input queue dropped while active")
    }

    fn listener(&self) -> &Arc<dyn SessionListener> {
        self.listener.get().expect("listener not installed")
    }

    fn rearm(&self) {
        self.bridge.execute_in_selector_thread(self.strong());
    }

    /// Reads into `block` at its write cursor. `0` means closed: a read is
    /// only attempted after readiness, so zero bytes or any error both fold
    /// into the terminal close.
    fn read_into(&self, block: *mut DataBlock) -> usize {
        let buf = unsafe { (*block).write_buf() };
        debug_assert!(!buf.is_empty());
        match self.socket.read(buf) {
            Ok(n) if n > 0 => {
                unsafe { (*block).advance_write_pos(n) };
                n
            }
            Ok(_) => 0,
            Err(error) => {
                trace!(%error, "socket read failed");
                0
            }
        }
    }

    /// Worker-role entry when nothing is buffered: the previous cohort (if
    /// any) has fully drained, so its tail block is reclaimed and a fresh
    /// read starts the next one.
    fn read_fresh(&self) {
        let drained = self.tail.swap(ptr::null_mut(), Ordering::Acquire);
        if !drained.is_null() {
            unsafe {
                debug_assert_eq!((*drained).read_pos(), (*drained).write_pos());
                (*drained).reset();
                block::cache_put(drained);
            }
        }

        let block = block::cache_take_or_alloc(self.use_direct, self.block_size);
        let received = self.read_into(block);
        if received > 0 {
            self.tail.store(block, Ordering::Release);
            self.state.store(received as u32, Ordering::Release);
            self.rearm();
            self.handle_data(block, received);
        } else {
            // Untouched, so still reset.
            unsafe { block::cache_put(block) };
            trace!("connection closed with no data buffered");
            self.listener().on_connection_closed();
        }
    }

    /// Worker-role entry while bytes are still being delivered: append to
    /// the chain and let whichever side raised the count from zero own the
    /// delivery.
    fn read_append(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        debug_assert!(!tail.is_null());

        let mut prev: *mut DataBlock = ptr::null_mut();
        let mut block = tail;
        if unsafe { (*tail).write_remaining() } == 0 {
            prev = tail;
            block = block::cache_take_or_alloc(self.use_direct, self.block_size);
        }

        let received = self.read_into(block);
        if received > 0 {
            if !prev.is_null() {
                // Tentatively chain the new tail; an in-flight consumer
                // observes the link through its length decrement.
                unsafe { (*prev).set_next(block) };
            }

            let mut current = self.state.load(Ordering::Relaxed);
            let total = loop {
                debug_assert_eq!(current & CLOSED, 0);
                let new = (current & LENGTH_MASK) + received as u32;
                debug_assert!(new <= LENGTH_MASK, "input backlog overflows the length field");
                match self
                    .state
                    .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break new,
                    Err(observed) => current = observed,
                }
            };

            if total == received as u32 {
                // The consumer finished everything before our bytes landed:
                // this read starts a fresh cohort and we deliver it.
                if !prev.is_null() {
                    unsafe {
                        (*prev).set_next(ptr::null_mut());
                        (*prev).reset();
                        block::cache_put(prev);
                    }
                    self.tail.store(block, Ordering::Release);
                }
                self.rearm();
                self.handle_data(block, received);
            } else {
                if !prev.is_null() {
                    self.tail.store(block, Ordering::Release);
                }
                self.rearm();
            }
        } else {
            if !prev.is_null() {
                // Acquired but never linked.
                unsafe { block::cache_put(block) };
            }
            let mut current = self.state.load(Ordering::Relaxed);
            let sealed = loop {
                let new = current | CLOSED;
                match self
                    .state
                    .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break new,
                    Err(observed) => current = observed,
                }
            };
            if sealed & LENGTH_MASK == 0 {
                trace!("connection closed after the backlog drained");
                self.listener().on_connection_closed();
            }
            // Otherwise the in-flight consumer sees CLOSED at drain end and
            // signals the close itself.
        }
    }

    /// Delivers buffered bytes until the length word reaches zero, then
    /// signals the close if one was sealed in the meantime.
    ///
    /// Every chunk lies within one block: appends fill a block completely
    /// before chaining a new one, so a block with bytes behind it is full up
    /// to its capacity and the consumer never has to look at the writer's
    /// cursor. Exhausted blocks are recycled into the thread-local cache.
    /// After the final decrement the chain is never touched again; the
    /// drained tail is reclaimed by the next fresh read.
    fn handle_data(&self, start: *mut DataBlock, first: usize) {
        let mut block = start;
        let mut chunk = first;
        loop {
            unsafe {
                let pos = (*block).read_pos();
                self.listener().on_data_received((*block).payload(pos, chunk));
                (*block).set_read_pos(pos + chunk);
            }

            let before = self.state.fetch_sub(chunk as u32, Ordering::AcqRel);
            let after = before - chunk as u32;
            let outstanding = (after & LENGTH_MASK) as usize;
            if outstanding == 0 {
                if after & CLOSED != 0 {
                    trace!("connection closed at drain end");
                    self.listener().on_connection_closed();
                }
                return;
            }

            unsafe {
                if (*block).read_pos() == (*block).capacity() {
                    let next = (*block).next();
                    debug_assert!(!next.is_null(), "outstanding bytes behind a full block");
                    (*block).set_next(ptr::null_mut());
                    (*block).reset();
                    block::cache_put(block);
                    block = next;
                }
                chunk = outstanding.min((*block).capacity() - (*block).read_pos());
            }
        }
    }
}

impl PoolTask for InputQueue {
    fn run_in_pool(&self) {
        let state = self.state.load(Ordering::Acquire);
        debug_assert_eq!(state & CLOSED, 0, "scheduled after close");
        if state == 0 {
            self.read_fresh();
        } else {
            self.read_append();
        }
    }

    fn pool_link(&self) -> &TaskLink {
        &self.link
    }
}

impl SelectorTask for InputQueue {
    fn run_in_selector_thread(&self) {
        self.socket.enable_read_interest();
    }
}

impl Drop for InputQueue {
    fn drop(&mut self) {
        // Whatever is left of the chain belongs to nobody else now.
        let mut block = *self.tail.get_mut();
        // The chain is only reachable from its oldest live block; `tail`
        // points at the newest, which is also the oldest whenever the queue
        // is idle (all earlier blocks were recycled during delivery).
        while !block.is_null() {
            let next = unsafe { (*block).next() };
            unsafe { DataBlock::free(block) };
            block = next;
        }
    }
}
