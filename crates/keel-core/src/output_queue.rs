use std::cell::UnsafeCell;
use std::io::IoSlice;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::block::DataBlock;
use crate::config::Config;

// Layout of the packed state word, low bits first:
//
//   offs    36 bits  byte offset cursor within the tail block (accumulates
//                    raw totals until it would overflow, then collapses to
//                    the in-block offset)
//   start   20 bits  reservation offset of the earliest in-flight writer;
//                    zero whenever no writer is in flight
//   writers  6 bits  bitmask of occupied writer slots
//
// The all-ones value is the reallocation sentinel: the chain is being
// extended and no writer may enter until the extender installs a new word.
const OFFS_WIDTH: u32 = 36;
const START_WIDTH: u32 = 20;
const WRITERS_WIDTH: u32 = 6;
const OFFS_MASK: u64 = (1u64 << OFFS_WIDTH) - 1;
const START_MASK: u64 = ((1u64 << START_WIDTH) - 1) << OFFS_WIDTH;
const WRITERS_MASK: u64 = ((1u64 << WRITERS_WIDTH) - 1) << (OFFS_WIDTH + START_WIDTH);
const WRITERS_SHIFT: u32 = OFFS_WIDTH + START_WIDTH;
const REALLOC: u64 = u64::MAX;

/// In-block offset encoded by `state`, with the boundary convention: an
/// offset that lands exactly on a block boundary reads as `block_size`, not
/// zero, so "tail exactly full" and "tail empty" stay distinguishable.
#[inline]
fn offs_in_block(state: u64, block_size: usize) -> u64 {
    let offs = state & OFFS_MASK;
    let rem = offs % block_size as u64;
    if rem > 0 {
        rem
    } else if offs > 0 {
        block_size as u64
    } else {
        0
    }
}

/// Advances the offset field by `len` bytes, collapsing to the in-block
/// offset when the raw total would no longer fit the field.
#[inline]
fn bump_offs(state: u64, len: u64, block_size: usize) -> u64 {
    let mut offs = (state & OFFS_MASK) + len;
    if offs > OFFS_MASK {
        offs %= block_size as u64;
        if offs == 0 {
            offs = block_size as u64;
        }
    }
    offs
}

/// Lock-free multi-writer staging buffer for outbound bytes.
///
/// Up to [`MAX_WRITERS`](OutputQueue::MAX_WRITERS) threads append
/// concurrently into a singly linked chain of fixed-size blocks; each call
/// returns how many bytes it made contiguously readable at the head, so the
/// single reader (the selector-side flusher) knows when and how much to
/// write to the socket. Writers that cannot make progress (all slots taken,
/// or the chain is being extended) spin-retry; nothing is ever surfaced as
/// an error.
///
/// Reader-side calls ([`get_data`](OutputQueue::get_data),
/// [`remove_data`](OutputQueue::remove_data)) must come from one thread at a
/// time and must only cover bytes already credited by `add_data` returns.
pub struct OutputQueue {
    block_size: usize,
    use_direct: bool,
    state: CachePadded<AtomicU64>,
    head: UnsafeCell<*mut DataBlock>,
    tail: UnsafeCell<*mut DataBlock>,
    // Per-slot write views: the tail block a reserving writer copies into.
    // A slot is initialized lazily by its reservation holder and wiped by
    // the chain extender, so a non-null view always points at the tail.
    ww: [UnsafeCell<*mut DataBlock>; WRITERS_WIDTH as usize],
}

// SAFETY: `head` is touched only by the single reader role; `tail` and the
// chain links are mutated only under the reallocation sentinel; `ww[i]` is
// touched only by the holder of writer slot `i` or the sentinel holder; all
// payload ranges are disjoint by reservation and published by the release
// CAS that retires the writer.
unsafe impl Send for OutputQueue {}
unsafe impl Sync for OutputQueue {}

impl OutputQueue {
    /// Concurrent writer limit imposed by the state-word bitmask.
    pub const MAX_WRITERS: usize = WRITERS_WIDTH as usize;

    /// Creates an empty queue. `block_size` is clamped to the largest value
    /// the packed start field can carry.
    pub fn new(use_direct: bool, block_size: usize) -> Self {
        assert!(block_size >= 1, "block size must be at least 1");
        let max_block = (START_MASK >> OFFS_WIDTH) as usize;
        let block_size = block_size.min(max_block);
        let first = DataBlock::alloc(use_direct, block_size);
        let ww = [
            UnsafeCell::new(first),
            UnsafeCell::new(ptr::null_mut()),
            UnsafeCell::new(ptr::null_mut()),
            UnsafeCell::new(ptr::null_mut()),
            UnsafeCell::new(ptr::null_mut()),
            UnsafeCell::new(ptr::null_mut()),
        ];
        Self {
            block_size,
            use_direct,
            state: CachePadded::new(AtomicU64::new(0)),
            head: UnsafeCell::new(first),
            tail: UnsafeCell::new(first),
            ww,
        }
    }

    /// `new` with settings taken from `config`.
    pub fn with_config(config: &Config) -> Self {
        Self::new(config.use_direct_buffers, config.output_queue_block_size())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Appends `data` and returns the number of bytes this call made newly
    /// readable at the head.
    ///
    /// The return value is `data.len()` when this writer extended the chain
    /// or was the earliest in-flight writer, `0` when an earlier writer is
    /// still copying (its retirement will credit these bytes), and the whole
    /// cohort's byte count when this writer was the last of its cohort to
    /// retire. Summed over all calls, the credits equal the bytes staged.
    ///
    /// A single call must not exceed the 36-bit offset counter.
    pub fn add_data(&self, data: &[u8]) -> u64 {
        let data_size = data.len() as u64;
        assert!(data_size <= OFFS_MASK, "single write overflows the offset field");

        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state == REALLOC {
                state = self.state.load(Ordering::Acquire);
                continue;
            }

            let offs = offs_in_block(state, self.block_size);
            let space = self.block_size as u64 - offs;

            if data_size > space {
                // Spill: the chain has to grow, which needs the tail to
                // ourselves. Wait for in-flight writers, then take the
                // sentinel.
                if state & WRITERS_MASK != 0 {
                    state = self.state.load(Ordering::Acquire);
                    continue;
                }
                if self
                    .state
                    .compare_exchange(state, REALLOC, Ordering::Acquire, Ordering::Acquire)
                    .is_err()
                {
                    state = self.state.load(Ordering::Acquire);
                    continue;
                }

                unsafe { self.extend_chain(offs as usize, data) };

                let new_state = bump_offs(state, data_size, self.block_size);
                let installed = self
                    .state
                    .compare_exchange(REALLOC, new_state, Ordering::Release, Ordering::Relaxed)
                    .is_ok();
                debug_assert!(installed, "sentinel is owned by its installer");
                // No other writer was in flight, so every byte is readable.
                return data_size;
            }

            // Inline: reserve a writer slot in the current tail.
            let writers = state & WRITERS_MASK;
            if writers == WRITERS_MASK {
                state = self.state.load(Ordering::Acquire);
                continue;
            }
            let free = !state & WRITERS_MASK;
            let writer_bit = free & free.wrapping_neg();
            let writer_idx = (writer_bit >> WRITERS_SHIFT).trailing_zeros() as usize;

            let mut new_state =
                bump_offs(state, data_size, self.block_size) | (state & !OFFS_MASK) | writer_bit;
            if writers == 0 {
                debug_assert_eq!(state & START_MASK, 0);
                new_state |= offs << OFFS_WIDTH;
            }
            if self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                state = self.state.load(Ordering::Acquire);
                continue;
            }

            unsafe {
                let slot = self.ww[writer_idx].get();
                if (*slot).is_null() {
                    // The tail cannot move while our reservation is held.
                    *slot = *self.tail.get();
                }
                (**slot).write_at(offs as usize, data);
            }

            return self.retire(new_state, writer_bit, offs, data_size);
        }
    }

    /// Drops a writer reservation and computes the newly readable credit.
    fn retire(&self, reserved_state: u64, writer_bit: u64, offs: u64, data_size: u64) -> u64 {
        let mut state = reserved_state;
        loop {
            let retired = state - writer_bit;
            let start = (state & START_MASK) >> OFFS_WIDTH;
            if retired & WRITERS_MASK == 0 {
                // Last one out: the whole cohort becomes readable and this
                // writer gets the credit for all of it.
                let cleared = retired & !START_MASK;
                if self
                    .state
                    .compare_exchange(state, cleared, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let end = offs_in_block(cleared, self.block_size);
                    return end - start;
                }
            } else if offs == start {
                // Earliest in-flight: our bytes are contiguous with the
                // head, so credit them and move the cohort start up.
                let moved =
                    (retired & !START_MASK) | ((offs + data_size) << OFFS_WIDTH);
                if self
                    .state
                    .compare_exchange(state, moved, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return data_size;
                }
            } else {
                // A writer ahead of us is still copying; our bytes stay
                // parked behind the cohort start.
                if self
                    .state
                    .compare_exchange(state, retired, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return 0;
                }
            }
            state = self.state.load(Ordering::Acquire);
        }
    }

    /// Writes the tail remainder of `data` and grows the chain until the
    /// rest fits, leaving `ww[0]` viewing the new tail.
    ///
    /// # Safety
    ///
    /// The caller must hold the reallocation sentinel.
    unsafe fn extend_chain(&self, offs: usize, data: &[u8]) {
        unsafe {
            let space = self.block_size - offs;
            let mut tail = *self.tail.get();
            if space > 0 {
                (*tail).write_at(offs, &data[..space]);
            }
            for slot in &self.ww {
                *slot.get() = ptr::null_mut();
            }

            let mut rest = &data[space..];
            loop {
                let block = DataBlock::alloc(self.use_direct, self.block_size);
                (*tail).set_next(block);
                tail = block;
                if rest.len() <= self.block_size {
                    (*block).write_at(0, rest);
                    *self.ww[0].get() = block;
                    break;
                }
                (*block).write_at(0, &rest[..self.block_size]);
                rest = &rest[self.block_size..];
            }
            *self.tail.get() = tail;
        }
    }

    /// Stages up to `iov.len()` readable slices totalling at most
    /// `max_bytes` bytes, returning the staged byte count. Unused entries
    /// are cleared to `None`. Slices alias block memory and must be dropped
    /// before the matching [`remove_data`](OutputQueue::remove_data).
    ///
    /// `max_bytes` must not exceed the bytes currently credited as readable,
    /// and must be at least 1.
    pub fn get_data<'a>(&'a self, iov: &mut [Option<IoSlice<'a>>], max_bytes: u64) -> u64 {
        debug_assert!(!iov.is_empty());
        debug_assert!(max_bytes >= 1);
        unsafe {
            let mut block = *self.head.get();
            let mut pos = (*block).read_pos();

            if pos == (*block).capacity() {
                // The previous drain consumed the head exactly to its end;
                // drop it now that we know more data follows.
                let next = (*block).next();
                debug_assert!(!next.is_null(), "readable bytes behind an exhausted head");
                *self.head.get() = next;
                DataBlock::free(block);
                block = next;
                pos = (*block).read_pos();
                debug_assert_eq!(pos, 0);
            }

            let mut rest = max_bytes;
            let mut staged = 0u64;
            let mut idx = 0;
            loop {
                let mut len = ((*block).capacity() - pos) as u64;
                if len > rest {
                    len = rest;
                }
                iov[idx] = Some(IoSlice::new((*block).payload(pos, len as usize)));
                staged += len;
                rest -= len;
                idx += 1;
                if idx == iov.len() {
                    return staged;
                }
                if rest == 0 {
                    break;
                }
                block = (*block).next();
                debug_assert!(!block.is_null(), "staging past the written chain");
                pos = (*block).read_pos();
            }
            for slot in &mut iov[idx..] {
                *slot = None;
            }
            staged
        }
    }

    /// Consumes `bytes` starting at offset `pos0` within the head block
    /// (the head's read position when the bytes were staged), unlinking and
    /// freeing every fully consumed block. The final, partially consumed
    /// block keeps its remaining bytes and an updated read position.
    pub fn remove_data(&self, pos0: usize, bytes: u64) {
        unsafe {
            debug_assert_eq!(pos0, (*(*self.head.get())).read_pos());
            let mut pos = pos0;
            let mut rest = bytes;
            loop {
                let block = *self.head.get();
                let avail = ((*block).capacity() - pos) as u64;
                if rest <= avail {
                    (*block).set_read_pos(pos + rest as usize);
                    break;
                }
                let next = (*block).next();
                debug_assert!(!next.is_null(), "removing more bytes than staged");
                rest -= avail;
                *self.head.get() = next;
                DataBlock::free(block);
                pos = 0;
            }
        }
    }
}

impl Drop for OutputQueue {
    fn drop(&mut self) {
        unsafe {
            let mut block = *self.head.get();
            while !block.is_null() {
                let next = (*block).next();
                DataBlock::free(block);
                block = next;
            }
        }
    }
}
