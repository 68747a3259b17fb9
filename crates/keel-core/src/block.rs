use std::alloc::{self, Layout};
use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};
use std::slice;

/// Alignment for OS-backed ("direct") block payloads.
const DIRECT_ALIGN: usize = 4096;
/// Alignment for plain heap payloads.
const HEAP_ALIGN: usize = 64;

/// Fixed-capacity byte region linked into a chain.
///
/// A block carries two independent cursors over the same payload: a write
/// view (`write_pos`, owned by whichever role appends) and a read view
/// (`read_pos`, owned by the consuming role), so producer and consumer never
/// contend on cursor state. Capacity travels with the block because the
/// thread-local cache may hand a block to a queue configured with a
/// different block size.
pub(crate) struct DataBlock {
    next: UnsafeCell<*mut DataBlock>,
    read_pos: UnsafeCell<usize>,
    write_pos: UnsafeCell<usize>,
    cap: usize,
    layout: Layout,
    buf: NonNull<u8>,
}

// SAFETY: a block is reachable from at most one writer role and one reader
// role at a time; each role touches only its own cursor, and payload ranges
// handed to the reader are published through the owning queue's atomic state
// word before the reader may look at them.
unsafe impl Send for DataBlock {}
unsafe impl Sync for DataBlock {}

impl DataBlock {
    /// Allocates an empty block. `direct` selects page alignment for the
    /// payload, the closest analogue of an OS-backed buffer.
    pub(crate) fn alloc(direct: bool, size: usize) -> *mut DataBlock {
        debug_assert!(size >= 1);
        let align = if direct { DIRECT_ALIGN } else { HEAP_ALIGN };
        let layout = Layout::from_size_align(size, align).expect("unrepresentable block layout");
        let raw = unsafe { alloc::alloc(layout) };
        let Some(buf) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Box::into_raw(Box::new(DataBlock {
            next: UnsafeCell::new(ptr::null_mut()),
            read_pos: UnsafeCell::new(0),
            write_pos: UnsafeCell::new(0),
            cap: size,
            layout,
            buf,
        }))
    }

    /// Frees a block and its payload.
    ///
    /// # Safety
    ///
    /// The caller must own `block` exclusively and it must be unlinked.
    pub(crate) unsafe fn free(block: *mut DataBlock) {
        debug_assert!(!block.is_null());
        drop(unsafe { Box::from_raw(block) });
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    pub(crate) fn next(&self) -> *mut DataBlock {
        unsafe { *self.next.get() }
    }

    pub(crate) fn set_next(&self, next: *mut DataBlock) {
        unsafe { *self.next.get() = next }
    }

    pub(crate) fn read_pos(&self) -> usize {
        unsafe { *self.read_pos.get() }
    }

    pub(crate) fn set_read_pos(&self, pos: usize) {
        debug_assert!(pos <= self.cap);
        unsafe { *self.read_pos.get() = pos }
    }

    pub(crate) fn write_pos(&self) -> usize {
        unsafe { *self.write_pos.get() }
    }

    pub(crate) fn advance_write_pos(&self, n: usize) {
        let pos = self.write_pos() + n;
        debug_assert!(pos <= self.cap);
        unsafe { *self.write_pos.get() = pos }
    }

    pub(crate) fn write_remaining(&self) -> usize {
        self.cap - self.write_pos()
    }

    /// Clears both cursors; required before a block enters the cache.
    pub(crate) fn reset(&self) {
        unsafe {
            *self.read_pos.get() = 0;
            *self.write_pos.get() = 0;
        }
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.read_pos() == 0 && self.write_pos() == 0
    }

    /// Copies `data` into the payload at `offs`.
    ///
    /// # Safety
    ///
    /// The caller must hold an exclusive reservation on
    /// `offs..offs + data.len()`.
    pub(crate) unsafe fn write_at(&self, offs: usize, data: &[u8]) {
        debug_assert!(offs + data.len() <= self.cap);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.buf.as_ptr().add(offs), data.len());
        }
    }

    /// Published payload bytes at `pos..pos + len`.
    ///
    /// # Safety
    ///
    /// The range must have been written and published to the calling role.
    pub(crate) unsafe fn payload(&self, pos: usize, len: usize) -> &[u8] {
        debug_assert!(pos + len <= self.cap);
        unsafe { slice::from_raw_parts(self.buf.as_ptr().add(pos), len) }
    }

    /// The unwritten tail of the payload, for a socket read.
    ///
    /// # Safety
    ///
    /// The caller must be the only writer role of this block.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn write_buf(&self) -> &mut [u8] {
        unsafe {
            slice::from_raw_parts_mut(
                self.buf.as_ptr().add(self.write_pos()),
                self.write_remaining(),
            )
        }
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.buf.as_ptr(), self.layout) }
    }
}

struct CacheSlot(Cell<*mut DataBlock>);

impl Drop for CacheSlot {
    fn drop(&mut self) {
        let block = self.0.get();
        if !block.is_null() {
            unsafe { DataBlock::free(block) };
        }
    }
}

thread_local! {
    // One recycled block per worker thread. A single slot keeps ownership
    // transfer trivial: a block is either here, or in exactly one chain.
    static CACHED_BLOCK: CacheSlot = const { CacheSlot(Cell::new(ptr::null_mut())) };
}

/// Takes the calling thread's cached block, if any. Cached blocks are always
/// reset.
pub(crate) fn cache_take() -> *mut DataBlock {
    CACHED_BLOCK.with(|slot| slot.0.replace(ptr::null_mut()))
}

/// Cached block if present, otherwise a fresh allocation.
pub(crate) fn cache_take_or_alloc(direct: bool, size: usize) -> *mut DataBlock {
    let cached = cache_take();
    if cached.is_null() {
        DataBlock::alloc(direct, size)
    } else {
        cached
    }
}

/// Offers `block` to the calling thread's cache; frees it when the slot is
/// already occupied.
///
/// # Safety
///
/// The caller must own `block` exclusively; it must be unlinked and reset.
pub(crate) unsafe fn cache_put(block: *mut DataBlock) {
    unsafe {
        debug_assert!(!block.is_null());
        debug_assert!((*block).next().is_null(), "caching a linked block");
        debug_assert!((*block).is_reset(), "caching a dirty block");
        CACHED_BLOCK.with(|slot| {
            if slot.0.get().is_null() {
                slot.0.set(block);
            } else {
                DataBlock::free(block);
            }
        });
    }
}
