use std::thread;

/// Tunables the framework layer hands down when wiring pools and sessions.
///
/// The per-queue block sizes default to 0, meaning "inherit
/// [`block_size`](Config::block_size)"; use the resolver accessors when
/// constructing queues.
#[derive(Debug, Clone)]
pub struct Config {
    /// Allocate page-aligned, OS-backed buffers instead of plain heap ones.
    pub use_direct_buffers: bool,
    /// Default byte capacity of a data block in either queue.
    pub block_size: usize,
    /// Input-queue override for `block_size`; 0 inherits.
    pub input_queue_block_size: usize,
    /// Output-queue override for `block_size`; 0 inherits.
    pub output_queue_block_size: usize,
    /// Worker threads in the work pool.
    pub threads: usize,
    /// Number of run queues the pool spreads submissions over.
    pub contention_factor: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_direct_buffers: false,
            block_size: 32 * 1024,
            input_queue_block_size: 0,
            output_queue_block_size: 0,
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            contention_factor: 8,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_direct_buffers(mut self, value: bool) -> Self {
        self.use_direct_buffers = value;
        self
    }

    pub fn block_size(mut self, value: usize) -> Self {
        self.block_size = value;
        self
    }

    pub fn input_queue_block_size(&self) -> usize {
        if self.input_queue_block_size != 0 {
            self.input_queue_block_size
        } else {
            self.block_size
        }
    }

    pub fn output_queue_block_size(&self) -> usize {
        if self.output_queue_block_size != 0 {
            self.output_queue_block_size
        } else {
            self.block_size
        }
    }

    pub fn threads(mut self, value: usize) -> Self {
        self.threads = value;
        self
    }

    pub fn contention_factor(mut self, value: usize) -> Self {
        self.contention_factor = value;
        self
    }
}
