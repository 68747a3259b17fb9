use std::io;
use std::sync::Arc;

/// A callback executed single-threadedly by the selector loop.
pub trait SelectorTask: Send + Sync {
    fn run_in_selector_thread(&self);
}

/// Hands callbacks to the framework's selector thread.
///
/// The bridge must execute each task exactly once, on the selector thread,
/// in submission order.
pub trait SelectorBridge: Send + Sync {
    fn execute_in_selector_thread(&self, task: Arc<dyn SelectorTask>);
}

/// Receives a session's inbound bytes and its terminal close event.
///
/// Both callbacks run on pool worker threads. A listener may submit work
/// back to the pool but must not block the worker.
pub trait SessionListener: Send + Sync {
    /// Contiguous bytes in socket-arrival order. The slice is only valid for
    /// the duration of the call.
    fn on_data_received(&self, data: &[u8]);

    /// Fired exactly once, after the final bytes have been delivered.
    fn on_connection_closed(&self);
}

/// Non-blocking byte-stream endpoint as the core sees it.
pub trait SessionSocket: Send + Sync {
    /// Reads available bytes into `dst`. `Ok(0)` and every `Err` are folded
    /// into the single terminal close event: reads are only attempted after
    /// the selector reported readiness, so "readable but zero bytes" means
    /// the peer is gone, exactly like an error does.
    fn read(&self, dst: &mut [u8]) -> io::Result<usize>;

    /// Arms read-readiness. Called only from the selector thread.
    fn enable_read_interest(&self);
}
