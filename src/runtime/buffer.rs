//! Receive buffer pool.
//!
//! Provides fixed-size buffer allocation without per-exchange malloc overhead.
//! Each open connection holds one buffer for the lifetime of the connection
//! and returns it to the pool when it closes.

/// Pool of fixed-size receive buffers.
///
/// Buffers are pre-allocated and reused. The pool tracks which buffers are
/// in use via a free list.
pub struct BufferPool {
    /// Actual buffer storage.
    buffers: Vec<Vec<u8>>,
    /// Stack of available buffer indices (LIFO for cache locality).
    free_list: Vec<usize>,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let mut buffers = Vec::with_capacity(count);
        let mut free_list = Vec::with_capacity(count);

        // Reverse so the first allocation hands out index 0
        for i in (0..count).rev() {
            buffers.push(vec![0u8; size]);
            free_list.push(i);
        }

        Self { buffers, free_list }
    }

    /// Allocate a buffer from the pool.
    ///
    /// Returns `None` if no buffers are available.
    pub fn alloc(&mut self) -> Option<usize> {
        self.free_list.pop()
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, idx: usize) {
        debug_assert!(idx < self.buffers.len(), "buffer index out of bounds");
        debug_assert!(!self.free_list.contains(&idx), "buffer freed twice");
        self.free_list.push(idx);
    }

    /// Get a mutable reference to a buffer.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.buffers[idx]
    }
}
