//! Shared output buffer
//!
//! The reader thread appends sanitized lines; the session loop drains them.
//! Append and drain each take the lock once, so a drain is a snapshot-and-clear
//! that can never observe half of an append.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Result of draining the buffer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drained {
    /// Chunks in arrival order
    pub chunks: Vec<String>,
    /// Chunks evicted by the size cap since the previous drain
    pub dropped: u64,
}

impl Drained {
    /// All chunks concatenated
    pub fn text(&self) -> String {
        self.chunks.concat()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

struct Inner {
    chunks: VecDeque<String>,
    dropped: u64,
}

/// Ordered queue of output chunks
pub struct OutputBuffer {
    inner: Mutex<Inner>,
    /// Maximum chunks held before the oldest is evicted (None = unbounded)
    max_chunks: Option<usize>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    /// Create an unbounded buffer
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// Create a buffer that keeps at most `max_chunks` chunks
    pub fn with_capacity_limit(max_chunks: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                dropped: 0,
            }),
            max_chunks: max_chunks.filter(|&n| n > 0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Each critical section is one push or take, so poisoned data is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a chunk to the end of the sequence
    pub fn append(&self, chunk: String) {
        let mut inner = self.lock();
        inner.chunks.push_back(chunk);

        if let Some(max) = self.max_chunks {
            while inner.chunks.len() > max {
                inner.chunks.pop_front();
                inner.dropped += 1;
            }
        }
    }

    /// Take every buffered chunk and leave the buffer empty
    pub fn drain(&self) -> Drained {
        let mut inner = self.lock();
        let chunks: Vec<String> = std::mem::take(&mut inner.chunks).into();
        let dropped = std::mem::take(&mut inner.dropped);
        drop(inner);

        if dropped > 0 {
            warn!("Output buffer full, {} oldest chunks dropped", dropped);
        }

        Drained { chunks, dropped }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }
}
