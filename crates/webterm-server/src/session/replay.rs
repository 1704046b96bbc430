//! Bounded backlog of recent backend output for catching up attached viewers.
//!
//! Output is kept as a chain of chunks, one per backend read. Whole chunks are
//! evicted from the front while the total exceeds the budget, but the newest
//! chunk always survives even when it alone is larger than the budget.

use std::collections::VecDeque;

/// Chunk chain holding roughly the last `budget` bytes of output.
#[derive(Debug)]
pub struct ReplayBuffer {
    chunks: VecDeque<String>,
    len: usize,
    budget: usize,
}

impl ReplayBuffer {
    pub fn new(budget: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            budget,
        }
    }

    /// Append a chunk, then evict the oldest ones over budget.
    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.chunks.push_back(chunk.to_string());
        self.len += chunk.len();

        while self.len > self.budget && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.len -= old.len();
            }
        }
    }

    /// Buffered output, oldest first.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.len);
        for c in &self.chunks {
            out.push_str(c);
        }
        out
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
