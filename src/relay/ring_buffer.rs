//! Bounded ring buffer of the most recent transcoder output
//!
//! Non-segmented records keep the tail of the child's stdout here so that
//! late-joining subscribers get a fast start: the ring contents are flushed
//! to them once at attach time, followed by live chunks. The buffer is
//! byte-bounded; whole chunks are evicted from the front as the cap is
//! exceeded.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
    capacity: usize,
    total_in: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            capacity,
            total_in: 0,
        }
    }

    /// Append a chunk, evicting oldest chunks until the byte cap holds
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_in += chunk.len() as u64;
        self.size += chunk.len();
        self.chunks.push_back(chunk);
        while self.size > self.capacity {
            match self.chunks.pop_front() {
                Some(evicted) => self.size -= evicted.len(),
                None => break,
            }
        }
    }

    /// Contiguous copy of the current contents, oldest byte first
    pub fn snapshot(&self) -> Bytes {
        if self.chunks.is_empty() {
            return Bytes::new();
        }
        let mut out = BytesMut::with_capacity(self.size);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Total bytes ever pushed, including evicted ones
    pub fn total_in(&self) -> u64 {
        self.total_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_preserves_order() {
        let mut ring = RingBuffer::new(1024);
        ring.push(Bytes::from_static(b"abc"));
        ring.push(Bytes::from_static(b"def"));
        assert_eq!(ring.snapshot(), Bytes::from_static(b"abcdef"));
        assert_eq!(ring.len(), 6);
    }

    #[test]
    fn cap_evicts_oldest_chunks() {
        let mut ring = RingBuffer::new(8);
        ring.push(Bytes::from_static(b"aaaa"));
        ring.push(Bytes::from_static(b"bbbb"));
        ring.push(Bytes::from_static(b"cc"));
        // "aaaa" must go to get back under the 8-byte cap
        assert_eq!(ring.snapshot(), Bytes::from_static(b"bbbbcc"));
        assert!(ring.len() <= 8);
        assert_eq!(ring.total_in(), 10);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut ring = RingBuffer::new(8);
        ring.push(Bytes::new());
        assert!(ring.is_empty());
        assert_eq!(ring.snapshot(), Bytes::new());
    }
}
