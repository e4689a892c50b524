use std::cmp::min;
use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// The body fragments of a single delivery in arrival order.
///
/// Fragments are kept as the `Bytes` they arrived in, so appending never copies. Reading copies
///  into the caller's buffer exactly once; taking chunks for transmission is zero-copy unless a
///  chunk spans several fragments.
#[derive(Debug, Default)]
pub struct DeliveryBuffer {
    fragments: VecDeque<Bytes>,
    buffered: usize,
    /// number of bytes that were read or taken from this buffer so far
    consumed: usize,
}

impl DeliveryBuffer {
    pub fn new() -> DeliveryBuffer {
        DeliveryBuffer::default()
    }

    pub fn push(&mut self, fragment: Bytes) {
        if fragment.is_empty() {
            return;
        }
        self.buffered += fragment.len();
        self.fragments.push_back(fragment);
    }

    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Copies as many bytes as fit into `dst`, returning the number of bytes copied
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        while written < dst.len() {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };

            let n = min(front.len(), dst.len() - written);
            dst[written..written + n].copy_from_slice(&front[..n]);
            front.advance(n);
            written += n;

            if front.is_empty() {
                self.fragments.pop_front();
            }
        }

        self.buffered -= written;
        self.consumed += written;
        written
    }

    /// Removes and returns up to `max_len` bytes from the start of the buffer
    pub fn take_chunk(&mut self, max_len: usize) -> Bytes {
        let target = min(max_len, self.buffered);
        if target == 0 {
            return Bytes::new();
        }

        let front_len = self.fragments.front().map(|f| f.len()).unwrap_or(0);
        let chunk = match self.fragments.front_mut() {
            Some(front) if front_len >= target => {
                let chunk = front.split_to(target);
                if front.is_empty() {
                    self.fragments.pop_front();
                }
                chunk
            }
            _ => self.merge_fragments(target),
        };

        self.buffered -= chunk.len();
        self.consumed += chunk.len();
        chunk
    }

    /// assembles a chunk that spans several fragments
    fn merge_fragments(&mut self, target: usize) -> Bytes {
        let mut merged = BytesMut::with_capacity(target);
        while merged.len() < target {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            let n = min(front.len(), target - merged.len());
            merged.extend_from_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                self.fragments.pop_front();
            }
        }
        merged.freeze()
    }

    /// Discards all buffered bytes, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.buffered;
        self.fragments.clear();
        self.buffered = 0;
        discarded
    }
}
