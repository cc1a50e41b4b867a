//! Bounded FIFO byte buffer, one per connection direction.
//!
//! `add` appends even past the configured capacity; overflow is a soft
//! condition callers avoid by checking `space` first. `push_front` ungets
//! bytes when a decoded header turns out to precede an incomplete payload.

pub struct IoBuffer {
    buf: Vec<u8>,
    head: usize,
    capacity: usize,
}

// Consumed prefix beyond which `add` compacts the backing vector.
const COMPACT_THRESHOLD: usize = 64 * 1024;

impl IoBuffer {
    pub fn new(capacity: usize) -> Self {
        IoBuffer {
            buf: Vec::new(),
            head: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Room left before the buffer exceeds its capacity.
    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Append `data` unconditionally. Returns false when the buffer is now
    /// past capacity.
    pub fn add(&mut self, data: &[u8]) -> bool {
        if self.head >= COMPACT_THRESHOLD || self.head == self.buf.len() {
            self.buf.drain(..self.head);
            self.head = 0;
        }
        self.buf.extend_from_slice(data);
        self.len() <= self.capacity
    }

    /// Pop up to `n` bytes from the front.
    pub fn get(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.len());
        let out = self.buf[self.head..self.head + n].to_vec();
        self.head += n;
        if self.head == self.buf.len() {
            self.buf.clear();
            self.head = 0;
        }
        out
    }

    /// Borrow the buffered bytes without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    /// Unget: put `data` back at the front of the buffer.
    pub fn push_front(&mut self, data: &[u8]) {
        let mut merged = Vec::with_capacity(data.len() + self.len());
        merged.extend_from_slice(data);
        merged.extend_from_slice(&self.buf[self.head..]);
        self.buf = merged;
        self.head = 0;
    }
}
