//! Circular Buffer (§4.10): the growable-up-to-capacity ring underlying the
//! Adaptive Read-Ahead Cache and any other blocking producer/consumer
//! handoff in this crate.

use thiserror::Error;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer full")]
    Full,
    #[error("write larger than max capacity")]
    TooLarge,
}

struct Inner {
    buf: Vec<u8>,
    /// Logical start of valid data within `buf`, mod `buf.len()`.
    head: usize,
    /// Number of valid unread bytes currently stored.
    len: usize,
    max_capacity: usize,
    closed: bool,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn available_space(&self) -> usize {
        self.capacity() - self.len
    }

    fn grow_to(&mut self, want: usize) {
        let want = want.min(self.max_capacity).max(self.buf.len());
        if want <= self.buf.len() {
            return;
        }
        // Linearize so head is 0, then extend.
        let mut linear = Vec::with_capacity(want);
        linear.extend(self.iter_readable());
        linear.resize(want, 0);
        self.buf = linear;
        self.head = 0;
    }

    fn iter_readable(&self) -> Vec<u8> {
        let cap = self.capacity();
        if cap == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.buf[(self.head + i) % cap]);
        }
        out
    }

    fn push_slice(&mut self, data: &[u8]) {
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        for (i, &b) in data.iter().enumerate() {
            self.buf[(tail + i) % cap] = b;
        }
        self.len += data.len();
    }

    fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let cap = self.capacity();
        let n = out.len().min(self.len);
        for i in 0..n {
            out[i] = self.buf[(self.head + i) % cap];
        }
        self.head = (self.head + n) % cap.max(1);
        self.len -= n;
        n
    }
}

/// A growable ring buffer with blocking and non-blocking write modes and a
/// blocking read. Safe for one writer and one reader concurrently.
pub struct CircularBuffer {
    inner: Mutex<Inner>,
    space_available: Notify,
    data_available: Notify,
}

impl CircularBuffer {
    pub fn new(min_capacity: usize, max_capacity: usize) -> Self {
        let initial = min_capacity.max(1).min(max_capacity.max(1));
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; initial],
                head: 0,
                len: 0,
                max_capacity: max_capacity.max(initial),
                closed: false,
            }),
            space_available: Notify::new(),
            data_available: Notify::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity()
    }

    pub async fn available_space(&self) -> usize {
        self.inner.lock().await.available_space()
    }

    /// Grow the backing buffer (up to `max_capacity`) ahead of a write, so
    /// a single read-ahead fetch can land in one contiguous region where
    /// possible.
    pub async fn ensure_capacity(&self, want: usize) {
        self.inner.lock().await.grow_to(want);
    }

    /// Non-blocking write: fails outright if there isn't room, growing the
    /// ring (up to `max_capacity`) first if that would make room.
    pub async fn try_write(&self, data: &[u8]) -> Result<(), BufferError> {
        let mut inner = self.inner.lock().await;
        if data.len() > inner.max_capacity {
            return Err(BufferError::TooLarge);
        }
        if data.len() > inner.available_space() {
            inner.grow_to(inner.len + data.len());
        }
        if data.len() > inner.available_space() {
            return Err(BufferError::Full);
        }
        inner.push_slice(data);
        drop(inner);
        self.data_available.notify_waiters();
        Ok(())
    }

    /// Blocking write: waits for space to free up (via reads) rather than
    /// failing, growing the ring first when that alone would suffice.
    ///
    /// The `notified()` future is created before the capacity check, not
    /// after it fails, so a reader that frees space in that window can't
    /// notify_waiters() into the void.
    pub async fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        if data.len() > self.inner.lock().await.max_capacity {
            return Err(BufferError::TooLarge);
        }
        loop {
            let notified = self.space_available.notified();
            match self.try_write(data).await {
                Ok(()) => return Ok(()),
                Err(BufferError::Full) => {
                    notified.await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Blocking read: waits until at least one byte is available or the
    /// buffer is closed (yielding `0`).
    pub async fn read(&self, out: &mut [u8]) -> usize {
        loop {
            let notified = self.data_available.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.len > 0 {
                    let n = inner.pop_into(out);
                    drop(inner);
                    self.space_available.notify_waiters();
                    return n;
                }
                if inner.closed {
                    return 0;
                }
            }
            notified.await;
        }
    }

    /// Drops up to `n` buffered-but-unread bytes without copying them out,
    /// for a forward seek that lands inside the currently buffered region.
    pub async fn discard(&self, n: usize) -> usize {
        let mut inner = self.inner.lock().await;
        let cap = inner.capacity().max(1);
        let n = n.min(inner.len);
        inner.head = (inner.head + n) % cap;
        inner.len -= n;
        drop(inner);
        if n > 0 {
            self.space_available.notify_waiters();
        }
        n
    }

    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.data_available.notify_waiters();
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.head = 0;
        inner.len = 0;
        inner.closed = false;
        self.space_available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let rb = CircularBuffer::new(4, 16);
        rb.try_write(b"hello").await.unwrap();
        let mut out = [0u8; 5];
        let n = rb.read(&mut out).await;
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[tokio::test]
    async fn try_write_fails_when_full_and_ungrowable() {
        let rb = CircularBuffer::new(4, 4);
        rb.try_write(b"abcd").await.unwrap();
        assert_eq!(rb.try_write(b"e").await, Err(BufferError::Full));
    }

    #[tokio::test]
    async fn try_write_grows_ring_up_to_max() {
        let rb = CircularBuffer::new(2, 10);
        rb.try_write(b"abcdef").await.unwrap();
        assert_eq!(rb.len().await, 6);
        assert!(rb.capacity().await >= 6);
    }

    #[tokio::test]
    async fn blocking_write_waits_for_space() {
        let rb = Arc::new(CircularBuffer::new(4, 4));
        rb.try_write(b"abcd").await.unwrap();

        let rb2 = rb.clone();
        let writer = tokio::spawn(async move {
            rb2.write(b"ef").await.unwrap();
        });

        tokio::task::yield_now().await;
        let mut out = [0u8; 2];
        let n = rb.read(&mut out).await;
        assert_eq!(n, 2);
        assert_eq!(&out, b"ab");

        writer.await.unwrap();
        assert_eq!(rb.len().await, 4);
    }

    #[tokio::test]
    async fn read_returns_zero_after_close_when_empty() {
        let rb = CircularBuffer::new(4, 4);
        rb.close().await;
        let mut out = [0u8; 1];
        assert_eq!(rb.read(&mut out).await, 0);
    }

    #[tokio::test]
    async fn wraps_around_ring_boundary() {
        let rb = CircularBuffer::new(4, 4);
        rb.try_write(b"abcd").await.unwrap();
        let mut out = [0u8; 2];
        rb.read(&mut out).await;
        rb.try_write(b"ef").await.unwrap();
        let mut rest = [0u8; 4];
        let n = rb.read(&mut rest).await;
        assert_eq!(n, 4);
        assert_eq!(&rest, b"cdef");
    }
}
