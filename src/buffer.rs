// buffer.rs - pooled fixed-capacity datagram buffers with a reserved header prefix

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

/// Datagram ceiling assumed for every path.
pub const PATH_MTU: usize = 1400;

/// Worst-case envelope header plus MAC tag.
pub const BASIC_HEADER_RESERVE: usize = 52;

/// Extra room for an IPv4 + UDP header written in raw-socket mode.
pub const RAW_FRAMING_RESERVE: usize = 100;

/// Header reservation used when raw framing is active.
pub const RAW_HEADER_RESERVE: usize = BASIC_HEADER_RESERVE + RAW_FRAMING_RESERVE;

/// Layout of buffers handed out by a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Bytes reserved in front of the payload for headers.
    pub header_reserve: usize,
    /// Largest datagram the envelope may occupy, excluding raw framing.
    pub mtu: usize,
}

impl BufferLayout {
    pub const fn basic(mtu: usize) -> Self {
        Self {
            header_reserve: BASIC_HEADER_RESERVE,
            mtu,
        }
    }

    pub const fn raw(mtu: usize) -> Self {
        Self {
            header_reserve: RAW_HEADER_RESERVE,
            mtu,
        }
    }

    /// Total bytes allocated per buffer.
    pub const fn capacity(&self) -> usize {
        self.header_reserve + self.mtu
    }

    /// Largest payload a single datagram can carry.
    pub const fn max_payload(&self) -> usize {
        self.mtu - BASIC_HEADER_RESERVE
    }
}

#[derive(Debug)]
struct PoolInner {
    layout: BufferLayout,
    free: Mutex<Vec<Vec<u8>>>,
    retain: usize,
}

/// Free-list of reusable datagram buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool that keeps at most `retain` idle buffers.
    pub fn new(layout: BufferLayout, retain: usize) -> Self {
        let free = (0..retain.min(16))
            .map(|_| vec![0u8; layout.capacity()])
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                layout,
                free: Mutex::new(free),
                retain,
            }),
        }
    }

    pub fn layout(&self) -> BufferLayout {
        self.inner.layout
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Takes a buffer whose payload cursor starts right after the header reservation.
    pub fn acquire(&self) -> PooledBuffer {
        let storage = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.layout.capacity()]);
        let start = self.inner.layout.header_reserve;
        PooledBuffer {
            storage: Some(storage),
            start,
            end: start,
            pool: Arc::clone(&self.inner),
        }
    }

    fn release(inner: &PoolInner, storage: Vec<u8>) {
        let mut free = inner.free.lock();
        if free.len() < inner.retain {
            free.push(storage);
        }
    }
}

/// Exclusively owned buffer that returns to its pool when dropped.
///
/// The live region is `start..end`. Headers are written by moving `start`
/// backwards into the reservation; trailers extend `end`.
pub struct PooledBuffer {
    storage: Option<Vec<u8>>,
    start: usize,
    end: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    fn storage(&self) -> &[u8] {
        self.storage.as_deref().unwrap_or(&[])
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        self.storage.as_deref_mut().unwrap_or(&mut [])
    }

    /// Live bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage()[self.start..self.end]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        &mut self.storage_mut()[start..end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Bytes still available before the buffer's end.
    pub fn tail_room(&self) -> usize {
        self.storage().len() - self.end
    }

    /// Bytes still available in front of the live region.
    pub fn head_room(&self) -> usize {
        self.start
    }

    /// Appends bytes at the end of the live region.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if bytes.len() > self.tail_room() {
            return Err(BufferFull {
                requested: bytes.len(),
                available: self.tail_room(),
            });
        }
        let end = self.end;
        self.storage_mut()[end..end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// Copies `bytes` immediately before the live region and extends it to cover them.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if bytes.len() > self.start {
            return Err(BufferFull {
                requested: bytes.len(),
                available: self.start,
            });
        }
        let new_start = self.start - bytes.len();
        let old_start = self.start;
        self.storage_mut()[new_start..old_start].copy_from_slice(bytes);
        self.start = new_start;
        Ok(())
    }

    /// Opens the whole storage as the live region, for receive.
    pub fn reset_for_receive(&mut self) -> &mut [u8] {
        self.start = 0;
        self.end = self.storage().len();
        self.storage_mut()
    }

    /// Shrinks the live region to `start..start + len` relative to the current start.
    pub fn set_window(&mut self, offset: usize, len: usize) {
        let cap = self.storage().len();
        let start = (self.start + offset).min(cap);
        self.start = start;
        self.end = (start + len).min(cap);
    }

    /// Drops `len` bytes from the end of the live region.
    pub fn truncate_back(&mut self, len: usize) {
        self.end = self.end.saturating_sub(len).max(self.start);
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            BufferPool::release(&self.pool, storage);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// Buffer capacity exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer full: requested {requested} bytes, {available} available")]
pub struct BufferFull {
    pub requested: usize,
    pub available: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_header_room() {
        let pool = BufferPool::new(BufferLayout::basic(PATH_MTU), 4);
        let mut buf = pool.acquire();
        assert_eq!(buf.head_room(), BASIC_HEADER_RESERVE);
        buf.extend_from_slice(b"payload").unwrap();
        buf.prepend(&[1, 2, 3]).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 3, b'p', b'a', b'y', b'l', b'o', b'a', b'd']);
    }

    #[test]
    fn raw_layout_reserves_framing() {
        let layout = BufferLayout::raw(PATH_MTU);
        assert_eq!(layout.header_reserve, 152);
        assert_eq!(layout.max_payload(), BufferLayout::basic(PATH_MTU).max_payload());
        let pool = BufferPool::new(layout, 1);
        assert_eq!(pool.acquire().head_room(), 152);
    }

    #[test]
    fn buffer_returns_to_pool_once() {
        let pool = BufferPool::new(BufferLayout::basic(PATH_MTU), 2);
        let before = pool.idle();
        let buf = pool.acquire();
        assert_eq!(pool.idle(), before - 1);
        drop(buf);
        assert_eq!(pool.idle(), before);
    }

    #[test]
    fn pool_caps_retained_buffers() {
        let pool = BufferPool::new(BufferLayout::basic(PATH_MTU), 1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn rejects_overflow() {
        let pool = BufferPool::new(BufferLayout::basic(PATH_MTU), 1);
        let mut buf = pool.acquire();
        let too_big = vec![0u8; buf.tail_room() + 1];
        assert!(buf.extend_from_slice(&too_big).is_err());
        assert!(buf.prepend(&[0u8; BASIC_HEADER_RESERVE + 1]).is_err());
    }
}
