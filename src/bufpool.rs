//! Fixed-capacity pool of equally-sized chunk buffers.
//!
//! All chunk I/O allocates through this pool, which bounds upload memory to
//! `chunk_size * capacity`. Buffers come back automatically when the guard
//! types drop, so every termination path of a chunk task returns its buffer.

use bytes::{Bytes, BytesMut};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Chunk size fixed by the remote protocol.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub struct BufferPool {
    chunk_size: usize,
    bufs: Mutex<Vec<BytesMut>>,
    permits: Semaphore,
}

impl BufferPool {
    pub fn new(chunk_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            chunk_size,
            bufs: Mutex::new(Vec::with_capacity(capacity)),
            permits: Semaphore::new(capacity),
        })
    }

    pub fn with_defaults(capacity: usize) -> Arc<Self> {
        Self::new(CHUNK_SIZE, capacity)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of buffers that can currently be handed out without blocking.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Borrow a buffer of length `chunk_size`, waiting until one is free.
    pub async fn get(self: &Arc<Self>) -> PooledBuffer {
        // The semaphore is never closed, so acquire can only fail after
        // close() which we do not expose.
        let permit = self.permits.acquire().await.expect("buffer pool closed");
        permit.forget();

        let mut buf = self
            .bufs
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.chunk_size));
        buf.resize(self.chunk_size, 0);

        PooledBuffer {
            pool: Arc::clone(self),
            buf: Some(buf),
        }
    }

    fn put(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() < self.chunk_size {
            // The allocation escaped with an outstanding reference; replace
            // it so pool capacity never decays.
            buf = BytesMut::with_capacity(self.chunk_size);
        }
        debug_assert!(buf.capacity() >= self.chunk_size);
        self.bufs.lock().expect("buffer pool poisoned").push(buf);
        self.permits.add_permits(1);
    }
}

/// A mutable buffer on loan from the pool. Returned on drop.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: Option<BytesMut>,
}

impl PooledBuffer {
    /// Freeze the current contents (truncate first to the bytes actually
    /// read) into a cheaply cloneable chunk that still owns the pool slot.
    pub fn freeze(mut self) -> FrozenChunk {
        let buf = self.buf.take().expect("buffer already taken");
        FrozenChunk {
            pool: Arc::clone(&self.pool),
            bytes: buf.freeze(),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer already taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer already taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Immutable chunk contents plus the pool slot they occupy. `bytes()` hands
/// out zero-copy clones for each send attempt; the storage is reclaimed when
/// the chunk drops.
pub struct FrozenChunk {
    pool: Arc<BufferPool>,
    bytes: Bytes,
}

impl FrozenChunk {
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl Drop for FrozenChunk {
    fn drop(&mut self) {
        let bytes = std::mem::take(&mut self.bytes);
        match bytes.try_into_mut() {
            Ok(buf) => self.pool.put(buf),
            // A clone is still alive somewhere (an aborted request body);
            // give the pool a fresh buffer instead.
            Err(_) => self.pool.put(BytesMut::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_blocks_until_put() {
        let pool = BufferPool::new(16, 2);
        let a = pool.get().await;
        let _b = pool.get().await;
        assert_eq!(pool.available(), 0);

        // A third get must wait for a buffer to come back.
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let buf = pool.get().await;
                buf.len()
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(a);
        assert_eq!(waiter.await.unwrap(), 16);
    }

    #[tokio::test]
    async fn buffers_have_chunk_size_length() {
        let pool = BufferPool::new(32, 1);
        let mut buf = pool.get().await;
        assert_eq!(buf.len(), 32);
        buf.truncate(5);
        drop(buf);

        // Returned buffers are resized back on the next get.
        let buf = pool.get().await;
        assert_eq!(buf.len(), 32);
    }

    #[tokio::test]
    async fn freeze_reclaims_the_slot() {
        let pool = BufferPool::new(8, 1);
        let mut buf = pool.get().await;
        buf.truncate(3);
        let chunk = buf.freeze();
        assert_eq!(pool.available(), 0);

        let payload = chunk.bytes();
        assert_eq!(payload.len(), 3);
        drop(payload);
        drop(chunk);
        assert_eq!(pool.available(), 1);

        let buf = pool.get().await;
        assert_eq!(buf.len(), 8);
    }

    #[tokio::test]
    async fn escaped_clone_does_not_shrink_the_pool() {
        let pool = BufferPool::new(8, 1);
        let chunk = pool.get().await.freeze();
        let escaped = chunk.bytes();
        drop(chunk);
        assert_eq!(pool.available(), 1);

        let buf = pool.get().await;
        assert_eq!(buf.len(), 8);
        drop(escaped);
    }
}
