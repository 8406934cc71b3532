//! Per-chunk and whole-file MD5 digests.
//!
//! Digest choice is fixed by the remote protocol: MD5, lowercase hex. Reads
//! go through the shared buffer pool so hashing competes for the same memory
//! budget as the uploads it feeds.

use crate::bufpool::BufferPool;
use md5::{Digest, Md5};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Clone)]
pub struct ChunkHasher {
    pool: Arc<BufferPool>,
}

impl ChunkHasher {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    /// Ordered list of per-chunk digests for `path`, one per `chunk_size`
    /// slice. The final chunk may be short; an empty file yields exactly one
    /// digest, that of the empty input.
    pub async fn block_list(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut file = File::open(path).await?;
        let mut blocks = Vec::new();

        loop {
            let mut buf = self.pool.get().await;
            let n = read_full(&mut file, &mut buf[..]).await?;
            if n == 0 && !blocks.is_empty() {
                break;
            }
            blocks.push(md5_hex(&buf[..n]));
            if n < buf.len() {
                break;
            }
        }

        Ok(blocks)
    }

    /// MD5 over the first `limit` bytes (or the whole file when shorter).
    /// The remote accepts this as a cheap pre-check alongside the full
    /// digest.
    pub async fn prefix_digest(&self, path: &Path, limit: usize) -> io::Result<String> {
        let mut file = File::open(path).await?;
        let mut hasher = Md5::new();
        let mut remaining = limit;

        while remaining > 0 {
            let mut buf = self.pool.get().await;
            let want = remaining.min(buf.len());
            buf.truncate(want);
            let n = read_full(&mut file, &mut buf[..]).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            remaining -= n;
            if n < want {
                break;
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Single MD5 over the whole file contents.
    pub async fn file_digest(&self, path: &Path) -> io::Result<String> {
        let mut file = File::open(path).await?;
        let mut hasher = Md5::new();

        loop {
            let mut buf = self.pool.get().await;
            let n = read_full(&mut file, &mut buf[..]).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if n < buf.len() {
                break;
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Read until `buf` is full or EOF, returning the number of bytes read.
async fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn hasher() -> ChunkHasher {
        // Tiny chunks keep the fixtures small while exercising the same
        // boundary logic as the 4 MiB production size.
        ChunkHasher::new(BufferPool::new(4, 4))
    }

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn empty_file_yields_one_digest() {
        let f = write_temp(b"");
        let blocks = hasher().block_list(f.path()).await.unwrap();
        assert_eq!(blocks, vec![EMPTY_MD5.to_string()]);
    }

    #[tokio::test]
    async fn exact_chunk_size_yields_one_digest() {
        let f = write_temp(b"abcd");
        let blocks = hasher().block_list(f.path()).await.unwrap();
        assert_eq!(blocks, vec![md5_hex(b"abcd")]);
    }

    #[tokio::test]
    async fn one_extra_byte_yields_two_digests() {
        let f = write_temp(b"abcde");
        let blocks = hasher().block_list(f.path()).await.unwrap();
        assert_eq!(blocks, vec![md5_hex(b"abcd"), md5_hex(b"e")]);
    }

    #[tokio::test]
    async fn file_digest_covers_the_whole_file() {
        let f = write_temp(b"abcdefgh01");
        let digest = hasher().file_digest(f.path()).await.unwrap();
        assert_eq!(digest, md5_hex(b"abcdefgh01"));
    }

    #[tokio::test]
    async fn prefix_digest_covers_only_the_head() {
        let f = write_temp(b"abcdefgh");
        let digest = hasher().prefix_digest(f.path(), 6).await.unwrap();
        assert_eq!(digest, md5_hex(b"abcdef"));

        // Shorter files hash whatever is there.
        let digest = hasher().prefix_digest(f.path(), 64).await.unwrap();
        assert_eq!(digest, md5_hex(b"abcdefgh"));
    }

    #[tokio::test]
    async fn digests_are_lowercase_hex() {
        let f = write_temp(b"NETDISK");
        let digest = hasher().file_digest(f.path()).await.unwrap();
        assert_eq!(digest, digest.to_lowercase());
        assert_eq!(digest.len(), 32);
    }
}
