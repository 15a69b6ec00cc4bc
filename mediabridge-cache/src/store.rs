//! Fixed-size slot storage inside a single data file.
use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

use crate::Result;

/// Allocates, reads and writes fixed-size slots in one data file.
///
/// Offsets handed out by [`BlockStore::allocate`] are always multiples of
/// the slot size. Freed slots are kept on a stack and reused before the
/// file is grown. Every operation seeks explicitly; the file cursor is
/// never trusted between calls.
#[derive(Debug)]
pub(crate) struct BlockStore {
    file: File,
    slot_size: u64,
    free: Vec<u64>,
}

impl BlockStore {
    pub(crate) async fn open(path: &Path, slot_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;

        Ok(Self {
            file,
            slot_size,
            free: Vec::new(),
        })
    }

    pub(crate) fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Current length of the data file.
    pub(crate) async fn len(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0)).await?)
    }

    /// Reserve a slot, reusing a freed one if possible.
    pub(crate) async fn allocate(&mut self) -> Result<u64> {
        match self.free.pop() {
            Some(offset) => {
                trace!(offset, "reusing free slot");
                Ok(offset)
            }
            None => {
                let offset = self.file.seek(SeekFrom::End(0)).await?;
                trace!(offset, "appending slot");
                Ok(offset)
            }
        }
    }

    /// Write `payload` at `offset`, zero-padded to a full slot.
    pub(crate) async fn write_at(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() as u64 <= self.slot_size);
        debug_assert_eq!(offset % self.slot_size, 0);

        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0; self.slot_size as usize];
        buf[..payload.len()].copy_from_slice(payload);

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(&buf).await?;
        self.file.flush().await?;

        Ok(())
    }

    /// Read the slot at `offset` and return its first `payload_len` bytes.
    pub(crate) async fn read_at(&mut self, offset: u64, payload_len: u64) -> Result<Bytes> {
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0; self.slot_size as usize];

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;

        #[allow(clippy::cast_possible_truncation)]
        buf.truncate(payload_len as usize);

        Ok(buf.into())
    }

    /// Mark the slot at `offset` as reusable. Its bytes become garbage.
    pub(crate) fn free(&mut self, offset: u64) {
        debug_assert_eq!(offset % self.slot_size, 0);
        self.free.push(offset);
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub(crate) async fn sync(&mut self) -> Result<()> {
        self.file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::BlockStore;

    async fn store(slot_size: u64) -> (tempfile::TempDir, BlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("cache.dat"), slot_size)
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn allocate_grows_file_by_slots() {
        let (_dir, mut store) = store(64).await;

        assert_eq!(store.allocate().await.unwrap(), 0);
        store.write_at(0, b"hello").await.unwrap();

        assert_eq!(store.allocate().await.unwrap(), 64);
        store.write_at(64, b"world").await.unwrap();

        assert_eq!(store.len().await.unwrap(), 128);
    }

    #[tokio::test]
    async fn write_pads_and_read_truncates() {
        let (_dir, mut store) = store(64).await;

        let offset = store.allocate().await.unwrap();
        store.write_at(offset, b"hello").await.unwrap();

        assert_eq!(&store.read_at(offset, 5).await.unwrap()[..], b"hello");

        // The slot itself is a full 64 bytes of payload + zeros.
        let slot = store.read_at(offset, 64).await.unwrap();
        assert_eq!(&slot[..5], b"hello");
        assert!(slot[5..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn freed_slots_are_reused_before_growing() {
        let (_dir, mut store) = store(64).await;

        let a = store.allocate().await.unwrap();
        store.write_at(a, b"a").await.unwrap();
        let b = store.allocate().await.unwrap();
        store.write_at(b, b"b").await.unwrap();

        store.free(a);
        assert_eq!(store.free_slots(), 1);

        assert_eq!(store.allocate().await.unwrap(), a);
        assert_eq!(store.free_slots(), 0);

        // Free list exhausted; next slot comes off the end of the file.
        assert_eq!(store.allocate().await.unwrap(), 128);
    }
}
