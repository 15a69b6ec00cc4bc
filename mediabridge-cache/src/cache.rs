//! The composed binary cache.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::errors::Error;
use crate::index::{MetadataIndex, SlotDescriptor};
use crate::persist;
use crate::store::BlockStore;
use crate::{Config, Result, DATA_FILE, METADATA_FILE};

/// Mutable cache state, guarded by one lock.
///
/// The store's free list, the index, the LRU and the byte accounting are
/// only ever mutated together, so observers always see a consistent
/// snapshot.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) store: BlockStore,
    pub(crate) index: MetadataIndex,
    pub(crate) cached_bytes: u64,
}

/// A disk-backed chunk cache with LRU eviction and persistent metadata.
///
/// Payloads are stored in fixed-size slots of a single data file; a chunk
/// larger than one slot is split across several. Capacity is enforced by
/// evicting the least recently used chunks before a write lands. The
/// index survives restarts: it is written to [`METADATA_FILE`] by a
/// debounced background task after every mutation and once more,
/// synchronously, on [`close`](BinaryCache::close).
#[derive(Debug)]
pub struct BinaryCache {
    inner: Arc<Mutex<Inner>>,
    meta: Arc<Mutex<File>>,
    save_tx: mpsc::Sender<()>,
    shutdown: Arc<Notify>,
    saver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    max_cache_bytes: u64,
    slot_size: u64,
}

impl BinaryCache {
    /// Open a cache, restoring the persisted index.
    ///
    /// An empty or missing metadata file yields an empty cache, as does
    /// one whose leading record count cannot be read. Slot-aligned
    /// regions of the data file that no restored chunk references become
    /// free slots.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a slot size that isn't a nonzero
    ///   power of two
    /// - [`Error::CorruptMetadata`] if the metadata file is truncated
    ///   mid-record
    /// - I/O errors opening or reading either file
    #[instrument(skip(config), fields(directory = %config.directory.display()))]
    pub async fn open(config: Config) -> Result<Self> {
        if config.slot_size == 0 || !config.slot_size.is_power_of_two() {
            return Err(Error::InvalidArgument("slot size must be a power of two"));
        }

        tokio::fs::create_dir_all(&config.directory).await?;

        let mut store = BlockStore::open(&config.directory.join(DATA_FILE), config.slot_size).await?;

        let mut meta = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(config.directory.join(METADATA_FILE))
            .await?;

        let mut raw = Vec::new();
        meta.read_to_end(&mut raw).await?;

        let chunks = persist::decode(&raw)?;
        if chunks.is_empty() && !raw.is_empty() {
            warn!("metadata unreadable; starting with an empty cache");
        }

        let mut index = MetadataIndex::default();
        let mut slots = 0_u64;

        for (location_id, chunk_id, parts) in chunks {
            slots += parts.len() as u64;

            for part in &parts {
                index.observe_timestamp(part.timestamp);
            }

            index.insert(location_id, chunk_id, parts);
        }

        // Anything in the data file that the restored index doesn't claim
        // is a leftover from an unsaved overwrite or eviction; reuse it.
        let live: std::collections::HashSet<u64> = index.live_offsets().collect();
        let len = store.len().await?;
        let mut offset = 0;
        while offset + config.slot_size <= len {
            if !live.contains(&offset) {
                store.free(offset);
            }
            offset += config.slot_size;
        }

        debug!(
            chunks = index.chunk_count(),
            free_slots = store.free_slots(),
            "cache opened"
        );

        let inner = Arc::new(Mutex::new(Inner {
            store,
            index,
            cached_bytes: slots * config.slot_size,
        }));
        let meta = Arc::new(Mutex::new(meta));
        let shutdown = Arc::new(Notify::new());

        let (save_tx, save_rx) = mpsc::channel(1);
        let saver = persist::spawn_saver(inner.clone(), meta.clone(), save_rx, shutdown.clone());

        Ok(Self {
            inner,
            meta,
            save_tx,
            shutdown,
            saver: Mutex::new(Some(saver)),
            closed: AtomicBool::new(false),
            max_cache_bytes: config.max_cache_bytes,
            slot_size: config.slot_size,
        })
    }

    /// Read a chunk's payload and mark it as the most recently used.
    ///
    /// The fresh LRU timestamp is written into the stored slot
    /// descriptors and a save is requested, so the touched order reaches
    /// disk even on a read-only workload.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the chunk isn't cached
    /// - [`Error::Closed`] after [`close`](BinaryCache::close)
    /// - I/O errors reading the data file
    #[instrument(skip(self))]
    pub async fn read(&self, location_id: i64, chunk_id: i64) -> Result<Bytes> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let mut inner = self.inner.lock().await;

        let parts = inner
            .index
            .get(location_id, chunk_id)
            .ok_or(Error::NotFound)?
            .clone();

        #[allow(clippy::cast_possible_truncation)]
        let mut payload =
            BytesMut::with_capacity(parts.iter().map(|p| p.payload_len).sum::<u64>() as usize);

        for part in &parts {
            let bytes = inner.store.read_at(part.file_offset, part.payload_len).await?;
            payload.extend_from_slice(&bytes);
        }

        let ts = inner.index.next_timestamp();
        inner.index.touch(location_id, chunk_id, ts);
        drop(inner);

        self.request_save();

        Ok(payload.freeze())
    }

    /// Write a chunk, overwriting any previous payload under the same
    /// key and evicting old chunks first if the cache is at capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for an empty payload
    /// - [`Error::Closed`] after [`close`](BinaryCache::close)
    /// - I/O errors writing the data file
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub async fn write(&self, location_id: i64, chunk_id: i64, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload must not be empty"));
        }

        let mut inner = self.inner.lock().await;

        if let Some(parts) = inner.index.remove(location_id, chunk_id) {
            for part in &parts {
                inner.store.free(part.file_offset);
            }
            inner.cached_bytes -= parts.len() as u64 * self.slot_size;
        }

        while inner.cached_bytes >= self.max_cache_bytes {
            let Some((evicted_location, evicted_chunk, parts)) = inner.index.pop_lru() else {
                break;
            };

            debug!(
                location_id = evicted_location,
                chunk_id = evicted_chunk,
                parts = parts.len(),
                "evicting chunk"
            );

            for part in &parts {
                inner.store.free(part.file_offset);
            }
            inner.cached_bytes -= parts.len() as u64 * self.slot_size;
        }

        let ts = inner.index.next_timestamp();
        let mut parts = Vec::new();

        #[allow(clippy::cast_possible_truncation)]
        for (part_index, piece) in payload.chunks(self.slot_size as usize).enumerate() {
            let file_offset = inner.store.allocate().await?;
            inner.store.write_at(file_offset, piece).await?;

            parts.push(SlotDescriptor {
                location_id,
                part_index: part_index as i64,
                file_offset,
                payload_len: piece.len() as u64,
                timestamp: ts,
            });
        }

        inner.cached_bytes += parts.len() as u64 * self.slot_size;
        inner.index.insert(location_id, chunk_id, parts);
        drop(inner);

        self.request_save();

        Ok(())
    }

    /// Stop the background saver, write the index out one final time and
    /// sync the data file. Further reads and writes fail with
    /// [`Error::Closed`]; closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// I/O errors from the final flush.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // notify_one stores a permit, so the worker sees the shutdown
        // even if it is mid-save rather than parked on the mailbox.
        self.shutdown.notify_one();
        if let Some(saver) = self.saver.lock().await.take() {
            let _ = saver.await;
        }

        persist::save(&self.inner, &self.meta).await?;
        self.inner.lock().await.store.sync().await?;

        debug!("cache closed");

        Ok(())
    }

    /// Bytes currently occupied by live slots, padding included.
    pub async fn cached_bytes(&self) -> u64 {
        self.inner.lock().await.cached_bytes
    }

    /// Number of cached logical chunks.
    pub async fn chunk_count(&self) -> usize {
        self.inner.lock().await.index.chunk_count()
    }

    /// Number of freed slots awaiting reuse.
    pub async fn free_slots(&self) -> usize {
        self.inner.lock().await.store.free_slots()
    }

    fn request_save(&self) {
        // A full mailbox means a save is already pending; this mutation
        // rides along with it.
        let _ = self.save_tx.try_send(());
    }
}
