//! Index serialization and the debounced background saver.
//!
//! The on-disk layout is a flat sequence of little-endian `i64`s:
//!
//! ```text
//! chunk count
//! repeated per chunk:
//!     location id, chunk id, part count
//!     repeated per part:
//!         location id, part index, file offset, payload len, timestamp
//! ```
//!
//! The per-part location id repeats the chunk's; it is written and read
//! back anyway to keep the record self-contained. Chunks are serialized
//! sorted by `(location id, chunk id)` so identical caches produce
//! identical files.
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
use std::io::{Cursor, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::cache::Inner;
use crate::errors::Error;
use crate::index::SlotDescriptor;
use crate::Result;

/// How long a save request sits in the mailbox before the index is
/// written out. Requests arriving in the window are coalesced.
pub(crate) const DEBOUNCE: Duration = Duration::from_secs(2);

type Chunks = Vec<(i64, i64, Vec<SlotDescriptor>)>;

pub(crate) fn encode(chunks: &[(i64, i64, &Vec<SlotDescriptor>)]) -> Vec<u8> {
    let mut buf = Vec::new();

    WriteBytesExt::write_i64::<LittleEndian>(&mut buf, chunks.len() as i64).unwrap();

    for &(location_id, chunk_id, parts) in chunks {
        WriteBytesExt::write_i64::<LittleEndian>(&mut buf, location_id).unwrap();
        WriteBytesExt::write_i64::<LittleEndian>(&mut buf, chunk_id).unwrap();
        WriteBytesExt::write_i64::<LittleEndian>(&mut buf, parts.len() as i64).unwrap();

        for part in parts {
            WriteBytesExt::write_i64::<LittleEndian>(&mut buf, part.location_id).unwrap();
            WriteBytesExt::write_i64::<LittleEndian>(&mut buf, part.part_index).unwrap();
            WriteBytesExt::write_i64::<LittleEndian>(&mut buf, part.file_offset as i64).unwrap();
            WriteBytesExt::write_i64::<LittleEndian>(&mut buf, part.payload_len as i64).unwrap();
            WriteBytesExt::write_i64::<LittleEndian>(&mut buf, part.timestamp as i64).unwrap();
        }
    }

    buf
}

/// Decode a metadata file.
///
/// An empty file, or one too short to contain the leading chunk count,
/// decodes to an empty index (recovery by reset). A file that ends in the
/// middle of a record is corrupt and must not be silently tolerated.
///
/// # Errors
///
/// [`Error::CorruptMetadata`] on a short read past the leading count.
pub(crate) fn decode(bytes: &[u8]) -> Result<Chunks> {
    let mut cursor = Cursor::new(bytes);

    let Ok(count) = cursor.read_i64::<LittleEndian>() else {
        return Ok(Vec::new());
    };

    let mut chunks = Vec::new();

    for _ in 0..count {
        let location_id = read_field(&mut cursor)?;
        let chunk_id = read_field(&mut cursor)?;
        let part_count = read_field(&mut cursor)?;

        let mut parts = Vec::new();

        for _ in 0..part_count {
            parts.push(SlotDescriptor {
                location_id: read_field(&mut cursor)?,
                part_index: read_field(&mut cursor)?,
                file_offset: read_field(&mut cursor)? as u64,
                payload_len: read_field(&mut cursor)? as u64,
                timestamp: read_field(&mut cursor)? as u64,
            });
        }

        chunks.push((location_id, chunk_id, parts));
    }

    Ok(chunks)
}

fn read_field(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    cursor
        .read_i64::<LittleEndian>()
        .map_err(|_| Error::CorruptMetadata("file ends mid-record"))
}

/// Serialize the index under the cache lock and rewrite the metadata file
/// under the file lock.
pub(crate) async fn save(inner: &Mutex<Inner>, meta: &Mutex<File>) -> Result<()> {
    let buf = {
        let inner = inner.lock().await;
        encode(&inner.index.iter_sorted())
    };

    let mut file = meta.lock().await;
    file.set_len(0).await?;
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&buf).await?;
    file.sync_all().await?;

    trace!(bytes = buf.len(), "metadata saved");

    Ok(())
}

/// Spawn the background saver.
///
/// The mailbox has capacity 1; [`BinaryCache`](crate::BinaryCache)
/// requests a save with `try_send`, so requests landing while one is
/// already pending coalesce. After picking a request up the worker waits
/// out [`DEBOUNCE`], drains anything that arrived meanwhile and writes
/// the index once. `shutdown` stops the worker without a write; the
/// final save belongs to `close`.
pub(crate) fn spawn_saver(
    inner: Arc<Mutex<Inner>>,
    meta: Arc<Mutex<File>>,
    mut rx: mpsc::Receiver<()>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.notified() => break,
                req = rx.recv() => {
                    if req.is_none() {
                        break;
                    }

                    tokio::select! {
                        () = shutdown.notified() => break,
                        () = tokio::time::sleep(DEBOUNCE) => {}
                    }

                    while rx.try_recv().is_ok() {}

                    if let Err(e) = save(&inner, &meta).await {
                        error!("metadata save failed: {e}");
                    }
                }
            }
        }

        debug!("saver stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::{decode, encode};
    use crate::errors::Error;
    use crate::index::SlotDescriptor;

    fn descriptor(location_id: i64, part_index: i64, file_offset: u64) -> SlotDescriptor {
        SlotDescriptor {
            location_id,
            part_index,
            file_offset,
            payload_len: 100,
            timestamp: 7,
        }
    }

    #[test]
    fn roundtrip_preserves_chunks_and_order() {
        let one = vec![descriptor(1, 0, 0)];
        let two = vec![descriptor(2, 0, 256), descriptor(2, 1, 512)];
        let chunks = vec![(1_i64, 5_i64, &one), (2, 3, &two)];

        let decoded = decode(&encode(&chunks)).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], (1, 5, one));
        assert_eq!(decoded[1], (2, 3, two));
    }

    #[test]
    fn empty_file_decodes_to_empty_index() {
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn unreadable_leading_count_resets() {
        // Fewer than 8 bytes: the count itself cannot be read.
        assert!(decode(&[1, 2, 3]).unwrap().is_empty());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let parts = vec![descriptor(1, 0, 0)];
        let encoded = encode(&[(1, 1, &parts)]);

        let err = decode(&encoded[..encoded.len() - 4]).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata(_)));
    }
}
