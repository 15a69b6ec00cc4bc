//! In-memory chunk index and LRU bookkeeping.
use std::collections::{BTreeSet, HashMap};

/// One physical slot holding a part of a logical chunk.
///
/// `file_offset` is a multiple of the slot size and `payload_len` never
/// exceeds it; the remainder of the slot is zero padding. All parts of a
/// logical chunk share one `timestamp`, which doubles as the chunk's LRU
/// priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    /// Location id of the media object this slot belongs to.
    pub location_id: i64,
    /// Position of this part within its logical chunk, starting at 0.
    pub part_index: i64,
    /// Byte offset of the slot in the data file.
    pub file_offset: u64,
    /// Number of payload bytes at the start of the slot.
    pub payload_len: u64,
    /// LRU priority, shared by all parts of the chunk.
    pub timestamp: u64,
}

/// Maps `(location id, chunk id)` to the ordered slots of a logical chunk
/// and keeps the chunks ordered by recency.
///
/// The LRU is an ordered set keyed by `(timestamp, location_id, chunk_id)`
/// with the smallest key first, so eviction pops the oldest chunk and ties
/// break deterministically. The timestamp needed to remove an entry is
/// read from the stored descriptors.
#[derive(Debug, Default)]
pub(crate) struct MetadataIndex {
    chunks: HashMap<i64, HashMap<i64, Vec<SlotDescriptor>>>,
    lru: BTreeSet<(u64, i64, i64)>,
    next_timestamp: u64,
}

impl MetadataIndex {
    /// Hand out the next LRU timestamp.
    pub(crate) fn next_timestamp(&mut self) -> u64 {
        let ts = self.next_timestamp;
        self.next_timestamp += 1;
        ts
    }

    /// Bump the timestamp counter past `ts`, for restoring persisted state.
    pub(crate) fn observe_timestamp(&mut self, ts: u64) {
        self.next_timestamp = self.next_timestamp.max(ts + 1);
    }

    pub(crate) fn get(&self, location_id: i64, chunk_id: i64) -> Option<&Vec<SlotDescriptor>> {
        self.chunks.get(&location_id)?.get(&chunk_id)
    }

    /// Insert a logical chunk. The caller must have removed any previous
    /// chunk under the same key.
    pub(crate) fn insert(&mut self, location_id: i64, chunk_id: i64, parts: Vec<SlotDescriptor>) {
        debug_assert!(!parts.is_empty());

        let ts = parts[0].timestamp;
        debug_assert!(parts.iter().all(|p| p.timestamp == ts));

        self.lru.insert((ts, location_id, chunk_id));
        self.chunks
            .entry(location_id)
            .or_default()
            .insert(chunk_id, parts);
    }

    /// Remove a logical chunk and return its slots.
    pub(crate) fn remove(&mut self, location_id: i64, chunk_id: i64) -> Option<Vec<SlotDescriptor>> {
        let per_location = self.chunks.get_mut(&location_id)?;
        let parts = per_location.remove(&chunk_id)?;

        if per_location.is_empty() {
            self.chunks.remove(&location_id);
        }

        self.lru.remove(&(parts[0].timestamp, location_id, chunk_id));

        Some(parts)
    }

    /// Move a chunk to the young end of the LRU and stamp its slots with
    /// `ts`, so a later save persists the new order.
    pub(crate) fn touch(&mut self, location_id: i64, chunk_id: i64, ts: u64) {
        let Some(parts) = self
            .chunks
            .get_mut(&location_id)
            .and_then(|per_location| per_location.get_mut(&chunk_id))
        else {
            return;
        };

        self.lru.remove(&(parts[0].timestamp, location_id, chunk_id));
        self.lru.insert((ts, location_id, chunk_id));

        for part in parts {
            part.timestamp = ts;
        }
    }

    /// Remove and return the least recently used chunk.
    pub(crate) fn pop_lru(&mut self) -> Option<(i64, i64, Vec<SlotDescriptor>)> {
        let (_, location_id, chunk_id) = self.lru.pop_first()?;

        let per_location = self.chunks.get_mut(&location_id)?;
        let parts = per_location.remove(&chunk_id)?;

        if per_location.is_empty() {
            self.chunks.remove(&location_id);
        }

        Some((location_id, chunk_id, parts))
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.lru.len()
    }

    /// All chunks sorted by `(location id, chunk id)`, for serialization.
    pub(crate) fn iter_sorted(&self) -> Vec<(i64, i64, &Vec<SlotDescriptor>)> {
        let mut entries: Vec<_> = self
            .chunks
            .iter()
            .flat_map(|(&location_id, per_location)| {
                per_location
                    .iter()
                    .map(move |(&chunk_id, parts)| (location_id, chunk_id, parts))
            })
            .collect();

        entries.sort_by_key(|&(location_id, chunk_id, _)| (location_id, chunk_id));
        entries
    }

    /// Offsets of every live slot.
    pub(crate) fn live_offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.chunks
            .values()
            .flat_map(HashMap::values)
            .flatten()
            .map(|part| part.file_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::{MetadataIndex, SlotDescriptor};

    fn parts(location_id: i64, offsets: &[u64], ts: u64) -> Vec<SlotDescriptor> {
        offsets
            .iter()
            .enumerate()
            .map(|(i, &file_offset)| SlotDescriptor {
                location_id,
                part_index: i as i64,
                file_offset,
                payload_len: 256,
                timestamp: ts,
            })
            .collect()
    }

    #[test]
    fn pop_lru_returns_oldest_first() {
        let mut index = MetadataIndex::default();

        let ts = index.next_timestamp();
        index.insert(1, 1, parts(1, &[0], ts));
        let ts = index.next_timestamp();
        index.insert(1, 2, parts(1, &[256], ts));
        let ts = index.next_timestamp();
        index.insert(2, 1, parts(2, &[512], ts));

        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((1, 1)));
        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((1, 2)));
        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((2, 1)));
        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), None);
        assert_eq!(index.chunk_count(), 0);
    }

    #[test]
    fn touch_makes_chunk_youngest_and_restamps_slots() {
        let mut index = MetadataIndex::default();

        let ts = index.next_timestamp();
        index.insert(1, 1, parts(1, &[0, 256], ts));
        let ts = index.next_timestamp();
        index.insert(1, 2, parts(1, &[512], ts));

        let ts = index.next_timestamp();
        index.touch(1, 1, ts);

        assert!(index.get(1, 1).unwrap().iter().all(|p| p.timestamp == ts));
        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((1, 2)));
        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((1, 1)));
    }

    #[test]
    fn equal_timestamps_break_ties_by_key() {
        let mut index = MetadataIndex::default();

        index.insert(2, 7, parts(2, &[0], 0));
        index.insert(1, 9, parts(1, &[256], 0));
        index.insert(1, 3, parts(1, &[512], 0));

        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((1, 3)));
        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((1, 9)));
        assert_eq!(index.pop_lru().map(|(l, c, _)| (l, c)), Some((2, 7)));
    }

    #[test]
    fn observe_timestamp_seeds_counter_past_loaded_state() {
        let mut index = MetadataIndex::default();

        index.observe_timestamp(41);
        assert_eq!(index.next_timestamp(), 42);
    }
}
