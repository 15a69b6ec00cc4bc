//! Byte-accurate range streaming over aligned chunks.
use std::sync::Arc;

use bytes::Bytes;
use futures::{stream, Stream};
use tracing::trace;

use crate::errors::Error;
use crate::fetch::Fetcher;
use crate::location::Location;

#[derive(Debug)]
struct ReadState {
    fetcher: Arc<Fetcher>,
    location: Location,
    chunk_id: u64,
    /// Bytes to drop from the front of the first chunk.
    skip: u64,
    /// Bytes still owed to the caller.
    remaining: u64,
}

/// Open a lazy byte stream over `location`, yielding exactly the bytes
/// `start..=end` of the object.
///
/// Chunks are requested aligned (cache first, upstream on a miss); the
/// head of the first chunk and the tail of the last are trimmed here, so
/// alignment never leaks to the caller. The stream is finite and not
/// restartable; dropping it cancels any in-flight upstream call.
///
/// The caller must have validated `start <= end < total_size`.
///
/// # Errors
///
/// The stream yields an item per chunk; a failed chunk fetch surfaces as
/// that item's error, and [`Error::UnexpectedEof`] means the upstream
/// object turned out shorter than `total_size` promised.
pub fn stream_range(
    fetcher: Arc<Fetcher>,
    location: Location,
    start: u64,
    end: u64,
    total_size: u64,
) -> impl Stream<Item = crate::Result<Bytes>> {
    debug_assert!(start <= end && end < total_size);

    let preferred = fetcher.preferred_chunk_size();

    let state = ReadState {
        fetcher,
        location,
        chunk_id: start / preferred,
        skip: start % preferred,
        remaining: end - start + 1,
    };

    stream::try_unfold(state, |mut state| async move {
        if state.remaining == 0 {
            return Ok(None);
        }

        let chunk = state
            .fetcher
            .fetch_chunk(&state.location, state.chunk_id)
            .await?;
        state.chunk_id += 1;

        if chunk.len() as u64 <= state.skip {
            // Either an empty chunk, or one that ends before the
            // requested start; the object is shorter than promised.
            return Err(Error::UnexpectedEof);
        }

        #[allow(clippy::cast_possible_truncation)]
        let mut piece = chunk.slice(state.skip as usize..);
        state.skip = 0;

        if state.remaining < piece.len() as u64 {
            #[allow(clippy::cast_possible_truncation)]
            piece.truncate(state.remaining as usize);
        }

        state.remaining -= piece.len() as u64;

        trace!(
            yielded = piece.len(),
            remaining = state.remaining,
            "stream advanced"
        );

        Ok(Some((piece, state)))
    })
}
