//! The rate-limited, retrying, adaptively sized chunk fetcher.
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mediabridge_cache::{errors::Error as CacheError, BinaryCache};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::api::{MediaApi, UpstreamError};
use crate::location::Location;
use crate::Result;

/// Smallest effective block size adaptive sizing will shrink to.
pub const MIN_BLOCK_SIZE: u64 = 64 << 10;

/// Hard upstream cap on a single fetch.
pub const MAX_FETCH_LIMIT: u64 = 512 << 10;

/// Upstream calls allowed per second, process-wide.
const TOKENS_PER_SECOND: f64 = 30.0;

/// Consecutive timeouts before the effective block size is halved.
const TIMEOUTS_BEFORE_SHRINK: u32 = 3;

/// Consecutive successes at a reduced size before the preferred size is
/// restored.
const SUCCESSES_BEFORE_RESTORE: u32 = 5;

/// Fetch-layer tuning.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Logical chunk size. Must be `4096 * 2^k` and at most
    /// [`MAX_FETCH_LIMIT`].
    pub preferred_chunk_size: u64,
    /// Deadline applied to every upstream call.
    pub request_timeout: Duration,
    /// Attempts per block, counting the first.
    pub max_retries: u32,
    /// First retry delay; doubles per retry.
    pub retry_base_delay: Duration,
    /// Retry delay cap.
    pub retry_max_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            preferred_chunk_size: 256 << 10,
            request_timeout: Duration::from_secs(300),
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
        }
    }
}

/// Adaptive block sizing state.
///
/// Timeouts hint that the upstream struggles with the current block
/// size; after [`TIMEOUTS_BEFORE_SHRINK`] in a row the effective limit
/// is halved (never below [`MIN_BLOCK_SIZE`]). Once
/// [`SUCCESSES_BEFORE_RESTORE`] calls in a row succeed at a reduced
/// limit, the preferred size is restored. Halving keeps the limit a
/// power-of-two multiple of 4096, so alignment never degrades.
#[derive(Debug)]
struct AdaptiveState {
    effective_limit: u64,
    consecutive_timeouts: u32,
    consecutive_successes: u32,
}

impl AdaptiveState {
    fn new(preferred: u64) -> Self {
        Self {
            effective_limit: preferred,
            consecutive_timeouts: 0,
            consecutive_successes: 0,
        }
    }

    fn on_timeout(&mut self) {
        self.consecutive_successes = 0;
        self.consecutive_timeouts += 1;

        if self.consecutive_timeouts >= TIMEOUTS_BEFORE_SHRINK {
            self.consecutive_timeouts = 0;
            let halved = (self.effective_limit / 2).max(MIN_BLOCK_SIZE);

            if halved < self.effective_limit {
                warn!(limit = halved, "repeated timeouts; shrinking block size");
                self.effective_limit = halved;
            }
        }
    }

    fn on_error(&mut self) {
        self.consecutive_timeouts = 0;
        self.consecutive_successes = 0;
    }

    fn on_success(&mut self, preferred: u64) {
        self.consecutive_timeouts = 0;

        if self.effective_limit < preferred {
            self.consecutive_successes += 1;

            if self.consecutive_successes >= SUCCESSES_BEFORE_RESTORE {
                debug!(limit = preferred, "upstream recovered; restoring block size");
                self.effective_limit = preferred;
                self.consecutive_successes = 0;
            }
        }
    }
}

/// A token bucket refilling at [`TOKENS_PER_SECOND`], with a burst of
/// one second's worth of tokens.
#[derive(Debug)]
struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled: Instant,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: TOKENS_PER_SECOND,
                refilled: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;

                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * TOKENS_PER_SECOND).min(TOKENS_PER_SECOND);
                bucket.refilled = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }

                Duration::from_secs_f64((1.0 - bucket.tokens) / TOKENS_PER_SECOND)
            };

            tokio::time::sleep(wait).await;
        }
    }
}

/// Fetches logical chunks, serving from the cache when possible and
/// writing upstream responses through to it.
pub struct Fetcher {
    api: Arc<dyn MediaApi>,
    cache: Arc<BinaryCache>,
    config: FetchConfig,
    limiter: RateLimiter,
    adaptive: std::sync::Mutex<AdaptiveState>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("config", &self.config)
            .field("adaptive", &self.adaptive)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create a fetcher over an upstream API and a cache.
    #[must_use]
    pub fn new(api: Arc<dyn MediaApi>, cache: Arc<BinaryCache>, config: FetchConfig) -> Self {
        debug_assert!(config.preferred_chunk_size % 4096 == 0);
        debug_assert!((config.preferred_chunk_size / 4096).is_power_of_two());
        debug_assert!(config.preferred_chunk_size <= MAX_FETCH_LIMIT);

        let adaptive = std::sync::Mutex::new(AdaptiveState::new(config.preferred_chunk_size));

        Self {
            api,
            cache,
            config,
            limiter: RateLimiter::new(),
            adaptive,
        }
    }

    /// The logical chunk size.
    #[must_use]
    pub fn preferred_chunk_size(&self) -> u64 {
        self.config.preferred_chunk_size
    }

    /// The block size the next upstream call will use.
    ///
    /// # Panics
    ///
    /// If the adaptive state lock is poisoned.
    #[must_use]
    pub fn effective_limit(&self) -> u64 {
        self.adaptive.lock().unwrap().effective_limit
    }

    /// The cache this fetcher writes through to.
    #[must_use]
    pub fn cache(&self) -> &Arc<BinaryCache> {
        &self.cache
    }

    /// Get one logical chunk, cache-first.
    ///
    /// On a miss, the chunk is assembled from upstream calls and written
    /// to the cache. When the effective limit is below the preferred
    /// size the assembly takes several consecutive aligned calls; chunk
    /// indexing is unaffected. An empty result means `chunk_id` lies at
    /// or past the end of the object.
    ///
    /// # Errors
    ///
    /// Cache I/O errors, fatal upstream errors, and transient upstream
    /// errors that exhausted the retry budget.
    #[instrument(skip(self, location), fields(location_id = location.location_id()))]
    pub async fn fetch_chunk(&self, location: &Location, chunk_id: u64) -> Result<Bytes> {
        let location_id = location.location_id();

        #[allow(clippy::cast_possible_wrap)]
        match self.cache.read(location_id, chunk_id as i64).await {
            Ok(payload) => {
                trace!(chunk_id, "cache hit");
                return Ok(payload);
            }
            Err(CacheError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let preferred = self.config.preferred_chunk_size;
        let chunk_start = chunk_id * preferred;
        let limit = self.effective_limit();

        let mut assembled = BytesMut::new();

        // One call per `limit`-sized window of the chunk. Offsets stay
        // multiples of the limit (itself 4096 * 2^k), and the first call
        // of every chunk lands on a chunk boundary.
        while (assembled.len() as u64) < preferred {
            let offset = chunk_start + assembled.len() as u64;
            let block = self.call_with_retry(location, offset, limit).await?;
            let got = block.len() as u64;

            assembled.extend_from_slice(&block);

            if got < limit {
                // The object ends inside this window.
                break;
            }
        }

        let assembled = assembled.freeze();

        if !assembled.is_empty() {
            #[allow(clippy::cast_possible_wrap)]
            self.cache
                .write(location_id, chunk_id as i64, &assembled)
                .await?;
        }

        Ok(assembled)
    }

    async fn call_with_retry(
        &self,
        location: &Location,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes> {
        let mut attempts = 0;
        let mut delay = self.config.retry_base_delay;

        loop {
            self.limiter.acquire().await;

            let outcome =
                tokio::time::timeout(self.config.request_timeout, self.api.fetch(location, offset, limit))
                    .await;

            let error = match outcome {
                Ok(Ok(block)) => {
                    self.adaptive
                        .lock()
                        .unwrap()
                        .on_success(self.config.preferred_chunk_size);
                    return Ok(block);
                }
                Ok(Err(e)) => e,
                Err(_) => UpstreamError::Timeout,
            };

            match &error {
                UpstreamError::FloodWait(seconds) => {
                    // Mandated by the upstream; doesn't count as a retry.
                    warn!(seconds, "flood wait");
                    tokio::time::sleep(Duration::from_secs(*seconds)).await;
                    continue;
                }
                UpstreamError::Timeout => self.adaptive.lock().unwrap().on_timeout(),
                UpstreamError::Transient(_) => self.adaptive.lock().unwrap().on_error(),
                UpstreamError::Fatal(_) => {
                    warn!(%error, offset, limit, "fatal upstream error");
                    return Err(error.into());
                }
            }

            attempts += 1;
            if attempts >= self.config.max_retries {
                warn!(%error, attempts, "retry budget exhausted");
                return Err(error.into());
            }

            debug!(%error, ?delay, "retrying upstream call");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.retry_max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdaptiveState, MIN_BLOCK_SIZE};

    const PREFERRED: u64 = 256 << 10;

    #[test]
    fn three_consecutive_timeouts_halve_the_limit() {
        let mut state = AdaptiveState::new(PREFERRED);

        state.on_timeout();
        state.on_timeout();
        assert_eq!(state.effective_limit, PREFERRED);

        state.on_timeout();
        assert_eq!(state.effective_limit, PREFERRED / 2);
    }

    #[test]
    fn success_interrupts_a_timeout_streak() {
        let mut state = AdaptiveState::new(PREFERRED);

        state.on_timeout();
        state.on_timeout();
        state.on_success(PREFERRED);
        state.on_timeout();
        state.on_timeout();

        assert_eq!(state.effective_limit, PREFERRED);
    }

    #[test]
    fn limit_never_shrinks_below_the_floor() {
        let mut state = AdaptiveState::new(PREFERRED);

        for _ in 0..30 {
            state.on_timeout();
        }

        assert_eq!(state.effective_limit, MIN_BLOCK_SIZE);
    }

    #[test]
    fn five_successes_restore_the_preferred_limit() {
        let mut state = AdaptiveState::new(PREFERRED);

        for _ in 0..3 {
            state.on_timeout();
        }
        assert_eq!(state.effective_limit, PREFERRED / 2);

        for _ in 0..4 {
            state.on_success(PREFERRED);
        }
        assert_eq!(state.effective_limit, PREFERRED / 2);

        state.on_success(PREFERRED);
        assert_eq!(state.effective_limit, PREFERRED);
    }

    #[test]
    fn successes_at_full_size_do_not_accumulate() {
        let mut state = AdaptiveState::new(PREFERRED);

        for _ in 0..10 {
            state.on_success(PREFERRED);
        }

        assert_eq!(state.effective_limit, PREFERRED);
        assert_eq!(state.consecutive_successes, 0);
    }
}
