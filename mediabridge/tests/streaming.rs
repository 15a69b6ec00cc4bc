use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use mediabridge::{
    errors::Error, stream_range, FetchConfig, Fetcher, Location, MediaApi, UpstreamError,
};
use mediabridge_cache::{BinaryCache, Config};
use tokio::time::Instant;

const KIB: u64 = 1024;

/// What the next scripted call should do; after the script runs out,
/// every call succeeds.
enum Behavior {
    Ok,
    Reset,
    Timeout,
    FloodWait(u64),
    Fatal,
    Hang,
}

struct MockApi {
    object: Vec<u8>,
    calls: Mutex<Vec<(u64, u64)>>,
    script: Mutex<VecDeque<Behavior>>,
}

impl MockApi {
    fn new(object: Vec<u8>) -> Self {
        Self {
            object,
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        }
    }

    fn scripted(object: Vec<u8>, script: Vec<Behavior>) -> Self {
        let api = Self::new(object);
        *api.script.lock().unwrap() = script.into();
        api
    }

    fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaApi for MockApi {
    async fn fetch(
        &self,
        _location: &Location,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, UpstreamError> {
        self.calls.lock().unwrap().push((offset, limit));

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Ok);

        match behavior {
            Behavior::Ok => {
                let start = (offset as usize).min(self.object.len());
                let end = ((offset + limit) as usize).min(self.object.len());
                Ok(Bytes::copy_from_slice(&self.object[start..end]))
            }
            Behavior::Reset => Err(UpstreamError::Transient("connection reset by peer".into())),
            Behavior::Timeout => Err(UpstreamError::Timeout),
            Behavior::FloodWait(seconds) => Err(UpstreamError::FloodWait(seconds)),
            Behavior::Fatal => Err(UpstreamError::Fatal("FILE_REFERENCE_EXPIRED".into())),
            Behavior::Hang => futures::future::pending().await,
        }
    }
}

fn object(len: usize) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation)]
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn location(id: i64) -> Location {
    Location::Document {
        id,
        access_hash: 0,
        file_reference: vec![0xfe],
    }
}

async fn fetcher_with(api: MockApi, config: FetchConfig) -> (Arc<Fetcher>, Arc<MockApi>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(BinaryCache::open(Config::new(dir.path())).await.unwrap());
    let api = Arc::new(api);
    let fetcher = Arc::new(Fetcher::new(api.clone(), cache, config));
    (fetcher, api, dir)
}

fn small_chunks() -> FetchConfig {
    FetchConfig {
        preferred_chunk_size: 4096,
        ..FetchConfig::default()
    }
}

async fn collect(
    fetcher: &Arc<Fetcher>,
    loc: &Location,
    start: u64,
    end: u64,
    total: u64,
) -> Vec<u8> {
    let pieces: Vec<Bytes> = stream_range(fetcher.clone(), loc.clone(), start, end, total)
        .try_collect()
        .await
        .unwrap();

    pieces.concat()
}

#[tokio::test(start_paused = true)]
async fn range_matches_object_slice() {
    let data = object(3 * 4096);
    let (fetcher, _api, _dir) = fetcher_with(MockApi::new(data.clone()), small_chunks()).await;
    let loc = location(1);
    let total = data.len() as u64;

    for (start, end) in [
        (100, 600),
        (0, total - 1),
        (4095, 4096),
        (0, 0),
        (total - 1, total - 1),
        (4096, 2 * 4096 - 1),
        (12_000, total - 1),
    ] {
        let got = collect(&fetcher, &loc, start, end, total).await;
        assert_eq!(
            got,
            &data[start as usize..=end as usize],
            "range {start}-{end}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn range_spanning_many_chunks_with_default_chunk_size() {
    let data = object(3 * 256 * KIB as usize);
    let (fetcher, _api, _dir) =
        fetcher_with(MockApi::new(data.clone()), FetchConfig::default()).await;
    let loc = location(2);

    let got = collect(&fetcher, &loc, 100, 600, data.len() as u64).await;
    assert_eq!(got.len(), 501);
    assert_eq!(got, &data[100..=600]);
}

#[tokio::test(start_paused = true)]
async fn second_read_is_served_from_cache() {
    let data = object(2 * 4096);
    let (fetcher, api, _dir) = fetcher_with(MockApi::new(data.clone()), small_chunks()).await;
    let loc = location(3);
    let total = data.len() as u64;

    collect(&fetcher, &loc, 0, total - 1, total).await;
    let upstream_calls = api.calls().len();
    assert_eq!(upstream_calls, 2);

    let got = collect(&fetcher, &loc, 0, total - 1, total).await;
    assert_eq!(got, data);
    assert_eq!(api.calls().len(), upstream_calls, "cache was bypassed");
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried_with_backoff() {
    let data = object(4096);
    let api = MockApi::scripted(data.clone(), vec![Behavior::Reset, Behavior::Reset]);
    let (fetcher, api, _dir) = fetcher_with(api, small_chunks()).await;
    let loc = location(4);

    let before = Instant::now();
    let got = collect(&fetcher, &loc, 0, 4095, 4096).await;

    assert_eq!(got, data);
    assert_eq!(api.calls().len(), 3);
    // Backoff slept 1 s then 2 s.
    assert!(before.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_finite() {
    let api = MockApi::scripted(
        object(4096),
        (0..5).map(|_| Behavior::Reset).collect(),
    );
    let (fetcher, api, _dir) = fetcher_with(api, small_chunks()).await;

    let err = fetcher.fetch_chunk(&location(5), 0).await.unwrap_err();

    assert!(matches!(err, Error::Upstream(UpstreamError::Transient(_))));
    assert_eq!(api.calls().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn fatal_errors_are_not_retried() {
    let api = MockApi::scripted(object(4096), vec![Behavior::Fatal]);
    let (fetcher, api, _dir) = fetcher_with(api, small_chunks()).await;

    let err = fetcher.fetch_chunk(&location(6), 0).await.unwrap_err();

    assert!(matches!(err, Error::Upstream(UpstreamError::Fatal(_))));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn flood_wait_sleeps_without_spending_retries() {
    let data = object(4096);
    let api = MockApi::scripted(data.clone(), vec![Behavior::FloodWait(7)]);
    let config = FetchConfig {
        max_retries: 1,
        ..small_chunks()
    };
    let (fetcher, api, _dir) = fetcher_with(api, config).await;

    let before = Instant::now();
    let got = fetcher.fetch_chunk(&location(7), 0).await.unwrap();

    assert_eq!(&got[..], &data[..]);
    assert_eq!(api.calls().len(), 2);
    assert!(before.elapsed() >= Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn hung_call_hits_the_deadline_and_is_retried() {
    let data = object(4096);
    let api = MockApi::scripted(data.clone(), vec![Behavior::Hang]);
    let config = FetchConfig {
        request_timeout: Duration::from_secs(5),
        ..small_chunks()
    };
    let (fetcher, api, _dir) = fetcher_with(api, config).await;

    let before = Instant::now();
    let got = fetcher.fetch_chunk(&location(8), 0).await.unwrap();

    assert_eq!(&got[..], &data[..]);
    assert_eq!(api.calls().len(), 2);
    assert!(before.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn timeouts_shrink_the_block_size_and_successes_restore_it() {
    let preferred = 256 * KIB;
    let data = object((4 * preferred) as usize);
    let api = MockApi::scripted(
        data.clone(),
        vec![Behavior::Timeout, Behavior::Timeout, Behavior::Timeout],
    );
    let config = FetchConfig {
        preferred_chunk_size: preferred,
        max_retries: 1,
        ..FetchConfig::default()
    };
    let (fetcher, api, _dir) = fetcher_with(api, config).await;
    let loc = location(9);

    assert_eq!(fetcher.effective_limit(), preferred);

    for _ in 0..3 {
        fetcher.fetch_chunk(&loc, 0).await.unwrap_err();
    }
    assert_eq!(fetcher.effective_limit(), preferred / 2);

    // Five successful calls at the reduced size restore the preferred
    // one. Each chunk now takes two calls.
    fetcher.fetch_chunk(&loc, 0).await.unwrap();
    fetcher.fetch_chunk(&loc, 1).await.unwrap();
    assert_eq!(fetcher.effective_limit(), preferred / 2);
    fetcher.fetch_chunk(&loc, 2).await.unwrap();
    assert_eq!(fetcher.effective_limit(), preferred);

    // The assembled chunks are still indexed and byte-correct.
    let got = fetcher.fetch_chunk(&loc, 1).await.unwrap();
    assert_eq!(&got[..], &data[preferred as usize..2 * preferred as usize]);

    // Every call was aligned: offset a multiple of its limit, the limit
    // a power-of-two multiple of 4096 within bounds.
    for (offset, limit) in api.calls() {
        assert_eq!(offset % limit, 0);
        assert_eq!(limit % 4096, 0);
        assert!((limit / 4096).is_power_of_two());
        assert!(limit <= 512 * KIB);
        if limit == preferred {
            assert_eq!(offset % preferred, 0);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn upstream_calls_are_rate_limited() {
    let chunks = 35_u64;
    let data = object((chunks * 4096) as usize);
    let (fetcher, api, _dir) = fetcher_with(MockApi::new(data), small_chunks()).await;
    let loc = location(10);

    let before = Instant::now();
    for chunk_id in 0..chunks {
        fetcher.fetch_chunk(&loc, chunk_id).await.unwrap();
    }

    assert_eq!(api.calls().len(), chunks as usize);
    // The first 30 calls ride the burst; the rest wait for refills.
    assert!(before.elapsed() >= Duration::from_millis(33 * (chunks - 30)));
}

#[tokio::test(start_paused = true)]
async fn object_shorter_than_promised_surfaces_as_eof() {
    let data = object(4096 + 100);
    let (fetcher, _api, _dir) = fetcher_with(MockApi::new(data), small_chunks()).await;

    // Claim the object is three chunks long and read past its real end.
    let stream = stream_range(fetcher, location(11), 0, 3 * 4096 - 1, 3 * 4096);
    let err = stream
        .try_collect::<Vec<Bytes>>()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnexpectedEof));
}

#[tokio::test(start_paused = true)]
async fn short_tail_chunk_is_not_an_error() {
    let len = 4096 + 100;
    let data = object(len);
    let (fetcher, _api, _dir) = fetcher_with(MockApi::new(data.clone()), small_chunks()).await;

    let got = collect(
        &fetcher,
        &location(12),
        4000,
        len as u64 - 1,
        len as u64,
    )
    .await;

    assert_eq!(got, &data[4000..]);
}
