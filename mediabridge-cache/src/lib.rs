#![doc = include_str!("../README.md")]
#![warn(
    unreachable_pub,
    missing_debug_implementations,
    missing_docs,
    clippy::pedantic
)]

pub mod errors;

mod cache;
mod index;
mod persist;
mod store;

pub use cache::BinaryCache;
pub use index::SlotDescriptor;

pub(crate) type Result<T> = core::result::Result<T, errors::Error>;

use std::path::PathBuf;

/// Name of the slot data file inside the cache directory.
pub const DATA_FILE: &str = "cache.dat";

/// Name of the index file inside the cache directory.
pub const METADATA_FILE: &str = "metadata.dat";

/// Default cache capacity (10 GiB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 10 << 30;

/// Default slot size (256 KiB).
pub const DEFAULT_SLOT_SIZE: u64 = 256 << 10;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding [`DATA_FILE`] and [`METADATA_FILE`]. Created if
    /// it doesn't exist.
    pub directory: PathBuf,
    /// Upper bound on the size of the data file. The LRU keeps
    /// `slot count * slot_size` under this value.
    pub max_cache_bytes: u64,
    /// Size of one slot in the data file. Must be a power of two.
    pub slot_size: u64,
}

impl Config {
    /// Create a new config with default capacity and slot size.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}
