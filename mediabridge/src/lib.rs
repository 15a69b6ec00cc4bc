#![doc = include_str!("../README.md")]
#![warn(
    unreachable_pub,
    missing_debug_implementations,
    missing_docs,
    clippy::pedantic
)]

pub mod api;
pub mod errors;
pub mod fetch;
pub mod hash;
pub mod location;
pub mod reader;

pub use api::{MediaApi, UpstreamError};
pub use fetch::{FetchConfig, Fetcher};
pub use location::{DocumentFile, Location, MediaResolver};
pub use reader::stream_range;

pub(crate) type Result<T> = core::result::Result<T, errors::Error>;
