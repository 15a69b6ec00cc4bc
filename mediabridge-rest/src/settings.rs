use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mediabridge::{fetch::MAX_FETCH_LIMIT, hash::MIN_HASH_LENGTH, FetchConfig};
use serde::{Deserialize, Serialize};

use crate::MediaOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub cache_directory: PathBuf,

    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,

    #[serde(default = "default_preferred_chunk_size")]
    pub preferred_chunk_size: u64,

    /// Upstream call deadline, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay, in seconds.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: u64,

    /// Retry delay cap, in seconds.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: u64,

    #[serde(default = "default_hash_length")]
    pub hash_length: usize,

    #[serde(default = "default_video_preroll_threshold")]
    pub video_preroll_threshold: u64,

    #[serde(default = "default_video_preroll_bytes")]
    pub video_preroll_bytes: u64,

    #[serde(default = "default_ip")]
    pub ip: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

const fn default_max_cache_bytes() -> u64 {
    10 << 30
}

const fn default_preferred_chunk_size() -> u64 {
    256 << 10
}

const fn default_request_timeout() -> u64 {
    300
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_retry_base_delay() -> u64 {
    1
}

const fn default_retry_max_delay() -> u64 {
    60
}

const fn default_hash_length() -> usize {
    mediabridge::hash::DEFAULT_HASH_LENGTH
}

const fn default_video_preroll_threshold() -> u64 {
    100 << 20
}

const fn default_video_preroll_bytes() -> u64 {
    5 << 20
}

const fn default_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8000
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse settings: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid settings: {0}")]
    Invalid(&'static str),
}

impl Settings {
    /// Load settings from a TOML file and validate them.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.preferred_chunk_size == 0
            || self.preferred_chunk_size % 4096 != 0
            || !(self.preferred_chunk_size / 4096).is_power_of_two()
        {
            return Err(SettingsError::Invalid(
                "preferred_chunk_size must be 4096 * a power of two",
            ));
        }

        if self.preferred_chunk_size > MAX_FETCH_LIMIT {
            return Err(SettingsError::Invalid(
                "preferred_chunk_size exceeds the upstream fetch limit",
            ));
        }

        if self.hash_length < MIN_HASH_LENGTH || self.hash_length > 32 {
            return Err(SettingsError::Invalid(
                "hash_length must be between 6 and 32",
            ));
        }

        if self.max_retries == 0 {
            return Err(SettingsError::Invalid("max_retries must be at least 1"));
        }

        if self.video_preroll_bytes == 0 {
            return Err(SettingsError::Invalid(
                "video_preroll_bytes must be nonzero",
            ));
        }

        Ok(())
    }

    pub fn cache_config(&self) -> mediabridge_cache::Config {
        mediabridge_cache::Config {
            directory: self.cache_directory.clone(),
            max_cache_bytes: self.max_cache_bytes,
            slot_size: self.preferred_chunk_size,
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            preferred_chunk_size: self.preferred_chunk_size,
            request_timeout: Duration::from_secs(self.request_timeout),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_secs(self.retry_base_delay),
            retry_max_delay: Duration::from_secs(self.retry_max_delay),
        }
    }

    pub fn media_options(&self) -> MediaOptions {
        MediaOptions {
            hash_length: self.hash_length,
            video_preroll_threshold: self.video_preroll_threshold,
            video_preroll_bytes: self.video_preroll_bytes,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}
