//! Tunables consumed by the crawl pipeline. Loading these from a file, env,
//! or CLI flags is the job of the (out-of-scope) CLI wrapper; this crate
//! exposes only the typed struct and sane defaults.

use std::time::Duration;

use url::Url;

use crate::error::CrawlError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Max `Link`s stored in a `Directory` document. The underlying
    /// directory may have more children; they are queued regardless.
    pub max_dir_size: u64,
    /// Inflight-entries channel depth between `Ls`'s producer and the
    /// directory consumer.
    pub dir_entry_buffer_size: usize,
    /// Per-entry consumer deadline; a fresh timeout scope per entry.
    pub dir_entry_timeout: Duration,
    /// Byte cap for metadata extraction. Files larger than this are
    /// indexed as Invalid rather than extracted.
    pub metadata_max_size: u64,
    /// Minimum age before a re-observation's `last-seen` is refreshed when
    /// the reference was already known.
    pub min_update_age: Duration,
    /// Backoff between protocol-error retries.
    pub retry_wait: Duration,
    /// Bound on in-place retries before a temporary transport error is
    /// surfaced as nack-requeue (§9: explicit bounded retry).
    pub max_retries: u32,
    /// Per-crawl deadline for hash (type-resolution) crawls.
    pub hash_timeout: Duration,
    /// Per-crawl deadline for file crawls.
    pub file_timeout: Duration,
    /// Per-crawl deadline for directory crawls.
    pub dir_timeout: Duration,
    /// How long the worker pool waits for in-flight crawls to finish on
    /// shutdown before nack-requeuing them.
    pub shutdown_grace: Duration,
    /// Gateway base URL used to build fetch URLs for the extractor. Must be
    /// absolute.
    pub gateway_url: Url,
    /// Protocol API base URL used by the protocol client for `stat`/`ls`.
    /// Must be absolute.
    pub api_url: Url,
}

impl Config {
    /// Builds a `Config` with the given endpoints and every other field at
    /// its default. Fails if either URL is not absolute.
    pub fn new(gateway_url: Url, api_url: Url) -> Result<Self, CrawlError> {
        if !gateway_url.is_absolute() {
            return Err(CrawlError::invalid(format!("gateway URL is not absolute: {gateway_url}")));
        }
        if !api_url.is_absolute() {
            return Err(CrawlError::invalid(format!("API URL is not absolute: {api_url}")));
        }

        Ok(Self { gateway_url, api_url, ..Self::default() })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_dir_size: 10_000,
            dir_entry_buffer_size: 8,
            dir_entry_timeout: Duration::from_secs(30),
            metadata_max_size: 100 * 1024 * 1024,
            min_update_age: Duration::from_secs(24 * 60 * 60),
            retry_wait: Duration::from_secs(5),
            max_retries: 3,
            hash_timeout: Duration::from_secs(300),
            file_timeout: Duration::from_secs(300),
            dir_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(10),
            gateway_url: Url::parse("http://127.0.0.1:8080").expect("static URL is valid"),
            api_url: Url::parse("http://127.0.0.1:5001").expect("static URL is valid"),
        }
    }
}
