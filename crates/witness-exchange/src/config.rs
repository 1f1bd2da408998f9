//! Configuration for the witness exchange.

use veritas_witness::CompressionConfig;

use crate::{
    DEFAULT_CONCURRENT_REQUESTS_PER_PEER, DEFAULT_CONCURRENT_RESPONSES_HANDLED,
    DEFAULT_MAX_PAGE_RETRIES, DEFAULT_PAGES_PER_PROBE,
};

/// Configuration for the paged witness request pipeline.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Page indices fetched per witness before its total page count is
    /// known. Page 0 of this range is the probe that teaches the total.
    pub pages_per_probe: u64,

    /// Maximum in-flight sub-requests to one peer.
    pub per_peer_concurrency: usize,

    /// Capacity of the fan-in channel that serialises page replies.
    pub response_fan_in_capacity: usize,

    /// Times a failed page is re-requested before its witness is abandoned.
    pub max_retries: u32,

    /// Codec configuration used when decoding reassembled witnesses.
    pub compression: CompressionConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            pages_per_probe: DEFAULT_PAGES_PER_PROBE,
            per_peer_concurrency: DEFAULT_CONCURRENT_REQUESTS_PER_PEER,
            response_fan_in_capacity: DEFAULT_CONCURRENT_RESPONSES_HANDLED,
            max_retries: DEFAULT_MAX_PAGE_RETRIES,
            compression: CompressionConfig::default(),
        }
    }
}
