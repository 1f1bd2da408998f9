//! Process-wide compression metrics.
//!
//! The codec feeds these counters on every encode/decode; operators read
//! them through [`snapshot`]. They are deliberately global - the same codec
//! runs for every peer and every batch, and the interesting numbers are
//! node-wide. [`reset`] exists for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static COMPRESSED_COUNT: AtomicU64 = AtomicU64::new(0);
static UNCOMPRESSED_COUNT: AtomicU64 = AtomicU64::new(0);
static DECOMPRESSION_COUNT: AtomicU64 = AtomicU64::new(0);

static TOTAL_ORIGINAL_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_EMITTED_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_DECOMPRESSED_BYTES: AtomicU64 = AtomicU64::new(0);

static COMPRESSION_NANOS: AtomicU64 = AtomicU64::new(0);
static DECOMPRESSION_NANOS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_original(bytes: u64) {
    TOTAL_ORIGINAL_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn record_compressed(emitted: u64, elapsed: Duration) {
    COMPRESSED_COUNT.fetch_add(1, Ordering::Relaxed);
    TOTAL_EMITTED_BYTES.fetch_add(emitted, Ordering::Relaxed);
    COMPRESSION_NANOS.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
}

pub(crate) fn record_uncompressed(emitted: u64) {
    UNCOMPRESSED_COUNT.fetch_add(1, Ordering::Relaxed);
    TOTAL_EMITTED_BYTES.fetch_add(emitted, Ordering::Relaxed);
}

pub(crate) fn record_decompression(bytes: u64, elapsed: Duration) {
    DECOMPRESSION_COUNT.fetch_add(1, Ordering::Relaxed);
    TOTAL_DECOMPRESSED_BYTES.fetch_add(bytes, Ordering::Relaxed);
    DECOMPRESSION_NANOS.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
}

/// A point-in-time view of the compression counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionStats {
    /// Witness encodings that went out gzip-compressed.
    pub compressed: u64,
    /// Witness encodings that went out as plain canonical bytes.
    pub uncompressed: u64,
    /// Gzip payloads decompressed on the receive path.
    pub decompressions: u64,
    /// Total canonical bytes produced by the encoder.
    pub total_original_bytes: u64,
    /// Total payload bytes actually emitted (compressed or plain).
    pub total_emitted_bytes: u64,
    /// Total canonical bytes recovered by the decompressor.
    pub total_decompressed_bytes: u64,
    /// Cumulative time spent compressing.
    pub compression_time: Duration,
    /// Cumulative time spent decompressing.
    pub decompression_time: Duration,
}

impl CompressionStats {
    /// Total witnesses encoded, compressed or not.
    pub fn total_encoded(&self) -> u64 {
        self.compressed + self.uncompressed
    }

    /// Bytes saved by compression: original minus emitted.
    pub fn space_saved(&self) -> u64 {
        self.total_original_bytes
            .saturating_sub(self.total_emitted_bytes)
    }

    /// Average emitted-to-original ratio as a percentage.
    pub fn average_ratio(&self) -> f64 {
        if self.total_original_bytes == 0 {
            return 100.0;
        }
        (self.total_emitted_bytes as f64 / self.total_original_bytes as f64) * 100.0
    }

    /// Compression throughput in bytes per second.
    pub fn compression_rate(&self) -> f64 {
        let secs = self.compression_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_emitted_bytes as f64 / secs
    }

    /// Decompression throughput in bytes per second.
    pub fn decompression_rate(&self) -> f64 {
        let secs = self.decompression_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_decompressed_bytes as f64 / secs
    }
}

/// Reads the current counter values.
pub fn snapshot() -> CompressionStats {
    CompressionStats {
        compressed: COMPRESSED_COUNT.load(Ordering::Relaxed),
        uncompressed: UNCOMPRESSED_COUNT.load(Ordering::Relaxed),
        decompressions: DECOMPRESSION_COUNT.load(Ordering::Relaxed),
        total_original_bytes: TOTAL_ORIGINAL_BYTES.load(Ordering::Relaxed),
        total_emitted_bytes: TOTAL_EMITTED_BYTES.load(Ordering::Relaxed),
        total_decompressed_bytes: TOTAL_DECOMPRESSED_BYTES.load(Ordering::Relaxed),
        compression_time: Duration::from_nanos(COMPRESSION_NANOS.load(Ordering::Relaxed)),
        decompression_time: Duration::from_nanos(DECOMPRESSION_NANOS.load(Ordering::Relaxed)),
    }
}

/// Zeroes every counter. Intended for tests.
pub fn reset() {
    COMPRESSED_COUNT.store(0, Ordering::Relaxed);
    UNCOMPRESSED_COUNT.store(0, Ordering::Relaxed);
    DECOMPRESSION_COUNT.store(0, Ordering::Relaxed);
    TOTAL_ORIGINAL_BYTES.store(0, Ordering::Relaxed);
    TOTAL_EMITTED_BYTES.store(0, Ordering::Relaxed);
    TOTAL_DECOMPRESSED_BYTES.store(0, Ordering::Relaxed);
    COMPRESSION_NANOS.store(0, Ordering::Relaxed);
    DECOMPRESSION_NANOS.store(0, Ordering::Relaxed);
}
