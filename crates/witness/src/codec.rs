//! Witness wire codec.
//!
//! This module provides the canonical witness serialization and the framing
//! used when a witness crosses the wire:
//!
//! - The canonical form is an RLP list `[context, headers, state]`.
//! - The framed form prefixes one marker byte: `0x00` means the canonical
//!   bytes follow as-is, `0x01` means they are gzip-compressed.
//!
//! Compression only kicks in for payloads above a configurable threshold,
//! and only when gzip actually shrinks the data; otherwise the codec falls
//! back to the uncompressed frame. Every operation feeds the process-wide
//! counters in [`crate::metrics`].

use std::io::{Read, Write};
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rlp::{Rlp, RlpStream};
use thiserror::Error;
use tracing::{debug, trace};

use veritas_types::BlockHeader;

use crate::witness::Witness;
use crate::{metrics, Result, DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_THRESHOLD};

/// Framing marker for an uncompressed canonical payload.
pub const MARKER_PLAIN: u8 = 0x00;

/// Framing marker for a gzip-compressed canonical payload.
pub const MARKER_GZIP: u8 = 0x01;

/// Errors produced while encoding or decoding witnesses.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The framed payload was empty.
    #[error("empty witness payload")]
    Empty,

    /// The framing marker was neither `0x00` nor `0x01`.
    #[error("unknown witness framing marker {0:#04x}")]
    UnknownMarker(u8),

    /// The gzip stream could not be decompressed.
    #[error("malformed gzip payload: {0}")]
    Gzip(String),

    /// The canonical bytes are not a valid witness encoding.
    #[error("malformed witness encoding: {0}")]
    Rlp(#[from] rlp::DecoderError),

    /// I/O failure while compressing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for witness compression.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Gate compression globally; when false every frame is `0x00`.
    pub enabled: bool,

    /// Payloads at or below this many bytes are never compressed.
    pub threshold: usize,

    /// Gzip compression level (1-9).
    pub level: u32,

    /// Drop redundant (empty) state entries before encoding.
    pub use_deduplication: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
            level: DEFAULT_COMPRESSION_LEVEL,
            use_deduplication: true,
        }
    }
}

/// Encodes and decodes witnesses for the wire.
#[derive(Debug, Clone, Default)]
pub struct WitnessCodec {
    config: CompressionConfig,
}

impl WitnessCodec {
    /// Creates a codec with the given compression configuration.
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Returns the codec's configuration.
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Produces the canonical RLP serialization of a witness.
    ///
    /// With deduplication enabled, empty state entries are skipped; they
    /// prove nothing and only inflate the payload.
    pub fn encode(&self, witness: &Witness) -> Vec<u8> {
        let state: Vec<&Vec<u8>> = if self.config.use_deduplication {
            witness.state().iter().filter(|e| !e.is_empty()).collect()
        } else {
            witness.state().iter().collect()
        };

        let mut stream = RlpStream::new_list(3);
        stream.append(witness.context());
        stream.append_list(witness.headers());
        stream.append_list::<Vec<u8>, _>(&state);
        stream.out().to_vec()
    }

    /// Decodes a witness from its canonical RLP serialization.
    pub fn decode(&self, data: &[u8]) -> Result<Witness> {
        let rlp = Rlp::new(data);
        if !rlp.is_list() {
            return Err(rlp::DecoderError::RlpExpectedToBeList.into());
        }
        if rlp.item_count()? != 3 {
            return Err(rlp::DecoderError::RlpIncorrectListLen.into());
        }

        let context: BlockHeader = rlp.val_at(0)?;
        let headers: Vec<BlockHeader> = rlp.list_at(1)?;
        let state: Vec<Vec<u8>> = rlp.list_at(2)?;

        Ok(Witness::from_parts(
            context,
            headers,
            state.into_iter().collect(),
        ))
    }

    /// Serializes a witness into its framed wire form.
    ///
    /// The canonical bytes are gzip-compressed when compression is enabled,
    /// the payload is larger than the configured threshold, and gzip
    /// actually reduces the size. The result carries a one-byte marker:
    /// [`MARKER_GZIP`] for compressed payloads, [`MARKER_PLAIN`] otherwise.
    pub fn encode_compressed(&self, witness: &Witness) -> Result<Vec<u8>> {
        let plain = self.encode(witness);
        metrics::record_original(plain.len() as u64);

        if self.config.enabled && plain.len() > self.config.threshold {
            let start = Instant::now();

            let level = Compression::new(self.config.level.clamp(1, 9));
            let mut encoder = GzEncoder::new(Vec::with_capacity(plain.len() / 2), level);
            encoder.write_all(&plain)?;
            let compressed = encoder.finish()?;

            if compressed.len() < plain.len() {
                metrics::record_compressed(compressed.len() as u64, start.elapsed());
                trace!(
                    original = plain.len(),
                    compressed = compressed.len(),
                    "witness compressed"
                );

                let mut framed = Vec::with_capacity(compressed.len() + 1);
                framed.push(MARKER_GZIP);
                framed.extend_from_slice(&compressed);
                return Ok(framed);
            }

            debug!(size = plain.len(), "gzip did not shrink witness, sending plain");
        }

        metrics::record_uncompressed(plain.len() as u64);

        let mut framed = Vec::with_capacity(plain.len() + 1);
        framed.push(MARKER_PLAIN);
        framed.extend_from_slice(&plain);
        Ok(framed)
    }

    /// Decodes a witness from its framed wire form.
    ///
    /// Fails on an empty payload, an unknown framing marker, a corrupt gzip
    /// stream, or a malformed canonical tail; a corrupt frame never decodes
    /// to a wrong witness silently.
    pub fn decode_compressed(&self, data: &[u8]) -> Result<Witness> {
        let (&marker, payload) = data.split_first().ok_or(CodecError::Empty)?;

        let canonical = match marker {
            MARKER_PLAIN => payload.to_vec(),
            MARKER_GZIP => {
                let start = Instant::now();

                let mut decoder = GzDecoder::new(payload);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::Gzip(e.to_string()))?;

                metrics::record_decompression(out.len() as u64, start.elapsed());
                out
            }
            other => return Err(CodecError::UnknownMarker(other)),
        };

        self.decode(&canonical)
    }
}
