//! # Veritas Witness
//!
//! Execution witness data model and wire codec for the Veritas stateless
//! node.
//!
//! A witness is a self-contained record of the state-trie nodes and code
//! blobs required to re-execute one block without access to a live state
//! database. This crate provides:
//!
//! - **[`Witness`]**: the witness itself - an anchoring context header, the
//!   ancestor headers, and the set of state-node byte strings.
//!
//! - **[`WitnessCodec`]**: canonical RLP encoding plus the one-byte framing
//!   used on the wire: `0x00` for canonical-only payloads, `0x01` for
//!   gzip-of-canonical. Large witnesses are compressed when that actually
//!   shrinks them; everything else travels uncompressed.
//!
//! - **[`CompressionConfig`]**: threshold, gzip level, and deduplication
//!   knobs for the codec.
//!
//! - **[`metrics`]**: process-wide compression counters with a snapshot view
//!   and a reset hook for tests.
//!
//! ## Example
//!
//! ```rust
//! use veritas_witness::{Witness, WitnessCodec};
//! use veritas_types::BlockHeader;
//!
//! let mut witness = Witness::new(BlockHeader::default());
//! witness.add_state([b"trie node".to_vec()]);
//!
//! let codec = WitnessCodec::default();
//! let framed = codec.encode_compressed(&witness).unwrap();
//! let decoded = codec.decode_compressed(&framed).unwrap();
//! assert_eq!(witness, decoded);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod codec;
pub mod metrics;
pub mod witness;

// Re-export main types at crate root
pub use codec::{CodecError, CompressionConfig, WitnessCodec};
pub use metrics::CompressionStats;
pub use witness::Witness;

/// Result type alias for witness codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Compression threshold in bytes. Only payloads larger than this are
/// considered for compression; 1 MiB is where gzip starts paying for itself.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024 * 1024;

/// Default gzip compression level (best speed).
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;
