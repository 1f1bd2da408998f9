//! # Veritas Types
//!
//! Core type definitions for the Veritas stateless node.
//!
//! This crate provides the fundamental types used throughout Veritas:
//! - [`H256`] - 32-byte hashes with Keccak256 support
//! - [`BlockHeader`] - block headers as carried inside execution witnesses
//!
//! ## Example
//!
//! ```rust
//! use veritas_types::H256;
//!
//! // Hash some data
//! let hash = H256::keccak256(b"hello world");
//!
//! // Check the nil hash constant
//! assert_ne!(hash, H256::NIL);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod hash;
pub mod header;

// Re-export main types at crate root
pub use hash::H256;
pub use header::BlockHeader;

/// Result type alias for Veritas types operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with Veritas types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// RLP decoding error
    #[error("RLP decode error: {0}")]
    RlpDecode(#[from] rlp::DecoderError),
}
