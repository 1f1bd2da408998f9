//! # Veritas Witness Exchange
//!
//! The paged witness request pipeline for the Veritas stateless node.
//!
//! A stateless validator verifies incoming blocks against execution
//! witnesses fetched from peers instead of a local state database. Peers
//! serve witnesses in pages - contiguous slices of the serialized witness,
//! sized at the serving side's discretion - and this crate turns many
//! physical page exchanges into one logical request/response:
//!
//! - **[`BlockPeer`]**: the importer-facing entry point. One call to
//!   [`BlockPeer::request_witnesses`] yields a [`WitnessHandle`] and exactly
//!   one [`WitnessBundle`] on the caller's sink channel (or none, if the
//!   caller cancels).
//!
//! - **[`WitnessPeer`]**: the narrow seam to the P2P layer. One
//!   [`SubRequest`] per page exchange, one guaranteed [`PageReply`] per
//!   sub-request, cancellation through [`SubRequest::close`].
//!
//! - **[`BatchState`]**: per-batch bookkeeping - pages requested, totals
//!   learned from probe pages, payloads received, failures and the retry
//!   worklist.
//!
//! - The dispatcher (internal): bounded per-peer concurrency via a
//!   semaphore, a bounded fan-in channel for replies, per-page retries up to
//!   a hard ceiling, and prompt cancellation of every outstanding
//!   sub-request.
//!
//! ## Protocol flow
//!
//! 1. **Probe**: page 0 of every requested witness is fetched first; its
//!    response carries the authoritative `total_pages`.
//!
//! 2. **Fan-out**: the remaining pages are scheduled under the per-peer
//!    concurrency limit, retrying failed pages up to the configured cap.
//!
//! 3. **Reassembly**: pages are reordered by index, concatenated, and the
//!    framed witness is decoded. Partial witnesses are never surfaced.
//!
//! 4. **Aggregate**: one [`WitnessBundle`] with every reconstructed witness
//!    is delivered on the sink; witnesses that failed are reported missing.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod batch;
pub mod config;
mod dispatcher;
pub mod error;
pub mod peer;

// Re-export main types at crate root
pub use adapter::{BlockPeer, WitnessBundle, WitnessHandle};
pub use batch::{BatchState, PageOutcome, WitnessFailure, WitnessPhase};
pub use config::ExchangeConfig;
pub use error::ExchangeError;
pub use peer::{
    CancelSignal, PageReply, PageReplyError, PageRequest, PageResponse, PeerError, SubRequest,
    WitnessPeer,
};

/// Result type alias for witness exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Page indices fetched per witness before its total page count is known.
pub const DEFAULT_PAGES_PER_PROBE: u64 = 1;

/// Maximum in-flight sub-requests to a single peer.
pub const DEFAULT_CONCURRENT_REQUESTS_PER_PEER: usize = 5;

/// Capacity of the fan-in channel that serialises page replies.
pub const DEFAULT_CONCURRENT_RESPONSES_HANDLED: usize = 10;

/// Times a failed page is re-requested before its witness is abandoned.
pub const DEFAULT_MAX_PAGE_RETRIES: u32 = 2;
