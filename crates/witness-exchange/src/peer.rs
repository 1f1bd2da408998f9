//! The peer seam: wire types and the single-page request primitive.
//!
//! The P2P layer is out of scope here; the exchange only assumes a peer
//! that can run one page exchange at a time through [`WitnessPeer`]. The
//! contract is narrow on purpose:
//!
//! - one call to [`WitnessPeer::request_witness`] issues one sub-request;
//! - exactly one [`PageReply`] is eventually delivered on the caller's
//!   reply channel - pages, a failure envelope, or a cancellation notice;
//! - [`SubRequest::close`] aborts the in-flight exchange; the
//!   implementation observes the paired [`CancelSignal`];
//! - the primitive never retries. Retry policy lives in the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use veritas_types::H256;

/// A request for one page of one witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    /// Hash of the block whose witness is requested.
    pub hash: H256,
    /// Zero-based page index.
    pub page: u64,
}

impl PageRequest {
    /// Creates a new page request.
    pub fn new(hash: H256, page: u64) -> Self {
        Self { hash, page }
    }
}

/// One page of a serialized witness.
///
/// `payload` is a contiguous slice of the framed witness bytes at the
/// offset implied by `page` times the serving side's page size; the
/// exchange never needs the page size itself, only contiguity and ordering
/// by index. `total_pages` is authoritative once any page of the witness
/// has reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResponse {
    /// Hash of the block whose witness this page belongs to.
    pub hash: H256,
    /// Zero-based page index.
    pub page: u64,
    /// Total number of pages in this witness.
    pub total_pages: u64,
    /// The page's slice of the framed witness bytes.
    pub payload: Vec<u8>,
}

/// The single message a sub-request delivers on its reply channel.
#[derive(Debug, Clone)]
pub enum PageReply {
    /// The peer served one or more pages.
    Pages(Vec<PageResponse>),
    /// The exchange failed; see [`PageReplyError::is_retriable`].
    Failed(PageReplyError),
    /// The sub-request was closed before the peer answered.
    Cancelled,
}

/// Why a single page exchange failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageReplyError {
    /// The transport dropped the exchange.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The response had an unexpected shape.
    #[error("unexpected response shape: {0}")]
    BadResponse(String),

    /// The peer answered that it cannot serve the request. Not retried.
    #[error("peer cannot serve request: {0}")]
    CannotServe(String),
}

impl PageReplyError {
    /// Whether the dispatcher may re-request the page after this failure.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::CannotServe(_))
    }
}

/// Errors raised when a sub-request cannot be issued at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// The peer connection is gone.
    #[error("peer disconnected")]
    Disconnected,

    /// Any other refusal to accept the sub-request.
    #[error("peer error: {0}")]
    Other(String),
}

/// Cancellation signal observed by the peer implementation.
///
/// Flips to `true` exactly once, when the paired [`SubRequest`] is closed.
pub type CancelSignal = watch::Receiver<bool>;

/// Handle to one in-flight page exchange.
///
/// Created by the peer implementation via [`SubRequest::new`]; the
/// implementation keeps the [`CancelSignal`] and aborts its I/O when the
/// signal flips, replying with [`PageReply::Cancelled`].
#[derive(Debug)]
pub struct SubRequest {
    cancel: watch::Sender<bool>,
}

impl SubRequest {
    /// Creates a sub-request handle and its paired cancellation signal.
    pub fn new() -> (Self, CancelSignal) {
        let (cancel, signal) = watch::channel(false);
        (Self { cancel }, signal)
    }

    /// Aborts the exchange. Idempotent; safe after the reply was sent.
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// The witness-serving capability of a connected peer.
///
/// Implemented by the P2P layer; a mock implementation drives the test
/// suite. The serving side chooses the page size and may split a witness
/// into however many pages it likes.
#[async_trait]
pub trait WitnessPeer: Send + Sync + 'static {
    /// Issues one sub-request for the given pages.
    ///
    /// On success, exactly one [`PageReply`] is eventually delivered on
    /// `reply`: the pages, a failure envelope, or [`PageReply::Cancelled`]
    /// if the returned [`SubRequest`] is closed first. An `Err` means the
    /// sub-request was never sent.
    async fn request_witness(
        &self,
        request: Vec<PageRequest>,
        reply: mpsc::Sender<PageReply>,
    ) -> std::result::Result<SubRequest, PeerError>;

    /// The peer's identifier, for correlation and logs.
    fn id(&self) -> String;

    /// Negotiated witness protocol version.
    fn version(&self) -> u32;
}
