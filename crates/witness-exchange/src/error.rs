//! Error taxonomy for the witness exchange.
//!
//! Only two conditions short-circuit a whole batch: a peer without the
//! witness protocol extension, and caller-side cancellation. Everything
//! else - transport failures, malformed pages, disagreeing totals,
//! exhausted retries - is reconciled per page or per witness and surfaced
//! through the aggregate: a hash missing from the bundle means its witness
//! failed, with the reason recorded in [`WitnessFailure`].
//!
//! [`WitnessFailure`]: crate::batch::WitnessFailure

use thiserror::Error;

/// Errors returned synchronously by the exchange entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// The peer has not negotiated the witness protocol extension.
    #[error("witness peer not connected")]
    NoWitnessPeer,

    /// The logical request was cancelled by the caller; no aggregate is
    /// delivered on the sink.
    #[error("witness request cancelled")]
    Cancelled,
}
