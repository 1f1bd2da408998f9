//! The response adapter: one logical request over many sub-requests.
//!
//! [`BlockPeer`] is what the block importer talks to. A call to
//! [`BlockPeer::request_witnesses`] spawns the dispatcher for the batch and
//! hands back a [`WitnessHandle`]; the caller then reads exactly one
//! [`WitnessBundle`] from its sink channel, or none at all if it cancels
//! first.
//!
//! The adapter owns the cancellation plumbing. The dispatcher and every
//! sub-request observe one broadcast watch channel; only send-handles flow
//! downward, so nothing below the adapter keeps the batch alive. The
//! delivery gate pairs the cancelled flag with the actual sink send: once
//! [`WitnessHandle::close`] has returned, no message can reach the sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};

use veritas_types::H256;
use veritas_witness::Witness;

use crate::batch::WitnessFailure;
use crate::config::ExchangeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ExchangeError;
use crate::peer::WitnessPeer;
use crate::Result;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The single aggregate message a batch delivers on the caller's sink.
#[derive(Debug)]
pub struct WitnessBundle {
    /// Correlates with [`WitnessHandle::request_id`].
    pub request_id: u64,
    /// Identifier of the peer that served the batch.
    pub peer: String,
    /// Reconstructed witnesses. Order across witnesses is not significant.
    pub witnesses: Vec<Witness>,
    /// Hashes of the reconstructed witnesses, parallel to `witnesses`.
    pub hashes: Vec<H256>,
    /// Every hash the batch was opened for.
    pub requested: Vec<H256>,
    /// Witnesses that could not be fetched, with the reason.
    pub failed: Vec<(H256, WitnessFailure)>,
    /// Wall time from request to aggregate.
    pub elapsed: Duration,
}

impl WitnessBundle {
    /// Whether every requested witness was reconstructed.
    pub fn is_complete(&self) -> bool {
        self.witnesses.len() == self.requested.len()
    }
}

/// Handle to one logical witness request.
///
/// Dropping the handle detaches from the batch without cancelling it; call
/// [`close`](Self::close) to cancel.
#[derive(Debug)]
pub struct WitnessHandle {
    request_id: u64,
    peer: String,
    cancel: watch::Sender<bool>,
    delivery_gate: Arc<Mutex<bool>>,
}

impl WitnessHandle {
    /// Identifier correlating this handle with its [`WitnessBundle`].
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Identifier of the peer serving the batch.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Cancels the batch. Idempotent.
    ///
    /// No new sub-requests are created, every sub-request already sent is
    /// closed, and once this returns no message will be delivered on the
    /// caller's sink channel.
    pub fn close(&self) {
        {
            let mut cancelled = self.delivery_gate.lock();
            *cancelled = true;
        }
        self.cancel.send_replace(true);
        trace!(request_id = self.request_id, peer = %self.peer, "witness request closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// A connected peer as seen by the block importer.
///
/// Wraps the peer's identity together with its optional witness protocol
/// extension; peers that never negotiated the extension reject witness
/// requests synchronously.
pub struct BlockPeer<P: WitnessPeer> {
    id: String,
    version: u32,
    witness: Option<Arc<P>>,
    config: ExchangeConfig,
}

impl<P: WitnessPeer> BlockPeer<P> {
    /// Creates a peer wrapper without a witness extension.
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            witness: None,
            config: ExchangeConfig::default(),
        }
    }

    /// Attaches the peer's witness protocol extension.
    pub fn with_witness(mut self, witness: Arc<P>) -> Self {
        self.witness = Some(witness);
        self
    }

    /// Overrides the exchange configuration.
    pub fn with_config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    /// The peer's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the peer can serve witnesses.
    pub fn supports_witness(&self) -> bool {
        self.witness.is_some()
    }

    /// Requests the witnesses for the given block hashes.
    ///
    /// `hashes` must be non-empty and unique. The sink receives exactly one
    /// [`WitnessBundle`] unless the returned handle is closed first;
    /// witnesses that could not be fetched are reported in the bundle's
    /// `failed` list rather than as an error.
    ///
    /// Returns [`ExchangeError::NoWitnessPeer`] synchronously when the peer
    /// has no witness extension.
    pub fn request_witnesses(
        &self,
        hashes: Vec<H256>,
        sink: mpsc::Sender<WitnessBundle>,
    ) -> Result<WitnessHandle> {
        let witness_peer = self
            .witness
            .clone()
            .ok_or(ExchangeError::NoWitnessPeer)?;

        let request_id = next_request_id();
        debug!(
            peer = %self.id,
            request_id,
            hashes = hashes.len(),
            "requesting witnesses"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let delivery_gate = Arc::new(Mutex::new(false));

        let dispatcher = Dispatcher::new(
            witness_peer,
            self.config.clone(),
            hashes.clone(),
            cancel_rx.clone(),
        );

        let handle = WitnessHandle {
            request_id,
            peer: self.id.clone(),
            cancel: cancel_tx,
            delivery_gate: Arc::clone(&delivery_gate),
        };

        let peer_label = self.id.clone();
        tokio::spawn(async move {
            let started = Instant::now();

            let Some(result) = dispatcher.run().await else {
                // Cancelled: nothing is ever delivered.
                return;
            };

            if result.witnesses.len() != hashes.len() {
                error!(
                    peer = %peer_label,
                    request_id,
                    requested = hashes.len(),
                    fetched = result.witnesses.len(),
                    "unable to fetch all requested witnesses"
                );
            }

            let bundle = WitnessBundle {
                request_id,
                peer: peer_label,
                witnesses: result.witnesses,
                hashes: result.completed,
                requested: hashes,
                failed: result.failed,
                elapsed: started.elapsed(),
            };
            deliver(sink, delivery_gate, cancel_rx, bundle).await;
        });

        Ok(handle)
    }
}

/// Sends the aggregate on the sink unless the caller cancelled.
///
/// The send completes while the delivery gate is held, so a concurrent
/// [`WitnessHandle::close`] either observes the send already done or flips
/// the flag first and suppresses it; there is no window in which close has
/// returned and a send still happens afterwards.
async fn deliver(
    sink: mpsc::Sender<WitnessBundle>,
    gate: Arc<Mutex<bool>>,
    mut cancel: watch::Receiver<bool>,
    bundle: WitnessBundle,
) {
    let request_id = bundle.request_id;
    let mut bundle = Some(bundle);
    loop {
        if *cancel.borrow() {
            debug!(request_id, "witness aggregate dropped after cancellation");
            return;
        }
        tokio::select! {
            reserved = sink.reserve() => {
                let Ok(permit) = reserved else {
                    trace!(request_id, "witness sink dropped before delivery");
                    return;
                };
                let cancelled = gate.lock();
                if !*cancelled {
                    if let Some(bundle) = bundle.take() {
                        permit.send(bundle);
                        trace!(request_id, "witness aggregate delivered");
                    }
                }
                return;
            }
            changed = cancel.changed() => {
                if changed.is_err() {
                    // The handle is gone and can no longer cancel; deliver.
                    if let Ok(permit) = sink.reserve().await {
                        let cancelled = gate.lock();
                        if !*cancelled {
                            if let Some(bundle) = bundle.take() {
                                permit.send(bundle);
                            }
                        }
                    }
                    return;
                }
            }
        }
    }
}
