//! The request dispatcher.
//!
//! Drives one batch: builds sub-requests under the per-peer concurrency
//! limit, fans page replies back into a single bounded channel, applies the
//! retry policy, and finalises the aggregate once every witness is either
//! complete or definitively failed.
//!
//! ## Task structure
//!
//! - **Scheduling passes** dispatch every currently schedulable page. They
//!   are serialised by `schedule_gate` so two reply events never interleave
//!   an enqueue, and each pass owns a clone of the fan-in sender.
//!
//! - **Forwarders** (one short-lived task per sub-request) move the peer's
//!   reply into the fan-in channel together with the originating request
//!   and the concurrency permit.
//!
//! - **The reception loop** consumes the fan-in channel, feeds the batch
//!   state, releases permits, and spawns follow-up passes when a probe
//!   teaches a total or a failure earns a retry.
//!
//! Completion needs no counters: the fan-in sender is owned only by
//! scheduling passes, forwarders, and in-flight replies, so the channel
//! closes exactly when no sub-request is outstanding and no pass can create
//! one. Cancellation reaches the passes (they stop enqueuing), the
//! reception loop (it stops waiting), and every live sub-request (closed
//! explicitly) through one watch channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, trace, warn};

use veritas_types::H256;
use veritas_witness::{Witness, WitnessCodec};

use crate::batch::{BatchState, PageOutcome, WitnessFailure};
use crate::config::ExchangeConfig;
use crate::peer::{PageReply, PageReplyError, PageRequest, SubRequest, WitnessPeer};

/// One sub-request's reply, as it arrives on the fan-in channel.
///
/// Carries the concurrency permit (released once the reply is handled) and
/// a handle to the fan-in channel itself, so the reception loop can spawn
/// follow-up scheduling passes without keeping the channel open forever.
struct SubReply {
    request: PageRequest,
    reply: PageReply,
    permit: OwnedSemaphorePermit,
    scheduler: mpsc::Sender<SubReply>,
}

/// What a settled batch produced.
pub(crate) struct BatchResult {
    /// Reconstructed witnesses.
    pub witnesses: Vec<Witness>,
    /// Hashes of the reconstructed witnesses, parallel to `witnesses`.
    pub completed: Vec<H256>,
    /// Witnesses abandoned, with the reason.
    pub failed: Vec<(H256, WitnessFailure)>,
}

pub(crate) struct Dispatcher<P: WitnessPeer> {
    peer: Arc<P>,
    config: ExchangeConfig,
    state: Mutex<BatchState>,
    /// Serialises scheduling passes so two reply events cannot interleave
    /// an enqueue.
    schedule_gate: tokio::sync::Mutex<()>,
    semaphore: Arc<Semaphore>,
    /// Every sub-request issued, kept for explicit cancellation.
    live: Mutex<Vec<SubRequest>>,
    cancel: watch::Receiver<bool>,
    fatal: AtomicBool,
}

impl<P: WitnessPeer> Dispatcher<P> {
    pub(crate) fn new(
        peer: Arc<P>,
        config: ExchangeConfig,
        hashes: Vec<H256>,
        cancel: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let state = BatchState::new(hashes, config.pages_per_probe, config.max_retries);
        let semaphore = Arc::new(Semaphore::new(config.per_peer_concurrency.max(1)));
        Arc::new(Self {
            peer,
            config,
            state: Mutex::new(state),
            schedule_gate: tokio::sync::Mutex::new(()),
            semaphore,
            live: Mutex::new(Vec::new()),
            cancel,
            fatal: AtomicBool::new(false),
        })
    }

    /// Runs the batch until every witness is complete or definitively
    /// failed. Returns `None` when the caller cancelled.
    pub(crate) async fn run(self: Arc<Self>) -> Option<BatchResult> {
        let capacity = self.config.response_fan_in_capacity.max(1);
        let (results_tx, mut results_rx) = mpsc::channel(capacity);

        // Seed the batch: the first pass requests the probe window of every
        // witness. It owns the only fan-in sender until sub-requests exist.
        tokio::spawn(Arc::clone(&self).schedule_pass(results_tx));

        let cancelled = Arc::clone(&self).reception_loop(&mut results_rx).await;
        if cancelled {
            debug!(peer = %self.peer.id(), "witness batch cancelled");
            return None;
        }
        Some(self.finalise())
    }

    fn halted(&self) -> bool {
        *self.cancel.borrow() || self.fatal.load(Ordering::Relaxed)
    }

    /// One scheduling pass: dispatch every currently schedulable page.
    async fn schedule_pass(self: Arc<Self>, scheduler: mpsc::Sender<SubReply>) {
        let _gate = self.schedule_gate.lock().await;
        if self.halted() {
            return;
        }

        let work = self.state.lock().schedulable();
        for request in work {
            if self.halted() {
                return;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                return;
            };
            if self.halted() {
                return;
            }
            self.dispatch(request, permit, &scheduler).await;
        }
    }

    /// Issues one sub-request and spawns its forwarder.
    async fn dispatch(
        &self,
        request: PageRequest,
        permit: OwnedSemaphorePermit,
        scheduler: &mpsc::Sender<SubReply>,
    ) {
        {
            // A reply handled while this pass awaited a permit may have
            // resolved the page already.
            let state = self.state.lock();
            if state.is_resolved(&request.hash, request.page) {
                drop(permit);
                return;
            }
        }

        trace!(
            peer = %self.peer.id(),
            hash = %request.hash.short(),
            page = request.page,
            "dispatching witness page request"
        );

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        match self.peer.request_witness(vec![request], reply_tx).await {
            Ok(sub_request) => {
                self.state.lock().mark_requested(request.hash, request.page);
                self.live.lock().push(sub_request);

                let results = scheduler.clone();
                tokio::spawn(async move {
                    let reply = match reply_rx.recv().await {
                        Some(reply) => reply,
                        // The primitive owes us exactly one message; a
                        // dropped channel is a transport fault.
                        None => PageReply::Failed(PageReplyError::Transport(
                            "peer dropped the reply channel".into(),
                        )),
                    };
                    let message = SubReply {
                        request,
                        reply,
                        permit,
                        scheduler: results.clone(),
                    };
                    let _ = results.send(message).await;
                });
            }
            Err(err) => {
                error!(
                    peer = %self.peer.id(),
                    hash = %request.hash.short(),
                    page = request.page,
                    %err,
                    "peer rejected witness sub-request, aborting batch"
                );
                self.fatal.store(true, Ordering::Relaxed);
                drop(permit);
                self.close_live();
            }
        }
    }

    /// Consumes the fan-in channel until the batch settles or is cancelled.
    /// Returns `true` when the caller cancelled.
    async fn reception_loop(self: Arc<Self>, results: &mut mpsc::Receiver<SubReply>) -> bool {
        let mut cancel = self.cancel.clone();
        let mut cancel_alive = true;
        loop {
            tokio::select! {
                changed = cancel.changed(), if cancel_alive => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            self.close_live();
                            return true;
                        }
                        Ok(()) => {}
                        // The handle was dropped without close; the batch
                        // simply runs to completion.
                        Err(_) => cancel_alive = false,
                    }
                }
                reply = results.recv() => {
                    match reply {
                        Some(sub_reply) => {
                            if let Some(scheduler) = self.handle_reply(sub_reply) {
                                tokio::spawn(Arc::clone(&self).schedule_pass(scheduler));
                            }
                        }
                        None => return *self.cancel.borrow(),
                    }
                }
            }
        }
    }

    /// Applies one sub-request reply to the batch state. Returns the fan-in
    /// sender when a follow-up scheduling pass should run.
    fn handle_reply(&self, sub_reply: SubReply) -> Option<mpsc::Sender<SubReply>> {
        let SubReply {
            request,
            reply,
            permit,
            scheduler,
        } = sub_reply;

        let mut schedule_more = false;
        match reply {
            PageReply::Pages(pages) => {
                let mut state = self.state.lock();
                let mut request_faulted = false;
                for page in pages {
                    let (hash, index) = (page.hash, page.page);
                    if page.payload.is_empty() {
                        warn!(hash = %hash.short(), page = index, "empty witness page counted as failure");
                        schedule_more |= state.record_failure(hash, index);
                        request_faulted |= hash == request.hash && index == request.page;
                        continue;
                    }
                    match state.accept_page(page) {
                        PageOutcome::Accepted { fresh_total, witness_complete } => {
                            trace!(hash = %hash.short(), page = index, "witness page accepted");
                            if witness_complete {
                                debug!(hash = %hash.short(), "witness pages complete");
                            }
                            schedule_more |= fresh_total;
                        }
                        PageOutcome::Duplicate => {
                            debug!(hash = %hash.short(), page = index, "duplicate witness page discarded");
                        }
                        PageOutcome::BeyondTotal => {
                            debug!(hash = %hash.short(), page = index, "witness page beyond total discarded");
                        }
                        PageOutcome::Disagreement => {
                            warn!(hash = %hash.short(), page = index, "witness failed on total pages disagreement");
                        }
                        PageOutcome::Unknown => {
                            debug!(hash = %hash.short(), page = index, "page for unknown witness discarded");
                        }
                        PageOutcome::Stale => {
                            trace!(hash = %hash.short(), page = index, "page for failed witness discarded");
                        }
                    }
                }
                // The reply must account for the page it was issued for; a
                // response that answers something else counts as a failure.
                if !request_faulted && !state.is_resolved(&request.hash, request.page) {
                    warn!(
                        hash = %request.hash.short(),
                        page = request.page,
                        "page request left unanswered by reply"
                    );
                    schedule_more |= state.record_failure(request.hash, request.page);
                }
            }
            PageReply::Failed(err) => {
                if err.is_retriable() {
                    let retrying = self.state.lock().record_failure(request.hash, request.page);
                    if retrying {
                        debug!(
                            hash = %request.hash.short(),
                            page = request.page,
                            %err,
                            "retrying failed witness page"
                        );
                    } else {
                        warn!(
                            hash = %request.hash.short(),
                            page = request.page,
                            %err,
                            "witness abandoned after exhausting page retries"
                        );
                    }
                    schedule_more |= retrying;
                } else {
                    warn!(
                        hash = %request.hash.short(),
                        page = request.page,
                        %err,
                        "peer cannot serve witness page, abandoning witness"
                    );
                    self.state
                        .lock()
                        .fail_witness(request.hash, WitnessFailure::Rejected(err.to_string()));
                }
            }
            PageReply::Cancelled => {
                trace!(
                    hash = %request.hash.short(),
                    page = request.page,
                    "witness sub-request cancelled"
                );
            }
        }

        // Terminal state reached: the permit goes back before any follow-up
        // pass tries to acquire it.
        drop(permit);

        schedule_more.then_some(scheduler)
    }

    /// Closes every sub-request issued so far. Idempotent.
    fn close_live(&self) {
        let live = self.live.lock();
        for sub_request in live.iter() {
            sub_request.close();
        }
        debug!(peer = %self.peer.id(), count = live.len(), "closed live witness sub-requests");
    }

    /// Decodes every complete witness and assembles the batch result.
    fn finalise(&self) -> BatchResult {
        let codec = WitnessCodec::new(self.config.compression.clone());

        let assembled: Vec<(H256, Vec<u8>)> = {
            let state = self.state.lock();
            state
                .completed_hashes()
                .into_iter()
                .filter_map(|hash| state.assembled(&hash).map(|bytes| (hash, bytes)))
                .collect()
        };

        let mut witnesses = Vec::with_capacity(assembled.len());
        let mut completed = Vec::with_capacity(assembled.len());
        for (hash, bytes) in assembled {
            match codec.decode_compressed(&bytes) {
                Ok(witness) => {
                    witnesses.push(witness);
                    completed.push(hash);
                }
                Err(err) => {
                    error!(hash = %hash.short(), %err, "reassembled witness failed to decode");
                    self.state
                        .lock()
                        .fail_witness(hash, WitnessFailure::Decode(err.to_string()));
                }
            }
        }

        let failed = self.state.lock().failed_witnesses();
        BatchResult {
            witnesses,
            completed,
            failed,
        }
    }
}
