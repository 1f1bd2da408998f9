//! Per-batch page-assembly state.
//!
//! One [`BatchState`] lives for the duration of one logical witness
//! request. It tracks, per witness: how many pages have been requested, the
//! total page count once a probe page has taught it, the payloads received
//! so far, and the failure/retry bookkeeping. The dispatcher is the only
//! writer; the struct itself is lock-free and purely in-memory.
//!
//! Per-witness lifecycle: `Probing` (no total known) -> `Fetching` ->
//! `Complete`, with either of the first two dropping to `Failed` on a total
//! disagreement, an exhausted retry budget, or a peer refusal.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use veritas_types::H256;

use crate::peer::{PageRequest, PageResponse};

/// Why a witness was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WitnessFailure {
    /// Two pages reported different total page counts.
    #[error("conflicting total pages: {established} then {reported}")]
    Disagreement {
        /// Total established by the first page that reported one.
        established: u64,
        /// Conflicting total reported by a later page.
        reported: u64,
    },

    /// A page failed more times than the retry budget allows.
    #[error("page {page} exceeded the retry budget")]
    RetriesExhausted {
        /// The page that crossed the ceiling.
        page: u64,
    },

    /// The peer answered that it cannot serve the witness.
    #[error("peer refused to serve: {0}")]
    Rejected(String),

    /// The reassembled bytes failed to decode.
    #[error("reassembled witness failed to decode: {0}")]
    Decode(String),

    /// A page response was structurally invalid.
    #[error("malformed page response: {0}")]
    Malformed(String),
}

/// Per-witness lifecycle as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessPhase {
    /// No page has reported the witness's total page count yet.
    Probing,
    /// The total is known and pages are being fetched.
    Fetching,
    /// Every page is present.
    Complete,
    /// The witness was abandoned; it will be reported missing.
    Failed,
}

/// Outcome of feeding one page response into the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The page was stored.
    Accepted {
        /// This page taught the witness's total page count.
        fresh_total: bool,
        /// This page was the last one missing.
        witness_complete: bool,
    },
    /// A copy of this page was already stored; discarded.
    Duplicate,
    /// The page index is at or beyond the known total; discarded.
    BeyondTotal,
    /// The reported total conflicts with the established one; the witness
    /// is now failed.
    Disagreement,
    /// The hash is not part of this batch; discarded.
    Unknown,
    /// The witness already failed; discarded.
    Stale,
}

#[derive(Debug, Default)]
struct RetryState {
    fail_count: u32,
    retry_pending: bool,
}

/// Bookkeeping for one logical witness request.
#[derive(Debug)]
pub struct BatchState {
    hashes: Vec<H256>,
    pages_per_probe: u64,
    max_retries: u32,
    /// Established total pages per witness; set by the first page that
    /// reports one, monotonic thereafter.
    total: HashMap<H256, u64>,
    /// High-water mark of pages requested per witness.
    requested: HashMap<H256, u64>,
    /// Received page payloads, ordered by index.
    received: HashMap<H256, BTreeMap<u64, Vec<u8>>>,
    /// Failure counters per page.
    failures: HashMap<H256, HashMap<u64, RetryState>>,
    /// Pages waiting to be re-requested.
    retry_queue: Vec<PageRequest>,
    /// Abandoned witnesses, with the reason.
    failed: HashMap<H256, WitnessFailure>,
}

impl BatchState {
    /// Creates state for a batch over the given witness hashes.
    pub fn new(hashes: Vec<H256>, pages_per_probe: u64, max_retries: u32) -> Self {
        Self {
            hashes,
            pages_per_probe: pages_per_probe.max(1),
            max_retries,
            total: HashMap::new(),
            requested: HashMap::new(),
            received: HashMap::new(),
            failures: HashMap::new(),
            retry_queue: Vec::new(),
            failed: HashMap::new(),
        }
    }

    /// The hashes this batch was opened for.
    pub fn hashes(&self) -> &[H256] {
        &self.hashes
    }

    /// Current lifecycle phase of a witness, or `None` for foreign hashes.
    pub fn phase(&self, hash: &H256) -> Option<WitnessPhase> {
        if !self.hashes.contains(hash) {
            return None;
        }
        if self.failed.contains_key(hash) {
            return Some(WitnessPhase::Failed);
        }
        if self.pages_complete(hash) {
            return Some(WitnessPhase::Complete);
        }
        if self.total.contains_key(hash) {
            Some(WitnessPhase::Fetching)
        } else {
            Some(WitnessPhase::Probing)
        }
    }

    fn pages_complete(&self, hash: &H256) -> bool {
        match self.total.get(hash) {
            Some(total) => self
                .received
                .get(hash)
                .map_or(false, |pages| pages.len() as u64 == *total),
            None => false,
        }
    }

    /// Whether every page of the witness is present and it has not failed.
    pub fn is_complete(&self, hash: &H256) -> bool {
        !self.failed.contains_key(hash) && self.pages_complete(hash)
    }

    /// Pages that should be dispatched now: the un-requested tail of every
    /// active witness (up to its known total, or the probe window while the
    /// total is unknown), followed by the drained retry worklist.
    pub fn schedulable(&mut self) -> Vec<PageRequest> {
        let mut work = Vec::new();
        for hash in &self.hashes {
            if self.failed.contains_key(hash) || self.pages_complete(hash) {
                continue;
            }
            let start = self.requested.get(hash).copied().unwrap_or(0);
            let end = self
                .total
                .get(hash)
                .copied()
                .unwrap_or(self.pages_per_probe);
            for page in start..end {
                work.push(PageRequest::new(*hash, page));
            }
        }
        work.extend(self.take_pending_retries());
        work
    }

    /// Drains the retry worklist, clearing the pending flags. Pages of
    /// witnesses that have since completed or failed are dropped.
    pub fn take_pending_retries(&mut self) -> Vec<PageRequest> {
        let queue = std::mem::take(&mut self.retry_queue);
        let mut out = Vec::new();
        for request in queue {
            if let Some(retry) = self
                .failures
                .get_mut(&request.hash)
                .and_then(|pages| pages.get_mut(&request.page))
            {
                retry.retry_pending = false;
            }
            if self.failed.contains_key(&request.hash) || self.pages_complete(&request.hash) {
                continue;
            }
            out.push(request);
        }
        out
    }

    /// Records that a page has been dispatched to the peer.
    pub fn mark_requested(&mut self, hash: H256, page: u64) {
        let high_water = self.requested.entry(hash).or_insert(0);
        if page >= *high_water {
            *high_water = page + 1;
        }
    }

    /// Records a page failure.
    ///
    /// Returns `true` and queues the page for retry while the failure count
    /// is within the budget; once the count crosses `max_retries` the whole
    /// witness is marked failed and `false` is returned.
    pub fn record_failure(&mut self, hash: H256, page: u64) -> bool {
        if self.failed.contains_key(&hash) || self.pages_complete(&hash) {
            return false;
        }
        let retry = self
            .failures
            .entry(hash)
            .or_default()
            .entry(page)
            .or_default();
        retry.fail_count += 1;

        if retry.fail_count <= self.max_retries {
            if !retry.retry_pending {
                retry.retry_pending = true;
                self.retry_queue.push(PageRequest::new(hash, page));
            }
            true
        } else {
            self.failed
                .insert(hash, WitnessFailure::RetriesExhausted { page });
            false
        }
    }

    /// Marks a witness as failed. The first recorded reason wins.
    pub fn fail_witness(&mut self, hash: H256, failure: WitnessFailure) {
        self.failed.entry(hash).or_insert(failure);
    }

    /// Feeds one page response into the batch.
    pub fn accept_page(&mut self, page: PageResponse) -> PageOutcome {
        if !self.hashes.contains(&page.hash) {
            return PageOutcome::Unknown;
        }
        if self.failed.contains_key(&page.hash) {
            return PageOutcome::Stale;
        }

        let fresh_total = match self.total.get(&page.hash) {
            Some(&established) if established == page.total_pages => false,
            Some(&established) => {
                self.failed.insert(
                    page.hash,
                    WitnessFailure::Disagreement {
                        established,
                        reported: page.total_pages,
                    },
                );
                return PageOutcome::Disagreement;
            }
            None => {
                if page.total_pages == 0 {
                    self.failed.insert(
                        page.hash,
                        WitnessFailure::Malformed("page reported zero total pages".into()),
                    );
                    return PageOutcome::Disagreement;
                }
                self.total.insert(page.hash, page.total_pages);
                true
            }
        };

        if page.page >= page.total_pages {
            return PageOutcome::BeyondTotal;
        }

        let pages = self.received.entry(page.hash).or_default();
        if pages.contains_key(&page.page) {
            return PageOutcome::Duplicate;
        }
        pages.insert(page.page, page.payload);

        PageOutcome::Accepted {
            fresh_total,
            witness_complete: pages.len() as u64 == page.total_pages,
        }
    }

    /// The reassembled bytes of a complete witness, index-ascending.
    pub fn assembled(&self, hash: &H256) -> Option<Vec<u8>> {
        if !self.is_complete(hash) {
            return None;
        }
        let pages = self.received.get(hash)?;
        let size = pages.values().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(size);
        for payload in pages.values() {
            bytes.extend_from_slice(payload);
        }
        Some(bytes)
    }

    /// Hashes whose witnesses are fully assembled.
    pub fn completed_hashes(&self) -> Vec<H256> {
        self.hashes
            .iter()
            .filter(|hash| self.is_complete(hash))
            .copied()
            .collect()
    }

    /// Hashes whose witnesses are not (or not yet) assembled.
    pub fn still_missing(&self) -> Vec<H256> {
        self.hashes
            .iter()
            .filter(|hash| !self.is_complete(hash))
            .copied()
            .collect()
    }

    /// Abandoned witnesses with the recorded reason.
    pub fn failed_witnesses(&self) -> Vec<(H256, WitnessFailure)> {
        let mut failed: Vec<_> = self
            .failed
            .iter()
            .map(|(hash, failure)| (*hash, failure.clone()))
            .collect();
        failed.sort_by_key(|(hash, _)| *hash);
        failed
    }

    /// Whether the given page needs no further action: it was received,
    /// falls beyond the known total, or its witness is closed either way.
    pub fn is_resolved(&self, hash: &H256, page: u64) -> bool {
        if !self.hashes.contains(hash) {
            return true;
        }
        if self.failed.contains_key(hash) || self.pages_complete(hash) {
            return true;
        }
        if let Some(&total) = self.total.get(hash) {
            if page >= total {
                return true;
            }
        }
        self.received
            .get(hash)
            .map_or(false, |pages| pages.contains_key(&page))
    }
}
