//! End-to-end tests for the paged witness request pipeline, driven by a
//! programmable mock peer: page size, per-page latency, failure schedules,
//! total-page overrides, and a close hook are all scriptable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use veritas_types::{BlockHeader, H256};
use veritas_witness::{Witness, WitnessCodec};
use veritas_witness_exchange::{
    BlockPeer, ExchangeError, PageReply, PageReplyError, PageRequest, PageResponse, PeerError,
    SubRequest, WitnessFailure, WitnessPeer,
};

/// Installs a log subscriber so `--nocapture` runs show the pipeline's
/// tracing output. Safe to call from every test; only the first wins.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn hash(n: u8) -> H256 {
    H256::from([n; 32])
}

/// Builds a deterministic witness whose state size is roughly `target_size`
/// and returns it together with its framed wire bytes.
fn fixture_witness(seed: u64, target_size: usize) -> (Witness, Vec<u8>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut witness = Witness::new(BlockHeader::new(100, H256::keccak256(b"parent")));
    witness.add_header(BlockHeader::new(99, H256::keccak256(b"grandparent")));

    let mut total = 0;
    while total < target_size {
        let chunk_size = rng.gen_range(64..=2048).min(target_size - total + 9);
        let mut entry = vec![0u8; chunk_size];
        rng.fill(entry.as_mut_slice());
        total += entry.len();
        witness.add_state([entry]);
    }

    let framed = WitnessCodec::default().encode_compressed(&witness).unwrap();
    (witness, framed)
}

/// One scripted deviation from a clean page response.
#[derive(Debug, Clone)]
enum MockFault {
    /// Reply with the given failure envelope.
    Error(PageReplyError),
    /// Reply with a zero-byte payload.
    EmptyPayload,
}

struct MockInner {
    payloads: HashMap<H256, Vec<u8>>,
    page_size: usize,
    latency: Duration,
    latency_overrides: HashMap<u64, Duration>,
    total_overrides: HashMap<u64, u64>,
    faults: Mutex<HashMap<(H256, u64), Vec<MockFault>>>,
    /// `request_witness` refuses with `PeerError::Disconnected` once more
    /// than this many calls have been made.
    refuse_after: Option<usize>,
    requests: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    closed: AtomicUsize,
}

impl MockInner {
    fn total_pages(&self, hash: &H256, page: u64) -> u64 {
        if let Some(&total) = self.total_overrides.get(&page) {
            return total;
        }
        let len = self.payloads.get(hash).map_or(0, Vec::len);
        (len as u64).div_ceil(self.page_size as u64)
    }

    fn page_response(&self, request: PageRequest) -> PageReply {
        let Some(payload) = self.payloads.get(&request.hash) else {
            return PageReply::Failed(PageReplyError::CannotServe("unknown witness".into()));
        };
        let start = (request.page as usize).saturating_mul(self.page_size);
        let end = (start + self.page_size).min(payload.len());
        let slice = if start < payload.len() {
            payload[start..end].to_vec()
        } else {
            Vec::new()
        };
        PageReply::Pages(vec![PageResponse {
            hash: request.hash,
            page: request.page,
            total_pages: self.total_pages(&request.hash, request.page),
            payload: slice,
        }])
    }
}

#[derive(Clone)]
struct MockWitnessPeer {
    inner: Arc<MockInner>,
}

impl MockWitnessPeer {
    fn new(page_size: usize) -> Self {
        Self {
            inner: Arc::new(MockInner {
                payloads: HashMap::new(),
                page_size,
                latency: Duration::ZERO,
                latency_overrides: HashMap::new(),
                total_overrides: HashMap::new(),
                faults: Mutex::new(HashMap::new()),
                refuse_after: None,
                requests: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut MockInner)) -> Self {
        f(Arc::get_mut(&mut self.inner).expect("configure before sharing"));
        self
    }

    fn serve(self, hash: H256, framed: &[u8]) -> Self {
        let framed = framed.to_vec();
        self.configure(|inner| {
            inner.payloads.insert(hash, framed);
        })
    }

    fn with_latency(self, latency: Duration) -> Self {
        self.configure(|inner| inner.latency = latency)
    }

    fn with_page_latency(self, page: u64, latency: Duration) -> Self {
        self.configure(|inner| {
            inner.latency_overrides.insert(page, latency);
        })
    }

    fn with_total_override(self, page: u64, total: u64) -> Self {
        self.configure(|inner| {
            inner.total_overrides.insert(page, total);
        })
    }

    fn with_faults(self, hash: H256, page: u64, faults: Vec<MockFault>) -> Self {
        self.configure(|inner| {
            inner.faults.lock().insert((hash, page), faults);
        })
    }

    fn refuse_after(self, calls: usize) -> Self {
        self.configure(|inner| inner.refuse_after = Some(calls))
    }

    fn requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WitnessPeer for MockWitnessPeer {
    async fn request_witness(
        &self,
        request: Vec<PageRequest>,
        reply: mpsc::Sender<PageReply>,
    ) -> Result<SubRequest, PeerError> {
        let inner = Arc::clone(&self.inner);
        let calls = inner.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = inner.refuse_after {
            if calls > limit {
                return Err(PeerError::Disconnected);
            }
        }

        let (sub_request, mut cancel) = SubRequest::new();
        let page_request = request[0];

        tokio::spawn(async move {
            let now = inner.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_concurrent.fetch_max(now, Ordering::SeqCst);

            let latency = inner
                .latency_overrides
                .get(&page_request.page)
                .copied()
                .unwrap_or(inner.latency);

            let message = tokio::select! {
                _ = sleep(latency) => {
                    let fault = {
                        let mut faults = inner.faults.lock();
                        faults
                            .get_mut(&(page_request.hash, page_request.page))
                            .filter(|remaining| !remaining.is_empty())
                            .map(|remaining| remaining.remove(0))
                    };
                    match fault {
                        Some(MockFault::Error(err)) => PageReply::Failed(err),
                        Some(MockFault::EmptyPayload) => PageReply::Pages(vec![PageResponse {
                            hash: page_request.hash,
                            page: page_request.page,
                            total_pages: inner.total_pages(&page_request.hash, page_request.page),
                            payload: Vec::new(),
                        }]),
                        None => inner.page_response(page_request),
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_ok() {
                        inner.closed.fetch_add(1, Ordering::SeqCst);
                    }
                    PageReply::Cancelled
                }
            };

            inner.concurrent.fetch_sub(1, Ordering::SeqCst);
            let _ = reply.send(message).await;
        });

        Ok(sub_request)
    }

    fn id(&self) -> String {
        "mock-peer".into()
    }

    fn version(&self) -> u32 {
        1
    }
}

fn block_peer(mock: &MockWitnessPeer) -> BlockPeer<MockWitnessPeer> {
    init_tracing();
    BlockPeer::new("mock-peer", 1).with_witness(Arc::new(mock.clone()))
}

#[tokio::test]
async fn test_request_without_wit_peer_fails_synchronously() {
    init_tracing();
    let peer: BlockPeer<MockWitnessPeer> = BlockPeer::new("bare-peer", 1);
    assert!(!peer.supports_witness());

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let err = peer
        .request_witnesses(vec![hash(1)], sink_tx)
        .unwrap_err();
    assert_eq!(err, ExchangeError::NoWitnessPeer);

    // No side effects: nothing ever lands on the sink.
    assert!(timeout(Duration::from_millis(50), sink_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_single_page_happy_path() {
    let h = hash(1);
    let (witness, framed) = fixture_witness(1, 500);
    // The whole framed witness fits one page.
    let mock = MockWitnessPeer::new(framed.len() + 1).serve(h, &framed);
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert_eq!(bundle.request_id, handle.request_id());
    assert_eq!(bundle.witnesses, vec![witness]);
    assert_eq!(bundle.hashes, vec![h]);
    assert_eq!(bundle.requested, vec![h]);
    assert!(bundle.failed.is_empty());
    assert!(bundle.is_complete());

    // Exactly one sub-request for a single-page witness.
    assert_eq!(mock.requests(), 1);
}

#[tokio::test]
async fn test_three_pages_arriving_out_of_order() {
    let h = hash(1);
    let (witness, framed) = fixture_witness(2, 700);
    let page_size = framed.len().div_ceil(3);

    // Arrival order 2, 0, 1.
    let mock = MockWitnessPeer::new(page_size)
        .serve(h, &framed)
        .with_page_latency(0, Duration::from_millis(30))
        .with_page_latency(1, Duration::from_millis(60))
        .with_page_latency(2, Duration::from_millis(5));
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert_eq!(bundle.witnesses, vec![witness]);
    assert_eq!(mock.requests(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_pages_reassemble_exactly() {
    let h = hash(1);
    let (witness, framed) = fixture_witness(3, 10 * 1024);
    let total_pages = framed.len().div_ceil(200);
    assert!(total_pages > 50, "fixture should span many pages");

    let mock = MockWitnessPeer::new(200).serve(h, &framed);
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = timeout(Duration::from_secs(10), sink_rx.recv())
        .await
        .expect("batch settles")
        .expect("aggregate");
    assert_eq!(bundle.witnesses, vec![witness]);
    assert_eq!(mock.requests(), total_pages);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_in_flight_sub_requests_never_exceed_limit() {
    let h = hash(1);
    let (witness, framed) = fixture_witness(4, 10 * 1024);

    let mock = MockWitnessPeer::new(200)
        .serve(h, &framed)
        .with_latency(Duration::from_millis(50));
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = timeout(Duration::from_secs(30), sink_rx.recv())
        .await
        .expect("batch settles")
        .expect("aggregate");
    assert_eq!(bundle.witnesses, vec![witness]);
    assert_eq!(mock.max_concurrent(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_of_three_witnesses_under_concurrency_limit() {
    let hashes = vec![hash(1), hash(2), hash(3)];
    let mut fixtures = Vec::new();
    let mut mock = MockWitnessPeer::new(200).with_latency(Duration::from_millis(50));
    for (i, h) in hashes.iter().enumerate() {
        let (witness, framed) = fixture_witness(10 + i as u64, 10 * 1024);
        mock = mock.serve(*h, &framed);
        fixtures.push(witness);
    }
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let started = Instant::now();
    let _handle = peer.request_witnesses(hashes.clone(), sink_tx).unwrap();

    let bundle = timeout(Duration::from_secs(60), sink_rx.recv())
        .await
        .expect("batch settles")
        .expect("aggregate");

    assert_eq!(bundle.witnesses.len(), 3);
    assert!(bundle.is_complete());
    for (h, witness) in bundle.hashes.iter().zip(&bundle.witnesses) {
        let expected = &fixtures[hashes.iter().position(|x| x == h).unwrap()];
        assert_eq!(witness, expected);
    }

    assert_eq!(mock.max_concurrent(), 5);
    // 5 permits and 50 ms per exchange bound the batch from below.
    let min_rounds = mock.requests().div_ceil(5) as u32;
    assert!(started.elapsed() >= Duration::from_millis(50) * (min_rounds - 1));
}

#[tokio::test]
async fn test_page_failing_twice_then_succeeding() {
    let h = hash(1);
    let (witness, framed) = fixture_witness(5, 600);
    let page_size = framed.len().div_ceil(2);

    let mock = MockWitnessPeer::new(page_size)
        .serve(h, &framed)
        .with_faults(
            h,
            1,
            vec![
                MockFault::Error(PageReplyError::Transport("reset".into())),
                MockFault::Error(PageReplyError::Timeout),
            ],
        );
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert_eq!(bundle.witnesses, vec![witness]);
    // Page 0 once, page 1 three times.
    assert_eq!(mock.requests(), 4);
}

#[tokio::test]
async fn test_probe_page_failures_still_learn_total() {
    let h = hash(1);
    let (witness, framed) = fixture_witness(6, 700);
    let page_size = framed.len().div_ceil(3);

    // Page 0 carries the total; failing it twice must not stall the batch.
    let mock = MockWitnessPeer::new(page_size)
        .serve(h, &framed)
        .with_faults(
            h,
            0,
            vec![
                MockFault::Error(PageReplyError::Timeout),
                MockFault::Error(PageReplyError::Timeout),
            ],
        );
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert_eq!(bundle.witnesses, vec![witness]);
    assert_eq!(mock.requests(), 3 + 2);
}

#[tokio::test]
async fn test_page_failing_past_the_budget_abandons_witness() {
    let h = hash(1);
    let (_witness, framed) = fixture_witness(7, 600);
    let page_size = framed.len().div_ceil(2);

    let mock = MockWitnessPeer::new(page_size)
        .serve(h, &framed)
        .with_faults(
            h,
            1,
            vec![
                MockFault::Error(PageReplyError::Timeout),
                MockFault::Error(PageReplyError::Timeout),
                MockFault::Error(PageReplyError::Timeout),
            ],
        );
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert!(bundle.witnesses.is_empty());
    assert!(!bundle.is_complete());
    assert_eq!(
        bundle.failed,
        vec![(h, WitnessFailure::RetriesExhausted { page: 1 })]
    );
    // Page 0 once, page 1 to the retry ceiling.
    assert_eq!(mock.requests(), 4);
}

#[tokio::test]
async fn test_total_pages_disagreement_fails_witness() {
    let h = hash(1);
    let (_witness, framed) = fixture_witness(8, 700);
    let page_size = framed.len().div_ceil(3);

    let mock = MockWitnessPeer::new(page_size)
        .serve(h, &framed)
        .with_total_override(0, 3)
        .with_total_override(1, 4);
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert!(bundle.witnesses.is_empty());
    assert!(matches!(
        bundle.failed.as_slice(),
        [(failed_hash, WitnessFailure::Disagreement { established: 3, reported: 4 })]
            if *failed_hash == h
    ));
}

#[tokio::test]
async fn test_empty_payload_counts_as_failure_and_retries() {
    let h = hash(1);
    let (witness, framed) = fixture_witness(9, 600);
    let page_size = framed.len().div_ceil(2);

    let mock = MockWitnessPeer::new(page_size)
        .serve(h, &framed)
        .with_faults(h, 1, vec![MockFault::EmptyPayload]);
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert_eq!(bundle.witnesses, vec![witness]);
    assert_eq!(mock.requests(), 3);
}

#[tokio::test]
async fn test_cannot_serve_is_not_retried() {
    let (h_refused, h_ok) = (hash(1), hash(2));
    let (witness, framed) = fixture_witness(11, 500);

    // h_refused has no payload, so the mock answers CannotServe for it.
    let mock = MockWitnessPeer::new(framed.len() + 1).serve(h_ok, &framed);
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer
        .request_witnesses(vec![h_refused, h_ok], sink_tx)
        .unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert_eq!(bundle.witnesses, vec![witness]);
    assert_eq!(bundle.hashes, vec![h_ok]);
    assert!(matches!(
        bundle.failed.as_slice(),
        [(failed_hash, WitnessFailure::Rejected(_))] if *failed_hash == h_refused
    ));
    // One probe each; the refusal is terminal.
    assert_eq!(mock.requests(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_closes_every_outstanding_sub_request() {
    let h = hash(1);
    let (_witness, framed) = fixture_witness(12, 10 * 1024);

    let mock = MockWitnessPeer::new(200)
        .serve(h, &framed)
        .with_latency(Duration::from_millis(50));
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    // Let roughly a tenth of the pages through, then cancel.
    sleep(Duration::from_millis(120)).await;
    handle.close();
    assert!(handle.is_closed());
    // Closing again is a no-op.
    handle.close();

    // No further sub-requests are created once the cancel settles.
    sleep(Duration::from_millis(100)).await;
    let after_close = mock.requests();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.requests(), after_close);

    // Every in-flight sub-request observed its close hook.
    assert!(mock.closed() > 0, "outstanding sub-requests must be closed");

    // No aggregate is ever delivered.
    assert!(timeout(Duration::from_millis(300), sink_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_peer_refusing_sub_requests_aborts_batch() {
    let h = hash(1);
    let (_witness, framed) = fixture_witness(13, 700);
    let page_size = framed.len().div_ceil(3);

    // The probe succeeds and teaches a total of 3; every call after the
    // first is refused outright.
    let mock = MockWitnessPeer::new(page_size)
        .serve(h, &framed)
        .refuse_after(1);
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(vec![h], sink_tx).unwrap();

    // The aggregate still arrives, carrying only completed witnesses.
    let bundle = timeout(Duration::from_secs(5), sink_rx.recv())
        .await
        .expect("batch settles")
        .expect("aggregate");
    assert!(bundle.witnesses.is_empty());
    assert_eq!(bundle.requested, vec![h]);
    assert!(!bundle.is_complete());
}

#[tokio::test]
async fn test_empty_hash_list_settles_immediately() {
    let (_witness, framed) = fixture_witness(14, 300);
    let mock = MockWitnessPeer::new(framed.len() + 1);
    let peer = block_peer(&mock);

    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    let _handle = peer.request_witnesses(Vec::new(), sink_tx).unwrap();

    let bundle = sink_rx.recv().await.expect("aggregate");
    assert!(bundle.witnesses.is_empty());
    assert!(bundle.is_complete());
    assert_eq!(mock.requests(), 0);
}
