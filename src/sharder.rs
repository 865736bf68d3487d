//! Dist-test sharding: given a bag of named tests with historical durations, split the work
//! across one primary worker (which claims tests in a fixed order) and an opportunistic fleet
//! of helper workers (which claim the biggest remaining test first and greedily batch smaller
//! ones alongside it), then reassemble everything into one ordered, deduplicated log stream.
//!
//! This is deliberately modeled as a bag of independent threads of control talking through a
//! handful of small, focused primitives (`TestItem::wait_done`, a `JoinSet` of worker loops, a
//! `CancellationToken` for "every worker has gone away") rather than a single event loop, per
//! the concurrency model the rest of this crate follows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::errors::{CoordError, ExecOutcome, RemoteError, TransportError};

/// A test invocation has failed enough times that it's given up on, or a transport hiccup that
/// should simply be retried against a different worker.
enum RetryOutcome {
    Retry,
    Terminal,
}

const MAX_ITEM_RETRIES: u32 = 3;

#[derive(Default, Clone)]
struct TestItemSnapshot {
    output: Vec<u8>,
    remote_error: Option<RemoteError>,
    execution_duration: Duration,
    shard_peer_id: Option<u64>,
}

struct TestItemState {
    claimed: bool,
    done: bool,
    num_fail: u32,
    snapshot: TestItemSnapshot,
}

/// One dist-test: a canonical name (as the harness's `list` command would print it, e.g.
/// `net/http:race`), the legacy alias used by the static per-test timeout/policy tables (e.g.
/// `race`), and a historical duration used to drive the two claim disciplines below.
pub struct TestItem {
    pub name: String,
    pub legacy_alias: String,
    pub historical_duration: Duration,
    state: Mutex<TestItemState>,
    notify: Notify,
}

impl TestItem {
    pub fn new(name: impl Into<String>, historical_duration: Duration) -> Arc<Self> {
        let name = name.into();
        let legacy_alias = new_name_to_legacy(&name);
        Arc::new(Self {
            name,
            legacy_alias,
            historical_duration,
            state: Mutex::new(TestItemState {
                claimed: false,
                done: false,
                num_fail: 0,
                snapshot: TestItemSnapshot::default(),
            }),
            notify: Notify::new(),
        })
    }

    fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.done || state.claimed {
            return false;
        }
        state.claimed = true;
        true
    }

    fn mergeable_class(&self) -> Option<&'static str> {
        mergeable_class(&self.name)
    }

    fn finish(&self, output: Vec<u8>, remote_error: Option<RemoteError>, duration: Duration, shard_peer_id: Option<u64>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        state.snapshot = TestItemSnapshot {
            output,
            remote_error,
            execution_duration: duration,
            shard_peer_id,
        };
        drop(state);
        self.notify.notify_waiters();
    }

    /// Record a transport failure. Returns whether the item should be retried (left unclaimed,
    /// for someone else to pick up) or has failed terminally (timeout, or the retry cap hit).
    fn record_transport_failure(&self, err: &TransportError) -> RetryOutcome {
        let mut state = self.state.lock();
        state.num_fail += 1;
        if err.is_timeout() {
            state.done = true;
            state.snapshot = TestItemSnapshot {
                remote_error: Some(RemoteError::Other(format!(
                    "test {} timed out",
                    self.name
                ))),
                ..Default::default()
            };
            drop(state);
            self.notify.notify_waiters();
            return RetryOutcome::Terminal;
        }
        if state.num_fail >= MAX_ITEM_RETRIES {
            state.done = true;
            state.snapshot = TestItemSnapshot {
                remote_error: Some(RemoteError::Other(format!(
                    "Failed to schedule {} after {} tries",
                    self.name, state.num_fail
                ))),
                ..Default::default()
            };
            drop(state);
            self.notify.notify_waiters();
            return RetryOutcome::Terminal;
        }
        state.claimed = false;
        RetryOutcome::Retry
    }

    fn cancel_with(&self, remote_error: RemoteError) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        state.snapshot = TestItemSnapshot {
            remote_error: Some(remote_error),
            ..Default::default()
        };
        drop(state);
        self.notify.notify_waiters();
    }

    fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Wait for this item to reach a terminal state, returning its final output/error. A fresh
    /// `Notify::notified()` future is registered *before* checking the `done` flag so a
    /// completion racing with the check can never be missed (`done` is one-shot).
    async fn wait_done(&self) -> TestItemSnapshot {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if state.done {
                    return state.snapshot.clone();
                }
            }
            notified.await;
        }
    }
}

/// Outcome of one worker's attempt at a named test (or a merged batch of them).
pub struct ShardResult {
    pub output: Vec<u8>,
    pub outcome: ExecOutcome,
}

/// The narrow surface the sharder needs from a worker: run a batch of named tests and report
/// back what happened. Implemented for [`crate::buildlet::HttpWorker`]; kept as a trait so the
/// sharder can be driven against fakes in tests without a real buildlet. The sharding pipeline
/// below is generic over this trait rather than boxing it as `dyn ShardWorker`: `async fn` in a
/// trait isn't object-safe without an extra boxing crate, and production only ever shards across
/// one concrete worker type at a time anyway (mirrors `pool.rs`'s `QuotaPool<P: WorkerProvisioner>`).
#[allow(async_fn_in_trait)]
pub trait ShardWorker: Send + Sync {
    fn name(&self) -> String;
    async fn run_tests(&self, names: &[String], ct: &CancellationToken) -> ShardResult;
    fn mark_broken(&self);
}

/// Bag of [`TestItem`]s plus the two claim disciplines and the cancel-all capability described
/// in the data model. One `TestSet` is built per (non-snapshot, non-subrepo, non-benchmark)
/// build and consumed exactly once.
pub struct TestSet {
    items: Vec<Arc<TestItem>>,
    first_remote_error: Mutex<Option<RemoteError>>,
    next_peer_id: AtomicU64,
    cancel: CancellationToken,
}

impl TestSet {
    pub fn new(items: Vec<Arc<TestItem>>) -> Arc<Self> {
        Arc::new(Self {
            items,
            first_remote_error: Mutex::new(None),
            next_peer_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    pub fn total_historical_duration(&self) -> Duration {
        self.items.iter().map(|i| i.historical_duration).sum()
    }

    fn all_terminal(&self) -> bool {
        self.items.iter().all(|i| i.is_done())
    }

    /// Ordered claim: lowest-ordinal unclaimed item. Never merges; used by the primary worker.
    fn claim_ordered(&self) -> Option<Arc<TestItem>> {
        self.items.iter().find(|i| i.try_claim()).cloned()
    }

    /// Biggest-first claim with greedy adjacent merge: claim the highest-duration unclaimed
    /// item, then pull in adjacent (by input order) unclaimed items that share its mergeable
    /// class, as long as the running total stays under `budget`. Used by helper workers.
    fn claim_biggest_first(&self, budget: Duration) -> Vec<Arc<TestItem>> {
        let Some((anchor_idx, anchor)) = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| !i.is_done() && !i.state.lock().claimed)
            .max_by_key(|(_, i)| i.historical_duration)
            .map(|(idx, i)| (idx, i.clone()))
        else {
            return Vec::new();
        };
        if !anchor.try_claim() {
            // Lost a race with another helper; let the caller retry on its next iteration.
            return Vec::new();
        }
        let mut batch = vec![anchor.clone()];
        let mut total = anchor.historical_duration;
        let Some(class) = anchor.mergeable_class() else {
            return batch;
        };
        for item in &self.items[anchor_idx + 1..] {
            if item.mergeable_class() != Some(class) {
                break;
            }
            if total + item.historical_duration >= budget {
                break;
            }
            if !item.try_claim() {
                break;
            }
            total += item.historical_duration;
            batch.push(item.clone());
        }
        batch
    }

    /// Cancel the whole set: stop dispatching new work and mark every still-pending item done
    /// with a synthetic remote error, per the invariant that `done` is always raised exactly
    /// once.
    fn cancel_all(&self, reason: &str) {
        self.cancel.cancel();
        for item in &self.items {
            item.cancel_with(RemoteError::Other(reason.to_string()));
        }
    }

    fn record_first_remote_error(&self, err: RemoteError) {
        let mut slot = self.first_remote_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_first_remote_error(&self) -> Option<RemoteError> {
        self.first_remote_error.lock().clone()
    }
}

/// Only tests sharing a "known-mergeable prefix" can be batched together. `go_test`-flavored
/// invocations (the overwhelming majority of dist tests) are mergeable with each other; the
/// handful of whole-process special cases (`race`, `api`, `reboot`, `moved_goroot`, `nolibgcc:*`,
/// `test:<variant>`) are each their own singleton class and never merge with anything.
fn mergeable_class(canonical_name: &str) -> Option<&'static str> {
    match legacy_name_kind(canonical_name) {
        LegacyName::GoTest(_) => Some("go_test"),
        LegacyName::GoTestBench(_) => Some("go_test_bench"),
        _ => None,
    }
}

enum LegacyName {
    GoTest(String),
    GoTestBench(String),
    Race,
    Api,
    Reboot,
    Test(String),
    NoLibgcc(String),
    MovedGoroot,
}

impl LegacyName {
    fn render(&self) -> String {
        match self {
            LegacyName::GoTest(p) => format!("go_test:{p}"),
            LegacyName::GoTestBench(p) => format!("go_test_bench:{p}"),
            LegacyName::Race => "race".to_string(),
            LegacyName::Api => "api".to_string(),
            LegacyName::Reboot => "reboot".to_string(),
            LegacyName::Test(v) => format!("test:{v}"),
            LegacyName::NoLibgcc(p) => format!("nolibgcc:{p}"),
            LegacyName::MovedGoroot => "moved_goroot".to_string(),
        }
    }

    fn parse(legacy: &str) -> Self {
        if legacy == "race" {
            return LegacyName::Race;
        }
        if legacy == "api" {
            return LegacyName::Api;
        }
        if legacy == "reboot" {
            return LegacyName::Reboot;
        }
        if legacy == "moved_goroot" {
            return LegacyName::MovedGoroot;
        }
        if let Some(pkg) = legacy.strip_prefix("go_test_bench:") {
            return LegacyName::GoTestBench(pkg.to_string());
        }
        if let Some(pkg) = legacy.strip_prefix("go_test:") {
            return LegacyName::GoTest(pkg.to_string());
        }
        if let Some(pkg) = legacy.strip_prefix("nolibgcc:") {
            return LegacyName::NoLibgcc(pkg.to_string());
        }
        if let Some(variant) = legacy.strip_prefix("test:") {
            return LegacyName::Test(variant.to_string());
        }
        // Anything else (shouldn't occur for a real harness) is treated as an un-prefixed
        // go_test invocation, mirroring the "falls back to go_test:<pkg>" rule for new names
        // with no recognized variant.
        LegacyName::GoTest(legacy.to_string())
    }

    /// The canonical `pkg[:variant]` new-style name this legacy name maps to.
    fn to_canonical(&self) -> String {
        match self {
            LegacyName::GoTest(p) => p.clone(),
            LegacyName::GoTestBench(p) => format!("{p}:racebench"),
            LegacyName::Race => ":race".to_string(),
            LegacyName::Api => ":api".to_string(),
            LegacyName::Reboot => ":reboot".to_string(),
            LegacyName::Test(v) => format!(":{v}"),
            LegacyName::NoLibgcc(p) => format!("{p}:nolibgcc"),
            LegacyName::MovedGoroot => ":moved_goroot".to_string(),
        }
    }
}

fn legacy_name_kind(canonical_name: &str) -> LegacyName {
    let (pkg, variant) = match canonical_name.split_once(':') {
        Some((p, v)) => (p, Some(v)),
        None => (canonical_name, None),
    };
    match variant {
        Some("race") => LegacyName::Race,
        Some("api") => LegacyName::Api,
        Some("reboot") => LegacyName::Reboot,
        Some("moved_goroot") => LegacyName::MovedGoroot,
        Some("racebench") => LegacyName::GoTestBench(pkg.to_string()),
        Some("nolibgcc") => LegacyName::NoLibgcc(pkg.to_string()),
        Some(other) => LegacyName::Test(other.to_string()),
        None => LegacyName::GoTest(pkg.to_string()),
    }
}

/// Translate a harness `list`-style canonical name (`pkg[:variant]`) into the legacy alias used
/// by static per-test policy tables.
pub fn new_name_to_legacy(canonical_name: &str) -> String {
    legacy_name_kind(canonical_name).render()
}

/// Translate a legacy alias back into the canonical `pkg[:variant]` name. The inverse of
/// [`new_name_to_legacy`]; the two round-trip for every legacy name listed in the spec.
pub fn legacy_to_new_name(legacy: &str) -> String {
    LegacyName::parse(legacy).to_canonical()
}

const MARKER: &str = "#####";

/// Find one `#####:<title>\n` marker line at the start of `input`. Returns the title and
/// whatever follows the newline. A marker prefix with no following newline is not a recognized
/// marker (per the spec's "missing newline" illegal-input case).
fn take_marker_line(input: &[u8]) -> Option<(String, &[u8])> {
    let rest = input.strip_prefix(format!("{MARKER}:").as_bytes())?;
    let nl = rest.iter().position(|&b| b == b'\n')?;
    let title = String::from_utf8_lossy(&rest[..nl]).into_owned();
    Some((title, &rest[nl + 1..]))
}

/// Parse one test's raw captured output into an optional metadata banner, an optional header
/// banner, and the remaining body. Two consecutive marker lines are metadata-then-header; a
/// single marker line is just the header; no recognized marker leaves everything in `body`
/// verbatim.
pub fn parse_output_and_header(input: &[u8]) -> (Option<String>, Option<String>, Vec<u8>) {
    let Some((first, rest1)) = take_marker_line(input) else {
        return (None, None, input.to_vec());
    };
    if let Some((second, rest2)) = take_marker_line(rest1) {
        (Some(first), Some(second), rest2.to_vec())
    } else {
        (None, Some(first), rest1.to_vec())
    }
}

/// Re-serialize a (metadata, header, body) triple produced by [`parse_output_and_header`] (or
/// about to be fed to it) back into one byte stream.
pub fn serialize_output_and_header(
    metadata: Option<&str>,
    header: Option<&str>,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(m) = metadata {
        out.extend_from_slice(format!("{MARKER}:{m}\n").as_bytes());
    }
    if let Some(h) = header {
        out.extend_from_slice(format!("{MARKER}:{h}\n").as_bytes());
    }
    out.extend_from_slice(body);
    out
}

/// Rewrite a harness-internal marker title into the human-readable banner emitted into the
/// aggregate log.
fn human_banner(title: &str) -> String {
    format!("--- {title} ---\n")
}

async fn run_batch<W: ShardWorker>(
    test_set: &TestSet,
    worker: &W,
    batch: Vec<Arc<TestItem>>,
    ct: &CancellationToken,
) {
    if batch.is_empty() {
        return;
    }
    let names: Vec<String> = batch.iter().map(|i| i.name.clone()).collect();
    let start = Instant::now();
    let result = worker.run_tests(&names, ct).await;
    let elapsed = start.elapsed();

    if let Some(transport) = result.outcome.transport {
        worker.mark_broken();
        for item in &batch {
            item.record_transport_failure(&transport);
        }
        return;
    }

    let shard_peer_id = if batch.len() > 1 {
        Some(test_set.next_peer_id.fetch_add(1, Ordering::SeqCst))
    } else {
        None
    };
    let remote = result.outcome.remote;
    batch[0].finish(result.output, remote.clone(), elapsed, shard_peer_id);
    for item in &batch[1..] {
        item.finish(Vec::new(), None, Duration::ZERO, shard_peer_id);
    }
    if let Some(remote) = remote {
        test_set.record_first_remote_error(remote.clone());
        test_set.cancel_all(&format!("test set canceled after remote failure: {remote}"));
    }
}

/// Primary worker loop: claims tests in input order, one at a time, never merging. Runs until
/// the test set is exhausted, the context is canceled, or the worker is marked broken.
async fn primary_loop<W: ShardWorker + 'static>(test_set: Arc<TestSet>, worker: Arc<W>, ct: CancellationToken) {
    loop {
        if ct.is_cancelled() || test_set.all_terminal() {
            return;
        }
        match test_set.claim_ordered() {
            Some(item) => {
                run_batch(&test_set, worker.as_ref(), vec![item], &ct).await;
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = ct.cancelled() => return,
                }
            }
        }
    }
}

/// Helper worker loop: claims the biggest remaining test (plus whatever mergeable neighbours
/// fit under `shard_budget`) and runs them as one batched invocation.
async fn helper_loop<W: ShardWorker + 'static>(
    test_set: Arc<TestSet>,
    worker: Arc<W>,
    shard_budget: Duration,
    ct: CancellationToken,
) {
    loop {
        if ct.is_cancelled() || test_set.all_terminal() {
            return;
        }
        let batch = test_set.claim_biggest_first(shard_budget);
        if batch.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = ct.cancelled() => return,
            }
            continue;
        }
        run_batch(&test_set, worker.as_ref(), batch, &ct).await;
    }
}

/// Run the whole sharding pipeline: spawn the primary loop, spawn one helper loop per worker
/// that arrives on `helpers`, and drive a consumer that emits deduplicated, ordered output to
/// `out`. Returns the test set's first remote error (if any), a `BuildletsGone`-flavored
/// transport error if every worker exited while items were still pending, or `Ok(())`.
pub async fn run(
    test_set: Arc<TestSet>,
    primary: Arc<dyn ShardWorker>,
    mut helpers: mpsc::Receiver<Arc<dyn ShardWorker>>,
    shard_budget: Duration,
    mut out: impl AsyncWrite + Unpin,
    ct: CancellationToken,
) -> Result<(), CoordError> {
    let mut workers = tokio::task::JoinSet::new();
    {
        let ts = test_set.clone();
        let p = primary.clone();
        let wct = ct.clone();
        workers.spawn(async move { primary_loop(ts, p, wct).await });
    }

    let workers_gone = CancellationToken::new();
    let sentinel_ts = test_set.clone();
    let sentinel_ct = ct.clone();
    let sentinel_gone = workers_gone.clone();
    let sentinel = tokio::spawn(async move {
        let mut helpers_open = true;
        loop {
            if !helpers_open && workers.is_empty() {
                break;
            }
            tokio::select! {
                maybe_helper = helpers.recv(), if helpers_open => {
                    match maybe_helper {
                        Some(h) => {
                            let ts = sentinel_ts.clone();
                            let wct = sentinel_ct.clone();
                            workers.spawn(async move { helper_loop(ts, h, shard_budget, wct).await });
                        }
                        None => helpers_open = false,
                    }
                }
                joined = workers.join_next(), if !workers.is_empty() => {
                    let _ = joined;
                }
            }
        }
        sentinel_gone.cancel();
    });

    let consume_result = consume(&test_set, &mut out, &workers_gone).await;
    ct.cancel();
    let _ = sentinel.await;

    match consume_result {
        Err(e) => Err(e),
        Ok(()) => match test_set.take_first_remote_error() {
            Some(remote) => Err(CoordError::Remote(remote)),
            None => Ok(()),
        },
    }
}

/// Consumer loop: iterate items in input order (not execution order, per the ordering
/// guarantee), wait for each to finish, and emit its output with header/metadata banners
/// deduplicated against whatever was last emitted.
async fn consume(
    test_set: &TestSet,
    out: &mut (impl AsyncWrite + Unpin),
    workers_gone: &CancellationToken,
) -> Result<(), CoordError> {
    let mut last_metadata: Option<String> = None;
    let mut last_header: Option<String> = None;
    for item in &test_set.items {
        let snapshot = tokio::select! {
            snap = item.wait_done() => snap,
            _ = workers_gone.cancelled() => {
                if item.is_done() {
                    item.wait_done().await
                } else {
                    return Err(CoordError::Transport(TransportError::PoolGone));
                }
            }
        };
        if !snapshot.output.is_empty() {
            let (metadata, header, body) = parse_output_and_header(&snapshot.output);
            if metadata.is_some() && metadata != last_metadata {
                let _ = out.write_all(human_banner(metadata.as_deref().unwrap()).as_bytes()).await;
                last_metadata = metadata;
            }
            if header.is_some() && header != last_header {
                let _ = out.write_all(human_banner(header.as_deref().unwrap()).as_bytes()).await;
                last_header = header;
            }
            let _ = out.write_all(&body).await;
        }
    }
    Ok(())
}

/// Build the initial [`TestSet`] for a normal (non-subrepo, non-benchmark) build from the
/// harness's `list` output and a historical-duration lookup (missing entries default to a
/// conservative estimate so new tests still get scheduled promptly).
pub fn build_test_set(
    listed_names: Vec<String>,
    historical_durations: &HashMap<String, Duration>,
    default_duration: Duration,
) -> Arc<TestSet> {
    let items = listed_names
        .into_iter()
        .map(|name| {
            let dur = historical_durations
                .get(&name)
                .copied()
                .unwrap_or(default_duration);
            TestItem::new(name, dur)
        })
        .collect();
    TestSet::new(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeWorker {
        name: String,
        broken: std::sync::atomic::AtomicBool,
        script: Mutex<Vec<ExecOutcome>>,
        calls: AtomicUsize,
    }

    impl FakeWorker {
        fn new(name: &str, script: Vec<ExecOutcome>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                broken: std::sync::atomic::AtomicBool::new(false),
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ShardWorker for FakeWorker {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn run_tests(&self, names: &[String], _ct: &CancellationToken) -> ShardResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut script = self.script.lock();
                if script.is_empty() {
                    ExecOutcome::ok()
                } else {
                    script.remove(0)
                }
            };
            ShardResult {
                output: format!("#####:{}\n ran ok\n", names.join(",")).into_bytes(),
                outcome,
            }
        }

        fn mark_broken(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn name_remap_round_trips() {
        for legacy in [
            "go_test:net/http",
            "go_test_bench:net/http",
            "race",
            "api",
            "reboot",
            "test:somevariant",
            "nolibgcc:runtime",
            "moved_goroot",
        ] {
            let canonical = legacy_to_new_name(legacy);
            let back = new_name_to_legacy(&canonical);
            assert_eq!(back, legacy, "round trip for {legacy}");
        }
    }

    #[test]
    fn output_parse_round_trips_for_legal_input() {
        let serialized = serialize_output_and_header(Some("env"), Some("net/http"), b"PASS\n");
        let (metadata, header, body) = parse_output_and_header(&serialized);
        assert_eq!(metadata.as_deref(), Some("env"));
        assert_eq!(header.as_deref(), Some("net/http"));
        assert_eq!(body, b"PASS\n");
    }

    #[test]
    fn output_parse_header_only() {
        let serialized = serialize_output_and_header(None, Some("net/http"), b"PASS\n");
        let (metadata, header, body) = parse_output_and_header(&serialized);
        assert_eq!(metadata, None);
        assert_eq!(header.as_deref(), Some("net/http"));
        assert_eq!(body, b"PASS\n");
    }

    #[test]
    fn output_parse_illegal_input_is_verbatim() {
        let input = b"no markers here, just output\n";
        let (metadata, header, body) = parse_output_and_header(input);
        assert_eq!(metadata, None);
        assert_eq!(header, None);
        assert_eq!(body, input);

        let truncated = format!("{MARKER}:no trailing newline");
        let (metadata, header, body) = parse_output_and_header(truncated.as_bytes());
        assert_eq!(metadata, None);
        assert_eq!(header, None);
        assert_eq!(body, truncated.as_bytes());
    }

    #[test]
    fn claim_ordered_is_singleton_and_in_order() {
        let items = vec![
            TestItem::new("a", Duration::from_secs(1)),
            TestItem::new("b", Duration::from_secs(100)),
        ];
        let ts = TestSet::new(items);
        let first = ts.claim_ordered().unwrap();
        assert_eq!(first.name, "a");
        let second = ts.claim_ordered().unwrap();
        assert_eq!(second.name, "b");
        assert!(ts.claim_ordered().is_none());
    }

    #[test]
    fn claim_biggest_first_merges_under_budget() {
        let items = vec![
            TestItem::new("pkg1", Duration::from_secs(50)),
            TestItem::new("pkg2", Duration::from_secs(10)),
            TestItem::new("pkg3", Duration::from_secs(10)),
            TestItem::new(":race", Duration::from_secs(5)),
        ];
        let ts = TestSet::new(items);
        let batch = ts.claim_biggest_first(Duration::from_secs(65));
        let names: Vec<_> = batch.iter().map(|i| i.name.clone()).collect();
        assert_eq!(names, vec!["pkg1", "pkg2", "pkg3"]);

        // The singleton (non-mergeable) item never merges even when it would otherwise fit.
        let batch2 = ts.claim_biggest_first(Duration::from_secs(65));
        let names2: Vec<_> = batch2.iter().map(|i| i.name.clone()).collect();
        assert_eq!(names2, vec![":race"]);
    }

    #[tokio::test]
    async fn retry_then_fail_after_three_transport_errors() {
        let item = TestItem::new("flaky", Duration::from_secs(1));
        let ts = TestSet::new(vec![item.clone()]);
        for _ in 0..2 {
            let outcome = item.record_transport_failure(&TransportError::Io("boom".into()));
            assert!(matches!(outcome, RetryOutcome::Retry));
            assert!(!item.is_done());
        }
        let outcome = item.record_transport_failure(&TransportError::Io("boom".into()));
        assert!(matches!(outcome, RetryOutcome::Terminal));
        assert!(item.is_done());
        let snap = item.wait_done().await;
        assert!(snap
            .remote_error
            .unwrap()
            .to_string()
            .contains("Failed to schedule flaky after 3 tries"));
        let _ = ts;
    }

    #[tokio::test]
    async fn timeout_fails_immediately_without_retry() {
        let item = TestItem::new("slow", Duration::from_secs(1));
        let outcome = item.record_transport_failure(&TransportError::Timeout(Duration::from_secs(30)));
        assert!(matches!(outcome, RetryOutcome::Terminal));
        let snap = item.wait_done().await;
        assert!(snap.remote_error.unwrap().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn sharding_runs_primary_and_helper_and_emits_ordered_output() {
        let items = vec![
            TestItem::new("go_test:alpha", Duration::from_secs(1)),
            TestItem::new("go_test:beta", Duration::from_secs(50)),
        ];
        let test_set = TestSet::new(items);

        let primary = FakeWorker::new("primary", vec![]);
        let helper = FakeWorker::new("helper", vec![]);
        let (tx, rx) = mpsc::channel(4);
        tx.send(helper.clone()).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        let ct = CancellationToken::new();
        let result = run(test_set, primary, rx, Duration::from_secs(120), &mut out, ct).await;
        assert!(result.is_ok(), "{result:?}");
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("go_test:alpha"));
        assert!(text.contains("go_test:beta"));
    }

    #[tokio::test]
    async fn remote_failure_cancels_the_set_and_is_surfaced() {
        let items = vec![
            TestItem::new("go_test:alpha", Duration::from_secs(1)),
            TestItem::new("go_test:beta", Duration::from_secs(1)),
        ];
        let test_set = TestSet::new(items);
        let primary = FakeWorker::new(
            "primary",
            vec![ExecOutcome::from_remote(RemoteError::NonZeroExit {
                code: 1,
                detail: "boom".into(),
            })],
        );
        let (_tx, rx) = mpsc::channel(1);
        let mut out = Vec::new();
        let ct = CancellationToken::new();
        let result = run(test_set, primary, rx, Duration::from_secs(120), &mut out, ct).await;
        assert!(matches!(result, Err(CoordError::Remote(_))));
    }
}
