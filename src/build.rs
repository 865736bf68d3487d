//! The per-build state machine: dep-check, acquire a worker, materialize toolchain and source,
//! run the build harness, then dispatch to whichever post-make mode the builder configuration
//! calls for (normal sharded tests, subrepo, cross-compile-only, or benchmark), and finally
//! record the outcome. One `BuildDriver::run` call drives exactly one `Build` from construction
//! to its terminal state.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buildlet::{ExecOpts, HttpWorker};
use crate::config::{BuildConfig, CoordinatorConfig};
use crate::dashboard::{BuildRecord, Dashboard, ErrorReporter};
use crate::errors::{CoordError, RemoteError, TransportError};
use crate::git::{AncestryService, CommitHash, SourceCache};
use crate::scheduler::{PriorityClass, Scheduler, WorkItem};
use crate::sharder::{self, ShardResult, ShardWorker, TestSet};
use crate::snapshot::{SnapshotRef, SnapshotStore};

/// How many helper workers a normal-mode build will opportunistically try to acquire before
/// giving up and running on the primary alone.
const HELPER_FANOUT: usize = 2;
/// How long a single helper-acquisition attempt is allowed to block before we stop waiting for
/// more and proceed with whatever we already have.
const HELPER_ACQUIRE_BUDGET: Duration = Duration::from_secs(3);
const SNAPSHOT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_TEST_DURATION: Duration = Duration::from_secs(30);

/// Immutable identity of one unit of work.
#[derive(Debug, Clone)]
pub struct BuildKey {
    pub primary_revision: CommitHash,
    pub secondary_revision: Option<CommitHash>,
    pub builder_name: String,
}

/// The commit metadata that rides alongside a [`BuildKey`], used for scheduling and for the
/// dashboard record.
#[derive(Debug, Clone)]
pub struct CommitDetail {
    pub primary_branch: String,
    pub primary_commit_time: u64,
    pub secondary_branch: Option<String>,
    pub secondary_commit_time: Option<u64>,
    pub submitter_email: String,
}

/// One build request as submitted to a [`BuildDriver`].
pub struct BuildRequest {
    pub key: BuildKey,
    pub detail: CommitDetail,
    pub priority: PriorityClass,
}

/// An append-only record on a build's timeline. A handful of names are contractual (see module
/// docs on `crate::sharder` and SPEC §6): `using_buildlet`, `discovering_tests`,
/// `starting_tests`, `tests_complete`, `all_tests_passed`, `done`, `skipped_build_missing_dep`,
/// among others.
#[derive(Debug, Clone)]
pub struct Event {
    pub time: Instant,
    pub name: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

struct LogInner {
    buf: Vec<u8>,
    closed: bool,
}

/// The build's append-only log: writers append, readers can snapshot at any time. Writes after
/// `close()` are silently dropped, matching the invariant that canceling a build stops further
/// bytes from reaching the log.
struct LogBuffer {
    inner: Mutex<LogInner>,
}

impl LogBuffer {
    fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                buf: Vec::new(),
                closed: false,
            }),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().buf.clone()
    }

    fn close(&self) {
        self.inner.lock().closed = true;
    }
}

/// A cheap writable handle onto a shared [`LogBuffer`], for passing into `HttpWorker::exec` and
/// `sharder::run` without giving up the build's own reference.
#[derive(Clone)]
struct LogWriter(Arc<LogBuffer>);

impl AsyncWrite for LogWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.0.inner.lock();
        if !inner.closed {
            inner.buf.extend_from_slice(buf);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct BuildState {
    events: Vec<Event>,
    status: BuildStatus,
    worker: Option<HttpWorker>,
    host_type: Option<String>,
    done_time: Option<Instant>,
}

/// A live build. Its mutable fields are serialized by a single lock, per the concurrency model;
/// the log buffer serializes itself separately so streaming writers and readers don't contend on
/// the same lock as event bookkeeping.
pub struct Build {
    state: Mutex<BuildState>,
    log: Arc<LogBuffer>,
    start_time: Instant,
    ct: CancellationToken,
}

/// The terminal result of driving a [`Build`] to completion.
pub struct BuildOutcome {
    pub status: BuildStatus,
    pub events: Vec<Event>,
    pub log: Vec<u8>,
    pub elapsed: Duration,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }
}

impl Build {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BuildState {
                events: Vec::new(),
                status: BuildStatus::Running,
                worker: None,
                host_type: None,
                done_time: None,
            }),
            log: Arc::new(LogBuffer::new()),
            start_time: Instant::now(),
            ct: CancellationToken::new(),
        })
    }

    fn log_writer(&self) -> LogWriter {
        LogWriter(self.log.clone())
    }

    /// Append an event, unless the build has already reached a terminal state -- after
    /// cancellation, no further event may be appended.
    fn push_event(&self, name: &str, detail: Option<String>) {
        let mut state = self.state.lock();
        if state.status != BuildStatus::Running {
            return;
        }
        state.events.push(Event {
            time: Instant::now(),
            name: name.to_string(),
            detail,
        });
    }

    fn set_worker(&self, host_type: String, worker: HttpWorker) {
        let mut state = self.state.lock();
        state.host_type = Some(host_type);
        state.worker = Some(worker);
    }

    /// Force-close the in-flight worker connection (if any) so a wedged exec unblocks, per the
    /// cancellation contract.
    async fn cancel(&self) {
        self.ct.cancel();
        self.log.close();
        let worker = self.state.lock().worker.clone();
        if let Some(worker) = worker {
            worker.close().await;
        }
    }

    /// Move the build to a terminal status and return its outcome. Idempotent in the sense that
    /// calling it twice just returns the state as it was left after the first call; callers are
    /// expected to call it exactly once, at the end of `BuildDriver::run`.
    fn finish(&self, status: BuildStatus) -> BuildOutcome {
        let mut state = self.state.lock();
        if state.status == BuildStatus::Running {
            state.status = status;
        }
        let done_time = *state.done_time.get_or_insert_with(Instant::now);
        let events = state.events.clone();
        let final_status = state.status;
        drop(state);
        self.log.close();
        BuildOutcome {
            status: final_status,
            events,
            log: self.log.snapshot(),
            elapsed: done_time.duration_since(self.start_time),
        }
    }
}

/// The external collaborators a [`BuildDriver`] depends on, grouped for convenience. Generic
/// over each collaborator's concrete type (rather than `dyn Trait`) because every trait here uses
/// `async fn` in its definition, which isn't object-safe; this mirrors how `pool.rs` keeps
/// `QuotaPool` generic over `WorkerProvisioner` instead of boxing it.
pub struct BuildDriver<A, S, D, ST, ER>
where
    A: AncestryService + 'static,
    S: SourceCache + 'static,
    D: Dashboard + 'static,
    ST: SnapshotStore + 'static,
    ER: ErrorReporter + 'static,
{
    pub config: Arc<CoordinatorConfig>,
    pub scheduler: Arc<Scheduler>,
    pub ancestry: Arc<A>,
    pub source: Arc<S>,
    pub dashboard: Arc<D>,
    pub snapshots: Arc<ST>,
    pub error_reporter: Arc<ER>,
    pub historical_durations: HashMap<String, Duration>,
}

impl<A, S, D, ST, ER> BuildDriver<A, S, D, ST, ER>
where
    A: AncestryService + 'static,
    S: SourceCache + 'static,
    D: Dashboard + 'static,
    ST: SnapshotStore + 'static,
    ER: ErrorReporter + 'static,
{
    /// Drive one build to completion. Never panics on a collaborator failure; every error path
    /// ends in a `BuildOutcome` with the appropriate terminal status.
    pub async fn run(&self, req: BuildRequest) -> BuildOutcome {
        let build_config = match self.config.builder(&req.key.builder_name) {
            Ok(c) => c.clone(),
            Err(e) => {
                let build = Build::new();
                build.push_event("skipped_build_missing_dep", Some(e.to_string()));
                return build.finish(BuildStatus::Failed);
            }
        };
        let build = Build::new();

        if let Some(outcome) = self.run_dep_check(&build, &req, &build_config).await {
            return outcome;
        }

        build.push_event("get_buildlet", None);
        let worker = match self
            .scheduler
            .acquire(
                WorkItem {
                    host_type: build_config.host_type.clone(),
                    priority: req.priority,
                    commit_time: req.detail.primary_commit_time,
                    branch: req.detail.primary_branch.clone(),
                    submitter_email: req.detail.submitter_email.clone(),
                },
                build.ct.clone(),
            )
            .await
        {
            Ok(w) => w,
            Err(CoordError::Canceled) => return build.finish(BuildStatus::Canceled),
            Err(e) => {
                self.error_reporter
                    .report(&req.key.builder_name, &req.key.primary_revision, &e.to_string())
                    .await;
                return self.maybe_record(&req, &build_config, build.finish(BuildStatus::Failed)).await;
            }
        };
        build.set_worker(build_config.host_type.clone(), worker.clone());
        build.push_event("using_buildlet", None);

        let outcome = self.run_body(&build, &req, &build_config, &worker).await;
        worker.close().await;
        self.scheduler.release(&build_config.host_type, &worker).await;

        match outcome {
            Ok(()) => self.maybe_record(&req, &build_config, build.finish(BuildStatus::Succeeded)).await,
            Err(CoordError::Canceled) => build.finish(BuildStatus::Canceled),
            Err(e) => {
                let e = if self.config.is_flaky(&req.key.builder_name) {
                    e.promote_transport_to_remote()
                } else {
                    e
                };
                self.error_reporter
                    .report(&req.key.builder_name, &req.key.primary_revision, &e.to_string())
                    .await;
                build.push_event("build_failed", Some(e.to_string()));
                self.maybe_record(&req, &build_config, build.finish(BuildStatus::Failed)).await
            }
        }
    }

    /// Ask the ancestry service about each declared dependency, retrying transient failures.
    /// Returns `Some(outcome)` if the build is already finished (either skipped, or failed before
    /// a worker was ever acquired); `None` if every dependency check passed and the caller should
    /// continue to worker acquisition.
    async fn run_dep_check(
        &self,
        build: &Arc<Build>,
        req: &BuildRequest,
        build_config: &BuildConfig,
    ) -> Option<BuildOutcome> {
        for dep in &build_config.go_deps {
            match self
                .check_dep_with_retries(&req.key.primary_revision, &CommitHash::new(dep.clone()))
                .await
            {
                Ok(true) => continue,
                Ok(false) => {
                    build.push_event("skipped_build_missing_dep", Some(dep.clone()));
                    // Deliberately no dashboard record and no worker: the commit simply predates
                    // this requirement, which isn't a failure of anything.
                    return Some(build.finish(BuildStatus::Succeeded));
                }
                Err(e) => {
                    self.error_reporter
                        .report(&req.key.builder_name, &req.key.primary_revision, &e.to_string())
                        .await;
                    return Some(build.finish(BuildStatus::Failed));
                }
            }
        }
        None
    }

    async fn check_dep_with_retries(
        &self,
        primary: &CommitHash,
        dep: &CommitHash,
    ) -> Result<bool, TransportError> {
        let mut last_err = None;
        for attempt in 0..self.config.dep_check_retries {
            match self.ancestry.is_ancestor(dep, primary).await {
                Ok(has) => return Ok(has),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < self.config.dep_check_retries {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::Io("dep check never ran".to_string())))
    }

    /// Materialize, make, and dispatch to the appropriate post-make mode. On success returns
    /// `Ok(())` with the build's log already containing everything produced along the way.
    async fn run_body(
        &self,
        build: &Arc<Build>,
        req: &BuildRequest,
        build_config: &BuildConfig,
        worker: &HttpWorker,
    ) -> Result<(), CoordError> {
        let used_snapshot = self.materialize(req, build_config, worker).await?;

        if !used_snapshot {
            self.make(build, build_config, worker).await?;
            if !build_config.skip_snapshot {
                self.upload_snapshot(req, build_config, worker).await;
            }
        }

        if build_config.run_bench {
            self.run_benchmark_mode(build, req, build_config, worker).await
        } else if let (Some(secondary), Some(import_path)) =
            (&req.key.secondary_revision, &build_config.secondary_repo)
        {
            self.run_subrepo_mode(build, secondary, import_path, worker).await
        } else if build_config.cross_compile_only {
            self.run_cross_compile_only(build, build_config, worker).await
        } else {
            self.run_normal_mode(build, build_config, worker).await
        }
    }

    /// Returns `true` if a cached snapshot was used (skipping `make` entirely).
    async fn materialize(
        &self,
        req: &BuildRequest,
        build_config: &BuildConfig,
        worker: &HttpWorker,
    ) -> Result<bool, CoordError> {
        if !build_config.skip_snapshot {
            let key = SnapshotRef::new(req.key.builder_name.clone(), req.key.primary_revision.clone());
            if let Some(tar_gz) = self.snapshots.get(&key).await? {
                worker.put_tar(tar_gz, Some("go")).await?;
                return Ok(true);
            }
        }

        let host_config = self.config.host_type(&build_config.host_type)?;
        let source_fut = self.source.fetch_source_tar_gz(&req.key.primary_revision);
        let bootstrap_url = host_config.bootstrap_toolchain_url.clone();
        let bootstrap_fut = async {
            match &bootstrap_url {
                Some(url) => worker.put_tar_from_url(url, Some("go1.4")).await,
                None => Ok(()),
            }
        };
        let (source, ()) = tokio::try_join!(
            async { source_fut.await.map_err(CoordError::from) },
            async { bootstrap_fut.await.map_err(CoordError::from) },
        )?;
        worker.put_tar(Bytes::from(source), Some("go")).await?;
        Ok(false)
    }

    async fn make(
        &self,
        build: &Arc<Build>,
        build_config: &BuildConfig,
        worker: &HttpWorker,
    ) -> Result<(), CoordError> {
        build.push_event("make_and_test", None);
        let (program, args) = if build_config.goos == "windows" {
            ("cmd".to_string(), vec!["/c".to_string(), "make.bat".to_string()])
        } else {
            ("bash".to_string(), vec!["make.bash".to_string()])
        };
        let opts = ExecOpts {
            args,
            working_dir: Some("go/src".to_string()),
            env: exec_env(build_config),
            ..Default::default()
        };
        let outcome = worker.exec(&program, &opts, build.log_writer(), &build.ct).await;
        if let Some(remote) = &outcome.remote {
            build.push_event("build_failed", Some(remote.to_string()));
        }
        outcome.into_result()
    }

    async fn upload_snapshot(&self, req: &BuildRequest, build_config: &BuildConfig, worker: &HttpWorker) {
        let is_reverse = matches!(
            self.config.host_type(&build_config.host_type),
            Ok(h) if h.pool_kind == crate::config::PoolKind::Reverse
        );
        let timeout = if is_reverse {
            SNAPSHOT_UPLOAD_TIMEOUT * 3
        } else {
            SNAPSHOT_UPLOAD_TIMEOUT
        };
        let Ok(tar_gz) = worker.get_tar("go").await else {
            return;
        };
        let key = SnapshotRef::new(req.key.builder_name.clone(), req.key.primary_revision.clone());
        let _ = tokio::time::timeout(timeout, self.snapshots.put(&key, tar_gz)).await;
    }

    async fn run_cross_compile_only(
        &self,
        build: &Arc<Build>,
        build_config: &BuildConfig,
        worker: &HttpWorker,
    ) -> Result<(), CoordError> {
        build.push_event("discovering_tests", None);
        let opts = ExecOpts {
            args: vec![
                "tool".to_string(),
                "dist".to_string(),
                "test".to_string(),
                "-compile-only".to_string(),
            ],
            working_dir: Some("go/src".to_string()),
            env: exec_env(build_config),
            path: Some(go_bin_path(worker).await?),
            ..Default::default()
        };
        build.push_event("starting_tests", None);
        let outcome = worker.exec("go", &opts, build.log_writer(), &build.ct).await;
        let result = outcome.into_result();
        if result.is_ok() {
            build.push_event("all_tests_passed", None);
        }
        build.push_event("tests_complete", None);
        result
    }

    async fn run_normal_mode(
        &self,
        build: &Arc<Build>,
        build_config: &BuildConfig,
        worker: &HttpWorker,
    ) -> Result<(), CoordError> {
        build.push_event("discovering_tests", None);
        let names = self.list_dist_tests(build, build_config, worker).await?;
        let test_set = sharder::build_test_set(names, &self.historical_durations, DEFAULT_TEST_DURATION);

        build.push_event("starting_helpers", None);
        let (tx, rx) = mpsc::channel::<Arc<dyn ShardWorker>>(HELPER_FANOUT.max(1));
        let mut helpers: Vec<HttpWorker> = Vec::new();
        for _ in 0..HELPER_FANOUT {
            let ticket = self.scheduler.acquire(
                WorkItem {
                    host_type: build_config.host_type.clone(),
                    priority: PriorityClass::Gomote,
                    commit_time: req.detail.primary_commit_time,
                    branch: String::new(),
                    submitter_email: String::new(),
                },
                build.ct.clone(),
            );
            match tokio::time::timeout(HELPER_ACQUIRE_BUDGET, ticket).await {
                Ok(Ok(helper)) => {
                    build.push_event("test_helper_set_up", Some(helper.name().to_string()));
                    let _ = tx.send(Arc::new(helper.clone())).await;
                    helpers.push(helper);
                }
                _ => break,
            }
        }
        if helpers.is_empty() {
            build.push_event("got_empty_test_helper", None);
        }
        drop(tx);

        build.push_event("starting_tests", None);
        let primary: Arc<dyn ShardWorker> = Arc::new(worker.clone());
        let result = sharder::run(
            test_set,
            primary,
            rx,
            Duration::from_secs(self.config.shard_budget_s),
            build.log_writer(),
            build.ct.clone(),
        )
        .await;

        for helper in &helpers {
            helper.close().await;
            self.scheduler.release(&build_config.host_type, helper).await;
            build.push_event("closed_helper", Some(helper.name().to_string()));
        }

        build.push_event("tests_complete", None);
        if result.is_ok() {
            build.push_event("all_tests_passed", None);
        }
        result
    }

    async fn list_dist_tests(
        &self,
        build: &Arc<Build>,
        build_config: &BuildConfig,
        worker: &HttpWorker,
    ) -> Result<Vec<String>, CoordError> {
        let opts = ExecOpts {
            args: vec!["tool".to_string(), "dist".to_string(), "test".to_string(), "-list".to_string()],
            working_dir: Some("go/src".to_string()),
            env: exec_env(build_config),
            path: Some(go_bin_path(worker).await?),
            ..Default::default()
        };
        let mut out = Vec::new();
        let outcome = worker.exec("go", &opts, &mut out, &build.ct).await;
        outcome.into_result()?;
        Ok(out
            .split(|&b| b == b'\n')
            .filter_map(|line| {
                let s = String::from_utf8_lossy(line).trim().to_string();
                if s.is_empty() {
                    None
                } else {
                    Some(s)
                }
            })
            .collect())
    }

    async fn run_subrepo_mode(
        &self,
        build: &Arc<Build>,
        secondary_revision: &CommitHash,
        import_path: &str,
        worker: &HttpWorker,
    ) -> Result<(), CoordError> {
        let root = format!("gopath/src/{import_path}");
        let tar_gz = self.source.fetch_source_tar_gz(secondary_revision).await?;
        worker.put_tar(Bytes::from(tar_gz), Some(&root)).await?;

        build.push_event("discovering_tests", None);
        let modules = discover_subrepo_modules(worker, &root).await?;

        build.push_event("starting_tests", None);
        let mut first_remote: Option<RemoteError> = None;
        for module in modules {
            let working_dir = if module.is_empty() {
                root.clone()
            } else {
                format!("{root}/{module}")
            };
            let opts = ExecOpts {
                args: vec!["test".to_string(), "./...".to_string()],
                working_dir: Some(working_dir),
                ..Default::default()
            };
            let outcome = worker.exec("go", &opts, build.log_writer(), &build.ct).await;
            if let Some(transport) = outcome.transport {
                return Err(CoordError::Transport(transport));
            }
            if let Some(remote) = outcome.remote {
                first_remote.get_or_insert(remote);
            }
        }
        build.push_event("tests_complete", None);
        match first_remote {
            Some(remote) => Err(CoordError::Remote(remote)),
            None => {
                build.push_event("all_tests_passed", None);
                Ok(())
            }
        }
    }

    /// Outline-level benchmark mode: install a baseline toolchain, fetch the benchmark runner,
    /// exec it comparing experiment to baseline, and leave result upload to the (out-of-scope)
    /// benchmark endpoint -- the driver only needs to get the runner's exit status right.
    async fn run_benchmark_mode(
        &self,
        build: &Arc<Build>,
        req: &BuildRequest,
        build_config: &BuildConfig,
        worker: &HttpWorker,
    ) -> Result<(), CoordError> {
        build.push_event("discovering_tests", None);
        let opts = ExecOpts {
            args: vec!["run".to_string(), "golang.org/x/benchmarks/cmd/bench".to_string()],
            working_dir: Some("go/src".to_string()),
            env: {
                let mut env = exec_env(build_config);
                env.push(("BENCH_BASELINE".to_string(), req.detail.primary_branch.clone()));
                env
            },
            path: Some(go_bin_path(worker).await?),
            ..Default::default()
        };
        build.push_event("starting_tests", None);
        let outcome = worker.exec("go", &opts, build.log_writer(), &build.ct).await;
        let result = outcome.into_result();
        build.push_event("tests_complete", None);
        if result.is_ok() {
            build.push_event("all_tests_passed", None);
        }
        result
    }

    /// Append a dashboard record, unless the build is a try build (never recorded), was
    /// canceled (never recorded, per the Open Question decision in DESIGN.md), or was skipped
    /// for a missing dependency (already returned before this is reached).
    async fn maybe_record(
        &self,
        req: &BuildRequest,
        _build_config: &BuildConfig,
        outcome: BuildOutcome,
    ) -> BuildOutcome {
        if outcome.status == BuildStatus::Canceled || req.priority == PriorityClass::Try {
            outcome.push_done_event();
            return outcome;
        }
        let record = BuildRecord {
            builder_name: req.key.builder_name.clone(),
            revision: req.key.primary_revision.clone(),
            success: outcome.is_success(),
            full_log: String::from_utf8_lossy(&outcome.log).into_owned(),
            elapsed: outcome.elapsed,
        };
        if let Err(e) = self.dashboard.record(record).await {
            self.error_reporter
                .report(&req.key.builder_name, &req.key.primary_revision, &e.to_string())
                .await;
        }
        outcome.push_done_event()
    }
}

impl BuildOutcome {
    /// `done` is the terminal, contractual event every build ends on (per §6's list of
    /// externally-consumed event names), appended here rather than inside `Build::finish` since
    /// `finish` runs before the dashboard record (whose success/failure doesn't change the
    /// build's own status, only whether an error gets reported).
    fn push_done_event(mut self) -> Self {
        self.events.push(Event {
            time: Instant::now(),
            name: "done".to_string(),
            detail: None,
        });
        self
    }
}

fn exec_env(build_config: &BuildConfig) -> Vec<(String, String)> {
    vec![
        ("GOOS".to_string(), build_config.goos.clone()),
        ("GOARCH".to_string(), build_config.goarch.clone()),
        ("GOROOT".to_string(), "go".to_string()),
        ("GOROOT_BOOTSTRAP".to_string(), "go1.4".to_string()),
    ]
}

/// `make.bash`'s only durable output the rest of the pipeline depends on is a `go/bin/go`
/// binary; every exec that invokes the bare `go` tool from `go/src` needs that directory on its
/// `PATH`, since the tool isn't installed anywhere the worker's own shell would already find it.
async fn go_bin_path(worker: &HttpWorker) -> Result<Vec<String>, TransportError> {
    let work_dir = worker.work_dir().await?;
    Ok(vec![format!("{work_dir}/go/bin")])
}

/// Directory components the subrepo scan never descends into or reports a module under: hidden
/// or underscore-prefixed directories, `testdata`, and `vendor`.
fn is_ignored_subrepo_component(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_') || name == "testdata" || name == "vendor"
}

/// Recursively scan a worker-side directory tree for module descriptors (`go.mod` files),
/// skipping ignored directories entirely (so nothing nested under them, however deep, is ever
/// visited). Returns each module's path relative to `root`, with the root module itself (if any)
/// represented as `""`.
async fn discover_subrepo_modules(worker: &HttpWorker, root: &str) -> Result<Vec<String>, TransportError> {
    let mut out = Vec::new();
    let mut stack = vec![String::new()];
    while let Some(rel) = stack.pop() {
        let abs = if rel.is_empty() {
            root.to_string()
        } else {
            format!("{root}/{rel}")
        };
        let entries = worker.list_dir(&abs).await?;
        if entries.iter().any(|e| !e.is_dir && e.name == "go.mod") {
            out.push(rel.clone());
        }
        for entry in &entries {
            if !entry.is_dir || is_ignored_subrepo_component(&entry.name) {
                continue;
            }
            let child = if rel.is_empty() {
                entry.name.clone()
            } else {
                format!("{rel}/{}", entry.name)
            };
            stack.push(child);
        }
    }
    out.sort();
    Ok(out)
}

impl ShardWorker for HttpWorker {
    fn name(&self) -> String {
        HttpWorker::name(self).to_string()
    }

    async fn run_tests(&self, names: &[String], ct: &CancellationToken) -> ShardResult {
        let path = match go_bin_path(self).await {
            Ok(p) => p,
            Err(e) => {
                return ShardResult {
                    output: Vec::new(),
                    outcome: crate::errors::ExecOutcome::from_transport(e),
                }
            }
        };
        let opts = ExecOpts {
            args: vec![
                "tool".to_string(),
                "dist".to_string(),
                "test".to_string(),
                format!("-run={}", names.join(",")),
            ],
            working_dir: Some("go/src".to_string()),
            path: Some(path),
            ..Default::default()
        };
        let mut out = Vec::new();
        let outcome = self.exec("go", &opts, &mut out, ct).await;
        ShardResult { output: out, outcome }
    }

    fn mark_broken(&self) {
        HttpWorker::mark_broken(self);
    }
}
