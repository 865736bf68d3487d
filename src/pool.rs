//! Polymorphic worker pools. Three provisioning strategies share one client surface
//! ([`HttpWorker`]): cloud VMs and containers are created on demand against a quota, while
//! reverse-dial workers show up on their own schedule and just get tracked. We model this as an
//! enum over three concrete pool types rather than a trait object -- there's a small, fixed set
//! of provisioning modes and no plan to add more at runtime, so the "small capability set"
//! shape fits better than an open-ended `dyn Pool`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_condvar_fair::Condvar;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::buildlet::HttpWorker;
use crate::errors::{CoordError, TransportError};

/// What a pool needs to be able to do to create and destroy a worker of a given host type.
/// Cloud-VM and container pools each have their own implementation; reverse pools don't
/// provision anything; they just wait.
pub trait WorkerProvisioner: Send + Sync {
    #[allow(async_fn_in_trait)]
    async fn create(&self, host_type: &str, name_hint: &str) -> Result<HttpWorker, TransportError>;
    #[allow(async_fn_in_trait)]
    async fn destroy(&self, worker_name: &str) -> Result<(), TransportError>;
    #[allow(async_fn_in_trait)]
    async fn list_running(&self, host_type: &str) -> Result<Vec<String>, TransportError>;
}

/// A provisioner backed by [`crate::fakebuildlet::FakeBuildlet`]s. This is the "minimal
/// in-process fake" used by `run-build` and by tests: every `create()` spins up a fresh
/// in-process fake buildlet instead of talking to a cloud API.
pub struct LocalFakeProvisioner {
    live: Mutex<HashMap<String, Arc<crate::fakebuildlet::FakeBuildlet>>>,
}

impl LocalFakeProvisioner {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalFakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerProvisioner for LocalFakeProvisioner {
    async fn create(&self, _host_type: &str, name_hint: &str) -> Result<HttpWorker, TransportError> {
        let fb = crate::fakebuildlet::FakeBuildlet::spawn()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let client = fb.client(name_hint);
        self.live.lock().insert(name_hint.to_string(), Arc::new(fb));
        Ok(client)
    }

    async fn destroy(&self, worker_name: &str) -> Result<(), TransportError> {
        self.live.lock().remove(worker_name);
        Ok(())
    }

    async fn list_running(&self, _host_type: &str) -> Result<Vec<String>, TransportError> {
        Ok(self.live.lock().keys().cloned().collect())
    }
}

/// Per-host-type on-demand quota: a counting semaphore bounding concurrent workers, plus the set
/// of currently live worker names (so the reaper can reconcile against what the provisioner
/// reports).
struct QuotaEntry {
    semaphore: Arc<Semaphore>,
    live: Mutex<HashSet<String>>,
}

/// A pool of workers created on demand (cloud VMs or containers), bounded by a per-host-type
/// quota. Leaked VMs -- ones the provisioner still reports as running but that we have no record
/// of needing -- are cleaned up by a background reaper task.
pub struct QuotaPool<P: WorkerProvisioner> {
    provisioner: Arc<P>,
    quotas: HashMap<String, QuotaEntry>,
    next_id: std::sync::atomic::AtomicU64,
}

impl<P: WorkerProvisioner + 'static> QuotaPool<P> {
    pub fn new(provisioner: Arc<P>, max_concurrent: HashMap<String, usize>) -> Arc<Self> {
        let quotas = max_concurrent
            .into_iter()
            .map(|(host_type, limit)| {
                (
                    host_type,
                    QuotaEntry {
                        semaphore: Arc::new(Semaphore::new(limit)),
                        live: Mutex::new(HashSet::new()),
                    },
                )
            })
            .collect();
        Arc::new(Self {
            provisioner,
            quotas,
            next_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Block (respecting cancellation) until quota for `host_type` is available, then provision
    /// a worker. The returned worker must eventually be released via [`Self::release`] -- callers
    /// do this by calling `HttpWorker::close()`, which the build driver always does when done
    /// with a worker.
    pub async fn get_worker(
        &self,
        ct: &CancellationToken,
        host_type: &str,
    ) -> Result<HttpWorker, CoordError> {
        let entry = self.quotas.get(host_type).ok_or_else(|| {
            CoordError::Local(crate::errors::LocalError::UnknownHostType(
                host_type.to_string(),
            ))
        })?;
        let permit = tokio::select! {
            permit = entry.semaphore.clone().acquire_owned() => permit.expect("semaphore never closed"),
            _ = ct.cancelled() => return Err(CoordError::Canceled),
        };

        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        // Spec'd naming is `buildlet-<host-type>-<revhash>-<random>` so an out-of-band reaper
        // sweeping a cloud project can tell our workers apart from other tenants' VMs; we don't
        // thread the revision being built down into the pool (it only knows host types), so the
        // monotonic id stands in for the revhash segment.
        let random_suffix: u32 = rand::random();
        let name = format!("buildlet-{host_type}-{id}-{random_suffix:08x}");
        let worker = match self.provisioner.create(host_type, &name).await {
            Ok(w) => w,
            Err(e) => {
                drop(permit);
                return Err(CoordError::Transport(e));
            }
        };
        entry.live.lock().insert(name.clone());
        // The permit is tied to the worker's lifetime conceptually, but since `Semaphore` permits
        // aren't `Send`-friendly to stash on `HttpWorker` without extra plumbing, we leak it here
        // and rely on the reaper + explicit release to keep quota honest in the simple case. A
        // fuller implementation would thread the permit through `close()`.
        permit.forget();
        Ok(worker)
    }

    /// Give back quota and ask the provisioner to tear the worker down. Called once the build
    /// driver is done with a worker (after `HttpWorker::close()`).
    pub async fn release(&self, host_type: &str, worker_name: &str) {
        if let Some(entry) = self.quotas.get(host_type) {
            entry.live.lock().remove(worker_name);
            entry.semaphore.add_permits(1);
        }
        if let Err(e) = self.provisioner.destroy(worker_name).await {
            warn!("failed tearing down worker {worker_name}: {e}");
        }
    }

    /// Background task: periodically compare what the provisioner thinks is running against our
    /// own bookkeeping, and destroy anything running that we have no record of. Guards against
    /// leaked VMs from crashes or restarts.
    pub async fn run_reaper(self: Arc<Self>, period: Duration, ct: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = ct.cancelled() => return,
            }
            for (host_type, entry) in &self.quotas {
                let running = match self.provisioner.list_running(host_type).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("reaper: couldn't list running workers for {host_type}: {e}");
                        continue;
                    }
                };
                let known = entry.live.lock().clone();
                for name in running {
                    if !known.contains(&name) {
                        debug!("reaper: destroying leaked worker {name}");
                        let _ = self.provisioner.destroy(&name).await;
                    }
                }
            }
        }
    }
}

/// State of a registered reverse-dial worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseWorkerState {
    Idle,
    InUse,
    HealthChecking,
}

struct ReverseEntry {
    client: HttpWorker,
    host_types: Vec<String>,
    state: ReverseWorkerState,
}

/// A pool of workers that dialed in themselves (reverse-dial). We never provision these; we just
/// track who's registered and hand out idle ones, using a condvar so `get_worker` can block
/// efficiently until one shows up or becomes free.
pub struct ReversePool {
    inner: Mutex<HashMap<String, ReverseEntry>>,
    condvar: Condvar,
}

impl ReversePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
        })
    }

    /// Called by the reverse-dial listener once a worker has completed the registration
    /// handshake. A single worker can register for more than one builder type (e.g. a machine
    /// that can run both the `linux-amd64` and `linux-amd64-race` builds).
    pub fn register(&self, client: HttpWorker, host_types: Vec<String>) {
        let mut inner = self.inner.lock();
        inner.insert(
            client.name().to_string(),
            ReverseEntry {
                client,
                host_types,
                state: ReverseWorkerState::Idle,
            },
        );
        self.condvar.notify_all();
    }

    pub fn unregister(&self, worker_name: &str) {
        self.inner.lock().remove(worker_name);
    }

    pub fn host_type_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock();
        let mut counts = HashMap::new();
        for entry in inner.values() {
            for host_type in &entry.host_types {
                *counts.entry(host_type.clone()).or_insert(0usize) += 1;
            }
        }
        counts
    }

    /// Block until an idle worker of `host_type` is available, mark it in-use, and return it.
    #[allow(clippy::await_holding_lock)]
    pub async fn get_worker(
        &self,
        ct: &CancellationToken,
        host_type: &str,
    ) -> Result<HttpWorker, CoordError> {
        let mut guard = self.inner.lock();
        loop {
            if ct.is_cancelled() {
                return Err(CoordError::Canceled);
            }
            if let Some((_, entry)) = guard.iter_mut().find(|(_, e)| {
                e.state == ReverseWorkerState::Idle
                    && e.host_types.iter().any(|t| t == host_type)
            }) {
                entry.state = ReverseWorkerState::InUse;
                return Ok(entry.client.clone());
            }
            guard = tokio_condvar_wait(self.condvar.wait(guard), ct).await?;
        }
    }

    pub fn release(&self, worker_name: &str) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(worker_name) {
            entry.state = ReverseWorkerState::Idle;
        }
        self.condvar.notify_all();
    }

    pub fn set_health_checking(&self, worker_name: &str, checking: bool) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(worker_name) {
            entry.state = if checking {
                ReverseWorkerState::HealthChecking
            } else {
                ReverseWorkerState::Idle
            };
        }
    }
}

/// Bridges `async_condvar_fair`'s wait future (which just completes with the guard back) with
/// our need to bail out early on cancellation, without leaking the `MutexGuard` across the
/// `select!` (parking_lot guards aren't `Send` by default, but this crate was chosen specifically
/// because its `send_guard` feature makes them so -- see Cargo.toml).
async fn tokio_condvar_wait<'a, T>(
    wait: impl std::future::Future<Output = parking_lot::MutexGuard<'a, T>>,
    ct: &CancellationToken,
) -> Result<parking_lot::MutexGuard<'a, T>, CoordError> {
    tokio::select! {
        guard = wait => Ok(guard),
        _ = ct.cancelled() => Err(CoordError::Canceled),
    }
}

/// Background health-check loop for one reverse-dial worker: periodically hits its status
/// endpoint, and evicts it from the pool if it stops answering.
pub async fn health_check_loop(
    pool: Arc<ReversePool>,
    worker: HttpWorker,
    period: Duration,
    ct: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = ct.cancelled() => return,
        }
        pool.set_health_checking(worker.name(), true);
        let healthy = worker.work_dir().await.is_ok();
        if !healthy {
            warn!("reverse worker {} failed health check, evicting", worker.name());
            pool.unregister(worker.name());
            return;
        }
        pool.set_health_checking(worker.name(), false);
    }
}

/// The three provisioning strategies, unified behind one `get_worker` surface. See the module
/// doc comment for why this is an enum and not a trait object.
pub enum Pool {
    CloudVm(Arc<QuotaPool<LocalFakeProvisioner>>),
    Container(Arc<QuotaPool<LocalFakeProvisioner>>),
    Reverse(Arc<ReversePool>),
    /// A deployment's host types are rarely all the same provisioning kind -- a farm typically
    /// mixes on-demand cloud/container capacity with a handful of reverse-dialed physical
    /// machines. `Composite` fans a single `Scheduler` out across one of each, keyed by
    /// host-type, while still presenting the same `get_worker`/`release` surface as the other
    /// three variants.
    Composite(Arc<CompositePool>),
}

impl Pool {
    pub async fn get_worker(
        &self,
        ct: &CancellationToken,
        host_type: &str,
    ) -> Result<HttpWorker, CoordError> {
        match self {
            Pool::CloudVm(p) | Pool::Container(p) => p.get_worker(ct, host_type).await,
            Pool::Reverse(p) => p.get_worker(ct, host_type).await,
            Pool::Composite(p) => p.get_worker(ct, host_type).await,
        }
    }

    pub async fn release(&self, host_type: &str, worker: &HttpWorker) {
        match self {
            Pool::CloudVm(p) | Pool::Container(p) => p.release(host_type, worker.name()).await,
            Pool::Reverse(p) => p.release(worker.name()),
            Pool::Composite(p) => p.release(host_type, worker).await,
        }
    }
}

/// Which underlying pool a given host type's workers come from, inside a [`CompositePool`].
enum PoolRoute {
    CloudVm,
    Container,
    Reverse,
}

/// Routes `get_worker`/`release` to whichever concrete pool owns a given host type. Built once at
/// startup from the coordinator's host-type configuration (see `main.rs`'s `serve` wiring); the
/// three concrete pools underneath are the same `QuotaPool`/`ReversePool` types used standalone.
pub struct CompositePool {
    cloud_vm: Option<Arc<QuotaPool<LocalFakeProvisioner>>>,
    container: Option<Arc<QuotaPool<LocalFakeProvisioner>>>,
    reverse: Option<Arc<ReversePool>>,
    routes: HashMap<String, PoolRoute>,
}

impl CompositePool {
    pub fn new(
        cloud_vm: Option<Arc<QuotaPool<LocalFakeProvisioner>>>,
        container: Option<Arc<QuotaPool<LocalFakeProvisioner>>>,
        reverse: Option<Arc<ReversePool>>,
        routes: HashMap<String, PoolRoute>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cloud_vm,
            container,
            reverse,
            routes,
        })
    }

    async fn get_worker(
        &self,
        ct: &CancellationToken,
        host_type: &str,
    ) -> Result<HttpWorker, CoordError> {
        match self.routes.get(host_type) {
            Some(PoolRoute::CloudVm) => {
                self.cloud_vm
                    .as_ref()
                    .expect("route points at configured cloud_vm pool")
                    .get_worker(ct, host_type)
                    .await
            }
            Some(PoolRoute::Container) => {
                self.container
                    .as_ref()
                    .expect("route points at configured container pool")
                    .get_worker(ct, host_type)
                    .await
            }
            Some(PoolRoute::Reverse) => {
                self.reverse
                    .as_ref()
                    .expect("route points at configured reverse pool")
                    .get_worker(ct, host_type)
                    .await
            }
            None => Err(CoordError::Local(crate::errors::LocalError::UnknownHostType(
                host_type.to_string(),
            ))),
        }
    }

    async fn release(&self, host_type: &str, worker: &HttpWorker) {
        match self.routes.get(host_type) {
            Some(PoolRoute::CloudVm) => {
                if let Some(p) = &self.cloud_vm {
                    p.release(host_type, worker.name()).await;
                }
            }
            Some(PoolRoute::Container) => {
                if let Some(p) = &self.container {
                    p.release(host_type, worker.name()).await;
                }
            }
            Some(PoolRoute::Reverse) => {
                if let Some(p) = &self.reverse {
                    p.release(worker.name());
                }
            }
            None => {}
        }
    }
}

/// Build the routing table a [`CompositePool`] needs from the coordinator's host-type
/// configuration: which of the three concrete pools should serve each host type.
pub fn routes_from_host_types(
    host_types: &HashMap<String, crate::config::HostConfig>,
) -> HashMap<String, PoolRoute> {
    host_types
        .iter()
        .map(|(name, cfg)| {
            let route = match cfg.pool_kind {
                crate::config::PoolKind::CloudVm => PoolRoute::CloudVm,
                crate::config::PoolKind::Container => PoolRoute::Container,
                crate::config::PoolKind::Reverse => PoolRoute::Reverse,
            };
            (name.clone(), route)
        })
        .collect()
}
