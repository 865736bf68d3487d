//! Fair-share dispatch across three priority classes (try < gomote < regular), per host type.
//! Within a class, tickets are served oldest-first; across classes, higher priority wins unless
//! a lower-priority ticket has been waiting longer than the starvation threshold, in which case
//! it's promoted ahead of the higher classes for one dispatch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::buildlet::HttpWorker;
use crate::errors::CoordError;
use crate::pool::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Try,
    Gomote,
    Regular,
}

/// A pending request for a worker of a given host type. `commit_time` and `submitter_email`
/// together form the within-class ordering key (§3: "commit-timestamp ascending, ties broken by
/// submitter-email") -- independent of submission order, so an old commit that's queued late
/// still jumps ahead of a newer one already waiting.
pub struct WorkItem {
    pub host_type: String,
    pub priority: PriorityClass,
    pub commit_time: u64,
    pub branch: String,
    pub submitter_email: String,
}

struct Ticket {
    item: WorkItem,
    enqueued_at: Instant,
    ct: CancellationToken,
    respond: oneshot::Sender<Result<HttpWorker, CoordError>>,
}

struct HostQueues {
    try_q: VecDeque<Ticket>,
    gomote_q: VecDeque<Ticket>,
    regular_q: VecDeque<Ticket>,
}

impl HostQueues {
    fn new() -> Self {
        Self {
            try_q: VecDeque::new(),
            gomote_q: VecDeque::new(),
            regular_q: VecDeque::new(),
        }
    }

    fn queue_mut(&mut self, class: PriorityClass) -> &mut VecDeque<Ticket> {
        match class {
            PriorityClass::Try => &mut self.try_q,
            PriorityClass::Gomote => &mut self.gomote_q,
            PriorityClass::Regular => &mut self.regular_q,
        }
    }

    /// Insert a ticket into `class`'s queue in commit-time order (ties broken by submitter
    /// email), so the front of the queue is always the oldest commit regardless of submission
    /// order.
    fn insert_ordered(&mut self, class: PriorityClass, ticket: Ticket) {
        let key = (ticket.item.commit_time, ticket.item.submitter_email.clone());
        let queue = self.queue_mut(class);
        let pos = queue
            .iter()
            .position(|t| (t.item.commit_time, t.item.submitter_email.clone()) > key)
            .unwrap_or(queue.len());
        queue.insert(pos, ticket);
    }

    fn is_empty(&self) -> bool {
        self.try_q.is_empty() && self.gomote_q.is_empty() && self.regular_q.is_empty()
    }

    /// Pop the next ticket to dispatch: `try` beats `gomote` beats `regular`, except that a
    /// `regular` ticket which has waited longer than `starvation_threshold` is served ahead of
    /// everything else, so a steady stream of pre-submit (`try`) traffic can't lock out
    /// post-submit builds forever.
    fn pop_next(&mut self, starvation_threshold: Duration, now: Instant) -> Option<Ticket> {
        if let Some(front) = self.regular_q.front() {
            if now.duration_since(front.enqueued_at) >= starvation_threshold {
                return self.regular_q.pop_front();
            }
        }
        if let Some(t) = self.try_q.pop_front() {
            return Some(t);
        }
        if let Some(t) = self.gomote_q.pop_front() {
            return Some(t);
        }
        self.regular_q.pop_front()
    }
}

struct SchedulerInner {
    queues: Mutex<std::collections::HashMap<String, HostQueues>>,
    notify: Notify,
}

/// Dispatches [`WorkItem`]s to workers acquired from a [`Pool`], respecting the fairness policy
/// described above. One scheduler fronts the pools for an entire coordinator; callers submit a
/// work item and await a `HttpWorker`.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    pool: Arc<Pool>,
    starvation_threshold: Duration,
}

impl Scheduler {
    pub fn new(pool: Arc<Pool>, starvation_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queues: Mutex::new(std::collections::HashMap::new()),
                notify: Notify::new(),
            }),
            pool,
            starvation_threshold,
        }
    }

    /// Release a worker's quota back to whichever pool minted it. The build driver calls this
    /// once it's done with a worker (after `HttpWorker::close()`), for both the primary and any
    /// helpers it acquired.
    pub async fn release(&self, host_type: &str, worker: &HttpWorker) {
        self.pool.release(host_type, worker).await;
    }

    /// Submit a work item and wait for a worker. Canceling `ct` before a worker is handed out
    /// removes the ticket from its queue and returns `CoordError::Canceled`.
    pub async fn acquire(
        &self,
        item: WorkItem,
        ct: CancellationToken,
    ) -> Result<HttpWorker, CoordError> {
        let (tx, rx) = oneshot::channel();
        let host_type = item.host_type.clone();
        let class = item.priority;
        {
            let mut queues = self.inner.queues.lock();
            let hq = queues.entry(host_type).or_insert_with(HostQueues::new);
            hq.insert_ordered(
                class,
                Ticket {
                    item,
                    enqueued_at: Instant::now(),
                    ct: ct.clone(),
                    respond: tx,
                },
            );
        }
        self.inner.notify.notify_one();

        tokio::select! {
            result = rx => result.unwrap_or(Err(CoordError::Canceled)),
            _ = ct.cancelled() => Err(CoordError::Canceled),
        }
    }

    /// Run the dispatch loop. One instance of this should run for the lifetime of the
    /// coordinator; it wakes whenever a new ticket is submitted and, for every host type with
    /// pending work, pops the next ticket per the fairness policy and spawns an independent task
    /// to acquire a worker for it from the pool. Dispatch order (not acquisition completion
    /// order) is what determines fairness: the pool's own FIFO semaphore then serves requests
    /// roughly in the order they were dispatched.
    pub async fn run(self: Arc<Self>, ct: CancellationToken) {
        loop {
            let mut dispatched_any = false;
            {
                let mut queues = self.inner.queues.lock();
                let now = Instant::now();
                let host_types: Vec<String> = queues.keys().cloned().collect();
                for host_type in host_types {
                    let hq = queues.get_mut(&host_type).unwrap();
                    if let Some(ticket) = hq.pop_next(self.starvation_threshold, now) {
                        dispatched_any = true;
                        let pool = self.pool.clone();
                        tokio::spawn(async move {
                            if ticket.respond.is_closed() {
                                return; // caller already gave up.
                            }
                            let result = pool.get_worker(&ticket.ct, &ticket.item.host_type).await;
                            debug!(
                                "dispatched {:?} priority ticket for {}",
                                ticket.item.priority, ticket.item.host_type
                            );
                            let _ = ticket.respond.send(result);
                        });
                    }
                    if hq.is_empty() {
                        queues.remove(&host_type);
                    }
                }
            }
            if dispatched_any {
                continue;
            }
            tokio::select! {
                _ = self.inner.notify.notified() => {},
                _ = ct.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_next_prefers_try_over_lower_classes() {
        let mut hq = HostQueues::new();
        let now = Instant::now();
        let (tx_try, _rx_try) = oneshot::channel();
        hq.try_q.push_back(Ticket {
            item: WorkItem {
                host_type: "h".into(),
                priority: PriorityClass::Try,
                commit_time: 0,
                branch: "b".into(),
                submitter_email: "a@example.com".into(),
            },
            enqueued_at: now,
            ct: CancellationToken::new(),
            respond: tx_try,
        });
        let (tx_reg, _rx_reg) = oneshot::channel();
        hq.regular_q.push_back(Ticket {
            item: WorkItem {
                host_type: "h".into(),
                priority: PriorityClass::Regular,
                commit_time: 0,
                branch: "b".into(),
                submitter_email: "a@example.com".into(),
            },
            enqueued_at: now,
            ct: CancellationToken::new(),
            respond: tx_reg,
        });

        let popped = hq.pop_next(Duration::from_secs(3600), now).unwrap();
        assert_eq!(popped.item.priority, PriorityClass::Try);
    }

    #[test]
    fn pop_next_promotes_starved_regular_ticket() {
        let mut hq = HostQueues::new();
        let old = Instant::now() - Duration::from_secs(10_000);
        let now = Instant::now();
        let (tx_try, _rx_try) = oneshot::channel();
        hq.try_q.push_back(Ticket {
            item: WorkItem {
                host_type: "h".into(),
                priority: PriorityClass::Try,
                commit_time: 0,
                branch: "b".into(),
                submitter_email: "a@example.com".into(),
            },
            enqueued_at: now,
            ct: CancellationToken::new(),
            respond: tx_try,
        });
        let (tx_reg, _rx_reg) = oneshot::channel();
        hq.regular_q.push_back(Ticket {
            item: WorkItem {
                host_type: "h".into(),
                priority: PriorityClass::Regular,
                commit_time: 0,
                branch: "b".into(),
                submitter_email: "a@example.com".into(),
            },
            enqueued_at: old,
            ct: CancellationToken::new(),
            respond: tx_reg,
        });

        let popped = hq.pop_next(Duration::from_secs(3600), now).unwrap();
        assert_eq!(
            popped.item.priority,
            PriorityClass::Regular,
            "a starved regular ticket should be promoted ahead of a fresh try ticket"
        );
    }

    #[tokio::test]
    async fn acquire_resolves_once_pool_has_capacity() {
        let provisioner = Arc::new(crate::pool::LocalFakeProvisioner::new());
        let mut limits = std::collections::HashMap::new();
        limits.insert("linux-amd64".to_string(), 1);
        let quota_pool = crate::pool::QuotaPool::new(provisioner, limits);
        let pool = Arc::new(Pool::CloudVm(quota_pool));
        let scheduler = Arc::new(Scheduler::new(pool, Duration::from_secs(3600)));

        let ct = CancellationToken::new();
        let dispatcher_ct = ct.clone();
        let dispatcher = tokio::spawn(scheduler.clone().run(dispatcher_ct));

        let worker = scheduler
            .acquire(
                WorkItem {
                    host_type: "linux-amd64".to_string(),
                    priority: PriorityClass::Regular,
                    commit_time: 0,
                    branch: "main".to_string(),
                    submitter_email: "a@example.com".to_string(),
                },
                CancellationToken::new(),
            )
            .await
            .expect("should acquire a worker");
        assert!(worker.name().starts_with("buildlet-linux-amd64-"));

        ct.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), dispatcher).await;
    }
}
