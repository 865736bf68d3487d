//! The external dashboard: a durable record of build outcomes, consumed by status pages and the
//! try-result reporter. Out of scope per the purpose/scope section (no HTTP/HTML status pages
//! here); this module only specifies the narrow write-path contract the build driver needs, plus
//! an in-memory fake for tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::TransportError;
use crate::git::CommitHash;

/// One row the build driver appends once a (non-canceled) build reaches a terminal state.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub builder_name: String,
    pub revision: CommitHash,
    pub success: bool,
    pub full_log: String,
    pub elapsed: Duration,
}

/// Durable record sink. Production implementations would write to the project's real dashboard
/// service; that's explicitly out of scope here (§1), so this trait is the seam the build driver
/// depends on instead.
#[allow(async_fn_in_trait)]
pub trait Dashboard: Send + Sync {
    async fn record(&self, record: BuildRecord) -> Result<(), TransportError>;
}

/// In-memory dashboard used by `run-build` and by tests: keeps every record it's given, in
/// submission order.
#[derive(Default)]
pub struct FakeDashboard {
    records: Mutex<Vec<BuildRecord>>,
}

impl FakeDashboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<BuildRecord> {
        self.records.lock().clone()
    }
}

impl Dashboard for FakeDashboard {
    async fn record(&self, record: BuildRecord) -> Result<(), TransportError> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// An error-reporting sink for out-of-band failures the operator should hear about even though
/// they don't belong in the dashboard (e.g. "couldn't acquire a worker at all"). Modeled
/// separately from `Dashboard` per the design notes' "long-lived singletons...passed through a
/// context-like value" guidance.
#[allow(async_fn_in_trait)]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, builder_name: &str, revision: &CommitHash, detail: &str);
}

#[derive(Default)]
pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    async fn report(&self, builder_name: &str, revision: &CommitHash, detail: &str) {
        log::error!("build error: {builder_name} @ {revision}: {detail}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_dashboard_keeps_submission_order() {
        let dashboard = FakeDashboard::new();
        for i in 0..3 {
            dashboard
                .record(BuildRecord {
                    builder_name: "linux-amd64".to_string(),
                    revision: CommitHash::new(format!("rev{i}")),
                    success: true,
                    full_log: String::new(),
                    elapsed: Duration::from_secs(1),
                })
                .await
                .unwrap();
        }
        let records = dashboard.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].revision.as_str(), "rev1");
    }
}
