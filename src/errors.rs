//! Typed error taxonomy shared by the worker client, the pools, the scheduler and the build
//! driver. Everything downstream of an RPC to a worker needs to tell apart three kinds of
//! failure: the network/worker plumbing broke (retryable, doesn't indict the commit under test),
//! the remote command itself failed (not retryable, does indict the commit), or a purely local
//! problem happened before any of that (bad config, etc). Cancellation is its own thing, since it
//! isn't really a failure at all.

use std::time::Duration;

use thiserror::Error;

/// Something went wrong talking to a worker: the VM died, the HTTP request timed out, the
/// connection was reset. None of this says anything about the code under test.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("worker marked broken: {0}")]
    Broken(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("i/o error talking to worker: {0}")]
    Io(String),
    #[error("no worker available: {0}")]
    NoWorkerAvailable(String),
    #[error("worker pool exhausted or shutting down")]
    PoolGone,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// The worker executed our request and told us it failed: a non-zero exit code, a build
/// process that couldn't be started, and so on. This does indict the commit under test (or at
/// least the environment we built for it).
#[derive(Debug, Error, Clone)]
pub enum RemoteError {
    #[error("remote command exited {code}: {detail}")]
    NonZeroExit { code: i32, detail: String },
    #[error("remote operation failed: {0}")]
    Other(String),
}

/// A problem that has nothing to do with any worker: bad configuration, an invariant we expect
/// to hold locally that didn't.
#[derive(Debug, Error)]
pub enum LocalError {
    #[error("unknown builder {0:?}")]
    UnknownBuilder(String),
    #[error("unknown host type {0:?}")]
    UnknownHostType(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The error type returned by everything above the worker-RPC layer: dep-check, acquire,
/// materialize, make, shard, record. `Canceled` is deliberately not a `TransportError` or a
/// `RemoteError`: a canceled build isn't a failure of either the network or the commit, it's the
/// operator (or a newer commit) telling us to stop.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Local(#[from] LocalError),
    #[error("build canceled")]
    Canceled,
}

impl CoordError {
    pub fn is_transport(&self) -> bool {
        matches!(self, CoordError::Transport(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, CoordError::Canceled)
    }

    /// Terminal promotion: a builder flagged as flaky in configuration gets its transport
    /// failures reported to the client as ordinary (non-retryable) remote failures, instead of
    /// the build being retried forever against a host type that will never come back up.
    pub fn promote_transport_to_remote(self) -> Self {
        match self {
            CoordError::Transport(t) => CoordError::Remote(RemoteError::Other(format!(
                "network error promoted to terminal error: {t}"
            ))),
            other => other,
        }
    }
}

/// Outcome of a single worker RPC, before it's been folded into a [`CoordError`]. Kept as a
/// struct rather than a single error so callers that need to distinguish "the RPC round-trip
/// failed" from "the RPC succeeded but reported a failure" (e.g. exec exit codes) don't need to
/// downcast.
#[derive(Debug, Default, Clone)]
pub struct ExecOutcome {
    pub transport: Option<TransportError>,
    pub remote: Option<RemoteError>,
}

impl ExecOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn from_transport(e: TransportError) -> Self {
        Self {
            transport: Some(e),
            remote: None,
        }
    }

    pub fn from_remote(e: RemoteError) -> Self {
        Self {
            transport: None,
            remote: Some(e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.transport.is_none() && self.remote.is_none()
    }

    /// Transport errors always take priority: if the RPC itself didn't make it to the worker,
    /// any remote-side detail we might also be holding isn't trustworthy.
    pub fn into_result(self) -> Result<(), CoordError> {
        if let Some(t) = self.transport {
            return Err(CoordError::Transport(t));
        }
        if let Some(r) = self.remote {
            return Err(CoordError::Remote(r));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_takes_priority_over_remote() {
        let outcome = ExecOutcome {
            transport: Some(TransportError::Io("connection reset".into())),
            remote: Some(RemoteError::NonZeroExit {
                code: 1,
                detail: "boom".into(),
            }),
        };
        assert!(matches!(
            outcome.into_result(),
            Err(CoordError::Transport(_))
        ));
    }

    #[test]
    fn promotion_rewrites_message() {
        let err = CoordError::Transport(TransportError::Timeout(Duration::from_secs(5)));
        let promoted = err.promote_transport_to_remote();
        assert!(matches!(promoted, CoordError::Remote(_)));
        assert!(promoted
            .to_string()
            .contains("network error promoted to terminal error"));
    }

    #[test]
    fn promotion_leaves_other_kinds_alone() {
        let err = CoordError::Canceled;
        assert!(err.promote_transport_to_remote().is_canceled());
    }
}
