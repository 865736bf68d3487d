//! Client for the worker wire protocol: the small HTTP API every buildlet (cloud VM, container,
//! or reverse-dialed physical machine) exposes so the coordinator can push source, run commands,
//! and pull results back, regardless of how that worker was provisioned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;

use crate::errors::{ExecOutcome, RemoteError, TransportError};

/// Options for a single remote command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub path: Option<Vec<String>>,
    /// Run as whatever privileged account the buildlet offers, rather than the normal build
    /// user. Used for the handful of commands (package installs, etc.) that need it.
    pub system_level: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusResponse {
    version: String,
    work_dir: String,
}

/// A directory entry as reported by `ListDir`.
#[derive(Debug, Clone, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time_unix: i64,
}

/// One worker, speaking the buildlet wire protocol over HTTP. Produced by a `Pool` regardless of
/// which provisioning strategy backed it; from here on every caller sees the same surface.
#[derive(Clone)]
pub struct HttpWorker {
    http: reqwest::Client,
    base_url: String,
    name: String,
    broken: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl HttpWorker {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .expect("building reqwest client"),
            base_url: base_url.into(),
            name: name.into(),
            broken: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_err(&self, e: reqwest::Error) -> TransportError {
        self.mark_broken();
        if e.is_timeout() {
            TransportError::Timeout(Duration::from_secs(600))
        } else {
            TransportError::Io(e.to_string())
        }
    }

    /// Push a tarball of source onto the worker, to be extracted relative to its work dir.
    pub async fn put_tar(&self, tar_gz: Bytes, rel_dir: Option<&str>) -> Result<(), TransportError> {
        let mut req = self
            .http
            .post(self.url("/tar"))
            .body(tar_gz);
        if let Some(rel) = rel_dir {
            req = req.query(&[("dir", rel)]);
        }
        let resp = req.send().await.map_err(|e| self.transport_err(e))?;
        check_status(&resp)?;
        Ok(())
    }

    /// Ask the worker to fetch and extract a tarball from a URL itself, instead of us streaming
    /// the bytes through. Used for large toolchain bootstraps where the worker has better
    /// network proximity to the source than we do.
    pub async fn put_tar_from_url(
        &self,
        url: &str,
        rel_dir: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut req = self.http.post(self.url("/tarfromurl")).query(&[("url", url)]);
        if let Some(rel) = rel_dir {
            req = req.query(&[("dir", rel)]);
        }
        let resp = req.send().await.map_err(|e| self.transport_err(e))?;
        check_status(&resp)?;
        Ok(())
    }

    /// Pull a directory back off the worker as a gzipped tarball.
    pub async fn get_tar(&self, rel_dir: &str) -> Result<Bytes, TransportError> {
        let resp = self
            .http
            .get(self.url("/tar"))
            .query(&[("dir", rel_dir)])
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        check_status(&resp)?;
        resp.bytes().await.map_err(|e| self.transport_err(e))
    }

    pub async fn list_dir(&self, rel_dir: &str) -> Result<Vec<DirEntry>, TransportError> {
        let resp = self
            .http
            .get(self.url("/ls"))
            .query(&[("dir", rel_dir)])
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        check_status(&resp)?;
        resp.json().await.map_err(|e| self.transport_err(e))
    }

    pub async fn remove_all(&self, rel_paths: &[String]) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(self.url("/removeall"))
            .form(&rel_paths.iter().map(|p| ("path", p.clone())).collect::<Vec<_>>())
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        check_status(&resp)?;
        Ok(())
    }

    pub async fn work_dir(&self) -> Result<String, TransportError> {
        Ok(self.status().await?.work_dir)
    }

    async fn status(&self) -> Result<StatusResponse, TransportError> {
        let resp = self
            .http
            .get(self.url("/status"))
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        check_status(&resp)?;
        resp.json().await.map_err(|e| self.transport_err(e))
    }

    /// Run a command on the worker, streaming its combined stdout/stderr into `out` as it
    /// arrives. Returns the dual transport/remote outcome described in the error taxonomy:
    /// a broken connection and a non-zero exit code are different kinds of failure and callers
    /// (the build driver, the sharder) need to treat them differently.
    pub async fn exec(
        &self,
        program: &str,
        opts: &ExecOpts,
        mut out: impl AsyncWrite + Unpin,
        ct: &CancellationToken,
    ) -> ExecOutcome {
        // The wire format repeats `arg=`/`env=` once per value, which a HashMap can't express;
        // build a flat Vec of pairs instead.
        let mut pairs: Vec<(&str, String)> = vec![("cmd", program.to_string())];
        for arg in &opts.args {
            pairs.push(("arg", arg.clone()));
        }
        for (k, v) in &opts.env {
            pairs.push(("env", format!("{k}={v}")));
        }
        if let Some(dir) = &opts.working_dir {
            pairs.push(("dir", dir.clone()));
        }
        if let Some(path) = &opts.path {
            pairs.push(("path", path.join(":")));
        }
        if opts.system_level {
            pairs.push(("system", "1".to_string()));
        }

        let req = self.http.post(self.url("/exec")).query(&pairs).send();
        let resp = tokio::select! {
            resp = req => resp,
            _ = ct.cancelled() => {
                return ExecOutcome::from_transport(TransportError::Io(
                    "exec canceled before worker responded".to_string(),
                ));
            }
        };
        let mut resp = match resp {
            Ok(r) => r,
            Err(e) => return ExecOutcome::from_transport(self.transport_err(e)),
        };
        if let Err(e) = check_status(&resp) {
            return ExecOutcome::from_transport(e);
        }

        loop {
            let chunk = tokio::select! {
                chunk = resp.chunk() => chunk,
                _ = ct.cancelled() => {
                    return ExecOutcome::from_transport(TransportError::Io(
                        "exec canceled mid-stream".to_string(),
                    ));
                }
            };
            match chunk {
                Ok(Some(bytes)) => {
                    if out.write_all(&bytes).await.is_err() {
                        return ExecOutcome::from_transport(TransportError::Io(
                            "failed writing exec output locally".to_string(),
                        ));
                    }
                }
                Ok(None) => break,
                Err(e) => return ExecOutcome::from_transport(self.transport_err(e)),
            }
        }

        // The wire protocol reports the remote exit code via a trailer header, since the body is
        // entirely taken up by the command's own output.
        let exit_code: i32 = resp
            .headers()
            .get("x-exit-code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if exit_code != 0 {
            return ExecOutcome::from_remote(RemoteError::NonZeroExit {
                code: exit_code,
                detail: format!("{program} exited {exit_code}"),
            });
        }
        ExecOutcome::ok()
    }

    /// Idempotent teardown. Safe to call multiple times (e.g. once from a `Drop` guard and once
    /// explicitly) -- only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.http.post(self.url("/halt")).send().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn check_status(resp: &reqwest::Response) -> Result<(), TransportError> {
    if resp.status() == StatusCode::OK {
        Ok(())
    } else {
        Err(TransportError::Io(format!(
            "worker returned unexpected status {}",
            resp.status()
        )))
    }
}

/// Package a directory tree into a gzipped tar, for use with [`HttpWorker::put_tar`].
pub fn tar_gz_dir(dir: &std::path::Path) -> anyhow::Result<Bytes> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Extract a gzipped tar previously produced by [`tar_gz_dir`] (or [`HttpWorker::get_tar`]) into
/// a local directory.
pub fn untar_gz(data: &[u8], dest: &std::path::Path) -> anyhow::Result<()> {
    let decoder = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_gz_round_trips() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let gz = tar_gz_dir(src.path()).expect("tar");

        let dest = tempfile::TempDir::new().unwrap();
        untar_gz(&gz, dest.path()).expect("untar");
        assert_eq!(
            std::fs::read_to_string(dest.path().join("a.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn new_worker_starts_unbroken_and_open() {
        let w = HttpWorker::new("w1", "http://127.0.0.1:0");
        assert!(!w.is_broken());
        assert!(!w.is_closed());
    }
}
