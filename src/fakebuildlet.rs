//! An in-process implementation of the worker wire protocol, backed by a real subprocess and a
//! scratch directory on the local machine. This is the "minimal in-process fake provisioner"
//! used by `run-build` (single-build CLI mode, no cloud/container/reverse fleet needed) and by
//! integration tests that want a real `HttpWorker` talking over real HTTP without standing up an
//! actual VM or container.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpListener;

use crate::buildlet::{tar_gz_dir, untar_gz, HttpWorker};

#[derive(Clone)]
struct FakeState {
    work_dir: PathBuf,
}

#[derive(Deserialize)]
struct DirQuery {
    dir: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    work_dir: String,
}

async fn handle_status(State(state): State<FakeState>) -> impl IntoResponse {
    axum::Json(StatusResponse {
        version: "fake-buildlet-1".to_string(),
        work_dir: state.work_dir.to_string_lossy().to_string(),
    })
}

async fn handle_put_tar(
    State(state): State<FakeState>,
    Query(q): Query<DirQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let dest = match &q.dir {
        Some(d) => state.work_dir.join(d),
        None => state.work_dir.clone(),
    };
    if let Err(e) = tokio::fs::create_dir_all(&dest).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match untar_gz(&body, &dest) {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn handle_get_tar(
    State(state): State<FakeState>,
    Query(q): Query<DirQuery>,
) -> impl IntoResponse {
    let src = match &q.dir {
        Some(d) => state.work_dir.join(d),
        None => state.work_dir.clone(),
    };
    match tar_gz_dir(&src) {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct RemoveAllForm {
    path: Vec<String>,
}

async fn handle_remove_all(
    State(state): State<FakeState>,
    axum::Form(form): axum::Form<RemoveAllForm>,
) -> impl IntoResponse {
    for p in form.path {
        let target = state.work_dir.join(&p);
        let _ = tokio::fs::remove_dir_all(&target).await;
        let _ = tokio::fs::remove_file(&target).await;
    }
    StatusCode::OK
}

#[derive(Serialize)]
struct LsEntry {
    name: String,
    size: u64,
    is_dir: bool,
    mod_time_unix: i64,
}

async fn handle_ls(State(state): State<FakeState>, Query(q): Query<DirQuery>) -> impl IntoResponse {
    let dir = match &q.dir {
        Some(d) => state.work_dir.join(d),
        None => state.work_dir.clone(),
    };
    let mut entries = Vec::new();
    let mut rd = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    while let Ok(Some(entry)) = rd.next_entry().await {
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        use std::os::unix::fs::MetadataExt;
        entries.push(LsEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            size: meta.len(),
            is_dir: meta.is_dir(),
            mod_time_unix: meta.mtime(),
        });
    }
    axum::Json(entries).into_response()
}

#[derive(Deserialize)]
struct ExecQuery {
    cmd: String,
    #[serde(default)]
    arg: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

async fn handle_exec(
    State(state): State<FakeState>,
    Query(q): Query<ExecQuery>,
) -> impl IntoResponse {
    let mut cmd = tokio::process::Command::new(&q.cmd);
    cmd.args(&q.arg);
    let working_dir = match &q.dir {
        Some(d) => state.work_dir.join(d),
        None => state.work_dir.clone(),
    };
    cmd.current_dir(&working_dir);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    for kv in &q.env {
        if let Some((k, v)) = kv.split_once('=') {
            cmd.env(k, v);
        }
    }
    if let Some(path) = &q.path {
        cmd.env("PATH", path);
    }

    let output = match cmd.output().await {
        Ok(o) => o,
        Err(e) => {
            let mut headers = HeaderMap::new();
            headers.insert("x-exit-code", HeaderValue::from_static("127"));
            return (
                StatusCode::OK,
                headers,
                format!("failed to spawn {}: {e}", q.cmd).into_bytes(),
            );
        }
    };
    let mut body = output.stdout;
    body.extend_from_slice(&output.stderr);
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-exit-code",
        HeaderValue::from_str(&output.status.code().unwrap_or(-1).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("-1")),
    );
    (StatusCode::OK, headers, body)
}

async fn handle_halt() -> impl IntoResponse {
    StatusCode::OK
}

/// A fake buildlet running in this same process, listening on a loopback TCP port. Its work dir
/// is a temporary directory cleaned up on drop.
pub struct FakeBuildlet {
    addr: SocketAddr,
    _work_dir: tempfile::TempDir,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl FakeBuildlet {
    pub async fn spawn() -> anyhow::Result<Self> {
        let work_dir = tempfile::TempDir::new()?;
        let state = FakeState {
            work_dir: work_dir.path().to_path_buf(),
        };
        let app = Router::new()
            .route("/status", get(handle_status))
            .route("/tar", post(handle_put_tar).get(handle_get_tar))
            .route("/removeall", post(handle_remove_all))
            .route("/ls", get(handle_ls))
            .route("/exec", post(handle_exec))
            .route("/halt", post(handle_halt))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            _work_dir: work_dir,
            shutdown: Some(tx),
        })
    }

    pub fn client(&self, name: &str) -> HttpWorker {
        HttpWorker::new(name, format!("http://{}", self.addr))
    }
}

impl Drop for FakeBuildlet {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::buildlet::ExecOpts;

    #[tokio::test]
    async fn round_trips_tar_and_exec() {
        let fb = FakeBuildlet::spawn().await.expect("spawn fake buildlet");
        let worker = fb.client("w0");

        let src = tempfile::TempDir::new().unwrap();
        std::fs::write(src.path().join("greeting.txt"), b"hi there").unwrap();
        let gz = tar_gz_dir(src.path()).unwrap();
        worker.put_tar(gz, None).await.expect("put_tar");

        let mut out = Vec::new();
        let outcome = worker
            .exec(
                "cat",
                &ExecOpts {
                    args: vec!["greeting.txt".to_string()],
                    ..Default::default()
                },
                &mut out,
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(out, b"hi there");
    }

    #[tokio::test]
    async fn exec_reports_nonzero_exit_as_remote_error() {
        let fb = FakeBuildlet::spawn().await.expect("spawn fake buildlet");
        let worker = fb.client("w0");
        let mut out = Vec::new();
        let outcome = worker
            .exec(
                "sh",
                &ExecOpts {
                    args: vec!["-c".to_string(), "exit 7".to_string()],
                    ..Default::default()
                },
                &mut out,
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.transport.is_none());
        assert!(matches!(
            outcome.remote,
            Some(crate::errors::RemoteError::NonZeroExit { code: 7, .. })
        ));
    }
}
