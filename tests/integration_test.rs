//! Black-box tests that exercise the real `coordinatord` binary as a subprocess, the same way
//! the teacher's own integration suite drives its binary: spawn it, feed it real inputs (a git
//! repo, a TOML config), and observe its exit status and output rather than calling into the
//! crate directly.

use std::net::TcpListener as StdTcpListener;
use std::process::Stdio;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha3::Sha3_256;
use test_bin::get_test_bin;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

async fn init_repo_with_commit(dir: &std::path::Path) -> anyhow::Result<()> {
    async fn run(dir: &std::path::Path, args: &[&str]) -> anyhow::Result<()> {
        let status = Command::new("git")
            .current_dir(dir)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        anyhow::ensure!(status.success(), "git {args:?} failed");
        Ok(())
    }
    run(dir, &["init"]).await?;
    run(dir, &["config", "user.email", "ci@example.com"]).await?;
    run(dir, &["config", "user.name", "ci"]).await?;
    run(dir, &["commit", "--allow-empty", "-m", "root commit"]).await?;
    Ok(())
}

fn base_config(extra_builder_lines: &str) -> String {
    format!(
        r#"
[host_types.linux-amd64]
pool_kind = "container"
owner = "infra-team"

{extra_builder_lines}
"#
    )
}

#[tokio::test]
async fn run_build_skips_when_dependency_is_missing() {
    let repo = tempfile::TempDir::new().unwrap();
    init_repo_with_commit(repo.path()).await.unwrap();

    let config = base_config(
        r#"
[builders.linux-amd64]
host_type = "linux-amd64"
goos = "linux"
goarch = "amd64"
go_deps = ["0000000000000000000000000000000000dead"]
"#,
    );
    let config_path = repo.path().join("coordinator.toml");
    std::fs::write(&config_path, config).unwrap();

    let output = get_test_bin("coordinatord")
        .args([
            "run-build",
            "--config",
            config_path.to_str().unwrap(),
            "--repo",
            repo.path().to_str().unwrap(),
            "--commit",
            "HEAD",
            "--builder",
            "linux-amd64",
        ])
        .output()
        .expect("spawn coordinatord run-build");

    assert!(
        output.status.success(),
        "run-build should report success for a deliberately skipped build: {:?}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("skipped_build_missing_dep"),
        "expected skip event in output, got: {stdout}"
    );
}

#[tokio::test]
async fn run_build_fails_fast_for_unknown_builder() {
    let repo = tempfile::TempDir::new().unwrap();
    init_repo_with_commit(repo.path()).await.unwrap();

    let config = base_config(
        r#"
[builders.linux-amd64]
host_type = "linux-amd64"
goos = "linux"
goarch = "amd64"
"#,
    );
    let config_path = repo.path().join("coordinator.toml");
    std::fs::write(&config_path, config).unwrap();

    let output = get_test_bin("coordinatord")
        .args([
            "run-build",
            "--config",
            config_path.to_str().unwrap(),
            "--repo",
            repo.path().to_str().unwrap(),
            "--commit",
            "HEAD",
            "--builder",
            "does-not-exist",
        ])
        .output()
        .expect("spawn coordinatord run-build");

    assert!(
        !output.status.success(),
        "run-build should fail fast for a builder name the config doesn't know about"
    );
}

#[tokio::test]
async fn serve_rejects_config_with_dangling_host_type_reference() {
    let repo = tempfile::TempDir::new().unwrap();
    // `serve` doesn't need a repo at all, but reuse the tempdir for the config file.
    let config = r#"
[host_types.linux-amd64]
pool_kind = "container"
owner = "infra-team"

[builders.linux-amd64-race]
host_type = "some-host-type-nobody-declared"
goos = "linux"
goarch = "amd64"
"#;
    let config_path = repo.path().join("coordinator.toml");
    std::fs::write(&config_path, config).unwrap();

    let output = get_test_bin("coordinatord")
        .args(["serve", "--config", config_path.to_str().unwrap()])
        .output()
        .expect("spawn coordinatord serve");

    assert!(
        !output.status.success(),
        "serve should refuse to start against a config that references an unknown host type"
    );
}

/// Recomputes the reverse-dial registration HMAC the same way `src/reverse.rs` does, since this
/// black-box test can't reach into the binary's internals: HMAC-SHA3-256 of the builder type,
/// keyed by the shared secret, hex-encoded.
fn registration_key(secret: &[u8], builder_type: &str) -> String {
    let mut mac = Hmac::<Sha3_256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(builder_type.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[test_log::test(tokio::test)]
async fn reverse_dial_listener_accepts_a_correctly_signed_registration() {
    // Reserve a free port, then release it immediately; the child process binds it next. Small
    // window for a collision, acceptable in a single-machine test run.
    let port = {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let addr = format!("127.0.0.1:{port}");
    let secret = "reverse-dial-test-secret";

    let repo = tempfile::TempDir::new().unwrap();
    let config = format!(
        r#"
reverse_listen_addr = "{addr}"
reverse_secret = "{secret}"

[host_types.darwin-arm64]
pool_kind = "reverse"
owner = "infra-team"

[builders]
"#
    );
    let config_path = repo.path().join("coordinator.toml");
    std::fs::write(&config_path, config).unwrap();

    let mut child = get_test_bin("coordinatord")
        .args(["serve", "--config", config_path.to_str().unwrap()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn coordinatord serve");

    // Give the listener a moment to come up.
    let url = format!("http://{addr}/register");
    let client = reqwest::Client::new();
    let hostname = "reverse-worker-1.example.com";
    let key = registration_key(secret.as_bytes(), "darwin-arm64");

    let mut last_err = None;
    let mut response = None;
    for _ in 0..20 {
        let attempt = client
            .post(&url)
            .header("X-Go-Builder-Type", "darwin-arm64")
            .header("X-Go-Builder-Hostname", hostname)
            .header("X-Go-Builder-Key", &key)
            .header("X-Go-Builder-Version", "test-1")
            .send()
            .await;
        match attempt {
            Ok(resp) => {
                response = Some(resp);
                break;
            }
            Err(e) => {
                last_err = Some(e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
    let response = response.unwrap_or_else(|| {
        panic!("listener never came up: {last_err:?}");
    });

    assert_eq!(response.status(), reqwest::StatusCode::SWITCHING_PROTOCOLS);

    let _ = timeout(Duration::from_secs(2), child.kill()).await;
}
