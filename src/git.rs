use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use tokio::process::Command;

use crate::errors::TransportError;
use crate::process::CommandExt;

// This module contains the narrow slice of git plumbing the coordinator actually needs: deciding
// whether one commit is an ancestor of another (dep-check), and producing a source tarball for a
// given commit (materialize). Discovering *which* commits need building at all is somebody
// else's job (the revision-control mirror that feeds us build requests); we only ever look at
// commits we've already been told about.

/// A resolved commit hash. We don't validate the hex here, git will reject it for us if it's
/// bogus; this is just strong enough typing to stop us passing a branch name where a specific
/// commit is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The external service that knows about commit ancestry. The coordinator's own copy is just a
/// bare mirror of the repository being built; a real deployment might instead ask a code-review
/// system directly. Kept as a narrow trait so the dep-check phase in `build.rs` can be tested
/// against a fake without shelling out to git at all.
pub trait AncestryService: Send + Sync {
    #[allow(async_fn_in_trait)]
    async fn is_ancestor(
        &self,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> Result<bool, TransportError>;
}

/// The external service that can produce a source tree for a commit, as a tarball. In
/// production this is backed by the same mirror as [`AncestryService`]; kept separate because a
/// build driver under test may want a cache in front of one but not the other.
pub trait SourceCache: Send + Sync {
    #[allow(async_fn_in_trait)]
    async fn fetch_source_tar_gz(&self, commit: &CommitHash) -> Result<Vec<u8>, TransportError>;
}

/// Ancestry/source-tarball service backed directly by a local bare (or non-bare) git checkout,
/// driven entirely via the `git` CLI. We go through the CLI rather than a library for the same
/// reason as the rest of this corpus: the CLI is cancellable (it's just a subprocess) and it's
/// the actually-supported interface.
pub struct LocalRepo {
    path: PathBuf,
}

impl LocalRepo {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if !path.join(".git").exists() && !path.join("HEAD").exists() {
            return Err(anyhow!("{:?} doesn't look like a git repository", path));
        }
        Ok(Self { path })
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.path);
        cmd
    }
}

impl AncestryService for LocalRepo {
    async fn is_ancestor(
        &self,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> Result<bool, TransportError> {
        let output = self
            .git()
            .args(["merge-base", "--is-ancestor"])
            .arg(ancestor.as_str())
            .arg(descendant.as_str())
            .output()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(TransportError::Io(format!(
                "git merge-base --is-ancestor exited unexpectedly: {}",
                String::from_utf8_lossy(&output.stderr)
            ))),
        }
    }
}

impl SourceCache for LocalRepo {
    async fn fetch_source_tar_gz(&self, commit: &CommitHash) -> Result<Vec<u8>, TransportError> {
        let archive = self
            .git()
            .args(["archive", "--format=tar"])
            .arg(commit.as_str())
            .output()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !archive.status.success() {
            return Err(TransportError::Io(format!(
                "git archive failed: {}",
                String::from_utf8_lossy(&archive.stderr)
            )));
        }
        gzip(&archive.stdout).map_err(|e| TransportError::Io(e.to_string()))
    }
}

fn gzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    use std::io::Write as _;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("writing tar to gzip")?;
    encoder.finish().context("finishing gzip stream")
}

/// Resolve a revspec (branch, tag, `HEAD`, etc.) against a local repository. Used by the CLI's
/// `run-build` entry point, which is handed human-friendly refs rather than raw hashes.
pub async fn rev_parse(repo_path: &std::path::Path, rev_spec: &str) -> anyhow::Result<CommitHash> {
    let stdout = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .arg("rev-parse")
        .arg(rev_spec)
        .execute()
        .await
        .context("'git rev-parse' failed")?
        .stdout;
    let s = String::from_utf8(stdout).context("reading git rev-parse output")?;
    Ok(CommitHash::new(s.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(path: &std::path::Path) {
        Command::new("git")
            .arg("init")
            .current_dir(path)
            .execute()
            .await
            .expect("git init");
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(path)
            .execute()
            .await
            .expect("git config email");
        Command::new("git")
            .args(["config", "user.name", "test"])
            .current_dir(path)
            .execute()
            .await
            .expect("git config name");
    }

    async fn commit(path: &std::path::Path, msg: &str) -> CommitHash {
        Command::new("git")
            .args(["commit", "--allow-empty", "-m", msg])
            .current_dir(path)
            .execute()
            .await
            .expect("git commit");
        rev_parse(path, "HEAD").await.expect("rev-parse HEAD")
    }

    #[tokio::test]
    async fn is_ancestor_true_and_false() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        init_repo(dir.path()).await;
        let base = commit(dir.path(), "base").await;
        let tip = commit(dir.path(), "tip").await;

        let repo = LocalRepo::open(dir.path().to_path_buf()).expect("open repo");
        assert!(repo
            .is_ancestor(&base, &tip)
            .await
            .expect("is_ancestor base<tip"));
        assert!(!repo
            .is_ancestor(&tip, &base)
            .await
            .expect("is_ancestor tip<base"));
    }

    #[tokio::test]
    async fn fetch_source_tar_gz_round_trips_through_gzip() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("hello.txt"), b"hi").expect("write file");
        Command::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .execute()
            .await
            .expect("git add");
        let commit_hash = commit(dir.path(), "add file").await;

        let repo = LocalRepo::open(dir.path().to_path_buf()).expect("open repo");
        let gz = repo
            .fetch_source_tar_gz(&commit_hash)
            .await
            .expect("archive commit");
        // gzip magic number.
        assert_eq!(&gz[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn open_rejects_non_repo() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        assert!(LocalRepo::open(dir.path().to_path_buf()).is_err());
    }
}
