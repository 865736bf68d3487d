use std::os::unix::process::ExitStatusExt as _;
use std::process::{ExitStatus, Output};

use anyhow::{anyhow, Context};

/// Extends [`Output`]/[`ExitStatus`] with the exit-code check we need everywhere: we want the
/// numeric code, and we want a real error (not a panic) if the child died from a signal instead
/// of exiting normally.
pub trait OutputExt {
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status.code_not_killed()
    }
}

impl OutputExt for ExitStatus {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.code()
            .ok_or_else(|| anyhow!("process killed by signal: {:?}", self.signal()))
    }
}

/// Run an async [`tokio::process::Command`] to completion, erroring out (with stderr attached)
/// if it didn't exit zero.
pub trait CommandExt {
    #[allow(async_fn_in_trait)]
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for tokio::process::Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self.output().await.context("spawning command")?;
        let code = output.code_not_killed()?;
        if code != 0 {
            return Err(anyhow!(
                "command failed with exit code {}: stderr:\n{}",
                code,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(output)
    }
}

/// Same as [`CommandExt`] but for [`std::process::Command`], for the handful of places (mostly
/// `Drop` impls) where we can't be async.
pub trait SyncCommandExt {
    fn execute(&mut self) -> anyhow::Result<Output>;
}

impl SyncCommandExt for std::process::Command {
    fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self.output().context("spawning command")?;
        let code = output.code_not_killed()?;
        if code != 0 {
            return Err(anyhow!(
                "command failed with exit code {}: stderr:\n{}",
                code,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_ok() {
        tokio::process::Command::new("true")
            .execute()
            .await
            .expect("true should succeed");
    }

    #[tokio::test]
    async fn execute_err() {
        let err = tokio::process::Command::new("false")
            .execute()
            .await
            .expect_err("false should fail");
        assert!(err.to_string().contains("exit code"));
    }
}
