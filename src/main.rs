mod build;
mod buildlet;
mod config;
mod dashboard;
mod errors;
mod fakebuildlet;
mod git;
mod pool;
mod process;
mod reverse;
mod scheduler;
mod sharder;
mod snapshot;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use build::{BuildDriver, BuildKey, BuildRequest, CommitDetail};
use config::CoordinatorConfig;
use dashboard::{FakeDashboard, LoggingErrorReporter};
use git::{rev_parse, LocalRepo};
use pool::{routes_from_host_types, CompositePool, LocalFakeProvisioner, Pool, QuotaPool, ReversePool};
use scheduler::{PriorityClass, Scheduler};
use snapshot::FakeSnapshotStore;

#[derive(Parser)]
#[command(author, version, about = "Build coordinator for a CI worker fleet", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-lived coordinator: the scheduler's dispatch loop, every configured pool, and
    /// (if configured) the reverse-dial registration listener. Runs until interrupted.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Drive exactly one build to completion against an in-process fake buildlet, printing its
    /// event timeline and exiting non-zero on failure. Used by integration tests and by a
    /// developer iterating on a single builder configuration without a real worker fleet.
    RunBuild {
        #[arg(long)]
        config: PathBuf,
        /// Path to the git repository holding the commit to build.
        #[arg(long)]
        repo: PathBuf,
        /// Revspec to resolve and build (e.g. `HEAD`, a branch, or a full hash).
        #[arg(long)]
        commit: String,
        #[arg(long)]
        builder: String,
        #[arg(long, default_value = "regular")]
        priority: String,
    },
}

fn parse_priority(s: &str) -> anyhow::Result<PriorityClass> {
    match s {
        "try" => Ok(PriorityClass::Try),
        "gomote" => Ok(PriorityClass::Gomote),
        "regular" => Ok(PriorityClass::Regular),
        other => Err(anyhow::anyhow!("unknown priority class {other:?}")),
    }
}

/// Build the runtime `Pool` a `Scheduler` dispatches against, from the coordinator's host-type
/// configuration. Cloud/container host types share one in-process fake provisioner (a real
/// deployment would swap this for the cloud SDK bindings this crate treats as opaque, per §1);
/// reverse host types get a `ReversePool` that the reverse-dial listener registers workers into.
fn build_pool(config: &CoordinatorConfig) -> (Arc<Pool>, Arc<ReversePool>) {
    let mut cloud_vm_limits = HashMap::new();
    let mut container_limits = HashMap::new();
    for (name, host) in &config.host_types {
        match host.pool_kind {
            config::PoolKind::CloudVm => {
                cloud_vm_limits.insert(name.clone(), host.max_concurrent);
            }
            config::PoolKind::Container => {
                container_limits.insert(name.clone(), host.max_concurrent);
            }
            config::PoolKind::Reverse => {}
        }
    }

    let reverse_pool = ReversePool::new();
    let cloud_vm_pool = (!cloud_vm_limits.is_empty())
        .then(|| QuotaPool::new(Arc::new(LocalFakeProvisioner::new()), cloud_vm_limits));
    let container_pool = (!container_limits.is_empty())
        .then(|| QuotaPool::new(Arc::new(LocalFakeProvisioner::new()), container_limits));

    let composite = CompositePool::new(
        cloud_vm_pool,
        container_pool,
        Some(reverse_pool.clone()),
        routes_from_host_types(&config.host_types),
    );
    (Arc::new(Pool::Composite(composite)), reverse_pool)
}

async fn cmd_serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Arc::new(CoordinatorConfig::load(&config_path)?);
    let (pool, reverse_pool) = build_pool(&config);
    let scheduler = Arc::new(Scheduler::new(
        pool,
        Duration::from_secs(config.starvation_threshold_s),
    ));

    let ct = CancellationToken::new();
    let mut tasks: tokio::task::JoinSet<anyhow::Result<()>> = tokio::task::JoinSet::new();

    tasks.spawn({
        let scheduler = scheduler.clone();
        let ct = ct.clone();
        async move {
            scheduler.run(ct).await;
            Ok(())
        }
    });

    if let (Some(addr), Some(secret)) = (&config.reverse_listen_addr, &config.reverse_secret) {
        let addr = addr.clone();
        let secret = secret.clone().into_bytes();
        let reverse_pool = reverse_pool.clone();
        let ct = ct.clone();
        tasks.spawn(async move { reverse::serve(&addr, secret, reverse_pool, ct).await });
    } else {
        log::info!("no reverse_listen_addr/reverse_secret configured, reverse pool stays empty");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
        }
        result = tasks.join_next() => {
            if let Some(result) = result {
                result.context("coordinator task panicked")??;
            }
        }
    }
    ct.cancel();
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn cmd_run_build(
    config_path: PathBuf,
    repo_path: PathBuf,
    commit: String,
    builder: String,
    priority: PriorityClass,
) -> anyhow::Result<bool> {
    let config = Arc::new(CoordinatorConfig::load(&config_path)?);
    let build_config = config.builder(&builder)?;
    let host_type = build_config.host_type.clone();

    let provisioner = Arc::new(LocalFakeProvisioner::new());
    let mut limits = HashMap::new();
    limits.insert(host_type, config.host_type(&build_config.host_type)?.max_concurrent);
    let quota_pool = QuotaPool::new(provisioner, limits);
    let pool = Arc::new(Pool::Container(quota_pool));
    let scheduler = Arc::new(Scheduler::new(
        pool,
        Duration::from_secs(config.starvation_threshold_s),
    ));

    let dispatch_ct = CancellationToken::new();
    let dispatcher = tokio::spawn(scheduler.clone().run(dispatch_ct.clone()));

    let repo = LocalRepo::open(repo_path.clone()).context("opening repository")?;
    let revision = rev_parse(&repo_path, &commit)
        .await
        .context("resolving commit")?;

    let driver = BuildDriver {
        config: config.clone(),
        scheduler,
        ancestry: Arc::new(repo),
        source: Arc::new(LocalRepo::open(repo_path)?),
        dashboard: FakeDashboard::new(),
        snapshots: FakeSnapshotStore::new(),
        error_reporter: Arc::new(LoggingErrorReporter),
        historical_durations: HashMap::new(),
    };

    let commit_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let outcome = driver
        .run(BuildRequest {
            key: BuildKey {
                primary_revision: revision.clone(),
                secondary_revision: None,
                builder_name: builder,
            },
            detail: CommitDetail {
                primary_branch: "HEAD".to_string(),
                primary_commit_time: commit_time,
                secondary_branch: None,
                secondary_commit_time: None,
                submitter_email: "local@localhost".to_string(),
            },
            priority,
        })
        .await;

    dispatch_ct.cancel();
    let _ = dispatcher.await;

    for event in &outcome.events {
        match &event.detail {
            Some(detail) => println!("{:?} {} ({detail})", event.time, event.name),
            None => println!("{:?} {}", event.time, event.name),
        }
    }
    println!(
        "revision={revision} status={:?} elapsed={:?}",
        outcome.status, outcome.elapsed
    );
    if !outcome.log.is_empty() {
        println!("--- log ---\n{}", String::from_utf8_lossy(&outcome.log));
    }

    Ok(outcome.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("try", PriorityClass::Try)]
    #[test_case("gomote", PriorityClass::Gomote)]
    #[test_case("regular", PriorityClass::Regular)]
    fn parse_priority_accepts_known_classes(input: &str, expected: PriorityClass) {
        assert_eq!(parse_priority(input).unwrap(), expected);
    }

    #[test_case("")]
    #[test_case("urgent")]
    #[test_case("TRY")]
    fn parse_priority_rejects_unknown_strings(input: &str) {
        assert!(parse_priority(input).is_err());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Serve { config } => cmd_serve(config).await,
        Command::RunBuild {
            config,
            repo,
            commit,
            builder,
            priority,
        } => {
            let priority = parse_priority(&priority)?;
            let ok = cmd_run_build(config, repo, commit, builder, priority).await?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
