use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context as _;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::errors::LocalError;

/// The three ways a host type can be provisioned. See `src/pool.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    CloudVm,
    Container,
    Reverse,
}

/// Configuration for one host type: everything the pool needs to provision or recognize a
/// worker of this kind, but nothing about which builders use it.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub pool_kind: PoolKind,
    #[serde(default)]
    pub image: Option<String>,
    pub owner: String,
    #[serde(default)]
    pub bootstrap_toolchain_url: Option<String>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    /// Maximum number of simultaneous workers of this host type. Only meaningful for
    /// `cloud_vm`/`container`; reverse pools are bounded by however many buildlets actually
    /// dial in.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    1
}

/// Configuration for one builder: a (mostly) static identity plus the knobs that change how its
/// builds run.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub host_type: String,
    pub goos: String,
    pub goarch: String,
    #[serde(default)]
    pub run_bench: bool,
    #[serde(default)]
    pub race: bool,
    #[serde(default)]
    pub cross_compile_only: bool,
    #[serde(default)]
    pub go_deps: Vec<String>,
    #[serde(default = "default_test_timeout_scale")]
    pub test_timeout_scale: f64,
    #[serde(default)]
    pub skip_snapshot: bool,
    #[serde(default)]
    pub long_test: bool,
    #[serde(default)]
    pub secondary_repo: Option<String>,
}

fn default_test_timeout_scale() -> f64 {
    1.0
}

/// Top-level coordinator configuration, as parsed from TOML. This is the ambient config layer
/// the rest of the system depends on: `host_types`/`builders` back the scheduler and the pools,
/// the rest are tuning knobs for the build driver and sharder.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub host_types: HashMap<String, HostConfig>,
    pub builders: HashMap<String, BuildConfig>,
    #[serde(default = "default_starvation_threshold_s")]
    pub starvation_threshold_s: u64,
    #[serde(default = "default_shard_budget_s")]
    pub shard_budget_s: u64,
    #[serde(default)]
    pub flaky_builder_prefixes: Vec<String>,
    #[serde(default)]
    pub reverse_listen_addr: Option<String>,
    #[serde(default)]
    pub reverse_secret: Option<String>,
    #[serde(default = "default_dep_check_retries")]
    pub dep_check_retries: u32,
}

fn default_starvation_threshold_s() -> u64 {
    6 * 3600
}

fn default_shard_budget_s() -> u64 {
    7 * 60
}

fn default_dep_check_retries() -> u32 {
    3
}

impl CoordinatorConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {:?}", path))?;
        let config: Self = toml::from_str(&content).context("parsing config")?;
        config.validate().context("validating config")?;
        Ok(config)
    }

    /// Rejects any configuration that names a host type that doesn't exist. We do this eagerly,
    /// at load time, rather than waiting for a build to try to use the broken builder: a
    /// misconfigured builder should fail the coordinator's startup, not a user's build.
    pub fn validate(&self) -> Result<(), LocalError> {
        for (name, build) in &self.builders {
            if !self.host_types.contains_key(&build.host_type) {
                return Err(LocalError::Invalid(format!(
                    "builder {name:?} references unknown host type {:?}",
                    build.host_type
                )));
            }
        }
        Ok(())
    }

    pub fn builder(&self, name: &str) -> Result<&BuildConfig, LocalError> {
        self.builders
            .get(name)
            .ok_or_else(|| LocalError::UnknownBuilder(name.to_string()))
    }

    pub fn host_type(&self, name: &str) -> Result<&HostConfig, LocalError> {
        self.host_types
            .get(name)
            .ok_or_else(|| LocalError::UnknownHostType(name.to_string()))
    }

    /// Whether a builder has been flagged as flaky, for the purposes of terminal-error
    /// promotion (see `CoordError::promote_transport_to_remote`).
    pub fn is_flaky(&self, builder_name: &str) -> bool {
        self.flaky_builder_prefixes
            .iter()
            .any(|prefix| builder_name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        [host_types.linux-amd64]
        pool_kind = "container"
        owner = "infra-team"
        image = "linux-amd64-ci"

        [host_types.darwin-arm64]
        pool_kind = "reverse"
        owner = "infra-team"

        [builders.linux-amd64-race]
        host_type = "linux-amd64"
        goos = "linux"
        goarch = "amd64"
        race = true

        [builders.darwin-arm64]
        host_type = "darwin-arm64"
        goos = "darwin"
        goarch = "arm64"
        "#
    }

    #[test]
    fn parses_and_validates_sample() {
        let config: CoordinatorConfig = toml::from_str(sample_toml()).expect("parse");
        config.validate().expect("validate");
        assert_eq!(config.builders.len(), 2);
        assert!(config.builder("linux-amd64-race").unwrap().race);
    }

    #[test]
    fn rejects_unknown_host_type() {
        let bad = sample_toml().replace("host_type = \"linux-amd64\"", "host_type = \"bogus\"");
        let config: CoordinatorConfig = toml::from_str(&bad).expect("parse");
        assert!(matches!(config.validate(), Err(LocalError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_fields() {
        let bad = sample_toml().replace(
            "race = true",
            "race = true\n        made_up_field = 1",
        );
        assert!(toml::from_str::<CoordinatorConfig>(&bad).is_err());
    }

    #[test]
    fn flaky_prefix_matching() {
        let mut config: CoordinatorConfig = toml::from_str(sample_toml()).expect("parse");
        config.flaky_builder_prefixes = vec!["darwin-".to_string()];
        assert!(config.is_flaky("darwin-arm64"));
        assert!(!config.is_flaky("linux-amd64-race"));
    }
}
