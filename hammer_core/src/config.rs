use crate::app::{App, AppError, AppRegistry, LaunchConfig};
use crate::generator::{
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_SKIPPED_PULLS, GeneratorKind, GeneratorLimits,
};
use crate::message::PayloadFormat;
use crate::mutator::MutatorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    UnknownApp(#[from] AppError),
    #[error("App '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("No seed sources configured")]
    NoSeeds,
    #[error("Seed sources {0:?} contain no seeds")]
    EmptySeedPool(Vec<PathBuf>),
    #[error("`workers` must be at least 1")]
    ZeroWorkers,
    #[error("`{0}` must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("Multi-order generation needs `order` of at least 1")]
    ZeroOrder,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    #[serde(default)]
    pub kind: GeneratorKind,
    /// Mutations per input for `multi-order`; ignored by `random`.
    #[serde(default = "default_order")]
    pub order: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_max_skipped_pulls")]
    pub max_skipped_pulls: usize,
}

fn default_order() -> usize {
    2
}
fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}
fn default_max_skipped_pulls() -> usize {
    DEFAULT_MAX_SKIPPED_PULLS
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::default(),
            order: default_order(),
            max_retries: default_max_retries(),
            max_skipped_pulls: default_max_skipped_pulls(),
        }
    }
}

impl GeneratorSettings {
    pub fn limits(&self) -> GeneratorLimits {
        GeneratorLimits {
            max_retries: self.max_retries,
            max_skipped_pulls: self.max_skipped_pulls,
        }
    }
}

/// Stopping conditions. Both unset means run until the generator ends or
/// the session is stopped.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BudgetSettings {
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    /// Name of an `[apps.<name>]` table.
    pub app: String,
    /// Seed files or directories.
    #[serde(default)]
    pub seeds: Vec<PathBuf>,
    #[serde(default)]
    pub mutator: MutatorKind,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_out")]
    pub out: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_consecutive_infra_errors")]
    pub max_consecutive_infra_errors: u32,
    /// Fixed RNG seed for reproducible sessions; random when unset.
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    /// Response substrings that count as a crash.
    #[serde(default)]
    pub failure_patterns: Vec<String>,
    #[serde(default)]
    pub launch_env: BTreeMap<String, String>,
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}
fn default_startup_timeout_ms() -> u64 {
    10_000
}
pub fn default_out() -> PathBuf {
    PathBuf::from("./hammer-out")
}
fn default_workers() -> usize {
    1
}
fn default_max_consecutive_infra_errors() -> u32 {
    5
}

impl SessionSettings {
    pub fn new(app: impl Into<String>, seeds: Vec<PathBuf>) -> Self {
        Self {
            app: app.into(),
            seeds,
            mutator: MutatorKind::default(),
            generator: GeneratorSettings::default(),
            budget: BudgetSettings::default(),
            timeout_ms: default_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            out: default_out(),
            workers: default_workers(),
            max_consecutive_infra_errors: default_max_consecutive_infra_errors(),
            random_seed: None,
            payload_format: PayloadFormat::default(),
            failure_patterns: Vec::new(),
            launch_env: BTreeMap::new(),
            scratch_root: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            env: self.launch_env.clone(),
            working_dir: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HammerConfig {
    pub session: SessionSettings,
    #[serde(default)]
    pub apps: AppRegistry,
}

impl HammerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The app this session fuzzes.
    pub fn app(&self) -> Result<&App, ConfigError> {
        Ok(self.apps.resolve(&self.session.app)?)
    }

    /// Checks everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let app = self.app()?;
        if app.full_command().is_empty() {
            return Err(ConfigError::EmptyCommand(self.session.app.clone()));
        }
        let session = &self.session;
        if session.seeds.is_empty() {
            return Err(ConfigError::NoSeeds);
        }
        if session.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if session.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("timeout-ms"));
        }
        if session.startup_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("startup-timeout-ms"));
        }
        if session.generator.kind == GeneratorKind::MultiOrder && session.generator.order == 0 {
            return Err(ConfigError::ZeroOrder);
        }
        Ok(())
    }
}
