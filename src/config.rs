//! `converge.toml` loading and resolution of stage, state backend and vault

use anyhow::{Context, Result};
use declarative::{DestroyStrategy, Engine, EngineBuilder, RunOptions, Stage, Vault};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::paths;
use crate::state::{FileStateStore, MemoryStateStore, SqliteStateStore, StateStore};

/// Config file name inside [`paths::config_dir`]
pub const CONFIG_FILE: &str = "converge.toml";

/// Stage override
pub const ENV_STAGE: &str = "CONVERGE_STAGE";

/// Local-emulation override (`1`/`true` or `0`/`false`)
pub const ENV_LOCAL: &str = "CONVERGE_LOCAL";

/// Default variable holding the secrets passphrase
pub const DEFAULT_PASSWORD_ENV: &str = "CONVERGE_PASSWORD";

/// Top-level configuration
///
/// ```toml
/// app = "shop"
/// stage = "dev"
///
/// [state]
/// backend = "sqlite"
/// path = "~/.converge/shop.db"
///
/// [secrets]
/// password_env = "SHOP_PASSWORD"
///
/// [destroy]
/// default_strategy = "parallel"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfig {
    pub app: Option<String>,
    pub stage: Option<String>,
    pub local: bool,
    pub adopt: bool,
    pub state: StateConfig,
    pub secrets: SecretsConfig,
    pub destroy: DestroyConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    /// Directory (file backend) or database file (sqlite backend)
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Environment variable holding the passphrase
    pub password_env: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            password_env: DEFAULT_PASSWORD_ENV.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestroyConfig {
    pub default_strategy: DestroyStrategy,
}

impl ConvergeConfig {
    /// Load `converge.toml` from the config directory, or defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_dir()?.join(CONFIG_FILE))
    }

    /// Load from an explicit path, or defaults if the file doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve the stage to run against
    ///
    /// Stage name priority: `CONVERGE_STAGE`, `stage` in the file, `$USER`,
    /// then `dev`.
    pub fn resolve_stage(&self) -> Result<Stage> {
        let app = self
            .app
            .as_deref()
            .context("No app configured; set `app` in converge.toml")?;
        let name = std::env::var(ENV_STAGE)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.stage.clone())
            .or_else(|| std::env::var("USER").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "dev".to_string());
        Stage::new(app, name).context("Invalid stage")
    }

    /// Run options from the file plus environment overrides
    pub fn run_options(&self) -> RunOptions {
        let local = match std::env::var(ENV_LOCAL).as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => self.local,
        };
        RunOptions {
            local,
            adopt: self.adopt,
            default_strategy: self.destroy.default_strategy,
            ..RunOptions::default()
        }
    }

    /// Where the configured backend keeps its data
    pub fn state_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state.path {
            return Ok(paths::expand(path));
        }
        let dir = paths::state_dir()?;
        Ok(match self.state.backend {
            StateBackend::Sqlite => dir.join("state.db"),
            StateBackend::File | StateBackend::Memory => dir.join("resources"),
        })
    }

    /// Open the configured state backend
    pub fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        let store: Arc<dyn StateStore> = match self.state.backend {
            StateBackend::File => {
                let root = self.state_path()?;
                log::debug!("Using file state store at {}", root.display());
                Arc::new(FileStateStore::new(root))
            }
            StateBackend::Sqlite => {
                let path = self.state_path()?;
                log::debug!("Using SQLite state store at {}", path.display());
                Arc::new(SqliteStateStore::open(&path)?)
            }
            StateBackend::Memory => {
                log::warn!("Using in-memory state; nothing will persist after this run");
                Arc::new(MemoryStateStore::new())
            }
        };
        Ok(store)
    }

    /// Vault keyed from the configured passphrase variable, if it is set
    pub fn open_vault(&self, stage: &Stage) -> Result<Option<Vault>> {
        Vault::from_env(&self.secrets.password_env, stage.to_string()).with_context(|| {
            format!(
                "Failed to derive secrets key from {}",
                self.secrets.password_env
            )
        })
    }

    /// Engine builder wired to the configured store and vault
    ///
    /// Register handlers on the result, then `build()`.
    pub fn engine_builder(&self, stage: &Stage) -> Result<EngineBuilder> {
        let mut builder = Engine::builder(self.open_store()?);
        match self.open_vault(stage)? {
            Some(vault) => builder = builder.vault(vault),
            None => log::debug!(
                "{} not set; runs with secrets will fail",
                self.secrets.password_env
            ),
        }
        Ok(builder)
    }
}
