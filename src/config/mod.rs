//! Configuration surface: a single TOML file loaded into a typed [`Config`],
//! validated at load time and held behind an [`ArcSwap`] so a `SIGHUP` can
//! swap in a freshly validated copy without restarting the process.

mod general;
mod pool;
mod user;

pub use general::General;
pub use pool::PoolConfig;
pub use user::UserConfig;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;

use crate::errors::ConfigError;

/// The three backend-connection assignment policies this core supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    Session,
    Transaction,
    Statement,
}

/// TLS negotiation policy, shared by the client-facing listener and the
/// backend connector (each side configures its own mode independently).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl TlsMode {
    pub fn requires_tls(self) -> bool {
        matches!(self, Self::Require | Self::VerifyCa | Self::VerifyFull)
    }

    pub fn verifies_hostname(self) -> bool {
        matches!(self, Self::VerifyFull)
    }

    pub fn verifies_ca(self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub path: PathBuf,
    pub general: General,
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::Invalid("no pools configured".into()));
        }
        self.general.validate()?;
        for (name, pool) in &self.pools {
            pool.validate().map_err(|e| {
                ConfigError::Invalid(format!("pool `{name}`: {e}"))
            })?;
        }
        Ok(())
    }

    /// Find the pool config and user entry for a `(database, user)` pair.
    /// Pools are keyed by the client-visible database name, matching the
    /// distilled spec's literal `(database, user)` pool key.
    pub fn find_user(&self, database: &str, user: &str) -> Option<(&PoolConfig, &UserConfig)> {
        let pool = self.pools.get(database)?;
        let user_config = pool.users.iter().find(|u| u.username == user)?;
        Some((pool, user_config))
    }
}

pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    config.path = path.to_path_buf();
    config.validate()?;
    Ok(config)
}

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::empty()));

impl Config {
    fn empty() -> Self {
        Config {
            path: PathBuf::new(),
            general: General::default(),
            pools: HashMap::new(),
        }
    }
}

pub fn get_config() -> std::sync::Arc<Config> {
    CONFIG.load_full()
}

pub fn set_config(config: Config) {
    CONFIG.store(std::sync::Arc::new(config));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_config_without_pools() {
        let config = Config::empty();
        assert!(config.validate().is_err());
    }
}
