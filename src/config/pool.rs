use serde::Deserialize;

use super::{PoolMode, TlsMode, UserConfig};
use crate::errors::ConfigError;

/// Per-pool configuration: the backend target, the release policy, and the
/// timeouts that govern this pool's connections. Keyed in [`Config::pools`]
/// by the client-visible database name.
///
/// [`Config::pools`]: super::Config::pools
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub server_host: String,
    pub server_port: u16,

    pub pool_mode: PoolMode,

    #[serde(default = "PoolConfig::default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "PoolConfig::default_server_connect_timeout_ms")]
    pub server_connect_timeout_ms: u64,
    #[serde(default = "PoolConfig::default_server_idle_timeout_ms")]
    pub server_idle_timeout_ms: u64,

    #[serde(default = "PoolConfig::default_server_tls_mode")]
    pub server_tls_mode: TlsMode,
    pub server_tls_key_file: Option<String>,
    pub server_tls_cert_file: Option<String>,
    pub server_tls_ca_file: Option<String>,

    pub users: Vec<UserConfig>,
}

impl PoolConfig {
    fn default_pool_size() -> u32 {
        20
    }
    fn default_server_connect_timeout_ms() -> u64 {
        3_000
    }
    fn default_server_idle_timeout_ms() -> u64 {
        0
    }
    fn default_server_tls_mode() -> TlsMode {
        TlsMode::Disable
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.server_connect_timeout_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "server_connect_timeout_ms must be at least 1000".into(),
            ));
        }
        if self.server_tls_mode.verifies_ca() && self.server_tls_ca_file.is_none() {
            return Err(ConfigError::Invalid(
                "server_tls_mode verify-ca/verify-full requires server_tls_ca_file".into(),
            ));
        }
        if self.server_tls_key_file.is_some() != self.server_tls_cert_file.is_some() {
            return Err(ConfigError::Invalid(
                "server_tls_key_file and server_tls_cert_file must be set together".into(),
            ));
        }
        if self.users.is_empty() {
            return Err(ConfigError::Invalid("pool has no users configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            user.validate()?;
            if !seen.insert(&user.username) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate user `{}`",
                    user.username
                )));
            }
        }
        Ok(())
    }
}
