use serde::Deserialize;

use crate::errors::ConfigError;

/// A user entry within a pool. `password` is accepted and parsed for
/// forward-compatibility with config files written for password-auth
/// backends, but is not read anywhere on the backend-authentication path:
/// this core only speaks to trust/no-password PostgreSQL servers.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl UserConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::Invalid("username must not be empty".into()));
        }
        Ok(())
    }
}
