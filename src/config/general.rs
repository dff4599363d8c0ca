use serde::Deserialize;

use super::TlsMode;
use crate::errors::ConfigError;

/// Process-wide settings: the client listener, the runtime, and the
/// client-facing TLS policy. Per-backend settings live in [`PoolConfig`].
///
/// [`PoolConfig`]: super::PoolConfig
#[derive(Debug, Clone, Deserialize)]
pub struct General {
    #[serde(default = "General::default_listen_host")]
    pub listen_host: String,
    #[serde(default = "General::default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "General::default_max_client_conn")]
    pub max_client_conn: u32,

    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "General::default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Armed on accept; 0 disables. Lives here (not per-pool) because the
    /// pool a client belongs to is not known until its `Startup` frame
    /// has been parsed.
    #[serde(default = "General::default_client_login_timeout_ms")]
    pub client_login_timeout_ms: u64,
    #[serde(default)]
    pub client_idle_timeout_ms: u64,

    #[serde(default = "General::default_true")]
    pub log_client_connections: bool,
    #[serde(default = "General::default_true")]
    pub log_client_disconnections: bool,

    #[serde(default = "General::default_client_tls_mode")]
    pub client_tls_mode: TlsMode,
    pub client_tls_key_file: Option<String>,
    pub client_tls_cert_file: Option<String>,
    pub client_tls_ca_file: Option<String>,
}

impl General {
    fn default_listen_host() -> String {
        "0.0.0.0".to_string()
    }
    fn default_listen_port() -> u16 {
        6432
    }
    fn default_max_client_conn() -> u32 {
        100
    }
    fn default_worker_threads() -> usize {
        4
    }
    fn default_shutdown_timeout_ms() -> u64 {
        10_000
    }
    fn default_client_login_timeout_ms() -> u64 {
        60_000
    }
    fn default_true() -> bool {
        true
    }
    fn default_client_tls_mode() -> TlsMode {
        TlsMode::Disable
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_client_conn == 0 {
            return Err(ConfigError::Invalid(
                "max_client_conn must be at least 1".into(),
            ));
        }
        if self.client_login_timeout_ms != 0 && self.client_login_timeout_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "client_login_timeout_ms must be 0 or at least 1000".into(),
            ));
        }
        if self.client_tls_mode != TlsMode::Disable
            && (self.client_tls_key_file.is_none() || self.client_tls_cert_file.is_none())
        {
            return Err(ConfigError::Invalid(
                "client_tls_mode requires client_tls_key_file and client_tls_cert_file".into(),
            ));
        }
        if self.client_tls_mode.verifies_ca() && self.client_tls_ca_file.is_none() {
            return Err(ConfigError::Invalid(
                "client_tls_mode verify-ca/verify-full requires client_tls_ca_file".into(),
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        General {
            listen_host: Self::default_listen_host(),
            listen_port: Self::default_listen_port(),
            max_client_conn: Self::default_max_client_conn(),
            worker_threads: Self::default_worker_threads(),
            shutdown_timeout_ms: Self::default_shutdown_timeout_ms(),
            client_login_timeout_ms: Self::default_client_login_timeout_ms(),
            client_idle_timeout_ms: 0,
            log_client_connections: true,
            log_client_disconnections: true,
            client_tls_mode: Self::default_client_tls_mode(),
            client_tls_key_file: None,
            client_tls_cert_file: None,
            client_tls_ca_file: None,
        }
    }
}
