use crate::config::{Config, TlsMode};
use crate::errors::ConfigError;

/// Builds the client-facing TLS acceptor from `General`'s TLS fields, or
/// `None` if `client_tls_mode` is `disable`. Config validation already
/// guarantees key+cert are present whenever a mode other than `disable`
/// is configured.
pub async fn build_client_acceptor(
    config: &Config,
) -> Result<Option<tokio_native_tls::TlsAcceptor>, ConfigError> {
    if config.general.client_tls_mode == TlsMode::Disable {
        return Ok(None);
    }

    let cert_path = config
        .general
        .client_tls_cert_file
        .as_ref()
        .ok_or_else(|| ConfigError::Invalid("client_tls_cert_file is required".into()))?;
    let key_path = config
        .general
        .client_tls_key_file
        .as_ref()
        .ok_or_else(|| ConfigError::Invalid("client_tls_key_file is required".into()))?;

    let cert_pem = tokio::fs::read(cert_path)
        .await
        .map_err(|source| ConfigError::Read {
            path: cert_path.clone(),
            source,
        })?;
    let key_pem = tokio::fs::read(key_path)
        .await
        .map_err(|source| ConfigError::Read {
            path: key_path.clone(),
            source,
        })?;

    let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
        .map_err(|e| ConfigError::Invalid(format!("invalid TLS certificate/key: {e}")))?;

    let acceptor = native_tls::TlsAcceptor::new(identity)
        .map_err(|e| ConfigError::Invalid(format!("failed to build TLS acceptor: {e}")))?;

    Ok(Some(tokio_native_tls::TlsAcceptor::from(acceptor)))
}
