use bytes::BytesMut;
use native_tls::TlsConnector;
use quanta::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::stream::BackendStream;
use super::PoolKey;
use crate::config::{PoolConfig, TlsMode};
use crate::errors::PoolError;
use crate::messages;

/// A live socket to PostgreSQL that has completed startup and reached the
/// `ReadyForQuery` state. Owned by exactly one of the pool's free list or a
/// client session's `current_backend`, never both.
pub struct BackendConnection {
    pub id: u64,
    pub key: PoolKey,
    pub stream: BackendStream,
    pub in_use: bool,
    pub authenticated: bool,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

impl BackendConnection {
    pub(super) fn mark_in_use(&mut self) {
        self.in_use = true;
        self.last_used_at = Instant::recent();
    }

    pub(super) fn mark_idle(&mut self) {
        self.in_use = false;
        self.last_used_at = Instant::recent();
    }
}

/// Open a new backend connection: TCP connect, optional TLS upgrade, then
/// the trust-only startup/authentication exchange. The whole sequence is
/// bounded by `server_connect_timeout_ms`.
pub async fn connect(
    id: u64,
    key: &PoolKey,
    config: &PoolConfig,
) -> Result<BackendConnection, PoolError> {
    let deadline = std::time::Duration::from_millis(config.server_connect_timeout_ms);
    timeout(deadline, connect_inner(id, key, config))
        .await
        .map_err(|_| PoolError::Timeout)?
}

async fn connect_inner(
    id: u64,
    key: &PoolKey,
    config: &PoolConfig,
) -> Result<BackendConnection, PoolError> {
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| PoolError::Connect(e.to_string()))?;
    tcp.set_nodelay(true).ok();

    let stream = negotiate_tls(tcp, config).await?;
    let mut conn = BackendConnection {
        id,
        key: key.clone(),
        stream,
        in_use: false,
        authenticated: false,
        created_at: Instant::recent(),
        last_used_at: Instant::recent(),
    };
    authenticate(&mut conn, key).await?;
    Ok(conn)
}

async fn negotiate_tls(
    mut tcp: TcpStream,
    config: &PoolConfig,
) -> Result<BackendStream, PoolError> {
    if config.server_tls_mode == TlsMode::Disable {
        return Ok(BackendStream::Plain { stream: tcp });
    }

    let request = messages::encode_ssl_request();
    tcp.write_all(&request)
        .await
        .map_err(|e| PoolError::Connect(e.to_string()))?;
    let reply = tcp
        .read_u8()
        .await
        .map_err(|e| PoolError::Connect(e.to_string()))?;

    match reply {
        b'S' => {
            let mut builder = TlsConnector::builder();
            if !config.server_tls_mode.verifies_ca() {
                builder.danger_accept_invalid_certs(true);
            }
            if !config.server_tls_mode.verifies_hostname() {
                builder.danger_accept_invalid_hostnames(true);
            }
            if let Some(ca_path) = &config.server_tls_ca_file {
                let pem = tokio::fs::read(ca_path)
                    .await
                    .map_err(|e| PoolError::Connect(e.to_string()))?;
                let cert = native_tls::Certificate::from_pem(&pem)
                    .map_err(|e| PoolError::Connect(e.to_string()))?;
                builder.add_root_certificate(cert);
            }
            if let (Some(cert_path), Some(key_path)) =
                (&config.server_tls_cert_file, &config.server_tls_key_file)
            {
                let cert_pem = tokio::fs::read(cert_path)
                    .await
                    .map_err(|e| PoolError::Connect(e.to_string()))?;
                let key_pem = tokio::fs::read(key_path)
                    .await
                    .map_err(|e| PoolError::Connect(e.to_string()))?;
                let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
                    .map_err(|e| PoolError::Connect(e.to_string()))?;
                builder.identity(identity);
            }
            let connector = builder
                .build()
                .map_err(|e| PoolError::Connect(e.to_string()))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let domain = config.server_host.clone();
            let tls_stream = connector
                .connect(&domain, tcp)
                .await
                .map_err(|e| PoolError::Connect(e.to_string()))?;
            Ok(BackendStream::Tls { stream: tls_stream })
        }
        b'N' => {
            if matches!(config.server_tls_mode, TlsMode::Prefer | TlsMode::Allow) {
                Ok(BackendStream::Plain { stream: tcp })
            } else {
                Err(PoolError::Connect(
                    "server does not support TLS and server_tls_mode requires it".to_string(),
                ))
            }
        }
        other => Err(PoolError::Connect(format!(
            "unexpected TLS negotiation reply byte {other}"
        ))),
    }
}

async fn authenticate(conn: &mut BackendConnection, key: &PoolKey) -> Result<(), PoolError> {
    let startup = messages::encode_backend_startup(&key.user, &key.database);
    conn.stream
        .write_all(&startup)
        .await
        .map_err(|e| PoolError::Connect(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 4096];
        let n = conn
            .stream
            .read(&mut chunk)
            .await
            .map_err(|e| PoolError::Auth(e.to_string()))?;
        if n == 0 {
            return Err(PoolError::Auth("backend closed during authentication".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let (messages, consumed) = messages::parse_server_messages(&buf)
            .map_err(|e| PoolError::Auth(e.to_string()))?;
        let _ = buf.split_to(consumed);

        for message in messages {
            match message {
                messages::ServerMessage::AuthenticationOk => {
                    conn.authenticated = true;
                    return Ok(());
                }
                messages::ServerMessage::ErrorResponse { message } => {
                    return Err(PoolError::Auth(message));
                }
                messages::ServerMessage::AuthenticationOther { code } => {
                    return Err(PoolError::Auth(format!(
                        "backend requested unsupported authentication method (code {code}); \
                         only trust/no-password backends are supported"
                    )));
                }
                messages::ServerMessage::ReadyForQuery { .. } => {
                    // May arrive before AuthenticationOk on some servers; keep reading.
                }
                _ => {
                    // Other intervening frames (e.g. NoticeResponse) are stored
                    // opaquely but not acted on.
                }
            }
        }
    }
}
