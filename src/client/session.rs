use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{Config, PoolMode, TlsMode};
use crate::errors::{Error, PoolError, ProtocolError, StartupError};
use crate::messages::{self, InitialMessage};
use crate::pool::{self, AcquireOutcome, BackendConnection, Pool, PoolKey, SessionId};
use crate::utils;

use super::proxy;
use super::stream::ClientStream;
use super::SessionState;

/// Per-accepted-socket state: identity, the currently-assigned backend (if
/// any), and transaction-nesting flags. Exactly one of the pool's free list
/// or this struct's `current_backend` owns a given [`BackendConnection`] at
/// any instant.
pub struct ClientSession {
    pub session_id: SessionId,
    pub peer_addr: SocketAddr,
    pub database: String,
    pub user: String,
    pub state: SessionState,
    pub current_backend: Option<BackendConnection>,
    pub in_transaction: bool,
    pub pending_release: bool,
    pub last_activity: quanta::Instant,
    pub authenticated: bool,
    pub pool_mode: PoolMode,
}

impl ClientSession {
    async fn release_backend(&mut self, pool: &Pool) {
        if let Some(backend) = self.current_backend.take() {
            pool.release(backend, Some(self.session_id)).await;
        }
    }
}

pub async fn handle_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    pool: Arc<Pool>,
    config: Arc<Config>,
    tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
    shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    if config.general.log_client_connections {
        log::info!("client {peer_addr} connected");
    }
    let connected_at = utils::now();

    if let Err(err) = run(tcp, peer_addr, pool, config.clone(), tls_acceptor, shutdown).await {
        log::warn!("client {peer_addr} session ended: {err}");
    }

    if config.general.log_client_disconnections {
        let elapsed = utils::now().duration_since(connected_at);
        log::info!(
            "client {peer_addr} disconnected after {}",
            utils::format_duration(elapsed)
        );
    }
}

async fn run(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    pool: Arc<Pool>,
    config: Arc<Config>,
    tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<(), Error> {
    tcp.set_nodelay(true).ok();
    let mut stream = ClientStream::Plain { stream: tcp };
    let mut buf = BytesMut::with_capacity(4096);
    let session_id = pool::next_session_id();

    let deadline = if config.general.client_login_timeout_ms > 0 {
        Some(tokio::time::Instant::now() + Duration::from_millis(config.general.client_login_timeout_ms))
    } else {
        None
    };

    let (stream, database, user) =
        negotiate_and_authenticate(stream, &mut buf, &config, &tls_acceptor, deadline).await?;
    let mut stream = stream;

    let Some((pool_config, _user_config)) = config.find_user(&database, &user) else {
        let _ = write_message(
            &mut stream,
            &messages::encode_error_response("no pool configured for this database/user"),
        )
        .await;
        return Err(PoolError::UnknownKey { database, user }.into());
    };
    let pool_mode = pool_config.pool_mode;
    let key = PoolKey::new(database.clone(), user.clone());

    let mut session = ClientSession {
        session_id,
        peer_addr,
        database,
        user,
        state: SessionState::Authenticating,
        current_backend: None,
        in_transaction: false,
        pending_release: false,
        last_activity: utils::now(),
        authenticated: false,
        pool_mode,
    };

    session.current_backend =
        acquire_and_activate(&mut stream, &pool, session_id, &key, pool_mode).await?;
    session.authenticated = true;
    session.state = SessionState::Active;

    let result = proxy::run_active_session(
        &mut stream,
        &mut session,
        &pool,
        &key,
        &mut buf,
        config.general.client_idle_timeout_ms,
        &mut shutdown,
    )
    .await;

    session.state = SessionState::Closed;
    session.release_backend(&pool).await;
    result
}

async fn write_message(stream: &mut ClientStream, msg: &[u8]) -> Result<(), Error> {
    stream.write_all(msg).await.map_err(Error::Io)?;
    stream.flush().await.map_err(Error::Io)
}

async fn read_some(stream: &mut ClientStream, buf: &mut BytesMut) -> Result<usize, Error> {
    let mut chunk = [0u8; 8192];
    let n = stream.read(&mut chunk).await.map_err(Error::Io)?;
    if n > 0 {
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(n)
}

/// Drives the `New` / `Negotiating-TLS?` / `Authenticating`-entry portion
/// of the state machine: read until a `Startup` frame is in hand, handling
/// any `SSLRequest` along the way. Bounded by `deadline` if the operator
/// configured a login timeout.
async fn negotiate_and_authenticate(
    mut stream: ClientStream,
    buf: &mut BytesMut,
    config: &Config,
    tls_acceptor: &Option<tokio_native_tls::TlsAcceptor>,
    deadline: Option<tokio::time::Instant>,
) -> Result<(ClientStream, String, String), Error> {
    loop {
        match messages::try_parse_initial_message(buf).map_err(Error::Protocol)? {
            Some((InitialMessage::SslRequest, consumed)) => {
                buf.advance(consumed);
                stream = negotiate_client_tls(stream, config, tls_acceptor).await?;
            }
            Some((InitialMessage::Startup { params }, consumed)) => {
                buf.advance(consumed);
                let user = params
                    .get("user")
                    .cloned()
                    .ok_or(ProtocolError::MissingStartupParam("user"))?;
                let database = params.get("database").cloned().unwrap_or_else(|| user.clone());

                let is_tls = matches!(stream, ClientStream::Tls { .. });
                if !is_tls && config.general.client_tls_mode.requires_tls() {
                    let _ = write_message(
                        &mut stream,
                        &messages::encode_error_response("Server requires TLS"),
                    )
                    .await;
                    return Err(StartupError::TlsPolicy("client connected without TLS").into());
                }
                return Ok((stream, database, user));
            }
            None => {
                let read_fut = read_some(&mut stream, buf);
                let n = match deadline {
                    Some(d) => match tokio::time::timeout_at(d, read_fut).await {
                        Ok(res) => res?,
                        Err(_) => {
                            let _ = write_message(
                                &mut stream,
                                &messages::encode_error_response("Login timeout"),
                            )
                            .await;
                            return Err(StartupError::LoginTimeout.into());
                        }
                    },
                    None => read_fut.await?,
                };
                if n == 0 {
                    return Err(StartupError::ClientClosed.into());
                }
            }
        }
    }
}

async fn negotiate_client_tls(
    stream: ClientStream,
    config: &Config,
    tls_acceptor: &Option<tokio_native_tls::TlsAcceptor>,
) -> Result<ClientStream, Error> {
    let ClientStream::Plain { stream: mut tcp } = stream else {
        return Err(ProtocolError::UnknownTag('S').into());
    };

    if config.general.client_tls_mode == TlsMode::Disable || tls_acceptor.is_none() {
        tcp.write_all(b"N").await.map_err(Error::Io)?;
        return Err(StartupError::TlsPolicy("client_tls_mode is disable").into());
    }

    tcp.write_all(b"S").await.map_err(Error::Io)?;
    let acceptor = tls_acceptor.as_ref().unwrap();
    let tls_stream = acceptor.accept(tcp).await.map_err(Error::Tls)?;
    Ok(ClientStream::Tls { stream: tls_stream })
}

/// `Authenticating → Active`. In session mode this acquires the backend
/// up front; in transaction/statement mode acquisition is deferred to the
/// first client query, so the session becomes `Active` without a backend.
async fn acquire_and_activate(
    stream: &mut ClientStream,
    pool: &Pool,
    session_id: SessionId,
    key: &PoolKey,
    pool_mode: PoolMode,
) -> Result<Option<BackendConnection>, Error> {
    if pool_mode != PoolMode::Session {
        write_message(stream, &messages::encode_authentication_ok()).await?;
        write_message(
            stream,
            &messages::encode_ready_for_query(messages::TransactionStatus::Idle),
        )
        .await?;
        return Ok(None);
    }

    match pool.acquire(session_id, key, pool_mode).await {
        Ok(AcquireOutcome::Acquired(backend)) => {
            write_message(stream, &messages::encode_authentication_ok()).await?;
            write_message(
                stream,
                &messages::encode_ready_for_query(messages::TransactionStatus::Idle),
            )
            .await?;
            Ok(Some(backend))
        }
        Ok(AcquireOutcome::Exhausted) => {
            let _ = write_message(
                stream,
                &messages::encode_error_response("Connection pool exhausted"),
            )
            .await;
            Err(PoolError::Exhausted.into())
        }
        Err(e) => {
            let _ = write_message(stream, &messages::encode_error_response(&e.to_string())).await;
            Err(e.into())
        }
    }
}
