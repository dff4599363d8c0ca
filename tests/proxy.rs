//! End-to-end scenarios driven over real loopback sockets: a hand-rolled
//! fake PostgreSQL backend on one side, a real client socket on the
//! other, with the actual pooler code (`pg_relay::client`,
//! `pg_relay::pool`) in between.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pg_relay::config::{Config, General, PoolConfig, PoolMode, TlsMode, UserConfig};
use pg_relay::messages::{self, ServerMessage, TransactionStatus};
use pg_relay::pool::Pool;

/// Accepts one connection at a time and behaves like a trust-auth
/// PostgreSQL server speaking only the simple query subset this core
/// itself parses.
async fn spawn_fake_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_fake_backend(socket));
        }
    });

    port
}

async fn serve_fake_backend(mut socket: TcpStream) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 4096];
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        if let Ok(Some((_startup, consumed))) = messages::try_parse_initial_message(&buf) {
            buf.advance(consumed);
            break;
        }
    }

    let _ = socket.write_all(&messages::encode_authentication_ok()).await;
    let _ = socket
        .write_all(&messages::encode_ready_for_query(TransactionStatus::Idle))
        .await;

    let mut status = TransactionStatus::Idle;
    loop {
        match messages::try_parse_one_client_message(&buf) {
            Ok(Some((msg, consumed))) => {
                buf.advance(consumed);
                match msg {
                    messages::ClientMessage::Query { sql } => {
                        status = match messages::classify_verb(&sql) {
                            Some(messages::Verb::Begin) => TransactionStatus::InTransaction,
                            Some(messages::Verb::Commit) | Some(messages::Verb::Rollback) => {
                                TransactionStatus::Idle
                            }
                            None => status,
                        };
                        let _ = socket
                            .write_all(&messages::encode_command_complete("SELECT 1"))
                            .await;
                        let _ = socket.write_all(&messages::encode_ready_for_query(status)).await;
                    }
                    messages::ClientMessage::Terminate => return,
                    messages::ClientMessage::Other { .. } => {}
                }
                continue;
            }
            Ok(None) => {}
            Err(_) => return,
        }

        let mut chunk = [0u8; 4096];
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn test_config(backend_port: u16, pool_mode: PoolMode, max_client_conn: u32) -> Arc<Config> {
    let mut pools = HashMap::new();
    pools.insert(
        "app".to_string(),
        PoolConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: backend_port,
            pool_mode,
            pool_size: 10,
            server_connect_timeout_ms: 3_000,
            server_idle_timeout_ms: 0,
            server_tls_mode: TlsMode::Disable,
            server_tls_key_file: None,
            server_tls_cert_file: None,
            server_tls_ca_file: None,
            users: vec![UserConfig {
                username: "alice".to_string(),
                password: None,
            }],
        },
    );
    Arc::new(Config {
        path: Default::default(),
        general: General {
            max_client_conn,
            client_login_timeout_ms: 0,
            ..General::default()
        },
        pools,
    })
}

/// Spins up the pooler's accept loop (without the signal/runtime
/// bootstrap in `app::server`, which this test doesn't need) and returns
/// its listening port.
async fn spawn_pooler(config: Arc<Config>) -> (u16, Arc<Pool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let pool = Arc::new(Pool::new(config.clone()));
    let pool_for_loop = pool.clone();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    tokio::spawn(async move {
        loop {
            let Ok((socket, peer_addr)) = listener.accept().await else {
                return;
            };
            let pool = pool_for_loop.clone();
            let config = config.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                pg_relay::client::handle_connection(socket, peer_addr, pool, config, None, shutdown)
                    .await;
            });
        }
    });

    (port, pool)
}

async fn connect_and_start(port: u16, user: &str, database: &str) -> (TcpStream, BytesMut) {
    let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let startup = messages::encode_startup(&[("user", user), ("database", database)]);
    socket.write_all(&startup).await.unwrap();
    (socket, BytesMut::with_capacity(4096))
}

async fn read_one_message(socket: &mut TcpStream, buf: &mut BytesMut) -> ServerMessage {
    loop {
        if let Some((msg, consumed)) = messages::try_parse_one_server_message(buf).unwrap() {
            buf.advance(consumed);
            return msg;
        }
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed while waiting for a message");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// S1: a fresh session-mode client handshake acquires a brand new
/// backend and reaches `ReadyForQuery`.
#[tokio::test]
async fn session_handshake_acquires_backend() {
    let backend_port = spawn_fake_backend().await;
    let config = test_config(backend_port, PoolMode::Session, 10);
    let (pooler_port, pool) = spawn_pooler(config).await;

    let (mut socket, mut buf) = connect_and_start(pooler_port, "alice", "app").await;

    assert!(matches!(
        read_one_message(&mut socket, &mut buf).await,
        ServerMessage::AuthenticationOk
    ));
    assert!(matches!(
        read_one_message(&mut socket, &mut buf).await,
        ServerMessage::ReadyForQuery { status: TransactionStatus::Idle }
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.total_connections().await, 1);
}

/// S2: in transaction mode, `BEGIN; SELECT 1; COMMIT;` releases the
/// backend back to the pool only after the `ReadyForQuery` following
/// `COMMIT`.
#[tokio::test]
async fn transaction_mode_releases_after_commit() {
    let backend_port = spawn_fake_backend().await;
    let config = test_config(backend_port, PoolMode::Transaction, 10);
    let (pooler_port, _pool) = spawn_pooler(config).await;

    let (mut socket, mut buf) = connect_and_start(pooler_port, "alice", "app").await;
    read_one_message(&mut socket, &mut buf).await;
    read_one_message(&mut socket, &mut buf).await;

    for sql in ["BEGIN", "SELECT 1", "COMMIT"] {
        socket
            .write_all(&messages::encode_query(sql))
            .await
            .unwrap();
        let complete = read_one_message(&mut socket, &mut buf).await;
        assert!(matches!(complete, ServerMessage::CommandComplete { .. }));
        let ready = read_one_message(&mut socket, &mut buf).await;
        match sql {
            "COMMIT" => assert!(matches!(
                ready,
                ServerMessage::ReadyForQuery { status: TransactionStatus::Idle }
            )),
            _ => assert!(matches!(ready, ServerMessage::ReadyForQuery { .. })),
        }
    }
}

/// S3: statement mode re-acquires (and may reuse, since only one
/// backend exists) on every query, never holding the backend between
/// queries.
#[tokio::test]
async fn statement_mode_reacquires_each_query() {
    let backend_port = spawn_fake_backend().await;
    let config = test_config(backend_port, PoolMode::Statement, 10);
    let (pooler_port, pool) = spawn_pooler(config).await;

    let (mut socket, mut buf) = connect_and_start(pooler_port, "alice", "app").await;
    read_one_message(&mut socket, &mut buf).await;
    read_one_message(&mut socket, &mut buf).await;

    for _ in 0..10 {
        socket
            .write_all(&messages::encode_query("SELECT 1"))
            .await
            .unwrap();
        assert!(matches!(
            read_one_message(&mut socket, &mut buf).await,
            ServerMessage::CommandComplete { .. }
        ));
        assert!(matches!(
            read_one_message(&mut socket, &mut buf).await,
            ServerMessage::ReadyForQuery { .. }
        ));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.total_connections().await, 1);
}

/// S5: a second session-mode client is rejected with a pool-exhausted
/// error while the first still holds the only backend slot.
#[tokio::test]
async fn exhaustion_rejects_second_session() {
    let backend_port = spawn_fake_backend().await;
    let config = test_config(backend_port, PoolMode::Session, 1);
    let (pooler_port, _pool) = spawn_pooler(config).await;

    let (mut first, mut first_buf) = connect_and_start(pooler_port, "alice", "app").await;
    read_one_message(&mut first, &mut first_buf).await;
    read_one_message(&mut first, &mut first_buf).await;

    let (mut second, mut second_buf) = connect_and_start(pooler_port, "alice", "app").await;
    match read_one_message(&mut second, &mut second_buf).await {
        ServerMessage::ErrorResponse { message } => {
            assert!(message.contains("exhausted"));
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }

    drop(first);
}

/// S4: a client that starts up in plaintext against a `require`d TLS
/// policy is rejected before any backend is touched, and the socket is
/// closed right after the error.
#[tokio::test]
async fn tls_required_rejects_plaintext_client() {
    let backend_port = spawn_fake_backend().await;
    let mut config = (*test_config(backend_port, PoolMode::Session, 10)).clone();
    config.general.client_tls_mode = TlsMode::Require;
    let (pooler_port, pool) = spawn_pooler(Arc::new(config)).await;

    let (mut socket, mut buf) = connect_and_start(pooler_port, "alice", "app").await;

    match read_one_message(&mut socket, &mut buf).await {
        ServerMessage::ErrorResponse { message } => {
            assert!(message.contains("TLS"));
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }

    let mut chunk = [0u8; 16];
    let n = socket.read(&mut chunk).await.unwrap();
    assert_eq!(n, 0, "server should close the socket after rejecting a plaintext client");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.total_connections().await, 0);
}
