use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::PoolMode;
use crate::errors::Error;
use crate::messages::{self, ClientMessage, ServerMessage, Verb};
use crate::pool::{AcquireOutcome, PoolKey};
use crate::utils;

use super::session::ClientSession;
use super::stream::ClientStream;

/// Drives an `Active` session: pipes bytes between the client socket and
/// its assigned backend, snooping frame boundaries on both directions to
/// apply the pool-mode release policy. Forwarding is byte-for-byte;
/// parsing only ever decides *when* to acquire or release, never what
/// bytes reach either side. `idle_timeout_ms` of 0 disables the idle sweep;
/// otherwise the session closes itself after that long without activity in
/// either direction. `shutdown` fires once when the process is draining,
/// closing the session in place of an abrupt runtime teardown.
pub async fn run_active_session(
    client: &mut ClientStream,
    session: &mut ClientSession,
    pool: &crate::pool::Pool,
    key: &PoolKey,
    client_buf: &mut BytesMut,
    idle_timeout_ms: u64,
    shutdown: &mut tokio::sync::broadcast::Receiver<()>,
) -> Result<(), Error> {
    let idle_timeout = (idle_timeout_ms > 0).then(|| Duration::from_millis(idle_timeout_ms));
    let mut server_buf = BytesMut::with_capacity(8192);
    let mut client_chunk = [0u8; 8192];
    let mut server_chunk = [0u8; 8192];

    loop {
        // Drain whatever the client already sent before startup completed,
        // or whatever arrived while we were waiting on the backend.
        if drain_client_buffer(client, session, pool, key, client_buf).await? {
            return Ok(());
        }

        let idle_sleep = async {
            match idle_timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = idle_sleep => {
                log::info!("closing session {} after idle timeout", session.session_id);
                return Ok(());
            }
            _ = shutdown.recv() => {
                log::info!("closing session {} for pool shutdown", session.session_id);
                return Ok(());
            }
            result = client.read(&mut client_chunk) => {
                let n = result.map_err(Error::Io)?;
                if n == 0 {
                    return Ok(());
                }
                client_buf.extend_from_slice(&client_chunk[..n]);
                if drain_client_buffer(client, session, pool, key, client_buf).await? {
                    return Ok(());
                }
            }
            result = read_backend(session, &mut server_chunk) => {
                match result {
                    Ok(0) | Err(_) => {
                        fault_backend(client, session, pool).await?;
                        return Ok(());
                    }
                    Ok(n) => {
                        client.write_all(&server_chunk[..n]).await.map_err(Error::Io)?;
                        client.flush().await.map_err(Error::Io)?;
                        server_buf.extend_from_slice(&server_chunk[..n]);
                        drain_server_buffer(session, pool, &mut server_buf).await?;
                    }
                }
            }
        }

        session.last_activity = utils::now();
    }
}

/// A backend socket faulted (closed or errored) while a session held it:
/// tell the client, then make sure the dead connection is dropped rather
/// than handed back to the free list.
async fn fault_backend(
    client: &mut ClientStream,
    session: &mut ClientSession,
    pool: &crate::pool::Pool,
) -> Result<(), Error> {
    emit_error(client, "Server connection error").await?;
    if let Some(backend) = session.current_backend.take() {
        pool.drop_backend(backend, Some(session.session_id)).await;
    }
    Ok(())
}

async fn read_backend(session: &mut ClientSession, chunk: &mut [u8]) -> Result<usize, Error> {
    match session.current_backend.as_mut() {
        Some(backend) => backend.stream.read(chunk).await.map_err(Error::Io),
        None => std::future::pending().await,
    }
}

/// Forward whatever complete client frames are sitting in `client_buf` to
/// the backend (acquiring one first if the mode requires it), applying the
/// transaction/statement bookkeeping as each `Query` is seen. Returns
/// `Ok(true)` once the session should end (client sent `Terminate`, or the
/// backend faulted while being written to).
async fn drain_client_buffer(
    client: &mut ClientStream,
    session: &mut ClientSession,
    pool: &crate::pool::Pool,
    key: &PoolKey,
    client_buf: &mut BytesMut,
) -> Result<bool, Error> {
    loop {
        let Some((message, consumed)) =
            messages::try_parse_one_client_message(client_buf).map_err(Error::Protocol)?
        else {
            return Ok(false);
        };

        if let ClientMessage::Query { sql } = &message {
            if session.pool_mode != PoolMode::Session && session.current_backend.is_none() {
                match pool
                    .acquire(session.session_id, key, session.pool_mode)
                    .await
                {
                    Ok(AcquireOutcome::Acquired(backend)) => {
                        session.current_backend = Some(backend);
                    }
                    Ok(AcquireOutcome::Exhausted) => {
                        emit_error(client, "No available connections").await?;
                        client_buf.advance(consumed);
                        continue;
                    }
                    Err(err) => {
                        emit_error(client, &err.to_string()).await?;
                        client_buf.advance(consumed);
                        continue;
                    }
                }
            }

            if let Some(Verb::Begin) = messages::classify_verb(sql) {
                session.in_transaction = true;
            }
            if matches!(
                messages::classify_verb(sql),
                Some(Verb::Commit) | Some(Verb::Rollback)
            ) {
                session.pending_release = true;
            }
        }

        let frame = &client_buf[..consumed];
        let write_result = match session.current_backend.as_mut() {
            Some(backend) => async {
                backend.stream.write_all(frame).await?;
                backend.stream.flush().await
            }
            .await,
            None => Ok(()),
        };
        client_buf.advance(consumed);

        if write_result.is_err() {
            fault_backend(client, session, pool).await?;
            return Ok(true);
        }

        if matches!(message, ClientMessage::Terminate) {
            return Ok(true);
        }
    }
}

/// Apply the release policy to each complete server frame in `server_buf`.
/// Bytes have already been forwarded to the client by the caller; this
/// only updates pool/session state on `ReadyForQuery` boundaries.
async fn drain_server_buffer(
    session: &mut ClientSession,
    pool: &crate::pool::Pool,
    server_buf: &mut BytesMut,
) -> Result<(), Error> {
    loop {
        let Some((message, consumed)) =
            messages::try_parse_one_server_message(server_buf).map_err(Error::Protocol)?
        else {
            return Ok(());
        };
        server_buf.advance(consumed);

        if let ServerMessage::ReadyForQuery { .. } = message {
            apply_release_policy(session, pool).await;
        }
    }
}

async fn apply_release_policy(session: &mut ClientSession, pool: &crate::pool::Pool) {
    let should_release = match session.pool_mode {
        PoolMode::Session => false,
        PoolMode::Statement => true,
        PoolMode::Transaction => session.pending_release || !session.in_transaction,
    };

    if !should_release {
        return;
    }

    if session.pending_release {
        session.in_transaction = false;
    }
    session.pending_release = false;

    if let Some(backend) = session.current_backend.take() {
        pool.release(backend, Some(session.session_id)).await;
    }
}

async fn emit_error(client: &mut ClientStream, message: &str) -> Result<(), Error> {
    let frame = messages::encode_error_response(message);
    client.write_all(&frame).await.map_err(Error::Io)?;
    client.flush().await.map_err(Error::Io)
}
