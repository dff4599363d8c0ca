use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
#[cfg(not(windows))]
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::client;
use crate::config::Config;
use crate::pool::Pool;

use super::args::Args;
use super::tls::build_client_acceptor;

pub fn run_server(args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .thread_name("pg-relay-worker")
        .build()?;

    runtime.block_on(run(args, config))
}

async fn run(_args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    crate::config::set_config((*config).clone());

    let tls_acceptor = build_client_acceptor(&config).await?;

    let addr = format!("{}:{}", config.general.listen_host, config.general.listen_port)
        .to_socket_addrs()?
        .next()
        .ok_or("could not resolve listen address")?;

    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let pool = Arc::new(Pool::new(config.clone()));
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    tokio::task::spawn(idle_eviction_task(pool.clone(), config.clone()));

    #[cfg(not(windows))]
    let mut term_signal = unix_signal(SignalKind::terminate())?;
    #[cfg(not(windows))]
    let mut interrupt_signal = unix_signal(SignalKind::interrupt())?;
    #[cfg(not(windows))]
    let mut hangup_signal = unix_signal(SignalKind::hangup())?;

    loop {
        #[cfg(not(windows))]
        {
            tokio::select! {
                _ = hangup_signal.recv() => {
                    info!("reloading configuration");
                    match crate::config::load(&config.path).await {
                        Ok(new_config) => crate::config::set_config(new_config),
                        Err(err) => error!("config reload failed, keeping previous config: {err}"),
                    }
                }
                _ = interrupt_signal.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = term_signal.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    accept_one(accepted, &pool, &config, &tls_acceptor, &shutdown_tx);
                }
            }
        }
        #[cfg(windows)]
        {
            let accepted = listener.accept().await;
            accept_one(accepted, &pool, &config, &tls_acceptor, &shutdown_tx);
        }
    }

    let _ = shutdown_tx.send(());
    info!(
        "draining connections (up to {}ms)",
        config.general.shutdown_timeout_ms
    );
    let _ = tokio::time::timeout(
        Duration::from_millis(config.general.shutdown_timeout_ms),
        pool.shutdown(),
    )
    .await;

    Ok(())
}

fn accept_one(
    accepted: std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)>,
    pool: &Arc<Pool>,
    config: &Arc<Config>,
    tls_acceptor: &Option<tokio_native_tls::TlsAcceptor>,
    shutdown_tx: &tokio::sync::broadcast::Sender<()>,
) {
    match accepted {
        Ok((socket, peer_addr)) => {
            let pool = pool.clone();
            let config = config.clone();
            let tls_acceptor = tls_acceptor.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::task::spawn(async move {
                client::handle_connection(socket, peer_addr, pool, config, tls_acceptor, shutdown)
                    .await;
            });
        }
        Err(err) => warn!("accept failed: {err}"),
    }
}

async fn idle_eviction_task(pool: Arc<Pool>, _config: Arc<Config>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let evicted = pool.evict_idle().await;
        if evicted > 0 {
            info!("evicted {evicted} idle backend connection(s)");
        }
    }
}
