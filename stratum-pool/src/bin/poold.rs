//! Stratum pool daemon.
//!
//! Usage: `stratum-poold [-c|--config <path>]`. Send SIGUSR1 when the
//! node has a new block (e.g. from `blocknotify`) to skip the polling
//! delay.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::signal::unix::{self, SignalKind};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use stratum_pool::config::{Config, DEFAULT_CONFIG_PATH};
use stratum_pool::events::PoolEvent;
use stratum_pool::node::RpcClient;
use stratum_pool::pool::Pool;
use stratum_pool::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init(tracing::LogTarget::detect());

    let path = config_path()?;
    let config =
        Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    let source = Arc::new(RpcClient::new(
        &config.daemon.url,
        &config.daemon.user,
        &config.daemon.password,
        config.daemon.template_rules.clone(),
    ));
    let authorizer = config.pool.authorization.authorizer();

    let (pool, handle) = Pool::bind(&config, source, authorizer)
        .await
        .context("starting pool")?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(log_events(
        BroadcastStream::new(handle.subscribe()),
        running.clone(),
    ));
    let mut pool_task = tracker.spawn(pool.run(running.clone()));
    tracker.close();
    info!(coin = %config.coin.name, "Started.");

    let mut sigint = unix::signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm =
        unix::signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigusr1 =
        unix::signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;

    let finished = loop {
        tokio::select! {
            _ = sigint.recv() => break None,
            _ = sigterm.recv() => break None,
            _ = sigusr1.recv() => {
                handle.block_notify().await;
            }
            result = &mut pool_task => break Some(result),
        }
    };

    trace!("Shutting down.");
    running.cancel();

    let result = match finished {
        Some(result) => result,
        None => pool_task.await,
    };
    tracker.wait().await;

    result.context("pool task panicked")??;
    info!("Exiting.");
    Ok(())
}

fn config_path() -> Result<PathBuf> {
    let mut args = env::args().skip(1);
    let mut path = PathBuf::from(DEFAULT_CONFIG_PATH);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => match args.next() {
                Some(value) => path = PathBuf::from(value),
                None => bail!("{} needs a path", arg),
            },
            "-h" | "--help" => {
                eprintln!("Usage: stratum-poold [-c|--config <path>]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  -c, --config <path>  Configuration file (default: {DEFAULT_CONFIG_PATH})");
                eprintln!();
                eprintln!("Signals:");
                eprintln!("  SIGUSR1  Check the node for a new block now");
                std::process::exit(0);
            }
            _ => bail!("unknown argument: {}", arg),
        }
    }

    Ok(path)
}

async fn log_events(mut events: BroadcastStream<PoolEvent>, running: CancellationToken) {
    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(event)) => log_event(&event),
                Some(Err(e)) => warn!(error = %e, "Event log fell behind"),
                None => break,
            },
        }
    }
}

fn log_event(event: &PoolEvent) {
    match event {
        PoolEvent::BlockFound {
            share,
            accepted: true,
            coinbase_txid,
        } => info!(
            height = share.height,
            worker = %share.worker,
            block_hash = share.block_hash.as_deref().unwrap_or(""),
            coinbase_txid = coinbase_txid.as_deref().unwrap_or(""),
            "Block found"
        ),
        PoolEvent::BlockFound { share, .. } => warn!(
            height = share.height,
            worker = %share.worker,
            "Block candidate was not accepted"
        ),
        PoolEvent::IpBanned {
            ip,
            worker,
            invalid_percent,
        } => warn!(
            ip = %ip,
            worker = worker.as_deref().unwrap_or(""),
            invalid_percent,
            "Banned"
        ),
        PoolEvent::ClientConnected {
            subscription_id,
            addr,
        } => debug!(subscription_id = %subscription_id, addr = %addr, "Connected"),
        PoolEvent::ClientDisconnected {
            addr,
            worker,
            reason,
            ..
        } => debug!(
            addr = %addr,
            worker = worker.as_deref().unwrap_or(""),
            reason = %reason,
            "Disconnected"
        ),
        PoolEvent::ShareAccepted(share) => trace!(
            worker = %share.worker,
            difficulty = %share.difficulty,
            share_diff = share.share_diff,
            "Valid share"
        ),
        PoolEvent::ShareRejected {
            worker,
            code,
            reason,
            ..
        } => trace!(worker = %worker, code, reason = %reason, "Invalid share"),
        PoolEvent::DifficultyChanged {
            worker, difficulty, ..
        } => trace!(
            worker = worker.as_deref().unwrap_or(""),
            difficulty = %difficulty,
            "Difficulty changed"
        ),
        PoolEvent::NewJob { .. } | PoolEvent::UpdatedJob { .. } => {}
    }
}
