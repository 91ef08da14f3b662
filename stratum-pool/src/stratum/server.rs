//! Listeners, the connection registry, and job broadcast.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::ban::{BanTable, BanningConfig};
use super::connection::Connection;
use super::subscription::SubscriptionCounter;
use super::{JobBroadcast, PortConfig};
use crate::auth::Authorizer;
use crate::events::EventSender;
use crate::job_manager::{AcceptedShare, JobManager};
use crate::template::JobParams;
use crate::tracing::prelude::*;
use crate::types::Difficulty;
use crate::vardiff::VarDiffController;

/// Pause after a failed accept, typically from running out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub ports: Vec<PortConfig>,
    pub banning: BanningConfig,
    /// Connections with no share submitted for this long are dropped at
    /// the next job.
    pub connection_timeout: Duration,
    /// Expect a PROXY protocol line before the first message.
    pub tcp_proxy_protocol: bool,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid difficulty {diff} on port {port}")]
    InvalidDifficulty { port: u16, diff: f64 },
}

new_key_type! {
    pub(super) struct ConnectionKey;
}

/// What the server keeps of each live connection.
pub(super) struct ConnectionHandle {
    pub jobs_tx: mpsc::Sender<JobBroadcast>,
    pub cancel: CancellationToken,
    pub subscription_id: String,
}

/// Settings of one bound port, shared by its connections.
#[derive(Debug)]
pub(super) struct PortContext {
    pub port: u16,
    pub difficulty: Difficulty,
    pub vardiff: Option<VarDiffController>,
}

/// State shared by the listeners and every connection task.
pub(super) struct Shared {
    pub config: ServerConfig,
    pub jobs: Arc<Mutex<JobManager>>,
    pub authorizer: Arc<dyn Authorizer>,
    pub bans: BanTable,
    pub registry: Mutex<SlotMap<ConnectionKey, ConnectionHandle>>,
    pub subscriptions: SubscriptionCounter,
    pub events: EventSender,
    pub blocks: mpsc::Sender<AcceptedShare>,
}

impl Shared {
    pub fn broadcast_job(&self, params: Arc<JobParams>, clean_jobs: bool) -> usize {
        let registry = self.registry.lock();
        let mut queued = 0;

        for handle in registry.values() {
            let job = JobBroadcast {
                params: params.clone(),
                clean_jobs,
            };
            match handle.jobs_tx.try_send(job) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscription_id = %handle.subscription_id,
                        "Outbound queue full, dropping connection"
                    );
                    handle.cancel.cancel();
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        debug!(job_id = %params.job_id, clean_jobs, queued, "Broadcast job");
        queued
    }
}

/// A listening socket ready to be served.
pub struct BoundPort {
    listener: TcpListener,
    context: Arc<PortContext>,
}

impl BoundPort {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Stratum server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct StratumServer {
    shared: Arc<Shared>,
}

impl StratumServer {
    /// Block candidates found by miners are sent on `blocks`.
    pub fn new(
        config: ServerConfig,
        jobs: Arc<Mutex<JobManager>>,
        authorizer: Arc<dyn Authorizer>,
        events: EventSender,
        blocks: mpsc::Sender<AcceptedShare>,
    ) -> Self {
        let bans = BanTable::new(config.banning.duration());
        Self {
            shared: Arc::new(Shared {
                config,
                jobs,
                authorizer,
                bans,
                registry: Mutex::new(SlotMap::with_key()),
                subscriptions: SubscriptionCounter::new(),
                events,
                blocks,
            }),
        }
    }

    /// Bind every configured port.
    pub async fn bind(&self) -> Result<Vec<BoundPort>, ServerError> {
        let config = &self.shared.config;
        let mut bound = Vec::with_capacity(config.ports.len());

        for port in &config.ports {
            let difficulty = Difficulty::new(port.diff).ok_or(ServerError::InvalidDifficulty {
                port: port.port,
                diff: port.diff,
            })?;

            let addr = SocketAddr::new(config.bind_address, port.port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::Bind { addr, source })?;
            let local = listener
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;

            info!(
                port = local.port(),
                difficulty = %difficulty,
                vardiff = port.vardiff.is_some(),
                "Stratum port listening"
            );

            bound.push(BoundPort {
                listener,
                context: Arc::new(PortContext {
                    port: local.port(),
                    difficulty,
                    vardiff: port.vardiff.clone().map(VarDiffController::new),
                }),
            });
        }

        Ok(bound)
    }

    /// Accept connections on `ports` until `shutdown`, then wait for every
    /// connection task to finish.
    pub async fn serve(self, ports: Vec<BoundPort>, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();

        for port in ports {
            tracker.spawn(accept_loop(
                self.shared.clone(),
                port,
                shutdown.clone(),
                tracker.clone(),
            ));
        }
        if self.shared.config.banning.enabled {
            tracker.spawn(purge_loop(self.shared.clone(), shutdown.clone()));
        }

        tracker.close();
        tracker.wait().await;
        debug!("Stratum server stopped");
    }

    /// Queue a job on every connection without waiting. Connections whose
    /// queue is full are disconnected. Returns how many were queued.
    pub fn broadcast_job(&self, params: Arc<JobParams>, clean_jobs: bool) -> usize {
        self.shared.broadcast_job(params, clean_jobs)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    pub fn bans(&self) -> &BanTable {
        &self.shared.bans
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    port: BoundPort,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let BoundPort { listener, context } = port;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((socket, remote)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(addr = %remote, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let connection = Connection::open(&shared, &context, remote, &shutdown);
                    tracker.spawn(connection.run(socket));
                }
                Err(e) => {
                    warn!(port = context.port, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    debug!(port = context.port, "Listener stopped");
}

async fn purge_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let period = Duration::from_secs(shared.config.banning.purge_interval.max(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let purged = shared.bans.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired bans");
                }
            }
        }
    }
}
