//! The pool: glue between the node, the job manager, and the Stratum
//! server.
//!
//! A single task owns the schedule. It polls the node for templates,
//! refreshes the current job when no new block has arrived for a while,
//! reacts to block notifications, and submits the blocks miners find.
//! Every new or refreshed job is broadcast to all connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::auth::Authorizer;
use crate::config::Config;
use crate::error::Result;
use crate::events::{self, EventSender, PoolEvent};
use crate::job_manager::{AcceptedShare, JobManager, TemplateUpdate};
use crate::node::{SubmitOutcome, TemplateSource};
use crate::stratum::{BoundPort, ServerConfig, StratumServer};
use crate::template::JobParams;
use crate::tracing::prelude::*;

/// Delay between attempts to fetch the first template.
const FIRST_TEMPLATE_RETRY: Duration = Duration::from_secs(5);

const BLOCK_QUEUE_CAPACITY: usize = 16;
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Timers driving job updates.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// How often to poll the node for a new block; `None` relies on block
    /// notifications alone.
    pub block_refresh_interval: Option<Duration>,
    /// Refresh the current job when nothing was broadcast for this long.
    pub job_rebroadcast_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            block_refresh_interval: config.block_refresh_interval(),
            job_rebroadcast_timeout: config.job_rebroadcast_timeout(),
        }
    }
}

#[derive(Debug)]
pub enum PoolCommand {
    /// The node has a new block; fetch a template now.
    BlockNotify,
}

/// Control and observation of a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
    events: EventSender,
}

impl PoolHandle {
    /// Returns false once the pool has stopped.
    pub async fn block_notify(&self) -> bool {
        self.commands.send(PoolCommand::BlockNotify).await.is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }
}

pub struct Pool {
    settings: PoolSettings,
    source: Arc<dyn TemplateSource>,
    jobs: Arc<Mutex<JobManager>>,
    server: StratumServer,
    ports: Vec<BoundPort>,
    local_addrs: Vec<SocketAddr>,
    events: EventSender,
    blocks_rx: mpsc::Receiver<AcceptedShare>,
    commands_rx: mpsc::Receiver<PoolCommand>,
}

impl Pool {
    /// Build a pool from configuration and bind its ports.
    pub async fn bind(
        config: &Config,
        source: Arc<dyn TemplateSource>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<(Self, PoolHandle)> {
        let jobs = JobManager::new(config.job_manager()?, config.algorithm()?);
        Self::with_parts(
            PoolSettings::from_config(config),
            config.server(),
            jobs,
            source,
            authorizer,
        )
        .await
    }

    pub async fn with_parts(
        settings: PoolSettings,
        server_config: ServerConfig,
        jobs: JobManager,
        source: Arc<dyn TemplateSource>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<(Self, PoolHandle)> {
        let jobs = Arc::new(Mutex::new(jobs));
        let (events, _) = events::channel();
        let (blocks_tx, blocks_rx) = mpsc::channel(BLOCK_QUEUE_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let server = StratumServer::new(
            server_config,
            jobs.clone(),
            authorizer,
            events.clone(),
            blocks_tx,
        );
        let ports = server.bind().await?;
        let local_addrs = ports
            .iter()
            .map(BoundPort::local_addr)
            .collect::<io::Result<Vec<_>>>()?;

        let handle = PoolHandle {
            commands: commands_tx,
            events: events.clone(),
        };
        let pool = Self {
            settings,
            source,
            jobs,
            server,
            ports,
            local_addrs,
            events,
            blocks_rx,
            commands_rx,
        };
        Ok((pool, handle))
    }

    /// Addresses the Stratum ports are listening on.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Miners are accepted once the first template has been fetched.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if !self.first_job(&shutdown).await {
            return Ok(());
        }

        let ports = std::mem::take(&mut self.ports);
        let server: JoinHandle<()> =
            tokio::spawn(self.server.clone().serve(ports, shutdown.clone()));
        info!(ports = ?self.local_addrs, "Pool started");

        let mut poll = self.settings.block_refresh_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let rebroadcast = tokio::time::sleep(self.settings.job_rebroadcast_timeout);
        tokio::pin!(rebroadcast);

        loop {
            let broadcast = tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = next_tick(&mut poll) => self.check_for_new_block().await,

                _ = &mut rebroadcast => {
                    info!(
                        timeout_secs = self.settings.job_rebroadcast_timeout.as_secs(),
                        "No new blocks, updating transactions and rebroadcasting work"
                    );
                    // Rearm even when the refresh fails, so a dead node
                    // doesn't make this branch spin.
                    rebroadcast
                        .as_mut()
                        .reset(Instant::now() + self.settings.job_rebroadcast_timeout);
                    self.refresh_current_job().await
                }

                Some(candidate) = self.blocks_rx.recv() => {
                    self.submit_block(candidate).await;
                    self.check_for_new_block().await
                }

                Some(command) = self.commands_rx.recv() => match command {
                    PoolCommand::BlockNotify => {
                        debug!("Block notification");
                        self.check_for_new_block().await
                    }
                },
            };

            if broadcast {
                rebroadcast
                    .as_mut()
                    .reset(Instant::now() + self.settings.job_rebroadcast_timeout);
            }
        }

        info!("Pool stopping");
        if let Err(e) = server.await {
            error!(error = %e, "Stratum server task failed");
        }
        Ok(())
    }

    /// Fetch templates until one builds a job. Returns false on shutdown.
    async fn first_job(&mut self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.source.get_block_template().await {
                Ok(data) => {
                    let height = data.height;
                    let update = self.jobs.lock().process_template(data);
                    match update {
                        Ok(TemplateUpdate::NewBlock(params)) => {
                            self.announce_new_block(&params, height);
                            return true;
                        }
                        Ok(_) => return true,
                        Err(e) => {
                            warn!(error = %e, "Failed to build first job, retrying");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to fetch first block template, retrying");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(FIRST_TEMPLATE_RETRY) => {}
            }
        }
    }

    /// Poll the node and start a new block if there is one. Returns
    /// whether a job was broadcast.
    async fn check_for_new_block(&self) -> bool {
        let data = match self.source.get_block_template().await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to fetch block template");
                return false;
            }
        };

        let height = data.height;
        let update = self.jobs.lock().process_template(data);
        match update {
            Ok(TemplateUpdate::NewBlock(params)) => {
                self.announce_new_block(&params, height);
                self.server.broadcast_job(params, true);
                true
            }
            Ok(TemplateUpdate::Unchanged) => false,
            Ok(TemplateUpdate::Regressed {
                height,
                current_height,
            }) => {
                debug!(height, current_height, "Ignoring template for an older block");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to build job from template");
                false
            }
        }
    }

    /// Rebuild the current block's job from a fresh template so miners
    /// work on recent transactions. Returns whether a job was broadcast.
    async fn refresh_current_job(&self) -> bool {
        let data = match self.source.get_block_template().await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to fetch block template");
                return false;
            }
        };

        let height = data.height;
        let result = {
            let mut jobs = self.jobs.lock();
            match jobs.process_template(data.clone()) {
                Ok(TemplateUpdate::Unchanged) => jobs.update_current_job(data).map(|p| (p, false)),
                Ok(TemplateUpdate::NewBlock(params)) => Ok((params, true)),
                Ok(TemplateUpdate::Regressed { .. }) => return false,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok((params, true)) => {
                self.announce_new_block(&params, height);
                self.server.broadcast_job(params, true);
                true
            }
            Ok((params, false)) => {
                events::emit(
                    &self.events,
                    PoolEvent::UpdatedJob {
                        job_id: params.job_id.clone(),
                        height,
                    },
                );
                self.server.broadcast_job(params, false);
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh job");
                false
            }
        }
    }

    fn announce_new_block(&self, params: &JobParams, height: u64) {
        info!(height, job_id = %params.job_id, "New block to mine");
        events::emit(
            &self.events,
            PoolEvent::NewJob {
                job_id: params.job_id.clone(),
                height,
            },
        );
    }

    async fn submit_block(&self, candidate: AcceptedShare) {
        let AcceptedShare { share, block_hex } = candidate;
        let (Some(block_hex), Some(block_hash)) = (block_hex, share.block_hash.clone()) else {
            return;
        };

        let (accepted, coinbase_txid) = match self.source.submit_block(&block_hex).await {
            Ok(SubmitOutcome::Accepted) => self.check_block_accepted(&block_hash).await,
            Ok(SubmitOutcome::Rejected(reason)) => {
                error!(block_hash = %block_hash, reason = %reason, "Node rejected block");
                (false, None)
            }
            Err(e) => {
                error!(block_hash = %block_hash, error = %e, "Failed to submit block");
                (false, None)
            }
        };

        if accepted {
            info!(
                height = share.height,
                block_hash = %block_hash,
                worker = %share.worker,
                "Block accepted"
            );
        }
        events::emit(
            &self.events,
            PoolEvent::BlockFound {
                share,
                accepted,
                coinbase_txid,
            },
        );
    }

    async fn check_block_accepted(&self, block_hash: &str) -> (bool, Option<String>) {
        match self.source.check_block_accepted(block_hash).await {
            Ok(Some(txid)) => (true, Some(txid)),
            Ok(None) => {
                warn!(block_hash, "Submitted block not found on node");
                (false, None)
            }
            Err(e) => {
                warn!(block_hash, error = %e, "Failed to check submitted block");
                (false, None)
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
