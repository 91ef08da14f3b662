//! One miner connection.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::ban::{BanStatus, BanVerdict, ShareCounter};
use super::messages::{self, MessageError, Method, Request, SubmitParams};
use super::server::{ConnectionHandle, ConnectionKey, PortContext, Shared};
use super::{JobBroadcast, MAX_LINE_LENGTH, OUTBOUND_QUEUE_CAPACITY};
use crate::auth::AuthorizeRequest;
use crate::events::{self, DisconnectReason, PoolEvent};
use crate::job_manager::{AcceptedShare, ShareError, ShareRequest};
use crate::tracing::prelude::*;
use crate::types::Difficulty;
use crate::vardiff::VarDiffState;

type Lines<S> = Framed<S, LinesCodec>;

/// Stratum error code for requests whose params don't decode.
const INVALID_PARAMS_CODE: i32 = 20;

pub(super) struct Connection {
    shared: Arc<Shared>,
    port: Arc<PortContext>,
    key: ConnectionKey,
    subscription_id: String,
    remote: SocketAddr,
    jobs_rx: mpsc::Receiver<JobBroadcast>,
    /// Cancelled when this connection must close.
    cancel: CancellationToken,
    /// Server-wide shutdown; parent of `cancel`.
    shutdown: CancellationToken,

    awaiting_proxy: bool,
    extranonce1: Option<String>,
    difficulty: Option<Difficulty>,
    previous_difficulty: Option<Difficulty>,
    pending_difficulty: Option<Difficulty>,
    authorized: bool,
    worker: Option<String>,
    shares: ShareCounter,
    opened_at: Instant,
    last_activity: Instant,
    vardiff: VarDiffState,
}

impl Connection {
    /// Register a new connection with the server.
    pub(super) fn open(
        shared: &Arc<Shared>,
        port: &Arc<PortContext>,
        remote: SocketAddr,
        shutdown: &CancellationToken,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let cancel = shutdown.child_token();
        let subscription_id = shared.subscriptions.next();
        let key = shared.registry.lock().insert(ConnectionHandle {
            jobs_tx,
            cancel: cancel.clone(),
            subscription_id: subscription_id.clone(),
        });
        let now = Instant::now();

        Self {
            shared: shared.clone(),
            port: port.clone(),
            key,
            subscription_id,
            remote,
            jobs_rx,
            cancel,
            shutdown: shutdown.clone(),
            awaiting_proxy: shared.config.tcp_proxy_protocol,
            extranonce1: None,
            difficulty: None,
            previous_difficulty: None,
            pending_difficulty: None,
            authorized: false,
            worker: None,
            shares: ShareCounter::default(),
            opened_at: now,
            last_activity: now,
            vardiff: VarDiffState::default(),
        }
    }

    /// Serve the connection until it closes for any reason.
    pub(super) async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(
            subscription_id = %self.subscription_id,
            addr = %self.remote,
            port = self.port.port,
            "Miner connected"
        );
        events::emit(
            &self.shared.events,
            PoolEvent::ClientConnected {
                subscription_id: self.subscription_id.clone(),
                addr: self.remote,
            },
        );

        let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let reason = self.serve(&mut lines).await;

        self.cancel.cancel();
        self.shared.registry.lock().remove(self.key);

        debug!(
            subscription_id = %self.subscription_id,
            addr = %self.remote,
            worker = self.worker.as_deref().unwrap_or(""),
            reason = %reason,
            "Miner disconnected"
        );
        events::emit(
            &self.shared.events,
            PoolEvent::ClientDisconnected {
                subscription_id: self.subscription_id,
                addr: self.remote,
                worker: self.worker,
                reason,
            },
        );
    }

    async fn serve<S>(&mut self, lines: &mut Lines<S>) -> DisconnectReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // With PROXY protocol the real address is only known after the
        // preamble.
        if !self.awaiting_proxy {
            if let Err(reason) = self.check_ban() {
                return reason;
            }
        }

        loop {
            if let Err(reason) = self.step(lines).await {
                return reason;
            }
        }
    }

    async fn step<S>(&mut self, lines: &mut Lines<S>) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.cancel_reason()),

            line = lines.next() => match line {
                Some(Ok(line)) => self.handle_line(lines, &line).await,
                None => Err(DisconnectReason::Closed),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(addr = %self.remote, "Detected socket flooding");
                    Err(DisconnectReason::Flooded)
                }
                Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(addr = %self.remote, error = %e, "Malformed message");
                    Err(DisconnectReason::Malformed)
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!(addr = %self.remote, error = %e, "Socket error");
                    Err(DisconnectReason::Io)
                }
            },

            Some(job) = self.jobs_rx.recv() => self.send_job(lines, job).await,
        }
    }

    fn cancel_reason(&self) -> DisconnectReason {
        // The server only cancels a single connection when its queue is full
        if self.shutdown.is_cancelled() {
            DisconnectReason::Shutdown
        } else {
            DisconnectReason::SlowConsumer
        }
    }

    fn check_ban(&self) -> Result<(), DisconnectReason> {
        if !self.shared.config.banning.enabled {
            return Ok(());
        }

        match self.shared.bans.check(self.remote.ip()) {
            BanStatus::NotBanned => Ok(()),
            BanStatus::Forgiven => {
                info!(ip = %self.remote.ip(), "Forgave banned IP");
                Ok(())
            }
            BanStatus::Banned { remaining } => {
                info!(
                    ip = %self.remote.ip(),
                    remaining_secs = remaining.as_secs(),
                    "Rejected connection from banned IP"
                );
                Err(DisconnectReason::BannedAddress)
            }
        }
    }

    async fn handle_line<S>(
        &mut self,
        lines: &mut Lines<S>,
        line: &str,
    ) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let line = line.trim();

        if self.awaiting_proxy {
            self.awaiting_proxy = false;
            let preamble = line.starts_with("PROXY");
            if preamble {
                self.apply_proxy_header(line);
            } else {
                warn!(
                    addr = %self.remote,
                    "PROXY protocol enabled but client sent no PROXY line"
                );
            }
            self.check_ban()?;
            if preamble {
                return Ok(());
            }
        }

        if line.is_empty() {
            return Ok(());
        }

        match Request::decode(line) {
            Ok(request) => self.handle_request(lines, request).await,
            Err(MessageError::Json(e)) => {
                warn!(addr = %self.remote, error = %e, "Malformed message");
                Err(DisconnectReason::Malformed)
            }
            Err(MessageError::Params { id, method }) => {
                debug!(addr = %self.remote, %method, "Invalid params");
                let message = format!("invalid params for {}", method);
                let error = json!([INVALID_PARAMS_CODE, message, null]);
                self.reply(lines, &id, Value::Null, error).await
            }
        }
    }

    /// `PROXY TCP4 <source ip> <dest ip> <source port> <dest port>`
    fn apply_proxy_header(&mut self, line: &str) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(ip) = parts.get(2).and_then(|s| s.parse::<IpAddr>().ok()) else {
            warn!(addr = %self.remote, line, "Unparseable PROXY line");
            return;
        };
        let port = parts
            .get(4)
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.remote.port());

        debug!(from = %self.remote, to = %ip, "Remote address from PROXY line");
        self.remote = SocketAddr::new(ip, port);
    }

    async fn handle_request<S>(
        &mut self,
        lines: &mut Lines<S>,
        request: Request,
    ) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match request {
            Request::Subscribe { id } => self.handle_subscribe(lines, id).await,
            Request::Authorize {
                id,
                worker,
                password,
            } => self.handle_authorize(lines, id, worker, password).await,
            Request::Submit { id, params } => self.handle_submit(lines, id, params).await,
            Request::GetTransactions { .. } => {
                self.write(lines, messages::get_transactions_reply()).await
            }
            Request::Unknown { method, .. } => {
                warn!(addr = %self.remote, method = %method, "Unknown stratum method");
                Ok(())
            }
        }
    }

    async fn handle_subscribe<S>(
        &mut self,
        lines: &mut Lines<S>,
        id: Value,
    ) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (extranonce1, extranonce2_size, job) = {
            let mut jobs = self.shared.jobs.lock();
            (
                jobs.next_extranonce1(),
                jobs.extranonce2_size(),
                jobs.current_job_params(),
            )
        };

        let result =
            messages::subscribe_result(&self.subscription_id, &extranonce1, extranonce2_size);
        self.reply(lines, &id, result, Value::Null).await?;

        debug!(
            subscription_id = %self.subscription_id,
            extranonce1 = %extranonce1,
            "Miner subscribed"
        );
        self.extranonce1 = Some(extranonce1);

        self.send_difficulty(lines, self.port.difficulty).await?;
        if let Some(params) = job {
            self.send_job(
                lines,
                JobBroadcast {
                    params,
                    clean_jobs: true,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_authorize<S>(
        &mut self,
        lines: &mut Lines<S>,
        id: Value,
        worker: String,
        password: String,
    ) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = AuthorizeRequest {
            ip: self.remote.ip(),
            port: self.port.port,
            worker: worker.clone(),
            password,
        };
        let result = self.shared.authorizer.authorize(&request).await;

        self.authorized = result.authorized && result.error.is_none();
        info!(
            worker = %worker,
            addr = %self.remote,
            authorized = self.authorized,
            "Worker authorization"
        );
        self.worker = Some(worker);

        let error = result
            .error
            .map_or(Value::Null, |e| json!([ShareError::Unauthorized.code(), e, null]));
        self.reply(lines, &id, json!(self.authorized), error).await?;

        if result.disconnect {
            return Err(DisconnectReason::AuthorizerRequest);
        }
        Ok(())
    }

    async fn handle_submit<S>(
        &mut self,
        lines: &mut Lines<S>,
        id: Value,
        params: SubmitParams,
    ) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.last_activity = Instant::now();
        let difficulty = self.difficulty.unwrap_or(self.port.difficulty);

        let outcome = match (self.authorized, self.extranonce1.clone()) {
            (false, _) => Err(ShareError::Unauthorized),
            (true, None) => Err(ShareError::NotSubscribed),
            (true, Some(extranonce1)) => {
                let request = ShareRequest {
                    job_id: params.job_id.clone(),
                    extranonce1,
                    extranonce2: params.extranonce2.clone(),
                    ntime: params.ntime.clone(),
                    nonce: params.nonce.clone(),
                    difficulty,
                    previous_difficulty: self.previous_difficulty,
                    ip: self.remote.ip(),
                    port: self.port.port,
                    worker: params.worker.clone(),
                };
                let outcome = self.shared.jobs.lock().process_share(&request);
                self.retarget(difficulty);
                outcome
            }
        };

        let valid = outcome.is_ok();
        let (result, error) = match outcome {
            Ok(accepted) => {
                self.share_accepted(accepted);
                (json!(true), Value::Null)
            }
            Err(e) => {
                self.share_rejected(&params, difficulty, &e);
                (Value::Null, e.to_stratum())
            }
        };

        if let BanVerdict::Ban { invalid_percent } =
            self.shares.record(valid, &self.shared.config.banning)
        {
            warn!(
                ip = %self.remote.ip(),
                worker = %params.worker,
                invalid_percent,
                "Banning IP for too many invalid shares"
            );
            self.shared.bans.ban(self.remote.ip());
            events::emit(
                &self.shared.events,
                PoolEvent::IpBanned {
                    ip: self.remote.ip(),
                    worker: self.worker.clone(),
                    invalid_percent,
                },
            );
            return Err(DisconnectReason::Banned);
        }

        self.reply(lines, &id, result, error).await
    }

    fn share_accepted(&self, accepted: AcceptedShare) {
        let share = &accepted.share;
        debug!(
            worker = %share.worker,
            job_id = %share.job_id,
            difficulty = %share.difficulty,
            share_diff = share.share_diff,
            "Share accepted"
        );
        events::emit(&self.shared.events, PoolEvent::ShareAccepted(share.clone()));

        if accepted.is_block_candidate() {
            info!(
                worker = %share.worker,
                height = share.height,
                block_hash = share.block_hash.as_deref().unwrap_or(""),
                "Block candidate found"
            );
            match self.shared.blocks.try_send(accepted) {
                Ok(()) => {}
                Err(TrySendError::Full(candidate)) => error!(
                    worker = %candidate.share.worker,
                    height = candidate.share.height,
                    "Block candidate dropped, submission queue full"
                ),
                Err(TrySendError::Closed(_)) => {
                    warn!("Block candidate dropped, no one is submitting blocks");
                }
            }
        }
    }

    fn share_rejected(&self, params: &SubmitParams, difficulty: Difficulty, error: &ShareError) {
        debug!(
            worker = %params.worker,
            job_id = %params.job_id,
            code = error.code(),
            error = %error,
            "Share rejected"
        );
        events::emit(
            &self.shared.events,
            PoolEvent::ShareRejected {
                job_id: params.job_id.clone(),
                worker: params.worker.clone(),
                ip: self.remote.ip(),
                difficulty,
                code: error.code(),
                reason: error.to_string(),
            },
        );
    }

    /// Feed the submission to vardiff and queue any proposed difficulty.
    fn retarget(&mut self, current: Difficulty) {
        let Some(controller) = &self.port.vardiff else {
            return;
        };
        let ts = self.opened_at.elapsed().as_secs_f64();
        if let Some(proposed) = controller.on_submit(&mut self.vardiff, ts, current) {
            debug!(
                subscription_id = %self.subscription_id,
                from = %current,
                to = %proposed,
                "Retargeted difficulty"
            );
            self.pending_difficulty = Some(proposed);
        }
    }

    /// Returns whether a `mining.set_difficulty` went out.
    async fn send_difficulty<S>(
        &mut self,
        lines: &mut Lines<S>,
        difficulty: Difficulty,
    ) -> Result<bool, DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.difficulty == Some(difficulty) {
            return Ok(false);
        }
        self.previous_difficulty = self.difficulty;
        self.difficulty = Some(difficulty);
        self.write(lines, messages::set_difficulty(difficulty)).await?;
        Ok(true)
    }

    async fn send_job<S>(
        &mut self,
        lines: &mut Lines<S>,
        job: JobBroadcast,
    ) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle = self.last_activity.elapsed();
        if idle > self.shared.config.connection_timeout {
            warn!(
                addr = %self.remote,
                worker = self.worker.as_deref().unwrap_or(""),
                idle_secs = idle.as_secs(),
                "No share within the connection timeout"
            );
            return Err(DisconnectReason::TimedOut);
        }

        if self.extranonce1.is_none() {
            return Ok(());
        }

        if let Some(pending) = self.pending_difficulty.take() {
            if self.send_difficulty(lines, pending).await? {
                events::emit(
                    &self.shared.events,
                    PoolEvent::DifficultyChanged {
                        subscription_id: self.subscription_id.clone(),
                        worker: self.worker.clone(),
                        difficulty: pending,
                    },
                );
            }
        }

        let params = job.params.to_notify_params(job.clean_jobs);
        self.write(lines, messages::notification(Method::Notify, params))
            .await
    }

    async fn reply<S>(
        &self,
        lines: &mut Lines<S>,
        id: &Value,
        result: Value,
        error: Value,
    ) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.write(lines, messages::response(id, result, error)).await
    }

    async fn write<S>(&self, lines: &mut Lines<S>, line: String) -> Result<(), DisconnectReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::select! {
            result = lines.send(line) => result.map_err(|e| {
                debug!(addr = %self.remote, error = %e, "Write failed");
                DisconnectReason::Io
            }),
            _ = self.cancel.cancelled() => Err(self.cancel_reason()),
        }
    }
}
