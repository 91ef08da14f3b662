//! Fixtures shared by the server and connection tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use slotmap::SlotMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};

use super::ban::{BanTable, BanningConfig};
use super::server::{PortContext, ServerConfig, Shared};
use super::subscription::SubscriptionCounter;
use super::PortConfig;
use crate::algorithm::{PowAlgorithm, bitcoin_diff1};
use crate::auth::{AcceptAll, AuthorizeRequest, AuthorizeResult, Authorizer};
use crate::events::{self, DisconnectReason, EventSender, PoolEvent};
use crate::job_manager::{AcceptedShare, JobManager, JobManagerConfig, TemplateUpdate};
use crate::template::{BlockTemplateData, GenerationConfig, JobParams, RewardKind};
use crate::types::{Difficulty, unix_time};
use crate::u256::U256;
use crate::vardiff::{VarDiffConfig, VarDiffController};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Hashes every header to the same value.
#[derive(Debug)]
pub struct FixedHash {
    hash: [u8; 32],
}

impl FixedHash {
    /// Every share is worth exactly `difficulty`.
    pub fn at_difficulty(difficulty: u64) -> Arc<dyn PowAlgorithm> {
        let value = bitcoin_diff1() / U256::from(difficulty);
        Arc::new(Self {
            hash: value.to_le_bytes::<32>(),
        })
    }

    /// Every share is a block.
    pub fn block() -> Arc<dyn PowAlgorithm> {
        Arc::new(Self { hash: [0; 32] })
    }
}

impl PowAlgorithm for FixedHash {
    fn name(&self) -> &str {
        "fixed"
    }

    fn hash(&self, _header: &[u8]) -> [u8; 32] {
        self.hash
    }

    fn diff1(&self) -> U256 {
        bitcoin_diff1()
    }

    fn multiplier(&self) -> f64 {
        1.0
    }
}

/// Returns the same verdict for every worker.
pub struct FixedAuthorizer(pub AuthorizeResult);

#[async_trait]
impl Authorizer for FixedAuthorizer {
    async fn authorize(&self, _request: &AuthorizeRequest) -> AuthorizeResult {
        self.0.clone()
    }
}

/// Current time as template `curtime`, so shares can use it as ntime.
pub fn template() -> BlockTemplateData {
    template_at(0x11, 100)
}

pub fn template_at(prev: u8, height: u64) -> BlockTemplateData {
    serde_json::from_value(serde_json::json!({
        "version": 0x20000000,
        "previousblockhash": format!("{:02x}", prev).repeat(32),
        "height": height,
        "curtime": unix_time(),
        "bits": "1a10c6f7",
        "coinbasevalue": 625_000_000,
    }))
    .unwrap()
}

/// A job manager with no jobs yet.
pub fn job_manager(algorithm: Arc<dyn PowAlgorithm>) -> JobManager {
    let config = JobManagerConfig {
        generation: GenerationConfig {
            pool_script: vec![0x51],
            recipients: vec![],
            reward: RewardKind::Pow,
            tx_messages: false,
            signature: "/test/".into(),
        },
        instance_id: 1,
        emit_invalid_block_hashes: false,
    };
    JobManager::new(config, algorithm)
}

pub struct Harness {
    pub jobs: Arc<Mutex<JobManager>>,
    pub authorizer: Arc<dyn Authorizer>,
    pub events: EventSender,
    pub blocks_tx: mpsc::Sender<AcceptedShare>,
    pub blocks_rx: mpsc::Receiver<AcceptedShare>,
}

impl Harness {
    pub fn new(algorithm: Arc<dyn PowAlgorithm>) -> Self {
        let mut jobs = job_manager(algorithm);
        let update = jobs.process_template(template()).unwrap();
        assert!(matches!(update, TemplateUpdate::NewBlock(_)));

        let (events, _) = events::channel();
        let (blocks_tx, blocks_rx) = mpsc::channel(8);
        Self {
            jobs: Arc::new(Mutex::new(jobs)),
            authorizer: Arc::new(AcceptAll),
            events,
            blocks_tx,
            blocks_rx,
        }
    }

    /// Issue a new job for the current block.
    pub fn refresh_job(&self) -> Arc<JobParams> {
        self.jobs.lock().update_current_job(template()).unwrap()
    }

    pub(super) fn shared(&self, config: ServerConfig) -> Arc<Shared> {
        let bans = BanTable::new(config.banning.duration());
        Arc::new(Shared {
            config,
            jobs: self.jobs.clone(),
            authorizer: self.authorizer.clone(),
            bans,
            registry: Mutex::new(SlotMap::with_key()),
            subscriptions: SubscriptionCounter::new(),
            events: self.events.clone(),
            blocks: self.blocks_tx.clone(),
        })
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ports: vec![PortConfig {
            port: 0,
            diff: 8.0,
            vardiff: None,
        }],
        banning: BanningConfig::default(),
        connection_timeout: Duration::from_secs(600),
        tcp_proxy_protocol: false,
    }
}

pub(super) fn port_context(difficulty: f64, vardiff: Option<VarDiffConfig>) -> Arc<PortContext> {
    Arc::new(PortContext {
        port: 3333,
        difficulty: Difficulty::new(difficulty).unwrap(),
        vardiff: vardiff.map(VarDiffController::new),
    })
}

pub fn remote_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 40000)
}

/// Miner side of a connection.
pub struct TestClient<S = TcpStream> {
    lines: Framed<S, LinesCodec>,
}

impl TestClient<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            lines: Framed::new(stream, LinesCodec::new()),
        }
    }

    pub async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.lines.send(line).await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Skip remaining messages; true once the server closes the connection.
    pub async fn recv_eof(&mut self) -> bool {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.lines.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

pub async fn next_disconnect(events: &mut broadcast::Receiver<PoolEvent>) -> DisconnectReason {
    loop {
        let event = tokio::time::timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a disconnect")
            .unwrap();
        if let PoolEvent::ClientDisconnected { reason, .. } = event {
            return reason;
        }
    }
}
