//! Events the pool reports to the rest of the system.
//!
//! Accounting, persistence, and dashboards subscribe to a
//! `tokio::sync::broadcast` channel of [`PoolEvent`]s; the pool never
//! waits on its subscribers. A subscriber that falls behind loses the
//! oldest events and sees a `Lagged` error.

use std::net::{IpAddr, SocketAddr};

use strum::{Display, IntoStaticStr};
use tokio::sync::broadcast;

use crate::job_manager::Share;
use crate::types::Difficulty;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A new block was found on the network; miners restart work.
    NewJob { job_id: String, height: u64 },

    /// The current block's job was refreshed.
    UpdatedJob { job_id: String, height: u64 },

    ShareAccepted(Share),

    ShareRejected {
        job_id: String,
        worker: String,
        ip: IpAddr,
        difficulty: Difficulty,
        code: i32,
        reason: String,
    },

    /// A share met the block target and was submitted to the node.
    BlockFound {
        share: Share,
        accepted: bool,
        /// Coinbase transaction id when the node confirmed the block.
        coinbase_txid: Option<String>,
    },

    ClientConnected {
        subscription_id: String,
        addr: SocketAddr,
    },

    ClientDisconnected {
        subscription_id: String,
        addr: SocketAddr,
        worker: Option<String>,
        reason: DisconnectReason,
    },

    IpBanned {
        ip: IpAddr,
        worker: Option<String>,
        invalid_percent: f64,
    },

    DifficultyChanged {
        subscription_id: String,
        worker: Option<String>,
        difficulty: Difficulty,
    },
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DisconnectReason {
    /// The miner closed the socket.
    Closed,
    /// A line exceeded the maximum message size.
    Flooded,
    /// A line was not valid JSON-RPC.
    Malformed,
    /// No share submitted within the connection timeout.
    TimedOut,
    /// Too many invalid shares.
    Banned,
    /// Connected from an address that is still banned.
    BannedAddress,
    /// The authorizer asked for the connection to be dropped.
    AuthorizerRequest,
    /// The outbound queue filled up.
    SlowConsumer,
    /// Socket read or write failed.
    Io,
    Shutdown,
}

pub type EventSender = broadcast::Sender<PoolEvent>;

pub fn channel() -> (EventSender, broadcast::Receiver<PoolEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Publish an event, ignoring the absence of subscribers.
pub fn emit(events: &EventSender, event: PoolEvent) {
    let _ = events.send(event);
}
