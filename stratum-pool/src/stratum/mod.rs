//! Stratum v1 server.
//!
//! Miners connect over TCP and speak line-delimited JSON-RPC. Every
//! connection runs as its own task that owns the connection's state:
//! extranonce1, difficulty, authorization, ban counters, and vardiff
//! history. Tasks share the job manager, the ban table, and the
//! connection registry through [`StratumServer`].
//!
//! New jobs reach connections through a bounded queue per connection. The
//! broadcaster never waits: a connection whose queue is full is dropped.

mod ban;
mod connection;
mod messages;
mod server;
mod subscription;

pub use ban::{BanStatus, BanTable, BanVerdict, BanningConfig, ShareCounter};
pub use messages::{Method, MessageError, Request, SubmitParams};
pub use server::{BoundPort, ServerConfig, ServerError, StratumServer};
pub use subscription::SubscriptionCounter;

use std::sync::Arc;

use serde::Deserialize;

use crate::template::JobParams;
use crate::vardiff::VarDiffConfig;

/// Longest line accepted from a miner before the connection is dropped.
pub const MAX_LINE_LENGTH: usize = 10240;

/// Jobs that may wait in a connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 16;

/// A listening port.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PortConfig {
    /// TCP port; 0 picks a free one.
    pub port: u16,

    /// Initial difficulty of new connections.
    #[serde(default = "default_port_difficulty")]
    pub diff: f64,

    #[serde(default)]
    pub vardiff: Option<VarDiffConfig>,
}

fn default_port_difficulty() -> f64 {
    8.0
}

/// A job pushed to connections.
#[derive(Debug, Clone)]
pub(crate) struct JobBroadcast {
    pub params: Arc<JobParams>,
    pub clean_jobs: bool,
}

#[cfg(test)]
pub(crate) mod test_support;
