//! The blockchain node the pool mines on.
//!
//! The pool needs three things from a node: block templates, a way to
//! submit found blocks, and a way to confirm a submitted block made it into
//! the chain. [`TemplateSource`] captures that contract; [`RpcClient`] is
//! the JSON-RPC implementation used by the daemon.

mod rpc;

pub use rpc::RpcClient;

use async_trait::async_trait;
use thiserror::Error;

use crate::template::BlockTemplateData;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{0} returned no result")]
    MissingResult(&'static str),

    #[error("unexpected {method} response: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Node verdict on a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Rejection reason as reported by the node, e.g. "high-hash".
    Rejected(String),
}

#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn get_block_template(&self) -> Result<BlockTemplateData, NodeError>;

    async fn submit_block(&self, block_hex: &str) -> Result<SubmitOutcome, NodeError>;

    /// Whether the block is known to the node. Returns the id of its
    /// coinbase transaction if so.
    async fn check_block_accepted(&self, block_hash: &str) -> Result<Option<String>, NodeError>;
}
