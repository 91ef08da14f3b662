//! Block template as returned by the node's `getblocktemplate`.

use serde::Deserialize;

/// Raw template data. Immutable once a job has been built from it.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplateData {
    pub version: u32,

    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,

    pub height: u64,

    pub curtime: u32,

    /// Compact target as 8 hex characters.
    pub bits: String,

    /// Explicit target, preferred over `bits` when present.
    #[serde(default)]
    pub target: Option<String>,

    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,

    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,

    #[serde(default)]
    pub masternode: Option<MasternodePayees>,

    #[serde(default)]
    pub superblock: Option<Vec<Payee>>,

    #[serde(default)]
    pub masternode_payments: bool,

    #[serde(default)]
    pub votes: Vec<String>,

    /// Secondary payee address (development fund and similar).
    #[serde(default)]
    pub payee: Option<String>,

    #[serde(default)]
    pub payee_amount: Option<u64>,

    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,

    #[serde(default)]
    pub txid: Option<String>,

    pub hash: String,
}

impl TemplateTransaction {
    /// Id used in the merkle tree: `txid` when the node provides it (segwit
    /// nodes report the witness hash in `hash`), otherwise `hash`.
    pub fn merkle_id(&self) -> &str {
        self.txid.as_deref().unwrap_or(&self.hash)
    }
}

/// A payout demanded by the template.
#[derive(Debug, Clone, Deserialize)]
pub struct Payee {
    pub payee: String,

    /// Output script in hex; derived from `payee` when absent.
    #[serde(default)]
    pub script: Option<String>,

    pub amount: u64,
}

/// Masternode payouts, reported as a single object by older nodes and as a
/// list by newer ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MasternodePayees {
    One(Payee),
    Many(Vec<Payee>),
}

impl MasternodePayees {
    pub fn payees(&self) -> &[Payee] {
        match self {
            MasternodePayees::One(p) => std::slice::from_ref(p),
            MasternodePayees::Many(list) => list,
        }
    }
}
