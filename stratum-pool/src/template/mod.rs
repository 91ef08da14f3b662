//! Mining jobs built from block templates.
//!
//! A [`BlockTemplate`] is one job: the node's template data plus everything
//! derived from it once (target, difficulty, coinbase halves, merkle
//! branch) and the set of submissions already seen for it.

mod data;
mod generation;

pub use data::{BlockTemplateData, MasternodePayees, Payee, TemplateTransaction};
pub use generation::{GenerationConfig, GenerationTx, RewardKind, RewardRecipient};

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;

use crate::codec::{
    self, DecodeError, pack_i32_be, pack_u32_be, reverse_byte_order, reverse_bytes, var_int,
};
use crate::merkle::MerkleTree;
use crate::u256::{self, U256};

/// Bytes reserved in the coinbase for `extranonce1 || extranonce2`.
pub const EXTRANONCE_PLACEHOLDER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("invalid {field} in block template: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: DecodeError,
    },

    #[error("invalid target in block template: {0}")]
    InvalidTarget(String),

    #[error("payouts exceed coinbase value {reward}")]
    RewardExceeded { reward: u64 },
}

/// The nine `mining.notify` parameters, minus the clean-jobs flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParams {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub bits: String,
    pub time: String,
}

impl JobParams {
    pub fn to_notify_params(&self, clean_jobs: bool) -> Value {
        json!([
            self.job_id,
            self.prev_hash,
            self.coinbase1,
            self.coinbase2,
            self.merkle_branch,
            self.version,
            self.bits,
            self.time,
            clean_jobs,
        ])
    }
}

/// A job derived from a block template.
#[derive(Debug)]
pub struct BlockTemplate {
    pub job_id: String,
    pub data: BlockTemplateData,

    /// Block target; a hash at or below it is a block.
    pub target: U256,

    /// Network difficulty, `diff1 / target`, rounded to 9 decimals.
    pub difficulty: f64,

    /// Previous block hash in display byte order.
    prev_hash: [u8; 32],
    bits: u32,
    generation: GenerationTx,
    merkle: MerkleTree,
    transaction_data: Vec<u8>,
    reward: RewardKind,
    submits: HashSet<String>,
    params: Arc<JobParams>,
}

impl BlockTemplate {
    pub fn new(
        job_id: String,
        data: BlockTemplateData,
        generation_config: &GenerationConfig,
        diff1: &U256,
        now: u64,
    ) -> Result<Self, TemplateError> {
        let bits = u32::from_str_radix(&data.bits, 16)
            .map_err(|_| TemplateError::InvalidTarget(format!("bits {:?}", data.bits)))?;

        let target = match &data.target {
            Some(hex) => U256::from_str_radix(hex, 16)
                .map_err(|_| TemplateError::InvalidTarget(hex.clone()))?,
            None => u256::from_compact(bits)
                .ok_or_else(|| TemplateError::InvalidTarget(format!("bits {}", data.bits)))?,
        };
        if target == U256::ZERO {
            return Err(TemplateError::InvalidTarget("zero".into()));
        }
        let difficulty = round_to(u256::to_f64(diff1) / u256::to_f64(&target), 9);

        let prev_hash = codec::decode_fixed_hex::<32>(&data.previous_block_hash).map_err(
            |source| TemplateError::Decode {
                field: "previousblockhash",
                source,
            },
        )?;

        let mut tx_hashes = Vec::with_capacity(data.transactions.len());
        let mut transaction_data = Vec::new();
        for tx in &data.transactions {
            let hash = codec::uint256_from_hash_hex(tx.merkle_id()).map_err(|source| {
                TemplateError::Decode {
                    field: "transaction id",
                    source,
                }
            })?;
            tx_hashes.push(hash);

            let raw = hex::decode(&tx.data).map_err(|e| TemplateError::Decode {
                field: "transaction data",
                source: e.into(),
            })?;
            transaction_data.extend(raw);
        }
        let merkle = MerkleTree::new(tx_hashes);

        // Vote data follows the transactions in the block body
        if data.masternode_payments {
            let mut votes = var_int(data.votes.len() as u64);
            for vote in &data.votes {
                let raw = hex::decode(vote).map_err(|e| TemplateError::Decode {
                    field: "vote",
                    source: e.into(),
                })?;
                votes.extend(raw);
            }
            transaction_data.extend(votes);
        }

        let generation =
            GenerationTx::build(&data, generation_config, EXTRANONCE_PLACEHOLDER_LEN, now)?;

        let params = Arc::new(JobParams {
            job_id: job_id.clone(),
            prev_hash: hex::encode(reverse_byte_order(&prev_hash)),
            coinbase1: hex::encode(&generation.part1),
            coinbase2: hex::encode(&generation.part2),
            merkle_branch: merkle.steps_hex(),
            version: hex::encode(pack_i32_be(data.version as i32)),
            bits: data.bits.clone(),
            time: hex::encode(pack_u32_be(data.curtime)),
        });

        Ok(Self {
            job_id,
            target,
            difficulty,
            prev_hash,
            bits,
            generation,
            merkle,
            transaction_data,
            reward: generation_config.reward,
            submits: HashSet::new(),
            params,
            data,
        })
    }

    /// Cached `mining.notify` parameters.
    pub fn job_params(&self) -> Arc<JobParams> {
        Arc::clone(&self.params)
    }

    pub fn serialize_coinbase(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        self.generation.assemble(extranonce1, extranonce2)
    }

    /// Merkle root, in internal byte order, for a coinbase hash.
    pub fn merkle_root(&self, coinbase_hash: &[u8; 32]) -> [u8; 32] {
        self.merkle.with_first(coinbase_hash)
    }

    /// Serialize the 80-byte header.
    ///
    /// Fields are laid down last-to-first in their big-endian (RPC display)
    /// form and the whole buffer is then reversed, which yields the usual
    /// little-endian wire layout.
    pub fn serialize_header(&self, merkle_root: &[u8; 32], ntime: u32, nonce: u32) -> [u8; 80] {
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&nonce.to_be_bytes());
        header[4..8].copy_from_slice(&self.bits.to_be_bytes());
        header[8..12].copy_from_slice(&ntime.to_be_bytes());
        header[12..44].copy_from_slice(&reverse_bytes(merkle_root));
        header[44..76].copy_from_slice(&self.prev_hash);
        header[76..80].copy_from_slice(&self.data.version.to_be_bytes());
        header.reverse();
        header
    }

    /// Full block for submission to the node.
    pub fn serialize_block(&self, header: &[u8; 80], coinbase: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(
            header.len() + 9 + coinbase.len() + self.transaction_data.len() + 1,
        );
        block.extend_from_slice(header);
        block.extend(var_int(self.data.transactions.len() as u64 + 1));
        block.extend_from_slice(coinbase);
        block.extend_from_slice(&self.transaction_data);
        if self.reward == RewardKind::Pos {
            block.push(0);
        }
        block
    }

    /// Record a submission. Returns false, leaving the set unchanged, if the
    /// same submission was already recorded.
    pub fn register_submit(
        &mut self,
        extranonce1: &str,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> bool {
        let key = format!("{extranonce1}{extranonce2}{ntime}{nonce}").to_ascii_lowercase();
        self.submits.insert(key)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::bitcoin_diff1;
    use crate::codec::sha256d;
    use bitcoin::block::{Header, Version};
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::consensus::encode::serialize_hex;
    use bitcoin::consensus::{deserialize, serialize};
    use bitcoin::hashes::Hash;
    use bitcoin::pow::CompactTarget;
    use bitcoin::{Block, BlockHash, Network, TxMerkleNode};
    use std::str::FromStr;

    const PREV_HASH: &str = "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054";

    fn generation_config() -> GenerationConfig {
        GenerationConfig {
            pool_script: vec![0x51],
            recipients: vec![],
            reward: RewardKind::Pow,
            tx_messages: false,
            signature: "/stratum-pool/".into(),
        }
    }

    fn template_data(transactions: serde_json::Value) -> BlockTemplateData {
        serde_json::from_value(json!({
            "version": 0x20000000,
            "previousblockhash": PREV_HASH,
            "height": 840_000,
            "curtime": 1_713_571_767,
            "bits": "1d00ffff",
            "coinbasevalue": 312_500_000,
            "transactions": transactions,
        }))
        .unwrap()
    }

    fn job(transactions: serde_json::Value) -> BlockTemplate {
        BlockTemplate::new(
            "1".into(),
            template_data(transactions),
            &generation_config(),
            &bitcoin_diff1(),
            1_713_571_770,
        )
        .unwrap()
    }

    #[test]
    fn test_target_and_difficulty_from_bits() {
        let job = job(json!([]));
        assert_eq!(job.target, bitcoin_diff1());
        assert_eq!(job.difficulty, 1.0);
    }

    #[test]
    fn test_explicit_target_wins() {
        let mut data = template_data(json!([]));
        let half: U256 = bitcoin_diff1() >> 1;
        data.target = Some(hex::encode(half.to_be_bytes::<32>()));

        let job = BlockTemplate::new("1".into(), data, &generation_config(), &bitcoin_diff1(), 0)
            .unwrap();
        assert_eq!(job.target, half);
        assert_eq!(job.difficulty, 2.0);
    }

    fn block_body(data: BlockTemplateData) -> Vec<u8> {
        let job =
            BlockTemplate::new("1".into(), data, &generation_config(), &bitcoin_diff1(), 0)
                .unwrap();
        let coinbase = job.serialize_coinbase(&[0; 4], &[0; 4]);
        let block = job.serialize_block(&[0; 80], &coinbase);
        block[80 + 1 + coinbase.len()..].to_vec()
    }

    #[test]
    fn test_vote_data_follows_transactions() {
        // Masternode chains always carry a vote count, even when zero
        let mut data = template_data(json!([]));
        data.masternode_payments = true;
        assert_eq!(block_body(data), vec![0x00]);

        let mut data = template_data(json!([{"data": "0100", "hash": "aa"}]));
        data.masternode_payments = true;
        data.votes = vec!["ab".into(), "cd".into()];
        assert_eq!(block_body(data), vec![0x01, 0x00, 0x02, 0xab, 0xcd]);

        // No vote data without masternode payments
        let mut data = template_data(json!([]));
        data.votes = vec!["ab".into()];
        assert!(block_body(data).is_empty());
    }

    #[test]
    fn test_invalid_template_rejected() {
        let mut data = template_data(json!([]));
        data.bits = "zz".into();
        assert!(matches!(
            BlockTemplate::new("1".into(), data, &generation_config(), &bitcoin_diff1(), 0),
            Err(TemplateError::InvalidTarget(_))
        ));

        let mut data = template_data(json!([]));
        data.previous_block_hash = "1234".into();
        assert!(matches!(
            BlockTemplate::new("1".into(), data, &generation_config(), &bitcoin_diff1(), 0),
            Err(TemplateError::Decode { field: "previousblockhash", .. })
        ));
    }

    #[test]
    fn test_job_params() {
        let job = job(json!([]));
        let params = job.job_params();

        assert_eq!(params.job_id, "1");
        assert_eq!(params.version, "20000000");
        assert_eq!(params.bits, "1d00ffff");
        assert_eq!(params.time, format!("{:08x}", 1_713_571_767));
        assert!(params.merkle_branch.is_empty());

        // Word order reversed, bytes within each word kept
        assert_eq!(&params.prev_hash[..8], "2728a054");
        assert_eq!(&params.prev_hash[56..], "00000000");

        let notify = params.to_notify_params(true);
        assert_eq!(notify.as_array().unwrap().len(), 9);
        assert_eq!(notify[8], json!(true));
    }

    #[test]
    fn test_header_matches_consensus_encoding() {
        let job = job(json!([]));
        let merkle_root = [0x5a; 32];
        let ntime = 1_713_571_800;
        let nonce = 0xdeadbeef;

        let ours = job.serialize_header(&merkle_root, ntime, nonce);

        let header = Header {
            version: Version::from_consensus(0x20000000),
            prev_blockhash: BlockHash::from_str(PREV_HASH).unwrap(),
            merkle_root: TxMerkleNode::from_byte_array(merkle_root),
            time: ntime,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce,
        };
        assert_eq!(ours.to_vec(), serialize(&header));

        let block_hash = hex::encode(reverse_bytes(&sha256d(&ours)));
        assert_eq!(block_hash, header.block_hash().to_string());
    }

    #[test]
    fn test_serialize_block_round_trips_through_rust_bitcoin() {
        // Any real transaction will do; borrow the genesis coinbase
        let genesis = genesis_block(Network::Bitcoin);
        let tx = &genesis.txdata[0];
        let txid = tx.compute_txid().to_string();
        let job = job(json!([{
            "data": serialize_hex(tx),
            "txid": txid,
            "hash": txid,
        }]));

        let coinbase = job.serialize_coinbase(&[1, 2, 3, 4], &[5, 6, 7, 8]);
        let root = job.merkle_root(&sha256d(&coinbase));
        let header = job.serialize_header(&root, 1_713_571_800, 7);
        let raw = job.serialize_block(&header, &coinbase);

        let block: Block = deserialize(&raw).unwrap();
        assert_eq!(block.txdata.len(), 2);
        assert_eq!(block.txdata[1].compute_txid().to_string(), txid);
        assert_eq!(
            block.txdata[0].compute_txid().to_byte_array(),
            sha256d(&coinbase)
        );
        assert!(block.check_merkle_root());
    }

    #[test]
    fn test_pos_block_has_trailing_byte() {
        let mut config = generation_config();
        config.reward = RewardKind::Pos;
        let job = BlockTemplate::new(
            "1".into(),
            template_data(json!([])),
            &config,
            &bitcoin_diff1(),
            0,
        )
        .unwrap();

        let coinbase = job.serialize_coinbase(&[0; 4], &[0; 4]);
        let raw = job.serialize_block(&[0; 80], &coinbase);
        assert_eq!(raw.len(), 80 + 1 + coinbase.len() + 1);
        assert_eq!(raw.last(), Some(&0));
    }

    #[test]
    fn test_register_submit_rejects_duplicates() {
        let mut job = job(json!([]));
        assert!(job.register_submit("aabbccdd", "00000001", "5f5e1000", "12345678"));
        assert!(!job.register_submit("aabbccdd", "00000001", "5f5e1000", "12345678"));

        // Case differences are the same submission
        assert!(!job.register_submit("AABBCCDD", "00000001", "5f5e1000", "12345678"));
        assert!(job.register_submit("aabbccdd", "00000002", "5f5e1000", "12345678"));
    }
}
