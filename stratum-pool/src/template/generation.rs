//! Generation (coinbase) transaction construction.
//!
//! The coinbase is built in two halves split where the extranonces go:
//! miners receive both halves and splice `extranonce1 || extranonce2`
//! between them, so the pool can rebuild the exact transaction from a
//! share submission.

use serde::Deserialize;

use super::TemplateError;
use super::data::{BlockTemplateData, Payee};
use crate::codec::{
    address_to_script, pack_u32_le, pack_u64_le, serialize_number, var_int, var_string,
};

/// Consensus flavor of the coin's block reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RewardKind {
    #[default]
    Pow,
    /// Proof-of-stake hybrids carry a timestamp in the transaction and a
    /// trailing signature byte in the block.
    Pos,
}

/// A share of every block reward paid to a fixed script.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardRecipient {
    pub script: Vec<u8>,
    /// Fraction of the reward, in [0, 1].
    pub fraction: f64,
}

/// Pool-wide inputs to coinbase construction.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Output script receiving the remainder of the reward.
    pub pool_script: Vec<u8>,
    pub recipients: Vec<RewardRecipient>,
    pub reward: RewardKind,
    /// Version-2 transactions with a trailing comment.
    pub tx_messages: bool,
    /// Tag pushed at the end of the coinbase scriptSig.
    pub signature: String,
}

/// The two halves of a generation transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTx {
    pub part1: Vec<u8>,
    pub part2: Vec<u8>,
}

impl GenerationTx {
    /// Build the coinbase around an extranonce slot of `extranonce_len`
    /// bytes.
    pub fn build(
        data: &BlockTemplateData,
        config: &GenerationConfig,
        extranonce_len: usize,
        now: u64,
    ) -> Result<Self, TemplateError> {
        let tx_version: u32 = if config.tx_messages { 2 } else { 1 };

        let mut script_sig_part1 = serialize_number(data.height);
        script_sig_part1.extend(serialize_number(now));
        script_sig_part1.push(extranonce_len as u8);

        let script_sig_part2 = var_string(config.signature.as_bytes());
        let script_sig_len = script_sig_part1.len() + extranonce_len + script_sig_part2.len();

        let mut part1 = Vec::new();
        part1.extend_from_slice(&pack_u32_le(tx_version));
        if config.reward == RewardKind::Pos {
            part1.extend_from_slice(&pack_u32_le(data.curtime));
        }
        // One input spending the null outpoint
        part1.extend(var_int(1));
        part1.extend_from_slice(&[0u8; 32]);
        part1.extend_from_slice(&pack_u32_le(0xffff_ffff));
        part1.extend(var_int(script_sig_len as u64));
        part1.extend(script_sig_part1);

        let mut part2 = script_sig_part2;
        part2.extend_from_slice(&pack_u32_le(0)); // sequence
        part2.extend(build_outputs(data, config)?);
        part2.extend_from_slice(&pack_u32_le(0)); // lock time
        if config.tx_messages {
            part2.extend(var_string(config.signature.as_bytes()));
        }

        Ok(Self { part1, part2 })
    }

    /// Full coinbase for a given extranonce.
    pub fn assemble(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut tx = Vec::with_capacity(
            self.part1.len() + extranonce1.len() + extranonce2.len() + self.part2.len(),
        );
        tx.extend_from_slice(&self.part1);
        tx.extend_from_slice(extranonce1);
        tx.extend_from_slice(extranonce2);
        tx.extend_from_slice(&self.part2);
        tx
    }
}

/// Serialized output list: payees required by the template first come out
/// of the reward, fee recipients take their fraction of what remains, and
/// the pool output gets the rest.
fn build_outputs(
    data: &BlockTemplateData,
    config: &GenerationConfig,
) -> Result<Vec<u8>, TemplateError> {
    let mut reward = data.coinbase_value;
    let mut outputs: Vec<Vec<u8>> = Vec::new();

    let mut pay = |amount: u64, script: Vec<u8>, reward: &mut u64| -> Result<(), TemplateError> {
        *reward = reward
            .checked_sub(amount)
            .ok_or(TemplateError::RewardExceeded {
                reward: data.coinbase_value,
            })?;
        outputs.push(tx_output(amount, &script));
        Ok(())
    };

    if let (Some(masternode), Some(superblock)) = (&data.masternode, &data.superblock) {
        let payees = if masternode.payees().is_empty() {
            superblock.as_slice()
        } else {
            masternode.payees()
        };
        for payee in payees {
            pay(payee.amount, payee_script(payee)?, &mut reward)?;
        }
    }

    if let Some(address) = &data.payee {
        let amount = data.payee_amount.unwrap_or(reward.div_ceil(5));
        let script = address_to_script(address).map_err(|source| TemplateError::Decode {
            field: "payee",
            source,
        })?;
        pay(amount, script, &mut reward)?;
    }

    let mut pool_reward = reward;
    for recipient in &config.recipients {
        let amount = (recipient.fraction * reward as f64).floor() as u64;
        pool_reward = pool_reward
            .checked_sub(amount)
            .ok_or(TemplateError::RewardExceeded {
                reward: data.coinbase_value,
            })?;
        outputs.push(tx_output(amount, &recipient.script));
    }

    outputs.insert(0, tx_output(pool_reward, &config.pool_script));

    if let Some(commitment) = &data.default_witness_commitment {
        let script = hex::decode(commitment).map_err(|e| TemplateError::Decode {
            field: "default_witness_commitment",
            source: e.into(),
        })?;
        outputs.insert(0, tx_output(0, &script));
    }

    let mut out = var_int(outputs.len() as u64);
    for output in outputs {
        out.extend(output);
    }
    Ok(out)
}

fn payee_script(payee: &Payee) -> Result<Vec<u8>, TemplateError> {
    match &payee.script {
        Some(script) => hex::decode(script).map_err(|e| TemplateError::Decode {
            field: "masternode script",
            source: e.into(),
        }),
        None => address_to_script(&payee.payee).map_err(|source| TemplateError::Decode {
            field: "masternode payee",
            source,
        }),
    }
}

fn tx_output(amount: u64, script: &[u8]) -> Vec<u8> {
    let mut out = pack_u64_le(amount).to_vec();
    out.extend(var_string(script));
    out
}
