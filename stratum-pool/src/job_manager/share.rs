//! Share submissions and their outcomes.

use std::net::IpAddr;

use serde_json::{Value, json};
use thiserror::Error;

use crate::types::Difficulty;

/// A `mining.submit` as seen by the job manager.
#[derive(Debug, Clone)]
pub struct ShareRequest {
    pub job_id: String,
    pub extranonce1: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub difficulty: Difficulty,
    pub previous_difficulty: Option<Difficulty>,
    pub ip: IpAddr,
    pub port: u16,
    pub worker: String,
}

/// Reasons a share is rejected, with their Stratum error codes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShareError {
    #[error("incorrect size of extranonce2")]
    IncorrectExtranonce2Size,

    #[error("job not found")]
    JobNotFound,

    #[error("incorrect size of ntime")]
    IncorrectNtimeSize,

    #[error("ntime out of range")]
    NtimeOutOfRange,

    #[error("incorrect size of nonce")]
    IncorrectNonceSize,

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("duplicate share")]
    Duplicate,

    #[error("low difficulty share of {0}")]
    LowDifficulty(f64),

    #[error("unauthorized worker")]
    Unauthorized,

    #[error("not subscribed")]
    NotSubscribed,
}

impl ShareError {
    pub fn code(&self) -> i32 {
        match self {
            ShareError::JobNotFound => 21,
            ShareError::Duplicate => 22,
            ShareError::LowDifficulty(_) => 23,
            ShareError::Unauthorized => 24,
            ShareError::NotSubscribed => 25,
            ShareError::IncorrectExtranonce2Size
            | ShareError::IncorrectNtimeSize
            | ShareError::NtimeOutOfRange
            | ShareError::IncorrectNonceSize
            | ShareError::Malformed(_) => 20,
        }
    }

    /// Stratum error triple: `[code, message, null]`.
    pub fn to_stratum(&self) -> Value {
        json!([self.code(), self.to_string(), null])
    }
}

/// Record of an accepted share.
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub job_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub worker: String,
    pub height: u64,
    pub block_reward: u64,

    /// Difficulty credited for this share.
    pub difficulty: Difficulty,

    /// Difficulty actually achieved by the hash, to 8 decimals.
    pub share_diff: f64,

    /// Network difficulty scaled by the algorithm multiplier.
    pub block_diff: f64,

    /// Network difficulty as reported by the job.
    pub block_diff_actual: f64,

    /// Set when the share is also a block.
    pub block_hash: Option<String>,

    /// Block hash of a non-block share, when that reporting is enabled.
    pub block_hash_invalid: Option<String>,
}

/// An accepted share and, for block candidates, the serialized block.
#[derive(Debug, Clone)]
pub struct AcceptedShare {
    pub share: Share,
    pub block_hex: Option<String>,
}

impl AcceptedShare {
    pub fn is_block_candidate(&self) -> bool {
        self.block_hex.is_some()
    }
}
