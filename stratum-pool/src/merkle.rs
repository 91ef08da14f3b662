//! Merkle branch construction for jobs with a substitutable coinbase.
//!
//! A Stratum job fixes every transaction except the coinbase, whose hash
//! changes with each extranonce. The tree is therefore reduced once to the
//! list of sibling hashes on the coinbase's path to the root (the merkle
//! branch), and the root is recomputed per share in O(depth).

use crate::codec::sha256d;

/// Merkle branch for the leftmost leaf of a transaction tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    steps: Vec<[u8; 32]>,
}

impl MerkleTree {
    /// Build the branch from the non-coinbase transaction hashes.
    ///
    /// `hashes` are in internal byte order and exclude the coinbase, which
    /// occupies the implicit first slot of every level.
    pub fn new(hashes: Vec<[u8; 32]>) -> Self {
        let mut steps = Vec::new();
        let mut level = hashes;

        while !level.is_empty() {
            // The sibling of the coinbase path at this level
            steps.push(level[0]);

            let mut rest = level.split_off(1);
            if let Some(&last) = rest.last() {
                if rest.len() % 2 == 1 {
                    rest.push(last);
                }
            }

            level = rest
                .chunks_exact(2)
                .map(|pair| merkle_join(&pair[0], &pair[1]))
                .collect();
        }

        Self { steps }
    }

    /// Sibling hashes from the leaf level upward.
    pub fn steps(&self) -> &[[u8; 32]] {
        &self.steps
    }

    /// Steps as hex strings, as sent in `mining.notify`.
    pub fn steps_hex(&self) -> Vec<String> {
        self.steps.iter().map(hex::encode).collect()
    }

    /// Merkle root for the given coinbase hash.
    pub fn with_first(&self, first: &[u8; 32]) -> [u8; 32] {
        self.steps
            .iter()
            .fold(*first, |acc, step| merkle_join(&acc, step))
    }
}

fn merkle_join(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}
