//! Job lifecycle and share validation.
//!
//! The job manager turns block templates into jobs, decides whether a
//! template starts a new block or merely refreshes the current one, hands
//! out extranonce1 values, and validates every submitted share. It does no
//! I/O; the server calls into it under a lock and acts on the results.

mod counters;
mod recent;
mod share;

pub use counters::{ExtranonceCounter, JobCounter, random_instance_id};
pub use recent::RecentJobs;
pub use share::{AcceptedShare, Share, ShareError, ShareRequest};

use std::sync::Arc;

use crate::algorithm::PowAlgorithm;
use crate::codec::{self, reverse_bytes, sha256d};
use crate::template::{
    BlockTemplate, BlockTemplateData, EXTRANONCE_PLACEHOLDER_LEN, GenerationConfig, JobParams,
    TemplateError,
};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, unix_time};
use crate::u256;

/// Jobs kept for late submissions after an update.
pub const MAX_RECENT_JOBS: usize = 100;

/// How far past the submission time a share's ntime may lie, in seconds.
pub const MAX_NTIME_DRIFT: u64 = 7200;

/// Share-to-target ratio below which a share counts as low difficulty.
const LOW_DIFFICULTY_RATIO: f64 = 0.99;

/// Result of offering a template to the job manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateUpdate {
    /// A new block: recent jobs were dropped and miners must restart.
    NewBlock(Arc<JobParams>),

    /// Same previous block as the current job; nothing changed.
    Unchanged,

    /// Different previous block at a lower height; ignored.
    Regressed { height: u64, current_height: u64 },
}

/// Pool-wide settings for the job manager.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub generation: GenerationConfig,
    pub instance_id: u32,
    /// Report the block hash of every accepted non-block share.
    pub emit_invalid_block_hashes: bool,
}

#[derive(Debug)]
pub struct JobManager {
    algorithm: Arc<dyn PowAlgorithm>,
    generation: GenerationConfig,
    emit_invalid_block_hashes: bool,
    extranonce: ExtranonceCounter,
    job_counter: JobCounter,
    jobs: RecentJobs,
}

impl JobManager {
    pub fn new(config: JobManagerConfig, algorithm: Arc<dyn PowAlgorithm>) -> Self {
        Self {
            algorithm,
            generation: config.generation,
            emit_invalid_block_hashes: config.emit_invalid_block_hashes,
            extranonce: ExtranonceCounter::new(config.instance_id),
            job_counter: JobCounter::new(),
            jobs: RecentJobs::new(MAX_RECENT_JOBS),
        }
    }

    /// Extranonce2 size miners must use.
    pub fn extranonce2_size(&self) -> usize {
        EXTRANONCE_PLACEHOLDER_LEN - ExtranonceCounter::SIZE
    }

    /// Allocate an extranonce1 for a new subscription.
    pub fn next_extranonce1(&mut self) -> String {
        self.extranonce.next()
    }

    pub fn current_job(&self) -> Option<&BlockTemplate> {
        self.jobs.current()
    }

    pub fn current_job_params(&self) -> Option<Arc<JobParams>> {
        self.jobs.current().map(BlockTemplate::job_params)
    }

    /// Offer a freshly fetched template.
    ///
    /// Starts a new block when there is no current job, or when the
    /// previous block hash changed without the height going backwards.
    pub fn process_template(
        &mut self,
        data: BlockTemplateData,
    ) -> Result<TemplateUpdate, TemplateError> {
        if let Some(current) = self.jobs.current() {
            if current.data.previous_block_hash == data.previous_block_hash {
                return Ok(TemplateUpdate::Unchanged);
            }
            if data.height < current.data.height {
                return Ok(TemplateUpdate::Regressed {
                    height: data.height,
                    current_height: current.data.height,
                });
            }
        }

        let job = self.build_job(data)?;
        let params = job.job_params();
        debug!(job_id = %job.job_id, height = job.data.height, "New block");

        self.jobs.clear();
        self.jobs.insert(job);
        Ok(TemplateUpdate::NewBlock(params))
    }

    /// Replace the current job with one built from a refreshed template of
    /// the same block. Older jobs stay valid.
    pub fn update_current_job(
        &mut self,
        data: BlockTemplateData,
    ) -> Result<Arc<JobParams>, TemplateError> {
        let job = self.build_job(data)?;
        let params = job.job_params();
        debug!(job_id = %job.job_id, height = job.data.height, "Updated job");

        self.jobs.insert(job);
        Ok(params)
    }

    fn build_job(&mut self, data: BlockTemplateData) -> Result<BlockTemplate, TemplateError> {
        BlockTemplate::new(
            self.job_counter.next(),
            data,
            &self.generation,
            &self.algorithm.diff1(),
            unix_time(),
        )
    }

    pub fn process_share(&mut self, request: &ShareRequest) -> Result<AcceptedShare, ShareError> {
        self.process_share_at(request, unix_time())
    }

    /// Validate a share as of `now` (Unix seconds).
    ///
    /// Every field is checked before the submission is recorded, so a
    /// malformed share never occupies a duplicate-detection slot.
    pub fn process_share_at(
        &mut self,
        request: &ShareRequest,
        now: u64,
    ) -> Result<AcceptedShare, ShareError> {
        if request.extranonce2.len() != self.extranonce2_size() * 2 {
            return Err(ShareError::IncorrectExtranonce2Size);
        }
        let extranonce2 =
            hex::decode(&request.extranonce2).map_err(|_| ShareError::Malformed("extranonce2"))?;

        let job = self
            .jobs
            .get_mut(&request.job_id)
            .ok_or(ShareError::JobNotFound)?;

        if request.ntime.len() != 8 {
            return Err(ShareError::IncorrectNtimeSize);
        }
        let ntime = codec::decode_fixed_hex::<4>(&request.ntime)
            .map(u32::from_be_bytes)
            .map_err(|_| ShareError::Malformed("ntime"))?;
        if ntime < job.data.curtime || u64::from(ntime) > now + MAX_NTIME_DRIFT {
            return Err(ShareError::NtimeOutOfRange);
        }

        if request.nonce.len() != 8 {
            return Err(ShareError::IncorrectNonceSize);
        }
        let nonce = codec::decode_fixed_hex::<4>(&request.nonce)
            .map(u32::from_be_bytes)
            .map_err(|_| ShareError::Malformed("nonce"))?;

        let extranonce1 =
            hex::decode(&request.extranonce1).map_err(|_| ShareError::Malformed("extranonce1"))?;

        if !job.register_submit(
            &request.extranonce1,
            &request.extranonce2,
            &request.ntime,
            &request.nonce,
        ) {
            return Err(ShareError::Duplicate);
        }

        let coinbase = job.serialize_coinbase(&extranonce1, &extranonce2);
        let merkle_root = job.merkle_root(&sha256d(&coinbase));
        let header = job.serialize_header(&merkle_root, ntime, nonce);
        let header_hash = self.algorithm.hash(&header);
        let header_value = u256::from_hash(&header_hash);

        let multiplier = self.algorithm.multiplier();
        let share_diff = self.algorithm.difficulty_of(&header_value) * multiplier;
        let block_diff = job.difficulty * multiplier;

        let mut credited: Difficulty = request.difficulty;
        let mut block_hash = None;
        let mut block_hash_invalid = None;
        let mut block_hex = None;

        if header_value <= job.target {
            block_hex = Some(hex::encode(job.serialize_block(&header, &coinbase)));
            block_hash = Some(hex::encode(reverse_bytes(&sha256d(&header))));
        } else {
            if self.emit_invalid_block_hashes {
                block_hash_invalid = Some(hex::encode(reverse_bytes(&sha256d(&header))));
            }

            if share_diff / request.difficulty.as_f64() < LOW_DIFFICULTY_RATIO {
                match request.previous_difficulty {
                    Some(previous) if share_diff >= previous.as_f64() => {
                        credited = previous;
                    }
                    _ => return Err(ShareError::LowDifficulty(share_diff)),
                }
            }
        }

        Ok(AcceptedShare {
            share: Share {
                job_id: request.job_id.clone(),
                ip: request.ip,
                port: request.port,
                worker: request.worker.clone(),
                height: job.data.height,
                block_reward: job.data.coinbase_value,
                difficulty: credited,
                share_diff: round_to(share_diff, 8),
                block_diff,
                block_diff_actual: job.difficulty,
                block_hash,
                block_hash_invalid,
            },
            block_hex,
        })
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
