//! Bounded table of jobs that still accept shares.

use std::collections::{HashMap, VecDeque};

use crate::template::BlockTemplate;

/// Jobs still accepted for share submission, keyed by job id.
///
/// Insertion-ordered with oldest-first eviction once `capacity` is
/// exceeded. The most recently inserted job is the current job.
#[derive(Debug)]
pub struct RecentJobs {
    capacity: usize,
    order: VecDeque<String>,
    jobs: HashMap<String, BlockTemplate>,
}

impl RecentJobs {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            jobs: HashMap::new(),
        }
    }

    pub fn insert(&mut self, job: BlockTemplate) {
        let id = job.job_id.clone();
        if self.jobs.insert(id.clone(), job).is_some() {
            // Recycled id: the old entry is replaced, move it to the back
            self.order.retain(|existing| existing != &id);
        }
        self.order.push_back(id);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&BlockTemplate> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut BlockTemplate> {
        self.jobs.get_mut(job_id)
    }

    /// The most recently inserted job.
    pub fn current(&self) -> Option<&BlockTemplate> {
        self.order.back().and_then(|id| self.jobs.get(id))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
