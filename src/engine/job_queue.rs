//! Engine job queue
//!
//! FIFO queue of pending jobs (promise reactions, thenable adoptions and
//! embedder jobs). The queue itself never runs anything; see
//! [`Context::run_jobs`](super::Context::run_jobs).

use super::context::Context;
use super::value::JsResult;
use serde::Serialize;
use std::collections::VecDeque;

/// A unit of deferred engine work
pub type Job = Box<dyn FnOnce(&Context) -> JsResult<()>>;

pub(crate) struct QueuedJob {
    pub label: &'static str,
    pub run: Job,
}

/// Job queue statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobQueueStats {
    /// Jobs ever enqueued
    pub enqueued: u64,
    /// Jobs that ran to completion
    pub completed: u64,
    /// Jobs that ended with an exception
    pub failed: u64,
    /// Deepest the queue has been
    pub max_depth: usize,
    /// Number of drains that ran at least one job
    pub drains: u64,
}

#[derive(Default)]
pub(crate) struct JobQueue {
    jobs: VecDeque<QueuedJob>,
    stats: JobQueueStats,
}

impl JobQueue {
    pub fn push(&mut self, label: &'static str, run: Job) {
        self.jobs.push_back(QueuedJob { label, run });
        self.stats.enqueued += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.jobs.len());
    }

    pub fn pop(&mut self) -> Option<QueuedJob> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn record(&mut self, ok: bool) {
        if ok {
            self.stats.completed += 1;
        } else {
            self.stats.failed += 1;
        }
    }

    pub fn record_drain(&mut self) {
        self.stats.drains += 1;
    }

    pub fn stats(&self) -> JobQueueStats {
        self.stats.clone()
    }
}
