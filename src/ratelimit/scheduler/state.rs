//! Per-resource queues owned by the scheduler's coordinator task.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;

use super::Job;

struct Blocked {
    job: Job,
    not_before: Instant,
}

#[derive(Default)]
struct WorkQueue {
    ready: VecDeque<Job>,
    /// Sorted by `not_before`, earliest first.
    blocked: VecDeque<Blocked>,
}

impl WorkQueue {
    fn push_blocked(&mut self, job: Job, not_before: Instant) {
        let idx = self.blocked.partition_point(|b| b.not_before < not_before);
        self.blocked.insert(idx, Blocked { job, not_before });
    }

    fn promote(&mut self, now: Instant) {
        while self.blocked.front().is_some_and(|b| b.not_before <= now) {
            if let Some(b) = self.blocked.pop_front() {
                self.ready.push_back(b.job);
            }
        }
    }
}

/// Ready and blocked jobs grouped by `provider:model`, served round-robin.
#[derive(Default)]
pub(super) struct SchedulerState {
    queues: HashMap<String, WorkQueue>,
    order: Vec<String>,
    cursor: usize,
}

impl SchedulerState {
    pub(super) fn new() -> Self {
        Self::default()
    }

    fn queue(&mut self, key: String) -> &mut WorkQueue {
        if !self.queues.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.queues.entry(key).or_default()
    }

    pub(super) fn enqueue_ready(&mut self, job: Job) {
        self.queue(job.queue_key()).ready.push_back(job);
    }

    pub(super) fn enqueue_blocked(&mut self, job: Job, not_before: Instant) {
        self.queue(job.queue_key()).push_blocked(job, not_before);
    }

    pub(super) fn promote_ready(&mut self, now: Instant) {
        for queue in self.queues.values_mut() {
            queue.promote(now);
        }
    }

    /// Next ready job, starting from the queue after the last one served.
    pub(super) fn next_ready(&mut self) -> Option<Job> {
        let n = self.order.len();
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            let job = self
                .queues
                .get_mut(&self.order[idx])
                .and_then(|q| q.ready.pop_front());
            if let Some(job) = job {
                self.cursor = (idx + 1) % n;
                return Some(job);
            }
        }
        None
    }

    pub(super) fn next_blocked_time(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|q| q.blocked.front().map(|b| b.not_before))
            .min()
    }

    pub(super) fn len(&self) -> usize {
        self.queues.values().map(|q| q.ready.len() + q.blocked.len()).sum()
    }
}
