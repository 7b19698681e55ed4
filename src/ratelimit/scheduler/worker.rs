use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Job, JitterFn, LeaseIdFn, SchedulerObserver, MAX_RETRY_DELAY};
use crate::ratelimit::backend::Limiter;
use crate::ratelimit::context::CallContext;
use crate::ratelimit::types::{CompleteRequest, ReserveResponse};

pub(super) struct Requeue {
    pub(super) job: Job,
    pub(super) not_before: Instant,
}

/// Shared by every worker task.
pub(super) struct Worker {
    pub(super) limiter: Arc<dyn Limiter>,
    pub(super) observer: Option<Arc<dyn SchedulerObserver>>,
    pub(super) lease_id: LeaseIdFn,
    pub(super) jitter: JitterFn,
    pub(super) error_retry_delay: Duration,
    pub(super) call_timeout: Option<Duration>,
    pub(super) requeue: mpsc::UnboundedSender<Requeue>,
}

impl Worker {
    /// One Reserve attempt; on allow, execute and Complete.
    pub(super) async fn handle(&self, mut job: Job) {
        if job.lease_id.is_empty() {
            job.lease_id = (self.lease_id)();
        }
        if let Some(observer) = &self.observer {
            observer.on_reserve_start(&job);
        }

        let resp = match self.limiter.reserve(self.call_context(), job.reserve_request()).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(job_id = %job.job_id, lease_id = %job.lease_id, error = %e, "Reserve failed, requeueing");
                if let Some(observer) = &self.observer {
                    observer.on_reserve_error(&job, &e);
                }
                self.requeue(job, self.error_retry_delay);
                return;
            }
        };

        if !resp.allowed {
            if let Some(observer) = &self.observer {
                observer.on_reserve_denied(&job, &resp);
            }
            let delay = self.retry_delay(&resp);
            trace!(job_id = %job.job_id, lease_id = %job.lease_id, delay_ms = delay.as_millis() as u64, "Reserve denied");
            // A denied lease id replays its denial on idempotent engines.
            job.lease_id = (self.lease_id)();
            self.requeue(job, delay);
            return;
        }

        let actuals = match job.execute.take() {
            Some(execute) => match execute(CallContext::background()).await {
                Ok(tokens) => job.actuals(tokens),
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Job execution failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let req = CompleteRequest {
            lease_id: job.lease_id.clone(),
            job_id: job.job_id.clone(),
            actuals,
        };
        match self.limiter.complete(self.call_context(), req).await {
            Ok(resp) if !resp.ok => {
                warn!(lease_id = %job.lease_id, error = %resp.error, "Complete rejected");
            }
            Ok(_) => {}
            Err(e) => warn!(lease_id = %job.lease_id, error = %e, "Complete failed"),
        }
    }

    fn call_context(&self) -> CallContext {
        self.call_timeout.map(CallContext::with_timeout).unwrap_or_default()
    }

    /// The server's hint plus jitter, capped at [`MAX_RETRY_DELAY`].
    pub(super) fn retry_delay(&self, resp: &ReserveResponse) -> Duration {
        let delay = Duration::from_millis(resp.retry_after_ms).min(MAX_RETRY_DELAY);
        delay.saturating_add((self.jitter)(delay)).min(MAX_RETRY_DELAY)
    }

    fn requeue(&self, job: Job, delay: Duration) {
        let now = Instant::now();
        let msg = Requeue {
            job,
            not_before: now.checked_add(delay).unwrap_or(now + MAX_RETRY_DELAY),
        };
        if self.requeue.send(msg).is_err() {
            debug!("Scheduler stopped, dropping retry");
        }
    }
}
