//! Fair dispatch of LLM calls across per-resource queues.
//!
//! A coordinator task owns every queue and hands ready jobs to a fixed pool
//! of workers. Each worker runs Reserve, then the job's callback, then
//! Complete. A denied job goes back to its own queue as blocked and never
//! delays jobs queued for other resources.

mod state;
mod worker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use self::state::SchedulerState;
use self::worker::{Requeue, Worker};
use super::backend::Limiter;
use super::context::CallContext;
use super::requirements::{build_llm_actuals, build_llm_requirements, LlmReserveInput};
use super::types::{Actual, ReserveRequest, ReserveResponse};
use crate::error::{AdmissionError, Result};

pub const DEFAULT_ERROR_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(5);
pub const DEFAULT_JITTER_MAX: Duration = Duration::from_millis(25);
/// Longest a denied job waits before its next Reserve, whatever the hint.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Callback performing the admitted work; resolves to the actual tokens used.
pub type ExecuteFn = Box<dyn FnOnce(CallContext) -> BoxFuture<'static, anyhow::Result<u64>> + Send>;

/// One LLM call attempt managed by the [`Scheduler`].
pub struct Job {
    pub job_id: String,
    /// Assigned by the scheduler when empty; replaced after every denial.
    pub lease_id: String,
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub max_output_tokens: u64,
    pub want_daily_budget: bool,
    pub execute: Option<ExecuteFn>,
}

impl Job {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            job_id: String::new(),
            lease_id: String::new(),
            tenant_id: String::new(),
            provider: provider.into(),
            model: model.into(),
            prompt: String::new(),
            max_output_tokens: 0,
            want_daily_budget: false,
            execute: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>, want_daily_budget: bool) -> Self {
        self.tenant_id = tenant_id.into();
        self.want_daily_budget = want_daily_budget;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>, max_output_tokens: u64) -> Self {
        self.prompt = prompt.into();
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_execute<F>(mut self, execute: F) -> Self
    where
        F: FnOnce(CallContext) -> BoxFuture<'static, anyhow::Result<u64>> + Send + 'static,
    {
        self.execute = Some(Box::new(execute));
        self
    }

    pub(crate) fn queue_key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }

    pub fn reserve_request(&self) -> ReserveRequest {
        let requirements = build_llm_requirements(&LlmReserveInput {
            tenant_id: &self.tenant_id,
            provider: &self.provider,
            model: &self.model,
            prompt: &self.prompt,
            max_output_tokens: self.max_output_tokens,
            want_daily_budget: self.want_daily_budget,
        });
        ReserveRequest {
            lease_id: self.lease_id.clone(),
            job_id: self.job_id.clone(),
            requirements,
        }
    }

    pub fn actuals(&self, actual_tokens: u64) -> Vec<Actual> {
        build_llm_actuals(
            &self.tenant_id,
            &self.provider,
            &self.model,
            self.want_daily_budget,
            actual_tokens,
        )
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id)
            .field("lease_id", &self.lease_id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Receives per-attempt scheduler events.
pub trait SchedulerObserver: Send + Sync {
    fn on_reserve_start(&self, _job: &Job) {}

    fn on_reserve_denied(&self, _job: &Job, _resp: &ReserveResponse) {}

    fn on_reserve_error(&self, _job: &Job, _err: &AdmissionError) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    #[serde(with = "millis")]
    pub error_retry_delay: Duration,
    #[serde(with = "millis")]
    pub idle_interval: Duration,
    #[serde(with = "millis")]
    pub jitter_max: Duration,
    /// Deadline for each Reserve and Complete; zero means none.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            error_retry_delay: DEFAULT_ERROR_RETRY_DELAY,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            jitter_max: DEFAULT_JITTER_MAX,
            call_timeout: Duration::ZERO,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub(crate) type LeaseIdFn = Arc<dyn Fn() -> String + Send + Sync>;
pub(crate) type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Uniform jitter in `[0, bound]`, where `bound` is the delay itself when
/// it is shorter than `max`.
pub fn bounded_jitter(max: Duration) -> impl Fn(Duration) -> Duration + Send + Sync {
    move |delay: Duration| {
        let bound = if !delay.is_zero() && delay < max { delay } else { max };
        let nanos = bound.as_nanos() as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }
}

pub(crate) struct Hooks {
    pub(crate) lease_id: LeaseIdFn,
    pub(crate) jitter: JitterFn,
}

impl Hooks {
    fn production(config: &SchedulerConfig) -> Self {
        Self {
            lease_id: Arc::new(|| uuid::Uuid::new_v4().to_string()),
            jitter: Arc::new(bounded_jitter(config.jitter_max)),
        }
    }
}

/// Coordinates Reserve/Execute/Complete cycles across per-resource queues.
pub struct Scheduler {
    submit: Mutex<Option<mpsc::Sender<Job>>>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(limiter: Arc<dyn Limiter>, config: SchedulerConfig) -> Self {
        let hooks = Hooks::production(&config);
        Self::build(limiter, config, None, hooks)
    }

    pub fn with_observer(
        limiter: Arc<dyn Limiter>,
        config: SchedulerConfig,
        observer: Arc<dyn SchedulerObserver>,
    ) -> Self {
        let hooks = Hooks::production(&config);
        Self::build(limiter, config, Some(observer), hooks)
    }

    pub(crate) fn build(
        limiter: Arc<dyn Limiter>,
        mut config: SchedulerConfig,
        observer: Option<Arc<dyn SchedulerObserver>>,
        hooks: Hooks,
    ) -> Self {
        config.workers = config.workers.max(1);
        if config.error_retry_delay.is_zero() {
            config.error_retry_delay = DEFAULT_ERROR_RETRY_DELAY;
        }
        if config.idle_interval.is_zero() {
            config.idle_interval = DEFAULT_IDLE_INTERVAL;
        }

        let (submit_tx, submit_rx) = mpsc::channel(config.workers * 4);
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::channel(config.workers);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let mut tasks = Vec::with_capacity(config.workers + 1);
        tasks.push(tokio::spawn(coordinate(
            submit_rx,
            requeue_rx,
            work_tx,
            shutdown_rx,
            config.idle_interval,
        )));

        let worker = Arc::new(Worker {
            limiter,
            observer,
            lease_id: hooks.lease_id,
            jitter: hooks.jitter,
            error_retry_delay: config.error_retry_delay,
            call_timeout: (!config.call_timeout.is_zero()).then_some(config.call_timeout),
            requeue: requeue_tx,
        });
        for id in 0..config.workers {
            let worker = worker.clone();
            let work_rx = work_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let job = work_rx.lock().await.recv().await;
                    match job {
                        Some(job) => worker.handle(job).await,
                        None => break,
                    }
                }
                debug!(worker = id, "Scheduler worker stopped");
            }));
        }
        info!(workers = config.workers, "Scheduler started");

        Self {
            submit: Mutex::new(Some(submit_tx)),
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
        }
    }

    /// Queue a job. Fails with `SchedulerClosed` after shutdown.
    pub async fn submit(&self, job: Job) -> Result<()> {
        let tx = self.submit.lock().clone().ok_or(AdmissionError::SchedulerClosed)?;
        tx.send(job).await.map_err(|_| AdmissionError::SchedulerClosed)
    }

    /// Stop intake, let dispatched jobs finish, then release the workers.
    /// Jobs still waiting in a queue are dropped.
    pub async fn shutdown(&self) {
        self.submit.lock().take();
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        info!("Scheduler stopped");
    }
}

async fn coordinate(
    mut submit_rx: mpsc::Receiver<Job>,
    mut requeue_rx: mpsc::UnboundedReceiver<Requeue>,
    work_tx: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
    idle_interval: Duration,
) {
    let mut state = SchedulerState::new();
    let mut intake_open = true;

    loop {
        let now = Instant::now();
        state.promote_ready(now);
        while let Ok(permit) = work_tx.try_reserve() {
            match state.next_ready() {
                Some(job) => permit.send(job),
                None => break,
            }
        }
        let wake = state
            .next_blocked_time()
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(idle_interval);

        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            job = submit_rx.recv(), if intake_open => match job {
                Some(job) => state.enqueue_ready(job),
                None => intake_open = false,
            },
            Some(msg) = requeue_rx.recv() => state.enqueue_blocked(msg.job, msg.not_before),
            _ = tokio::time::sleep(wake) => {}
        }
    }

    let dropped = state.len();
    if dropped > 0 {
        debug!(dropped, "Scheduler dropping queued jobs on shutdown");
    }
}
