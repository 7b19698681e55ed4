//! Coalesces single Reserve/Complete calls into batch calls.
//!
//! Callers enqueue into a bounded channel; a background task flushes when the
//! pending set reaches `max_batch` or the flush interval elapses. Reserve and
//! Complete items are never mixed in the same downstream call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::context::CallContext;
use super::types::{
    BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest, BatchReserveResponse,
    CompleteRequest, CompleteResponse, ReserveRequest, ReserveResponse,
};
use crate::error::{AdmissionError, Result};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2);

enum Item {
    Reserve {
        ctx: CallContext,
        req: ReserveRequest,
        reply: oneshot::Sender<Result<ReserveResponse>>,
    },
    Complete {
        ctx: CallContext,
        req: CompleteRequest,
        reply: oneshot::Sender<Result<CompleteResponse>>,
    },
}

/// A [`Limiter`] that batches single calls onto an inner limiter's batch API.
pub struct Batcher {
    inner: Arc<dyn Limiter>,
    tx: Mutex<Option<mpsc::Sender<Item>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    /// `max_batch` below one is treated as one; a zero interval uses
    /// [`DEFAULT_FLUSH_INTERVAL`].
    pub fn new(inner: Arc<dyn Limiter>, max_batch: usize, flush_interval: Duration) -> Self {
        let max_batch = max_batch.max(1);
        let flush_interval = if flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            flush_interval
        };
        let (tx, rx) = mpsc::channel(max_batch * 2);
        let task = tokio::spawn(run(inner.clone(), rx, max_batch, flush_interval));
        Self {
            inner,
            tx: Mutex::new(Some(tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Stop accepting work, flush what is pending and wait for the flush task.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        debug!("Batcher stopped");
    }

    fn sender(&self) -> Result<mpsc::Sender<Item>> {
        self.tx.lock().clone().ok_or(AdmissionError::BatcherClosed)
    }

    async fn enqueue<T>(&self, ctx: CallContext, item: Item, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        let tx = self.sender()?;
        ctx.run(async move {
            tx.send(item).await.map_err(|_| AdmissionError::BatcherClosed)?;
            // Holding the sender while waiting would keep shutdown from
            // observing a closed channel.
            drop(tx);
            rx.await.map_err(|_| AdmissionError::BatcherClosed)?
        })
        .await
    }
}

#[async_trait]
impl Limiter for Batcher {
    async fn reserve(&self, ctx: CallContext, req: ReserveRequest) -> Result<ReserveResponse> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ctx, Item::Reserve { ctx, req, reply }, rx).await
    }

    async fn complete(&self, ctx: CallContext, req: CompleteRequest) -> Result<CompleteResponse> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ctx, Item::Complete { ctx, req, reply }, rx).await
    }

    async fn batch_reserve(
        &self,
        ctx: CallContext,
        req: BatchReserveRequest,
    ) -> Result<BatchReserveResponse> {
        self.inner.batch_reserve(ctx, req).await
    }

    async fn batch_complete(
        &self,
        ctx: CallContext,
        req: BatchCompleteRequest,
    ) -> Result<BatchCompleteResponse> {
        self.inner.batch_complete(ctx, req).await
    }
}

async fn run(
    inner: Arc<dyn Limiter>,
    mut rx: mpsc::Receiver<Item>,
    max_batch: usize,
    flush_interval: Duration,
) {
    let mut pending: Vec<Item> = Vec::with_capacity(max_batch);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(item) => {
                        pending.push(item);
                        if pending.len() >= max_batch {
                            flush(&inner, std::mem::take(&mut pending)).await;
                            ticker.reset();
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush(&inner, std::mem::take(&mut pending)).await;
                }
            }
        }
    }

    if !pending.is_empty() {
        flush(&inner, pending).await;
    }
}

async fn flush(inner: &Arc<dyn Limiter>, items: Vec<Item>) {
    let mut reserves = Vec::new();
    let mut completes = Vec::new();
    for item in items {
        match item {
            Item::Reserve { ctx, req, reply } => reserves.push((ctx, req, reply)),
            Item::Complete { ctx, req, reply } => completes.push((ctx, req, reply)),
        }
    }
    if !reserves.is_empty() {
        flush_reserves(inner, reserves).await;
    }
    if !completes.is_empty() {
        flush_completes(inner, completes).await;
    }
}

type Pending<Req, Resp> = Vec<(CallContext, Req, oneshot::Sender<Result<Resp>>)>;

fn batch_context<Req, Resp>(items: &Pending<Req, Resp>) -> CallContext {
    items
        .iter()
        .fold(CallContext::background(), |acc, (ctx, _, _)| acc.earliest(*ctx))
}

async fn flush_reserves(inner: &Arc<dyn Limiter>, items: Pending<ReserveRequest, ReserveResponse>) {
    let ctx = batch_context(&items);
    let (requests, replies): (Vec<_>, Vec<_>) = items.into_iter().map(|(_, req, reply)| (req, reply)).unzip();
    let expected = requests.len();
    trace!(size = expected, "Flushing reserve batch");

    let outcome = inner
        .batch_reserve(ctx, BatchReserveRequest { requests })
        .await
        .and_then(|resp| match resp.results.len() {
            n if n == expected => Ok(resp.results),
            actual => Err(AdmissionError::BatchMismatch { expected, actual }),
        });
    deliver(replies, outcome);
}

async fn flush_completes(inner: &Arc<dyn Limiter>, items: Pending<CompleteRequest, CompleteResponse>) {
    let ctx = batch_context(&items);
    let (requests, replies): (Vec<_>, Vec<_>) = items.into_iter().map(|(_, req, reply)| (req, reply)).unzip();
    let expected = requests.len();
    trace!(size = expected, "Flushing complete batch");

    let outcome = inner
        .batch_complete(ctx, BatchCompleteRequest { requests })
        .await
        .and_then(|resp| match resp.results.len() {
            n if n == expected => Ok(resp.results),
            actual => Err(AdmissionError::BatchMismatch { expected, actual }),
        });
    deliver(replies, outcome);
}

fn deliver<T>(replies: Vec<oneshot::Sender<Result<T>>>, outcome: Result<Vec<T>>) {
    match outcome {
        Ok(results) => {
            for (reply, result) in replies.into_iter().zip(results) {
                let _ = reply.send(Ok(result));
            }
        }
        Err(e) => {
            debug!(error = %e, callers = replies.len(), "Batch call failed");
            for reply in replies {
                let _ = reply.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::types::Requirement;

    #[derive(Default)]
    struct FakeLimiter {
        reserve_calls: Mutex<Vec<BatchReserveRequest>>,
        complete_calls: Mutex<Vec<BatchCompleteRequest>>,
        short_by: usize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Limiter for FakeLimiter {
        async fn reserve(&self, _ctx: CallContext, _req: ReserveRequest) -> Result<ReserveResponse> {
            Err(AdmissionError::Backend("single reserve not used".into()))
        }

        async fn complete(&self, _ctx: CallContext, _req: CompleteRequest) -> Result<CompleteResponse> {
            Err(AdmissionError::Backend("single complete not used".into()))
        }

        async fn batch_reserve(
            &self,
            _ctx: CallContext,
            req: BatchReserveRequest,
        ) -> Result<BatchReserveResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reserve_calls.lock().push(req.clone());
            if self.fail {
                return Err(AdmissionError::Backend("down".into()));
            }
            let n = req.requests.len().saturating_sub(self.short_by);
            Ok(BatchReserveResponse {
                results: (0..n).map(|i| ReserveResponse::allowed(100 + i as i64)).collect(),
            })
        }

        async fn batch_complete(
            &self,
            _ctx: CallContext,
            req: BatchCompleteRequest,
        ) -> Result<BatchCompleteResponse> {
            self.complete_calls.lock().push(req.clone());
            Ok(BatchCompleteResponse {
                results: req.requests.iter().map(|_| CompleteResponse::ok()).collect(),
            })
        }
    }

    fn reserve_req(lease: &str) -> ReserveRequest {
        ReserveRequest::new(lease, vec![Requirement::new("k1", 1)])
    }

    #[tokio::test]
    async fn test_flushes_within_interval() {
        let fake = Arc::new(FakeLimiter::default());
        let batcher = Batcher::new(fake.clone(), 10, Duration::from_millis(20));

        let resp = tokio::time::timeout(
            Duration::from_millis(500),
            batcher.reserve(CallContext::background(), reserve_req("L1")),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(resp.allowed);
        assert_eq!(fake.reserve_calls.lock().len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_batch_preserves_order() {
        let fake = Arc::new(FakeLimiter::default());
        let batcher = Arc::new(Batcher::new(fake.clone(), 3, Duration::from_secs(10)));

        let handles: Vec<_> = ["L1", "L2", "L3"]
            .into_iter()
            .map(|lease| {
                let batcher = batcher.clone();
                tokio::spawn(async move {
                    let resp = batcher.reserve(CallContext::background(), reserve_req(lease)).await.unwrap();
                    (lease.to_string(), resp.reserved_at_unix_ms)
                })
            })
            .collect();

        let mut observed = Vec::new();
        for handle in handles {
            observed.push(handle.await.unwrap());
        }

        let calls = fake.reserve_calls.lock().clone();
        assert_eq!(calls.len(), 1);
        for (lease, reserved_at) in observed {
            let index = calls[0].requests.iter().position(|r| r.lease_id == lease).unwrap();
            assert_eq!(reserved_at, 100 + index as i64);
        }
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_reserve_and_complete_are_not_mixed() {
        let fake = Arc::new(FakeLimiter::default());
        let batcher = Arc::new(Batcher::new(fake.clone(), 2, Duration::from_millis(20)));

        let b1 = batcher.clone();
        let reserve = tokio::spawn(async move { b1.reserve(CallContext::background(), reserve_req("L1")).await });
        let b2 = batcher.clone();
        let complete = tokio::spawn(async move {
            b2.complete(CallContext::background(), CompleteRequest::new("L1", vec![])).await
        });

        assert!(reserve.await.unwrap().unwrap().allowed);
        assert!(complete.await.unwrap().unwrap().ok);
        assert_eq!(fake.reserve_calls.lock().len(), 1);
        assert_eq!(fake.complete_calls.lock().len(), 1);
        assert_eq!(fake.reserve_calls.lock()[0].requests.len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_mismatch_fails_every_caller() {
        let fake = Arc::new(FakeLimiter {
            short_by: 1,
            ..Default::default()
        });
        let batcher = Arc::new(Batcher::new(fake, 2, Duration::from_secs(10)));

        let b1 = batcher.clone();
        let first = tokio::spawn(async move { b1.reserve(CallContext::background(), reserve_req("L1")).await });
        let second = batcher.reserve(CallContext::background(), reserve_req("L2")).await;

        assert!(matches!(
            second,
            Err(AdmissionError::BatchMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(first.await.unwrap(), Err(AdmissionError::BatchMismatch { .. })));
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_fans_out() {
        let fake = Arc::new(FakeLimiter {
            fail: true,
            ..Default::default()
        });
        let batcher = Batcher::new(fake, 4, Duration::from_millis(5));
        let err = batcher.reserve(CallContext::background(), reserve_req("L1")).await;
        assert!(matches!(err, Err(AdmissionError::Backend(_))));
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_caller_deadline() {
        let fake = Arc::new(FakeLimiter {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let batcher = Batcher::new(fake, 1, Duration::from_millis(5));
        let err = batcher
            .reserve(CallContext::with_timeout(Duration::from_millis(20)), reserve_req("L1"))
            .await;
        assert!(matches!(err, Err(AdmissionError::DeadlineExceeded)));
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let fake = Arc::new(FakeLimiter::default());
        let batcher = Arc::new(Batcher::new(fake.clone(), 10, Duration::from_secs(10)));

        let b1 = batcher.clone();
        let pending = tokio::spawn(async move { b1.reserve(CallContext::background(), reserve_req("L1")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        batcher.shutdown().await;
        assert!(pending.await.unwrap().unwrap().allowed);
        assert_eq!(fake.reserve_calls.lock().len(), 1);

        let closed = batcher.reserve(CallContext::background(), reserve_req("L2")).await;
        assert!(matches!(closed, Err(AdmissionError::BatcherClosed)));
    }

    #[tokio::test]
    async fn test_batch_calls_pass_through() {
        let fake = Arc::new(FakeLimiter::default());
        let batcher = Batcher::new(fake.clone(), 10, Duration::from_secs(10));
        let resp = batcher
            .batch_reserve(
                CallContext::background(),
                BatchReserveRequest {
                    requests: vec![reserve_req("L1"), reserve_req("L2")],
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 2);
        assert_eq!(fake.reserve_calls.lock().len(), 1);
        batcher.shutdown().await;
    }
}
