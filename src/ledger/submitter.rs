//! Coalesces transfer submissions from many callers into shared batches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::LedgerClient;
use super::types::{CreateTransferResult, Transfer};
use super::LedgerError;
use crate::ratelimit::context::CallContext;

/// Failed transfers of one work item, keyed by index within that item.
pub type TransferErrors = BTreeMap<usize, CreateTransferResult>;

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Upper bound on transfers per ledger call.
    pub max_events: usize,
    pub flush_every: Duration,
    pub queue_depth: usize,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_events: 8000,
            flush_every: Duration::from_micros(200),
            queue_depth: 4096,
        }
    }
}

struct WorkItem {
    transfers: Vec<Transfer>,
    done: oneshot::Sender<Result<TransferErrors, LedgerError>>,
}

/// Cloneable sending side of a running [`Submitter`].
#[derive(Clone)]
pub struct SubmitterHandle {
    tx: mpsc::Sender<WorkItem>,
}

impl SubmitterHandle {
    /// Submit `transfers` as one unit and wait for its share of the batch
    /// result. Passing the deadline stops the wait, not the submission.
    pub async fn submit(&self, ctx: &CallContext, transfers: Vec<Transfer>) -> Result<TransferErrors, LedgerError> {
        if transfers.is_empty() {
            return Ok(TransferErrors::new());
        }
        let (done, rx) = oneshot::channel();
        let work = async {
            self.tx
                .send(WorkItem { transfers, done })
                .await
                .map_err(|_| LedgerError::Closed)?;
            rx.await.map_err(|_| LedgerError::Closed)?
        };
        match ctx.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, work)
                .await
                .map_err(|_| LedgerError::Timeout)?,
            None => work.await,
        }
    }
}

/// Background task owning the batch under construction.
pub struct Submitter {
    handle: SubmitterHandle,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Submitter {
    pub fn spawn(client: Arc<dyn LedgerClient>, config: SubmitterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(client, config, rx, shutdown_rx));
        Self {
            handle: SubmitterHandle { tx },
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn handle(&self) -> SubmitterHandle {
        self.handle.clone()
    }

    /// Flush queued work and stop the task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Ledger submitter task failed");
            }
        }
    }
}

struct Pending {
    items: Vec<WorkItem>,
    events: usize,
}

impl Pending {
    fn take(&mut self) -> Vec<WorkItem> {
        self.events = 0;
        std::mem::take(&mut self.items)
    }
}

async fn run(
    client: Arc<dyn LedgerClient>,
    config: SubmitterConfig,
    mut rx: mpsc::Receiver<WorkItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_events = config.max_events.max(1);
    let period = config.flush_every.max(Duration::from_micros(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending = Pending {
        items: Vec::new(),
        events: 0,
    };

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            item = rx.recv() => {
                let Some(item) = item else { break };
                accept(&*client, max_events, &mut pending, item).await;
            }
            _ = ticker.tick() => {
                flush(&*client, pending.take()).await;
            }
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        accept(&*client, max_events, &mut pending, item).await;
    }
    flush(&*client, pending.take()).await;
    info!("Ledger submitter stopped");
}

async fn accept(client: &dyn LedgerClient, max_events: usize, pending: &mut Pending, item: WorkItem) {
    let len = item.transfers.len();
    if len > max_events {
        let _ = item.done.send(Err(LedgerError::BatchTooLarge { len, max: max_events }));
        return;
    }
    if pending.events > 0 && pending.events + len > max_events {
        flush(client, pending.take()).await;
    }
    pending.events += len;
    pending.items.push(item);
    if pending.events >= max_events {
        flush(client, pending.take()).await;
    }
}

async fn flush(client: &dyn LedgerClient, items: Vec<WorkItem>) {
    if items.is_empty() {
        return;
    }
    let mut spans = Vec::with_capacity(items.len());
    let mut transfers = Vec::new();
    for item in items {
        let start = transfers.len();
        let len = item.transfers.len();
        transfers.extend(item.transfers);
        spans.push((start, len, item.done));
    }
    let total = transfers.len();

    match client.create_transfers(transfers).await {
        Ok(results) => {
            let failed: BTreeMap<usize, CreateTransferResult> =
                results.into_iter().map(|r| (r.index, r.result)).collect();
            debug!(items = spans.len(), transfers = total, failed = failed.len(), "Flushed transfer batch");
            for (start, len, done) in spans {
                let errors = failed
                    .range(start..start + len)
                    .map(|(index, result)| (index - start, *result))
                    .collect();
                // The caller may have stopped waiting.
                let _ = done.send(Ok(errors));
            }
        }
        Err(e) => {
            warn!(items = spans.len(), transfers = total, error = %e, "Transfer batch failed");
            for (_, _, done) in spans {
                let _ = done.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{Account, AccountEventResult, TransferEventResult};
    use async_trait::async_trait;

    /// Fails every transfer whose amount is 99.
    #[derive(Default)]
    struct RecordingLedger {
        batches: Mutex<Vec<usize>>,
        fail_all: bool,
    }

    #[async_trait]
    impl LedgerClient for RecordingLedger {
        async fn create_accounts(&self, _accounts: Vec<Account>) -> Result<Vec<AccountEventResult>, LedgerError> {
            Ok(Vec::new())
        }

        async fn create_transfers(&self, transfers: Vec<Transfer>) -> Result<Vec<TransferEventResult>, LedgerError> {
            self.batches.lock().push(transfers.len());
            if self.fail_all {
                return Err(LedgerError::Unavailable("down".into()));
            }
            Ok(transfers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.amount == 99)
                .map(|(index, _)| TransferEventResult {
                    index,
                    result: CreateTransferResult::ExceedsCredits,
                })
                .collect())
        }

        async fn lookup_accounts(&self, _ids: Vec<u128>) -> Result<Vec<Account>, LedgerError> {
            Ok(Vec::new())
        }

        async fn lookup_transfers(&self, _ids: Vec<u128>) -> Result<Vec<Transfer>, LedgerError> {
            Ok(Vec::new())
        }
    }

    fn transfer(id: u128, amount: u64) -> Transfer {
        Transfer::new(id, 1, 2, amount, 1, 1)
    }

    fn config(max_events: usize) -> SubmitterConfig {
        SubmitterConfig {
            max_events,
            flush_every: Duration::from_secs(3600),
            queue_depth: 16,
        }
    }

    #[tokio::test]
    async fn test_full_batch_flushes_with_relative_indices() {
        let ledger = Arc::new(RecordingLedger::default());
        let submitter = Submitter::spawn(ledger.clone(), config(3));
        let handle = submitter.handle();
        let ctx = CallContext::background();

        let (first, second) = tokio::join!(
            handle.submit(&ctx, vec![transfer(1, 99)]),
            handle.submit(&ctx, vec![transfer(2, 1), transfer(3, 99)]),
        );

        assert_eq!(first.unwrap(), TransferErrors::from([(0, CreateTransferResult::ExceedsCredits)]));
        assert_eq!(second.unwrap(), TransferErrors::from([(1, CreateTransferResult::ExceedsCredits)]));
        assert_eq!(*ledger.batches.lock(), vec![3]);
        submitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_item_fails_immediately() {
        let ledger = Arc::new(RecordingLedger::default());
        let submitter = Submitter::spawn(ledger.clone(), config(2));
        let result = submitter
            .handle()
            .submit(&CallContext::background(), vec![transfer(1, 1), transfer(2, 1), transfer(3, 1)])
            .await;

        assert_eq!(result, Err(LedgerError::BatchTooLarge { len: 3, max: 2 }));
        assert!(ledger.batches.lock().is_empty());
        submitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_interval_flush() {
        let ledger = Arc::new(RecordingLedger::default());
        let submitter = Submitter::spawn(
            ledger.clone(),
            SubmitterConfig {
                max_events: 100,
                flush_every: Duration::from_millis(5),
                queue_depth: 16,
            },
        );
        let errors = submitter
            .handle()
            .submit(&CallContext::background(), vec![transfer(1, 1)])
            .await
            .unwrap();
        assert!(errors.is_empty());
        submitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_error_reaches_every_item() {
        let ledger = Arc::new(RecordingLedger {
            fail_all: true,
            ..Default::default()
        });
        let submitter = Submitter::spawn(ledger, config(2));
        let handle = submitter.handle();
        let ctx = CallContext::background();

        let (first, second) = tokio::join!(
            handle.submit(&ctx, vec![transfer(1, 1)]),
            handle.submit(&ctx, vec![transfer(2, 1)]),
        );
        assert!(matches!(first, Err(LedgerError::Unavailable(_))));
        assert!(matches!(second, Err(LedgerError::Unavailable(_))));
        submitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_deadline_stops_waiting() {
        let ledger = Arc::new(RecordingLedger::default());
        let submitter = Submitter::spawn(ledger.clone(), config(100));
        let ctx = CallContext::with_timeout(Duration::from_millis(10));

        let result = submitter.handle().submit(&ctx, vec![transfer(1, 1)]).await;
        assert_eq!(result, Err(LedgerError::Timeout));

        // The queued item is still delivered on shutdown.
        submitter.shutdown().await;
        assert_eq!(*ledger.batches.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_closed_submitter_rejects() {
        let ledger = Arc::new(RecordingLedger::default());
        let submitter = Submitter::spawn(ledger, config(10));
        let handle = submitter.handle();
        submitter.shutdown().await;

        let result = handle.submit(&CallContext::background(), vec![transfer(1, 1)]).await;
        assert_eq!(result, Err(LedgerError::Closed));
    }
}
