//! In-process ledger with linked chains, pending timeouts and a journal.

use std::cmp::{max, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::client::LedgerClient;
use super::journal::{Journal, JournalEntry};
use super::types::{
    Account, AccountEventResult, AccountFlags, CreateAccountResult, CreateTransferResult, Transfer,
    TransferEventResult,
};
use super::LedgerError;
use crate::ratelimit::clock::{Clock, SystemClock};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStatus {
    Pending,
    Posted,
    Voided,
    Expired,
}

#[derive(Debug, Default)]
struct Book {
    accounts: HashMap<u128, Account>,
    transfers: HashMap<u128, Transfer>,
    pending: HashMap<u128, PendingStatus>,
    expiries: BinaryHeap<Reverse<(u64, u128)>>,
    failed: HashSet<u128>,
    last_timestamp: u64,
}

/// Changes made by one chain, applied to the book only if every event succeeds.
#[derive(Debug, Default)]
struct Overlay {
    accounts: HashMap<u128, Account>,
    transfers: Vec<Transfer>,
    transfer_index: HashMap<u128, usize>,
    pending: HashMap<u128, PendingStatus>,
}

/// What one batch changed in the book, so a failed journal write can take
/// it back.
#[derive(Debug, Default)]
struct Undo {
    accounts: HashMap<u128, Option<Account>>,
    transfers: Vec<u128>,
    pending: HashMap<u128, Option<PendingStatus>>,
    failed: Vec<u128>,
    last_timestamp: Option<u64>,
}

struct Staged<'a> {
    book: &'a Book,
    overlay: Overlay,
}

impl<'a> Staged<'a> {
    fn new(book: &'a Book) -> Self {
        Self {
            book,
            overlay: Overlay::default(),
        }
    }

    fn account(&self, id: u128) -> Option<&Account> {
        self.overlay.accounts.get(&id).or_else(|| self.book.accounts.get(&id))
    }

    fn transfer(&self, id: u128) -> Option<&Transfer> {
        self.overlay
            .transfer_index
            .get(&id)
            .map(|i| &self.overlay.transfers[*i])
            .or_else(|| self.book.transfers.get(&id))
    }

    fn status(&self, id: u128) -> Option<PendingStatus> {
        self.overlay
            .pending
            .get(&id)
            .or_else(|| self.book.pending.get(&id))
            .copied()
    }

    fn put_transfer(&mut self, transfer: Transfer) {
        self.overlay
            .transfer_index
            .insert(transfer.id, self.overlay.transfers.len());
        self.overlay.transfers.push(transfer);
    }

    fn apply(&mut self, t: &Transfer, timestamp: u64) -> Result<(), CreateTransferResult> {
        use CreateTransferResult::*;

        if t.id == 0 {
            return Err(IdMustNotBeZero);
        }
        if t.id == u128::MAX {
            return Err(IdMustNotBeIntMax);
        }
        if self.book.failed.contains(&t.id) {
            return Err(IdAlreadyFailed);
        }
        if let Some(existing) = self.transfer(t.id) {
            return Err(if existing.same_fields(t) {
                Exists
            } else {
                ExistsWithDifferentFields
            });
        }
        let kinds = [t.flags.pending(), t.flags.post(), t.flags.void()];
        if kinds.iter().filter(|set| **set).count() > 1 {
            return Err(FlagsAreMutuallyExclusive);
        }

        if t.flags.post() || t.flags.void() {
            self.apply_resolve(t, timestamp)
        } else {
            self.apply_new(t, timestamp)
        }
    }

    fn apply_new(&mut self, t: &Transfer, timestamp: u64) -> Result<(), CreateTransferResult> {
        use CreateTransferResult::*;

        if t.pending_id != 0 {
            return Err(PendingIdMustBeZero);
        }
        if !t.flags.pending() && t.timeout != 0 {
            return Err(TimeoutReservedForPendingTransfer);
        }
        if t.debit_account_id == t.credit_account_id {
            return Err(AccountsMustBeDifferent);
        }
        if t.ledger == 0 {
            return Err(LedgerMustNotBeZero);
        }
        if t.code == 0 {
            return Err(CodeMustNotBeZero);
        }
        let mut debit = self.account(t.debit_account_id).cloned().ok_or(DebitAccountNotFound)?;
        let mut credit = self.account(t.credit_account_id).cloned().ok_or(CreditAccountNotFound)?;
        if debit.ledger != t.ledger || credit.ledger != t.ledger {
            return Err(TransferMustHaveTheSameLedgerAsAccounts);
        }

        if t.flags.pending() {
            debit.debits_pending = debit.debits_pending.checked_add(t.amount).ok_or(OverflowsDebits)?;
            credit.credits_pending = credit.credits_pending.checked_add(t.amount).ok_or(OverflowsCredits)?;
        } else {
            debit.debits_posted = debit.debits_posted.checked_add(t.amount).ok_or(OverflowsDebits)?;
            credit.credits_posted = credit.credits_posted.checked_add(t.amount).ok_or(OverflowsCredits)?;
        }
        let debits_total = debit
            .debits_pending
            .checked_add(debit.debits_posted)
            .ok_or(OverflowsDebits)?;
        let credits_total = credit
            .credits_pending
            .checked_add(credit.credits_posted)
            .ok_or(OverflowsCredits)?;
        if debit.flags.contains(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS) && debits_total > debit.credits_posted {
            return Err(ExceedsCredits);
        }
        if credit.flags.contains(AccountFlags::CREDITS_MUST_NOT_EXCEED_DEBITS) && credits_total > credit.debits_posted
        {
            return Err(ExceedsDebits);
        }

        self.overlay.accounts.insert(debit.id, debit);
        self.overlay.accounts.insert(credit.id, credit);
        if t.flags.pending() {
            self.overlay.pending.insert(t.id, PendingStatus::Pending);
        }
        self.put_transfer(Transfer {
            timestamp,
            ..t.clone()
        });
        Ok(())
    }

    /// Post or void a pending transfer.
    fn apply_resolve(&mut self, t: &Transfer, timestamp: u64) -> Result<(), CreateTransferResult> {
        use CreateTransferResult::*;

        if t.pending_id == 0 {
            return Err(PendingIdMustNotBeZero);
        }
        if t.pending_id == t.id {
            return Err(PendingIdMustBeDifferent);
        }
        if t.timeout != 0 {
            return Err(TimeoutReservedForPendingTransfer);
        }
        let pending = self.transfer(t.pending_id).cloned().ok_or(PendingTransferNotFound)?;
        if !pending.flags.pending() {
            return Err(PendingTransferNotPending);
        }
        if t.debit_account_id != 0 && t.debit_account_id != pending.debit_account_id {
            return Err(PendingTransferHasDifferentDebitAccountId);
        }
        if t.credit_account_id != 0 && t.credit_account_id != pending.credit_account_id {
            return Err(PendingTransferHasDifferentCreditAccountId);
        }
        if t.ledger != 0 && t.ledger != pending.ledger {
            return Err(TransferMustHaveTheSameLedgerAsAccounts);
        }
        if t.flags.void() && t.amount != 0 && t.amount != pending.amount {
            return Err(PendingTransferHasDifferentAmount);
        }
        if t.flags.post() && t.amount > pending.amount {
            return Err(ExceedsPendingTransferAmount);
        }
        match self.status(t.pending_id) {
            Some(PendingStatus::Pending) => {}
            Some(PendingStatus::Posted) => return Err(PendingTransferAlreadyPosted),
            Some(PendingStatus::Voided) => return Err(PendingTransferAlreadyVoided),
            Some(PendingStatus::Expired) => return Err(PendingTransferExpired),
            None => return Err(PendingTransferNotPending),
        }

        let mut debit = self
            .account(pending.debit_account_id)
            .cloned()
            .ok_or(DebitAccountNotFound)?;
        let mut credit = self
            .account(pending.credit_account_id)
            .cloned()
            .ok_or(CreditAccountNotFound)?;
        debit.debits_pending = debit.debits_pending.saturating_sub(pending.amount);
        credit.credits_pending = credit.credits_pending.saturating_sub(pending.amount);
        let status = if t.flags.post() {
            let amount = if t.amount == 0 { pending.amount } else { t.amount };
            debit.debits_posted = debit.debits_posted.checked_add(amount).ok_or(OverflowsDebits)?;
            credit.credits_posted = credit.credits_posted.checked_add(amount).ok_or(OverflowsCredits)?;
            PendingStatus::Posted
        } else {
            PendingStatus::Voided
        };

        self.overlay.accounts.insert(debit.id, debit);
        self.overlay.accounts.insert(credit.id, credit);
        self.overlay.pending.insert(t.pending_id, status);
        self.put_transfer(Transfer {
            timestamp,
            ..t.clone()
        });
        Ok(())
    }

    fn into_overlay(self) -> Overlay {
        self.overlay
    }
}

impl Book {
    fn commit(&mut self, overlay: Overlay, undo: &mut Undo) -> Vec<Transfer> {
        undo.last_timestamp.get_or_insert(self.last_timestamp);
        for (id, account) in overlay.accounts {
            let prior = self.accounts.insert(id, account);
            undo.accounts.entry(id).or_insert(prior);
        }
        for (id, status) in overlay.pending {
            let prior = self.pending.insert(id, status);
            undo.pending.entry(id).or_insert(prior);
        }
        for transfer in &overlay.transfers {
            if transfer.flags.pending() && transfer.timeout > 0 {
                let expires_at = transfer
                    .timestamp
                    .saturating_add(u64::from(transfer.timeout) * NANOS_PER_SECOND);
                self.expiries.push(Reverse((expires_at, transfer.id)));
            }
            self.last_timestamp = max(self.last_timestamp, transfer.timestamp);
            self.transfers.insert(transfer.id, transfer.clone());
            undo.transfers.push(transfer.id);
        }
        overlay.transfers
    }

    fn mark_failed(&mut self, id: u128, undo: &mut Undo) {
        if self.failed.insert(id) {
            undo.failed.push(id);
        }
    }

    /// Restore the book to where it was before the batch behind `undo`.
    fn rollback(&mut self, undo: Undo) {
        for (id, prior) in undo.accounts {
            match prior {
                Some(account) => self.accounts.insert(id, account),
                None => self.accounts.remove(&id),
            };
        }
        for (id, prior) in undo.pending {
            match prior {
                Some(status) => self.pending.insert(id, status),
                None => self.pending.remove(&id),
            };
        }
        let removed: HashSet<u128> = undo.transfers.into_iter().collect();
        for id in &removed {
            self.transfers.remove(id);
        }
        self.expiries.retain(|Reverse((_, id))| !removed.contains(id));
        for id in undo.failed {
            self.failed.remove(&id);
        }
        if let Some(last) = undo.last_timestamp {
            self.last_timestamp = last;
        }
    }

    /// Release a pending transfer whose timeout elapsed.
    fn expire_one(&mut self, id: u128) -> bool {
        if self.pending.get(&id) != Some(&PendingStatus::Pending) {
            return false;
        }
        let Some(transfer) = self.transfers.get(&id) else {
            return false;
        };
        let (debit_id, credit_id, amount) = (transfer.debit_account_id, transfer.credit_account_id, transfer.amount);
        if let Some(debit) = self.accounts.get_mut(&debit_id) {
            debit.debits_pending = debit.debits_pending.saturating_sub(amount);
        }
        if let Some(credit) = self.accounts.get_mut(&credit_id) {
            credit.credits_pending = credit.credits_pending.saturating_sub(amount);
        }
        self.pending.insert(id, PendingStatus::Expired);
        true
    }

    fn expire_due(&mut self, now: u64) -> Vec<JournalEntry> {
        let mut expired = Vec::new();
        while let Some(Reverse((expires_at, id))) = self.expiries.peek().copied() {
            if expires_at > now {
                break;
            }
            self.expiries.pop();
            if self.expire_one(id) {
                expired.push(JournalEntry::Expired { id });
            }
        }
        expired
    }

    fn create_account(&mut self, account: &Account, timestamp: u64) -> Result<(), CreateAccountResult> {
        use CreateAccountResult::*;

        if account.id == 0 {
            return Err(IdMustNotBeZero);
        }
        if account.id == u128::MAX {
            return Err(IdMustNotBeIntMax);
        }
        if account.flags.contains(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS)
            && account.flags.contains(AccountFlags::CREDITS_MUST_NOT_EXCEED_DEBITS)
        {
            return Err(FlagsAreMutuallyExclusive);
        }
        if account.debits_pending != 0
            || account.debits_posted != 0
            || account.credits_pending != 0
            || account.credits_posted != 0
        {
            return Err(BalancesMustBeZero);
        }
        if account.ledger == 0 {
            return Err(LedgerMustNotBeZero);
        }
        if account.code == 0 {
            return Err(CodeMustNotBeZero);
        }
        if let Some(existing) = self.accounts.get(&account.id) {
            return Err(if existing.flags != account.flags {
                ExistsWithDifferentFlags
            } else if existing.ledger != account.ledger {
                ExistsWithDifferentLedger
            } else if existing.code != account.code {
                ExistsWithDifferentCode
            } else {
                Exists
            });
        }
        self.accounts.insert(
            account.id,
            Account {
                timestamp,
                ..account.clone()
            },
        );
        self.last_timestamp = max(self.last_timestamp, timestamp);
        Ok(())
    }

    fn replay(&mut self, entry: JournalEntry) -> Result<(), LedgerError> {
        match entry {
            JournalEntry::Account { account } => {
                let timestamp = account.timestamp;
                let fresh = Account {
                    debits_pending: 0,
                    debits_posted: 0,
                    credits_pending: 0,
                    credits_posted: 0,
                    ..account
                };
                self.create_account(&fresh, timestamp)
                    .map_err(|code| LedgerError::Journal(format!("replay account {:032x}: {}", fresh.id, code)))
            }
            JournalEntry::Transfer { transfer } => {
                let mut staged = Staged::new(self);
                staged
                    .apply(&transfer, transfer.timestamp)
                    .map_err(|code| LedgerError::Journal(format!("replay transfer {:032x}: {}", transfer.id, code)))?;
                let overlay = staged.into_overlay();
                self.commit(overlay, &mut Undo::default());
                Ok(())
            }
            JournalEntry::Expired { id } => {
                self.expire_one(id);
                Ok(())
            }
            JournalEntry::Failed { id } => {
                self.failed.insert(id);
                Ok(())
            }
        }
    }
}

struct Inner {
    book: Book,
    journal: Option<Journal>,
}

impl Inner {
    fn persist(&mut self, entries: &[JournalEntry]) -> Result<(), LedgerError> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(entries),
            None => Ok(()),
        }
    }
}

/// A single-node ledger. Every batch is applied under one lock, so batches
/// are serialized and chains commit atomically.
pub struct LocalLedger {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl LocalLedger {
    /// A ledger that lives only in memory.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                book: Book::default(),
                journal: None,
            }),
        }
    }

    /// Open a journaled ledger, replaying whatever the journal already holds.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let (journal, entries) = Journal::open(path)?;
        let mut book = Book::default();
        let replayed = entries.len();
        for entry in entries {
            book.replay(entry)?;
        }
        info!(
            path = %journal.path().display(),
            entries = replayed,
            accounts = book.accounts.len(),
            transfers = book.transfers.len(),
            "Ledger journal replayed"
        );
        Ok(Self {
            clock,
            inner: Mutex::new(Inner {
                book,
                journal: Some(journal),
            }),
        })
    }

    fn now_nanos(&self) -> u64 {
        self.clock
            .now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn lookup_transfer(&self, id: u128) -> Option<Transfer> {
        self.inner.lock().book.transfers.get(&id).cloned()
    }

    fn apply_transfers(&self, transfers: &[Transfer]) -> Result<Vec<TransferEventResult>, LedgerError> {
        let now = self.now_nanos();
        let mut inner = self.inner.lock();
        let mut entries = inner.book.expire_due(now);
        let mut next_timestamp = max(now, inner.book.last_timestamp + 1);
        let mut results = Vec::new();
        let mut undo = Undo::default();

        let mut start = 0;
        while start < transfers.len() {
            let mut end = start;
            while end < transfers.len() && transfers[end].flags.linked() {
                end += 1;
            }
            if end == transfers.len() {
                // The last event still carries LINKED.
                let last = transfers.len() - 1;
                for index in start..last {
                    results.push(TransferEventResult {
                        index,
                        result: CreateTransferResult::LinkedEventFailed,
                    });
                }
                results.push(TransferEventResult {
                    index: last,
                    result: CreateTransferResult::LinkedEventChainOpen,
                });
                break;
            }

            let mut staged = Staged::new(&inner.book);
            let mut failure = None;
            for (offset, transfer) in transfers[start..=end].iter().enumerate() {
                let timestamp = next_timestamp;
                next_timestamp += 1;
                if let Err(code) = staged.apply(transfer, timestamp) {
                    failure = Some((start + offset, code));
                    break;
                }
            }
            let overlay = staged.into_overlay();

            match failure {
                None => {
                    let committed = inner.book.commit(overlay, &mut undo);
                    entries.extend(committed.into_iter().map(|transfer| JournalEntry::Transfer { transfer }));
                }
                Some((failed_index, code)) => {
                    for index in start..=end {
                        let result = if index == failed_index {
                            code
                        } else {
                            CreateTransferResult::LinkedEventFailed
                        };
                        results.push(TransferEventResult { index, result });
                    }
                    if code.is_transient() {
                        let id = transfers[failed_index].id;
                        inner.book.mark_failed(id, &mut undo);
                        entries.push(JournalEntry::Failed { id });
                    }
                }
            }
            start = end + 1;
        }

        if let Err(e) = inner.persist(&entries) {
            warn!(error = %e, transfers = transfers.len(), "Journal append failed; batch rolled back");
            inner.book.rollback(undo);
            return Err(e);
        }
        debug!(
            transfers = transfers.len(),
            failed = results.len(),
            "Applied transfer batch"
        );
        Ok(results)
    }
}

impl Default for LocalLedger {
    fn default() -> Self {
        Self::in_memory(Arc::new(SystemClock))
    }
}

#[async_trait]
impl LedgerClient for LocalLedger {
    async fn create_accounts(&self, accounts: Vec<Account>) -> Result<Vec<AccountEventResult>, LedgerError> {
        let now = self.now_nanos();
        let mut inner = self.inner.lock();
        let mut entries = Vec::new();
        let mut results = Vec::new();
        let mut timestamp = max(now, inner.book.last_timestamp + 1);
        for (index, account) in accounts.iter().enumerate() {
            match inner.book.create_account(account, timestamp) {
                Ok(()) => {
                    if let Some(created) = inner.book.accounts.get(&account.id) {
                        entries.push(JournalEntry::Account {
                            account: created.clone(),
                        });
                    }
                    timestamp += 1;
                }
                Err(result) => results.push(AccountEventResult { index, result }),
            }
        }
        inner.persist(&entries)?;
        Ok(results)
    }

    async fn create_transfers(&self, transfers: Vec<Transfer>) -> Result<Vec<TransferEventResult>, LedgerError> {
        self.apply_transfers(&transfers)
    }

    async fn lookup_accounts(&self, ids: Vec<u128>) -> Result<Vec<Account>, LedgerError> {
        let now = self.now_nanos();
        let mut inner = self.inner.lock();
        let expired = inner.book.expire_due(now);
        inner.persist(&expired)?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.book.accounts.get(id).cloned())
            .collect())
    }

    async fn lookup_transfers(&self, ids: Vec<u128>) -> Result<Vec<Transfer>, LedgerError> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.book.transfers.get(id).cloned())
            .collect())
    }
}
