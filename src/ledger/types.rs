//! Accounts, transfers and result codes of the double-entry ledger.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use super::ids::hex;

/// Account constraint flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountFlags(u16);

impl AccountFlags {
    pub const NONE: AccountFlags = AccountFlags(0);
    /// Pending plus posted debits may never exceed posted credits.
    pub const DEBITS_MUST_NOT_EXCEED_CREDITS: AccountFlags = AccountFlags(1 << 1);
    /// Pending plus posted credits may never exceed posted debits.
    pub const CREDITS_MUST_NOT_EXCEED_DEBITS: AccountFlags = AccountFlags(1 << 2);

    pub fn contains(self, other: AccountFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccountFlags {
    type Output = AccountFlags;

    fn bitor(self, rhs: Self) -> Self {
        AccountFlags(self.0 | rhs.0)
    }
}

/// Transfer behaviour flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferFlags(u16);

impl TransferFlags {
    pub const NONE: TransferFlags = TransferFlags(0);
    /// Chain this transfer with the next one; the chain commits or fails as a unit.
    pub const LINKED: TransferFlags = TransferFlags(1 << 0);
    /// Hold the amount as pending until posted, voided or timed out.
    pub const PENDING: TransferFlags = TransferFlags(1 << 1);
    pub const POST_PENDING_TRANSFER: TransferFlags = TransferFlags(1 << 2);
    pub const VOID_PENDING_TRANSFER: TransferFlags = TransferFlags(1 << 3);

    pub fn contains(self, other: TransferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn linked(self) -> bool {
        self.contains(Self::LINKED)
    }

    pub fn pending(self) -> bool {
        self.contains(Self::PENDING)
    }

    pub fn post(self) -> bool {
        self.contains(Self::POST_PENDING_TRANSFER)
    }

    pub fn void(self) -> bool {
        self.contains(Self::VOID_PENDING_TRANSFER)
    }
}

impl BitOr for TransferFlags {
    type Output = TransferFlags;

    fn bitor(self, rhs: Self) -> Self {
        TransferFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(with = "hex")]
    pub id: u128,
    pub ledger: u32,
    pub code: u16,
    pub flags: AccountFlags,
    #[serde(default)]
    pub debits_pending: u64,
    #[serde(default)]
    pub debits_posted: u64,
    #[serde(default)]
    pub credits_pending: u64,
    #[serde(default)]
    pub credits_posted: u64,
    #[serde(default)]
    pub timestamp: u64,
}

impl Account {
    pub fn new(id: u128, ledger: u32, code: u16, flags: AccountFlags) -> Self {
        Self {
            id,
            ledger,
            code,
            flags,
            debits_pending: 0,
            debits_posted: 0,
            credits_pending: 0,
            credits_posted: 0,
            timestamp: 0,
        }
    }

    /// Posted credits minus posted debits, floored at zero.
    pub fn balance(&self) -> u64 {
        self.credits_posted.saturating_sub(self.debits_posted)
    }

    /// Balance left after pending debits.
    pub fn available(&self) -> u64 {
        self.balance().saturating_sub(self.debits_pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(with = "hex")]
    pub id: u128,
    #[serde(with = "hex")]
    pub debit_account_id: u128,
    #[serde(with = "hex")]
    pub credit_account_id: u128,
    pub amount: u64,
    #[serde(with = "hex", default)]
    pub pending_id: u128,
    pub ledger: u32,
    pub code: u16,
    pub flags: TransferFlags,
    /// Seconds a pending transfer stays live; zero never expires.
    #[serde(default)]
    pub timeout: u32,
    #[serde(default)]
    pub timestamp: u64,
}

impl Transfer {
    /// A transfer on `ledger`/`code` with no flags set.
    pub fn new(id: u128, debit_account_id: u128, credit_account_id: u128, amount: u64, ledger: u32, code: u16) -> Self {
        Self {
            id,
            debit_account_id,
            credit_account_id,
            amount,
            pending_id: 0,
            ledger,
            code,
            flags: TransferFlags::NONE,
            timeout: 0,
            timestamp: 0,
        }
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout(mut self, timeout: u32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pending_id(mut self, pending_id: u128) -> Self {
        self.pending_id = pending_id;
        self
    }

    /// Field equality ignoring the ledger-assigned timestamp.
    pub fn same_fields(&self, other: &Transfer) -> bool {
        self.id == other.id
            && self.debit_account_id == other.debit_account_id
            && self.credit_account_id == other.credit_account_id
            && self.amount == other.amount
            && self.pending_id == other.pending_id
            && self.ledger == other.ledger
            && self.code == other.code
            && self.flags == other.flags
            && self.timeout == other.timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateAccountResult {
    LinkedEventFailed,
    IdMustNotBeZero,
    IdMustNotBeIntMax,
    FlagsAreMutuallyExclusive,
    LedgerMustNotBeZero,
    CodeMustNotBeZero,
    BalancesMustBeZero,
    ExistsWithDifferentFlags,
    ExistsWithDifferentLedger,
    ExistsWithDifferentCode,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateTransferResult {
    LinkedEventFailed,
    LinkedEventChainOpen,
    IdMustNotBeZero,
    IdMustNotBeIntMax,
    IdAlreadyFailed,
    FlagsAreMutuallyExclusive,
    AccountsMustBeDifferent,
    LedgerMustNotBeZero,
    CodeMustNotBeZero,
    PendingIdMustBeZero,
    PendingIdMustNotBeZero,
    PendingIdMustBeDifferent,
    TimeoutReservedForPendingTransfer,
    DebitAccountNotFound,
    CreditAccountNotFound,
    TransferMustHaveTheSameLedgerAsAccounts,
    PendingTransferNotFound,
    PendingTransferNotPending,
    PendingTransferHasDifferentDebitAccountId,
    PendingTransferHasDifferentCreditAccountId,
    PendingTransferHasDifferentAmount,
    ExceedsPendingTransferAmount,
    PendingTransferAlreadyPosted,
    PendingTransferAlreadyVoided,
    PendingTransferExpired,
    ExistsWithDifferentFields,
    Exists,
    OverflowsDebits,
    OverflowsCredits,
    ExceedsCredits,
    ExceedsDebits,
}

impl CreateTransferResult {
    /// Failures that depend on ledger state rather than on the transfer
    /// itself. The id is burned: a retry reports `IdAlreadyFailed`.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            CreateTransferResult::DebitAccountNotFound
                | CreateTransferResult::CreditAccountNotFound
                | CreateTransferResult::PendingTransferNotFound
                | CreateTransferResult::ExceedsCredits
                | CreateTransferResult::ExceedsDebits
                | CreateTransferResult::OverflowsDebits
                | CreateTransferResult::OverflowsCredits
        )
    }
}

impl fmt::Display for CreateTransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for CreateAccountResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed event at `index` of the submitted batch. Successful events are
/// not reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEventResult {
    pub index: usize,
    pub result: CreateTransferResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountEventResult {
    pub index: usize,
    pub result: CreateAccountResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine() {
        let flags = TransferFlags::LINKED | TransferFlags::PENDING;
        assert!(flags.linked());
        assert!(flags.pending());
        assert!(!flags.void());
        assert!(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS
            .contains(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS));
        assert!(!AccountFlags::NONE.contains(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS));
    }

    #[test]
    fn test_account_available() {
        let mut account = Account::new(1, 1, 1, AccountFlags::NONE);
        account.credits_posted = 10;
        account.debits_posted = 2;
        account.debits_pending = 5;
        assert_eq!(account.balance(), 8);
        assert_eq!(account.available(), 3);
        account.debits_pending = 50;
        assert_eq!(account.available(), 0);
    }

    #[test]
    fn test_transfer_json_uses_hex_ids() {
        let transfer = Transfer::new(u128::MAX - 1, 2, 3, 7, 1, 1).with_flags(TransferFlags::PENDING);
        let json = serde_json::to_value(&transfer).unwrap();
        assert_eq!(json["id"], "fffffffffffffffffffffffffffffffe");
        assert_eq!(json["debit_account_id"], "00000000000000000000000000000002");
        let back: Transfer = serde_json::from_value(json).unwrap();
        assert_eq!(back, transfer);
    }
}
