//! Double-entry transfer ledger used for durable admission accounting.
//!
//! Accounts are limit keys, pending transfers are reservations. The
//! [`LedgerClient`] trait is the only surface the admission engine sees;
//! [`LocalLedger`] implements it in-process with a replayable journal.

mod client;
pub mod ids;
mod journal;
mod store;
mod submitter;
mod types;

use thiserror::Error;

pub use client::LedgerClient;
pub use journal::{Journal, JournalEntry};
pub use store::LocalLedger;
pub use submitter::{Submitter, SubmitterConfig, SubmitterHandle, TransferErrors};
pub use types::{
    Account, AccountEventResult, AccountFlags, CreateAccountResult, CreateTransferResult,
    Transfer, TransferEventResult, TransferFlags,
};

/// Failures talking to the ledger, as opposed to per-event results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger submitter is closed")]
    Closed,

    #[error("work item of {len} transfers exceeds max batch size {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("ledger request timed out")]
    Timeout,

    #[error("account not found: {0:032x}")]
    AccountNotFound(u128),

    #[error("create account failed: {0}")]
    CreateAccount(CreateAccountResult),

    #[error("transfer failed: {0}")]
    Transfer(CreateTransferResult),

    #[error("journal error: {0}")]
    Journal(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Journal(e.to_string())
    }
}
