//! The narrow ledger surface the admission engine depends on.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{Account, AccountEventResult, Transfer, TransferEventResult};
use super::LedgerError;

/// Create accounts, submit transfers, look up balances.
///
/// Both create calls report only the failed events, by batch index.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn create_accounts(&self, accounts: Vec<Account>) -> Result<Vec<AccountEventResult>, LedgerError>;

    async fn create_transfers(&self, transfers: Vec<Transfer>) -> Result<Vec<TransferEventResult>, LedgerError>;

    /// Accounts that exist among `ids`, in request order.
    async fn lookup_accounts(&self, ids: Vec<u128>) -> Result<Vec<Account>, LedgerError>;

    /// Transfers that exist among `ids`, in request order.
    async fn lookup_transfers(&self, ids: Vec<u128>) -> Result<Vec<Transfer>, LedgerError>;
}

#[async_trait]
impl<C: LedgerClient + ?Sized> LedgerClient for Arc<C> {
    async fn create_accounts(&self, accounts: Vec<Account>) -> Result<Vec<AccountEventResult>, LedgerError> {
        (**self).create_accounts(accounts).await
    }

    async fn create_transfers(&self, transfers: Vec<Transfer>) -> Result<Vec<TransferEventResult>, LedgerError> {
        (**self).create_transfers(transfers).await
    }

    async fn lookup_accounts(&self, ids: Vec<u128>) -> Result<Vec<Account>, LedgerError> {
        (**self).lookup_accounts(ids).await
    }

    async fn lookup_transfers(&self, ids: Vec<u128>) -> Result<Vec<Transfer>, LedgerError> {
        (**self).lookup_transfers(ids).await
    }
}
