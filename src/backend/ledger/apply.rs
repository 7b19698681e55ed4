use tracing::{debug, info};

use super::{first_transfer_error, LedgerBackend, CODE_LIMIT, LEDGER_LIMITS};
use crate::error::{AdmissionError, Result};
use crate::ledger::ids::{capacity_transfer_id, debt_account_id, limit_account_id, operator_account_id};
use crate::ledger::{Account, AccountFlags, CreateAccountResult, LedgerError, Transfer};
use crate::ratelimit::context::CallContext;
use crate::ratelimit::registry::next_state;
use crate::ratelimit::types::{LimitDefinition, LimitStatus, OveragePolicy};

impl LedgerBackend {
    pub(super) async fn apply_limit(&self, ctx: CallContext, def: LimitDefinition) -> Result<()> {
        self.ensure_accounts(ctx, &def).await?;

        let prev = self.inner.lock().states.get(&def.key).cloned();
        let state = next_state(prev.as_ref(), &def);
        if state.status == LimitStatus::Active {
            self.ensure_capacity(ctx, &def).await?;
            info!(key = %def.key, kind = %def.kind, capacity = def.capacity, "Limit applied");
        } else {
            info!(
                key = %def.key,
                capacity = state.definition.capacity,
                target = state.pending_decrease_to,
                "Limit decrease pending"
            );
        }
        self.inner.lock().states.insert(def.key.clone(), state);
        Ok(())
    }

    /// Create the operator, limit and (for debt) debt accounts.
    pub(super) async fn ensure_accounts(&self, ctx: CallContext, def: &LimitDefinition) -> Result<()> {
        let mut accounts = vec![
            Account::new(operator_account_id(), LEDGER_LIMITS, CODE_LIMIT, AccountFlags::NONE),
            Account::new(
                limit_account_id(&def.key),
                LEDGER_LIMITS,
                CODE_LIMIT,
                AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS,
            ),
        ];
        if def.overage == OveragePolicy::Debt {
            accounts.push(Account::new(
                debt_account_id(&def.key),
                LEDGER_LIMITS,
                CODE_LIMIT,
                AccountFlags::NONE,
            ));
        }

        let results = ctx
            .run(async {
                self.client
                    .create_accounts(accounts)
                    .await
                    .map_err(super::ledger_error)
            })
            .await?;
        match results.iter().find(|r| r.result != CreateAccountResult::Exists) {
            Some(failed) => Err(AdmissionError::Ledger(LedgerError::CreateAccount(failed.result))),
            None => Ok(()),
        }
    }

    /// Top the limit account up to `def.capacity`. Never lowers it.
    pub(super) async fn ensure_capacity(&self, ctx: CallContext, def: &LimitDefinition) -> Result<()> {
        let account = self.lookup_account(ctx, limit_account_id(&def.key)).await?;
        let balance = account.balance();
        if def.capacity <= balance {
            return Ok(());
        }
        let delta = def.capacity - balance;
        let transfer = Transfer::new(
            capacity_transfer_id(&def.key, def.capacity, account.credits_posted),
            operator_account_id(),
            limit_account_id(&def.key),
            delta,
            LEDGER_LIMITS,
            CODE_LIMIT,
        );
        let errors = self.submit(ctx, vec![transfer]).await?;
        first_transfer_error(&errors)?;
        debug!(key = %def.key, delta, capacity = def.capacity, "Capacity topped up");
        Ok(())
    }
}
