//! The account read/write interface consumed by the coordination core.

use async_trait::async_trait;
use paycore_common::{AccountId, Money, Result, TransactionId};

use crate::account::{Account, AccountBalance};

/// Account balance store.
///
/// `apply_transfer` is the storage layer's transaction boundary: it is
/// all-or-nothing, and idempotent per transaction id. A partially applied
/// debit is a contract violation of the implementation, not of the caller.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch an account record.
    async fn get_account(&self, account_id: &AccountId) -> Result<Account>;

    /// Fetch the current balance including in-flight reservations.
    async fn get_balance(&self, account_id: &AccountId) -> Result<AccountBalance>;

    /// Reserve funds against an account for an in-flight transaction.
    /// Visible to validators through `get_balance`; does not move funds.
    async fn reserve(
        &self,
        account_id: &AccountId,
        transaction_id: TransactionId,
        amount: &Money,
    ) -> Result<()>;

    /// Drop a reservation. A missing reservation is not an error.
    async fn release_reservation(
        &self,
        account_id: &AccountId,
        transaction_id: TransactionId,
    ) -> Result<()>;

    /// Amount reserved on an account by one specific transaction, zero if
    /// none. Lets a validator exclude its own transaction's reservation
    /// when checking spendable funds.
    async fn reserved_for(
        &self,
        account_id: &AccountId,
        transaction_id: TransactionId,
    ) -> Result<rust_decimal::Decimal>;

    /// Atomically debit `from` and credit `to` by `amount`.
    ///
    /// `None` on either side means the external world (deposits credit only,
    /// withdrawals debit only). The fencing token is recorded with the
    /// mutation so stale writers can be audited. Re-applying the same
    /// transaction id is a no-op.
    async fn apply_transfer(
        &self,
        transaction_id: TransactionId,
        fencing_token: u64,
        from: Option<&AccountId>,
        to: Option<&AccountId>,
        amount: &Money,
    ) -> Result<()>;

    /// Whether the transfer for this transaction has been applied. Lets the
    /// reconciler tell a stalled attempt apart from one that committed just
    /// before its coordinator died.
    async fn transfer_applied(&self, transaction_id: TransactionId) -> Result<bool>;
}
