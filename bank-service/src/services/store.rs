//! Storage seam shared by the PostgreSQL and in-memory backends.
//!
//! [`LedgerStore`] covers the plain, single-row account repository and the
//! history reads. [`UnitOfWork`] is one open atomic transaction: the locking
//! read, the arithmetic balance update, the entry ledger append and the
//! transfer record write all happen through it, and none of them is visible
//! to other readers until [`UnitOfWork::commit`] returns.

use async_trait::async_trait;

use crate::models::{Account, CreateAccount, Entry, Transfer, UpdateAccount, UpdateBalance};
use crate::services::LedgerError;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a new atomic unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, LedgerError>;

    async fn health_check(&self) -> Result<(), LedgerError>;

    // Account repository

    async fn get_account(&self, id: i64) -> Result<Account, LedgerError>;

    /// All accounts, ascending by id.
    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError>;

    async fn create_account(&self, input: &CreateAccount) -> Result<Account, LedgerError>;

    /// Change descriptive fields. Fails with `Conflict` when `input.version`
    /// is set and no longer matches.
    async fn update_account(&self, id: i64, input: &UpdateAccount)
        -> Result<Account, LedgerError>;

    /// Administrative balance override, same version rule as `update_account`.
    async fn update_balance(&self, id: i64, input: &UpdateBalance)
        -> Result<Account, LedgerError>;

    /// Hard delete. Accounts with ledger history are refused with `Conflict`.
    async fn delete_account(&self, id: i64) -> Result<(), LedgerError>;

    // Entry ledger and transfer record reads

    /// Entries posted against `account_id`, oldest first.
    async fn list_entries(&self, account_id: i64) -> Result<Vec<Entry>, LedgerError>;

    /// Transfers where `account_id` is payer or payee, oldest first.
    async fn list_transfers(&self, account_id: i64) -> Result<Vec<Transfer>, LedgerError>;
}

/// One atomic transaction against the store.
///
/// Dropping a unit of work without committing rolls it back, so a cancelled
/// future never leaves partial writes behind.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Locking read: blocks while another unit of work holds the row and
    /// keeps it locked until this one ends. `None` if the account is absent.
    async fn lock_account(&mut self, id: i64) -> Result<Option<Account>, LedgerError>;

    /// `balance = balance + delta` on a row locked by this unit of work.
    /// Returns the row as it will read after commit.
    async fn add_to_balance(&mut self, id: i64, delta: i64) -> Result<Account, LedgerError>;

    /// Entry ledger append.
    async fn append_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry, LedgerError>;

    /// Transfer record write. The caller guarantees the preconditions.
    async fn record_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer, LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}
