//! In-memory backend with the same locking and atomicity rules as PostgreSQL.
//!
//! Every account has an async mutex standing in for its row lock. A unit of
//! work keeps the guards it acquired until it commits or is dropped, and
//! buffers its writes so other readers never see a half-applied transfer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument};

use crate::models::{Account, CreateAccount, Entry, Transfer, UpdateAccount, UpdateBalance};
use crate::services::store::{LedgerStore, UnitOfWork};
use crate::services::LedgerError;

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

struct Inner {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    next_account_id: AtomicI64,
    next_entry_id: AtomicI64,
    next_transfer_id: AtomicI64,
}

impl Inner {
    /// Row lock for an account that exists right now. Absent ids never get
    /// an entry in the lock map.
    async fn row_lock(&self, id: i64) -> Option<Arc<Mutex<()>>> {
        if !self.tables.read().await.accounts.contains_key(&id) {
            return None;
        }
        let mut locks = self.row_locks.lock().await;
        Some(locks.entry(id).or_default().clone())
    }

    /// Drops the lock map entry of a deleted account. Ids are never reused.
    async fn forget_row_lock(&self, id: i64) {
        self.row_locks.lock().await.remove(&id);
    }
}

/// Shared, cloneable handle to the in-memory tables.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                next_account_id: AtomicI64::new(1),
                next_entry_id: AtomicI64::new(1),
                next_transfer_id: AtomicI64::new(1),
            }),
        }
    }

    fn stale_version(id: i64, expected: i64, actual: i64) -> LedgerError {
        LedgerError::Conflict(format!(
            "account {} was modified concurrently: expected version {}, found {}",
            id, expected, actual
        ))
    }

    /// Applies `change` to a row while holding its row lock, so direct
    /// writes queue behind in-flight transfers.
    async fn write_locked<F>(
        &self,
        id: i64,
        expected_version: Option<i64>,
        change: F,
    ) -> Result<Account, LedgerError>
    where
        F: FnOnce(&mut Account) + Send,
    {
        let lock = self
            .inner
            .row_lock(id)
            .await
            .ok_or(LedgerError::NotFound(id))?;
        let _guard = lock.lock_owned().await;

        let mut tables = self.inner.tables.write().await;
        if !tables.accounts.contains_key(&id) {
            // Deleted while this writer was queued.
            drop(tables);
            self.inner.forget_row_lock(id).await;
            return Err(LedgerError::NotFound(id));
        }
        let account = tables
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;

        if let Some(expected) = expected_version {
            if account.version != expected {
                return Err(Self::stale_version(id, expected, account.version));
            }
        }

        change(account);
        account.version += 1;
        Ok(account.clone())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, LedgerError> {
        Ok(Box::new(MemoryUnitOfWork {
            inner: Arc::clone(&self.inner),
            guards: HashMap::new(),
            pending: BTreeMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        }))
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn get_account(&self, id: i64) -> Result<Account, LedgerError> {
        let tables = self.inner.tables.read().await;
        tables
            .accounts
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let tables = self.inner.tables.read().await;
        Ok(tables.accounts.values().cloned().collect())
    }

    #[instrument(skip(self, input), fields(owner = %input.owner, currency = %input.currency))]
    async fn create_account(&self, input: &CreateAccount) -> Result<Account, LedgerError> {
        if input.balance < 0 {
            return Err(LedgerError::Validation(
                "balance must not be negative".to_string(),
            ));
        }

        let account = Account {
            id: self.inner.next_account_id.fetch_add(1, Ordering::SeqCst),
            owner: input.owner.clone(),
            balance: input.balance,
            currency: input.currency.clone(),
            version: 1,
            created_at: Utc::now(),
        };

        self.inner
            .tables
            .write()
            .await
            .accounts
            .insert(account.id, account.clone());

        info!(account_id = account.id, balance = account.balance, "Account created");
        Ok(account)
    }

    #[instrument(skip(self, input), fields(account_id = id))]
    async fn update_account(
        &self,
        id: i64,
        input: &UpdateAccount,
    ) -> Result<Account, LedgerError> {
        let owner = input.owner.clone();
        self.write_locked(id, input.version, move |account| account.owner = owner)
            .await
    }

    #[instrument(skip(self, input), fields(account_id = id, balance = input.balance))]
    async fn update_balance(
        &self,
        id: i64,
        input: &UpdateBalance,
    ) -> Result<Account, LedgerError> {
        if input.balance < 0 {
            return Err(LedgerError::Validation(
                "balance must not be negative".to_string(),
            ));
        }
        let balance = input.balance;
        let account = self
            .write_locked(id, input.version, move |account| account.balance = balance)
            .await?;
        info!(version = account.version, "Account balance overridden");
        Ok(account)
    }

    #[instrument(skip(self), fields(account_id = id))]
    async fn delete_account(&self, id: i64) -> Result<(), LedgerError> {
        let lock = self
            .inner
            .row_lock(id)
            .await
            .ok_or(LedgerError::NotFound(id))?;
        let _guard = lock.lock_owned().await;

        let mut tables = self.inner.tables.write().await;
        if !tables.accounts.contains_key(&id) {
            drop(tables);
            self.inner.forget_row_lock(id).await;
            return Err(LedgerError::NotFound(id));
        }

        let has_history = tables.entries.iter().any(|e| e.account_id == id)
            || tables
                .transfers
                .iter()
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        if has_history {
            return Err(LedgerError::Conflict(format!(
                "account {} has ledger history and cannot be deleted",
                id
            )));
        }

        tables.accounts.remove(&id);
        drop(tables);
        self.inner.forget_row_lock(id).await;

        info!("Account deleted");
        Ok(())
    }

    async fn list_entries(&self, account_id: i64) -> Result<Vec<Entry>, LedgerError> {
        let tables = self.inner.tables.read().await;
        let mut entries: Vec<Entry> = tables
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn list_transfers(&self, account_id: i64) -> Result<Vec<Transfer>, LedgerError> {
        let tables = self.inner.tables.read().await;
        let mut transfers: Vec<Transfer> = tables
            .transfers
            .iter()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.id);
        Ok(transfers)
    }
}

/// Net effect of one unit of work on one account.
#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    delta: i64,
    writes: i64,
}

/// Buffered unit of work. Nothing reaches the tables before `commit`.
pub struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    guards: HashMap<i64, OwnedMutexGuard<()>>,
    pending: BTreeMap<i64, Pending>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl MemoryUnitOfWork {
    /// The row as this unit of work sees it, own writes included.
    fn project(&self, account: &Account) -> Result<Account, LedgerError> {
        let pending = self.pending.get(&account.id).copied().unwrap_or_default();
        let balance = account.balance.checked_add(pending.delta).ok_or_else(|| {
            LedgerError::Validation(format!("balance of account {} would overflow", account.id))
        })?;
        Ok(Account {
            balance,
            version: account.version + pending.writes,
            ..account.clone()
        })
    }

    async fn committed(&self, id: i64) -> Option<Account> {
        self.inner.tables.read().await.accounts.get(&id).cloned()
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    #[instrument(skip(self), fields(account_id = id))]
    async fn lock_account(&mut self, id: i64) -> Result<Option<Account>, LedgerError> {
        if !self.guards.contains_key(&id) {
            let Some(lock) = self.inner.row_lock(id).await else {
                return Ok(None);
            };
            let guard = lock.lock_owned().await;
            self.guards.insert(id, guard);
        }

        // The row may have been deleted while this unit of work was waiting.
        match self.committed(id).await {
            Some(account) => {
                debug!("Account row locked");
                self.project(&account).map(Some)
            }
            None => {
                self.guards.remove(&id);
                self.inner.forget_row_lock(id).await;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(account_id = id, delta = delta))]
    async fn add_to_balance(&mut self, id: i64, delta: i64) -> Result<Account, LedgerError> {
        if !self.guards.contains_key(&id) {
            return Err(LedgerError::Internal(anyhow::anyhow!(
                "account {} updated without holding its row lock",
                id
            )));
        }
        let account = self.committed(id).await.ok_or(LedgerError::NotFound(id))?;

        let current = self.project(&account)?;
        let balance = current.balance.checked_add(delta).ok_or_else(|| {
            LedgerError::Validation(format!("balance of account {} would overflow", id))
        })?;
        if balance < 0 {
            return Err(LedgerError::Validation(format!(
                "balance of account {} must not be negative",
                id
            )));
        }

        let pending = self.pending.entry(id).or_default();
        pending.delta += delta;
        pending.writes += 1;

        Ok(Account {
            balance,
            version: current.version + 1,
            ..current
        })
    }

    async fn append_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry, LedgerError> {
        if self.committed(account_id).await.is_none() {
            return Err(LedgerError::Internal(anyhow::anyhow!(
                "entry references missing account {}",
                account_id
            )));
        }

        let entry = Entry {
            id: self.inner.next_entry_id.fetch_add(1, Ordering::SeqCst),
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn record_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::Validation(
                "transfer amount must be positive".to_string(),
            ));
        }
        for id in [from_account_id, to_account_id] {
            if self.committed(id).await.is_none() {
                return Err(LedgerError::Internal(anyhow::anyhow!(
                    "transfer references missing account {}",
                    id
                )));
            }
        }

        let transfer = Transfer {
            id: self.inner.next_transfer_id.fetch_add(1, Ordering::SeqCst),
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let this = *self;
        let mut tables = this.inner.tables.write().await;

        // Validate everything first so a failed commit changes nothing.
        let mut updated = Vec::with_capacity(this.pending.len());
        for (&id, pending) in &this.pending {
            let account = tables.accounts.get(&id).ok_or(LedgerError::NotFound(id))?;
            let balance = account
                .balance
                .checked_add(pending.delta)
                .filter(|b| *b >= 0)
                .ok_or_else(|| {
                    LedgerError::Validation(format!(
                        "balance of account {} must stay between 0 and {}",
                        id,
                        i64::MAX
                    ))
                })?;
            updated.push((id, balance, account.version + pending.writes));
        }

        for (id, balance, version) in updated {
            if let Some(account) = tables.accounts.get_mut(&id) {
                account.balance = balance;
                account.version = version;
            }
        }
        tables.entries.extend(this.entries);
        tables.transfers.extend(this.transfers);

        // Row guards are released when `this.guards` drops, after the tables.
        drop(tables);
        drop(this.guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        debug!(
            discarded_entries = self.entries.len(),
            "Unit of work rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seed(store: &InMemoryStore, owner: &str, balance: i64) -> Account {
        store
            .create_account(&CreateAccount {
                owner: owner.to_string(),
                balance,
                currency: "USD".to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids_and_first_version() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alice", 1000).await;
        let b = seed(&store, "Bob", 500).await;

        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(a.version, 1);
        assert_eq!(store.list_accounts().await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.get_account(42).await,
            Err(LedgerError::NotFound(42))
        ));
        assert!(matches!(
            store.delete_account(42).await,
            Err(LedgerError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn misses_on_absent_ids_leave_no_row_locks_behind() {
        let store = InMemoryStore::new();
        let kept = seed(&store, "Alice", 10).await;
        let gone = seed(&store, "Bob", 0).await;
        store.delete_account(gone.id).await.unwrap();

        for id in 100..2100 {
            let rename = UpdateAccount {
                owner: "Nobody".into(),
                version: None,
            };
            let reset = UpdateBalance {
                balance: 1,
                version: None,
            };
            assert!(matches!(
                store.update_account(id, &rename).await,
                Err(LedgerError::NotFound(_))
            ));
            assert!(matches!(
                store.update_balance(id, &reset).await,
                Err(LedgerError::NotFound(_))
            ));
            assert!(matches!(
                store.delete_account(id).await,
                Err(LedgerError::NotFound(_))
            ));

            let mut uow = store.begin().await.unwrap();
            assert!(uow.lock_account(id).await.unwrap().is_none());
            assert!(uow.lock_account(gone.id).await.unwrap().is_none());
            uow.rollback().await.unwrap();
        }

        let mut uow = store.begin().await.unwrap();
        uow.lock_account(kept.id).await.unwrap();
        uow.commit().await.unwrap();

        let locks = store.inner.row_locks.lock().await;
        assert_eq!(locks.keys().copied().collect::<Vec<_>>(), vec![kept.id]);
    }

    #[tokio::test]
    async fn writer_queued_behind_delete_sees_not_found() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alice", 10).await;

        let mut holder = store.begin().await.unwrap();
        holder.lock_account(a.id).await.unwrap();

        // Row lock waiters are served in arrival order: delete, then write.
        let deleter = store.clone();
        let delete = tokio::spawn(async move { deleter.delete_account(1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let writer = store.clone();
        let write = tokio::spawn(async move {
            writer
                .update_balance(
                    1,
                    &UpdateBalance {
                        balance: 99,
                        version: None,
                    },
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        holder.rollback().await.unwrap();

        delete.await.unwrap().unwrap();
        assert!(matches!(write.await.unwrap(), Err(LedgerError::NotFound(1))));
        assert!(store.inner.row_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemoryStore::new();
        let account = seed(&store, "Alice", 1000).await;

        let renamed = store
            .update_account(
                account.id,
                &UpdateAccount {
                    owner: "Alice Smith".into(),
                    version: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.version, 2);

        let stale = store
            .update_balance(
                account.id,
                &UpdateBalance {
                    balance: 5,
                    version: Some(1),
                },
            )
            .await;
        assert!(matches!(stale, Err(LedgerError::Conflict(_))));
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 1000);
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_no_trace() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alice", 1000).await;
        let b = seed(&store, "Bob", 0).await;

        {
            let mut uow = store.begin().await.unwrap();
            uow.lock_account(a.id).await.unwrap();
            uow.lock_account(b.id).await.unwrap();
            uow.record_transfer(a.id, b.id, 10).await.unwrap();
            uow.append_entry(a.id, -10).await.unwrap();
            uow.add_to_balance(a.id, -10).await.unwrap();
        }

        assert_eq!(store.get_account(a.id).await.unwrap(), a);
        assert!(store.list_entries(a.id).await.unwrap().is_empty());
        assert!(store.list_transfers(a.id).await.unwrap().is_empty());
        // Locks were released by the drop.
        store.delete_account(b.id).await.unwrap();
    }

    #[tokio::test]
    async fn row_lock_blocks_until_commit() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alice", 1000).await;

        let mut first = store.begin().await.unwrap();
        first.lock_account(a.id).await.unwrap();
        first.add_to_balance(a.id, -100).await.unwrap();

        let contender = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = contender.begin().await.unwrap();
            let seen = second.lock_account(1).await.unwrap().unwrap();
            second.rollback().await.unwrap();
            seen.balance
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.commit().await.unwrap();
        assert_eq!(waiter.await.unwrap(), 900);
    }

    #[tokio::test]
    async fn balance_update_refuses_negative_result() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alice", 50).await;

        let mut uow = store.begin().await.unwrap();
        uow.lock_account(a.id).await.unwrap();
        let result = uow.add_to_balance(a.id, -51).await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn account_with_history_cannot_be_deleted() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alice", 100).await;
        let b = seed(&store, "Bob", 0).await;

        let mut uow = store.begin().await.unwrap();
        uow.lock_account(a.id).await.unwrap();
        uow.lock_account(b.id).await.unwrap();
        uow.record_transfer(a.id, b.id, 25).await.unwrap();
        uow.commit().await.unwrap();

        assert!(matches!(
            store.delete_account(b.id).await,
            Err(LedgerError::Conflict(_))
        ));
        assert_eq!(store.list_transfers(b.id).await.unwrap().len(), 1);
    }
}
