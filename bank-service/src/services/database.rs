//! PostgreSQL backend for bank-service.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, instrument};

use crate::models::{Account, CreateAccount, Entry, Transfer, UpdateAccount, UpdateBalance};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{LedgerStore, UnitOfWork};
use crate::services::LedgerError;

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, version, created_at";

/// `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "bank-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            lock_timeout_ms = lock_timeout.as_millis() as u64,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::Internal(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool, lock_timeout })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Internal(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Tells a missing row apart from a stale expected version after a
    /// conditional update matched nothing.
    async fn missing_or_stale(&self, id: i64, expected: Option<i64>) -> LedgerError {
        let current: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT version FROM accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match (current, expected) {
            (Ok(Some(actual)), Some(expected)) => LedgerError::Conflict(format!(
                "account {} was modified concurrently: expected version {}, found {}",
                id, expected, actual
            )),
            (Ok(_), _) => LedgerError::NotFound(id),
            (Err(e), _) => map_db_error("look up account version", e),
        }
    }
}

/// Maps a sqlx error onto the ledger taxonomy. Constraint violations that a
/// caller can fix become `Validation`; lock timeouts become `Timeout`.
fn map_db_error(action: &str, e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return LedgerError::Timeout;
        }
        if db_err.is_check_violation() {
            return LedgerError::Validation(format!(
                "rejected by constraint {}",
                db_err.constraint().unwrap_or("unknown")
            ));
        }
    }
    LedgerError::Internal(anyhow::anyhow!("Failed to {}: {}", action, e))
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self))]
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_error("begin transaction", e))?;

        // Scoped to this transaction only.
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_error("set lock timeout", e))?;

        Ok(Box::new(PgUnitOfWork { tx }))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::Internal(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Account Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(account_id = id))]
    async fn get_account(&self, id: i64) -> Result<Account, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("get account", e))?;

        timer.observe_duration();

        account.ok_or(LedgerError::NotFound(id))
    }

    #[instrument(skip(self))]
    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_accounts"])
            .start_timer();

        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list accounts", e))?;

        timer.observe_duration();

        Ok(accounts)
    }

    #[instrument(skip(self, input), fields(owner = %input.owner, currency = %input.currency))]
    async fn create_account(&self, input: &CreateAccount) -> Result<Account, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, $2, $3)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(&input.owner)
        .bind(input.balance)
        .bind(&input.currency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_db_error("create account", e))?;

        timer.observe_duration();

        info!(account_id = account.id, balance = account.balance, "Account created");

        Ok(account)
    }

    #[instrument(skip(self, input), fields(account_id = id))]
    async fn update_account(
        &self,
        id: i64,
        input: &UpdateAccount,
    ) -> Result<Account, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts
            SET owner = $2, version = version + 1
            WHERE id = $1 AND ($3::BIGINT IS NULL OR version = $3)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&input.owner)
        .bind(input.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("update account", e))?;

        timer.observe_duration();

        match account {
            Some(account) => Ok(account),
            None => Err(self.missing_or_stale(id, input.version).await),
        }
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

        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_balance"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts
            SET balance = $2, version = version + 1
            WHERE id = $1 AND ($3::BIGINT IS NULL OR version = $3)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input.balance)
        .bind(input.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("update balance", e))?;

        timer.observe_duration();

        match account {
            Some(account) => {
                info!(version = account.version, "Account balance overridden");
                Ok(account)
            }
            None => Err(self.missing_or_stale(id, input.version).await),
        }
    }

    #[instrument(skip(self), fields(account_id = id))]
    async fn delete_account(&self, id: i64) -> Result<(), LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_account"])
            .start_timer();

        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                    LedgerError::Conflict(format!(
                        "account {} has ledger history and cannot be deleted",
                        id
                    ))
                }
                _ => map_db_error("delete account", e),
            })?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }

        info!("Account deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // History Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(account_id = account_id))]
    async fn list_entries(&self, account_id: i64) -> Result<Vec<Entry>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE account_id = $1
            ORDER BY id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list entries", e))?;

        timer.observe_duration();

        Ok(entries)
    }

    #[instrument(skip(self), fields(account_id = account_id))]
    async fn list_transfers(&self, account_id: i64) -> Result<Vec<Transfer>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transfers"])
            .start_timer();

        let transfers = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE from_account_id = $1 OR to_account_id = $1
            ORDER BY id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list transfers", e))?;

        timer.observe_duration();

        Ok(transfers)
    }
}

/// One PostgreSQL transaction. Dropping it rolls back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    #[instrument(skip(self), fields(account_id = id))]
    async fn lock_account(&mut self, id: i64) -> Result<Option<Account>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_account"])
            .start_timer();

        // NO KEY UPDATE leaves FK checks from concurrent entry inserts unblocked.
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_db_error("lock account", e))?;

        timer.observe_duration();

        debug!(found = account.is_some(), "Account row locked");
        Ok(account)
    }

    #[instrument(skip(self), fields(account_id = id, delta = delta))]
    async fn add_to_balance(&mut self, id: i64, delta: i64) -> Result<Account, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_to_balance"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts
            SET balance = balance + $2, version = version + 1
            WHERE id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_db_error("update balance", e))?;

        timer.observe_duration();

        account.ok_or(LedgerError::NotFound(id))
    }

    #[instrument(skip(self), fields(account_id = account_id, amount = amount))]
    async fn append_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_entry"])
            .start_timer();

        let entry = sqlx::query_as::<_, Entry>(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_db_error("append entry", e))?;

        timer.observe_duration();

        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn record_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_transfer"])
            .start_timer();

        let transfer = sqlx::query_as::<_, Transfer>(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_db_error("record transfer", e))?;

        timer.observe_duration();

        Ok(transfer)
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_db_error("commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_db_error("roll back transaction", e))
    }
}
