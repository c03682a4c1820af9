//! Transfer engine: one logical transfer inside one atomic unit of work.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::models::{Account, TransferReceipt, TransferRequest};
use crate::services::metrics::{ERRORS_TOTAL, TRANSFERS_TOTAL, TRANSFER_DURATION};
use crate::services::store::{LedgerStore, UnitOfWork};
use crate::services::LedgerError;

/// Default bound on the lock waits and checks of a transfer.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Moves funds between two accounts.
///
/// Both rows are locked in ascending id order before any check runs, so two
/// transfers in opposite directions between the same pair queue on the same
/// first lock instead of deadlocking. Funds are checked against the locked
/// payer row, which keeps concurrent debits from overdrawing it.
#[derive(Clone)]
pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
    default_timeout: Duration,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn LedgerStore>, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    /// Run a transfer under the configured default deadline.
    pub async fn execute(&self, request: &TransferRequest) -> Result<TransferReceipt, LedgerError> {
        self.execute_within(request, self.default_timeout).await
    }

    /// Run a transfer whose locking and checks must finish within `deadline`.
    /// On expiry the unit of work is dropped mid-flight, which rolls it back,
    /// and `Timeout` is returned. The commit itself is not bounded, so a
    /// `Timeout` always means nothing was written.
    #[instrument(
        skip(self, request),
        fields(
            from_account_id = request.from_account_id,
            to_account_id = request.to_account_id,
            amount = request.amount
        )
    )]
    pub async fn execute_within(
        &self,
        request: &TransferRequest,
        deadline: Duration,
    ) -> Result<TransferReceipt, LedgerError> {
        let timer = TRANSFER_DURATION.start_timer();

        let result = match tokio::time::timeout(deadline, self.stage(request)).await {
            Ok(Ok((uow, receipt))) => uow.commit().await.map(|()| receipt),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LedgerError::Timeout),
        };

        timer.observe_duration();

        match &result {
            Ok(receipt) => {
                TRANSFERS_TOTAL.with_label_values(&["ok"]).inc();
                info!(
                    transfer_id = receipt.transfer.id,
                    payer_balance = receipt.payer.balance,
                    payee_balance = receipt.payee.balance,
                    "Transfer committed"
                );
            }
            Err(err) => {
                TRANSFERS_TOTAL.with_label_values(&[err.kind()]).inc();
                if err.is_business() {
                    warn!(error = %err, "Transfer rejected");
                } else {
                    ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
                    error!(error = %err, "Transfer failed");
                }
            }
        }

        result
    }

    /// Opens a unit of work and applies every write, leaving it ready to
    /// commit. Rolls back before returning an error.
    async fn stage(
        &self,
        request: &TransferRequest,
    ) -> Result<(Box<dyn UnitOfWork>, TransferReceipt), LedgerError> {
        validate(request)?;

        let mut uow = self.store.begin().await?;
        match apply(uow.as_mut(), request).await {
            Ok(receipt) => Ok((uow, receipt)),
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed transfer also failed");
                }
                Err(err)
            }
        }
    }
}

fn validate(request: &TransferRequest) -> Result<(), LedgerError> {
    if request.amount <= 0 {
        return Err(LedgerError::Validation(format!(
            "transfer amount must be positive, got {}",
            request.amount
        )));
    }
    if request.from_account_id == request.to_account_id {
        return Err(LedgerError::Validation(format!(
            "cannot transfer from account {} to itself",
            request.from_account_id
        )));
    }
    Ok(())
}

/// Every step of a transfer after the unit of work is open. The caller owns
/// commit and rollback.
async fn apply(
    uow: &mut dyn UnitOfWork,
    request: &TransferRequest,
) -> Result<TransferReceipt, LedgerError> {
    let TransferRequest {
        from_account_id: from,
        to_account_id: to,
        amount,
    } = *request;

    let (payer, payee) = lock_pair(uow, from, to).await?;

    let payer = payer.ok_or(LedgerError::InvalidPayer(from))?;
    if payer.balance < amount {
        return Err(LedgerError::InsufficientBalance {
            account_id: from,
            available: payer.balance,
            requested: amount,
        });
    }
    let payee = payee.ok_or(LedgerError::InvalidPayee(to))?;
    if payer.currency != payee.currency {
        return Err(LedgerError::CurrencyMismatch {
            payer: payer.currency,
            payee: payee.currency,
        });
    }
    if payee.balance.checked_add(amount).is_none() {
        return Err(LedgerError::Validation(format!(
            "crediting {} would overflow the balance of account {}",
            amount, to
        )));
    }

    let transfer = uow.record_transfer(from, to, amount).await?;
    let debit = uow.append_entry(from, -amount).await?;
    let credit = uow.append_entry(to, amount).await?;
    let payer = uow.add_to_balance(from, -amount).await?;
    let payee = uow.add_to_balance(to, amount).await?;

    Ok(TransferReceipt {
        transfer,
        entries: [debit, credit],
        payer,
        payee,
    })
}

/// Locks both rows, lower id first, and hands them back as (payer, payee).
async fn lock_pair(
    uow: &mut dyn UnitOfWork,
    from: i64,
    to: i64,
) -> Result<(Option<Account>, Option<Account>), LedgerError> {
    let (first, second) = if from < to { (from, to) } else { (to, from) };
    let first_row = uow.lock_account(first).await?;
    let second_row = uow.lock_account(second).await?;

    if first == from {
        Ok((first_row, second_row))
    } else {
        Ok((second_row, first_row))
    }
}
