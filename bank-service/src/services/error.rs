//! Ledger error taxonomy.

use service_core::error::AppError;
use thiserror::Error;

/// Every way a ledger operation can fail.
///
/// `InvalidPayer`, `InvalidPayee`, `InsufficientBalance` and
/// `CurrencyMismatch` are the transfer outcomes a client can correct.
/// `Internal` wraps any storage failure that is not one of the named
/// outcomes and is never retried here.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    NotFound(i64),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid payer details: account {0} does not exist")]
    InvalidPayer(i64),

    #[error("invalid payee details: account {0} does not exist")]
    InvalidPayee(i64),

    #[error("insufficient balance in account {account_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        account_id: i64,
        available: i64,
        requested: i64,
    },

    #[error("currency mismatch: payer holds {payer}, payee holds {payee}")]
    CurrencyMismatch { payer: String, payee: String },

    #[error("operation did not complete before its deadline")]
    Timeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LedgerError {
    /// True for outcomes caused by the request rather than the system.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidPayer(_)
                | LedgerError::InvalidPayee(_)
                | LedgerError::InsufficientBalance { .. }
                | LedgerError::CurrencyMismatch { .. }
                | LedgerError::Validation(_)
        )
    }

    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Validation(_) => "validation",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::InvalidPayer(_) => "invalid_payer",
            LedgerError::InvalidPayee(_) => "invalid_payee",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::CurrencyMismatch { .. } => "currency_mismatch",
            LedgerError::Timeout => "timeout",
            LedgerError::Internal(_) => "internal",
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            LedgerError::Conflict(_) => AppError::Conflict(anyhow::anyhow!(err.to_string())),
            LedgerError::Timeout => AppError::ServiceUnavailable,
            LedgerError::Internal(inner) => AppError::DatabaseError(inner),
            LedgerError::Validation(_)
            | LedgerError::InvalidPayer(_)
            | LedgerError::InvalidPayee(_)
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::CurrencyMismatch { .. } => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
        }
    }
}
