//! Domain models for bank-service.

mod account;
mod entry;
mod transfer;

pub use account::{validate_currency, Account, CreateAccount, UpdateAccount, UpdateBalance};
pub use entry::Entry;
pub use transfer::{Transfer, TransferReceipt, TransferRequest};
