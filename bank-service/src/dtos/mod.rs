//! Response envelopes for the HTTP API.
//!
//! Request bodies are the model inputs themselves (`CreateAccount`,
//! `UpdateAccount`, `UpdateBalance`, `TransferRequest`).

use serde::{Deserialize, Serialize};

use crate::models::{Account, Entry, Transfer};

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountResponse {
    pub account: Account,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountListResponse {
    pub accounts: Vec<Account>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryListResponse {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferListResponse {
    pub transfers: Vec<Transfer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self { account }
    }
}
