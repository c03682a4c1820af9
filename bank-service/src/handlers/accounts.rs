//! Account CRUD and history handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{
    AccountListResponse, AccountResponse, EntryListResponse, MessageResponse,
    TransferListResponse,
};
use crate::models::{CreateAccount, UpdateAccount, UpdateBalance};
use crate::services::metrics::ACCOUNTS_CREATED;
use crate::startup::AppState;

#[tracing::instrument(skip(state, payload))]
pub async fn create_account(
    State(state): State<AppState>,
    Json(payload): Json<CreateAccount>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    payload.validate()?;

    let account = state.store.create_account(&payload).await?;
    ACCOUNTS_CREATED.inc();

    tracing::info!(
        account_id = account.id,
        currency = %account.currency,
        "Account opened"
    );

    Ok((StatusCode::CREATED, Json(account.into())))
}

pub async fn list_accounts(
    State(state): State<AppState>,
) -> Result<Json<AccountListResponse>, AppError> {
    let accounts = state.store.list_accounts().await?;
    Ok(Json(AccountListResponse { accounts }))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state.store.get_account(id).await?;
    Ok(Json(account.into()))
}

#[tracing::instrument(skip(state, payload))]
pub async fn update_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateAccount>,
) -> Result<Json<AccountResponse>, AppError> {
    payload.validate()?;

    let account = state.store.update_account(id, &payload).await?;
    Ok(Json(account.into()))
}

#[tracing::instrument(skip(state, payload))]
pub async fn update_balance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateBalance>,
) -> Result<Json<AccountResponse>, AppError> {
    payload.validate()?;

    let account = state.store.update_balance(id, &payload).await?;
    Ok(Json(account.into()))
}

#[tracing::instrument(skip(state))]
pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, AppError> {
    state.store.delete_account(id).await?;
    Ok(Json(MessageResponse {
        message: "account successfully deleted".to_string(),
    }))
}

pub async fn list_entries(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<EntryListResponse>, AppError> {
    // 404 for unknown accounts rather than an empty list.
    state.store.get_account(id).await?;
    let entries = state.store.list_entries(id).await?;
    Ok(Json(EntryListResponse { entries }))
}

pub async fn list_transfers(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TransferListResponse>, AppError> {
    state.store.get_account(id).await?;
    let transfers = state.store.list_transfers(id).await?;
    Ok(Json(TransferListResponse { transfers }))
}
