use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;

use crate::models::{TransferReceipt, TransferRequest};
use crate::startup::AppState;

/// `POST /api/v1/transfers`
#[tracing::instrument(skip(state, payload))]
pub async fn create_transfer(
    State(state): State<AppState>,
    Json(payload): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransferReceipt>), AppError> {
    let receipt = state.engine.execute(&payload).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}
