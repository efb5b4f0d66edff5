//! API Routes
//!
//! HTTP endpoint definitions. Each transaction handler builds a command
//! record and publishes it to the command bus — the write path is
//! fire-and-accept, so responses carry the transaction id for later saga
//! status queries rather than a final balance.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Amount, AccountEvent, EventKind};
use crate::error::AppError;
use crate::pipeline::CommandBus;
use crate::saga::{saga_status, SagaStatusReport};
use crate::store::{IdempotencyStore, ReadModelStore};

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct TransactionRequest {
    /// Amount as a string for precise decimals
    pub amount: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransferRequest {
    pub amount: String,
    pub target_id: String,
}

#[derive(Debug, Serialize)]
pub struct TransactionAccepted {
    pub transaction_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account_id: String,
    pub balance: Decimal,
    pub last_updated_at: DateTime<Utc>,
}

// =========================================================================
// State & router
// =========================================================================

#[derive(Clone)]
pub struct AppState {
    pub command_bus: Arc<dyn CommandBus>,
    pub read_model: Arc<dyn ReadModelStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts/:id/deposit", post(deposit))
        .route("/accounts/:id/withdraw", post(withdraw))
        .route("/accounts/:id/transfer", post(transfer))
        .route("/accounts/:id", get(get_account))
        .route("/transactions/:tx/saga", get(get_saga_status))
        .with_state(state)
}

// =========================================================================
// Handlers
// =========================================================================

async fn deposit(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(request): Json<TransactionRequest>,
) -> Result<(StatusCode, Json<TransactionAccepted>), AppError> {
    submit(&state, account_id, request.amount, EventKind::Deposit, None).await
}

async fn withdraw(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(request): Json<TransactionRequest>,
) -> Result<(StatusCode, Json<TransactionAccepted>), AppError> {
    submit(&state, account_id, request.amount, EventKind::Withdraw, None).await
}

/// A transfer enters the ring as a WITHDRAW carrying the target; the saga
/// takes it from there.
async fn transfer(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransactionAccepted>), AppError> {
    if request.target_id == account_id {
        return Err(AppError::InvalidRequest(
            "Cannot transfer to the same account".to_string(),
        ));
    }
    if request.target_id.is_empty() {
        return Err(AppError::InvalidRequest(
            "Transfer requires a target account".to_string(),
        ));
    }
    submit(
        &state,
        account_id,
        request.amount,
        EventKind::Withdraw,
        Some(request.target_id),
    )
    .await
}

async fn submit(
    state: &AppState,
    account_id: String,
    amount: String,
    kind: EventKind,
    target_id: Option<String>,
) -> Result<(StatusCode, Json<TransactionAccepted>), AppError> {
    let amount = Amount::from_str(&amount)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid amount: {e}")))?;

    let transaction_id = Uuid::new_v4().to_string();
    let mut command = AccountEvent::new(account_id, amount.value(), kind, transaction_id.clone());
    if let Some(target) = target_id {
        command = command.with_target(target);
    }

    state.command_bus.publish(command).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TransactionAccepted {
            transaction_id,
            status: "accepted".to_string(),
        }),
    ))
}

async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountResponse>, AppError> {
    let row = state
        .read_model
        .fetch_account(&account_id)
        .await?
        .ok_or_else(|| AppError::AccountNotFound(account_id.clone()))?;

    Ok(Json(AccountResponse {
        account_id: row.account_id,
        balance: row.balance,
        last_updated_at: row.last_updated_at,
    }))
}

async fn get_saga_status(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<SagaStatusReport>, AppError> {
    let report = saga_status(&state.idempotency, &transaction_id)
        .await?
        .ok_or_else(|| AppError::TransactionNotFound(transaction_id.clone()))?;

    Ok(Json(report))
}
