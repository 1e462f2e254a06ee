//! Checkout endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use booking::CheckoutRequest;
use domain::{Order, OrderRepository, PaymentRepository, RefundRepository};
use ledger::LedgerStore;

use crate::AppState;
use crate::error::ApiError;

/// POST /orders: places a pending order holding one locked cabin per item.
pub async fn create<S, R, Q>(
    State(state): State<Arc<AppState<S, R, Q>>>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError>
where
    S: LedgerStore + 'static,
    R: OrderRepository + 'static,
    Q: PaymentRepository + RefundRepository + 'static,
{
    // runs to completion even if the client disconnects mid-checkout
    let order = tokio::spawn(async move { state.checkout.place_order(request).await })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok((StatusCode::CREATED, Json(order)))
}
