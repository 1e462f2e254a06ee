//! Payment provider notifications.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use domain::{OrderRepository, PaymentRepository, PaymentStatus, RefundRepository};
use ledger::LedgerStore;
use payments::wechat::SIGNATURE_HEADER;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct NotifyResponse {
    pub code: &'static str,
    pub message: &'static str,
}

/// POST /payments/{provider}/notify
///
/// Answers 2xx only once the update is stored, 401 for a bad signature and
/// 5xx for anything else so the provider delivers again.
pub async fn notify<S, R, Q>(
    State(state): State<Arc<AppState<S, R, Q>>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<NotifyResponse>, ApiError>
where
    S: LedgerStore + 'static,
    R: OrderRepository + 'static,
    Q: PaymentRepository + RefundRepository + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let payment = state
        .payments
        .handle_callback(&provider, &body, signature)
        .await?;

    // a closed trade ends the reservation early unless a newer attempt is live
    if payment.status == PaymentStatus::Cancelled
        && let Some(reaper) = &state.reaper
    {
        match state.payments.ends_reservation(&payment).await {
            Ok(true) => {
                if let Err(e) = reaper.try_cancel_now(payment.order_id) {
                    tracing::warn!(
                        order_id = %payment.order_id,
                        error = %e,
                        "early cancel not queued, order left to expire"
                    );
                }
            }
            Ok(false) => {
                tracing::debug!(
                    payment_no = %payment.payment_no,
                    "closed attempt superseded, reservation kept"
                );
            }
            Err(e) => {
                tracing::warn!(
                    payment_no = %payment.payment_no,
                    error = %e,
                    "could not check other attempts, order left to expire"
                );
            }
        }
    }

    Ok(Json(NotifyResponse {
        code: "SUCCESS",
        message: "OK",
    }))
}
