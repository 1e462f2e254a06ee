//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use booking::BookingError;
use domain::{DomainError, OrderError};
use ledger::LedgerError;
use payments::PaymentError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Checkout or order workflow error.
    Booking(BookingError),
    /// Payment notification or reconciliation error.
    Payment(PaymentError),
    /// A background task failed.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Booking(err) => booking_error_to_response(err),
            ApiError::Payment(err) => payment_error_to_response(err),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn booking_error_to_response(err: BookingError) -> (StatusCode, String) {
    let status = match &err {
        BookingError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        BookingError::PriceNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BookingError::Order(order_err) => match order_err {
            OrderError::InvalidOrderTransition { .. }
            | OrderError::OrderAlreadyPaid
            | OrderError::OrderNotPaid
            | OrderError::NotEditable { .. } => StatusCode::CONFLICT,
            OrderError::OrderExpired { .. } => StatusCode::GONE,
            OrderError::NoItems
            | OrderError::NoAdults { .. }
            | OrderError::PassengerCountMismatch { .. }
            | OrderError::TooManyItems => StatusCode::BAD_REQUEST,
        },
        BookingError::Ledger(ledger_err) | BookingError::PartialCheckout { source: ledger_err, .. } => {
            match ledger_err {
                LedgerError::InsufficientInventory { .. }
                | LedgerError::ConcurrentModification { .. } => StatusCode::CONFLICT,
                LedgerError::InventoryNotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::InvalidQuantity(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
        BookingError::Domain(DomainError::Order(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Anything but a bad signature is a server error so the provider retries
/// the notification.
fn payment_error_to_response(err: PaymentError) -> (StatusCode, String) {
    let status = match &err {
        PaymentError::InvalidSignature => StatusCode::UNAUTHORIZED,
        PaymentError::UnsupportedProvider(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        ApiError::Booking(err)
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        ApiError::Payment(err)
    }
}

#[cfg(test)]
mod tests {
    use common::{CabinTypeId, VoyageId};
    use ledger::{Bucket, InventoryKey};

    use super::*;

    fn status(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_payment_status_codes() {
        assert_eq!(
            status(PaymentError::InvalidSignature.into()),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(PaymentError::MalformedNotification("bad json".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(PaymentError::PaymentNotFound("PAY1".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_checkout_status_codes() {
        let key = InventoryKey::new(VoyageId::new(), CabinTypeId::new());
        let oversold = LedgerError::InsufficientInventory {
            key,
            bucket: Bucket::Available,
            requested: 1,
            remaining: 0,
        };
        assert_eq!(
            status(BookingError::Ledger(oversold).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(BookingError::Order(OrderError::NoItems).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(
                BookingError::PriceNotFound {
                    voyage_id: key.voyage_id,
                    cabin_type_id: key.cabin_type_id,
                }
                .into()
            ),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
