//! Payment provider trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Money, Payment, PaymentStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{PaymentError, Result};

/// Maps a provider trade state to a payment status. Unknown states are
/// treated as still pending.
pub fn map_trade_state(state: &str) -> PaymentStatus {
    match state {
        "SUCCESS" => PaymentStatus::Success,
        "REFUND" => PaymentStatus::Refunded,
        "NOTPAY" => PaymentStatus::Pending,
        "CLOSED" => PaymentStatus::Cancelled,
        "USERPAYING" => PaymentStatus::Processing,
        "PAYERROR" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

/// What a provider reports about one payment, from a notification or a
/// status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub payment_no: String,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub amount: Money,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Session the client uses to complete a payment with the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrepaySession {
    pub payment_no: String,
    pub prepay_id: Option<String>,
    pub code_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderRefundStatus {
    Success,
    Processing,
    Closed,
    Abnormal,
}

impl ProviderRefundStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "SUCCESS" => Self::Success,
            "PROCESSING" => Self::Processing,
            "CLOSED" => Self::Closed,
            _ => Self::Abnormal,
        }
    }

    /// The provider took the refund and will (or did) return the money.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Success | Self::Processing)
    }
}

/// Provider answer to a refund call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRefund {
    pub refund_no: String,
    pub provider_refund_id: Option<String>,
    pub status: ProviderRefundStatus,
}

/// A payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Opens a prepay session for a recorded pending payment.
    async fn create_payment(&self, payment: &Payment, description: &str) -> Result<PrepaySession>;

    /// Asks the provider for the current state of a payment.
    async fn query_payment(&self, payment_no: &str) -> Result<TradeUpdate>;

    /// Authenticates and decodes a notification.
    ///
    /// Fails with `InvalidSignature` if the signature does not verify or the
    /// payload does not decrypt.
    fn parse_callback(&self, body: &[u8], signature: &str) -> Result<TradeUpdate>;

    /// Returns `amount` of a successful payment to the payer.
    async fn refund(
        &self,
        payment: &Payment,
        refund_no: &str,
        amount: Money,
        reason: &str,
    ) -> Result<ProviderRefund>;
}

#[derive(Debug, Default)]
struct InMemoryProviderState {
    trades: HashMap<String, TradeUpdate>,
    refunds: Vec<(String, Money)>,
    refund_answers: HashMap<String, ProviderRefund>,
    refund_status: Option<ProviderRefundStatus>,
}

/// In-memory provider for tests and local runs.
///
/// Notifications are plain JSON [`TradeUpdate`]s signed with the literal
/// signature configured at construction.
#[derive(Debug, Clone)]
pub struct InMemoryPaymentProvider {
    signature: String,
    state: Arc<RwLock<InMemoryProviderState>>,
    fail_on_create: Arc<AtomicBool>,
    fail_on_query: Arc<AtomicBool>,
    fail_on_refund: Arc<AtomicBool>,
}

impl Default for InMemoryPaymentProvider {
    fn default() -> Self {
        Self::new("test-signature")
    }
}

impl InMemoryPaymentProvider {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            state: Arc::default(),
            fail_on_create: Arc::default(),
            fail_on_query: Arc::default(),
            fail_on_refund: Arc::default(),
        }
    }

    /// The signature [`parse_callback`](PaymentProvider::parse_callback) accepts.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Sets what a query for `update.payment_no` returns.
    pub async fn set_trade(&self, update: TradeUpdate) {
        self.state
            .write()
            .await
            .trades
            .insert(update.payment_no.clone(), update);
    }

    pub fn set_fail_on_create(&self, fail: bool) {
        self.fail_on_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_query(&self, fail: bool) {
        self.fail_on_query.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_refund(&self, fail: bool) {
        self.fail_on_refund.store(fail, Ordering::SeqCst);
    }

    /// Makes later refund calls answer with `status` instead of success.
    pub async fn set_refund_status(&self, status: ProviderRefundStatus) {
        self.state.write().await.refund_status = Some(status);
    }

    /// Refunds issued so far, as `(payment_no, amount)`.
    pub async fn refunds(&self) -> Vec<(String, Money)> {
        self.state.read().await.refunds.clone()
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    async fn create_payment(&self, payment: &Payment, _description: &str) -> Result<PrepaySession> {
        if self.fail_on_create.load(Ordering::SeqCst) {
            return Err(PaymentError::Provider("Prepay rejected".to_string()));
        }
        Ok(PrepaySession {
            payment_no: payment.payment_no.clone(),
            prepay_id: Some(format!("prepay-{}", payment.payment_no)),
            code_url: None,
            expires_at: payment.created_at + chrono::Duration::minutes(30),
        })
    }

    async fn query_payment(&self, payment_no: &str) -> Result<TradeUpdate> {
        if self.fail_on_query.load(Ordering::SeqCst) {
            return Err(PaymentError::Provider("Provider unreachable".to_string()));
        }
        self.state
            .read()
            .await
            .trades
            .get(payment_no)
            .cloned()
            .ok_or_else(|| PaymentError::Provider(format!("Unknown trade {payment_no}")))
    }

    fn parse_callback(&self, body: &[u8], signature: &str) -> Result<TradeUpdate> {
        if signature != self.signature {
            return Err(PaymentError::InvalidSignature);
        }
        serde_json::from_slice(body).map_err(|e| PaymentError::MalformedNotification(e.to_string()))
    }

    async fn refund(
        &self,
        payment: &Payment,
        refund_no: &str,
        amount: Money,
        _reason: &str,
    ) -> Result<ProviderRefund> {
        if self.fail_on_refund.load(Ordering::SeqCst) {
            return Err(PaymentError::Provider("Refund rejected".to_string()));
        }
        let mut state = self.state.write().await;
        // a repeated refund number returns the original answer
        if let Some(answer) = state.refund_answers.get(refund_no) {
            return Ok(answer.clone());
        }
        let status = state.refund_status.unwrap_or(ProviderRefundStatus::Success);
        let answer = ProviderRefund {
            refund_no: refund_no.to_string(),
            provider_refund_id: Some(format!("refund-{refund_no}")),
            status,
        };
        if status.is_accepted() {
            state.refunds.push((payment.payment_no.clone(), amount));
        }
        state
            .refund_answers
            .insert(refund_no.to_string(), answer.clone());
        Ok(answer)
    }
}
