//! Payment creation and reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use booking::{BookingError, OrderLifecycle};
use chrono::Utc;
use common::OrderId;
use domain::{
    DomainError, Money, Order, OrderError, OrderRepository, OrderStatus, Payment, PaymentMethod,
    PaymentRepository, PaymentStatus, RefundRepository,
};
use ledger::LedgerStore;

use crate::error::{PaymentError, Result};
use crate::provider::{PaymentProvider, PrepaySession, TradeUpdate};

/// Error message carried by a duplicate capture awaiting refund.
pub const DUPLICATE_CAPTURE: &str = "duplicate capture, refund required";

/// Creates payments and applies provider updates to them.
///
/// Applying an update is idempotent. A payment already `success` or
/// `refunded` is never modified again; a repeated notification only makes
/// sure its order reached `paid`. At most one payment per order reaches
/// `success`: a later capture is recorded as a failed duplicate.
pub struct PaymentService<S, R, Q>
where
    S: LedgerStore,
    R: OrderRepository,
    Q: PaymentRepository + RefundRepository,
{
    lifecycle: Arc<OrderLifecycle<S, R>>,
    repo: Q,
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl<S, R, Q> PaymentService<S, R, Q>
where
    S: LedgerStore,
    R: OrderRepository,
    Q: PaymentRepository + RefundRepository,
{
    pub fn new(lifecycle: Arc<OrderLifecycle<S, R>>, repo: Q) -> Self {
        Self {
            lifecycle,
            repo,
            providers: HashMap::new(),
        }
    }

    /// Registers the provider handling `method`.
    pub fn with_provider(mut self, method: PaymentMethod, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(method, provider);
        self
    }

    pub fn lifecycle(&self) -> &OrderLifecycle<S, R> {
        &self.lifecycle
    }

    pub fn repository(&self) -> &Q {
        &self.repo
    }

    pub fn provider(&self, method: PaymentMethod) -> Result<&Arc<dyn PaymentProvider>> {
        self.providers
            .get(&method)
            .ok_or_else(|| PaymentError::UnsupportedProvider(method.to_string()))
    }

    /// Records a pending payment for a pending order holding all of its
    /// cabins and opens a prepay session with the provider.
    ///
    /// A failed previous attempt may be retried while its retry budget
    /// lasts. If the provider rejects the session the attempt is marked
    /// failed.
    #[tracing::instrument(skip(self, description))]
    pub async fn create_payment(
        &self,
        order_id: OrderId,
        method: PaymentMethod,
        description: &str,
    ) -> Result<(Payment, PrepaySession)> {
        let provider = self.provider(method)?.clone();
        let order = self.lifecycle.get_order(order_id).await?;
        let now = Utc::now();
        if order.status != OrderStatus::Pending {
            return Err(PaymentError::OrderNotPayable {
                status: order.status,
            });
        }
        if order.is_expired_at(now) {
            return Err(BookingError::Order(OrderError::OrderExpired {
                order_number: order.order_number,
            })
            .into());
        }
        if !order.holds_all_items() {
            return Err(PaymentError::IncompleteReservation {
                order_number: order.order_number,
            });
        }

        let previous = self.repo.list_payments_for_order(order_id).await?;
        if previous.iter().any(Payment::is_successful) {
            return Err(PaymentError::AlreadyPaid);
        }
        let retry_count = match previous.last() {
            Some(last) if last.status == PaymentStatus::Failed => {
                if !last.can_retry() {
                    return Err(PaymentError::RetriesExhausted {
                        attempts: last.retry_count + 1,
                    });
                }
                last.retry_count + 1
            }
            Some(last) => last.retry_count,
            None => 0,
        };

        let mut payment = Payment::new(order.id, method, order.total_amount, &order.currency, now);
        payment.retry_count = retry_count;
        self.repo.insert_payment(&payment).await?;

        match provider.create_payment(&payment, description).await {
            Ok(session) => {
                metrics::counter!("payments_created_total", "method" => method.as_str())
                    .increment(1);
                tracing::info!(
                    payment_no = %payment.payment_no,
                    amount = %payment.amount,
                    retry_count,
                    "payment created"
                );
                Ok((payment, session))
            }
            Err(e) => {
                payment.status = PaymentStatus::Failed;
                payment.error_message = Some(e.to_string());
                payment.updated_at = Utc::now();
                if let Err(update_err) = self
                    .repo
                    .update_payment(&payment, PaymentStatus::Pending)
                    .await
                {
                    tracing::warn!(
                        payment_no = %payment.payment_no,
                        error = %update_err,
                        "failed to record rejected payment"
                    );
                }
                Err(e)
            }
        }
    }

    /// Authenticates a provider notification and applies it.
    ///
    /// `provider` is the route name (`wechat`, ...). Returns the payment as
    /// stored after the update.
    #[tracing::instrument(skip(self, body, signature), fields(body_len = body.len()))]
    pub async fn handle_callback(
        &self,
        provider: &str,
        body: &[u8],
        signature: &str,
    ) -> Result<Payment> {
        let method: PaymentMethod = provider
            .parse()
            .map_err(|_| PaymentError::UnsupportedProvider(provider.to_string()))?;

        let update = match self.provider(method)?.parse_callback(body, signature) {
            Ok(update) => update,
            Err(e) => {
                let outcome = match e {
                    PaymentError::InvalidSignature => "invalid_signature",
                    _ => "malformed",
                };
                metrics::counter!("payment_callbacks_total", "outcome" => outcome).increment(1);
                tracing::warn!(provider, error = %e, "rejected payment notification");
                return Err(e);
            }
        };

        let result = self.apply_update(update).await;
        let outcome = if result.is_ok() { "applied" } else { "error" };
        metrics::counter!("payment_callbacks_total", "outcome" => outcome).increment(1);
        result
    }

    /// Queries the provider for a payment and applies the answer.
    ///
    /// Provider errors propagate without touching the payment.
    #[tracing::instrument(skip(self))]
    pub async fn query_and_apply(&self, payment_no: &str) -> Result<Payment> {
        let payment = self.get_payment(payment_no).await?;
        if payment.status.is_settled() {
            return Ok(payment);
        }
        let update = self.provider(payment.method)?.query_payment(payment_no).await?;
        self.apply_update(update).await
    }

    /// The most recent payment attempt for an order.
    pub async fn latest_payment(&self, order_id: OrderId) -> Result<Payment> {
        self.repo
            .list_payments_for_order(order_id)
            .await?
            .pop()
            .ok_or(PaymentError::NoPayment(order_id))
    }

    /// The order's successful payment, if any.
    pub async fn successful_payment(&self, order_id: OrderId) -> Result<Option<Payment>> {
        Ok(self
            .repo
            .list_payments_for_order(order_id)
            .await?
            .into_iter()
            .find(Payment::is_successful))
    }

    /// Whether a closed attempt ends its order's reservation: it must be
    /// the latest attempt and no attempt may still be open or successful.
    pub async fn ends_reservation(&self, payment: &Payment) -> Result<bool> {
        if payment.status != PaymentStatus::Cancelled {
            return Ok(false);
        }
        let attempts = self.repo.list_payments_for_order(payment.order_id).await?;
        let latest = attempts.last().is_some_and(|p| p.id == payment.id);
        let live = attempts.iter().any(|p| {
            matches!(
                p.status,
                PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::Success
            )
        });
        Ok(latest && !live)
    }

    pub async fn get_payment(&self, payment_no: &str) -> Result<Payment> {
        self.repo
            .get_payment_by_no(payment_no)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_no.to_string()))
    }

    /// Applies a provider update to the stored payment.
    pub async fn apply_update(&self, update: TradeUpdate) -> Result<Payment> {
        let mut payment = self.get_payment(&update.payment_no).await?;

        if payment.status.is_settled() {
            tracing::debug!(
                payment_no = %payment.payment_no,
                status = %payment.status,
                "payment already settled"
            );
            if payment.is_successful() {
                self.settle_order(&payment).await?;
            }
            return Ok(payment);
        }

        if payment.status == update.status && update.transaction_id.is_none() {
            return Ok(payment);
        }

        if update.status == PaymentStatus::Success
            && let Some(kept) = self.other_successful_payment(&payment).await?
        {
            return self.record_duplicate_capture(payment, &update, &kept).await;
        }

        let prior = payment.status;
        let now = Utc::now();
        payment.status = update.status;
        if update.transaction_id.is_some() {
            payment.third_party_transaction_id = update.transaction_id.clone();
        }
        payment.notify_at = Some(now);
        payment.updated_at = now;
        if update.status == PaymentStatus::Success {
            payment.paid_at = Some(update.paid_at.unwrap_or(now));
            payment.error_message = None;
        }
        if update.status == PaymentStatus::Success && update.amount != payment.amount {
            tracing::warn!(
                payment_no = %payment.payment_no,
                expected = %payment.amount,
                reported = %update.amount,
                "provider reported a different amount"
            );
        }

        match self.repo.update_payment(&payment, prior).await {
            Ok(()) => {}
            Err(DomainError::StalePayment { .. }) => {
                // a concurrent update won; report what it stored
                let current = self.get_payment(&payment.payment_no).await?;
                if current.is_successful() {
                    self.settle_order(&current).await?;
                }
                return Ok(current);
            }
            Err(DomainError::PaymentAlreadySucceeded { order_id }) => {
                // another attempt of the order succeeded concurrently
                let stored = self.get_payment(&payment.payment_no).await?;
                let kept = self
                    .successful_payment(order_id)
                    .await?
                    .ok_or(PaymentError::NoPayment(order_id))?;
                return self.record_duplicate_capture(stored, &update, &kept).await;
            }
            Err(e) => return Err(e.into()),
        }

        metrics::counter!("payment_status_updates_total", "status" => payment.status.as_str())
            .increment(1);
        tracing::info!(
            payment_no = %payment.payment_no,
            from = %prior,
            to = %payment.status,
            "payment updated"
        );

        if payment.is_successful() {
            self.settle_payment_amount(&payment, update.amount).await?;
        }
        Ok(payment)
    }

    async fn other_successful_payment(&self, payment: &Payment) -> Result<Option<Payment>> {
        Ok(self
            .repo
            .list_payments_for_order(payment.order_id)
            .await?
            .into_iter()
            .find(|p| p.id != payment.id && p.is_successful()))
    }

    /// Records a capture reported for an order that another attempt already
    /// paid. The attempt is kept out of `success` and marked failed with the
    /// provider transaction so it can be refunded; the callback is still
    /// acknowledged. Redeliveries of the same capture change nothing.
    async fn record_duplicate_capture(
        &self,
        mut payment: Payment,
        update: &TradeUpdate,
        kept: &Payment,
    ) -> Result<Payment> {
        if payment.error_message.as_deref() == Some(DUPLICATE_CAPTURE) {
            return Ok(payment);
        }

        let prior = payment.status;
        let now = Utc::now();
        payment.status = PaymentStatus::Failed;
        if update.transaction_id.is_some() {
            payment.third_party_transaction_id = update.transaction_id.clone();
        }
        payment.paid_at = Some(update.paid_at.unwrap_or(now));
        payment.notify_at = Some(now);
        payment.updated_at = now;
        payment.error_message = Some(DUPLICATE_CAPTURE.to_string());

        match self.repo.update_payment(&payment, prior).await {
            Ok(()) => {}
            Err(DomainError::StalePayment { .. }) => {
                return self.get_payment(&payment.payment_no).await;
            }
            Err(e) => return Err(e.into()),
        }

        metrics::counter!("payments_orphaned_total", "reason" => "duplicate_capture").increment(1);
        tracing::error!(
            payment_no = %payment.payment_no,
            kept_payment_no = %kept.payment_no,
            order_id = %payment.order_id,
            amount = %update.amount,
            transaction_id = ?payment.third_party_transaction_id,
            "duplicate capture for an already paid order; refund required"
        );
        Ok(payment)
    }

    async fn settle_order(&self, payment: &Payment) -> Result<()> {
        self.settle_payment_amount(payment, payment.amount).await
    }

    /// Drives the order of a successful payment to `paid`.
    ///
    /// An order that is already paid is left alone. An order that can no
    /// longer be paid (expired or cancelled meanwhile) keeps the captured
    /// payment on record for a manual refund; that is logged, not returned,
    /// so provider retries stop. Storage errors propagate so the provider
    /// retries and the next delivery settles the order.
    async fn settle_payment_amount(&self, payment: &Payment, amount: Money) -> Result<()> {
        let order: Order = self.lifecycle.get_order(payment.order_id).await?;
        if order.is_paid() {
            return Ok(());
        }

        let paid_at = payment.paid_at.unwrap_or_else(Utc::now);
        match self.lifecycle.mark_paid(order.id, amount, paid_at).await {
            Ok(_) => Ok(()),
            Err(BookingError::Order(e)) => {
                metrics::counter!("payments_orphaned_total", "reason" => "order_not_payable")
                    .increment(1);
                tracing::error!(
                    payment_no = %payment.payment_no,
                    order_number = %order.order_number,
                    order_status = %order.status,
                    error = %e,
                    "payment captured for an order that cannot be paid; refund required"
                );
                Ok(())
            }
            Err(BookingError::Domain(DomainError::StaleOrder { .. })) => {
                let current = self.lifecycle.get_order(order.id).await?;
                if current.is_paid() {
                    Ok(())
                } else {
                    metrics::counter!("payments_orphaned_total", "reason" => "order_cancelled")
                        .increment(1);
                    tracing::error!(
                        payment_no = %payment.payment_no,
                        order_number = %current.order_number,
                        order_status = %current.status,
                        "payment captured for an order cancelled concurrently; refund required"
                    );
                    Ok(())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
