//! Refund review and provider refunds.

use std::sync::Arc;

use chrono::Utc;
use common::{OrderId, OrderItemId, RefundId, UserId};
use domain::{
    DomainError, Money, OrderRepository, OrderStatus, Payment, PaymentRepository, PaymentStatus,
    RefundRepository, RefundRequest, RefundStatus, RefundType,
};
use ledger::LedgerStore;

use crate::error::RefundError;
use crate::service::PaymentService;

type Result<T> = std::result::Result<T, RefundError>;

/// `REF` + `YYYYMMDD` + 12 hex chars, sent to the provider as the refund
/// idempotency key.
///
/// Derived from the request, so processing the same request again sends the
/// same number.
pub fn refund_number(refund: &RefundRequest) -> String {
    let uuid = refund.id.as_uuid();
    let (high, mid, _, _) = uuid.as_fields();
    format!(
        "REF{}{:08x}{:04x}",
        refund.requested_at.format("%Y%m%d"),
        high,
        mid
    )
}

/// Runs refund requests through review and the provider.
///
/// ```text
/// request ──► approve ──► process ──► completed
///    │                       └──────► failed
///    └──► reject
/// ```
///
/// A refund left `processing` by an error after the provider accepted it is
/// resumed by calling [`process`](Self::process) again.
pub struct RefundService<S, R, Q>
where
    S: LedgerStore,
    R: OrderRepository,
    Q: PaymentRepository + RefundRepository,
{
    payments: Arc<PaymentService<S, R, Q>>,
}

impl<S, R, Q> RefundService<S, R, Q>
where
    S: LedgerStore,
    R: OrderRepository,
    Q: PaymentRepository + RefundRepository,
{
    pub fn new(payments: Arc<PaymentService<S, R, Q>>) -> Self {
        Self { payments }
    }

    pub async fn get_refund(&self, refund_id: RefundId) -> Result<RefundRequest> {
        self.payments
            .repository()
            .get_refund(refund_id)
            .await?
            .ok_or(RefundError::RefundNotFound(refund_id))
    }

    /// Order total minus the refunds already processing or completed.
    /// Zero for an order that was never paid.
    pub async fn refundable_amount(&self, order_id: OrderId) -> Result<Money> {
        let order = self.payments.lifecycle().get_order(order_id).await?;
        if !order.is_paid() {
            return Ok(Money::zero());
        }
        let committed = self
            .payments
            .repository()
            .list_refunds_for_order(order_id)
            .await?
            .iter()
            .filter(|r| r.status.holds_amount())
            .fold(Money::zero(), |acc, r| acc + r.amount);
        Ok(order.total_amount.saturating_sub(committed))
    }

    /// Files a pending refund request against a paid or confirmed order.
    #[tracing::instrument(skip(self, reason))]
    pub async fn request_refund(
        &self,
        order_id: OrderId,
        order_item_id: Option<OrderItemId>,
        amount: Money,
        reason: &str,
        refund_type: Option<RefundType>,
    ) -> Result<RefundRequest> {
        let order = self.payments.lifecycle().get_order(order_id).await?;
        if !matches!(order.status, OrderStatus::Paid | OrderStatus::Confirmed) {
            return Err(RefundError::OrderNotRefundable {
                status: order.status,
            });
        }

        let refundable = self.refundable_amount(order_id).await?;
        if !amount.is_positive() || amount > refundable {
            return Err(RefundError::InvalidAmount {
                requested: amount,
                refundable,
            });
        }

        let refund = RefundRequest::new(
            order_id,
            order_item_id,
            amount,
            order.total_amount,
            reason,
            refund_type,
            Utc::now(),
        );
        self.payments.repository().insert_refund(&refund).await?;

        metrics::counter!("refund_requests_total", "type" => refund.refund_type.as_str())
            .increment(1);
        tracing::info!(
            refund_id = %refund.id,
            order_number = %order.order_number,
            amount = %amount,
            "refund requested"
        );
        Ok(refund)
    }

    /// `pending -> approved`
    #[tracing::instrument(skip(self, note))]
    pub async fn approve(
        &self,
        refund_id: RefundId,
        reviewer: UserId,
        note: Option<String>,
    ) -> Result<RefundRequest> {
        self.review(refund_id, reviewer, note, RefundStatus::Approved)
            .await
    }

    /// `pending -> rejected`
    #[tracing::instrument(skip(self, note))]
    pub async fn reject(
        &self,
        refund_id: RefundId,
        reviewer: UserId,
        note: Option<String>,
    ) -> Result<RefundRequest> {
        self.review(refund_id, reviewer, note, RefundStatus::Rejected)
            .await
    }

    async fn review(
        &self,
        refund_id: RefundId,
        reviewer: UserId,
        note: Option<String>,
        decision: RefundStatus,
    ) -> Result<RefundRequest> {
        let mut refund = self.get_refund(refund_id).await?;
        expect_status(&refund, RefundStatus::Pending)?;

        refund.status = decision;
        refund.reviewed_at = Some(Utc::now());
        refund.reviewed_by = Some(reviewer);
        refund.review_note = note;
        self.payments
            .repository()
            .update_refund(&refund, RefundStatus::Pending)
            .await?;

        tracing::info!(%refund_id, decision = %decision, "refund reviewed");
        Ok(refund)
    }

    /// Sends an approved refund to the provider, or resumes one left
    /// `processing`.
    ///
    /// Once the provider accepts, the payment is marked refunded, the order
    /// moves to `refunded` and its cabins are returned to the ledger; only
    /// then is the refund `completed`. Every step skips work already done,
    /// so a failure in between leaves the refund `processing` and a later
    /// call finishes it with the same refund number. A provider error or
    /// refusal leaves the refund `failed`.
    #[tracing::instrument(skip(self))]
    pub async fn process(&self, refund_id: RefundId) -> Result<RefundRequest> {
        let repo = self.payments.repository();
        let mut refund = self.get_refund(refund_id).await?;
        match refund.status {
            RefundStatus::Approved => {
                refund.status = RefundStatus::Processing;
                repo.update_refund(&refund, RefundStatus::Approved).await?;
            }
            RefundStatus::Processing => {
                tracing::info!(%refund_id, "resuming refund");
            }
            _ => expect_status(&refund, RefundStatus::Approved)?,
        }

        let Some(mut payment) = self.refundable_payment(refund.order_id).await? else {
            self.fail(&mut refund, "no successful payment").await?;
            return Err(RefundError::NoSuccessfulPayment(refund.order_id));
        };

        let provider = self.payments.provider(payment.method)?.clone();
        let refund_no = refund_number(&refund);
        let answer = match provider
            .refund(&payment, &refund_no, refund.amount, &refund.reason)
            .await
        {
            Ok(answer) if answer.status.is_accepted() => answer,
            Ok(answer) => {
                let reason = format!("provider refund status {:?}", answer.status);
                self.fail(&mut refund, &reason).await?;
                return Err(RefundError::ProviderRejected {
                    refund_no,
                    status: answer.status,
                });
            }
            Err(e) => {
                self.fail(&mut refund, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        if payment.status == PaymentStatus::Success {
            payment.status = PaymentStatus::Refunded;
            payment.updated_at = now;
            match repo.update_payment(&payment, PaymentStatus::Success).await {
                Ok(()) | Err(DomainError::StalePayment { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let lifecycle = self.payments.lifecycle();
        let mut order = lifecycle.get_order(refund.order_id).await?;
        if order.status != OrderStatus::Refunded {
            order = lifecycle.mark_refunded(order.id).await?;
        }
        let (_, released) = lifecycle.release_and_persist(order).await?;

        refund.status = RefundStatus::Completed;
        refund.processed_at = Some(now);
        refund.provider_refund_id = answer.provider_refund_id;
        repo.update_refund(&refund, RefundStatus::Processing).await?;

        metrics::counter!("refunds_completed_total").increment(1);
        tracing::info!(
            %refund_id,
            refund_no,
            amount = %refund.amount,
            released = released.released,
            "refund completed"
        );
        Ok(refund)
    }

    /// The successful payment of an order, or the one a resumed refund
    /// already marked refunded.
    async fn refundable_payment(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let payments = self
            .payments
            .repository()
            .list_payments_for_order(order_id)
            .await?;
        Ok(payments
            .iter()
            .find(|p| p.is_successful())
            .or_else(|| {
                payments
                    .iter()
                    .find(|p| p.status == PaymentStatus::Refunded)
            })
            .cloned())
    }

    async fn fail(&self, refund: &mut RefundRequest, reason: &str) -> Result<()> {
        refund.status = RefundStatus::Failed;
        refund.processed_at = Some(Utc::now());
        self.payments
            .repository()
            .update_refund(refund, RefundStatus::Processing)
            .await?;

        metrics::counter!("refunds_failed_total").increment(1);
        tracing::warn!(refund_id = %refund.id, reason, "refund failed");
        Ok(())
    }
}

fn expect_status(refund: &RefundRequest, expected: RefundStatus) -> Result<()> {
    if refund.status == expected {
        Ok(())
    } else {
        Err(RefundError::InvalidRefundState {
            refund_id: refund.id,
            expected,
            actual: refund.status,
        })
    }
}
