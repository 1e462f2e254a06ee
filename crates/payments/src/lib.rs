//! Payment provider integration, reconciliation and refunds.
//!
//! Provider notifications and status queries are reduced to a
//! [`TradeUpdate`] and applied idempotently by [`PaymentService`]: a payment
//! that already settled is never touched again, and only a successful
//! payment moves its order to `paid`. [`RefundService`] runs the review and
//! provider refund of refund requests.

pub mod error;
pub mod provider;
pub mod refund;
pub mod service;
pub mod wechat;

pub use error::{PaymentError, RefundError, Result};
pub use provider::{
    InMemoryPaymentProvider, PaymentProvider, PrepaySession, ProviderRefund,
    ProviderRefundStatus, TradeUpdate, map_trade_state,
};
pub use refund::RefundService;
pub use service::{DUPLICATE_CAPTURE, PaymentService};
pub use wechat::{WechatPayConfig, WechatPayProvider};
