//! WeChat Pay (API v3) provider.
//!
//! Notifications carry an RSA-SHA256 (PKCS#1 v1.5) signature over the raw
//! body, verified against the platform public key, and an AES-256-GCM
//! encrypted `resource` keyed by the merchant API v3 key. Outgoing
//! requests are signed with the merchant private key.

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use domain::{Money, Payment};
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{PaymentError, Result};
use crate::provider::{
    PaymentProvider, PrepaySession, ProviderRefund, ProviderRefundStatus, TradeUpdate,
    map_trade_state,
};

pub const DEFAULT_BASE_URL: &str = "https://api.mch.weixin.qq.com";

/// How long a prepay session stays open.
const PREPAY_WINDOW_MINUTES: i64 = 30;

/// Header carrying the notification signature.
pub const SIGNATURE_HEADER: &str = "Wechatpay-Signature";

#[derive(Debug, Clone)]
pub struct WechatPayConfig {
    pub app_id: String,
    pub mch_id: String,
    /// 32-byte key for notification payloads.
    pub api_v3_key: String,
    /// Platform public key (SPKI PEM) notifications are signed with.
    pub platform_public_key_pem: String,
    /// Merchant private key (PKCS#8 PEM) for signing requests. Without it
    /// the provider can verify notifications but not call the API.
    pub merchant_private_key_pem: Option<String>,
    pub merchant_serial_no: String,
    pub notify_url: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for WechatPayConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            mch_id: String::new(),
            api_v3_key: String::new(),
            platform_public_key_pem: String::new(),
            merchant_private_key_pem: None,
            merchant_serial_no: String::new(),
            notify_url: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(default)]
    create_time: Option<String>,
    resource: EncryptedResource,
}

#[derive(Debug, Deserialize)]
struct EncryptedResource {
    #[serde(default)]
    algorithm: String,
    ciphertext: String,
    #[serde(default)]
    associated_data: String,
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct TradeAmount {
    total: i64,
}

/// Decrypted notification resource, also the shape of a query response.
#[derive(Debug, Deserialize)]
struct Trade {
    out_trade_no: String,
    #[serde(default)]
    transaction_id: Option<String>,
    trade_state: String,
    #[serde(default)]
    success_time: Option<String>,
    #[serde(default)]
    amount: Option<TradeAmount>,
}

impl Trade {
    fn into_update(self, fallback_time: Option<&str>) -> TradeUpdate {
        let paid_at = self
            .success_time
            .as_deref()
            .or(fallback_time)
            .and_then(parse_time);
        TradeUpdate {
            status: map_trade_state(&self.trade_state),
            payment_no: self.out_trade_no,
            transaction_id: self.transaction_id.filter(|id| !id.is_empty()),
            amount: Money::from_cents(self.amount.map(|a| a.total).unwrap_or_default()),
            paid_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrepayResponse {
    #[serde(default)]
    prepay_id: Option<String>,
    #[serde(default)]
    code_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    #[serde(default)]
    refund_id: Option<String>,
    status: String,
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// WeChat Pay v3 client.
#[derive(Clone)]
pub struct WechatPayProvider {
    config: WechatPayConfig,
    http: reqwest::Client,
    cipher: Aes256Gcm,
    verifying_key: VerifyingKey<Sha256>,
    signing_key: Option<SigningKey<Sha256>>,
}

impl std::fmt::Debug for WechatPayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WechatPayProvider")
            .field("mch_id", &self.config.mch_id)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl WechatPayProvider {
    /// Builds a provider, parsing keys up front.
    pub fn new(config: WechatPayConfig) -> Result<Self> {
        if config.api_v3_key.len() != 32 {
            return Err(PaymentError::Config(
                "API v3 key must be exactly 32 bytes".to_string(),
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(config.api_v3_key.as_bytes())
            .map_err(|e| PaymentError::Config(format!("Invalid API v3 key: {e}")))?;

        let public_key = RsaPublicKey::from_public_key_pem(&config.platform_public_key_pem)
            .map_err(|e| PaymentError::Config(format!("Invalid platform public key: {e}")))?;

        let signing_key = config
            .merchant_private_key_pem
            .as_deref()
            .map(|pem| {
                RsaPrivateKey::from_pkcs8_pem(pem)
                    .map(SigningKey::<Sha256>::new)
                    .map_err(|e| PaymentError::Config(format!("Invalid merchant private key: {e}")))
            })
            .transpose()?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
            signing_key,
            cipher,
            http,
            config,
        })
    }

    /// Verifies the base64 signature over `body`.
    pub fn verify_signature(&self, body: &[u8], signature: &str) -> Result<()> {
        let raw = BASE64
            .decode(signature.trim())
            .map_err(|_| PaymentError::InvalidSignature)?;
        let signature =
            Signature::try_from(raw.as_slice()).map_err(|_| PaymentError::InvalidSignature)?;
        self.verifying_key
            .verify(body, &signature)
            .map_err(|_| PaymentError::InvalidSignature)
    }

    fn decrypt(&self, resource: &EncryptedResource) -> Result<Vec<u8>> {
        if !resource.algorithm.is_empty() && resource.algorithm != "AEAD_AES_256_GCM" {
            return Err(PaymentError::MalformedNotification(format!(
                "unsupported algorithm {}",
                resource.algorithm
            )));
        }
        let ciphertext = BASE64
            .decode(&resource.ciphertext)
            .map_err(|_| PaymentError::InvalidSignature)?;
        // GCM nonces are 96 bits
        if resource.nonce.len() != 12 {
            return Err(PaymentError::InvalidSignature);
        }

        self.cipher
            .decrypt(
                Nonce::from_slice(resource.nonce.as_bytes()),
                Payload {
                    msg: &ciphertext,
                    aad: resource.associated_data.as_bytes(),
                },
            )
            .map_err(|_| PaymentError::InvalidSignature)
    }

    /// `Authorization` header for a request.
    fn authorization(&self, method: &Method, path: &str, body: &str) -> Result<String> {
        let signing_key = self.signing_key.as_ref().ok_or_else(|| {
            PaymentError::Config("Merchant private key is required for API calls".to_string())
        })?;

        let timestamp = Utc::now().timestamp();
        let nonce = Uuid::new_v4().simple().to_string();
        let message = format!("{method}\n{path}\n{timestamp}\n{nonce}\n{body}\n");
        let signature = BASE64.encode(signing_key.sign(message.as_bytes()).to_bytes());

        Ok(format!(
            "WECHATPAY2-SHA256-RSA2048 mchid=\"{}\",nonce_str=\"{nonce}\",signature=\"{signature}\",timestamp=\"{timestamp}\",serial_no=\"{}\"",
            self.config.mch_id, self.config.merchant_serial_no
        ))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let body = body.map(|b| b.to_string());
        let authorization = self.authorization(&method, path, body.as_deref().unwrap_or(""))?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.config.base_url, path))
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, authorization);
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::Provider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %error_body, path, "WeChat Pay request failed");
            return Err(PaymentError::Provider(format!(
                "WeChat Pay API error: {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PaymentError::Provider(format!("Invalid WeChat Pay response: {e}")))
    }
}

#[async_trait]
impl PaymentProvider for WechatPayProvider {
    #[tracing::instrument(skip(self, payment), fields(payment_no = %payment.payment_no))]
    async fn create_payment(&self, payment: &Payment, description: &str) -> Result<PrepaySession> {
        let expires_at = Utc::now() + chrono::Duration::minutes(PREPAY_WINDOW_MINUTES);
        let body = json!({
            "appid": self.config.app_id,
            "mchid": self.config.mch_id,
            "description": description,
            "out_trade_no": payment.payment_no,
            "notify_url": self.config.notify_url,
            "amount": {
                "total": payment.amount.cents(),
                "currency": payment.currency,
            },
            "time_expire": expires_at.to_rfc3339(),
        });

        let response: PrepayResponse = self
            .request(Method::POST, "/v3/pay/transactions/native", Some(body))
            .await?;

        Ok(PrepaySession {
            payment_no: payment.payment_no.clone(),
            prepay_id: response.prepay_id,
            code_url: response.code_url,
            expires_at,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn query_payment(&self, payment_no: &str) -> Result<TradeUpdate> {
        let path = format!(
            "/v3/pay/transactions/out-trade-no/{payment_no}?mchid={}",
            self.config.mch_id
        );
        let trade: Trade = self.request(Method::GET, &path, None).await?;
        Ok(trade.into_update(None))
    }

    fn parse_callback(&self, body: &[u8], signature: &str) -> Result<TradeUpdate> {
        self.verify_signature(body, signature)?;

        let notification: Notification = serde_json::from_slice(body)
            .map_err(|e| PaymentError::MalformedNotification(e.to_string()))?;
        let plaintext = self.decrypt(&notification.resource)?;
        let trade: Trade = serde_json::from_slice(&plaintext)
            .map_err(|e| PaymentError::MalformedNotification(e.to_string()))?;

        Ok(trade.into_update(notification.create_time.as_deref()))
    }

    #[tracing::instrument(skip(self, payment, reason), fields(payment_no = %payment.payment_no))]
    async fn refund(
        &self,
        payment: &Payment,
        refund_no: &str,
        amount: Money,
        reason: &str,
    ) -> Result<ProviderRefund> {
        let body = json!({
            "out_trade_no": payment.payment_no,
            "out_refund_no": refund_no,
            "reason": reason,
            "amount": {
                "refund": amount.cents(),
                "total": payment.amount.cents(),
                "currency": payment.currency,
            },
            "notify_url": format!("{}/refund", self.config.notify_url),
        });

        let response: RefundResponse = self
            .request(Method::POST, "/v3/refund/domestic/refunds", Some(body))
            .await?;

        Ok(ProviderRefund {
            refund_no: refund_no.to_string(),
            provider_refund_id: response.refund_id,
            status: ProviderRefundStatus::parse(&response.status),
        })
    }
}
