//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use booking::MonitorConfig;
use booking::reaper::DEFAULT_REAPER_INTERVAL;
use domain::DEFAULT_ORDER_TTL_MINUTES;
use payments::WechatPayConfig;
use payments::wechat::DEFAULT_BASE_URL;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// WeChat Pay settings. Key material is read from files when the provider
/// is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WechatSettings {
    pub app_id: String,
    pub mch_id: String,
    pub api_v3_key: String,
    pub merchant_serial_no: String,
    pub notify_url: String,
    pub platform_public_key_path: PathBuf,
    pub merchant_private_key_path: Option<PathBuf>,
    pub base_url: String,
}

impl WechatSettings {
    /// Reads the key files and builds the provider configuration.
    pub fn provider_config(&self) -> std::io::Result<WechatPayConfig> {
        let platform_public_key_pem = std::fs::read_to_string(&self.platform_public_key_path)?;
        let merchant_private_key_pem = self
            .merchant_private_key_path
            .as_ref()
            .map(std::fs::read_to_string)
            .transpose()?;

        Ok(WechatPayConfig {
            app_id: self.app_id.clone(),
            mch_id: self.mch_id.clone(),
            api_v3_key: self.api_v3_key.clone(),
            platform_public_key_pem,
            merchant_private_key_pem,
            merchant_serial_no: self.merchant_serial_no.clone(),
            notify_url: self.notify_url.clone(),
            base_url: self.base_url.clone(),
            ..WechatPayConfig::default()
        })
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL; in-memory stores when unset
/// - `REAPER_INTERVAL_SECS` (default 60), `ORDER_TTL_SECS` (default 900)
/// - `INVENTORY_ALERT_THRESHOLD`, `INVENTORY_ALERT_INTERVAL_SECS`,
///   `INVENTORY_ALERT_COOLDOWN_SECS`
/// - `WECHATPAY_MCH_ID` enables WeChat Pay, together with `WECHATPAY_APP_ID`,
///   `WECHATPAY_API_V3_KEY`, `WECHATPAY_SERIAL_NO`, `WECHATPAY_NOTIFY_URL`,
///   `WECHATPAY_PLATFORM_KEY_PATH`, `WECHATPAY_PRIVATE_KEY_PATH` and
///   `WECHATPAY_BASE_URL`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub reaper_interval: Duration,
    pub order_ttl: Duration,
    pub inventory_alert: MonitorConfig,
    pub wechat: Option<WechatSettings>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            var(key)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let wechat = var("WECHATPAY_MCH_ID").map(|mch_id| WechatSettings {
            app_id: var("WECHATPAY_APP_ID").unwrap_or_default(),
            mch_id,
            api_v3_key: var("WECHATPAY_API_V3_KEY").unwrap_or_default(),
            merchant_serial_no: var("WECHATPAY_SERIAL_NO").unwrap_or_default(),
            notify_url: var("WECHATPAY_NOTIFY_URL").unwrap_or_default(),
            platform_public_key_path: var("WECHATPAY_PLATFORM_KEY_PATH")
                .unwrap_or_default()
                .into(),
            merchant_private_key_path: var("WECHATPAY_PRIVATE_KEY_PATH").map(PathBuf::from),
            base_url: var("WECHATPAY_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        });

        Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: var("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match var("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: var("DATABASE_URL").filter(|url| !url.is_empty()),
            reaper_interval: secs("REAPER_INTERVAL_SECS", defaults.reaper_interval),
            order_ttl: secs("ORDER_TTL_SECS", defaults.order_ttl),
            inventory_alert: MonitorConfig {
                threshold: var("INVENTORY_ALERT_THRESHOLD")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.inventory_alert.threshold),
                interval: secs(
                    "INVENTORY_ALERT_INTERVAL_SECS",
                    defaults.inventory_alert.interval,
                ),
                cooldown: secs(
                    "INVENTORY_ALERT_COOLDOWN_SECS",
                    defaults.inventory_alert.cooldown,
                ),
            },
            wechat,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Order TTL as a chrono duration, for checkout.
    pub fn order_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.order_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(DEFAULT_ORDER_TTL_MINUTES))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            order_ttl: Duration::from_secs(DEFAULT_ORDER_TTL_MINUTES as u64 * 60),
            inventory_alert: MonitorConfig::default(),
            wechat: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_vars(&[]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.order_ttl(), chrono::Duration::minutes(15));
        assert_eq!(config.inventory_alert.threshold, 5);
        assert!(config.wechat.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "json"),
            ("DATABASE_URL", "postgres://booking@localhost/booking"),
            ("REAPER_INTERVAL_SECS", "5"),
            ("ORDER_TTL_SECS", "600"),
            ("INVENTORY_ALERT_THRESHOLD", "2"),
            ("INVENTORY_ALERT_COOLDOWN_SECS", "3600"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://booking@localhost/booking")
        );
        assert_eq!(config.reaper_interval, Duration::from_secs(5));
        assert_eq!(config.order_ttl(), chrono::Duration::minutes(10));
        assert_eq!(config.inventory_alert.threshold, 2);
        assert_eq!(config.inventory_alert.cooldown, Duration::from_secs(3600));
        assert_eq!(
            config.inventory_alert.interval,
            MonitorConfig::default().interval
        );
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = from_vars(&[("PORT", "http"), ("REAPER_INTERVAL_SECS", "-1"), ("DATABASE_URL", "")]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_wechat_settings() {
        let config = from_vars(&[
            ("WECHATPAY_MCH_ID", "1900000001"),
            ("WECHATPAY_PLATFORM_KEY_PATH", "/etc/booking/wechatpay.pem"),
        ]);
        let wechat = config.wechat.unwrap();
        assert_eq!(wechat.mch_id, "1900000001");
        assert_eq!(
            wechat.platform_public_key_path,
            PathBuf::from("/etc/booking/wechatpay.pem")
        );
        assert!(wechat.merchant_private_key_path.is_none());
        assert_eq!(wechat.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
