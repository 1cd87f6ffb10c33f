use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Session timeout bounds, in minutes.
const MIN_SESSION_TIMEOUT: u32 = 5;
const MAX_SESSION_TIMEOUT: u32 = 120;

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub protocol: ProtocolConfig,
    pub trust: TrustConfig,
    pub checkout: CheckoutConfig,
    pub webhooks: WebhookConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Plain read-modify-write, matching the original system. Concurrent
    /// updates to the same session can lose writes.
    LastWriterWins,
    /// Compare-and-swap on a per-session version counter; a lost race
    /// surfaces as a 409 conflict instead of a silent overwrite.
    Optimistic,
}

impl Default for ConsistencyMode {
    fn default() -> Self {
        ConsistencyMode::LastWriterWins
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ProtocolConfig {
    pub enabled: bool,
    pub session_timeout_minutes: u32,
    pub whitelist_enabled: bool,
    pub whitelist_patterns: Vec<String>,
    pub require_signature: bool,
    pub debug: bool,
    #[serde(default)]
    pub consistency: ConsistencyMode,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct TrustConfig {
    pub key_id: String,
    pub private_key_pem: Option<String>,
    pub profile_cache_ttl_seconds: u64,
    pub profile_fetch_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandlerKind {
    Embedded,
    Direct,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct PaymentHandlerConfig {
    pub id: String,
    pub name: String,
    pub kind: HandlerKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct CheckoutConfig {
    /// Where an escalated session continues in the merchant's own checkout.
    pub embedded_checkout_url: String,
    pub terms_url: Option<String>,
    pub privacy_url: Option<String>,
    /// Currency applied to sessions that do not request one.
    pub currency: String,
    pub base_country: String,
    pub base_region: Option<String>,
    pub base_postcode: Option<String>,
    pub payment_handlers: Vec<PaymentHandlerConfig>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct WebhookConfig {
    pub delivery_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            protocol: ProtocolConfig::default(),
            trust: TrustConfig::default(),
            checkout: CheckoutConfig::default(),
            webhooks: WebhookConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://ucp_sessions.db".to_string(), max_connections: Some(10) }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_timeout_minutes: 30,
            whitelist_enabled: false,
            whitelist_patterns: vec![],
            require_signature: false,
            debug: false,
            consistency: ConsistencyMode::default(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            key_id: "ucp_default".to_string(),
            private_key_pem: None,
            profile_cache_ttl_seconds: 3600,
            profile_fetch_timeout_seconds: 10,
        }
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            embedded_checkout_url: "http://localhost:8080/checkout".to_string(),
            terms_url: None,
            privacy_url: None,
            currency: "USD".to_string(),
            base_country: "US".to_string(),
            base_region: None,
            base_postcode: None,
            payment_handlers: vec![
                PaymentHandlerConfig {
                    id: "embedded".to_string(),
                    name: "dev.ucp.embedded_checkout".to_string(),
                    kind: HandlerKind::Embedded,
                    title: "Hosted checkout".to_string(),
                    description: Some("Complete payment in the merchant's own checkout".to_string()),
                },
                PaymentHandlerConfig {
                    id: "card".to_string(),
                    name: "dev.ucp.card_on_file".to_string(),
                    kind: HandlerKind::Direct,
                    title: "Card on file".to_string(),
                    description: None,
                },
            ],
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { delivery_timeout_seconds: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: Some("text".to_string()) }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| crate::error::UcpError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| crate::error::UcpError::Config(format!("Failed to parse config file: {}", e)))?;

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database.url = db_url;
        }

        if let Ok(key_pem) = std::env::var("UCP_PRIVATE_KEY_PEM") {
            config.trust.private_key_pem = Some(key_pem);
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Clamps out-of-range values instead of rejecting them.
    pub fn normalize(&mut self) {
        let timeout = self.protocol.session_timeout_minutes;
        let clamped = timeout.clamp(MIN_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT);
        if clamped != timeout {
            tracing::warn!(
                "session_timeout_minutes {} outside [{}, {}], clamping to {}",
                timeout,
                MIN_SESSION_TIMEOUT,
                MAX_SESSION_TIMEOUT,
                clamped
            );
            self.protocol.session_timeout_minutes = clamped;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(crate::error::UcpError::Config("Server port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(crate::error::UcpError::Config("Database URL cannot be empty".to_string()));
        }

        if self.trust.key_id.is_empty() {
            return Err(crate::error::UcpError::Config("Signing key ID cannot be empty".to_string()));
        }

        if self.checkout.base_country.is_empty() {
            return Err(crate::error::UcpError::Config("Store base country cannot be empty".to_string()));
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn payment_handler(&self, handler_id: &str) -> Option<&PaymentHandlerConfig> {
        self.checkout.payment_handlers.iter().find(|h| h.id == handler_id)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| crate::error::UcpError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| crate::error::UcpError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
