use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_SESSION_TTL_SECS: u64 = 2 * 60 * 60;
const DEFAULT_DELIVERY_RADIUS_KM: f64 = 25.0;
const DEFAULT_CONFLICT_RETRIES: u32 = 3;
const DEFAULT_READY_MINUTES: u32 = 30;
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
const DEFAULT_CURRENCY: &str = "SAR";

/// How automatic discounts from several live campaigns combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountStacking {
    /// Every qualifying campaign contributes.
    #[default]
    StackAll,
    /// Only the largest qualifying discount applies.
    BestSingle,
}

/// One row of the per-country VAT table.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct VatRateConfig {
    #[validate(length(equal = 2))]
    pub country_code: String,
    pub enabled: bool,
    /// Percentage, 0 to 100.
    pub rate: Decimal,
    #[serde(default = "default_vat_label")]
    pub label: String,
    #[validate(length(equal = 3))]
    pub currency_code: String,
}

/// Checkout engine settings (`[checkout]` table, `APP__CHECKOUT__*` overrides)
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CheckoutSettings {
    /// Lifetime of a checkout session from creation
    #[serde(default = "default_session_ttl_secs")]
    #[validate(range(min = 60, max = 86400))]
    pub session_ttl_secs: u64,

    /// Hard delivery radius around each kitchen
    #[serde(default = "default_delivery_radius_km")]
    #[validate(custom = "validate_radius")]
    pub max_delivery_radius_km: f64,

    /// Optimistic-concurrency retries before a mutation gives up
    #[serde(default = "default_conflict_retries")]
    #[validate(range(max = 10))]
    pub max_conflict_retries: u32,

    #[serde(default)]
    pub discount_stacking: DiscountStacking,

    /// Fallback preparation time for lines with a missing or unreadable ready-time
    #[serde(default = "default_ready_minutes")]
    #[validate(range(min = 1, max = 1440))]
    pub default_ready_minutes: u32,

    /// How often expired sessions are purged
    #[serde(default = "default_reaper_interval_secs")]
    #[validate(range(min = 1))]
    pub reaper_interval_secs: u64,

    /// Currency reported for countries without a VAT entry
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    #[serde(default = "default_vat_rates")]
    pub vat_rates: Vec<VatRateConfig>,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_delivery_radius_km: DEFAULT_DELIVERY_RADIUS_KM,
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
            discount_stacking: DiscountStacking::default(),
            default_ready_minutes: DEFAULT_READY_MINUTES,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            default_currency: default_currency(),
            vat_rates: default_vat_rates(),
        }
    }
}

impl CheckoutSettings {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    fn validate_vat_rates(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        for entry in &self.vat_rates {
            entry.validate()?;
            if entry.rate < Decimal::ZERO || entry.rate > Decimal::ONE_HUNDRED {
                let mut err = ValidationError::new("vat_rate");
                err.message = Some(
                    format!(
                        "VAT rate for {} must be between 0 and 100",
                        entry.country_code
                    )
                    .into(),
                );
                errors.add("vat_rates", err);
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// Capacity of the in-process event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Per-request timeout applied by the HTTP layer
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub checkout: CheckoutSettings,
}

impl AppConfig {
    /// Creates a new configuration with checkout defaults
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
            checkout: CheckoutSettings::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if self.is_production() && self.database_url.starts_with("sqlite:") {
            let mut err = ValidationError::new("database_url_production");
            err.message =
                Some("SQLite is for development only. Set APP__DATABASE_URL to Postgres.".into());
            errors.add("database_url", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    20
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    10
}
fn default_db_idle_timeout_secs() -> u64 {
    300
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_session_ttl_secs() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_delivery_radius_km() -> f64 {
    DEFAULT_DELIVERY_RADIUS_KM
}

fn default_conflict_retries() -> u32 {
    DEFAULT_CONFLICT_RETRIES
}

fn default_ready_minutes() -> u32 {
    DEFAULT_READY_MINUTES
}

fn default_reaper_interval_secs() -> u64 {
    DEFAULT_REAPER_INTERVAL_SECS
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_vat_label() -> String {
    "VAT".to_string()
}

fn vat_rate(country: &str, enabled: bool, rate: Decimal, currency: &str) -> VatRateConfig {
    VatRateConfig {
        country_code: country.to_string(),
        enabled,
        rate,
        label: default_vat_label(),
        currency_code: currency.to_string(),
    }
}

/// Built-in VAT table for the Gulf markets
pub fn default_vat_rates() -> Vec<VatRateConfig> {
    vec![
        vat_rate("SA", true, dec!(15), "SAR"),
        vat_rate("AE", true, dec!(5), "AED"),
        vat_rate("BH", true, dec!(10), "BHD"),
        vat_rate("OM", true, dec!(5), "OMR"),
        vat_rate("KW", false, Decimal::ZERO, "KWD"),
        vat_rate("QA", false, Decimal::ZERO, "QAR"),
    ]
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_radius(radius: f64) -> Result<(), ValidationError> {
    if !radius.is_finite() || radius <= 0.0 || radius > 200.0 {
        let mut err = ValidationError::new("max_delivery_radius_km");
        err.message = Some("max_delivery_radius_km must be between 0 and 200".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("foodie_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://foodie-checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("auto_migrate", true)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.checkout.validate().map_err(|e| {
        error!("Checkout configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.checkout.validate_vat_rates().map_err(|e| {
        error!("VAT table validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
