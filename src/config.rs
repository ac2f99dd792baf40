use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DOMESTIC_COUNTRY: &str = "VN";
const DEFAULT_LOCAL_CURRENCY: &str = "VND";
const DEFAULT_FOREIGN_CURRENCY: &str = "USD";
const DEFAULT_QUANTITY_SCALE: u32 = 4;
const DEFAULT_MONEY_SCALE: u32 = 2;
const DEFAULT_UNIT_COST_SCALE: u32 = 6;
const MAX_DECIMAL_SCALE: u32 = 12;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Country whose materials count as originating (ISO 3166-1 alpha-2)
    #[serde(default = "default_domestic_country")]
    #[validate(custom = "validate_country_code")]
    pub domestic_country: String,

    /// Currency materials are purchased in
    #[serde(default = "default_local_currency")]
    #[validate(length(min = 3, max = 3))]
    pub local_currency: String,

    /// Currency certificates are declared in
    #[serde(default = "default_foreign_currency")]
    #[validate(length(min = 3, max = 3))]
    pub foreign_currency: String,

    /// Decimal places for allocated quantities
    #[serde(default = "default_quantity_scale")]
    #[validate(custom = "validate_scale")]
    pub quantity_scale: u32,

    /// Decimal places for line values in either currency
    #[serde(default = "default_money_scale")]
    #[validate(custom = "validate_scale")]
    pub money_scale: u32,

    /// Decimal places for converted unit costs
    #[serde(default = "default_unit_cost_scale")]
    #[validate(custom = "validate_scale")]
    pub unit_cost_scale: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            event_channel_capacity: default_event_channel_capacity(),
            domestic_country: default_domestic_country(),
            local_currency: default_local_currency(),
            foreign_currency: default_foreign_currency(),
            quantity_scale: default_quantity_scale(),
            money_scale: default_money_scale(),
            unit_cost_scale: default_unit_cost_scale(),
        }
    }
}

impl AppConfig {
    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn allocation_settings(&self) -> AllocationSettings {
        AllocationSettings {
            quantity_scale: self.quantity_scale,
            money_scale: self.money_scale,
            unit_cost_scale: self.unit_cost_scale,
        }
    }

    pub fn origin_settings(&self) -> OriginSettings {
        OriginSettings {
            domestic_country: self.domestic_country.clone(),
            percentage_scale: 2,
        }
    }
}

/// Rounding scales used by the consumption allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationSettings {
    pub quantity_scale: u32,
    pub money_scale: u32,
    pub unit_cost_scale: u32,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            quantity_scale: DEFAULT_QUANTITY_SCALE,
            money_scale: DEFAULT_MONEY_SCALE,
            unit_cost_scale: DEFAULT_UNIT_COST_SCALE,
        }
    }
}

/// Settings the origin evaluator depends on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginSettings {
    pub domestic_country: String,
    pub percentage_scale: u32,
}

impl Default for OriginSettings {
    fn default() -> Self {
        Self {
            domestic_country: DEFAULT_DOMESTIC_COUNTRY.to_string(),
            percentage_scale: 2,
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

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_domestic_country() -> String {
    DEFAULT_DOMESTIC_COUNTRY.to_string()
}

fn default_local_currency() -> String {
    DEFAULT_LOCAL_CURRENCY.to_string()
}

fn default_foreign_currency() -> String {
    DEFAULT_FOREIGN_CURRENCY.to_string()
}

fn default_quantity_scale() -> u32 {
    DEFAULT_QUANTITY_SCALE
}

fn default_money_scale() -> u32 {
    DEFAULT_MONEY_SCALE
}

fn default_unit_cost_scale() -> u32 {
    DEFAULT_UNIT_COST_SCALE
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

fn validate_country_code(code: &str) -> Result<(), ValidationError> {
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("domestic_country");
        err.message = Some("Must be an ISO 3166-1 alpha-2 code".into());
        Err(err)
    }
}

fn validate_scale(scale: u32) -> Result<(), ValidationError> {
    if scale > MAX_DECIMAL_SCALE {
        let mut err = ValidationError::new("scale");
        err.message = Some("Decimal scales above 12 places are not supported".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("origin_api={}", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
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
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("domestic_country", DEFAULT_DOMESTIC_COUNTRY)?
        .set_default("local_currency", DEFAULT_LOCAL_CURRENCY)?
        .set_default("foreign_currency", DEFAULT_FOREIGN_CURRENCY)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
