use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversion::ConversionType;
use crate::forecast::ForecastSettings;
use crate::tables::ConversionValueTable;

pub const DEFAULT_CONFIG_FILE: &str = "funnel.toml";
pub const NESTED_CONFIG_FILE: &str = "config/funnel.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub experiments: ExperimentsConfig,
    pub forecast: ForecastConfig,
    pub conversion_values: ConversionValueTable,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Defaults applied to new variant tests when the request leaves them out.
#[derive(Clone, Debug)]
pub struct ExperimentsConfig {
    pub default_confidence_level: f64,
    pub default_target_sample_size: u32,
    pub default_traffic_allocation: u8,
}

#[derive(Clone, Debug)]
pub struct ForecastConfig {
    pub ttl_days: u32,
    pub window_days: u32,
    pub contact_gap_days: u32,
    pub competitor_activity: f64,
}

impl ForecastConfig {
    pub fn settings(&self) -> ForecastSettings {
        ForecastSettings {
            ttl_days: self.ttl_days,
            window_days: self.window_days,
            contact_gap_days: self.contact_gap_days,
            competitor_activity: self.competitor_activity,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        let forecast = ForecastSettings::default();
        Self {
            database: DatabaseConfig {
                url: "sqlite://funnel.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            experiments: ExperimentsConfig {
                default_confidence_level: 0.95,
                default_target_sample_size: 1_000,
                default_traffic_allocation: 100,
            },
            forecast: ForecastConfig {
                ttl_days: forecast.ttl_days,
                window_days: forecast.window_days,
                contact_gap_days: forecast.contact_gap_days,
                competitor_activity: forecast.competitor_activity,
            },
            conversion_values: ConversionValueTable::default(),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(experiments) = patch.experiments {
            if let Some(level) = experiments.default_confidence_level {
                self.experiments.default_confidence_level = level;
            }
            if let Some(size) = experiments.default_target_sample_size {
                self.experiments.default_target_sample_size = size;
            }
            if let Some(allocation) = experiments.default_traffic_allocation {
                self.experiments.default_traffic_allocation = allocation;
            }
        }

        if let Some(forecast) = patch.forecast {
            if let Some(ttl_days) = forecast.ttl_days {
                self.forecast.ttl_days = ttl_days;
            }
            if let Some(window_days) = forecast.window_days {
                self.forecast.window_days = window_days;
            }
            if let Some(contact_gap_days) = forecast.contact_gap_days {
                self.forecast.contact_gap_days = contact_gap_days;
            }
            if let Some(competitor_activity) = forecast.competitor_activity {
                self.forecast.competitor_activity = competitor_activity;
            }
        }

        if let Some(values) = patch.conversion_values {
            for (conversion_type, value) in values.entries() {
                if let Some(value) = value {
                    self.set_conversion_value(conversion_type, value);
                }
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FUNNEL_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FUNNEL_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("FUNNEL_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FUNNEL_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("FUNNEL_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FUNNEL_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("FUNNEL_SERVER_PORT") {
            self.server.port = parse_u16("FUNNEL_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("FUNNEL_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("FUNNEL_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("FUNNEL_LOGGING_LEVEL").or_else(|| read_env("FUNNEL_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FUNNEL_LOGGING_FORMAT").or_else(|| read_env("FUNNEL_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("FUNNEL_EXPERIMENTS_DEFAULT_CONFIDENCE_LEVEL") {
            self.experiments.default_confidence_level =
                parse_f64("FUNNEL_EXPERIMENTS_DEFAULT_CONFIDENCE_LEVEL", &value)?;
        }
        if let Some(value) = read_env("FUNNEL_EXPERIMENTS_DEFAULT_TARGET_SAMPLE_SIZE") {
            self.experiments.default_target_sample_size =
                parse_u32("FUNNEL_EXPERIMENTS_DEFAULT_TARGET_SAMPLE_SIZE", &value)?;
        }
        if let Some(value) = read_env("FUNNEL_EXPERIMENTS_DEFAULT_TRAFFIC_ALLOCATION") {
            self.experiments.default_traffic_allocation =
                parse_u8("FUNNEL_EXPERIMENTS_DEFAULT_TRAFFIC_ALLOCATION", &value)?;
        }

        if let Some(value) = read_env("FUNNEL_FORECAST_TTL_DAYS") {
            self.forecast.ttl_days = parse_u32("FUNNEL_FORECAST_TTL_DAYS", &value)?;
        }
        if let Some(value) = read_env("FUNNEL_FORECAST_WINDOW_DAYS") {
            self.forecast.window_days = parse_u32("FUNNEL_FORECAST_WINDOW_DAYS", &value)?;
        }
        if let Some(value) = read_env("FUNNEL_FORECAST_CONTACT_GAP_DAYS") {
            self.forecast.contact_gap_days =
                parse_u32("FUNNEL_FORECAST_CONTACT_GAP_DAYS", &value)?;
        }
        if let Some(value) = read_env("FUNNEL_FORECAST_COMPETITOR_ACTIVITY") {
            self.forecast.competitor_activity =
                parse_f64("FUNNEL_FORECAST_COMPETITOR_ACTIVITY", &value)?;
        }

        for conversion_type in ConversionType::ALL {
            let key =
                format!("FUNNEL_CONVERSION_VALUES_{}", conversion_type.as_str().to_uppercase());
            if let Some(value) = read_env(&key) {
                let value = parse_decimal(&key, &value)?;
                self.set_conversion_value(conversion_type, value);
            }
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    fn set_conversion_value(&mut self, conversion_type: ConversionType, value: Decimal) {
        let table = std::mem::take(&mut self.conversion_values);
        self.conversion_values = table.with_value(conversion_type, value);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_experiments(&self.experiments)?;
        validate_forecast(&self.forecast)?;
        validate_conversion_values(&self.conversion_values)?;
        Ok(())
    }
}

/// The file `load` reads: the explicit path, else `funnel.toml`, else `config/funnel.toml`.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from(NESTED_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_experiments(experiments: &ExperimentsConfig) -> Result<(), ConfigError> {
    let level = experiments.default_confidence_level;
    if !(level > 0.0 && level < 1.0) {
        return Err(ConfigError::Validation(
            "experiments.default_confidence_level must be strictly between 0 and 1".to_string(),
        ));
    }

    if experiments.default_target_sample_size == 0 {
        return Err(ConfigError::Validation(
            "experiments.default_target_sample_size must be greater than zero".to_string(),
        ));
    }

    if experiments.default_traffic_allocation > 100 {
        return Err(ConfigError::Validation(
            "experiments.default_traffic_allocation must be in range 0..=100".to_string(),
        ));
    }

    Ok(())
}

fn validate_forecast(forecast: &ForecastConfig) -> Result<(), ConfigError> {
    if forecast.ttl_days == 0 {
        return Err(ConfigError::Validation(
            "forecast.ttl_days must be greater than zero".to_string(),
        ));
    }

    if forecast.window_days == 0 {
        return Err(ConfigError::Validation(
            "forecast.window_days must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=100.0).contains(&forecast.competitor_activity) {
        return Err(ConfigError::Validation(
            "forecast.competitor_activity must be in range 0..=100".to_string(),
        ));
    }

    Ok(())
}

fn validate_conversion_values(values: &ConversionValueTable) -> Result<(), ConfigError> {
    for conversion_type in ConversionType::ALL {
        if values.value_of(conversion_type) < Decimal::ZERO {
            return Err(ConfigError::Validation(format!(
                "conversion_values.{} must not be negative",
                conversion_type.as_str()
            )));
        }
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u8(key: &str, value: &str) -> Result<u8, ConfigError> {
    value.trim().parse::<u8>().map_err(|_| invalid_override(key, value))
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| invalid_override(key, value))
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(value.trim()).map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    experiments: Option<ExperimentsPatch>,
    forecast: Option<ForecastPatch>,
    conversion_values: Option<ConversionValuesPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct ExperimentsPatch {
    default_confidence_level: Option<f64>,
    default_target_sample_size: Option<u32>,
    default_traffic_allocation: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct ForecastPatch {
    ttl_days: Option<u32>,
    window_days: Option<u32>,
    contact_gap_days: Option<u32>,
    competitor_activity: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversionValuesPatch {
    call: Option<Decimal>,
    form: Option<Decimal>,
    cta_click: Option<Decimal>,
    email: Option<Decimal>,
    booking: Option<Decimal>,
    review: Option<Decimal>,
}

impl ConversionValuesPatch {
    fn entries(self) -> [(ConversionType, Option<Decimal>); 6] {
        [
            (ConversionType::Call, self.call),
            (ConversionType::Form, self.form),
            (ConversionType::CtaClick, self.cta_click),
            (ConversionType::Email, self.email),
            (ConversionType::Booking, self.booking),
            (ConversionType::Review, self.review),
        ]
    }
}
