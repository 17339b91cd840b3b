use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub location_ttl: Duration,
    pub dispatch: DispatchConfig,
    pub dispatch_queue_size: usize,
    pub connection_buffer_size: usize,
}

/// Knobs shared by the booking lifecycle and the background dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub match_radius_km: f64,
    /// Fixed demand factor; `None` derives it from pending bookings and idle drivers.
    pub demand_factor: Option<f64>,
    pub sweep_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            match_radius_km: 10.0,
            demand_factor: None,
            sweep_interval: Duration::from_millis(5_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact or json"
                )));
            }
        };

        let demand_factor = parse_optional::<f64>("DEMAND_FACTOR")?;
        if let Some(factor) = demand_factor {
            if !(0.0..=100.0).contains(&factor) {
                return Err(AppError::Internal(format!(
                    "invalid DEMAND_FACTOR: {factor}, expected 0..=100"
                )));
            }
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3001)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "local-development-secret".to_string()),
            location_ttl: Duration::from_secs(parse_or_default("LOCATION_TTL_SECS", 3_600)?),
            dispatch: DispatchConfig {
                match_radius_km: parse_or_default("MATCH_RADIUS_KM", 10.0)?,
                demand_factor,
                sweep_interval: Duration::from_millis(parse_or_default(
                    "DISPATCH_INTERVAL_MS",
                    5_000,
                )?),
            },
            dispatch_queue_size: parse_or_default("DISPATCH_QUEUE_SIZE", 1024)?,
            connection_buffer_size: parse_or_default("CONNECTION_BUFFER_SIZE", 64)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(key)?.unwrap_or(default))
}

fn parse_optional<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(None),
    }
}
