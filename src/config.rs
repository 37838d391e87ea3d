use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const BROKER_ENABLED: &str = "BROKER_ENABLED";
const BROKER_BOOTSTRAP_SERVERS: &str = "BROKER_BOOTSTRAP_SERVERS";
const ORDER_EVENT_TOPIC: &str = "ORDER_EVENT_TOPIC";
const BROKER_CONSUMER_GROUP: &str = "BROKER_CONSUMER_GROUP";
const BROKER_CLIENT_ID: &str = "BROKER_CLIENT_ID";
const BROKER_CONNECT_TIMEOUT_MS: &str = "BROKER_CONNECT_TIMEOUT_MS";
const BROKER_PUBLISH_TIMEOUT_MS: &str = "BROKER_PUBLISH_TIMEOUT_MS";
const BROKER_CLOSE_TIMEOUT_MS: &str = "BROKER_CLOSE_TIMEOUT_MS";
const BROKER_CONNECT_ATTEMPTS: &str = "BROKER_CONNECT_ATTEMPTS";
const CONSUMER_MAX_DELIVERIES: &str = "CONSUMER_MAX_DELIVERIES";
const CONSUMER_REDELIVERY_DELAY_MS: &str = "CONSUMER_REDELIVERY_DELAY_MS";
const MAIL_ENABLED: &str = "MAIL_ENABLED";
const METRICS_PORT: &str = "METRICS_PORT";

pub const DEFAULT_ORDER_EVENT_TOPIC: &str = "order-event-topic";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Broker connection and consumer settings.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub enabled: bool,
    pub bootstrap_servers: String,
    pub topic: String,
    pub consumer_group: String,
    pub client_id: String,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub close_timeout: Duration,
    pub connect_attempts: u32,
    pub max_deliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bootstrap_servers: "127.0.0.1:9092".to_string(),
            topic: DEFAULT_ORDER_EVENT_TOPIC.to_string(),
            consumer_group: "order-events-consumer".to_string(),
            client_id: "order-events".to_string(),
            connect_timeout: Duration::from_millis(3000),
            publish_timeout: Duration::from_millis(5000),
            close_timeout: Duration::from_millis(5000),
            connect_attempts: 2,
            max_deliveries: 5,
            redelivery_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub messaging: MessagingConfig,
    pub mail_enabled: bool,
    /// Port for the /metrics and /health endpoints; no server when unset
    pub metrics_port: Option<u16>,
}

impl AppConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = MessagingConfig::default();
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let messaging = MessagingConfig {
            enabled: parse_bool(BROKER_ENABLED, lookup(BROKER_ENABLED), defaults.enabled)?,
            bootstrap_servers: text(BROKER_BOOTSTRAP_SERVERS, &defaults.bootstrap_servers),
            topic: text(ORDER_EVENT_TOPIC, &defaults.topic),
            consumer_group: text(BROKER_CONSUMER_GROUP, &defaults.consumer_group),
            client_id: text(BROKER_CLIENT_ID, &defaults.client_id),
            connect_timeout: parse_timeout(
                BROKER_CONNECT_TIMEOUT_MS,
                lookup(BROKER_CONNECT_TIMEOUT_MS),
                defaults.connect_timeout,
            )?,
            publish_timeout: parse_timeout(
                BROKER_PUBLISH_TIMEOUT_MS,
                lookup(BROKER_PUBLISH_TIMEOUT_MS),
                defaults.publish_timeout,
            )?,
            close_timeout: parse_timeout(
                BROKER_CLOSE_TIMEOUT_MS,
                lookup(BROKER_CLOSE_TIMEOUT_MS),
                defaults.close_timeout,
            )?,
            connect_attempts: parse_positive(
                BROKER_CONNECT_ATTEMPTS,
                lookup(BROKER_CONNECT_ATTEMPTS),
                defaults.connect_attempts,
            )?,
            max_deliveries: parse_positive(
                CONSUMER_MAX_DELIVERIES,
                lookup(CONSUMER_MAX_DELIVERIES),
                defaults.max_deliveries,
            )?,
            redelivery_delay: parse_millis(
                CONSUMER_REDELIVERY_DELAY_MS,
                lookup(CONSUMER_REDELIVERY_DELAY_MS),
                defaults.redelivery_delay,
            )?,
        };

        let mail_enabled = parse_bool(MAIL_ENABLED, lookup(MAIL_ENABLED), true)?;
        let metrics_port = match lookup(METRICS_PORT).filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(parse_value::<u16>(METRICS_PORT, &raw)?),
            None => None,
        };

        Ok(Self {
            messaging,
            mail_enabled,
            metrics_port,
        })
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_millis(
    key: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match raw.filter(|v| !v.trim().is_empty()) {
        Some(raw) => parse_value::<u64>(key, &raw).map(Duration::from_millis),
        None => Ok(default),
    }
}

/// Zero is rejected: librdkafka reads a zero timeout as "wait forever".
fn parse_timeout(
    key: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let original = raw.clone().unwrap_or_default();
    let timeout = parse_millis(key, raw, default)?;
    if timeout.is_zero() {
        return Err(ConfigError::Invalid {
            key,
            value: original,
            reason: "timeout must be at least 1ms".to_string(),
        });
    }
    Ok(timeout)
}

fn parse_positive(key: &'static str, raw: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match raw.filter(|v| !v.trim().is_empty()) {
        Some(raw) => {
            let value = parse_value::<u32>(key, &raw)?;
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: raw,
                    reason: "must be at least 1".to_string(),
                });
            }
            Ok(value)
        }
        None => Ok(default),
    }
}
