use anyhow::{Context, Result, bail};
use std::env;

/// Runtime configuration, loaded from environment variables (with `.env`
/// support via dotenvy in main).
#[derive(Debug, Clone)]
pub struct Config {
    // Persistence
    pub database_url: String,

    // Tick feed (C1)
    pub feed_ws_url: String,
    pub options_channel: String,
    pub underlying_channel: String,
    pub timeframes: Vec<String>,
    pub persist_timeframes: Vec<String>,
    pub flush_lag_seconds: i64,
    pub persist_concurrency: usize,
    pub strike_gap: u32,

    // Fan-out
    pub stream_listen_addr: String,
    pub hub_queue_capacity: usize,

    // Broker proxy (C3)
    pub broker_base_url: String,
    pub broker_accounts: Vec<String>,
    pub position_sync_interval_seconds: u64,
    pub broker_cancel_timeout_seconds: u64,

    // Evaluation worker (C2)
    pub evaluation_worker_enabled: bool,
    pub ticker_service_url: String,
    pub backend_url: String,
    pub evaluation_timeout_seconds: u64,
    pub evaluation_batch_size: i64,
    pub evaluation_concurrency: usize,
    pub min_evaluation_interval: u64,

    // Notifications
    pub telegram_bot_token: String,
    pub notification_retry_attempts: u32,
    pub notification_retry_backoff_seconds: f64,
    pub global_telegram_rate_limit: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` wires in the
    /// process environment; tests pass a map.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            database_url: get("DATABASE_URL", "sqlite://data/strikeflow.db"),

            feed_ws_url: get("FEED_WS_URL", "ws://localhost:9010/stream"),
            options_channel: get("FO_OPTIONS_CHANNEL", "options"),
            underlying_channel: get("FO_UNDERLYING_CHANNEL", "underlying"),
            timeframes: parse_list(&get("FO_TIMEFRAMES", "1min,5min,15min")),
            persist_timeframes: parse_list(&get("FO_PERSIST_TIMEFRAMES", "1min")),
            flush_lag_seconds: parse_number(lookup, "FO_FLUSH_LAG_SECONDS", 5)?,
            persist_concurrency: parse_number(lookup, "FO_PERSIST_CONCURRENCY", 2)?,
            strike_gap: parse_number(lookup, "FO_STRIKE_GAP", 50)?,

            stream_listen_addr: get("STREAM_LISTEN_ADDR", "127.0.0.1:8765"),
            hub_queue_capacity: parse_number(lookup, "HUB_QUEUE_CAPACITY", 128)?,

            broker_base_url: get("BROKER_BASE_URL", "http://localhost:8080"),
            broker_accounts: parse_list(&get("BROKER_ACCOUNTS", "primary")),
            position_sync_interval_seconds: parse_number(
                lookup,
                "POSITION_SYNC_INTERVAL_SECONDS",
                15,
            )?,
            broker_cancel_timeout_seconds: parse_number(
                lookup,
                "BROKER_CANCEL_TIMEOUT_SECONDS",
                30,
            )?,

            evaluation_worker_enabled: parse_bool(lookup, "EVALUATION_WORKER_ENABLED", true)?,
            ticker_service_url: get("TICKER_SERVICE_URL", "http://localhost:8080"),
            backend_url: get("BACKEND_URL", "http://localhost:8000"),
            evaluation_timeout_seconds: parse_number(lookup, "EVALUATION_TIMEOUT_SECONDS", 5)?,
            evaluation_batch_size: parse_number(lookup, "EVALUATION_BATCH_SIZE", 100)?,
            evaluation_concurrency: parse_number(lookup, "EVALUATION_CONCURRENCY", 10)?,
            min_evaluation_interval: parse_number(lookup, "MIN_EVALUATION_INTERVAL", 10)?,

            telegram_bot_token: get("TELEGRAM_BOT_TOKEN", ""),
            notification_retry_attempts: parse_number(lookup, "NOTIFICATION_RETRY_ATTEMPTS", 3)?,
            notification_retry_backoff_seconds: parse_number(
                lookup,
                "NOTIFICATION_RETRY_BACKOFF",
                2.0,
            )?,
            global_telegram_rate_limit: parse_number(lookup, "GLOBAL_TELEGRAM_RATE_LIMIT", 30)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.timeframes.is_empty() {
            bail!("FO_TIMEFRAMES must name at least one timeframe");
        }
        if self.min_evaluation_interval < 10 {
            bail!(
                "MIN_EVALUATION_INTERVAL must be >= 10 seconds, got {}",
                self.min_evaluation_interval
            );
        }
        if self.flush_lag_seconds < 1 {
            bail!("FO_FLUSH_LAG_SECONDS must be >= 1, got {}", self.flush_lag_seconds);
        }
        if self.persist_concurrency == 0 {
            bail!("FO_PERSIST_CONCURRENCY must be >= 1");
        }
        if self.broker_accounts.is_empty() {
            bail!("BROKER_ACCOUNTS must name at least one account");
        }
        Ok(())
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_number<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().with_context(|| format!("Invalid {key}: {raw}")),
        None => Ok(default),
    }
}

fn parse_bool(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("Invalid {key}: {other}"),
        },
        None => Ok(default),
    }
}
