//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use allocation::{ConsumerConfig, CouponStrategy};
use coordination::LockOptions;
use saga::{ReservationMode, SettlementConfig};
use thiserror::Error;

/// A variable was set to something that does not parse.
#[derive(Debug, Error)]
#[error("invalid value '{value}' for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL ledger; unset means in-memory
/// - `REDIS_URL`: Redis locks and waiting lists; unset means in-memory
/// - `COUPON_STRATEGY`: `row-lock`, `conditional`, `queue` or `waiting-list`
/// - `STOCK_RESERVATION`: `conditional` or `sorted-locks`
/// - `QUEUE_POLL_INTERVAL_MS`, `QUEUE_BACKLOG_INTERVAL_SECS`,
///   `QUEUE_STUCK_THRESHOLD_SECS`, `QUEUE_AUTO_REQUEUE`
/// - `WAITING_LIST_TTL_SECS`
/// - `LOCK_WAIT_MS`, `LOCK_LEASE_MS`
/// - `RANKING_RESYNC_INTERVAL_SECS`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub coupon_strategy: CouponStrategy,
    pub stock_reservation: ReservationMode,
    pub poll_interval: Duration,
    pub backlog_interval: Duration,
    pub stuck_threshold: Duration,
    pub auto_requeue: bool,
    pub waiting_list_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub ranking_resync_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse(&get, "PORT")?.unwrap_or(defaults.port),
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: get("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            coupon_strategy: parse(&get, "COUPON_STRATEGY")?.unwrap_or(defaults.coupon_strategy),
            stock_reservation: parse(&get, "STOCK_RESERVATION")?
                .unwrap_or(defaults.stock_reservation),
            poll_interval: parse(&get, "QUEUE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            backlog_interval: parse(&get, "QUEUE_BACKLOG_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.backlog_interval),
            stuck_threshold: parse(&get, "QUEUE_STUCK_THRESHOLD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stuck_threshold),
            auto_requeue: parse(&get, "QUEUE_AUTO_REQUEUE")?.unwrap_or(defaults.auto_requeue),
            waiting_list_ttl: parse(&get, "WAITING_LIST_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.waiting_list_ttl),
            lock_wait: parse(&get, "LOCK_WAIT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_wait),
            lock_lease: parse(&get, "LOCK_LEASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_lease),
            ranking_resync_interval: parse(&get, "RANKING_RESYNC_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.ranking_resync_interval),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: self.poll_interval,
            backlog_interval: self.backlog_interval,
            stuck_threshold: self.stuck_threshold,
            auto_requeue: self.auto_requeue,
            ..ConsumerConfig::default()
        }
    }

    pub fn settlement_config(&self) -> SettlementConfig {
        SettlementConfig {
            reservation: self.stock_reservation,
            lock_wait: self.lock_wait,
            lock_lease: self.lock_lease,
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            wait: self.lock_wait,
            lease: self.lock_lease,
            ..LockOptions::default()
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

impl Default for Config {
    fn default() -> Self {
        let consumer = ConsumerConfig::default();
        let settlement = SettlementConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            redis_url: None,
            coupon_strategy: CouponStrategy::default(),
            stock_reservation: settlement.reservation,
            poll_interval: consumer.poll_interval,
            backlog_interval: consumer.backlog_interval,
            stuck_threshold: consumer.stuck_threshold,
            auto_requeue: consumer.auto_requeue,
            waiting_list_ttl: coordination::DEFAULT_WAITING_TTL,
            lock_wait: settlement.lock_wait,
            lock_lease: settlement.lock_lease,
            ranking_resync_interval: Duration::from_secs(3600),
        }
    }
}
