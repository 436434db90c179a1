//! Configuration management for the booking service.
//!
//! Loads configuration from environment variables with sensible defaults.
//! The binary calls `dotenvy::dotenv()` first, so a `.env` file works too.

use crate::policy::{RefundSchedule, RefundTier};
use crate::types::Money;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range
    #[error("Invalid configuration for {key}: {reason}")]
    Invalid {
        /// Environment variable name
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP and metrics servers
    pub server: ServerConfig,
    /// `PostgreSQL`; absent URL means in-memory stores
    pub postgres: PostgresConfig,
    /// Saga timing and retries
    pub saga: SagaConfig,
    /// Timeout watchdog
    pub watchdog: WatchdogConfig,
    /// Idempotency keys
    pub idempotency: IdempotencyConfig,
    /// In-memory capacity store
    pub capacity: CapacityConfig,
    /// Default cancellation policy
    pub policy: PolicyConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Metrics server host (for Prometheus scraping)
    pub metrics_host: String,
    /// Metrics server port
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection URL
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
}

/// Saga configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Hard deadline of a saga, counted from the `SAGA_PENDING` checkpoint
    pub timeout_secs: u64,
    /// How long `StartBooking` waits for a settled outcome before answering pending
    pub response_wait_ms: u64,
    /// Attempts for reserving capacity, first call included
    pub capacity_retry_max_attempts: u32,
    /// First backoff delay for capacity calls
    pub capacity_retry_initial_delay_ms: u64,
    /// Total time budget for reserving capacity
    pub capacity_retry_budget_ms: u64,
    /// Timeout of a single payment gateway call
    pub payment_call_timeout_ms: u64,
    /// Attempts for a charge on transient errors, first call included
    pub payment_retry_max_attempts: u32,
    /// Consecutive compensation failures before alerting
    pub compensation_alert_after: u32,
    /// Backoff cap for compensation retries
    pub compensation_max_delay_ms: u64,
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// How long past the deadline an unknown payment outcome is tolerated
    pub grace_period_secs: u64,
    /// Bookings resolved per sweep
    pub batch_size: u32,
    /// How long a watchdog owns a booking it is resolving
    pub lease_secs: u64,
}

/// Idempotency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Key lifetime in seconds
    pub ttl_secs: u64,
}

/// Capacity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Write-ahead journal for the in-memory store
    pub journal_path: Option<PathBuf>,
}

/// Default cancellation policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Whether users may cancel on their own
    pub allow_user_cancel: bool,
    /// Hours before tee-off after which the full refund window closes
    pub user_cancel_deadline_hours: u32,
    /// Whether users may cancel inside the deadline, at tiered rates
    pub allow_same_day_cancel: bool,
    /// Refund tiers and fees
    pub refund_schedule: RefundSchedule,
    /// Why `REFUND_SCHEDULE` could not be parsed
    #[serde(skip)]
    pub refund_schedule_error: Option<String>,
}

/// Tiers from `REFUND_SCHEDULE` (a JSON array), fees from their own variables.
fn refund_schedule(lookup: &impl Fn(&str) -> Option<String>) -> (RefundSchedule, Option<String>) {
    let defaults = RefundSchedule::default();
    let (tiers, error) = match lookup("REFUND_SCHEDULE").filter(|raw| !raw.trim().is_empty()) {
        None => (defaults.tiers, None),
        Some(raw) => match serde_json::from_str::<Vec<RefundTier>>(&raw) {
            Ok(tiers) => (tiers, None),
            Err(err) => (defaults.tiers, Some(err.to_string())),
        },
    };
    let schedule = RefundSchedule {
        tiers,
        refund_fee: Money::won(parsed(lookup, "REFUND_FEE", defaults.refund_fee.amount())),
        refund_fee_rate_percent: parsed(lookup, "REFUND_FEE_RATE_PERCENT", defaults.refund_fee_rate_percent),
        min_refund_amount: Money::won(parsed(
            lookup,
            "MIN_REFUND_AMOUNT",
            defaults.min_refund_amount.amount(),
        )),
        admin_cancel_refund_rate: parsed(lookup, "ADMIN_CANCEL_REFUND_RATE", defaults.admin_cancel_refund_rate),
        system_cancel_refund_rate: parsed(
            lookup,
            "SYSTEM_CANCEL_REFUND_RATE",
            defaults.system_cancel_refund_rate,
        ),
    };
    (schedule, error)
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn string(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    ///
    /// Unparseable values fall back to their defaults, except a malformed
    /// `REFUND_SCHEDULE`, which [`Config::validate`] reports.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let (refund_schedule, refund_schedule_error) = refund_schedule(&lookup);
        Self {
            server: ServerConfig {
                host: string(&lookup, "HOST", "0.0.0.0"),
                port: parsed(&lookup, "PORT", 8080),
                log_level: string(&lookup, "LOG_LEVEL", "teetime_booking=info,tower_http=info"),
                metrics_host: string(&lookup, "METRICS_HOST", "0.0.0.0"),
                metrics_port: parsed(&lookup, "METRICS_PORT", 9090),
                shutdown_timeout: parsed(&lookup, "SHUTDOWN_TIMEOUT", 30),
            },
            postgres: PostgresConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
                max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS", 10),
                connect_timeout: parsed(&lookup, "DATABASE_CONNECT_TIMEOUT", 30),
            },
            saga: SagaConfig {
                timeout_secs: parsed(&lookup, "SAGA_TIMEOUT_SECS", 60),
                response_wait_ms: parsed(&lookup, "SAGA_RESPONSE_WAIT_MS", 10_000),
                capacity_retry_max_attempts: parsed(&lookup, "CAPACITY_RETRY_MAX_ATTEMPTS", 3),
                capacity_retry_initial_delay_ms: parsed(
                    &lookup,
                    "CAPACITY_RETRY_INITIAL_DELAY_MS",
                    200,
                ),
                capacity_retry_budget_ms: parsed(&lookup, "CAPACITY_RETRY_BUDGET_MS", 5_000),
                payment_call_timeout_ms: parsed(&lookup, "PAYMENT_CALL_TIMEOUT_MS", 30_000),
                payment_retry_max_attempts: parsed(&lookup, "PAYMENT_RETRY_MAX_ATTEMPTS", 3),
                compensation_alert_after: parsed(&lookup, "COMPENSATION_ALERT_AFTER", 5),
                compensation_max_delay_ms: parsed(&lookup, "COMPENSATION_MAX_DELAY_MS", 30_000),
            },
            watchdog: WatchdogConfig {
                interval_secs: parsed(&lookup, "WATCHDOG_INTERVAL_SECS", 10),
                grace_period_secs: parsed(&lookup, "WATCHDOG_GRACE_PERIOD_SECS", 120),
                batch_size: parsed(&lookup, "WATCHDOG_BATCH_SIZE", 100),
                lease_secs: parsed(&lookup, "WATCHDOG_LEASE_SECS", 30),
            },
            idempotency: IdempotencyConfig {
                ttl_secs: parsed(&lookup, "IDEMPOTENCY_TTL_SECS", 86_400),
            },
            capacity: CapacityConfig {
                journal_path: lookup("CAPACITY_JOURNAL_PATH")
                    .filter(|path| !path.trim().is_empty())
                    .map(PathBuf::from),
            },
            policy: PolicyConfig {
                allow_user_cancel: parsed(&lookup, "POLICY_ALLOW_USER_CANCEL", true),
                user_cancel_deadline_hours: parsed(&lookup, "POLICY_USER_CANCEL_DEADLINE_HOURS", 72),
                allow_same_day_cancel: parsed(&lookup, "POLICY_ALLOW_SAME_DAY_CANCEL", false),
                refund_schedule,
                refund_schedule_error,
            },
        }
    }

    /// Reject values the service cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("SAGA_TIMEOUT_SECS", self.saga.timeout_secs)?;
        positive("SAGA_RESPONSE_WAIT_MS", self.saga.response_wait_ms)?;
        positive("CAPACITY_RETRY_MAX_ATTEMPTS", u64::from(self.saga.capacity_retry_max_attempts))?;
        positive("PAYMENT_CALL_TIMEOUT_MS", self.saga.payment_call_timeout_ms)?;
        positive("PAYMENT_RETRY_MAX_ATTEMPTS", u64::from(self.saga.payment_retry_max_attempts))?;
        positive("COMPENSATION_ALERT_AFTER", u64::from(self.saga.compensation_alert_after))?;
        positive("WATCHDOG_INTERVAL_SECS", self.watchdog.interval_secs)?;
        positive("WATCHDOG_BATCH_SIZE", u64::from(self.watchdog.batch_size))?;
        positive("WATCHDOG_LEASE_SECS", self.watchdog.lease_secs)?;
        positive("IDEMPOTENCY_TTL_SECS", self.idempotency.ttl_secs)?;
        positive("DATABASE_MAX_CONNECTIONS", u64::from(self.postgres.max_connections))?;

        if self.saga.capacity_retry_budget_ms < self.saga.capacity_retry_initial_delay_ms {
            return Err(ConfigError::Invalid {
                key: "CAPACITY_RETRY_BUDGET_MS",
                reason: "must not be shorter than CAPACITY_RETRY_INITIAL_DELAY_MS".to_string(),
            });
        }
        if self.saga.compensation_max_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "COMPENSATION_MAX_DELAY_MS",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.policy.validate()
    }
}

impl PolicyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        fn percent(key: &'static str, value: u32) -> Result<(), ConfigError> {
            if value > 100 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{value} is not a percentage"),
                });
            }
            Ok(())
        }
        fn invalid_schedule(reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                key: "REFUND_SCHEDULE",
                reason: reason.into(),
            }
        }

        if let Some(error) = &self.refund_schedule_error {
            return Err(invalid_schedule(format!("not a JSON array of tiers: {error}")));
        }
        let schedule = &self.refund_schedule;
        if schedule.tiers.is_empty() {
            return Err(invalid_schedule("needs at least one tier"));
        }
        for tier in &schedule.tiers {
            if tier.refund_rate_percent > 100 {
                return Err(invalid_schedule(format!(
                    "tier '{}' refunds {} percent",
                    tier.label, tier.refund_rate_percent
                )));
            }
            if tier.max_hours_before.is_some_and(|max| max <= tier.min_hours_before) {
                return Err(invalid_schedule(format!("tier '{}' has an empty hour range", tier.label)));
            }
        }
        percent("REFUND_FEE_RATE_PERCENT", schedule.refund_fee_rate_percent)?;
        percent("ADMIN_CANCEL_REFUND_RATE", schedule.admin_cancel_refund_rate)?;
        percent("SYSTEM_CANCEL_REFUND_RATE", schedule.system_cancel_refund_rate)?;
        if schedule.refund_fee < Money::ZERO {
            return Err(ConfigError::Invalid {
                key: "REFUND_FEE",
                reason: "must not be negative".to_string(),
            });
        }
        if schedule.min_refund_amount < Money::ZERO {
            return Err(ConfigError::Invalid {
                key: "MIN_REFUND_AMOUNT",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

impl PostgresConfig {
    /// Pool acquire timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl SagaConfig {
    /// Saga deadline as a chrono duration.
    #[must_use]
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.timeout_secs).unwrap_or(i64::MAX / 1_000))
    }

    /// How long a booking request waits for the saga.
    #[must_use]
    pub const fn response_wait(&self) -> Duration {
        Duration::from_millis(self.response_wait_ms)
    }

    /// Timeout of a single payment call.
    #[must_use]
    pub const fn payment_call_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_call_timeout_ms)
    }
}

impl WatchdogConfig {
    /// Sweep interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Grace period after the saga deadline.
    #[must_use]
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX / 1_000))
    }

    /// Resolution lease length.
    #[must_use]
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lease_secs).unwrap_or(i64::MAX / 1_000))
    }
}

impl IdempotencyConfig {
    /// Key lifetime.
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX / 1_000))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.saga.timeout_secs, 60);
        assert_eq!(config.saga.capacity_retry_max_attempts, 3);
        assert_eq!(config.saga.capacity_retry_budget_ms, 5_000);
        assert_eq!(config.watchdog.interval_secs, 10);
        assert_eq!(config.idempotency.ttl_secs, 86_400);
        assert!(config.postgres.url.is_none());
        assert!(config.capacity.journal_path.is_none());
        assert_eq!(config.policy.user_cancel_deadline_hours, 72);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = config_from(&[
            ("PORT", "3000"),
            ("SAGA_TIMEOUT_SECS", "not-a-number"),
            ("DATABASE_URL", "postgres://localhost/teetime"),
            ("CAPACITY_JOURNAL_PATH", "/var/lib/teetime/capacity.jsonl"),
        ]);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.saga.timeout_secs, 60);
        assert_eq!(config.postgres.url.as_deref(), Some("postgres://localhost/teetime"));
        assert_eq!(
            config.capacity.journal_path,
            Some(PathBuf::from("/var/lib/teetime/capacity.jsonl"))
        );
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = config_from(&[("WATCHDOG_INTERVAL_SECS", "0")]);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WATCHDOG_INTERVAL_SECS", .. }));
    }

    #[test]
    fn test_validate_rejects_budget_below_first_delay() {
        let config = config_from(&[
            ("CAPACITY_RETRY_INITIAL_DELAY_MS", "500"),
            ("CAPACITY_RETRY_BUDGET_MS", "100"),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refund_schedule_from_environment() {
        let config = config_from(&[
            (
                "REFUND_SCHEDULE",
                r#"[
                    {"min_hours_before": 48, "refund_rate_percent": 90, "label": "early"},
                    {"min_hours_before": 0, "max_hours_before": 48, "refund_rate_percent": 20, "label": "late"}
                ]"#,
            ),
            ("REFUND_FEE", "1000"),
            ("REFUND_FEE_RATE_PERCENT", "5"),
            ("MIN_REFUND_AMOUNT", "3000"),
            ("ADMIN_CANCEL_REFUND_RATE", "80"),
        ]);
        assert!(config.validate().is_ok());

        let schedule = &config.policy.refund_schedule;
        assert_eq!(
            schedule.tiers,
            vec![
                RefundTier::new(48, None, 90, "early"),
                RefundTier::new(0, Some(48), 20, "late"),
            ]
        );
        assert_eq!(schedule.refund_fee, Money::won(1_000));
        assert_eq!(schedule.refund_fee_rate_percent, 5);
        assert_eq!(schedule.min_refund_amount, Money::won(3_000));
        assert_eq!(schedule.admin_cancel_refund_rate, 80);
        assert_eq!(schedule.system_cancel_refund_rate, 100);
    }

    #[test]
    fn test_refund_schedule_defaults_without_variables() {
        let config = Config::default();
        assert_eq!(config.policy.refund_schedule, RefundSchedule::default());
        assert_eq!(config.policy.refund_schedule_error, None);
    }

    #[test]
    fn test_validate_rejects_bad_refund_schedule() {
        let malformed = config_from(&[("REFUND_SCHEDULE", "[{\"label\": ")]);
        assert!(matches!(
            malformed.validate().unwrap_err(),
            ConfigError::Invalid { key: "REFUND_SCHEDULE", .. }
        ));

        let empty = config_from(&[("REFUND_SCHEDULE", "[]")]);
        assert!(matches!(
            empty.validate().unwrap_err(),
            ConfigError::Invalid { key: "REFUND_SCHEDULE", .. }
        ));

        let generous = config_from(&[(
            "REFUND_SCHEDULE",
            r#"[{"min_hours_before": 0, "refund_rate_percent": 150, "label": "too much"}]"#,
        )]);
        assert!(matches!(
            generous.validate().unwrap_err(),
            ConfigError::Invalid { key: "REFUND_SCHEDULE", .. }
        ));

        let inverted = config_from(&[(
            "REFUND_SCHEDULE",
            r#"[{"min_hours_before": 24, "max_hours_before": 12, "refund_rate_percent": 50, "label": "never"}]"#,
        )]);
        assert!(inverted.validate().is_err());

        let fee = config_from(&[("REFUND_FEE_RATE_PERCENT", "101")]);
        assert!(matches!(
            fee.validate().unwrap_err(),
            ConfigError::Invalid { key: "REFUND_FEE_RATE_PERCENT", .. }
        ));

        let negative = config_from(&[("MIN_REFUND_AMOUNT", "-1")]);
        assert!(matches!(
            negative.validate().unwrap_err(),
            ConfigError::Invalid { key: "MIN_REFUND_AMOUNT", .. }
        ));
    }
}
