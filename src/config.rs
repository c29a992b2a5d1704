// src/config.rs
use std::time::Duration;

use anyhow::{Context, Result};

use crate::types::GasPrice;

/// Tunables of the client. Every field can be overridden at construction;
/// [`ClientConfig::from_env`] reads `BALLOT_*` variables on top of the defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Retries after the first attempt for transient write failures.
    pub max_retries: u32,
    /// Base of the exponential backoff: `retry_delay * 2^attempt`.
    pub retry_delay: Duration,
    pub cache_ttl: Duration,
    /// Ceiling applied to the ledger's current gas price.
    pub max_gas_price: GasPrice,
    pub gas_buffer_multiplier: f64,
    /// Gas limit used when estimation fails for a non-revert reason.
    pub default_gas_limit: u64,
    /// Parallel reads per batch when fetching many voters.
    pub batch_size: usize,
    pub event_polling_interval: Duration,
    /// How long a locally tracked nonce is trusted before re-fetching.
    pub nonce_cache_ttl: Duration,
    pub confirmation_timeout: Duration,
    pub confirmation_poll_interval: Duration,
    /// Block depth at which a mined transaction counts as confirmed (1 = mined).
    pub confirmations: u64,
    pub resubscribe_delay: Duration,
    pub max_resubscribe_delay: Duration,
    pub history_limit: usize,
    pub revert_message_max_len: usize,
    /// How often the monitor checks receipts of writes nobody is waiting on.
    pub receipt_sweep_interval: Duration,
    /// Unattended writes without a receipt for this long leave the pending set.
    pub pending_max_age: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
            cache_ttl: Duration::from_millis(30_000),
            // 100 gwei.
            max_gas_price: 100_000_000_000,
            gas_buffer_multiplier: 1.2,
            default_gas_limit: 500_000,
            batch_size: 10,
            event_polling_interval: Duration::from_millis(5_000),
            nonce_cache_ttl: Duration::from_secs(10),
            confirmation_timeout: Duration::from_secs(120),
            confirmation_poll_interval: Duration::from_secs(2),
            confirmations: 1,
            resubscribe_delay: Duration::from_secs(1),
            max_resubscribe_delay: Duration::from_secs(60),
            history_limit: 100,
            revert_message_max_len: 100,
            receipt_sweep_interval: Duration::from_secs(5),
            pending_max_age: Duration::from_secs(600),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {name}: `{raw}`")),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

impl ClientConfig {
    /// Defaults overridden by environment variables. Call `dotenvy::dotenv()`
    /// first to pick up a `.env` file.
    ///
    /// Durations are given in milliseconds.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = env_parse("BALLOT_MAX_RETRIES")? {
            cfg.max_retries = v;
        }
        if let Some(v) = env_millis("BALLOT_RETRY_DELAY_MS")? {
            cfg.retry_delay = v;
        }
        if let Some(v) = env_millis("BALLOT_CACHE_TTL_MS")? {
            cfg.cache_ttl = v;
        }
        if let Some(v) = env_parse("BALLOT_MAX_GAS_PRICE")? {
            cfg.max_gas_price = v;
        }
        if let Some(v) = env_parse("BALLOT_GAS_BUFFER_MULTIPLIER")? {
            cfg.gas_buffer_multiplier = v;
        }
        if let Some(v) = env_parse("BALLOT_DEFAULT_GAS_LIMIT")? {
            cfg.default_gas_limit = v;
        }
        if let Some(v) = env_parse("BALLOT_BATCH_SIZE")? {
            cfg.batch_size = v;
        }
        if let Some(v) = env_millis("BALLOT_EVENT_POLLING_INTERVAL_MS")? {
            cfg.event_polling_interval = v;
        }
        if let Some(v) = env_millis("BALLOT_CONFIRMATION_TIMEOUT_MS")? {
            cfg.confirmation_timeout = v;
        }
        if let Some(v) = env_parse("BALLOT_CONFIRMATIONS")? {
            cfg.confirmations = v;
        }
        if let Some(v) = env_parse("BALLOT_HISTORY_LIMIT")? {
            cfg.history_limit = v;
        }
        if let Some(v) = env_millis("BALLOT_PENDING_MAX_AGE_MS")? {
            cfg.pending_max_age = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would make the client misbehave.
    pub fn validate(&self) -> Result<()> {
        if !(self.gas_buffer_multiplier >= 1.0 && self.gas_buffer_multiplier.is_finite()) {
            anyhow::bail!(
                "gas_buffer_multiplier must be a finite value >= 1.0, got {}",
                self.gas_buffer_multiplier
            );
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.history_limit == 0 {
            anyhow::bail!("history_limit must be at least 1");
        }
        if self.confirmation_poll_interval.is_zero()
            || self.event_polling_interval.is_zero()
            || self.receipt_sweep_interval.is_zero()
        {
            anyhow::bail!("polling intervals must be non-zero");
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Estimated gas with the safety buffer applied, rounded up.
    pub fn buffered_gas(&self, estimate: u64) -> u64 {
        // Per-mille integer math keeps 1.2 from rounding up an extra unit.
        let per_mille = (self.gas_buffer_multiplier * 1000.0).round() as u128;
        let buffered = (estimate as u128 * per_mille).div_ceil(1000);
        u64::try_from(buffered).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay, Duration::from_millis(1000));
        assert_eq!(cfg.cache_ttl, Duration::from_millis(30_000));
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.event_polling_interval, Duration::from_millis(5000));
        assert_eq!(cfg.confirmation_timeout, Duration::from_secs(120));
        assert_eq!(cfg.history_limit, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn backoff_doubles() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.backoff(0), Duration::from_millis(1000));
        assert_eq!(cfg.backoff(1), Duration::from_millis(2000));
        assert_eq!(cfg.backoff(3), Duration::from_millis(8000));
    }

    #[test]
    fn gas_buffer_rounds_up() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.buffered_gas(100_000), 120_000);
        assert_eq!(cfg.buffered_gas(21_001), 25_202);
    }

    #[test]
    fn validate_rejects_shrinking_gas_buffer() {
        let cfg = ClientConfig {
            gas_buffer_multiplier: 0.5,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_history_and_zero_sweep() {
        let cfg = ClientConfig {
            history_limit: 0,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            receipt_sweep_interval: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
