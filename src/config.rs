use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

/// Which coordination store backs the pairing pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStoreKind {
    Redis,
    Memory,
}

impl FromStr for PairingStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(PairingStoreKind::Redis),
            "memory" => Ok(PairingStoreKind::Memory),
            other => anyhow::bail!("unknown pairing store '{}', expected redis or memory", other),
        }
    }
}

/// Pairing pool tuning.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long a waiting entry stays matchable.
    pub timeout: Duration,
    /// Lifetime of an immutable match record.
    pub match_record_ttl: Duration,
    /// Service time assumed per queued pair when estimating waits.
    pub per_pair_wait: Duration,
    /// Upper bound on a single coordination store round-trip.
    pub store_timeout: Duration,
    /// Lease held on a user while their join + match runs.
    pub lease_ttl: Duration,
    /// Attempts to acquire the user lease before reporting a conflict.
    pub lease_attempts: u32,
    /// Attempts for idempotent status reads.
    pub status_attempts: u32,
    /// Interval of the timed-out entry sweep.
    pub sweep_interval: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            match_record_ttl: Duration::from_secs(3600),
            per_pair_wait: Duration::from_secs(30),
            store_timeout: Duration::from_millis(2000),
            lease_ttl: Duration::from_secs(10),
            lease_attempts: 5,
            status_attempts: 3,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Connection hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Sessions idle longer than this are terminated.
    pub inactive_timeout: Duration,
    /// Interval of the inactivity sweep.
    pub check_interval: Duration,
    /// Terminated sessions stay queryable this long before removal.
    pub grace_period: Duration,
    /// Per-connection outbound queue depth; a full queue means the peer is unreachable.
    pub outbound_queue: usize,
    /// Depth of the hub command channel.
    pub command_queue: usize,
    /// Largest accepted websocket message.
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inactive_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            outbound_queue: 64,
            command_queue: 1024,
            max_message_bytes: 8192,
        }
    }
}

/// Session key lifetime.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub key_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_ttl: Duration::from_secs(48 * 3600),
            cleanup_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Compliance rule parameters.
#[derive(Debug, Clone)]
pub struct ComplianceConfig {
    /// Single transaction ceiling in minor currency units, inclusive.
    pub max_transaction_amount: u64,
    /// Amounts strictly between zero and this are flagged as anomalous.
    pub small_amount_floor: u64,
    pub blocked_merchant_categories: Vec<String>,
    pub pan_blacklist: Vec<String>,
    /// Violation count at which the frequency rule blocks.
    pub frequency_block_threshold: u32,
    /// Violation count at which the frequency rule warns.
    pub frequency_warn_threshold: u32,
    /// HIGH violations needed before a user is blocked.
    pub high_risk_block_after: u32,
    pub critical_block_duration: Duration,
    pub high_block_duration: Duration,
    /// Allowed UTC hour window `[start, end)` when the time rule is on.
    pub time_restriction: Option<(u32, u32)>,
    pub suspicious_sequence_enabled: bool,
    /// Command classes kept per session for sequence matching.
    pub history_len: usize,
    /// Depth of the audit record queue.
    pub audit_queue: usize,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            max_transaction_amount: 5_000_000,
            small_amount_floor: 100,
            blocked_merchant_categories: ["GAMBLING", "ADULT", "TOBACCO", "WEAPONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            pan_blacklist: ["4111111111111111", "5555555555554444", "0000000000000000"]
                .into_iter()
                .map(String::from)
                .collect(),
            frequency_block_threshold: 50,
            frequency_warn_threshold: 20,
            high_risk_block_after: 3,
            critical_block_duration: Duration::from_secs(24 * 3600),
            high_block_duration: Duration::from_secs(2 * 3600),
            time_restriction: None,
            suspicious_sequence_enabled: true,
            history_len: 8,
            audit_queue: 1024,
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// Address the relay listens on.
    pub bind_addr: SocketAddr,
    /// The URL of the Redis server.
    pub redis_url: String,
    pub pairing_store: PairingStoreKind,
    /// The audit master key. Every business payload is encrypted under it.
    pub audit_master_key: Zeroizing<Vec<u8>>,
    /// Include sanitized error detail in client-facing messages.
    pub detailed_errors: bool,
    pub pairing: PairingConfig,
    pub hub: HubConfig,
    pub keys: KeyConfig,
    pub compliance: ComplianceConfig,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let mut master_key_hex = env::var("AUDIT_MASTER_KEY")
            .context("AUDIT_MASTER_KEY must be set (generate with: openssl rand -hex 32)")?;

        let master_key_bytes = hex::decode(&master_key_hex)
            .context("AUDIT_MASTER_KEY must be valid hexadecimal")?;

        master_key_hex.zeroize();

        if master_key_bytes.len() != 32 {
            anyhow::bail!("AUDIT_MASTER_KEY must be exactly 32 bytes (64 hex characters)");
        }

        let pairing = PairingConfig {
            timeout: secs("PAIRING_TIMEOUT_SECS", 180)?,
            match_record_ttl: secs("MATCH_RECORD_TTL_SECS", 3600)?,
            store_timeout: Duration::from_millis(parse_or("STORE_TIMEOUT_MS", 2000u64)?),
            sweep_interval: secs("PAIRING_SWEEP_INTERVAL_SECS", 30)?,
            ..PairingConfig::default()
        };

        let hub = HubConfig {
            inactive_timeout: secs("SESSION_INACTIVE_TIMEOUT_SECS", 300)?,
            check_interval: secs("HUB_CHECK_INTERVAL_SECS", 60)?,
            grace_period: secs("SESSION_GRACE_SECS", 30)?,
            outbound_queue: parse_or("OUTBOUND_QUEUE", 64usize)?,
            max_message_bytes: parse_or("WS_MAX_MESSAGE_BYTES", 8192usize)?,
            ..HubConfig::default()
        };

        let keys = KeyConfig {
            key_ttl: Duration::from_secs(parse_or("SESSION_KEY_TTL_HOURS", 48u64)? * 3600),
            cleanup_interval: Duration::from_secs(
                parse_or("KEY_CLEANUP_INTERVAL_HOURS", 24u64)? * 3600,
            ),
        };

        let mut compliance = ComplianceConfig {
            max_transaction_amount: parse_or("MAX_TRANSACTION_AMOUNT_MINOR", 5_000_000u64)?,
            time_restriction: parse_hour_window(env::var("TIME_RESTRICTION_HOURS").ok())?,
            ..ComplianceConfig::default()
        };
        if let Ok(categories) = env::var("BLOCKED_MERCHANT_CATEGORIES") {
            compliance.blocked_merchant_categories = categories
                .split(',')
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
        }

        Ok(Self {
            bind_addr: env::var("BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
                .parse()
                .context("Invalid BIND_ADDR")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            pairing_store: env::var("PAIRING_STORE")
                .unwrap_or_else(|_| "redis".to_string())
                .parse()?,
            audit_master_key: Zeroizing::new(master_key_bytes),
            detailed_errors: parse_or("DETAILED_ERRORS", false)?,
            pairing,
            hub,
            keys,
            compliance,
        })
    }

    /// Builds a configuration with default tuning around an explicit audit key.
    ///
    /// Uses the in-memory pairing store.
    pub fn with_audit_key(key: [u8; 32]) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pairing_store: PairingStoreKind::Memory,
            audit_master_key: Zeroizing::new(key.to_vec()),
            detailed_errors: false,
            pairing: PairingConfig::default(),
            hub: HubConfig::default(),
            keys: KeyConfig::default(),
            compliance: ComplianceConfig::default(),
        }
    }
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_or(name, default)?))
}

/// Parses `start-end` UTC hours, e.g. `6-23`.
fn parse_hour_window(raw: Option<String>) -> Result<Option<(u32, u32)>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let (start, end) = raw
        .split_once('-')
        .context("TIME_RESTRICTION_HOURS must look like start-end")?;
    let start: u32 = start.trim().parse().context("Invalid TIME_RESTRICTION_HOURS start")?;
    let end: u32 = end.trim().parse().context("Invalid TIME_RESTRICTION_HOURS end")?;
    if start > 23 || end > 24 || start == end {
        anyhow::bail!("TIME_RESTRICTION_HOURS must be two distinct hours within 0-24");
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_window_parses_and_rejects_nonsense() {
        assert_eq!(parse_hour_window(None).unwrap(), None);
        assert_eq!(parse_hour_window(Some("6-23".into())).unwrap(), Some((6, 23)));
        assert!(parse_hour_window(Some("5".into())).is_err());
        assert!(parse_hour_window(Some("7-7".into())).is_err());
    }

    #[test]
    fn store_kind_is_case_insensitive() {
        assert_eq!("Memory".parse::<PairingStoreKind>().unwrap(), PairingStoreKind::Memory);
        assert!("postgres".parse::<PairingStoreKind>().is_err());
    }
}
