//! Environment-driven configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use super::engine::{EngineOptions, DEFAULT_ROOM_PREFIX};
use super::error::ConfigError;

const DEFAULT_FLUSH_FREQUENCY_SECS: f64 = 2.0;
const DEFAULT_CHECK_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_STATUS_UPDATE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_ISLANDS_STATUS_UPDATE_INTERVAL_MS: u64 = 120_000;
const DEFAULT_P2P_MAX_ISLAND_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ArchipelagoConfig {
    pub join_distance: f64,
    pub leave_distance: f64,
    pub room_prefix: String,
    /// Target spacing between flushes.
    pub flush_period: Duration,
    /// A peer without a heartbeat for this long is removed.
    pub heartbeat_timeout: Duration,
    pub discovery_interval: Duration,
    pub islands_report_interval: Duration,
    pub p2p_max_island_size: usize,
    pub commit_hash: Option<String>,
    /// Prometheus listener; disabled when unset.
    pub metrics_addr: Option<SocketAddr>,
}

impl ArchipelagoConfig {
    /// Read configuration from process environment variables.
    ///
    /// `ARCHIPELAGO_JOIN_DISTANCE` and `ARCHIPELAGO_LEAVE_DISTANCE` are
    /// required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let join_distance: f64 = require(&get, "ARCHIPELAGO_JOIN_DISTANCE")?;
        let leave_distance: f64 = require(&get, "ARCHIPELAGO_LEAVE_DISTANCE")?;
        if !(join_distance.is_finite() && join_distance >= 0.0) {
            return Err(invalid("ARCHIPELAGO_JOIN_DISTANCE", join_distance));
        }
        if !(leave_distance.is_finite() && leave_distance >= 0.0) {
            return Err(invalid("ARCHIPELAGO_LEAVE_DISTANCE", leave_distance));
        }
        if leave_distance < join_distance {
            warn!(
                join_distance,
                leave_distance, "leave distance should exceed join distance to avoid flapping"
            );
        }

        let flush_secs: f64 = optional(&get, "ARCHIPELAGO_FLUSH_FREQUENCY")?.unwrap_or(DEFAULT_FLUSH_FREQUENCY_SECS);
        if !(flush_secs.is_finite() && flush_secs > 0.0) {
            return Err(invalid("ARCHIPELAGO_FLUSH_FREQUENCY", flush_secs));
        }

        let millis = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            let ms: u64 = optional(&get, key)?.unwrap_or(default);
            if ms == 0 {
                return Err(invalid(key, ms));
            }
            Ok(Duration::from_millis(ms))
        };

        Ok(ArchipelagoConfig {
            join_distance,
            leave_distance,
            room_prefix: get("ROOM_PREFIX").unwrap_or_else(|| DEFAULT_ROOM_PREFIX.to_string()),
            flush_period: Duration::from_secs_f64(flush_secs),
            heartbeat_timeout: millis("CHECK_HEARTBEAT_INTERVAL", DEFAULT_CHECK_HEARTBEAT_INTERVAL_MS)?,
            discovery_interval: millis("ARCHIPELAGO_STATUS_UPDATE_INTERVAL", DEFAULT_STATUS_UPDATE_INTERVAL_MS)?,
            islands_report_interval: millis(
                "ARCHIPELAGO_ISLANDS_STATUS_UPDATE_INTERVAL",
                DEFAULT_ISLANDS_STATUS_UPDATE_INTERVAL_MS,
            )?,
            p2p_max_island_size: optional(&get, "P2P_MAX_ISLAND_SIZE")?.unwrap_or(DEFAULT_P2P_MAX_ISLAND_SIZE),
            commit_hash: get("COMMIT_HASH"),
            metrics_addr: optional(&get, "ARCHIPELAGO_METRICS_ADDR")?,
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions::new(self.join_distance, self.leave_distance).with_room_prefix(self.room_prefix.clone())
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

fn optional<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| invalid(key, raw)),
    }
}

fn require<T, G>(get: &G, key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    optional(get, key)?.ok_or(ConfigError::Missing(key))
}
